//! One-shot capture completion.
//!
//! `start_capture` returns a [`CaptureHandle`] once the device is armed. The
//! capture task holds the matching [`CaptureTicket`] and resolves it exactly
//! once: explicitly with [`CaptureTicket::complete`] / [`CaptureTicket::fail`],
//! or implicitly when the ticket is dropped (task aborted, panic unwinding,
//! early return), which reports a failure. The session travels with the
//! ticket and is handed back inside the [`CaptureCompletion`].
//!
//! # Example
//!
//! ```rust,ignore
//! let handle = driver.start_capture(session).await.map_err(|r| r.error)?;
//! let completion = handle.wait().await?;
//! if completion.success {
//!     for channel in &completion.session.capture_channels {
//!         println!("{}: {:?}", channel.display_name(), channel.samples);
//!     }
//! }
//! ```

use crate::capture::CaptureSession;
use crate::error::CaptureError;
use crate::state::{DriverEvent, DriverState};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;

/// Final outcome of an armed capture.
#[derive(Debug, Clone)]
pub struct CaptureCompletion {
    pub capture_id: u64,
    pub success: bool,
    /// Why the capture failed; `None` on success.
    pub error: Option<CaptureError>,
    /// The session handed to `start_capture`, samples filled on success.
    pub session: CaptureSession,
}

/// A capture request that was refused before arming.
///
/// The session comes back unchanged so the caller can retry it.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct CaptureRejection {
    pub error: CaptureError,
    pub session: CaptureSession,
}

impl CaptureRejection {
    pub fn new(error: CaptureError, session: CaptureSession) -> Self {
        Self { error, session }
    }
}

/// Producer side of a capture completion, owned by the capture task.
#[derive(Debug)]
pub struct CaptureTicket {
    state: Arc<DriverState>,
    capture_id: u64,
    session: CaptureSession,
    tx: Option<oneshot::Sender<CaptureCompletion>>,
}

impl CaptureTicket {
    pub(crate) fn new(
        state: Arc<DriverState>,
        capture_id: u64,
        session: CaptureSession,
    ) -> (Self, CaptureHandle) {
        let (tx, rx) = oneshot::channel();
        let ticket = Self {
            state,
            capture_id,
            session,
            tx: Some(tx),
        };
        (ticket, CaptureHandle { capture_id, rx })
    }

    pub fn capture_id(&self) -> u64 {
        self.capture_id
    }

    pub fn session(&self) -> &CaptureSession {
        &self.session
    }

    /// Mutable access for the capture task to fill samples.
    pub fn session_mut(&mut self) -> &mut CaptureSession {
        &mut self.session
    }

    /// Report success.
    pub fn complete(mut self) {
        self.finish(None);
    }

    /// Report failure.
    pub fn fail(mut self, error: CaptureError) {
        self.finish(Some(error));
    }

    /// Give up before the device was armed.
    ///
    /// No completion is sent; the capture flag is released and the session is
    /// returned inside the rejection.
    pub fn reject(mut self, error: CaptureError) -> CaptureRejection {
        self.tx.take();
        self.state.end_capture(self.capture_id);
        let session = std::mem::take(&mut self.session);
        CaptureRejection::new(error, session)
    }

    fn finish(&mut self, error: Option<CaptureError>) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        let success = error.is_none();
        // Clear the busy flag before anyone can observe the completion.
        self.state.end_capture(self.capture_id);
        self.state.emit(DriverEvent::CaptureCompleted {
            capture_id: self.capture_id,
            success,
        });

        match &error {
            None => tracing::debug!(capture_id = self.capture_id, "capture completed"),
            Some(err) => tracing::warn!(
                capture_id = self.capture_id,
                error = %err,
                kind = err.label(),
                "capture failed"
            ),
        }

        let completion = CaptureCompletion {
            capture_id: self.capture_id,
            success,
            error,
            session: std::mem::take(&mut self.session),
        };
        if tx.send(completion).is_err() {
            tracing::debug!(capture_id = self.capture_id, "completion receiver dropped");
        }
    }
}

impl Drop for CaptureTicket {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.finish(Some(CaptureError::UnexpectedError(
                "capture was cancelled before completing".to_string(),
            )));
        }
    }
}

/// Consumer side of a capture completion.
#[derive(Debug)]
pub struct CaptureHandle {
    capture_id: u64,
    rx: oneshot::Receiver<CaptureCompletion>,
}

impl CaptureHandle {
    pub fn capture_id(&self) -> u64 {
        self.capture_id
    }

    /// Wait for the capture to finish.
    ///
    /// Only errors if the producer vanished without a ticket, which the ticket's
    /// `Drop` rules out in practice.
    pub async fn wait(self) -> Result<CaptureCompletion, CaptureError> {
        self.rx.await.map_err(|_| {
            CaptureError::UnexpectedError("capture completion channel closed".to_string())
        })
    }

    /// Non-blocking check, `None` while the capture is still running.
    pub fn try_result(&mut self) -> Option<Result<CaptureCompletion, CaptureError>> {
        match self.rx.try_recv() {
            Ok(completion) => Some(Ok(completion)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(
                CaptureError::UnexpectedError("capture completion channel closed".to_string()),
            )),
        }
    }

    /// Deliver the completion to a callback on a background task.
    pub fn on_complete<F>(self, callback: F) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce(Result<CaptureCompletion, CaptureError>) + Send + 'static,
    {
        tokio::spawn(async move { callback(self.wait().await) })
    }
}
