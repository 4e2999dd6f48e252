//! Shared driver state.
//!
//! Every driver composes one [`DriverState`] instead of inheriting behavior
//! from a base type. It owns the connection/capture flags, the device identity
//! learned during `connect`, the current capability snapshot, the event
//! broadcaster and the abort handle of the in-flight capture task.
//!
//! Capture ids make stale completions harmless: `disconnect` clears the current
//! id, so a task that finishes afterwards still delivers its completion to the
//! caller but no longer touches the driver's flags.

use crate::capabilities::DeviceCapabilities;
use crate::capture::CaptureSession;
use crate::completion::{CaptureHandle, CaptureRejection, CaptureTicket};
use crate::error::CaptureError;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;

/// Capacity of the per-driver event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle notifications published by a driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DriverEvent {
    Connected { device_name: String },
    Disconnected,
    CaptureStarted { capture_id: u64 },
    CaptureCompleted { capture_id: u64, success: bool },
}

/// Connection/capture state shared between a driver and its capture tasks.
#[derive(Debug)]
pub struct DriverState {
    connected: AtomicBool,
    capturing: AtomicBool,
    current_capture: AtomicU64,
    next_capture: AtomicU64,
    device_name: RwLock<Option<String>>,
    device_version: RwLock<Option<String>>,
    capabilities: RwLock<Option<Arc<DeviceCapabilities>>>,
    capture_task: Mutex<Option<AbortHandle>>,
    events: broadcast::Sender<DriverEvent>,
}

impl DriverState {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            connected: AtomicBool::new(false),
            capturing: AtomicBool::new(false),
            current_capture: AtomicU64::new(0),
            next_capture: AtomicU64::new(1),
            device_name: RwLock::new(None),
            device_version: RwLock::new(None),
            capabilities: RwLock::new(None),
            capture_task: Mutex::new(None),
            events,
        })
    }

    // =========================================================================
    // Connection
    // =========================================================================

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    /// Record a successful connection and its negotiated identity.
    pub fn mark_connected(
        &self,
        device_name: impl Into<String>,
        device_version: Option<String>,
        capabilities: DeviceCapabilities,
    ) {
        let device_name = device_name.into();
        *self.device_name.write() = Some(device_name.clone());
        *self.device_version.write() = device_version;
        self.replace_capabilities(capabilities);
        self.connected.store(true, Ordering::SeqCst);
        self.emit(DriverEvent::Connected { device_name });
    }

    /// Forget the device identity and any in-flight capture.
    ///
    /// Aborting the capture task drops its ticket, which delivers a failed
    /// completion to whoever is waiting on it.
    pub fn mark_disconnected(&self) {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        self.abort_capture_task();
        self.current_capture.store(0, Ordering::SeqCst);
        self.capturing.store(false, Ordering::SeqCst);
        *self.device_name.write() = None;
        *self.device_version.write() = None;
        *self.capabilities.write() = None;
        if was_connected {
            self.emit(DriverEvent::Disconnected);
        }
    }

    pub fn device_name(&self) -> Option<String> {
        self.device_name.read().clone()
    }

    pub fn device_version(&self) -> Option<String> {
        self.device_version.read().clone()
    }

    // =========================================================================
    // Capabilities
    // =========================================================================

    pub fn capabilities(&self) -> Option<Arc<DeviceCapabilities>> {
        self.capabilities.read().clone()
    }

    /// Swap in a complete new capability snapshot.
    pub fn replace_capabilities(&self, capabilities: DeviceCapabilities) {
        *self.capabilities.write() = Some(Arc::new(capabilities));
    }

    /// Read one field of the current snapshot, or a default when disconnected.
    pub fn capability<T>(&self, default: T, f: impl FnOnce(&DeviceCapabilities) -> T) -> T {
        self.capabilities.read().as_deref().map(f).unwrap_or(default)
    }

    // =========================================================================
    // Capture
    // =========================================================================

    /// Claim the driver for a capture.
    ///
    /// Returns `Busy` if a capture is running and `HardwareError` if the driver
    /// is not connected; in both cases the session is handed back untouched.
    pub fn begin_capture(
        self: &Arc<Self>,
        session: CaptureSession,
    ) -> Result<(CaptureTicket, CaptureHandle), CaptureRejection> {
        if self.is_capturing() {
            return Err(CaptureRejection::new(CaptureError::Busy, session));
        }
        if !self.is_connected() {
            return Err(CaptureRejection::new(CaptureError::not_connected(), session));
        }
        if self
            .capturing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CaptureRejection::new(CaptureError::Busy, session));
        }

        let capture_id = self.next_capture.fetch_add(1, Ordering::SeqCst);
        self.current_capture.store(capture_id, Ordering::SeqCst);
        self.emit(DriverEvent::CaptureStarted { capture_id });
        tracing::debug!(capture_id, "capture claimed");

        Ok(CaptureTicket::new(self.clone(), capture_id, session))
    }

    /// Release the capture flag if `capture_id` is still the active capture.
    ///
    /// Returns false for stale ids (the driver was disconnected meanwhile).
    pub(crate) fn end_capture(&self, capture_id: u64) -> bool {
        let current = self.current_capture.compare_exchange(
            capture_id,
            0,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if current.is_err() {
            tracing::debug!(capture_id, "ignoring completion of a torn-down capture");
            return false;
        }
        self.capture_task.lock().take();
        self.capturing.store(false, Ordering::SeqCst);
        true
    }

    /// Remember the task driving capture `capture_id` so it can be aborted.
    pub fn attach_capture_task(&self, capture_id: u64, task: AbortHandle) {
        if self.current_capture.load(Ordering::SeqCst) == capture_id {
            *self.capture_task.lock() = Some(task);
        } else {
            task.abort();
        }
    }

    /// Abort the in-flight capture task, if one is attached.
    pub fn abort_capture_task(&self) -> bool {
        match self.capture_task.lock().take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Events
    // =========================================================================

    pub fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: DriverEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{Connectivity, TriggerCapabilities};
    use crate::capture::CaptureMode;

    fn caps() -> DeviceCapabilities {
        DeviceCapabilities {
            channel_count: 8,
            min_frequency: 1,
            max_frequency: 100,
            blast_frequency: 200,
            buffer_size: 1000,
            capture_modes: vec![CaptureMode::Channels8],
            triggers: TriggerCapabilities::default(),
            connectivity: Connectivity::default(),
        }
    }

    fn session() -> CaptureSession {
        CaptureSession::new(100, 2, 2).with_channels([0])
    }

    #[test]
    fn test_begin_capture_requires_connection() {
        let state = DriverState::new();
        let rejection = state.begin_capture(session()).unwrap_err();
        assert!(matches!(rejection.error, CaptureError::HardwareError(_)));
        assert_eq!(rejection.session.channel_numbers(), vec![0]);
        assert!(!state.is_capturing());
    }

    #[tokio::test]
    async fn test_begin_capture_busy() {
        let state = DriverState::new();
        state.mark_connected("test", None, caps());

        let (ticket, handle) = state.begin_capture(session()).unwrap();
        assert!(state.is_capturing());

        let rejection = state.begin_capture(session()).unwrap_err();
        assert_eq!(rejection.error, CaptureError::Busy);

        ticket.complete();
        let completion = handle.wait().await.unwrap();
        assert!(completion.success);
        assert!(!state.is_capturing());
    }

    #[tokio::test]
    async fn test_disconnect_makes_completion_stale() {
        let state = DriverState::new();
        state.mark_connected("test", Some("V6_5".into()), caps());

        let (ticket, handle) = state.begin_capture(session()).unwrap();
        state.mark_disconnected();
        assert!(!state.is_capturing());
        assert!(state.device_version().is_none());

        state.mark_connected("test", None, caps());
        let (second, _second_handle) = state.begin_capture(session()).unwrap();

        // The stale ticket still reports to its caller but leaves the new capture alone.
        ticket.complete();
        assert!(handle.wait().await.unwrap().success);
        assert!(state.is_capturing());
        drop(second);
        assert!(!state.is_capturing());
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let state = DriverState::new();
        let mut events = state.subscribe();
        state.mark_connected("board", None, caps());
        let (ticket, _handle) = state.begin_capture(session()).unwrap();
        let id = ticket.capture_id();
        ticket.fail(CaptureError::HardwareError("boom".into()));

        assert_eq!(
            events.recv().await.unwrap(),
            DriverEvent::Connected {
                device_name: "board".into()
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            DriverEvent::CaptureStarted { capture_id: id }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            DriverEvent::CaptureCompleted {
                capture_id: id,
                success: false
            }
        );
    }
}
