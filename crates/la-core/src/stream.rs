//! Async byte-stream plumbing shared by the transports.
//!
//! Serial ports, TCP sockets and in-memory test pipes are all handled through
//! the same [`DeviceIo`] alias, so the protocol code never knows which one it
//! is talking to.
//!
//! # Example
//!
//! ```rust,ignore
//! use la_core::stream::{open_serial_async, DynStream, LineReader};
//!
//! let port: DynStream = Box::new(open_serial_async("/dev/ttyACM0", 115_200, "analyzer").await?);
//! let (read, writer) = tokio::io::split(port);
//! let mut reader = LineReader::new(read);
//! let discarded = reader.drain(DRAIN_TIMEOUT).await;
//! ```

use anyhow::Context;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader};

/// Anything that reads and writes bytes asynchronously.
///
/// Covers `tokio_serial::SerialStream`, `tokio::net::TcpStream` and
/// `tokio::io::DuplexStream`.
pub trait DeviceIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DeviceIo for T {}

/// Type-erased device stream.
pub type DynStream = Box<dyn DeviceIo>;

/// Open a serial port on a blocking thread, 8N1 without flow control.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> anyhow::Result<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;

    let port_path = port_path.to_string();
    let device_name = device_name.to_string();

    tokio::task::spawn_blocking(move || {
        tokio_serial::new(&port_path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| format!("Failed to open {} serial port: {}", device_name, port_path))
    })
    .await
    .context("spawn_blocking for serial port opening failed")?
}

/// Read and discard whatever arrives within `window`.
///
/// Returns the number of bytes thrown away. Stops early at EOF or on error.
pub async fn drain_input<R: AsyncRead + Unpin>(reader: &mut R, window: Duration) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + window;
    let mut total = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, reader.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total += n,
            Ok(Err(_)) | Err(_) => break,
        }
    }

    if total > 0 {
        tracing::debug!(bytes = total, "discarded stale input");
    }
    total
}

/// Buffered reader whose line reads survive cancellation.
///
/// Bytes of an unfinished line live in the reader, not in the read future,
/// so a read dropped by `tokio::time::timeout` loses nothing. After such a
/// timeout, [`LineReader::discard_stale`] drops the abandoned reply, including
/// the part of that line which has not arrived yet.
pub struct LineReader<R> {
    inner: BufReader<R>,
    partial: Vec<u8>,
    skip_line: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            partial: Vec::new(),
            skip_line: false,
        }
    }

    /// The underlying stream, for writes.
    pub fn get_mut(&mut self) -> &mut R {
        self.inner.get_mut()
    }

    /// Buffered access for binary payloads that follow a reply line.
    pub fn buffered(&mut self) -> &mut BufReader<R> {
        &mut self.inner
    }

    /// Read one `\n`-terminated line, trimmed of `\r\n`, bounded by `max_len`.
    ///
    /// Cancel safe. EOF before any byte is an error so callers never spin on
    /// a closed stream.
    pub async fn read_line(&mut self, max_len: usize) -> anyhow::Result<String> {
        loop {
            let available = self.inner.fill_buf().await.context("read from device failed")?;
            if available.is_empty() {
                if self.partial.is_empty() || self.skip_line {
                    self.partial.clear();
                    self.skip_line = false;
                    anyhow::bail!("device closed the connection");
                }
                break;
            }
            let (chunk, complete) = match available.iter().position(|b| *b == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (available.len(), false),
            };
            if self.skip_line {
                self.inner.consume(chunk);
                self.skip_line = !complete;
                continue;
            }
            let body = if complete { chunk - 1 } else { chunk };
            self.partial.extend_from_slice(&available[..body]);
            self.inner.consume(chunk);

            if self.partial.len() > max_len {
                self.partial.clear();
                self.skip_line = !complete;
                anyhow::bail!("device line exceeds {} bytes", max_len);
            }
            if complete {
                break;
            }
        }
        let mut line = std::mem::take(&mut self.partial);
        while matches!(line.last(), Some(b'\r')) {
            line.pop();
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// [`Self::read_line`] with a timeout.
    pub async fn read_line_timeout(
        &mut self,
        max_len: usize,
        timeout: Duration,
    ) -> anyhow::Result<String> {
        tokio::time::timeout(timeout, self.read_line(max_len))
            .await
            .with_context(|| format!("timed out after {:?} waiting for device", timeout))?
    }

    /// Read lines until one is non-empty.
    pub async fn read_nonempty_line(&mut self, max_len: usize) -> anyhow::Result<String> {
        loop {
            let line = self.read_line(max_len).await?;
            if !line.trim().is_empty() {
                return Ok(line);
            }
        }
    }

    /// Drop buffered input left from an abandoned reply.
    ///
    /// An unfinished line is skipped up to its newline even when the rest of
    /// it arrives later. Returns the number of bytes dropped now.
    pub fn discard_stale(&mut self) -> usize {
        let buffered = self.inner.buffer();
        let stale = buffered.len();
        let line_ends = buffered.contains(&b'\n');
        let dropped = stale + self.partial.len();
        if self.skip_line || !self.partial.is_empty() {
            self.skip_line = !line_ends;
        }
        self.partial.clear();
        self.inner.consume(stale);
        if dropped > 0 {
            tracing::debug!(bytes = dropped, pending = self.skip_line, "discarded stale input");
        }
        dropped
    }

    /// Forget any partial line, then [`drain_input`] for `window`.
    pub async fn drain(&mut self, window: Duration) -> usize {
        let partial = self.partial.len();
        self.partial.clear();
        self.skip_line = false;
        partial + drain_input(&mut self.inner, window).await
    }
}
