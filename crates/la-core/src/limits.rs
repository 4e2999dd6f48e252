//! Shared timeouts and size limits for driver transports.
//!
//! Keeping these in one place keeps every transport consistent.

use std::time::Duration;

// =============================================================================
// Timeout Constants
// =============================================================================

/// Round-trip timeout for one vendor JSON-API command (10 seconds).
///
/// The socket stays open after a timeout so the next command can reuse it.
pub const JSON_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between capture-progress polls (100 ms).
///
/// Polling has no overall deadline; it ends when the device reports a final
/// status or the caller stops/disconnects.
pub const CAPTURE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Timeout for opening a TCP connection to a device (5 seconds).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for a single request/response exchange during negotiation (2 seconds).
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Window for draining stale bytes after an abort (200 ms).
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Simulated acquisition time of the emulated analyzer (20 ms).
pub const EMULATED_CAPTURE_DELAY: Duration = Duration::from_millis(20);

// =============================================================================
// Size Limits
// =============================================================================

/// Longest text line accepted from a device (64 KiB).
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Largest binary block accepted in one capture (256 MiB).
pub const MAX_CAPTURE_BYTES: usize = 256 * 1024 * 1024;

/// Serial baud rate of the binary-protocol analyzer.
pub const ANALYZER_BAUD_RATE: u32 = 115_200;
