//! Sigrok adapter: drives `sigrok-cli` as a subprocess.
//!
//! Nothing here talks to hardware directly. `connect` checks the CLI version
//! and scans for the requested driver; a capture spawns one `sigrok-cli`
//! process that writes packed binary samples to stdout. The child is spawned
//! with `kill_on_drop`, so aborting the capture task kills it.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use la_core::capabilities::{Connectivity, DeviceCapabilities, TriggerCapabilities};
use la_core::capture::{CaptureLimits, CaptureSession, TriggerType};
use la_core::completion::{CaptureHandle, CaptureRejection};
use la_core::driver::{AnalyzerDriver, ConnectionParams, ConnectionResult, DriverType};
use la_core::error::{require_connection_string, CaptureError, ConnectError, DriverConstructionError};
use la_core::limits::MAX_CAPTURE_BYTES;
use la_core::state::DriverState;
use la_core::version::{DeviceVersion, VersionValidator};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::instrument;

/// Binary looked up on `PATH` when no explicit path is configured.
pub const DEFAULT_BINARY: &str = "sigrok-cli";

/// Oldest `sigrok-cli` release with the options used here.
pub const MINIMUM_CLI_VERSION: (u32, u32) = (0, 5);

/// Connection-string prefix that routes to this adapter.
pub const CONNECTION_PREFIX: &str = "sigrok:";

/// Bytes of sigrok's stderr kept for error messages.
const DIAGNOSTICS_KEEP: usize = 4096;

// =============================================================================
// Catalogue
// =============================================================================

/// A hardware family supported through sigrok.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigrokDevice {
    /// sigrok driver id, as passed to `--driver`.
    pub id: &'static str,
    pub name: &'static str,
    pub channels: u32,
    pub max_frequency: u64,
    /// Sample depth in samples.
    pub buffer_size: u32,
}

const fn device(
    id: &'static str,
    name: &'static str,
    channels: u32,
    max_frequency: u64,
    buffer_size: u32,
) -> SigrokDevice {
    SigrokDevice {
        id,
        name,
        channels,
        max_frequency,
        buffer_size,
    }
}

/// Hardware ids this adapter knows how to drive.
pub const SUPPORTED_DEVICES: &[SigrokDevice] = &[
    device("fx2lafw", "FX2-based logic analyzer", 16, 24_000_000, 67_108_864),
    device("saleae-logic16", "Saleae Logic16", 16, 100_000_000, 67_108_864),
    device("dreamsourcelab-dslogic", "DreamSourceLab DSLogic", 16, 400_000_000, 268_435_456),
    device("hantek-4032l", "Hantek 4032L", 32, 400_000_000, 67_108_864),
    device("kingst-la2016", "Kingst LA2016", 16, 200_000_000, 134_217_728),
    device("asix-sigma", "ASIX SIGMA", 16, 200_000_000, 16_777_216),
    device("ols", "Openbench Logic Sniffer", 32, 200_000_000, 24_576),
    device("zeroplus-logic-cube", "ZEROPLUS Logic Cube", 32, 200_000_000, 131_072),
    device("demo", "sigrok demo device", 8, 100_000_000, 10_000_000),
];

pub fn lookup_device(id: &str) -> Option<&'static SigrokDevice> {
    SUPPORTED_DEVICES.iter().find(|d| d.id.eq_ignore_ascii_case(id))
}

/// Capabilities of a catalogue entry, without a device attached.
pub fn capabilities_for(id: &str) -> Option<DeviceCapabilities> {
    lookup_device(id).map(|d| catalogue_capabilities(d, d.channels))
}

fn catalogue_capabilities(device: &SigrokDevice, channels: u32) -> DeviceCapabilities {
    DeviceCapabilities {
        channel_count: channels,
        min_frequency: DeviceCapabilities::derive_min_frequency(device.max_frequency),
        max_frequency: device.max_frequency,
        blast_frequency: device.max_frequency,
        buffer_size: device.buffer_size,
        capture_modes: DeviceCapabilities::modes_for_channel_count(channels),
        triggers: TriggerCapabilities {
            types: vec![
                TriggerType::Edge,
                TriggerType::Complex,
                TriggerType::Fast,
                TriggerType::None,
            ],
            max_pattern_width: 16,
            sequential: false,
        },
        connectivity: Connectivity::new(&["usb"], &["sigrok"]),
    }
}

// =============================================================================
// Connection String
// =============================================================================

/// `sigrok:<driver>[:conn=<spec>]`, with the prefix optional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigrokTarget {
    pub driver: String,
    pub conn: Option<String>,
}

impl SigrokTarget {
    pub fn parse(input: &str) -> Result<Self, DriverConstructionError> {
        let input = require_connection_string(input)?;
        let body = input.strip_prefix(CONNECTION_PREFIX).unwrap_or(input);
        let mut parts = body.split(':');
        let driver = parts.next().map(str::trim).unwrap_or_default();
        if driver.is_empty() {
            return Err(DriverConstructionError::malformed(input, "missing sigrok driver id"));
        }
        if lookup_device(driver).is_none() {
            return Err(DriverConstructionError::malformed(
                input,
                format!("'{}' is not a supported sigrok driver", driver),
            ));
        }

        let mut conn = None;
        for option in parts {
            match option.split_once('=') {
                Some(("conn", value)) if !value.is_empty() => conn = Some(value.to_string()),
                _ => {
                    return Err(DriverConstructionError::malformed(
                        input,
                        format!("unsupported option '{}'", option),
                    ))
                }
            }
        }
        Ok(Self {
            driver: driver.to_ascii_lowercase(),
            conn,
        })
    }

    /// Value for `--driver`.
    pub fn driver_arg(&self) -> String {
        match &self.conn {
            Some(conn) => format!("{}:conn={}", self.driver, conn),
            None => self.driver.clone(),
        }
    }

    pub fn connection_string(&self) -> String {
        format!("{}{}", CONNECTION_PREFIX, self.driver_arg())
    }
}

// =============================================================================
// CLI Helpers
// =============================================================================

/// Whether `binary` resolves to a file, either directly or through `PATH`.
pub fn binary_available(binary: &Path) -> bool {
    if binary.components().count() > 1 {
        return binary.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(binary).is_file()))
        .unwrap_or(false)
}

async fn run_cli(binary: &Path, args: &[String], timeout: Duration) -> Result<Output> {
    let child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to start {}", binary.display()))?;
    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .with_context(|| format!("{} did not finish within {:?}", binary.display(), timeout))??;
    if !output.status.success() {
        bail!(
            "{} exited with {}: {}",
            binary.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output)
}

/// Read `reader` to EOF unless it yields more than `limit` bytes.
///
/// Returns `None` as soon as the limit is crossed, without buffering the rest.
async fn read_bounded<R: AsyncRead + Unpin>(
    reader: R,
    limit: usize,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut data = Vec::new();
    reader
        .take(limit as u64 + 1)
        .read_to_end(&mut data)
        .await?;
    Ok((data.len() <= limit).then_some(data))
}

/// Drain `reader`, keeping the first [`DIAGNOSTICS_KEEP`] bytes.
async fn read_diagnostics<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut kept = Vec::new();
    let mut chunk = [0u8; 1024];
    while let Ok(n) = reader.read(&mut chunk).await {
        if n == 0 {
            break;
        }
        let room = DIAGNOSTICS_KEEP.saturating_sub(kept.len());
        kept.extend_from_slice(&chunk[..n.min(room)]);
    }
    String::from_utf8_lossy(&kept).trim().to_string()
}

/// Collect a capture's stdout, killing the process if it outgrows the limit.
async fn collect_capture(mut child: Child) -> Result<Vec<u8>, CaptureError> {
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(CaptureError::unexpected("sigrok pipes were not captured"));
    };
    let diagnostics = tokio::spawn(read_diagnostics(stderr));

    let data = match read_bounded(stdout, MAX_CAPTURE_BYTES).await {
        Ok(Some(data)) => data,
        Ok(None) => {
            let _ = child.kill().await;
            diagnostics.abort();
            return Err(CaptureError::HardwareError(
                "sigrok output exceeds the capture size limit".into(),
            ));
        }
        Err(e) => {
            let _ = child.kill().await;
            diagnostics.abort();
            return Err(CaptureError::HardwareError(format!("sigrok stream error: {}", e)));
        }
    };

    let status = child
        .wait()
        .await
        .map_err(|e| CaptureError::HardwareError(format!("sigrok stream error: {}", e)))?;
    if !status.success() {
        let stderr = diagnostics.await.unwrap_or_default();
        return Err(CaptureError::HardwareError(format!(
            "sigrok exited with {}: {}",
            status, stderr
        )));
    }
    diagnostics.abort();
    Ok(data)
}

/// `<major>.<minor>` from the first dotted number in `sigrok-cli --version`.
pub fn parse_cli_version(output: &str) -> DeviceVersion {
    let numeric = output
        .split_whitespace()
        .find(|token| token.contains('.') && token.starts_with(|c: char| c.is_ascii_digit()));
    let short = numeric.map(|token| token.split('.').take(2).collect::<Vec<_>>().join("."));
    VersionValidator::parse(short.as_deref())
}

/// One device line of `sigrok-cli --scan`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDevice {
    /// Value usable as `--driver`, e.g. `fx2lafw:conn=1.5`.
    pub driver_arg: String,
    pub name: String,
    pub channels: Option<u32>,
}

impl ScannedDevice {
    pub fn connection_string(&self) -> String {
        format!("{}{}", CONNECTION_PREFIX, self.driver_arg)
    }
}

/// Parse `--scan` output; lines look like
/// `fx2lafw:conn=1.5 - Saleae Logic with 8 channels: D0 D1 ...`.
pub fn parse_scan_output(output: &str) -> Vec<ScannedDevice> {
    output
        .lines()
        .filter_map(|line| {
            let (driver_arg, rest) = line.split_once(" - ")?;
            let driver_arg = driver_arg.trim();
            if driver_arg.is_empty() || driver_arg.contains(' ') {
                return None;
            }
            let (name, channels) = match rest.split_once(" with ") {
                Some((name, tail)) => {
                    let count = tail
                        .split_whitespace()
                        .next()
                        .and_then(|n| n.parse::<u32>().ok());
                    (name.trim(), count)
                }
                None => (rest.trim(), None),
            };
            Some(ScannedDevice {
                driver_arg: driver_arg.to_string(),
                name: name.to_string(),
                channels,
            })
        })
        .collect()
}

/// List every device sigrok can see.
pub async fn scan_all(binary: &Path, timeout: Duration) -> Result<Vec<ScannedDevice>> {
    let output = run_cli(binary, &["--scan".to_string()], timeout).await?;
    Ok(parse_scan_output(&String::from_utf8_lossy(&output.stdout)))
}

// =============================================================================
// Capture Arguments & Decoding
// =============================================================================

/// Requested channels in the order sigrok packs them (ascending).
fn packed_order(session: &CaptureSession) -> Vec<u16> {
    let mut channels = session.channel_numbers();
    channels.sort_unstable();
    channels
}

/// Command line for one capture.
pub fn capture_args(target: &SigrokTarget, session: &CaptureSession) -> Vec<String> {
    let channels = packed_order(session)
        .iter()
        .map(|n| format!("D{}", n))
        .collect::<Vec<_>>()
        .join(",");
    let mut args = vec![
        "--driver".to_string(),
        target.driver_arg(),
        "--config".to_string(),
        format!("samplerate={}", session.frequency),
        "--samples".to_string(),
        session.total_samples().to_string(),
        "--channels".to_string(),
        channels,
    ];

    let triggers = trigger_spec(session);
    if !triggers.is_empty() {
        args.push("--triggers".to_string());
        args.push(triggers.join(","));
        args.push("--wait-trigger".to_string());
        let ratio = u64::from(session.pre_trigger_samples) * 100 / session.total_samples().max(1);
        args.push("--config".to_string());
        args.push(format!("captureratio={}", ratio));
    }
    args.push("-O".to_string());
    args.push("binary".to_string());
    args
}

fn trigger_spec(session: &CaptureSession) -> Vec<String> {
    let Some(channel) = session.trigger_channel else {
        return Vec::new();
    };
    match session.trigger_type {
        TriggerType::None => Vec::new(),
        TriggerType::Edge | TriggerType::Blast => {
            let edge = if session.trigger_inverted { 'f' } else { 'r' };
            vec![format!("D{}={}", channel, edge)]
        }
        TriggerType::Complex | TriggerType::Fast => (0..session.trigger_bit_count)
            .map(|bit| {
                let level = u8::from(session.trigger_pattern & (1 << bit) != 0);
                format!("D{}={}", channel + u16::from(bit), level)
            })
            .collect(),
    }
}

/// Unpack `-O binary` output into per-channel 0/1 samples.
///
/// Each sample is `ceil(channels / 8)` little-endian bytes; bit `k` belongs to
/// the `k`-th channel in ascending channel order.
pub fn unpack_samples(session: &mut CaptureSession, data: &[u8]) -> Result<()> {
    let order = packed_order(session);
    let stride = order.len().div_ceil(8).max(1);
    let total = usize::try_from(session.total_samples()).context("sample count overflow")?;
    let available = data.len() / stride;
    if available < total {
        bail!("sigrok returned {} of {} samples", available, total);
    }

    for channel in &mut session.capture_channels {
        let Some(bit) = order.iter().position(|n| *n == channel.channel_number) else {
            continue;
        };
        let (byte, mask) = (bit / 8, 1u8 << (bit % 8));
        let samples = data
            .chunks_exact(stride)
            .take(total)
            .map(|sample| u8::from(sample[byte] & mask != 0))
            .collect();
        channel.samples = Some(samples);
    }
    Ok(())
}

// =============================================================================
// Driver
// =============================================================================

/// Driver for any hardware sigrok supports.
pub struct SigrokDriver {
    target: SigrokTarget,
    binary: PathBuf,
    state: Arc<DriverState>,
}

impl SigrokDriver {
    pub fn new(connection: &str) -> Result<Self, DriverConstructionError> {
        Ok(Self {
            target: SigrokTarget::parse(connection)?,
            binary: PathBuf::from(DEFAULT_BINARY),
            state: DriverState::new(),
        })
    }

    /// Use a specific `sigrok-cli` executable.
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn target(&self) -> &SigrokTarget {
        &self.target
    }

    fn catalogue_entry(&self) -> Option<&'static SigrokDevice> {
        lookup_device(&self.target.driver)
    }
}

fn validate_sigrok_session(
    session: &CaptureSession,
    caps: &DeviceCapabilities,
) -> Result<(), CaptureError> {
    session.validate_structure()?;
    if session.loop_count > 0 || session.measure_bursts {
        return Err(CaptureError::BadParams(
            "sigrok captures do not support loops or burst measurement".into(),
        ));
    }
    if session.trigger_type == TriggerType::Blast {
        return Err(CaptureError::BadParams(
            "blast captures are not supported through sigrok".into(),
        ));
    }
    if let Some(bad) = session
        .channel_numbers()
        .into_iter()
        .find(|n| u32::from(*n) >= caps.channel_count)
    {
        return Err(CaptureError::BadParams(format!(
            "channel {} does not exist on a {}-channel device",
            bad, caps.channel_count
        )));
    }
    if session.frequency < caps.min_frequency || session.frequency > caps.max_frequency {
        return Err(CaptureError::BadParams(format!(
            "frequency {} Hz outside {}..={} Hz",
            session.frequency, caps.min_frequency, caps.max_frequency
        )));
    }
    if let (Some(first), TriggerType::Complex | TriggerType::Fast) =
        (session.trigger_channel, session.trigger_type)
    {
        let width = u32::from(session.trigger_bit_count);
        if width == 0 || width > 16 || u32::from(first) + width > caps.channel_count {
            return Err(CaptureError::BadParams(format!(
                "pattern of {} bits at channel {} does not fit the device",
                width, first
            )));
        }
    }
    CaptureLimits::unbounded(caps.buffer_size).check(session)
}

#[async_trait]
impl AnalyzerDriver for SigrokDriver {
    fn state(&self) -> &Arc<DriverState> {
        &self.state
    }

    fn driver_type(&self) -> DriverType {
        DriverType::Serial
    }

    fn is_network(&self) -> bool {
        false
    }

    fn limits(&self, _channels: &[u16]) -> CaptureLimits {
        CaptureLimits::unbounded(self.buffer_size())
    }

    #[instrument(skip(self, params), fields(driver = %self.target.driver))]
    async fn connect(&self, params: &ConnectionParams) -> Result<ConnectionResult, ConnectError> {
        if self.state.is_connected() {
            return Err(ConnectError::AlreadyConnected);
        }
        let Some(entry) = self.catalogue_entry() else {
            return Err(ConnectError::Connection(format!(
                "'{}' is not a supported sigrok driver",
                self.target.driver
            )));
        };

        let output = run_cli(&self.binary, &["--version".to_string()], params.timeout)
            .await
            .map_err(ConnectError::from_anyhow)?;
        let version = parse_cli_version(&String::from_utf8_lossy(&output.stdout));
        let minimum = DeviceVersion::new(MINIMUM_CLI_VERSION.0, MINIMUM_CLI_VERSION.1);
        if !VersionValidator::meets_minimum(&version, &minimum) {
            return Err(ConnectError::VersionMismatch {
                found: version,
                minimum,
            });
        }

        let scan_args = vec![
            "--driver".to_string(),
            self.target.driver_arg(),
            "--scan".to_string(),
        ];
        let output = run_cli(&self.binary, &scan_args, params.timeout)
            .await
            .map_err(ConnectError::from_anyhow)?;
        let scanned = parse_scan_output(&String::from_utf8_lossy(&output.stdout));
        let Some(found) = scanned.into_iter().next() else {
            return Err(ConnectError::Connection(format!(
                "sigrok found no '{}' device",
                self.target.driver
            )));
        };

        let channels = found.channels.unwrap_or(entry.channels);
        let capabilities = catalogue_capabilities(entry, channels);
        let version_text = format!("{}.{}", version.major, version.minor);
        self.state
            .mark_connected(&found.name, Some(version_text.clone()), capabilities.clone());
        tracing::info!(device = %found.name, channels, "sigrok device connected");

        Ok(ConnectionResult {
            device_name: found.name,
            device_version: Some(version_text),
            capabilities,
        })
    }

    async fn disconnect(&self) {
        if self.state.is_connected() {
            tracing::info!(driver = %self.target.driver, "sigrok device disconnected");
        }
        self.state.mark_disconnected();
    }

    #[instrument(skip_all, fields(driver = %self.target.driver))]
    async fn start_capture(
        &self,
        session: CaptureSession,
    ) -> Result<CaptureHandle, CaptureRejection> {
        let (ticket, handle) = self.state.begin_capture(session)?;
        let Some(caps) = self.state.capabilities() else {
            return Err(ticket.reject(CaptureError::not_connected()));
        };
        if let Err(e) = validate_sigrok_session(ticket.session(), &caps) {
            return Err(ticket.reject(e));
        }

        let args = capture_args(&self.target, ticket.session());
        tracing::debug!(args = ?args, "spawning sigrok capture");
        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                return Err(ticket.reject(CaptureError::unexpected(format!(
                    "failed to start {}: {}",
                    self.binary.display(),
                    e
                ))))
            }
        };

        let capture_id = ticket.capture_id();
        tracing::info!(capture_id, "sigrok capture started");
        let task = tokio::spawn(async move {
            let mut ticket = ticket;
            let data = match collect_capture(child).await {
                Ok(data) => data,
                Err(e) => {
                    ticket.fail(e);
                    return;
                }
            };
            match unpack_samples(ticket.session_mut(), &data) {
                Ok(()) => ticket.complete(),
                Err(e) => ticket.fail(CaptureError::HardwareError(format!("{:#}", e))),
            }
        });
        self.state.attach_capture_task(capture_id, task.abort_handle());
        Ok(handle)
    }

    async fn stop_capture(&self) -> bool {
        if self.state.is_capturing() {
            // Dropping the task's child kills the process.
            self.state.abort_capture_task();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalogue_lookup() {
        let caps = capabilities_for("fx2lafw").unwrap();
        assert_eq!(caps.channel_count, 16);
        assert_eq!(caps.max_frequency, 24_000_000);
        assert_eq!(caps.blast_frequency, caps.max_frequency);
        assert!(capabilities_for("DEMO").is_some());
        assert!(capabilities_for("not-a-driver").is_none());
    }

    #[test]
    fn test_target_parse() {
        let t = SigrokTarget::parse("sigrok:fx2lafw:conn=1.5").unwrap();
        assert_eq!(t.driver, "fx2lafw");
        assert_eq!(t.conn.as_deref(), Some("1.5"));
        assert_eq!(t.driver_arg(), "fx2lafw:conn=1.5");

        let t = SigrokTarget::parse("demo").unwrap();
        assert_eq!(t.connection_string(), "sigrok:demo");

        assert!(SigrokTarget::parse("").is_err());
        assert!(SigrokTarget::parse("sigrok:").is_err());
        assert!(SigrokTarget::parse("sigrok:unknown").is_err());
        assert!(SigrokTarget::parse("demo:speed=9").is_err());
    }

    #[test]
    fn test_parse_cli_version() {
        let v = parse_cli_version("sigrok-cli 0.7.2\n\nLibraries and features:\n");
        assert!(v.is_valid);
        assert_eq!((v.major, v.minor), (0, 7));
        assert!(!parse_cli_version("garbage").is_valid);
    }

    #[test]
    fn test_parse_scan_output() {
        let out = "The following devices were found:\n\
                   demo - Demo device with 12 channels: D0 D1 D2\n\
                   fx2lafw:conn=1.5 - Saleae Logic with 8 channels: D0 D1\n";
        let devices = parse_scan_output(out);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name, "Demo device");
        assert_eq!(devices[0].channels, Some(12));
        assert_eq!(devices[1].connection_string(), "sigrok:fx2lafw:conn=1.5");
    }

    #[test]
    fn test_capture_args() {
        let target = SigrokTarget::parse("demo").unwrap();
        let session = CaptureSession::new(1_000_000, 25, 75)
            .with_channels([3, 1])
            .with_edge_trigger(1, true);
        let args = capture_args(&target, &session);
        let joined = args.join(" ");
        assert!(joined.contains("--driver demo"));
        assert!(joined.contains("samplerate=1000000"));
        assert!(joined.contains("--samples 100"));
        assert!(joined.contains("--channels D1,D3"));
        assert!(joined.contains("--triggers D1=f --wait-trigger"));
        assert!(joined.contains("captureratio=25"));
        assert!(joined.ends_with("-O binary"));

        let free = session.without_trigger();
        assert!(!capture_args(&target, &free).contains(&"--triggers".to_string()));
    }

    #[test]
    fn test_unpack_samples() {
        let mut session = CaptureSession::new(1_000, 0, 4).with_channels([5, 2]);
        unpack_samples(&mut session, &[0b01, 0b10, 0b11, 0b00]).unwrap();
        // Channel 2 is bit 0, channel 5 is bit 1.
        assert_eq!(session.capture_channels[1].samples, Some(vec![1, 0, 1, 0]));
        assert_eq!(session.capture_channels[0].samples, Some(vec![0, 1, 1, 0]));

        let mut short = CaptureSession::new(1_000, 0, 8).with_channels([0]);
        assert!(unpack_samples(&mut short, &[1, 0]).is_err());
    }

    #[test]
    fn test_validate_rejects_loops() {
        let caps = capabilities_for("demo").unwrap();
        let session = CaptureSession::new(1_000_000, 0, 100)
            .with_channels([0])
            .with_bursts(2, false);
        assert!(matches!(
            validate_sigrok_session(&session, &caps),
            Err(CaptureError::BadParams(_))
        ));
    }

    #[cfg(unix)]
    fn fake_cli(dir: &tempfile::TempDir, capture_body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join("sigrok-cli");
        let script = format!(
            "#!/bin/sh\n\
             case \"$*\" in\n\
             *--version*) echo \"sigrok-cli 0.7.2\"; exit 0;;\n\
             *--scan*) echo \"demo - Demo device with 8 channels: D0 D1\"; exit 0;;\n\
             esac\n\
             {}\n",
            capture_body
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_capture_through_fake_cli() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_cli(&dir, "printf '\\001\\002\\003\\000'");
        let driver = SigrokDriver::new("sigrok:demo").unwrap().with_binary(&binary);

        let result = driver.connect(&ConnectionParams::default()).await.unwrap();
        assert_eq!(result.device_name, "Demo device");
        assert_eq!(result.device_version.as_deref(), Some("0.7"));

        let session = CaptureSession::new(1_000_000, 0, 4).with_channels([0, 1]);
        let handle = driver.start_capture(session).await.unwrap();
        let done = handle.wait().await.unwrap();
        assert!(done.success);
        assert_eq!(done.session.capture_channels[0].samples, Some(vec![1, 0, 1, 0]));
        assert_eq!(done.session.capture_channels[1].samples, Some(vec![0, 1, 1, 0]));
        assert!(!driver.is_capturing());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_failure_is_hardware_error() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_cli(&dir, "echo 'device vanished' >&2; exit 3");
        let driver = SigrokDriver::new("demo").unwrap().with_binary(&binary);
        driver.connect(&ConnectionParams::default()).await.unwrap();

        let session = CaptureSession::new(1_000_000, 0, 4).with_channels([0]);
        let handle = driver.start_capture(session).await.unwrap();
        let done = handle.wait().await.unwrap();
        assert!(!done.success);
        assert!(
            matches!(done.error, Some(CaptureError::HardwareError(ref m)) if m.contains("device vanished"))
        );
        assert!(!driver.is_capturing());
    }

    #[tokio::test]
    async fn test_missing_binary_fails_connect() {
        let driver = SigrokDriver::new("demo")
            .unwrap()
            .with_binary("/nonexistent/sigrok-cli");
        assert!(driver.connect(&ConnectionParams::default()).await.is_err());
        assert!(!driver.is_connected());
        assert!(!binary_available(Path::new("/nonexistent/sigrok-cli")));
    }

    #[tokio::test]
    async fn test_read_bounded_stops_at_limit() {
        let data = read_bounded(&b"\x01\x02\x03\x04"[..], 4).await.unwrap();
        assert_eq!(data, Some(vec![1, 2, 3, 4]));
        assert_eq!(read_bounded(&b"\x01\x02\x03\x04\x05"[..], 4).await.unwrap(), None);
        assert_eq!(read_bounded(&b""[..], 4).await.unwrap(), Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_diagnostics_are_truncated() {
        let noise = vec![b'e'; DIAGNOSTICS_KEEP * 3];
        let kept = read_diagnostics(&noise[..]).await;
        assert_eq!(kept.len(), DIAGNOSTICS_KEEP);
        assert_eq!(read_diagnostics(&b"  no device\n"[..]).await, "no device");
    }
}
