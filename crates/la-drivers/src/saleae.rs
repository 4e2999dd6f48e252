//! Vendor JSON-API analyzer (Saleae-style automation socket).
//!
//! Each request is one JSON document on one line; the reply is the next line
//! received. There is no correlation id, so the client serialises requests
//! behind a mutex. A request that is not answered within
//! [`JSON_COMMAND_TIMEOUT`] fails with [`JsonApiError::Timeout`] and the socket
//! stays open for the next request.
//!
//! Capabilities start from a static per-model table and are then overridden
//! field by field with whatever `get_device_capabilities` reports.

use crate::address::Endpoint;
use anyhow::Context;
use async_trait::async_trait;
use la_core::capabilities::{Connectivity, DeviceCapabilities, TriggerCapabilities};
use la_core::capture::{CaptureLimits, CaptureSession, TriggerType};
use la_core::completion::{CaptureHandle, CaptureRejection, CaptureTicket};
use la_core::driver::{AnalyzerDriver, ConnectionParams, ConnectionResult, DriverType};
use la_core::error::{require_connection_string, CaptureError, ConnectError, DriverConstructionError};
use la_core::limits::{CAPTURE_POLL_INTERVAL, JSON_COMMAND_TIMEOUT, MAX_CAPTURE_BYTES};
use la_core::state::DriverState;
use la_core::stream::{DynStream, LineReader};
use la_core::version::{DeviceVersion, VersionValidator};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::instrument;

/// Default automation endpoint.
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 10430;

/// Lowest automation API version this driver speaks.
pub const MINIMUM_API_VERSION: (u32, u32) = (1, 0);

/// Sample memory assumed for models that do not report one.
const DEFAULT_BUFFER_SAMPLES: u32 = 1_000_000_000;

// =============================================================================
// Errors
// =============================================================================

/// Failures of one JSON-API request.
#[derive(Error, Debug)]
pub enum JsonApiError {
    #[error("No response to '{command}' within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("Device rejected '{command}': {message}")]
    Rejected { command: String, message: String },

    #[error("Malformed response to '{command}': {reason}")]
    Malformed { command: String, reason: String },

    #[error("Transport error: {0:#}")]
    Transport(#[from] anyhow::Error),
}

// =============================================================================
// Static Capability Table
// =============================================================================

/// Static capability row for one device type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpec {
    pub channels: u32,
    pub max_frequency: u64,
    pub blast_frequency: u64,
}

const LOGIC_8: ModelSpec = ModelSpec {
    channels: 8,
    max_frequency: 100_000_000,
    blast_frequency: 500_000_000,
};

/// Look up a device type, case-insensitively; unknown types get Logic 8 numbers.
pub fn model_spec(device_type: &str) -> ModelSpec {
    match device_type.trim().to_ascii_lowercase().as_str() {
        "logic 4" => ModelSpec {
            channels: 4,
            max_frequency: 12_500_000,
            blast_frequency: 25_000_000,
        },
        "logic 8" => LOGIC_8,
        "logic 16" => ModelSpec {
            channels: 16,
            max_frequency: 100_000_000,
            blast_frequency: 500_000_000,
        },
        "logic pro 8" => ModelSpec {
            channels: 8,
            max_frequency: 500_000_000,
            blast_frequency: 1_000_000_000,
        },
        "logic pro 16" => ModelSpec {
            channels: 16,
            max_frequency: 500_000_000,
            blast_frequency: 1_000_000_000,
        },
        _ => LOGIC_8,
    }
}

/// Full capability snapshot for a device type from the static table.
pub fn table_capabilities(device_type: &str) -> DeviceCapabilities {
    let spec = model_spec(device_type);
    DeviceCapabilities {
        channel_count: spec.channels,
        min_frequency: DeviceCapabilities::derive_min_frequency(spec.max_frequency),
        max_frequency: spec.max_frequency,
        blast_frequency: spec.blast_frequency,
        buffer_size: DEFAULT_BUFFER_SAMPLES,
        capture_modes: DeviceCapabilities::modes_for_channel_count(spec.channels),
        triggers: TriggerCapabilities {
            types: vec![
                TriggerType::Edge,
                TriggerType::Complex,
                TriggerType::Fast,
                TriggerType::Blast,
                TriggerType::None,
            ],
            max_pattern_width: 16,
            sequential: false,
        },
        connectivity: Connectivity::new(&["usb"], &["json-api"]),
    }
}

/// Live capability report; every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LiveCapabilities {
    pub digital_channels: Option<u32>,
    #[serde(default)]
    pub sample_rates: Vec<u64>,
    pub memory_size: Option<u32>,
}

/// Override the table snapshot with whatever the device reported.
pub fn apply_live_capabilities(
    base: &DeviceCapabilities,
    live: &LiveCapabilities,
) -> DeviceCapabilities {
    let mut caps = base.clone();
    if let Some(channels) = live.digital_channels {
        caps.channel_count = channels;
        caps.capture_modes = DeviceCapabilities::modes_for_channel_count(channels);
    }
    if let Some(max) = live.sample_rates.iter().copied().max() {
        caps.max_frequency = max;
        caps.blast_frequency = max;
        caps.min_frequency = DeviceCapabilities::derive_min_frequency(max);
    }
    if let Some(memory) = live.memory_size {
        caps.buffer_size = memory;
    }
    caps
}

// =============================================================================
// Capture Documents
// =============================================================================

/// One point of a sparse digital time series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeSample {
    /// Seconds from the start of the capture.
    pub time: f64,
    pub value: bool,
}

const TIME_EPSILON: f64 = 1e-9;

/// Expand a sparse series to one 0/1 byte per sample at `rate` Hz.
///
/// Slot `i` holds the value of the last entry with `time <= i / rate` (0 before
/// the first entry). The output has `ceil(last_time * rate) + 1` slots, or none
/// for an empty series.
pub fn expand_time_series(series: &[TimeSample], rate: f64) -> Vec<u8> {
    if series.is_empty() || rate.is_nan() || rate <= 0.0 {
        return Vec::new();
    }
    let mut sorted = series.to_vec();
    sorted.sort_by(|a, b| a.time.total_cmp(&b.time));

    let last_slot = sorted
        .last()
        .map(|s| (s.time * rate - TIME_EPSILON).ceil().max(0.0))
        .unwrap_or(0.0);
    let len = (last_slot as usize).saturating_add(1).min(MAX_CAPTURE_BYTES);

    let mut samples = vec![0u8; len];
    let mut next = 0;
    let mut current = 0u8;
    for (i, slot) in samples.iter_mut().enumerate() {
        while next < sorted.len() && sorted[next].time * rate <= i as f64 + TIME_EPSILON {
            current = u8::from(sorted[next].value);
            next += 1;
        }
        *slot = current;
    }
    samples
}

/// Settings document sent with `start_capture`.
pub fn capture_settings(session: &CaptureSession) -> Value {
    let looping = session.measure_bursts || session.loop_count > 0;
    let triggers = trigger_list(session);
    let trigger_mode = if triggers.is_empty() { "ALWAYS" } else { "TRIGGERED" };
    json!({
        "digital_channels": session.channel_numbers(),
        "digital_sample_rate": session.frequency,
        "capture_mode": if looping { "LOOPING" } else { "NORMAL" },
        "loop_count": session.loop_count,
        "trigger": {
            "mode": trigger_mode,
            "triggers": triggers,
        },
        "pre_trigger_samples": session.pre_trigger_samples,
        "post_trigger_samples": session.post_trigger_samples,
    })
}

fn trigger_list(session: &CaptureSession) -> Vec<Value> {
    let Some(channel) = session.trigger_channel else {
        return Vec::new();
    };
    match session.trigger_type {
        TriggerType::None => Vec::new(),
        TriggerType::Edge | TriggerType::Blast => {
            let edge = if session.trigger_inverted {
                "FALLING_EDGE"
            } else {
                "RISING_EDGE"
            };
            vec![json!({ "channel": channel, "type": edge })]
        }
        TriggerType::Complex | TriggerType::Fast => {
            let pattern: Vec<Value> = (0..session.trigger_bit_count)
                .map(|bit| {
                    let high = session.trigger_pattern & (1 << bit) != 0;
                    json!({
                        "channel": channel + u16::from(bit),
                        "state": if high { "HIGH" } else { "LOW" },
                    })
                })
                .collect();
            vec![json!({ "type": "PATTERN", "pattern": pattern })]
        }
    }
}

#[derive(Debug, Deserialize)]
struct AppInfo {
    api_version: Option<String>,
    app_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct DeviceEntry {
    device_id: String,
    device_type: String,
}

#[derive(Debug, Deserialize)]
struct DeviceList {
    #[serde(default)]
    devices: Vec<DeviceEntry>,
}

#[derive(Debug, Deserialize)]
struct CaptureStatus {
    status: String,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChannelData {
    channel: u16,
    #[serde(default)]
    samples: Vec<TimeSample>,
}

#[derive(Debug, Deserialize)]
struct CaptureData {
    #[serde(default)]
    channels: Vec<ChannelData>,
}

// =============================================================================
// Client
// =============================================================================

/// Line-delimited JSON request/response client.
pub struct JsonApiClient {
    stream: Mutex<LineReader<DynStream>>,
    timeout: Duration,
}

impl JsonApiClient {
    pub async fn connect(endpoint: &Endpoint, connect_timeout: Duration) -> anyhow::Result<Self> {
        let port = endpoint.socket_port()?;
        let stream = tokio::time::timeout(
            connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), port)),
        )
        .await
        .with_context(|| format!("Connection timeout to {}", endpoint))?
        .with_context(|| format!("Failed to connect to {}", endpoint))?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(Box::new(stream)))
    }

    pub fn from_stream(stream: DynStream) -> Self {
        Self {
            stream: Mutex::new(LineReader::new(stream)),
            timeout: JSON_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send `{"command": command, ..args}` and return the reply document.
    pub async fn request(&self, command: &str, args: Value) -> Result<Value, JsonApiError> {
        let mut document = match args {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("args".into(), other);
                map
            }
        };
        document.insert("command".into(), Value::String(command.to_string()));
        let mut line = Value::Object(document).to_string();
        line.push('\n');

        let mut stream = self.stream.lock().await;
        stream.discard_stale();

        tracing::debug!(command, "JSON API request");
        stream
            .get_mut()
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("Failed to send '{}'", command))?;
        stream.get_mut().flush().await.context("Failed to flush")?;

        let reply = tokio::time::timeout(self.timeout, stream.read_nonempty_line(MAX_CAPTURE_BYTES))
        .await
        .map_err(|_| JsonApiError::Timeout {
            command: command.to_string(),
            timeout: self.timeout,
        })??;

        let value: Value = serde_json::from_str(reply.trim()).map_err(|e| JsonApiError::Malformed {
            command: command.to_string(),
            reason: e.to_string(),
        })?;
        if value.get("success").and_then(Value::as_bool) == Some(false) {
            let message = value
                .get("error_message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(JsonApiError::Rejected {
                command: command.to_string(),
                message,
            });
        }
        Ok(value)
    }

    /// [`Self::request`] decoded into `T`.
    async fn request_as<T: serde::de::DeserializeOwned>(
        &self,
        command: &str,
        args: Value,
    ) -> Result<T, JsonApiError> {
        let value = self.request(command, args).await?;
        serde_json::from_value(value).map_err(|e| JsonApiError::Malformed {
            command: command.to_string(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Driver
// =============================================================================

struct Connected {
    client: Arc<JsonApiClient>,
    device_id: String,
}

/// Driver for analyzers behind the vendor automation socket.
pub struct SaleaeLogicDriver {
    endpoint: Endpoint,
    state: Arc<DriverState>,
    connection: parking_lot::Mutex<Option<Connected>>,
}

impl SaleaeLogicDriver {
    /// `host[:port]`, or `saleae` for the default endpoint.
    pub fn new(connection: &str) -> Result<Self, DriverConstructionError> {
        let trimmed = require_connection_string(connection)?;
        let endpoint = if trimmed.eq_ignore_ascii_case("saleae") {
            Endpoint {
                host: DEFAULT_HOST.to_string(),
                port: i64::from(DEFAULT_PORT),
            }
        } else {
            Endpoint::parse(trimmed, Some(DEFAULT_PORT))?
        };
        Ok(Self {
            endpoint,
            state: DriverState::new(),
            connection: parking_lot::Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn current(&self) -> Option<(Arc<JsonApiClient>, String)> {
        self.connection
            .lock()
            .as_ref()
            .map(|c| (c.client.clone(), c.device_id.clone()))
    }

    /// Negotiate over an open client.
    pub async fn attach(&self, client: JsonApiClient) -> Result<ConnectionResult, ConnectError> {
        if self.state.is_connected() {
            return Err(ConnectError::AlreadyConnected);
        }
        let to_connect = |e: JsonApiError| ConnectError::Connection(e.to_string());

        let info: AppInfo = client
            .request_as("get_app_info", Value::Null)
            .await
            .map_err(to_connect)?;
        let version = VersionValidator::parse(info.api_version.as_deref());
        let minimum = DeviceVersion::new(MINIMUM_API_VERSION.0, MINIMUM_API_VERSION.1);
        if !VersionValidator::meets_minimum(&version, &minimum) {
            return Err(ConnectError::VersionMismatch {
                found: version,
                minimum,
            });
        }

        let devices: DeviceList = client
            .request_as("get_devices", Value::Null)
            .await
            .map_err(to_connect)?;
        let device = devices
            .devices
            .into_iter()
            .next()
            .ok_or_else(|| ConnectError::Connection("no analyzer attached to the host".into()))?;

        let mut capabilities = table_capabilities(&device.device_type);
        match client
            .request_as::<LiveCapabilities>(
                "get_device_capabilities",
                json!({ "device_id": device.device_id }),
            )
            .await
        {
            Ok(live) => capabilities = apply_live_capabilities(&capabilities, &live),
            Err(e) => tracing::debug!(error = %e, "no live capabilities, using model table"),
        }

        let device_name = device.device_type.clone();
        let api_version = info.api_version.clone();
        *self.connection.lock() = Some(Connected {
            client: Arc::new(client),
            device_id: device.device_id,
        });
        self.state
            .mark_connected(&device_name, api_version.clone(), capabilities.clone());
        tracing::info!(
            device = %device_name,
            api_version = ?api_version,
            app_version = ?info.app_version,
            "JSON API analyzer connected"
        );

        Ok(ConnectionResult {
            device_name,
            device_version: api_version,
            capabilities,
        })
    }
}

fn validate_json_session(
    session: &CaptureSession,
    caps: &DeviceCapabilities,
) -> Result<(), CaptureError> {
    session.validate_structure()?;
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
    let max = if session.trigger_type == TriggerType::Blast {
        caps.blast_frequency
    } else {
        caps.max_frequency
    };
    if session.frequency < caps.min_frequency || session.frequency > max {
        return Err(CaptureError::BadParams(format!(
            "frequency {} Hz outside {}..={} Hz",
            session.frequency, caps.min_frequency, max
        )));
    }
    CaptureLimits::unbounded(caps.buffer_size).check(session)
}

async fn run_capture(
    client: &JsonApiClient,
    device_id: &str,
    ticket: &mut CaptureTicket,
) -> Result<(), CaptureError> {
    let hardware = |e: JsonApiError| CaptureError::HardwareError(e.to_string());
    let mut interval = tokio::time::interval(CAPTURE_POLL_INTERVAL);
    loop {
        interval.tick().await;
        let status: CaptureStatus = client
            .request_as("get_capture_status", json!({ "device_id": device_id }))
            .await
            .map_err(hardware)?;
        match status.status.to_ascii_uppercase().as_str() {
            "COMPLETE" | "COMPLETED" => break,
            "ERROR" => {
                return Err(CaptureError::HardwareError(
                    status
                        .error_message
                        .unwrap_or_else(|| "device reported a capture error".into()),
                ))
            }
            _ => {}
        }
    }

    let data: CaptureData = client
        .request_as("get_capture_data", json!({ "device_id": device_id }))
        .await
        .map_err(hardware)?;
    let rate = ticket.session().frequency as f64;
    let session = ticket.session_mut();
    for channel in &mut session.capture_channels {
        let series = data
            .channels
            .iter()
            .find(|c| c.channel == channel.channel_number)
            .ok_or_else(|| {
                CaptureError::HardwareError(format!(
                    "capture data is missing channel {}",
                    channel.channel_number
                ))
            })?;
        channel.samples = Some(expand_time_series(&series.samples, rate));
    }
    Ok(())
}

#[async_trait]
impl AnalyzerDriver for SaleaeLogicDriver {
    fn state(&self) -> &Arc<DriverState> {
        &self.state
    }

    fn driver_type(&self) -> DriverType {
        DriverType::Network
    }

    fn is_network(&self) -> bool {
        true
    }

    fn limits(&self, _channels: &[u16]) -> CaptureLimits {
        CaptureLimits::unbounded(self.buffer_size())
    }

    #[instrument(skip(self, params), fields(endpoint = %self.endpoint))]
    async fn connect(&self, params: &ConnectionParams) -> Result<ConnectionResult, ConnectError> {
        if self.state.is_connected() {
            return Err(ConnectError::AlreadyConnected);
        }
        let client = JsonApiClient::connect(&self.endpoint, params.timeout)
            .await
            .map_err(ConnectError::from_anyhow)?;
        self.attach(client).await
    }

    async fn disconnect(&self) {
        self.state.mark_disconnected();
        if self.connection.lock().take().is_some() {
            tracing::info!(endpoint = %self.endpoint, "JSON API analyzer disconnected");
        }
    }

    #[instrument(skip_all, fields(endpoint = %self.endpoint))]
    async fn start_capture(
        &self,
        session: CaptureSession,
    ) -> Result<CaptureHandle, CaptureRejection> {
        let (mut ticket, handle) = self.state.begin_capture(session)?;
        let (Some(caps), Some((client, device_id))) = (self.state.capabilities(), self.current())
        else {
            return Err(ticket.reject(CaptureError::not_connected()));
        };
        if let Err(e) = validate_json_session(ticket.session(), &caps) {
            return Err(ticket.reject(e));
        }

        let request = json!({
            "device_id": device_id,
            "settings": capture_settings(ticket.session()),
        });
        match client.request("start_capture", request).await {
            Ok(_) => {}
            Err(JsonApiError::Rejected { message, .. }) => {
                return Err(ticket.reject(CaptureError::HardwareError(message)))
            }
            Err(e) => return Err(ticket.reject(CaptureError::unexpected(e))),
        }

        let capture_id = ticket.capture_id();
        tracing::info!(capture_id, "JSON API capture started");
        let task = tokio::spawn(async move {
            match run_capture(&client, &device_id, &mut ticket).await {
                Ok(()) => ticket.complete(),
                Err(e) => ticket.fail(e),
            }
        });
        self.state.attach_capture_task(capture_id, task.abort_handle());
        Ok(handle)
    }

    async fn stop_capture(&self) -> bool {
        if !self.state.is_capturing() {
            return true;
        }
        self.state.abort_capture_task();
        let Some((client, device_id)) = self.current() else {
            return true;
        };
        match client
            .request("stop_capture", json!({ "device_id": device_id }))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "stop_capture was not accepted");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn ts(time: f64, value: bool) -> TimeSample {
        TimeSample { time, value }
    }

    #[test]
    fn test_model_table() {
        let cases = [
            ("Logic 4", 4, 12_500_000, 25_000_000),
            ("Logic 8", 8, 100_000_000, 500_000_000),
            ("Logic 16", 16, 100_000_000, 500_000_000),
            ("Logic Pro 8", 8, 500_000_000, 1_000_000_000),
            ("Logic Pro 16", 16, 500_000_000, 1_000_000_000),
            ("LOGIC PRO 16", 16, 500_000_000, 1_000_000_000),
            ("", 8, 100_000_000, 500_000_000),
            ("Mystery Box", 8, 100_000_000, 500_000_000),
        ];
        for (name, channels, max, blast) in cases {
            let spec = model_spec(name);
            assert_eq!(
                (spec.channels, spec.max_frequency, spec.blast_frequency),
                (channels, max, blast),
                "{}",
                name
            );
        }
    }

    #[test]
    fn test_live_capabilities_override() {
        let base = table_capabilities("Logic 8");
        let live = LiveCapabilities {
            digital_channels: Some(16),
            sample_rates: vec![50_000_000, 250_000_000, 100_000_000],
            memory_size: None,
        };
        let caps = apply_live_capabilities(&base, &live);
        assert_eq!(caps.channel_count, 16);
        assert_eq!(caps.max_frequency, 250_000_000);
        assert_eq!(caps.blast_frequency, 250_000_000);
        assert_eq!(caps.buffer_size, base.buffer_size);
    }

    #[test]
    fn test_expand_time_series() {
        let series = [ts(0.0, false), ts(0.001, true), ts(0.002, false)];
        assert_eq!(expand_time_series(&series, 1000.0), vec![0, 1, 0]);
        assert!(expand_time_series(&[], 1000.0).is_empty());
        assert!(expand_time_series(&[], 1.0).is_empty());
    }

    #[test]
    fn test_expand_holds_values_and_sorts() {
        let series = [ts(0.004, false), ts(0.001, true)];
        assert_eq!(expand_time_series(&series, 1000.0), vec![0, 1, 1, 1, 0]);

        // Late first entry leaves the leading slots at zero.
        let series = [ts(0.0025, true)];
        assert_eq!(expand_time_series(&series, 1000.0), vec![0, 0, 0, 1]);
    }

    #[test]
    fn test_capture_settings_modes() {
        let session = CaptureSession::new(1_000_000, 10, 100)
            .with_channels([0, 1])
            .with_edge_trigger(1, true);
        let doc = capture_settings(&session);
        assert_eq!(doc["capture_mode"], "NORMAL");
        assert_eq!(doc["trigger"]["mode"], "TRIGGERED");
        assert_eq!(doc["trigger"]["triggers"][0]["type"], "FALLING_EDGE");
        assert_eq!(doc["trigger"]["triggers"][0]["channel"], 1);

        let looping = session.clone().with_bursts(3, false);
        assert_eq!(capture_settings(&looping)["capture_mode"], "LOOPING");
        let measuring = session.clone().with_bursts(0, true);
        assert_eq!(capture_settings(&measuring)["capture_mode"], "LOOPING");

        let free = session.without_trigger();
        let doc = capture_settings(&free);
        assert_eq!(doc["trigger"]["mode"], "ALWAYS");
        assert_eq!(doc["trigger"]["triggers"].as_array().map(Vec::len), Some(0));
    }

    #[test]
    fn test_pattern_trigger_translation() {
        let session = CaptureSession::new(1_000_000, 10, 100)
            .with_channels([2, 3, 4])
            .with_pattern_trigger(TriggerType::Complex, 2, 3, 0b101);
        let doc = capture_settings(&session);
        let pattern = &doc["trigger"]["triggers"][0]["pattern"];
        assert_eq!(pattern[0]["channel"], 2);
        assert_eq!(pattern[0]["state"], "HIGH");
        assert_eq!(pattern[1]["state"], "LOW");
        assert_eq!(pattern[2]["channel"], 4);
        assert_eq!(pattern[2]["state"], "HIGH");
    }

    #[tokio::test]
    async fn test_request_timeout_keeps_socket() {
        let (host, device) = tokio::io::duplex(1024);
        let client =
            JsonApiClient::from_stream(Box::new(host)).with_timeout(Duration::from_millis(30));
        let fake = tokio::spawn(async move {
            let mut device = BufReader::new(device);
            let mut line = String::new();
            device.read_line(&mut line).await.unwrap();
            // Ignore the first request, answer the second.
            line.clear();
            device.read_line(&mut line).await.unwrap();
            assert!(line.contains("get_devices"));
            device
                .get_mut()
                .write_all(b"{\"success\":true,\"devices\":[]}\n")
                .await
                .unwrap();
            device
        });

        let err = client.request("get_app_info", Value::Null).await.unwrap_err();
        assert!(matches!(err, JsonApiError::Timeout { .. }));
        let reply = client.request("get_devices", Value::Null).await.unwrap();
        assert_eq!(reply["devices"].as_array().map(Vec::len), Some(0));
        fake.await.unwrap();
    }

    #[tokio::test]
    async fn test_reply_split_across_deadline_is_not_reused() {
        let (host, device) = tokio::io::duplex(1024);
        let client =
            JsonApiClient::from_stream(Box::new(host)).with_timeout(Duration::from_millis(30));
        let fake = tokio::spawn(async move {
            let mut device = BufReader::new(device);
            let mut line = String::new();
            device.read_line(&mut line).await.unwrap();
            device.get_mut().write_all(b"{\"success\":true,\"id\"").await.unwrap();

            // The rest of the first reply shows up after the next request.
            line.clear();
            device.read_line(&mut line).await.unwrap();
            assert!(line.contains("get_devices"));
            device
                .get_mut()
                .write_all(b":1}\n{\"success\":true,\"id\":2}\n")
                .await
                .unwrap();
            device
        });

        let err = client.request("get_app_info", Value::Null).await.unwrap_err();
        assert!(matches!(err, JsonApiError::Timeout { .. }));
        let reply = client.request("get_devices", Value::Null).await.unwrap();
        assert_eq!(reply["id"], 2);
        fake.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_response() {
        let (host, device) = tokio::io::duplex(1024);
        let client = JsonApiClient::from_stream(Box::new(host));
        tokio::spawn(async move {
            let mut device = BufReader::new(device);
            let mut line = String::new();
            device.read_line(&mut line).await.unwrap();
            device
                .get_mut()
                .write_all(b"{\"success\":false,\"error_message\":\"device busy\"}\n")
                .await
                .unwrap();
            let _ = device.read_line(&mut line).await;
        });
        let err = client.request("start_capture", json!({})).await.unwrap_err();
        assert!(
            matches!(&err, JsonApiError::Rejected { message, .. } if message == "device busy"),
            "{err}"
        );
    }

    #[test]
    fn test_default_endpoint() {
        let driver = SaleaeLogicDriver::new("Saleae").unwrap();
        assert_eq!(driver.endpoint().host, DEFAULT_HOST);
        assert_eq!(driver.endpoint().port, 10430);
        let driver = SaleaeLogicDriver::new("10.0.0.5").unwrap();
        assert_eq!(driver.endpoint().host, "10.0.0.5");
        assert_eq!(driver.endpoint().port, 10430);
    }

    #[test]
    fn test_empty_connection_string_rejected() {
        assert!(matches!(
            SaleaeLogicDriver::new(""),
            Err(DriverConstructionError::EmptyConnectionString)
        ));
        assert!(matches!(
            SaleaeLogicDriver::new("   "),
            Err(DriverConstructionError::EmptyConnectionString)
        ));
    }
}
