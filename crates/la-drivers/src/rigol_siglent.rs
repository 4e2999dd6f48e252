//! Rigol and Siglent mixed-signal oscilloscopes driven over SCPI.
//!
//! The digital (logic) channels of these scopes are used as a logic analyzer.
//! The vendor is picked from the `*IDN?` manufacturer field, the capability
//! numbers from a model-prefix table.
//!
//! A capture is a single-shot acquisition: configure, `:SING`, poll
//! `:TRIG:STAT?` until the scope stops, then pull each channel as a block.

use crate::address::Endpoint;
use crate::scpi::{Identity, ScpiClient, DEFAULT_PORT};
use anyhow::{bail, Result};
use async_trait::async_trait;
use la_core::capabilities::{Connectivity, DeviceCapabilities, TriggerCapabilities};
use la_core::capture::{CaptureLimits, CaptureMode, CaptureSession, TriggerType};
use la_core::completion::{CaptureHandle, CaptureRejection, CaptureTicket};
use la_core::driver::{AnalyzerDriver, ConnectionParams, ConnectionResult, DriverType};
use la_core::error::{CaptureError, ConnectError, DriverConstructionError};
use la_core::limits::CAPTURE_POLL_INTERVAL;
use la_core::state::DriverState;
use std::sync::Arc;
use tracing::instrument;

// =============================================================================
// Dialects
// =============================================================================

/// SCPI command flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeVendor {
    Rigol,
    Siglent,
}

impl ScopeVendor {
    /// Vendor from the `*IDN?` manufacturer field.
    pub fn from_manufacturer(manufacturer: &str) -> Option<Self> {
        let upper = manufacturer.to_ascii_uppercase();
        if upper.contains("RIGOL") {
            Some(ScopeVendor::Rigol)
        } else if upper.contains("SIGLENT") {
            Some(ScopeVendor::Siglent)
        } else {
            None
        }
    }

    /// Commands that configure one capture, in order.
    pub fn setup_commands(&self, session: &CaptureSession, memory_depth: u64) -> Vec<String> {
        let total = session.total_samples();
        let rate = session.frequency as f64;
        // Ten horizontal divisions span the whole record.
        let scale = total as f64 / rate / 10.0;
        // Trigger sits at the center by default; shift it to honour the pre-trigger share.
        let offset = (total as f64 / 2.0 - f64::from(session.pre_trigger_samples)) / rate;

        let mut cmds = vec![":STOP".to_string()];
        match self {
            ScopeVendor::Rigol => {
                cmds.push(":LA:STAT ON".into());
                for ch in session.channel_numbers() {
                    cmds.push(format!(":LA:DIG{}:DISP ON", ch));
                }
                cmds.push(format!(":ACQ:MDEP {}", memory_depth));
                cmds.push(format!(":TIM:MAIN:SCAL {:e}", scale));
                cmds.push(format!(":TIM:MAIN:OFFS {:e}", offset));
            }
            ScopeVendor::Siglent => {
                cmds.push(":DIG:STAT ON".into());
                for ch in session.channel_numbers() {
                    cmds.push(format!(":DIG:D{} ON", ch));
                }
                cmds.push(format!(":ACQ:MDEP {}", memory_depth));
                cmds.push(format!(":TIM:SCAL {:e}", scale));
                cmds.push(format!(":TIM:DEL {:e}", offset));
            }
        }

        match (session.has_trigger(), session.trigger_channel) {
            (true, Some(channel)) => {
                let (rising, falling) = match self {
                    ScopeVendor::Rigol => ("POS", "NEG"),
                    ScopeVendor::Siglent => ("RIS", "FALL"),
                };
                let slope = if session.trigger_inverted { falling } else { rising };
                match self {
                    ScopeVendor::Rigol => {
                        cmds.push(":TRIG:MODE EDGE".into());
                        cmds.push(format!(":TRIG:EDGE:SOUR D{}", channel));
                        cmds.push(format!(":TRIG:EDGE:SLOP {}", slope));
                        cmds.push(":TRIG:SWE NORM".into());
                    }
                    ScopeVendor::Siglent => {
                        cmds.push(":TRIG:TYPE EDGE".into());
                        cmds.push(format!(":TRIG:EDGE:SOUR D{}", channel));
                        cmds.push(format!(":TRIG:EDGE:SLOP {}", slope));
                        cmds.push(":TRIG:MODE NORM".into());
                    }
                }
            }
            _ => match self {
                ScopeVendor::Rigol => cmds.push(":TRIG:SWE AUTO".into()),
                ScopeVendor::Siglent => cmds.push(":TRIG:MODE AUTO".into()),
            },
        }
        cmds.push(":SING".into());
        cmds
    }

    /// Commands that select channel `channel` for a waveform read.
    pub fn waveform_commands(&self, channel: u16, total: u64) -> Vec<String> {
        match self {
            ScopeVendor::Rigol => vec![
                format!(":WAV:SOUR D{}", channel),
                ":WAV:MODE RAW".into(),
                ":WAV:FORM BYTE".into(),
                ":WAV:STAR 1".into(),
                format!(":WAV:STOP {}", total),
            ],
            ScopeVendor::Siglent => vec![
                format!(":WAV:SOUR D{}", channel),
                ":WAV:STAR 0".into(),
                format!(":WAV:POIN {}", total),
            ],
        }
    }
}

// =============================================================================
// Model Table
// =============================================================================

/// Capability row for one model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeModel {
    pub prefix: &'static str,
    pub channels: u32,
    pub max_sample_rate: u64,
    pub memory_depth: u32,
}

const RIGOL_MODELS: &[ScopeModel] = &[
    ScopeModel { prefix: "MSO8", channels: 16, max_sample_rate: 1_250_000_000, memory_depth: 100_000_000 },
    ScopeModel { prefix: "MSO7", channels: 16, max_sample_rate: 1_000_000_000, memory_depth: 100_000_000 },
    ScopeModel { prefix: "MSO5", channels: 16, max_sample_rate: 1_000_000_000, memory_depth: 100_000_000 },
    ScopeModel { prefix: "MSO4", channels: 16, max_sample_rate: 1_000_000_000, memory_depth: 28_000_000 },
    ScopeModel { prefix: "MSO2", channels: 16, max_sample_rate: 1_000_000_000, memory_depth: 56_000_000 },
    ScopeModel { prefix: "MSO1", channels: 16, max_sample_rate: 1_000_000_000, memory_depth: 24_000_000 },
    ScopeModel { prefix: "DHO", channels: 16, max_sample_rate: 1_250_000_000, memory_depth: 50_000_000 },
];

const SIGLENT_MODELS: &[ScopeModel] = &[
    ScopeModel { prefix: "SDS6", channels: 16, max_sample_rate: 1_250_000_000, memory_depth: 62_500_000 },
    ScopeModel { prefix: "SDS5", channels: 16, max_sample_rate: 1_000_000_000, memory_depth: 62_500_000 },
    ScopeModel { prefix: "SDS2", channels: 16, max_sample_rate: 1_000_000_000, memory_depth: 50_000_000 },
    ScopeModel { prefix: "SDS1", channels: 16, max_sample_rate: 500_000_000, memory_depth: 14_000_000 },
];

/// Conservative numbers for unknown models of a known vendor.
pub const FALLBACK_MODEL: ScopeModel = ScopeModel {
    prefix: "",
    channels: 16,
    max_sample_rate: 500_000_000,
    memory_depth: 10_000_000,
};

/// Look up a model by case-insensitive prefix.
pub fn lookup_model(vendor: ScopeVendor, model: &str) -> ScopeModel {
    let table = match vendor {
        ScopeVendor::Rigol => RIGOL_MODELS,
        ScopeVendor::Siglent => SIGLENT_MODELS,
    };
    let upper = model.trim().to_ascii_uppercase();
    table
        .iter()
        .find(|m| upper.starts_with(m.prefix))
        .copied()
        .unwrap_or(FALLBACK_MODEL)
}

fn capabilities_for(model: &ScopeModel) -> DeviceCapabilities {
    DeviceCapabilities {
        channel_count: model.channels,
        min_frequency: DeviceCapabilities::derive_min_frequency(model.max_sample_rate),
        max_frequency: model.max_sample_rate,
        blast_frequency: model.max_sample_rate,
        buffer_size: model.memory_depth,
        capture_modes: DeviceCapabilities::modes_for_channel_count(model.channels),
        triggers: TriggerCapabilities {
            types: vec![TriggerType::Edge, TriggerType::None],
            max_pattern_width: 0,
            sequential: false,
        },
        connectivity: Connectivity::new(&["ethernet"], &["scpi"]),
    }
}

// =============================================================================
// Driver
// =============================================================================

struct Session {
    client: Arc<ScpiClient>,
    vendor: ScopeVendor,
}

/// SCPI logic-analyzer driver for Rigol/Siglent MSOs.
pub struct RigolSiglentDriver {
    endpoint: Endpoint,
    state: Arc<DriverState>,
    session: parking_lot::Mutex<Option<Session>>,
}

impl RigolSiglentDriver {
    /// `host[:port]`, port defaults to 5555.
    pub fn new(connection: &str) -> Result<Self, DriverConstructionError> {
        let endpoint = Endpoint::parse(connection, Some(DEFAULT_PORT))?;
        Ok(Self {
            endpoint,
            state: DriverState::new(),
            session: parking_lot::Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn current(&self) -> Option<(Arc<ScpiClient>, ScopeVendor)> {
        self.session
            .lock()
            .as_ref()
            .map(|s| (s.client.clone(), s.vendor))
    }

    /// Identify the instrument on an open client and record its capabilities.
    pub async fn attach(&self, client: ScpiClient) -> Result<ConnectionResult, ConnectError> {
        if self.state.is_connected() {
            return Err(ConnectError::AlreadyConnected);
        }
        let idn = client
            .query("*IDN?")
            .await
            .map_err(ConnectError::from_anyhow)?;
        let identity =
            Identity::parse(&idn).map_err(|e| ConnectError::Protocol(format!("{:#}", e)))?;
        let vendor = ScopeVendor::from_manufacturer(&identity.manufacturer).ok_or_else(|| {
            ConnectError::Protocol(format!(
                "unsupported instrument manufacturer '{}'",
                identity.manufacturer
            ))
        })?;

        let model = lookup_model(vendor, &identity.model);
        let capabilities = capabilities_for(&model);
        let device_name = format!("{} {}", identity.manufacturer, identity.model);

        *self.session.lock() = Some(Session {
            client: Arc::new(client),
            vendor,
        });
        self.state
            .mark_connected(&device_name, identity.firmware.clone(), capabilities.clone());
        tracing::info!(device = %device_name, vendor = ?vendor, "SCPI scope connected");

        Ok(ConnectionResult {
            device_name,
            device_version: identity.firmware,
            capabilities,
        })
    }
}

/// Check a session against an MSO's digital-channel capabilities.
pub fn validate_scope_session(
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
            "digital channel D{} does not exist",
            bad
        )));
    }
    if session.frequency < caps.min_frequency || session.frequency > caps.max_frequency {
        return Err(CaptureError::BadParams(format!(
            "frequency {} Hz outside {}..={} Hz",
            session.frequency, caps.min_frequency, caps.max_frequency
        )));
    }
    if !matches!(session.trigger_type, TriggerType::Edge | TriggerType::None) {
        return Err(CaptureError::BadParams(format!(
            "{:?} triggers are not supported by this instrument",
            session.trigger_type
        )));
    }
    if session.trigger_type == TriggerType::Edge {
        match session.trigger_channel {
            Some(ch) if u32::from(ch) < caps.channel_count => {}
            _ => {
                return Err(CaptureError::BadParams(
                    "edge trigger needs an existing digital channel".into(),
                ))
            }
        }
    }
    if session.loop_count > 0 || session.measure_bursts {
        return Err(CaptureError::BadParams(
            "burst captures are not supported by this instrument".into(),
        ));
    }
    CaptureLimits::unbounded(caps.buffer_size).check(session)
}

/// Poll until the scope stops, then read every selected channel.
async fn run_capture(
    client: &ScpiClient,
    vendor: ScopeVendor,
    ticket: &mut CaptureTicket,
) -> Result<()> {
    let mut interval = tokio::time::interval(CAPTURE_POLL_INTERVAL);
    loop {
        interval.tick().await;
        let status = client.query(":TRIG:STAT?").await?;
        match status.to_ascii_uppercase().as_str() {
            "STOP" => break,
            s if s.starts_with("ERR") => bail!("instrument reported error status '{}'", status),
            _ => {}
        }
    }

    let total = ticket.session().total_samples();
    let channels = ticket.session().channel_numbers();
    for (index, channel) in channels.into_iter().enumerate() {
        for cmd in vendor.waveform_commands(channel, total) {
            client.write(&cmd).await?;
        }
        let block = client.query_block(":WAV:DATA?").await?;
        let mut samples: Vec<u8> = block.iter().map(|b| u8::from(*b != 0)).collect();
        samples.resize(total as usize, samples.last().copied().unwrap_or(0));
        ticket.session_mut().capture_channels[index].samples = Some(samples);
    }
    Ok(())
}

#[async_trait]
impl AnalyzerDriver for RigolSiglentDriver {
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
        let client = ScpiClient::connect(&self.endpoint, params.timeout)
            .await
            .map_err(ConnectError::from_anyhow)?;
        self.attach(client).await
    }

    async fn disconnect(&self) {
        self.state.mark_disconnected();
        if self.session.lock().take().is_some() {
            tracing::info!(endpoint = %self.endpoint, "SCPI scope disconnected");
        }
    }

    #[instrument(skip_all, fields(endpoint = %self.endpoint))]
    async fn start_capture(
        &self,
        session: CaptureSession,
    ) -> Result<CaptureHandle, CaptureRejection> {
        let (mut ticket, handle) = self.state.begin_capture(session)?;
        let (Some(caps), Some((client, vendor))) = (self.state.capabilities(), self.current())
        else {
            return Err(ticket.reject(CaptureError::not_connected()));
        };
        if let Err(e) = validate_scope_session(ticket.session(), &caps) {
            return Err(ticket.reject(e));
        }

        let depth = ticket.session().total_samples();
        for cmd in vendor.setup_commands(ticket.session(), depth) {
            if let Err(e) = client.write(&cmd).await {
                return Err(ticket.reject(CaptureError::unexpected(format!("{:#}", e))));
            }
        }

        let capture_id = ticket.capture_id();
        tracing::info!(capture_id, "scope armed");
        let task = tokio::spawn(async move {
            match run_capture(&client, vendor, &mut ticket).await {
                Ok(()) => ticket.complete(),
                Err(e) => ticket.fail(CaptureError::HardwareError(format!("{:#}", e))),
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
        match self.current() {
            Some((client, _)) => match client.write(":STOP").await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(error = %format!("{:#}", e), "failed to stop scope");
                    false
                }
            },
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[test]
    fn test_vendor_detection() {
        assert_eq!(
            ScopeVendor::from_manufacturer("RIGOL TECHNOLOGIES"),
            Some(ScopeVendor::Rigol)
        );
        assert_eq!(
            ScopeVendor::from_manufacturer("Siglent Technologies"),
            Some(ScopeVendor::Siglent)
        );
        assert_eq!(ScopeVendor::from_manufacturer("KEYSIGHT"), None);
    }

    #[test]
    fn test_model_lookup() {
        let m = lookup_model(ScopeVendor::Rigol, "mso5074");
        assert_eq!(m.prefix, "MSO5");
        assert_eq!(m.memory_depth, 100_000_000);
        let m = lookup_model(ScopeVendor::Siglent, "SDS1104X-E");
        assert_eq!(m.max_sample_rate, 500_000_000);
        assert_eq!(lookup_model(ScopeVendor::Rigol, "DS1054Z"), FALLBACK_MODEL);
    }

    #[test]
    fn test_setup_commands() {
        let session = CaptureSession::new(1_000_000, 100, 900)
            .with_channels([0, 3])
            .with_edge_trigger(3, true);
        let cmds = ScopeVendor::Rigol.setup_commands(&session, 1000);
        assert_eq!(cmds.first().map(String::as_str), Some(":STOP"));
        assert!(cmds.contains(&":LA:DIG3:DISP ON".to_string()));
        assert!(cmds.contains(&":TRIG:EDGE:SLOP NEG".to_string()));
        assert_eq!(cmds.last().map(String::as_str), Some(":SING"));

        let untriggered = session.clone().without_trigger();
        let cmds = ScopeVendor::Siglent.setup_commands(&untriggered, 1000);
        assert!(cmds.contains(&":TRIG:MODE AUTO".to_string()));
        assert!(cmds.contains(&":DIG:D0 ON".to_string()));
    }

    #[test]
    fn test_validate_scope_session() {
        let caps = capabilities_for(&FALLBACK_MODEL);
        let ok = CaptureSession::new(1_000_000, 10, 100)
            .with_channels([0])
            .with_edge_trigger(0, false);
        assert!(validate_scope_session(&ok, &caps).is_ok());
        let pattern = ok.clone().with_pattern_trigger(TriggerType::Complex, 0, 2, 1);
        assert!(validate_scope_session(&pattern, &caps).is_err());
        let looped = ok.with_bursts(2, false);
        assert!(validate_scope_session(&looped, &caps).is_err());
    }

    #[tokio::test]
    async fn test_unknown_manufacturer_fails_connect() {
        let (host, device) = tokio::io::duplex(256);
        tokio::spawn(async move {
            let mut device = BufReader::new(device);
            let mut line = String::new();
            device.read_line(&mut line).await.unwrap();
            device
                .get_mut()
                .write_all(b"KEYSIGHT TECHNOLOGIES,MSOX3104T,X,1\n")
                .await
                .unwrap();
        });
        let driver = RigolSiglentDriver::new("127.0.0.1").unwrap();
        let err = driver
            .attach(ScpiClient::from_stream(Box::new(host)))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Protocol(_)));
        assert!(!driver.is_connected());
    }

    #[tokio::test]
    async fn test_capture_polls_until_stop() {
        let (host, device) = tokio::io::duplex(4096);
        let fake = tokio::spawn(async move {
            let mut device = BufReader::new(device);
            let mut polls = 0;
            loop {
                let mut line = String::new();
                if device.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                let reply: Option<Vec<u8>> = match line.trim() {
                    "*IDN?" => Some(b"RIGOL TECHNOLOGIES,MSO5074,X,00.01\n".to_vec()),
                    ":TRIG:STAT?" => {
                        polls += 1;
                        Some(if polls < 3 { b"WAIT\n".to_vec() } else { b"STOP\n".to_vec() })
                    }
                    ":WAV:DATA?" => Some(b"#14\x00\x01\x01\x00\n".to_vec()),
                    _ => None,
                };
                if let Some(reply) = reply {
                    device.get_mut().write_all(&reply).await.unwrap();
                }
            }
            polls
        });

        let driver = RigolSiglentDriver::new("127.0.0.1:5555").unwrap();
        driver
            .attach(ScpiClient::from_stream(Box::new(host)))
            .await
            .unwrap();
        assert_eq!(driver.channel_count(), 16);
        assert_eq!(driver.device_version().as_deref(), Some("00.01"));

        let session = CaptureSession::new(1_000_000, 2, 2)
            .with_channels([2])
            .with_edge_trigger(2, false);
        let completion = driver.start_capture(session).await.unwrap().wait().await.unwrap();
        assert!(completion.success);
        assert_eq!(completion.session.capture_channels[0].samples, Some(vec![0, 1, 1, 0]));

        driver.disconnect().await;
        drop(driver);
        assert!(fake.await.unwrap() >= 3);
    }
}
