//! Software analyzer for tests and demos.
//!
//! Produces a deterministic pattern: channel `n` toggles every
//! `2^(n mod 8)` samples, so channel 0 is a square wave at half the sample
//! rate and channel 7 changes every 128 samples. Faults can be injected to
//! exercise the failure paths of callers.

use async_trait::async_trait;
use la_core::capabilities::{Connectivity, DeviceCapabilities, TriggerCapabilities};
use la_core::capture::{
    BurstInfo, CaptureLimits, CaptureSession, TriggerType, EXTERNAL_TRIGGER_CHANNEL, MAX_LOOP_COUNT,
};
use la_core::completion::{CaptureHandle, CaptureRejection};
use la_core::driver::{AnalyzerDriver, ConnectionParams, ConnectionResult, DriverType};
use la_core::error::{CaptureError, ConnectError, DriverConstructionError};
use la_core::limits::EMULATED_CAPTURE_DELAY;
use la_core::state::DriverState;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Connection-string prefix of the emulator.
pub const CONNECTION_PREFIX: &str = "emulated";

pub const DEFAULT_CHANNELS: u32 = 24;
pub const MAX_CHANNELS: u32 = 64;

const EMULATED_MAX_FREQUENCY: u64 = 100_000_000;
const EMULATED_BLAST_FREQUENCY: u64 = 200_000_000;
const EMULATED_BUFFER: u32 = 4_000_000;

/// Failures the emulator can be told to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmulatedFault {
    /// `connect` fails with a connection error.
    RejectConnect,
    /// `start_capture` fails with `HardwareError` before arming.
    FailArm,
    /// The capture arms, then completes with `success = false`.
    FailCapture,
}

/// Value of channel `channel` at sample `index`.
pub fn pattern_sample(channel: u16, index: u64) -> u8 {
    ((index >> (channel % 8)) & 1) as u8
}

/// In-process analyzer with a synthetic signal.
pub struct EmulatedAnalyzer {
    channels: u32,
    delay: Duration,
    state: Arc<DriverState>,
    faults: Arc<Mutex<HashSet<EmulatedFault>>>,
}

impl EmulatedAnalyzer {
    /// `emulated` or `emulated:<channels>`.
    pub fn new(connection: &str) -> Result<Self, DriverConstructionError> {
        let input = connection.trim();
        if input.is_empty() {
            return Err(DriverConstructionError::EmptyConnectionString);
        }
        let channels = match input.split_once(':') {
            None if input.eq_ignore_ascii_case(CONNECTION_PREFIX) => DEFAULT_CHANNELS,
            Some((prefix, count)) if prefix.eq_ignore_ascii_case(CONNECTION_PREFIX) => {
                let count = count.trim().parse::<u32>().map_err(|_| {
                    DriverConstructionError::malformed(input, "channel count is not a number")
                })?;
                if count == 0 || count > MAX_CHANNELS {
                    return Err(DriverConstructionError::malformed(
                        input,
                        format!("channel count must be 1..={}", MAX_CHANNELS),
                    ));
                }
                count
            }
            _ => {
                return Err(DriverConstructionError::malformed(
                    input,
                    "expected emulated[:<channels>]",
                ))
            }
        };
        Ok(Self::with_channels(channels))
    }

    pub fn with_channels(channels: u32) -> Self {
        Self {
            channels,
            delay: EMULATED_CAPTURE_DELAY,
            state: DriverState::new(),
            faults: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_fault(self, fault: EmulatedFault) -> Self {
        self.inject(fault);
        self
    }

    /// Arm a fault; it stays active until cleared.
    pub fn inject(&self, fault: EmulatedFault) {
        self.faults.lock().insert(fault);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    fn has_fault(&self, fault: EmulatedFault) -> bool {
        self.faults.lock().contains(&fault)
    }

    fn build_capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            channel_count: self.channels,
            min_frequency: DeviceCapabilities::derive_min_frequency(EMULATED_MAX_FREQUENCY),
            max_frequency: EMULATED_MAX_FREQUENCY,
            blast_frequency: EMULATED_BLAST_FREQUENCY,
            buffer_size: EMULATED_BUFFER,
            capture_modes: DeviceCapabilities::modes_for_channel_count(self.channels),
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
            connectivity: Connectivity::new(&["virtual"], &["emulated"]),
        }
    }
}

fn validate_emulated_session(
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
    if let Some(channel) = session.trigger_channel {
        if u32::from(channel) >= caps.channel_count && channel != EXTERNAL_TRIGGER_CHANNEL {
            return Err(CaptureError::BadParams(format!(
                "trigger channel {} does not exist",
                channel
            )));
        }
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
    if session.loop_count > MAX_LOOP_COUNT {
        return Err(CaptureError::BadParams(format!(
            "loop count {} exceeds {}",
            session.loop_count, MAX_LOOP_COUNT
        )));
    }
    if session.total_samples_with_loops() > u64::from(caps.buffer_size) {
        return Err(CaptureError::BadParams(format!(
            "{} samples exceed the emulated buffer",
            session.total_samples_with_loops()
        )));
    }
    CaptureLimits::unbounded(caps.buffer_size).check(session)
}

/// Fill every selected channel with the synthetic pattern.
pub fn synthesize(session: &mut CaptureSession) {
    let total = session.total_samples_with_loops();
    for channel in &mut session.capture_channels {
        let n = channel.channel_number;
        channel.samples = Some((0..total).map(|i| pattern_sample(n, i)).collect());
    }
    if session.measure_bursts {
        let pre = u64::from(session.pre_trigger_samples);
        let post = u64::from(session.post_trigger_samples);
        let bursts = (0..=u64::from(session.loop_count))
            .map(|k| BurstInfo {
                burst_sample_start: if k == 0 { 0 } else { pre + k * post },
                burst_sample_end: pre + (k + 1) * post,
                burst_sample_gap: 0,
                burst_time_gap: 0,
            })
            .collect();
        session.bursts = Some(bursts);
    }
}

#[async_trait]
impl AnalyzerDriver for EmulatedAnalyzer {
    fn state(&self) -> &Arc<DriverState> {
        &self.state
    }

    fn driver_type(&self) -> DriverType {
        DriverType::Emulated
    }

    fn is_network(&self) -> bool {
        false
    }

    fn limits(&self, _channels: &[u16]) -> CaptureLimits {
        CaptureLimits::unbounded(EMULATED_BUFFER)
    }

    async fn connect(&self, _params: &ConnectionParams) -> Result<ConnectionResult, ConnectError> {
        if self.state.is_connected() {
            return Err(ConnectError::AlreadyConnected);
        }
        if self.has_fault(EmulatedFault::RejectConnect) {
            return Err(ConnectError::Connection("emulated connect failure".into()));
        }
        let device_name = format!("Emulated analyzer ({} ch)", self.channels);
        let capabilities = self.build_capabilities();
        let version = Some("1.0".to_string());
        self.state
            .mark_connected(&device_name, version.clone(), capabilities.clone());
        tracing::debug!(device = %device_name, "emulated analyzer connected");
        Ok(ConnectionResult {
            device_name,
            device_version: version,
            capabilities,
        })
    }

    async fn disconnect(&self) {
        self.state.mark_disconnected();
    }

    async fn start_capture(
        &self,
        session: CaptureSession,
    ) -> Result<CaptureHandle, CaptureRejection> {
        let (ticket, handle) = self.state.begin_capture(session)?;
        let Some(caps) = self.state.capabilities() else {
            return Err(ticket.reject(CaptureError::not_connected()));
        };
        if let Err(e) = validate_emulated_session(ticket.session(), &caps) {
            return Err(ticket.reject(e));
        }
        if self.has_fault(EmulatedFault::FailArm) {
            return Err(ticket.reject(CaptureError::HardwareError(
                "emulated arm failure".into(),
            )));
        }

        let capture_id = ticket.capture_id();
        let delay = self.delay;
        let faults = self.faults.clone();
        let task = tokio::spawn(async move {
            let mut ticket = ticket;
            tokio::time::sleep(delay).await;
            if faults.lock().contains(&EmulatedFault::FailCapture) {
                ticket.fail(CaptureError::HardwareError("emulated capture failure".into()));
                return;
            }
            synthesize(ticket.session_mut());
            ticket.complete();
        });
        self.state.attach_capture_task(capture_id, task.abort_handle());
        tracing::debug!(capture_id, "emulated capture armed");
        Ok(handle)
    }

    async fn stop_capture(&self) -> bool {
        self.state.abort_capture_task();
        true
    }
}
