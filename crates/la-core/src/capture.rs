//! Capture data model.
//!
//! A [`CaptureSession`] describes one acquisition: timing, trigger and the
//! ordered list of channels to record. The caller builds it, hands it to
//! `AnalyzerDriver::start_capture` by value, and gets it back (with each
//! channel's `samples` filled) through the capture completion.
//!
//! # Capture modes
//!
//! The binary-protocol hardware multiplexes channels in groups of 8. The
//! highest channel index in use selects the group width, and the group width
//! decides how many samples fit in the device buffer:
//!
//! | Highest channel | Mode | Bytes / sample | Usable buffer |
//! |-----------------|------|----------------|---------------|
//! | 0–7             | 8    | 1              | buffer        |
//! | 8–15            | 16   | 2              | buffer / 2    |
//! | 16–23           | 24   | 4              | buffer / 4    |

use crate::error::CaptureError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Physical line used to distribute the trigger between ensemble members.
pub const EXTERNAL_TRIGGER_CHANNEL: u16 = 24;

/// Minimum pre/post trigger samples accepted by the binary-protocol hardware.
pub const MIN_TRIGGER_SAMPLES: u32 = 2;

/// Largest loop count the hardware accepts for burst captures.
pub const MAX_LOOP_COUNT: u32 = 254;

// =============================================================================
// Trigger Type
// =============================================================================

/// How the acquisition is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Single-channel rising or falling edge.
    #[default]
    Edge,
    /// Multi-channel pattern match (up to 16 bits).
    Complex,
    /// Fast pattern match on a narrow window (up to 5 bits).
    Fast,
    /// Burst acquisition at the blast frequency, no pre-trigger.
    Blast,
    /// Free-running capture without a trigger.
    None,
}

impl TriggerType {
    /// Wire value used by the binary protocol.
    pub fn code(&self) -> u8 {
        match self {
            TriggerType::Edge => 0,
            TriggerType::Complex => 1,
            TriggerType::Fast => 2,
            TriggerType::Blast => 3,
            TriggerType::None => 4,
        }
    }

    /// Widest trigger pattern accepted for this type, if it is a pattern trigger.
    pub fn max_pattern_width(&self) -> Option<u8> {
        match self {
            TriggerType::Complex => Some(16),
            TriggerType::Fast => Some(5),
            _ => None,
        }
    }
}

// =============================================================================
// Channels
// =============================================================================

/// One selected channel and, after a successful capture, its samples.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AnalyzerChannel {
    /// Physical channel index on the device (or ensemble).
    pub channel_number: u16,
    /// Optional user-facing label.
    pub channel_name: Option<String>,
    /// One byte per sample, value 0 or 1. `None` until a capture succeeds.
    pub samples: Option<Vec<u8>>,
}

impl AnalyzerChannel {
    pub fn new(channel_number: u16) -> Self {
        Self {
            channel_number,
            channel_name: None,
            samples: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.channel_name = Some(name.into());
        self
    }

    /// Display name, falling back to `Channel N` (1-based).
    pub fn display_name(&self) -> String {
        self.channel_name
            .clone()
            .unwrap_or_else(|| format!("Channel {}", self.channel_number + 1))
    }
}

/// Timing of one burst inside a looping capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BurstInfo {
    pub burst_sample_start: u64,
    pub burst_sample_end: u64,
    /// Samples that would have fit in the gap before this burst.
    pub burst_sample_gap: u64,
    /// Gap before this burst in nanoseconds.
    pub burst_time_gap: u64,
}

// =============================================================================
// Capture Session
// =============================================================================

/// One configured acquisition request.
///
/// Only read `samples` after the capture completion has been received; while a
/// capture is running the driver owns the session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CaptureSession {
    /// Sample rate in Hz.
    pub frequency: u64,
    pub pre_trigger_samples: u32,
    pub post_trigger_samples: u32,
    pub trigger_type: TriggerType,
    pub trigger_channel: Option<u16>,
    pub trigger_inverted: bool,
    /// Pattern width for `Complex`/`Fast` triggers.
    pub trigger_bit_count: u8,
    /// Pattern value for `Complex`/`Fast` triggers, bit 0 = `trigger_channel`.
    pub trigger_pattern: u16,
    pub loop_count: u32,
    pub measure_bursts: bool,
    /// Ordered selection; insertion order is preserved in results.
    pub capture_channels: Vec<AnalyzerChannel>,
    /// Burst timing, filled by drivers that report it.
    pub bursts: Option<Vec<BurstInfo>>,
}

impl CaptureSession {
    /// Session with a sample rate and trigger window; channels are added after.
    pub fn new(frequency: u64, pre_trigger_samples: u32, post_trigger_samples: u32) -> Self {
        Self {
            frequency,
            pre_trigger_samples,
            post_trigger_samples,
            ..Default::default()
        }
    }

    pub fn with_channels(mut self, channels: impl IntoIterator<Item = u16>) -> Self {
        self.capture_channels
            .extend(channels.into_iter().map(AnalyzerChannel::new));
        self
    }

    pub fn with_edge_trigger(mut self, channel: u16, inverted: bool) -> Self {
        self.trigger_type = TriggerType::Edge;
        self.trigger_channel = Some(channel);
        self.trigger_inverted = inverted;
        self
    }

    pub fn with_pattern_trigger(
        mut self,
        trigger_type: TriggerType,
        first_channel: u16,
        bit_count: u8,
        pattern: u16,
    ) -> Self {
        self.trigger_type = trigger_type;
        self.trigger_channel = Some(first_channel);
        self.trigger_bit_count = bit_count;
        self.trigger_pattern = pattern;
        self
    }

    pub fn without_trigger(mut self) -> Self {
        self.trigger_type = TriggerType::None;
        self.trigger_channel = None;
        self
    }

    pub fn with_bursts(mut self, loop_count: u32, measure_bursts: bool) -> Self {
        self.loop_count = loop_count;
        self.measure_bursts = measure_bursts;
        self
    }

    /// `pre_trigger_samples + post_trigger_samples`.
    pub fn total_samples(&self) -> u64 {
        u64::from(self.pre_trigger_samples) + u64::from(self.post_trigger_samples)
    }

    /// Samples per channel including every loop of a burst capture.
    pub fn total_samples_with_loops(&self) -> u64 {
        u64::from(self.pre_trigger_samples)
            + u64::from(self.post_trigger_samples) * (u64::from(self.loop_count) + 1)
    }

    /// Physical channel numbers in selection order.
    pub fn channel_numbers(&self) -> Vec<u16> {
        self.capture_channels
            .iter()
            .map(|c| c.channel_number)
            .collect()
    }

    /// True when a trigger type and channel are both set.
    pub fn has_trigger(&self) -> bool {
        self.trigger_type != TriggerType::None && self.trigger_channel.is_some()
    }

    /// Same settings and channel selection, without any captured samples.
    pub fn clone_settings(&self) -> Self {
        let mut copy = self.clone();
        for channel in &mut copy.capture_channels {
            channel.samples = None;
        }
        copy.bursts = None;
        copy
    }

    /// Check the invariants every driver relies on: at least one sample, at
    /// least one channel, unique channel numbers.
    pub fn validate_structure(&self) -> Result<(), CaptureError> {
        if self.total_samples() < 1 {
            return Err(CaptureError::BadParams(
                "capture must request at least one sample".into(),
            ));
        }
        if self.capture_channels.is_empty() {
            return Err(CaptureError::BadParams(
                "capture must select at least one channel".into(),
            ));
        }
        let mut seen = HashSet::new();
        for channel in &self.capture_channels {
            if !seen.insert(channel.channel_number) {
                return Err(CaptureError::BadParams(format!(
                    "channel {} selected more than once",
                    channel.channel_number
                )));
            }
        }
        if self.frequency == 0 {
            return Err(CaptureError::BadParams("frequency must be non-zero".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Capture Mode & Limits
// =============================================================================

/// Channel grouping used by the binary-protocol hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureMode {
    Channels8,
    Channels16,
    Channels24,
}

impl CaptureMode {
    /// Select the mode from the highest channel index in use.
    pub fn for_channels(channels: &[u16]) -> Self {
        match channels.iter().copied().max() {
            Some(max) if max >= 16 => CaptureMode::Channels24,
            Some(max) if max >= 8 => CaptureMode::Channels16,
            _ => CaptureMode::Channels8,
        }
    }

    /// Wire value used by the binary protocol.
    pub fn code(&self) -> u8 {
        match self {
            CaptureMode::Channels8 => 0,
            CaptureMode::Channels16 => 1,
            CaptureMode::Channels24 => 2,
        }
    }

    /// Bytes the device sends per sample in this mode.
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            CaptureMode::Channels8 => 1,
            CaptureMode::Channels16 => 2,
            CaptureMode::Channels24 => 4,
        }
    }

    pub fn channel_count(&self) -> u16 {
        match self {
            CaptureMode::Channels8 => 8,
            CaptureMode::Channels16 => 16,
            CaptureMode::Channels24 => 24,
        }
    }

    pub fn all() -> [CaptureMode; 3] {
        [
            CaptureMode::Channels8,
            CaptureMode::Channels16,
            CaptureMode::Channels24,
        ]
    }
}

/// Sample-count limits for one capture mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureLimits {
    pub min_pre_samples: u32,
    pub max_pre_samples: u32,
    pub min_post_samples: u32,
    pub max_post_samples: u32,
    pub max_total_samples: u32,
}

impl CaptureLimits {
    /// Limits for `mode` on a device with `buffer_size` bytes of sample memory.
    pub fn for_mode(mode: CaptureMode, buffer_size: u32) -> Self {
        let usable = buffer_size / mode.bytes_per_sample() as u32;
        Self {
            min_pre_samples: MIN_TRIGGER_SAMPLES,
            max_pre_samples: usable / 10,
            min_post_samples: MIN_TRIGGER_SAMPLES,
            max_post_samples: usable.saturating_sub(MIN_TRIGGER_SAMPLES),
            max_total_samples: usable,
        }
    }

    /// Limits for a streaming device that is only bounded by its buffer.
    pub fn unbounded(buffer_size: u32) -> Self {
        Self {
            min_pre_samples: 0,
            max_pre_samples: buffer_size,
            min_post_samples: 1,
            max_post_samples: buffer_size,
            max_total_samples: buffer_size,
        }
    }

    /// Check a session's trigger window against these limits.
    pub fn check(&self, session: &CaptureSession) -> Result<(), CaptureError> {
        let pre = session.pre_trigger_samples;
        let post = session.post_trigger_samples;
        if pre < self.min_pre_samples || pre > self.max_pre_samples {
            return Err(CaptureError::BadParams(format!(
                "pre-trigger samples {} outside {}..={}",
                pre, self.min_pre_samples, self.max_pre_samples
            )));
        }
        if post < self.min_post_samples || post > self.max_post_samples {
            return Err(CaptureError::BadParams(format!(
                "post-trigger samples {} outside {}..={}",
                post, self.min_post_samples, self.max_post_samples
            )));
        }
        if session.total_samples() > u64::from(self.max_total_samples) {
            return Err(CaptureError::BadParams(format!(
                "total samples {} exceed device limit {}",
                session.total_samples(),
                self.max_total_samples
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_mode_selection() {
        assert_eq!(CaptureMode::for_channels(&[0, 1, 2, 3]), CaptureMode::Channels8);
        assert_eq!(
            CaptureMode::for_channels(&[0, 1, 2, 3, 8, 9, 10, 11]),
            CaptureMode::Channels16
        );
        assert_eq!(
            CaptureMode::for_channels(&[0, 1, 2, 3, 16, 17, 18, 19]),
            CaptureMode::Channels24
        );
        assert_eq!(CaptureMode::for_channels(&[]), CaptureMode::Channels8);
        assert_eq!(CaptureMode::for_channels(&[7]), CaptureMode::Channels8);
        assert_eq!(CaptureMode::for_channels(&[15]), CaptureMode::Channels16);
    }

    #[test]
    fn test_limits_scale_with_mode() {
        let l8 = CaptureLimits::for_mode(CaptureMode::Channels8, 131_072);
        let l16 = CaptureLimits::for_mode(CaptureMode::Channels16, 131_072);
        let l24 = CaptureLimits::for_mode(CaptureMode::Channels24, 131_072);
        assert_eq!(l8.max_total_samples, 131_072);
        assert_eq!(l16.max_total_samples, 65_536);
        assert_eq!(l24.max_total_samples, 32_768);
        assert_eq!(l8.max_pre_samples, 13_107);
        assert_eq!(l24.max_post_samples, 32_766);
    }

    #[test]
    fn test_total_samples() {
        let session = CaptureSession::new(1_000_000, 100, 900);
        assert_eq!(session.total_samples(), 1000);
        let looped = session.with_bursts(3, false);
        assert_eq!(looped.total_samples_with_loops(), 100 + 900 * 4);
    }

    #[test]
    fn test_validate_structure() {
        let empty = CaptureSession::new(1_000_000, 10, 10);
        assert!(matches!(
            empty.validate_structure(),
            Err(CaptureError::BadParams(_))
        ));

        let duplicate = CaptureSession::new(1_000_000, 10, 10).with_channels([1, 2, 1]);
        assert!(duplicate.validate_structure().is_err());

        let zero = CaptureSession::new(1_000_000, 0, 0).with_channels([0]);
        assert!(zero.validate_structure().is_err());

        let ok = CaptureSession::new(1_000_000, 10, 10).with_channels([0, 5, 3]);
        assert!(ok.validate_structure().is_ok());
        assert_eq!(ok.channel_numbers(), vec![0, 5, 3]);
    }

    #[test]
    fn test_clone_settings_drops_samples() {
        let mut session = CaptureSession::new(1_000, 2, 2).with_channels([0, 1]);
        session.capture_channels[0].samples = Some(vec![0, 1, 1, 0]);
        let copy = session.clone_settings();
        assert!(copy.capture_channels.iter().all(|c| c.samples.is_none()));
        assert_eq!(copy.channel_numbers(), session.channel_numbers());
    }

    #[test]
    fn test_limits_check() {
        let limits = CaptureLimits::for_mode(CaptureMode::Channels8, 1000);
        let ok = CaptureSession::new(1_000, 50, 500).with_channels([0]);
        assert!(limits.check(&ok).is_ok());
        let too_much_pre = CaptureSession::new(1_000, 200, 500).with_channels([0]);
        assert!(limits.check(&too_much_pre).is_err());
        let too_few_post = CaptureSession::new(1_000, 10, 1).with_channels([0]);
        assert!(limits.check(&too_few_post).is_err());
    }
}
