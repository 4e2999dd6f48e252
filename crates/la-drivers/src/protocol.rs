//! Binary wire protocol of the serial/TCP logic analyzer boards.
//!
//! ## Framing
//!
//! Every request is wrapped as
//!
//! ```text
//! 0x55 0xAA <escaped payload> 0xAA 0x55
//! ```
//!
//! Inside the payload the bytes `0xAA`, `0x55` and `0xF0` are sent as
//! `0xF0, byte ^ 0xF0`. Payload byte 0 selects the command. A single unframed
//! `0xFF` aborts a running capture.
//!
//! ## Responses
//!
//! Text responses are newline-terminated ASCII lines. Captured samples arrive
//! as a raw little-endian block after the trigger fires:
//!
//! ```text
//! u32 sample_count
//! sample_count × {1,2,4} bytes        (by capture mode)
//! u8  timestamp_flag
//! (loop_count + 2) × u32              (only when the flag is set and loops > 0)
//! ```

use anyhow::{bail, Context, Result};
use la_core::capture::{BurstInfo, CaptureMode, CaptureSession, TriggerType};
use la_core::limits::MAX_CAPTURE_BYTES;
use tokio::io::{AsyncRead, AsyncReadExt};

const FRAME_START: [u8; 2] = [0x55, 0xAA];
const FRAME_END: [u8; 2] = [0xAA, 0x55];
const ESCAPE: u8 = 0xF0;

/// Unframed byte that aborts a running capture.
pub const ABORT_BYTE: u8 = 0xFF;

/// Number of channel slots in a capture request.
pub const CHANNEL_SLOTS: usize = 24;

/// Encoded length of [`CaptureRequest`].
pub const CAPTURE_REQUEST_LEN: usize = 45;

/// Acknowledgement lines sent by the firmware.
pub mod replies {
    pub const CAPTURE_STARTED: &str = "CAPTURE_STARTED";
    pub const SETTINGS_SAVED: &str = "SETTINGS_SAVED";
    pub const RESTARTING_BOOTLOADER: &str = "RESTARTING_BOOTLOADER";
}

// =============================================================================
// Commands
// =============================================================================

/// Request opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Identify = 0,
    Capture = 1,
    NetworkConfig = 2,
    VoltageStatus = 3,
    EnterBootloader = 4,
}

/// Wrap a payload in start/end markers, escaping reserved bytes.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.extend_from_slice(&FRAME_START);
    for &byte in payload {
        if matches!(byte, 0xAA | 0x55 | ESCAPE) {
            frame.push(ESCAPE);
            frame.push(byte ^ ESCAPE);
        } else {
            frame.push(byte);
        }
    }
    frame.extend_from_slice(&FRAME_END);
    frame
}

/// Inverse of [`encode_frame`], mostly for fake devices in tests.
pub fn decode_frame(frame: &[u8]) -> Result<Vec<u8>> {
    if frame.len() < 4 || frame[..2] != FRAME_START || frame[frame.len() - 2..] != FRAME_END {
        bail!("frame is missing start or end markers");
    }
    let body = &frame[2..frame.len() - 2];
    let mut payload = Vec::with_capacity(body.len());
    let mut bytes = body.iter();
    while let Some(&byte) = bytes.next() {
        if byte == ESCAPE {
            let escaped = bytes.next().context("frame ends inside an escape sequence")?;
            payload.push(escaped ^ ESCAPE);
        } else {
            payload.push(byte);
        }
    }
    Ok(payload)
}

/// A framed command with no arguments.
pub fn simple_command(command: Command) -> Vec<u8> {
    encode_frame(&[command as u8])
}

// =============================================================================
// Capture Request
// =============================================================================

/// Packed capture request as the firmware expects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub trigger_type: u8,
    pub trigger_channel: u8,
    /// Edge triggers: inverted flag. Pattern triggers: pattern width.
    pub inverted_or_count: u8,
    pub trigger_value: u16,
    pub channels: [u8; CHANNEL_SLOTS],
    pub channel_count: u8,
    pub frequency: u32,
    pub pre_samples: u32,
    pub post_samples: u32,
    pub loop_count: u8,
    pub measure: u8,
    pub capture_mode: u8,
}

impl CaptureRequest {
    /// Build a request from a session that has already been validated.
    pub fn from_session(session: &CaptureSession) -> Result<Self> {
        let numbers = session.channel_numbers();
        if numbers.len() > CHANNEL_SLOTS {
            bail!("at most {} channels can be captured", CHANNEL_SLOTS);
        }
        let mut channels = [0u8; CHANNEL_SLOTS];
        for (slot, number) in channels.iter_mut().zip(&numbers) {
            *slot = u8::try_from(*number).context("channel number out of range")?;
        }

        let trigger_channel = u8::try_from(session.trigger_channel.unwrap_or(0))
            .context("trigger channel out of range")?;
        let (inverted_or_count, trigger_value) = match session.trigger_type {
            TriggerType::Complex | TriggerType::Fast => {
                (session.trigger_bit_count, session.trigger_pattern)
            }
            _ => (u8::from(session.trigger_inverted), 0),
        };

        Ok(Self {
            trigger_type: session.trigger_type.code(),
            trigger_channel,
            inverted_or_count,
            trigger_value,
            channels,
            channel_count: numbers.len() as u8,
            frequency: u32::try_from(session.frequency).context("frequency out of range")?,
            pre_samples: session.pre_trigger_samples,
            post_samples: session.post_trigger_samples,
            loop_count: u8::try_from(session.loop_count).context("loop count out of range")?,
            measure: u8::from(session.measure_bursts),
            capture_mode: CaptureMode::for_channels(&numbers).code(),
        })
    }

    /// Little-endian packed encoding, [`CAPTURE_REQUEST_LEN`] bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CAPTURE_REQUEST_LEN);
        out.push(self.trigger_type);
        out.push(self.trigger_channel);
        out.push(self.inverted_or_count);
        out.extend_from_slice(&self.trigger_value.to_le_bytes());
        out.extend_from_slice(&self.channels);
        out.push(self.channel_count);
        out.extend_from_slice(&self.frequency.to_le_bytes());
        out.extend_from_slice(&self.pre_samples.to_le_bytes());
        out.extend_from_slice(&self.post_samples.to_le_bytes());
        out.push(self.loop_count);
        out.push(self.measure);
        out.push(self.capture_mode);
        out
    }

    /// Framed capture command.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut payload = vec![Command::Capture as u8];
        payload.extend_from_slice(&self.to_bytes());
        encode_frame(&payload)
    }
}

// =============================================================================
// Network Settings
// =============================================================================

/// WiFi settings stored on the board by the network-configuration command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSettings {
    pub ssid: String,
    pub password: String,
    pub ip_address: String,
    pub port: u16,
}

impl NetworkSettings {
    const SSID_LEN: usize = 33;
    const PASSWORD_LEN: usize = 64;
    const IP_LEN: usize = 16;

    /// Framed network-configuration command with NUL-padded fixed fields.
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        let mut payload = vec![Command::NetworkConfig as u8];
        push_fixed(&mut payload, &self.ssid, Self::SSID_LEN, "ssid")?;
        push_fixed(&mut payload, &self.password, Self::PASSWORD_LEN, "password")?;
        push_fixed(&mut payload, &self.ip_address, Self::IP_LEN, "ip address")?;
        payload.extend_from_slice(&self.port.to_le_bytes());
        Ok(encode_frame(&payload))
    }
}

fn push_fixed(out: &mut Vec<u8>, value: &str, len: usize, field: &str) -> Result<()> {
    let bytes = value.as_bytes();
    // One byte is reserved for the terminating NUL.
    if bytes.len() >= len {
        bail!("{} is longer than {} bytes", field, len - 1);
    }
    out.extend_from_slice(bytes);
    out.resize(out.len() + (len - bytes.len()), 0);
    Ok(())
}

// =============================================================================
// Identify Response
// =============================================================================

/// Parsed reply to the identify command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyResponse {
    pub version: String,
    pub max_frequency: u64,
    pub blast_frequency: u64,
    pub buffer_size: u32,
    pub channel_count: u32,
}

impl IdentifyResponse {
    /// Parse the five identify lines: version, `FREQ:`, `BLASTFREQ:`,
    /// `BUFFER:`, `CHANNELS:`.
    pub fn parse(lines: &[String]) -> Result<Self> {
        let [version, freq, blast, buffer, channels] = lines else {
            bail!("expected 5 identify lines, got {}", lines.len());
        };
        Ok(Self {
            version: version.trim().to_string(),
            max_frequency: tagged_value(freq, "FREQ")?,
            blast_frequency: tagged_value(blast, "BLASTFREQ")?,
            buffer_size: tagged_value(buffer, "BUFFER")?,
            channel_count: tagged_value(channels, "CHANNELS")?,
        })
    }
}

fn tagged_value<T: std::str::FromStr>(line: &str, tag: &str) -> Result<T> {
    let value = line
        .trim()
        .strip_prefix(tag)
        .and_then(|rest| rest.strip_prefix(':'))
        .with_context(|| format!("expected '{}:<value>', got '{}'", tag, line.trim()))?;
    value
        .trim()
        .parse::<T>()
        .map_err(|_| anyhow::anyhow!("invalid {} value '{}'", tag, value.trim()))
}

/// Parse a voltage status line such as `4.12` or `4.12V`.
pub fn parse_voltage(line: &str) -> Option<f32> {
    let trimmed = line.trim().trim_end_matches(['V', 'v']);
    let value = trimmed.rsplit(':').next().unwrap_or(trimmed).trim();
    value.parse::<f32>().ok()
}

// =============================================================================
// Capture Data
// =============================================================================

/// Raw capture block as read from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCapture {
    /// One word per sample, channel `n` at bit `n`.
    pub samples: Vec<u32>,
    /// Burst timestamps, empty unless requested.
    pub timestamps: Vec<u32>,
}

/// Read the capture block that follows `CAPTURE_STARTED`.
pub async fn read_capture<R: AsyncRead + Unpin>(
    reader: &mut R,
    mode: CaptureMode,
    loop_count: u32,
) -> Result<RawCapture> {
    let count = reader
        .read_u32_le()
        .await
        .context("failed to read sample count")? as usize;
    let bytes_per_sample = mode.bytes_per_sample();
    let total = count
        .checked_mul(bytes_per_sample)
        .filter(|n| *n <= MAX_CAPTURE_BYTES)
        .with_context(|| format!("device announced an oversized capture ({} samples)", count))?;

    let mut raw = vec![0u8; total];
    reader
        .read_exact(&mut raw)
        .await
        .context("capture data ended early")?;

    let samples = raw
        .chunks_exact(bytes_per_sample)
        .map(|chunk| {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            u32::from_le_bytes(word)
        })
        .collect();

    let flag = reader
        .read_u8()
        .await
        .context("failed to read timestamp flag")?;
    let mut timestamps = Vec::new();
    if flag > 0 && loop_count > 0 {
        for _ in 0..loop_count + 2 {
            timestamps.push(
                reader
                    .read_u32_le()
                    .await
                    .context("burst timestamps ended early")?,
            );
        }
    }

    Ok(RawCapture {
        samples,
        timestamps,
    })
}

/// Split raw sample words into the session's per-channel 0/1 buffers.
pub fn demux_samples(session: &mut CaptureSession, samples: &[u32]) {
    for channel in &mut session.capture_channels {
        let bit = u32::from(channel.channel_number);
        let values = samples
            .iter()
            .map(|word| word.checked_shr(bit).map_or(0, |w| (w & 1) as u8))
            .collect();
        channel.samples = Some(values);
    }
}

/// Turn burst timestamps (nanoseconds) into per-burst sample ranges.
///
/// `timestamps[0]` marks arming, `timestamps[k + 1]` the end of burst `k`.
pub fn decode_bursts(session: &CaptureSession, timestamps: &[u32]) -> Vec<BurstInfo> {
    if timestamps.len() < 2 || session.frequency == 0 {
        return Vec::new();
    }
    let pre = u64::from(session.pre_trigger_samples);
    let post = u64::from(session.post_trigger_samples);
    let burst_ns = post.saturating_mul(1_000_000_000) / session.frequency;

    timestamps
        .windows(2)
        .enumerate()
        .map(|(k, pair)| {
            let k = k as u64;
            let start = if k == 0 { 0 } else { pre + k * post };
            let end = pre + (k + 1) * post;
            let elapsed = u64::from(pair[1].wrapping_sub(pair[0]));
            let time_gap = if k == 0 {
                0
            } else {
                elapsed.saturating_sub(burst_ns)
            };
            BurstInfo {
                burst_sample_start: start,
                burst_sample_end: end,
                burst_sample_gap: time_gap.saturating_mul(session.frequency) / 1_000_000_000,
                burst_time_gap: time_gap,
            }
        })
        .collect()
}
