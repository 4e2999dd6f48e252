//! Binary-protocol logic analyzer over USB serial or TCP.
//!
//! Both transports speak the protocol in [`crate::protocol`]; they differ only
//! in how the byte stream is opened and in a few board features (battery
//! voltage is reported by network boards, WiFi settings are written over
//! serial).
//!
//! The stream is split once at connect time. The capture task owns the read
//! half for the duration of a capture while `stop_capture` can still write the
//! abort byte through the write half.

use crate::address::Endpoint;
use crate::protocol::{
    self, replies, CaptureRequest, Command, IdentifyResponse, NetworkSettings, ABORT_BYTE,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use la_core::capabilities::{Connectivity, DeviceCapabilities, TriggerCapabilities};
use la_core::capture::{
    CaptureLimits, CaptureMode, CaptureSession, TriggerType, EXTERNAL_TRIGGER_CHANNEL,
    MAX_LOOP_COUNT,
};
use la_core::completion::{CaptureHandle, CaptureRejection};
use la_core::driver::{
    AnalyzerDriver, ConnectionParams, ConnectionResult, DeviceStatus, DriverType,
};
use la_core::error::{require_connection_string, CaptureError, ConnectError, DriverConstructionError};
use la_core::limits::{COMMAND_TIMEOUT, DRAIN_TIMEOUT, MAX_LINE_BYTES};
use la_core::state::DriverState;
use la_core::stream::{DynStream, LineReader};
use la_core::version::VersionValidator;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::instrument;

type Reader = Arc<Mutex<LineReader<ReadHalf<DynStream>>>>;
type Writer = Arc<Mutex<WriteHalf<DynStream>>>;

/// How the board is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalyzerTransport {
    /// Serial device path, e.g. `/dev/ttyACM0` or `COM3`.
    Serial { port: String },
    /// TCP endpoint of a WiFi/Ethernet board.
    Network { endpoint: Endpoint },
}

#[derive(Clone)]
struct Link {
    reader: Reader,
    writer: Writer,
}

impl Link {
    fn new(stream: DynStream) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: Arc::new(Mutex::new(LineReader::new(read))),
            writer: Arc::new(Mutex::new(write)),
        }
    }

    async fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await.context("write to device failed")?;
        writer.flush().await.context("flush to device failed")?;
        Ok(())
    }

    /// Send a frame and collect `lines` non-empty reply lines.
    async fn exchange(&self, frame: &[u8], lines: usize, timeout: Duration) -> Result<Vec<String>> {
        let mut reader = self.reader.lock().await;
        reader.discard_stale();
        self.send(frame).await?;
        let mut replies = Vec::with_capacity(lines);
        for _ in 0..lines {
            let line = tokio::time::timeout(timeout, reader.read_nonempty_line(MAX_LINE_BYTES))
                .await
                .context("timed out waiting for device reply")??;
            replies.push(line.trim().to_string());
        }
        Ok(replies)
    }
}

/// Driver for the binary-protocol analyzer boards.
pub struct LogicAnalyzerDriver {
    transport: AnalyzerTransport,
    state: Arc<DriverState>,
    link: parking_lot::Mutex<Option<Link>>,
}

impl LogicAnalyzerDriver {
    /// Driver for a board on a serial port.
    pub fn serial(port: &str) -> Result<Self, DriverConstructionError> {
        let port = require_connection_string(port)?;
        Ok(Self::with_transport(AnalyzerTransport::Serial {
            port: port.to_string(),
        }))
    }

    /// Driver for a board at `host:port`.
    pub fn network(connection: &str) -> Result<Self, DriverConstructionError> {
        let endpoint = Endpoint::parse(connection, None)?;
        Ok(Self::with_transport(AnalyzerTransport::Network { endpoint }))
    }

    fn with_transport(transport: AnalyzerTransport) -> Self {
        Self {
            transport,
            state: DriverState::new(),
            link: parking_lot::Mutex::new(None),
        }
    }

    pub fn transport(&self) -> &AnalyzerTransport {
        &self.transport
    }

    fn current_link(&self) -> Option<Link> {
        self.link.lock().clone()
    }

    fn device_label(&self) -> String {
        match &self.transport {
            AnalyzerTransport::Serial { port } => format!("Logic Analyzer ({})", port),
            AnalyzerTransport::Network { endpoint } => format!("Logic Analyzer ({})", endpoint),
        }
    }

    async fn open(&self, params: &ConnectionParams) -> Result<DynStream> {
        match &self.transport {
            #[cfg(feature = "serial")]
            AnalyzerTransport::Serial { port } => {
                let baud = params
                    .baud_rate
                    .unwrap_or(la_core::limits::ANALYZER_BAUD_RATE);
                let stream = la_core::stream::open_serial_async(port, baud, "logic analyzer").await?;
                Ok(Box::new(stream))
            }
            #[cfg(not(feature = "serial"))]
            AnalyzerTransport::Serial { port } => {
                anyhow::bail!("serial support is not compiled in (port {})", port)
            }
            AnalyzerTransport::Network { endpoint } => {
                let port = endpoint.socket_port()?;
                let stream = tokio::time::timeout(
                    params.timeout,
                    tokio::net::TcpStream::connect((endpoint.host.as_str(), port)),
                )
                .await
                .with_context(|| format!("connection timeout to {}", endpoint))?
                .with_context(|| format!("failed to connect to {}", endpoint))?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }

    /// Negotiate with a board over an already-open stream.
    ///
    /// `connect` calls this after opening the transport; tests hand in an
    /// in-memory pipe.
    pub async fn attach(
        &self,
        stream: DynStream,
        timeout: Duration,
    ) -> Result<ConnectionResult, ConnectError> {
        if self.state.is_connected() {
            return Err(ConnectError::AlreadyConnected);
        }
        let link = Link::new(stream);

        let version_line = link
            .exchange(&protocol::simple_command(Command::Identify), 1, timeout)
            .await
            .map_err(ConnectError::from_anyhow)?
            .remove(0);

        let version = VersionValidator::parse(Some(&version_line));
        let minimum = VersionValidator::minimum_supported();
        if !VersionValidator::meets_minimum(&version, &minimum) {
            tracing::warn!(version = %version_line, "rejecting unsupported firmware");
            return Err(ConnectError::VersionMismatch {
                found: version,
                minimum,
            });
        }

        let mut lines = vec![version_line];
        {
            let mut reader = link.reader.lock().await;
            for _ in 0..4 {
                let line = reader
                    .read_line_timeout(MAX_LINE_BYTES, timeout)
                    .await
                    .map_err(ConnectError::from_anyhow)?;
                lines.push(line.trim().to_string());
            }
        }
        let identity = IdentifyResponse::parse(&lines)
            .map_err(|e| ConnectError::Protocol(format!("{:#}", e)))?;

        let capabilities = self.build_capabilities(&identity);
        let device_name = self.device_label();
        *self.link.lock() = Some(link);
        self.state
            .mark_connected(&device_name, Some(identity.version.clone()), capabilities.clone());

        tracing::info!(
            device = %device_name,
            version = %identity.version,
            channels = identity.channel_count,
            "logic analyzer connected"
        );

        Ok(ConnectionResult {
            device_name,
            device_version: Some(identity.version),
            capabilities,
        })
    }

    fn build_capabilities(&self, identity: &IdentifyResponse) -> DeviceCapabilities {
        let connectivity = match self.transport {
            AnalyzerTransport::Serial { .. } => Connectivity::new(&["usb"], &["binary"]),
            AnalyzerTransport::Network { .. } => Connectivity::new(&["wifi", "ethernet"], &["binary"]),
        };
        DeviceCapabilities {
            channel_count: identity.channel_count,
            min_frequency: DeviceCapabilities::derive_min_frequency(identity.max_frequency),
            max_frequency: identity.max_frequency,
            blast_frequency: identity.blast_frequency,
            buffer_size: identity.buffer_size,
            capture_modes: DeviceCapabilities::modes_for_channel_count(identity.channel_count),
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
            connectivity,
        }
    }

    /// Store WiFi settings on a serial-attached board.
    ///
    /// Returns `false` for network boards, while capturing, or when the board
    /// does not confirm with `SETTINGS_SAVED`.
    pub async fn send_network_config(&self, settings: &NetworkSettings) -> bool {
        if !matches!(self.transport, AnalyzerTransport::Serial { .. }) || self.state.is_capturing() {
            return false;
        }
        let Some(link) = self.current_link() else {
            return false;
        };
        let result = async {
            let frame = settings.to_frame()?;
            link.exchange(&frame, 1, COMMAND_TIMEOUT).await
        }
        .await;
        match result {
            Ok(lines) => lines.first().map(String::as_str) == Some(replies::SETTINGS_SAVED),
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "network configuration failed");
                false
            }
        }
    }

    async fn query_voltage(&self) -> Option<f32> {
        let link = self.current_link()?;
        let frame = protocol::simple_command(Command::VoltageStatus);
        match link.exchange(&frame, 1, COMMAND_TIMEOUT).await {
            Ok(lines) => lines.first().and_then(|l| protocol::parse_voltage(l)),
            Err(e) => {
                tracing::debug!(error = %format!("{:#}", e), "voltage query failed");
                None
            }
        }
    }
}

/// Check a session against what the board reported at connect time.
pub fn validate_session(
    session: &CaptureSession,
    caps: &DeviceCapabilities,
) -> Result<(), CaptureError> {
    session.validate_structure()?;

    let numbers = session.channel_numbers();
    if let Some(bad) = numbers.iter().find(|n| u32::from(**n) >= caps.channel_count) {
        return Err(CaptureError::BadParams(format!(
            "channel {} does not exist on a {}-channel device",
            bad, caps.channel_count
        )));
    }

    let mode = CaptureMode::for_channels(&numbers);
    let limits = CaptureLimits::for_mode(mode, caps.buffer_size);
    let blast = session.trigger_type == TriggerType::Blast;

    let max_frequency = if blast {
        caps.blast_frequency
    } else {
        caps.max_frequency
    };
    if session.frequency < caps.min_frequency || session.frequency > max_frequency {
        return Err(CaptureError::BadParams(format!(
            "frequency {} Hz outside {}..={} Hz",
            session.frequency, caps.min_frequency, max_frequency
        )));
    }

    if blast {
        if session.pre_trigger_samples != 0 || session.loop_count != 0 || session.measure_bursts {
            return Err(CaptureError::BadParams(
                "blast captures take no pre-trigger samples and no loops".into(),
            ));
        }
        if session.total_samples() > u64::from(limits.max_total_samples) {
            return Err(CaptureError::BadParams(format!(
                "total samples {} exceed device limit {}",
                session.total_samples(),
                limits.max_total_samples
            )));
        }
    } else {
        limits.check(session)?;
    }

    if session.loop_count > MAX_LOOP_COUNT {
        return Err(CaptureError::BadParams(format!(
            "loop count {} exceeds {}",
            session.loop_count, MAX_LOOP_COUNT
        )));
    }
    if session.loop_count > 0 {
        let looped = session.total_samples_with_loops();
        if looped > u64::from(limits.max_total_samples) {
            return Err(CaptureError::BadParams(format!(
                "{} looped samples exceed device limit {}",
                looped, limits.max_total_samples
            )));
        }
    }

    match session.trigger_type {
        TriggerType::Edge | TriggerType::Blast => {
            let channel = session.trigger_channel.ok_or_else(|| {
                CaptureError::BadParams("edge trigger needs a trigger channel".into())
            })?;
            if u32::from(channel) >= caps.channel_count && channel != EXTERNAL_TRIGGER_CHANNEL {
                return Err(CaptureError::BadParams(format!(
                    "trigger channel {} does not exist",
                    channel
                )));
            }
        }
        TriggerType::Complex | TriggerType::Fast => {
            let max_width = session.trigger_type.max_pattern_width().unwrap_or(0);
            let first = session.trigger_channel.unwrap_or(0);
            let width = session.trigger_bit_count;
            if width < 1 || width > max_width {
                return Err(CaptureError::BadParams(format!(
                    "pattern width {} outside 1..={}",
                    width, max_width
                )));
            }
            if u32::from(first) + u32::from(width) > 16 {
                return Err(CaptureError::BadParams(format!(
                    "pattern starting at channel {} with width {} exceeds the 16-bit pattern field",
                    first, width
                )));
            }
        }
        TriggerType::None => {}
    }

    Ok(())
}

#[async_trait]
impl AnalyzerDriver for LogicAnalyzerDriver {
    fn state(&self) -> &Arc<DriverState> {
        &self.state
    }

    fn driver_type(&self) -> DriverType {
        match self.transport {
            AnalyzerTransport::Serial { .. } => DriverType::Serial,
            AnalyzerTransport::Network { .. } => DriverType::Network,
        }
    }

    fn is_network(&self) -> bool {
        matches!(self.transport, AnalyzerTransport::Network { .. })
    }

    #[instrument(skip(self, params), fields(device = %self.device_label()))]
    async fn connect(&self, params: &ConnectionParams) -> Result<ConnectionResult, ConnectError> {
        if self.state.is_connected() {
            return Err(ConnectError::AlreadyConnected);
        }
        let stream = self.open(params).await.map_err(ConnectError::from_anyhow)?;
        self.attach(stream, params.timeout).await
    }

    async fn disconnect(&self) {
        self.state.mark_disconnected();
        let link = self.link.lock().take();
        if let Some(link) = link {
            let mut writer = link.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(error = %e, "error closing analyzer stream");
            }
            tracing::info!(device = %self.device_label(), "logic analyzer disconnected");
        }
    }

    #[instrument(skip_all, fields(device = %self.device_label()))]
    async fn start_capture(
        &self,
        session: CaptureSession,
    ) -> Result<CaptureHandle, CaptureRejection> {
        let (ticket, handle) = self.state.begin_capture(session)?;

        let (Some(caps), Some(link)) = (self.state.capabilities(), self.current_link()) else {
            return Err(ticket.reject(CaptureError::not_connected()));
        };
        if let Err(e) = validate_session(ticket.session(), &caps) {
            return Err(ticket.reject(e));
        }
        let request = match CaptureRequest::from_session(ticket.session()) {
            Ok(request) => request,
            Err(e) => return Err(ticket.reject(CaptureError::BadParams(format!("{:#}", e)))),
        };
        let mode = CaptureMode::for_channels(&ticket.session().channel_numbers());
        let loop_count = ticket.session().loop_count;

        // Arm while holding the read half, then hand it to the capture task.
        let mut reader = link.reader.clone().lock_owned().await;
        reader.discard_stale();
        let armed = async {
            link.send(&request.to_frame()).await?;
            reader.read_line_timeout(MAX_LINE_BYTES, COMMAND_TIMEOUT).await
        }
        .await;
        match armed {
            Ok(line) if line.trim() == replies::CAPTURE_STARTED => {}
            Ok(line) => {
                return Err(ticket.reject(CaptureError::HardwareError(format!(
                    "device refused capture: {}",
                    line.trim()
                ))))
            }
            Err(e) => return Err(ticket.reject(CaptureError::unexpected(format!("{:#}", e)))),
        }

        let capture_id = ticket.capture_id();
        tracing::info!(capture_id, mode = ?mode, "capture armed");

        let task = tokio::spawn(async move {
            let mut ticket = ticket;
            match protocol::read_capture(reader.buffered(), mode, loop_count).await {
                Ok(raw) => {
                    let session = ticket.session_mut();
                    protocol::demux_samples(session, &raw.samples);
                    if session.measure_bursts && !raw.timestamps.is_empty() {
                        session.bursts = Some(protocol::decode_bursts(session, &raw.timestamps));
                    }
                    ticket.complete();
                }
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
        let Some(link) = self.current_link() else {
            return true;
        };

        let accepted = match link.send(&[ABORT_BYTE]).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "failed to send abort");
                false
            }
        };
        self.state.abort_capture_task();

        let mut reader = link.reader.lock().await;
        reader.drain(DRAIN_TIMEOUT).await;
        accepted
    }

    async fn enter_bootloader(&self) -> bool {
        if self.state.is_capturing() {
            return false;
        }
        let Some(link) = self.current_link() else {
            return false;
        };
        let frame = protocol::simple_command(Command::EnterBootloader);
        let ok = match link.exchange(&frame, 1, COMMAND_TIMEOUT).await {
            Ok(lines) => lines.first().map(String::as_str) == Some(replies::RESTARTING_BOOTLOADER),
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "bootloader request failed");
                false
            }
        };
        self.disconnect().await;
        ok
    }

    async fn get_status(&self) -> DeviceStatus {
        let battery_voltage = if self.is_network() && self.is_connected() && !self.is_capturing() {
            self.query_voltage().await
        } else {
            None
        };
        DeviceStatus {
            is_connected: self.is_connected(),
            is_capturing: self.is_capturing(),
            battery_voltage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};

    fn caps() -> DeviceCapabilities {
        DeviceCapabilities {
            channel_count: 24,
            min_frequency: 3051,
            max_frequency: 100_000_000,
            blast_frequency: 200_000_000,
            buffer_size: 131_072,
            capture_modes: CaptureMode::all().to_vec(),
            triggers: TriggerCapabilities::default(),
            connectivity: Connectivity::default(),
        }
    }

    async fn read_frame(device: &mut BufReader<DuplexStream>) -> Vec<u8> {
        let mut frame = Vec::new();
        loop {
            let byte = device.read_u8().await.unwrap();
            frame.push(byte);
            if frame.len() >= 4 && frame.ends_with(&[0xAA, 0x55]) {
                return protocol::decode_frame(&frame).unwrap();
            }
        }
    }

    const IDENTITY: &[u8] =
        b"LOGIC_ANALYZER_V6_5\nFREQ:100000000\nBLASTFREQ:200000000\nBUFFER:131072\nCHANNELS:24\n";

    async fn answer_identify(device: &mut BufReader<DuplexStream>) {
        let payload = read_frame(device).await;
        assert_eq!(payload, vec![Command::Identify as u8]);
        device.get_mut().write_all(IDENTITY).await.unwrap();
    }

    fn lab_network() -> NetworkSettings {
        NetworkSettings {
            ssid: "lab".into(),
            password: "secret".into(),
            ip_address: "192.168.4.1".into(),
            port: 4045,
        }
    }

    #[test]
    fn test_construction_rejects_empty() {
        assert!(LogicAnalyzerDriver::serial("  ").is_err());
        assert!(LogicAnalyzerDriver::network("").is_err());
        assert!(LogicAnalyzerDriver::network("10.0.0.1:99999").is_ok());
        assert!(LogicAnalyzerDriver::serial("/dev/ttyACM0").is_ok());
    }

    #[test]
    fn test_validate_session_limits() {
        let caps = caps();
        let ok = CaptureSession::new(1_000_000, 100, 1000)
            .with_channels([0, 1])
            .with_edge_trigger(0, false);
        assert!(validate_session(&ok, &caps).is_ok());

        let too_fast = CaptureSession::new(150_000_000, 100, 1000)
            .with_channels([0])
            .with_edge_trigger(0, false);
        assert!(matches!(
            validate_session(&too_fast, &caps),
            Err(CaptureError::BadParams(_))
        ));

        let blast = CaptureSession::new(150_000_000, 0, 1000)
            .with_channels([0])
            .with_pattern_trigger(TriggerType::Blast, 0, 0, 0);
        assert!(validate_session(&blast, &caps).is_ok());

        let missing_channel = CaptureSession::new(1_000_000, 100, 1000)
            .with_channels([30])
            .without_trigger();
        assert!(validate_session(&missing_channel, &caps).is_err());

        let external = CaptureSession::new(1_000_000, 100, 1000)
            .with_channels([0])
            .with_edge_trigger(EXTERNAL_TRIGGER_CHANNEL, false);
        assert!(validate_session(&external, &caps).is_ok());

        let wide_fast = CaptureSession::new(1_000_000, 100, 1000)
            .with_channels([0])
            .with_pattern_trigger(TriggerType::Fast, 0, 6, 0);
        assert!(validate_session(&wide_fast, &caps).is_err());

        let too_many_loops = CaptureSession::new(1_000_000, 10, 10)
            .with_channels([0])
            .with_edge_trigger(0, false)
            .with_bursts(255, false);
        assert!(validate_session(&too_many_loops, &caps).is_err());
    }

    #[tokio::test]
    async fn test_attach_rejects_old_firmware() {
        let (host, device) = tokio::io::duplex(1024);
        let fake = tokio::spawn(async move {
            let mut device = BufReader::new(device);
            let payload = read_frame(&mut device).await;
            assert_eq!(payload, vec![Command::Identify as u8]);
            device.get_mut().write_all(b"LOGIC_ANALYZER_V1_7\n").await.unwrap();
            device
        });

        let driver = LogicAnalyzerDriver::serial("/dev/null").unwrap();
        let err = driver
            .attach(Box::new(host), Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            ConnectError::VersionMismatch { found, .. } => {
                assert_eq!((found.major, found.minor), (1, 7));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(!driver.is_connected());
        fake.await.unwrap();
    }

    #[tokio::test]
    async fn test_capture_over_duplex() {
        let (host, device) = tokio::io::duplex(4096);
        let fake = tokio::spawn(async move {
            let mut device = BufReader::new(device);
            read_frame(&mut device).await;
            device
                .get_mut()
                .write_all(
                    b"LOGIC_ANALYZER_V6_5\nFREQ:100000000\nBLASTFREQ:200000000\nBUFFER:131072\nCHANNELS:24\n",
                )
                .await
                .unwrap();

            let payload = read_frame(&mut device).await;
            assert_eq!(payload[0], Command::Capture as u8);
            assert_eq!(payload.len(), 1 + protocol::CAPTURE_REQUEST_LEN);
            device.get_mut().write_all(b"CAPTURE_STARTED\n").await.unwrap();

            let mut block = Vec::new();
            block.extend_from_slice(&4u32.to_le_bytes());
            block.extend_from_slice(&[0b11, 0b01, 0b10, 0b00]);
            block.push(0);
            device.get_mut().write_all(&block).await.unwrap();

            // Keep the pipe open until the driver is done.
            let mut rest = String::new();
            let _ = device.read_line(&mut rest).await;
        });

        let driver = LogicAnalyzerDriver::serial("/dev/null").unwrap();
        let result = driver
            .attach(Box::new(host), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result.device_version.as_deref(), Some("LOGIC_ANALYZER_V6_5"));
        assert_eq!(driver.channel_count(), 24);
        assert_eq!(driver.min_frequency(), 3051);

        let session = CaptureSession::new(1_000_000, 2, 2)
            .with_channels([1, 0])
            .with_edge_trigger(0, false);
        let handle = driver.start_capture(session).await.unwrap();
        let completion = handle.wait().await.unwrap();
        assert!(completion.success);
        assert_eq!(completion.session.capture_channels[0].samples, Some(vec![1, 0, 1, 0]));
        assert_eq!(completion.session.capture_channels[1].samples, Some(vec![1, 1, 0, 0]));
        assert!(!driver.is_capturing());

        driver.disconnect().await;
        fake.await.unwrap();
    }

    #[tokio::test]
    async fn test_network_config_confirmed_by_board() {
        let (host, device) = tokio::io::duplex(1024);
        let fake = tokio::spawn(async move {
            let mut device = BufReader::new(device);
            answer_identify(&mut device).await;

            let payload = read_frame(&mut device).await;
            assert_eq!(payload[0], Command::NetworkConfig as u8);
            assert_eq!(&payload[1..4], b"lab");
            device.get_mut().write_all(b"SETTINGS_SAVED\n").await.unwrap();

            read_frame(&mut device).await;
            device.get_mut().write_all(b"ERROR\n").await.unwrap();

            let mut rest = Vec::new();
            let _ = device.read_to_end(&mut rest).await;
        });

        let driver = LogicAnalyzerDriver::serial("/dev/ttyACM0").unwrap();
        driver.attach(Box::new(host), Duration::from_secs(1)).await.unwrap();
        assert!(driver.send_network_config(&lab_network()).await);
        assert!(!driver.send_network_config(&lab_network()).await);

        driver.disconnect().await;
        fake.await.unwrap();
    }

    #[tokio::test]
    async fn test_network_config_refused_on_network_board() {
        let (host, device) = tokio::io::duplex(1024);
        let fake = tokio::spawn(async move {
            let mut device = BufReader::new(device);
            answer_identify(&mut device).await;
            let mut rest = Vec::new();
            let _ = device.read_to_end(&mut rest).await;
            rest
        });

        let driver = LogicAnalyzerDriver::network("192.168.4.1:4045").unwrap();
        driver.attach(Box::new(host), Duration::from_secs(1)).await.unwrap();
        assert!(driver.is_network());
        assert!(!driver.send_network_config(&lab_network()).await);

        driver.disconnect().await;
        // Nothing went out after the identify exchange.
        assert!(fake.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_capture_guards_on_serial_board() {
        let driver = LogicAnalyzerDriver::serial("/dev/ttyACM0").unwrap();
        assert!(driver.stop_capture().await);
        let session = CaptureSession::new(1_000_000, 2, 2)
            .with_channels([0])
            .with_edge_trigger(0, false);
        let rejected = driver.start_capture(session).await.unwrap_err();
        assert!(matches!(rejected.error, CaptureError::HardwareError(_)));
        assert_eq!(rejected.session.channel_numbers(), vec![0]);

        let (host, device) = tokio::io::duplex(4096);
        let fake = tokio::spawn(async move {
            let mut device = BufReader::new(device);
            answer_identify(&mut device).await;
            let payload = read_frame(&mut device).await;
            assert_eq!(payload[0], Command::Capture as u8);
            // Armed, but the trigger never fires.
            device.get_mut().write_all(b"CAPTURE_STARTED\n").await.unwrap();
            let mut rest = Vec::new();
            let _ = device.read_to_end(&mut rest).await;
            rest
        });
        driver.attach(Box::new(host), Duration::from_secs(1)).await.unwrap();

        let handle = driver.start_capture(rejected.session).await.unwrap();
        assert!(driver.is_capturing());
        let again = CaptureSession::new(1_000_000, 2, 2)
            .with_channels([0])
            .with_edge_trigger(0, false);
        assert!(matches!(
            driver.start_capture(again).await.unwrap_err().error,
            CaptureError::Busy
        ));
        assert!(!driver.send_network_config(&lab_network()).await);

        assert!(driver.stop_capture().await);
        let done = handle.wait().await.unwrap();
        assert!(!done.success);
        assert!(!driver.is_capturing());

        driver.disconnect().await;
        // Only the abort byte followed the capture request.
        assert_eq!(fake.await.unwrap(), vec![ABORT_BYTE]);
    }
}
