//! Hardware detection.
//!
//! Each [`DeviceDetector`] looks for one family of devices and reports
//! [`DeviceDescriptor`]s: candidates that have not been connected yet, tagged
//! with the kind of driver that should handle them and a confidence score.
//! Detectors never fail the whole scan; a detector error means "nothing found
//! here" and is logged by the caller.

use crate::config::HardwareConfig;
use anyhow::Result;
use async_trait::async_trait;
use la_drivers::address::Endpoint;
use la_drivers::rigol_siglent::ScopeVendor;
use la_drivers::saleae::JsonApiClient;
use la_drivers::scpi::{Identity, ScpiClient};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Driver-kind tags carried by descriptors and matched against
/// `DriverRegistration::supported_devices`.
pub mod tags {
    pub const SERIAL: &str = "serial";
    pub const NETWORK: &str = "network";
    pub const SCPI: &str = "scpi";
    pub const JSON_API: &str = "json-api";
    pub const SIGROK: &str = "sigrok";
    pub const EMULATED: &str = "emulated";
}

/// USB vendor id of the RP2040 boards the binary-protocol analyzer runs on.
const RP2040_VENDOR_ID: u16 = 0x2E8A;

/// A detected, not yet connected device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Stable key in the active-connection map.
    pub id: String,
    pub name: String,
    pub connection_string: String,
    /// One of [`tags`], or a custom tag for third-party drivers.
    pub driver_type: String,
    /// 0.0 to 1.0.
    pub confidence: f32,
}

impl DeviceDescriptor {
    pub fn new(
        name: impl Into<String>,
        connection_string: impl Into<String>,
        driver_type: impl Into<String>,
        confidence: f32,
    ) -> Self {
        let connection_string = connection_string.into();
        Self {
            id: connection_string.clone(),
            name: name.into(),
            connection_string,
            driver_type: driver_type.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// Descriptor for a connection string typed by a user, classified by shape.
    ///
    /// - `emulated[:n]` → emulated
    /// - `sigrok:…` → sigrok
    /// - `saleae` or `host:10430` → vendor JSON API
    /// - `host:5555` → SCPI
    /// - any other `host:port` → binary network analyzer
    /// - anything else is a serial port path
    pub fn from_connection_string(connection: &str) -> Self {
        let conn = connection.trim();
        let lower = conn.to_ascii_lowercase();
        let port_suffix = |port: u16| lower.ends_with(&format!(":{}", port));
        let kind = if lower == "emulated" || lower.starts_with("emulated:") {
            tags::EMULATED
        } else if lower.starts_with(la_drivers::sigrok::CONNECTION_PREFIX) {
            tags::SIGROK
        } else if lower == "saleae" || port_suffix(la_drivers::saleae::DEFAULT_PORT) {
            tags::JSON_API
        } else if port_suffix(la_drivers::scpi::DEFAULT_PORT) {
            tags::SCPI
        } else if looks_like_endpoint(conn) {
            tags::NETWORK
        } else {
            tags::SERIAL
        };
        Self::new(conn, conn, kind, 1.0)
    }
}

fn looks_like_endpoint(conn: &str) -> bool {
    match conn.rsplit_once(':') {
        Some((host, port)) => {
            !host.is_empty() && !host.contains(['/', '\\']) && port.trim().parse::<i64>().is_ok()
        }
        None => false,
    }
}

/// One family of device discovery.
#[async_trait]
pub trait DeviceDetector: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    async fn detect(&self) -> Result<Vec<DeviceDescriptor>>;
}

// =============================================================================
// Serial Ports
// =============================================================================

/// USB serial ports; RP2040 boards get a higher confidence.
#[cfg(feature = "serial")]
pub struct SerialPortDetector;

#[cfg(feature = "serial")]
#[async_trait]
impl DeviceDetector for SerialPortDetector {
    fn name(&self) -> &'static str {
        "serial"
    }

    async fn detect(&self) -> Result<Vec<DeviceDescriptor>> {
        let ports = tokio::task::spawn_blocking(serialport::available_ports).await??;
        Ok(ports
            .into_iter()
            .filter_map(|port| match port.port_type {
                serialport::SerialPortType::UsbPort(usb) => {
                    let confidence = if usb.vid == RP2040_VENDOR_ID { 0.9 } else { 0.4 };
                    let name = usb
                        .product
                        .clone()
                        .unwrap_or_else(|| format!("USB serial {:04x}:{:04x}", usb.vid, usb.pid));
                    Some(DeviceDescriptor::new(
                        name,
                        port.port_name,
                        tags::SERIAL,
                        confidence,
                    ))
                }
                _ => None,
            })
            .collect())
    }
}

// =============================================================================
// Network Probes
// =============================================================================

/// Binary-protocol analyzers at configured `host:port` targets.
pub struct NetworkProbeDetector {
    targets: Vec<String>,
    timeout: Duration,
}

impl NetworkProbeDetector {
    pub fn new(targets: Vec<String>, timeout: Duration) -> Self {
        Self { targets, timeout }
    }
}

#[async_trait]
impl DeviceDetector for NetworkProbeDetector {
    fn name(&self) -> &'static str {
        "network"
    }

    async fn detect(&self) -> Result<Vec<DeviceDescriptor>> {
        let probes = self.targets.iter().map(|target| async move {
            let endpoint = Endpoint::parse(target, None).ok()?;
            let port = endpoint.socket_port().ok()?;
            let connect = tokio::net::TcpStream::connect((endpoint.host.as_str(), port));
            match tokio::time::timeout(self.timeout, connect).await {
                Ok(Ok(_)) => Some(DeviceDescriptor::new(
                    format!("Logic Analyzer ({})", endpoint),
                    endpoint.to_string(),
                    tags::NETWORK,
                    0.6,
                )),
                _ => {
                    tracing::debug!(endpoint = %endpoint, "network analyzer not reachable");
                    None
                }
            }
        });
        Ok(futures::future::join_all(probes)
            .await
            .into_iter()
            .flatten()
            .collect())
    }
}

/// SCPI instruments at configured targets, kept only for supported vendors.
pub struct ScpiDetector {
    targets: Vec<String>,
    timeout: Duration,
}

impl ScpiDetector {
    pub fn new(targets: Vec<String>, timeout: Duration) -> Self {
        Self { targets, timeout }
    }

    async fn identify(&self, target: &str) -> Result<Option<DeviceDescriptor>> {
        let endpoint = Endpoint::parse(target, Some(la_drivers::scpi::DEFAULT_PORT))?;
        let mut client = ScpiClient::connect(&endpoint, self.timeout).await?;
        client.set_timeout(self.timeout);
        let identity = Identity::parse(&client.query("*IDN?").await?)?;
        if ScopeVendor::from_manufacturer(&identity.manufacturer).is_none() {
            return Ok(None);
        }
        Ok(Some(DeviceDescriptor::new(
            format!("{} {}", identity.manufacturer, identity.model),
            endpoint.to_string(),
            tags::SCPI,
            0.9,
        )))
    }
}

#[async_trait]
impl DeviceDetector for ScpiDetector {
    fn name(&self) -> &'static str {
        "scpi"
    }

    async fn detect(&self) -> Result<Vec<DeviceDescriptor>> {
        let probes = self.targets.iter().map(|target| async move {
            match self.identify(target).await {
                Ok(found) => found,
                Err(e) => {
                    tracing::debug!(endpoint = %target, error = %format!("{:#}", e), "SCPI probe failed");
                    None
                }
            }
        });
        Ok(futures::future::join_all(probes)
            .await
            .into_iter()
            .flatten()
            .collect())
    }
}

/// Analyzers behind the vendor JSON-API automation socket.
pub struct JsonApiDetector {
    endpoint: Endpoint,
    timeout: Duration,
}

impl JsonApiDetector {
    pub fn new(endpoint: Endpoint, timeout: Duration) -> Self {
        Self { endpoint, timeout }
    }
}

#[async_trait]
impl DeviceDetector for JsonApiDetector {
    fn name(&self) -> &'static str {
        "json-api"
    }

    async fn detect(&self) -> Result<Vec<DeviceDescriptor>> {
        let client = JsonApiClient::connect(&self.endpoint, self.timeout)
            .await?
            .with_timeout(self.timeout);
        let reply = client.request("get_devices", serde_json::Value::Null).await?;
        let devices = reply
            .get("devices")
            .and_then(|d| d.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(devices
            .first()
            .map(|device| {
                let device_type = device
                    .get("device_type")
                    .and_then(|t| t.as_str())
                    .unwrap_or("Logic");
                DeviceDescriptor::new(device_type, self.endpoint.to_string(), tags::JSON_API, 0.9)
            })
            .into_iter()
            .collect())
    }
}

/// Devices listed by `sigrok-cli --scan` that the adapter supports.
pub struct SigrokDetector {
    binary: PathBuf,
    timeout: Duration,
}

impl SigrokDetector {
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }
}

#[async_trait]
impl DeviceDetector for SigrokDetector {
    fn name(&self) -> &'static str {
        "sigrok"
    }

    async fn detect(&self) -> Result<Vec<DeviceDescriptor>> {
        if !la_drivers::sigrok::binary_available(&self.binary) {
            return Ok(Vec::new());
        }
        let scanned = la_drivers::sigrok::scan_all(&self.binary, self.timeout).await?;
        Ok(scanned
            .into_iter()
            .filter(|device| {
                let id = device.driver_arg.split(':').next().unwrap_or_default();
                la_drivers::sigrok::lookup_device(id).is_some()
            })
            .map(|device| {
                DeviceDescriptor::new(&device.name, device.connection_string(), tags::SIGROK, 0.8)
            })
            .collect())
    }
}

/// A fixed list, for the emulator and for tests.
pub struct StaticDetector {
    name: &'static str,
    devices: Vec<DeviceDescriptor>,
}

impl StaticDetector {
    pub fn new(name: &'static str, devices: Vec<DeviceDescriptor>) -> Self {
        Self { name, devices }
    }
}

#[async_trait]
impl DeviceDetector for StaticDetector {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn detect(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self.devices.clone())
    }
}

/// Detectors enabled by `[detection]`.
pub fn detectors_from_config(config: &HardwareConfig) -> Vec<Arc<dyn DeviceDetector>> {
    let detection = &config.detection;
    let timeout = detection.probe_timeout();
    let mut detectors: Vec<Arc<dyn DeviceDetector>> = Vec::new();

    #[cfg(feature = "serial")]
    if detection.serial {
        detectors.push(Arc::new(SerialPortDetector));
    }
    if !detection.network_targets.is_empty() {
        detectors.push(Arc::new(NetworkProbeDetector::new(
            detection.network_targets.clone(),
            timeout,
        )));
    }
    if !detection.scpi_targets.is_empty() {
        detectors.push(Arc::new(ScpiDetector::new(
            detection.scpi_targets.clone(),
            timeout,
        )));
    }
    if let Some(endpoint) = &detection.saleae_endpoint {
        match Endpoint::parse(endpoint, Some(la_drivers::saleae::DEFAULT_PORT)) {
            Ok(endpoint) => detectors.push(Arc::new(JsonApiDetector::new(endpoint, timeout))),
            Err(e) => tracing::warn!(error = %e, "ignoring JSON-API endpoint"),
        }
    }
    if detection.sigrok {
        detectors.push(Arc::new(SigrokDetector::new(
            config.sigrok.binary.clone(),
            timeout.max(Duration::from_secs(5)),
        )));
    }
    if detection.emulated {
        detectors.push(Arc::new(StaticDetector::new(
            "emulated",
            vec![DeviceDescriptor::new(
                "Emulated analyzer",
                la_drivers::emulated::CONNECTION_PREFIX,
                tags::EMULATED,
                0.1,
            )],
        )));
    }
    detectors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_connection_strings() {
        let kind = |s: &str| DeviceDescriptor::from_connection_string(s).driver_type;
        assert_eq!(kind("/dev/ttyACM0"), tags::SERIAL);
        assert_eq!(kind("COM3"), tags::SERIAL);
        assert_eq!(kind("192.168.4.1:4045"), tags::NETWORK);
        assert_eq!(kind("scope.lab:5555"), tags::SCPI);
        assert_eq!(kind("127.0.0.1:10430"), tags::JSON_API);
        assert_eq!(kind("saleae"), tags::JSON_API);
        assert_eq!(kind("sigrok:fx2lafw"), tags::SIGROK);
        assert_eq!(kind("emulated:16"), tags::EMULATED);
    }

    #[test]
    fn test_confidence_is_clamped() {
        assert_eq!(DeviceDescriptor::new("a", "b", "c", 3.0).confidence, 1.0);
        assert_eq!(DeviceDescriptor::new("a", "b", "c", -1.0).confidence, 0.0);
    }

    #[tokio::test]
    async fn test_network_probe() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let detector = NetworkProbeDetector::new(
            vec![addr.clone(), "127.0.0.1:1".into(), "garbage".into()],
            Duration::from_millis(200),
        );
        let found = detector.detect().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].connection_string, addr);
        assert_eq!(found[0].driver_type, tags::NETWORK);
    }

    #[test]
    fn test_detectors_from_config() {
        let mut config = HardwareConfig::default();
        config.detection.serial = false;
        assert!(detectors_from_config(&config).is_empty());

        config.detection.emulated = true;
        config.detection.network_targets = vec!["10.0.0.2:4045".into()];
        let names: Vec<_> = detectors_from_config(&config).iter().map(|d| d.name()).collect();
        assert_eq!(names, vec!["network", "emulated"]);
    }
}
