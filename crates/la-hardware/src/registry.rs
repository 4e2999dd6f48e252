//! Driver registry, hardware detection and connection tracking.
//!
//! [`HardwareDriverManager`] owns three tables with different lifetimes:
//!
//! - **Registrations** (process lifetime): which driver families exist, what
//!   device tags they handle and how to build them.
//! - **Detection cache** (TTL): descriptors from the last detector sweep.
//! - **Active connections** (session lifetime): connected drivers keyed by
//!   device id. [`HardwareDriverManager::dispose`] clears these and nothing
//!   else, so hardware can be re-detected without re-registering drivers.
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = HardwareDriverManager::from_config(&HardwareConfig::load(None)?);
//! let devices = manager.detect_hardware(true).await;
//! if let Some(best) = devices.first() {
//!     let driver = manager.connect_device(best, &ConnectionParams::default()).await?;
//! }
//! ```

use crate::config::HardwareConfig;
use crate::detection::{detectors_from_config, tags, DeviceDescriptor, DeviceDetector};
use crate::multi::{check_device_count, MultiAnalyzerDriver};
use dashmap::DashMap;
use futures::future::join_all;
use la_core::{ConnectError, ConnectionParams, DriverConstructionError, SharedDriver};
use la_drivers::{
    EmulatedAnalyzer, LogicAnalyzerDriver, RigolSiglentDriver, SaleaeLogicDriver, SigrokDriver,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Builds a driver from a connection string.
pub type DriverFactory =
    Arc<dyn Fn(&str) -> Result<SharedDriver, DriverConstructionError> + Send + Sync>;

/// Reports whether a driver can run in this environment.
pub type AvailabilityProbe = Arc<dyn Fn() -> bool + Send + Sync>;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("No available driver handles '{0}' devices")]
    NoMatchingDriver(String),

    #[error("Driver '{0}' is not registered")]
    UnknownDriver(String),

    #[error("Driver '{0}' is not available in this environment")]
    Unavailable(String),

    #[error(transparent)]
    Construction(#[from] DriverConstructionError),

    #[error("Failed to connect to '{device}': {source}")]
    Connect {
        device: String,
        #[source]
        source: ConnectError,
    },
}

// =============================================================================
// Registration
// =============================================================================

/// One driver family known to the manager.
#[derive(Clone)]
pub struct DriverRegistration {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Descriptor `driver_type` tags this driver accepts.
    pub supported_devices: Vec<String>,
    /// Higher wins when several drivers accept the same tag.
    pub priority: i32,
    factory: DriverFactory,
    availability: AvailabilityProbe,
}

impl DriverRegistration {
    pub fn new<F>(id: impl Into<String>, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&str) -> Result<SharedDriver, DriverConstructionError> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            supported_devices: Vec::new(),
            priority: 0,
            factory: Arc::new(factory),
            availability: Arc::new(|| true),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn supporting(mut self, tag: impl Into<String>) -> Self {
        self.supported_devices.push(tag.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_availability<P>(mut self, probe: P) -> Self
    where
        P: Fn() -> bool + Send + Sync + 'static,
    {
        self.availability = Arc::new(probe);
        self
    }

    pub fn is_available(&self) -> bool {
        (self.availability)()
    }

    pub fn supports_device(&self, tag: &str) -> bool {
        self.supported_devices
            .iter()
            .any(|t| t.eq_ignore_ascii_case(tag))
    }

    pub fn create(&self, connection: &str) -> Result<SharedDriver, DriverConstructionError> {
        (self.factory)(connection)
    }
}

impl fmt::Debug for DriverRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistration")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("supported_devices", &self.supported_devices)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Registrations for every bundled transport driver.
pub fn builtin_registrations(config: &HardwareConfig) -> Vec<DriverRegistration> {
    let sigrok_binary = config.sigrok.binary.clone();
    let probe_binary = sigrok_binary.clone();

    vec![
        DriverRegistration::new("serial-analyzer", "Logic analyzer (USB serial)", |conn| {
            Ok(Arc::new(LogicAnalyzerDriver::serial(conn)?) as SharedDriver)
        })
        .with_description("Binary capture protocol over a USB CDC serial port")
        .supporting(tags::SERIAL)
        .with_priority(100)
        .with_availability(|| cfg!(feature = "serial")),
        DriverRegistration::new("network-analyzer", "Logic analyzer (network)", |conn| {
            Ok(Arc::new(LogicAnalyzerDriver::network(conn)?) as SharedDriver)
        })
        .with_description("Binary capture protocol over TCP")
        .supporting(tags::NETWORK)
        .with_priority(90),
        DriverRegistration::new("saleae", "Saleae Logic", |conn| {
            Ok(Arc::new(SaleaeLogicDriver::new(conn)?) as SharedDriver)
        })
        .with_description("Vendor JSON automation API")
        .supporting(tags::JSON_API)
        .with_priority(80),
        DriverRegistration::new("rigol-siglent", "Rigol / Siglent MSO", |conn| {
            Ok(Arc::new(RigolSiglentDriver::new(conn)?) as SharedDriver)
        })
        .with_description("Digital channels of SCPI mixed-signal oscilloscopes")
        .supporting(tags::SCPI)
        .with_priority(70),
        DriverRegistration::new("sigrok", "sigrok-cli", move |conn| {
            Ok(Arc::new(SigrokDriver::new(conn)?.with_binary(sigrok_binary.clone())) as SharedDriver)
        })
        .with_description("Any sigrok-supported analyzer through the sigrok-cli subprocess")
        .supporting(tags::SIGROK)
        .with_priority(50)
        .with_availability(move || la_drivers::sigrok::binary_available(&probe_binary)),
        DriverRegistration::new("emulated", "Emulated analyzer", |conn| {
            Ok(Arc::new(EmulatedAnalyzer::new(conn)?) as SharedDriver)
        })
        .with_description("Software analyzer producing a deterministic pattern")
        .supporting(tags::EMULATED)
        .with_priority(10),
    ]
}

// =============================================================================
// Manager
// =============================================================================

struct DetectionCache {
    taken_at: Instant,
    devices: Vec<DeviceDescriptor>,
}

/// Central registry for analyzer drivers and the devices they serve.
pub struct HardwareDriverManager {
    registrations: RwLock<HashMap<String, DriverRegistration>>,
    detectors: RwLock<Vec<Arc<dyn DeviceDetector>>>,
    cache: Mutex<Option<DetectionCache>>,
    cache_ttl: Duration,
    connections: DashMap<String, SharedDriver>,
    current: RwLock<Option<String>>,
}

impl Default for HardwareDriverManager {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareDriverManager {
    /// Empty manager: no registrations, no detectors.
    pub fn new() -> Self {
        Self {
            registrations: RwLock::new(HashMap::new()),
            detectors: RwLock::new(Vec::new()),
            cache: Mutex::new(None),
            cache_ttl: DEFAULT_CACHE_TTL,
            connections: DashMap::new(),
            current: RwLock::new(None),
        }
    }

    /// Manager with the bundled drivers and the detectors `config` enables.
    pub fn from_config(config: &HardwareConfig) -> Self {
        let manager = Self::new().with_cache_ttl(config.detection.cache_ttl());
        for registration in builtin_registrations(config) {
            manager.register_driver(registration);
        }
        for detector in detectors_from_config(config) {
            manager.add_detector(detector);
        }
        manager
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    // =========================================================================
    // Registrations
    // =========================================================================

    /// Insert by id, replacing any previous registration with the same id.
    pub fn register_driver(&self, registration: DriverRegistration) {
        tracing::debug!(
            driver = %registration.id,
            priority = registration.priority,
            "registering driver"
        );
        if let Some(previous) = self
            .registrations
            .write()
            .insert(registration.id.clone(), registration)
        {
            tracing::debug!(driver = %previous.id, "replaced existing registration");
        }
    }

    pub fn unregister_driver(&self, id: &str) -> bool {
        self.registrations.write().remove(id).is_some()
    }

    pub fn get_driver(&self, id: &str) -> Option<DriverRegistration> {
        self.registrations.read().get(id).cloned()
    }

    /// All registrations, highest priority first.
    pub fn get_registered_drivers(&self) -> Vec<DriverRegistration> {
        let mut drivers: Vec<_> = self.registrations.read().values().cloned().collect();
        drivers.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        drivers
    }

    /// Registrations whose availability probe passes.
    pub fn get_available_drivers(&self) -> Vec<DriverRegistration> {
        self.get_registered_drivers()
            .into_iter()
            .filter(DriverRegistration::is_available)
            .collect()
    }

    // =========================================================================
    // Detection
    // =========================================================================

    pub fn add_detector(&self, detector: Arc<dyn DeviceDetector>) {
        self.detectors.write().push(detector);
    }

    pub fn invalidate_cache(&self) {
        self.cache.lock().take();
    }

    /// Enumerate reachable devices across every detector.
    ///
    /// With `use_cache` a sweep younger than the cache TTL is returned as is.
    /// Detector failures are logged and skipped. Results are deduplicated by
    /// connection string (highest confidence kept) and sorted by confidence.
    pub async fn detect_hardware(&self, use_cache: bool) -> Vec<DeviceDescriptor> {
        if use_cache {
            if let Some(cache) = self.cache.lock().as_ref() {
                if cache.taken_at.elapsed() < self.cache_ttl {
                    return cache.devices.clone();
                }
            }
        }

        let detectors = self.detectors.read().clone();
        let sweeps = detectors.iter().map(|detector| async move {
            match detector.detect().await {
                Ok(found) => {
                    tracing::debug!(detector = detector.name(), count = found.len(), "detector finished");
                    found
                }
                Err(e) => {
                    tracing::warn!(detector = detector.name(), error = %e, "detector failed");
                    Vec::new()
                }
            }
        });
        let found: Vec<DeviceDescriptor> = join_all(sweeps).await.into_iter().flatten().collect();

        let devices = merge_descriptors(found);
        tracing::info!(count = devices.len(), "hardware detection complete");
        *self.cache.lock() = Some(DetectionCache {
            taken_at: Instant::now(),
            devices: devices.clone(),
        });
        devices
    }

    /// Highest-priority available registration accepting the descriptor's tag.
    pub fn find_best_driver_match(&self, descriptor: &DeviceDescriptor) -> Option<DriverRegistration> {
        self.get_registered_drivers()
            .into_iter()
            .filter(|r| r.supports_device(&descriptor.driver_type) && r.is_available())
            .max_by_key(|r| r.priority)
    }

    pub fn create_driver_instance(
        &self,
        descriptor: &DeviceDescriptor,
    ) -> Result<SharedDriver, RegistryError> {
        let registration = self
            .find_best_driver_match(descriptor)
            .ok_or_else(|| RegistryError::NoMatchingDriver(descriptor.driver_type.clone()))?;
        tracing::debug!(
            driver = %registration.id,
            device = %descriptor.connection_string,
            "creating driver instance"
        );
        Ok(registration.create(&descriptor.connection_string)?)
    }

    /// Build a driver with an explicitly chosen registration.
    pub fn create_driver_by_id(
        &self,
        id: &str,
        connection: &str,
    ) -> Result<SharedDriver, RegistryError> {
        let registration = self
            .get_driver(id)
            .ok_or_else(|| RegistryError::UnknownDriver(id.to_string()))?;
        if !registration.is_available() {
            return Err(RegistryError::Unavailable(id.to_string()));
        }
        Ok(registration.create(connection)?)
    }

    /// Ensemble of the devices behind `connections`, each built through the
    /// registry's matching. The first connection string is the trigger master.
    pub fn create_multi_device_driver<S: AsRef<str>>(
        &self,
        connections: &[S],
    ) -> Result<MultiAnalyzerDriver, RegistryError> {
        check_device_count(connections.len())?;
        MultiAnalyzerDriver::with_factory(connections, |conn| {
            self.create_driver_instance(&DeviceDescriptor::from_connection_string(conn))
        })
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Build, connect and track the driver for `descriptor`.
    ///
    /// A device that is already connected is returned as is.
    pub async fn connect_device(
        &self,
        descriptor: &DeviceDescriptor,
        params: &ConnectionParams,
    ) -> Result<SharedDriver, RegistryError> {
        let existing = self
            .connections
            .get(&descriptor.id)
            .map(|entry| entry.value().clone());
        if let Some(driver) = existing {
            if driver.is_connected() {
                *self.current.write() = Some(descriptor.id.clone());
                return Ok(driver);
            }
            self.connections.remove(&descriptor.id);
        }

        let driver = self.create_driver_instance(descriptor)?;
        let result = driver
            .connect(params)
            .await
            .map_err(|source| RegistryError::Connect {
                device: descriptor.id.clone(),
                source,
            })?;
        tracing::info!(
            device = %descriptor.id,
            name = %result.device_name,
            channels = result.capabilities.channel_count,
            "device connected"
        );
        self.track_connection(&descriptor.id, driver.clone());
        Ok(driver)
    }

    /// Track an already connected driver, e.g. a multi-device ensemble.
    pub fn track_connection(&self, id: &str, driver: SharedDriver) {
        self.connections.insert(id.to_string(), driver);
        *self.current.write() = Some(id.to_string());
    }

    /// Disconnect and forget a device. Returns false if it was not tracked.
    pub async fn disconnect_device(&self, id: &str) -> bool {
        let Some((_, driver)) = self.connections.remove(id) else {
            return false;
        };
        driver.disconnect().await;
        {
            let mut current = self.current.write();
            if current.as_deref() == Some(id) {
                *current = None;
            }
        }
        tracing::info!(device = %id, "device disconnected");
        true
    }

    pub fn get_active_connections(&self) -> HashMap<String, SharedDriver> {
        self.connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Most recently connected device.
    pub fn get_current_device(&self) -> Option<SharedDriver> {
        let id = self.current.read().clone()?;
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    pub fn is_device_connected(&self) -> bool {
        self.get_current_device()
            .map(|driver| driver.is_connected())
            .unwrap_or(false)
    }

    /// Disconnect every tracked device. Registrations and detectors survive.
    pub async fn dispose(&self) {
        let drivers: Vec<(String, SharedDriver)> = self
            .connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        self.connections.clear();
        self.current.write().take();
        self.invalidate_cache();
        join_all(drivers.iter().map(|(_, d)| d.disconnect())).await;
        tracing::info!(count = drivers.len(), "hardware manager disposed");
    }
}

/// Deduplicate by connection string keeping the most confident descriptor,
/// then sort by confidence, highest first.
pub fn merge_descriptors(found: Vec<DeviceDescriptor>) -> Vec<DeviceDescriptor> {
    let mut by_connection: HashMap<String, DeviceDescriptor> = HashMap::new();
    for descriptor in found {
        match by_connection.get(&descriptor.connection_string) {
            Some(existing) if existing.confidence >= descriptor.confidence => {}
            _ => {
                by_connection.insert(descriptor.connection_string.clone(), descriptor);
            }
        }
    }
    let mut devices: Vec<_> = by_connection.into_values().collect();
    devices.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.id.cmp(&b.id))
    });
    devices
}
