//! Hardware management for logic analyzers.
//!
//! - [`config`]: figment-layered [`HardwareConfig`] (defaults, TOML, `LA_*` env)
//! - [`detection`]: [`DeviceDetector`] implementations producing [`DeviceDescriptor`]s
//! - [`registry`]: [`HardwareDriverManager`], the driver registry and connection tracker
//! - [`multi`]: [`MultiAnalyzerDriver`], several analyzers synchronized as one
//!
//! # Example
//!
//! ```rust,ignore
//! use la_hardware::{HardwareConfig, HardwareDriverManager};
//!
//! let config = HardwareConfig::load(Some(Path::new("la.toml")))?;
//! let manager = HardwareDriverManager::from_config(&config);
//! for device in manager.detect_hardware(false).await {
//!     println!("{} ({}, {:.0}%)", device.name, device.driver_type, device.confidence * 100.0);
//! }
//! ```

pub mod config;
pub mod detection;
pub mod multi;
pub mod registry;

pub use config::{ConfigError, HardwareConfig};
pub use detection::{DeviceDescriptor, DeviceDetector};
pub use multi::MultiAnalyzerDriver;
pub use registry::{DriverRegistration, HardwareDriverManager, RegistryError};
