//! Transport drivers for logic analyzers.
//!
//! Every driver implements [`la_core::AnalyzerDriver`] and differs only in how
//! it reaches the hardware.
//!
//! | Driver | Transport | Connection string |
//! |--------|-----------|-------------------|
//! | [`LogicAnalyzerDriver`] | Binary protocol over USB serial | `/dev/ttyACM0`, `COM3` |
//! | [`LogicAnalyzerDriver`] | Binary protocol over TCP | `host:port` |
//! | [`RigolSiglentDriver`] | SCPI over TCP | `host[:5555]` |
//! | [`SaleaeLogicDriver`] | Line-delimited JSON over TCP | `host[:10430]` |
//! | [`SigrokDriver`] | `sigrok-cli` subprocess | `sigrok:<driver>[:conn=..]` |
//! | [`EmulatedAnalyzer`] | None | `emulated[:<channels>]` |
//!
//! # Usage
//!
//! ```rust,ignore
//! use la_drivers::LogicAnalyzerDriver;
//! use la_core::{AnalyzerDriver, CaptureSession, ConnectionParams};
//!
//! let driver = LogicAnalyzerDriver::network("192.168.4.1:4045")?;
//! driver.connect(&ConnectionParams::default()).await?;
//! let session = CaptureSession::new(10_000_000, 100, 900).with_channels([0, 1]);
//! let completion = driver.start_capture(session).await.map_err(|r| r.error)?.wait().await?;
//! ```

pub mod address;
pub mod analyzer;
pub mod emulated;
pub mod protocol;
pub mod rigol_siglent;
pub mod saleae;
pub mod scpi;
pub mod sigrok;

pub use address::Endpoint;
pub use analyzer::{AnalyzerTransport, LogicAnalyzerDriver};
pub use emulated::{EmulatedAnalyzer, EmulatedFault};
pub use protocol::NetworkSettings;
pub use rigol_siglent::{RigolSiglentDriver, ScopeVendor};
pub use saleae::{JsonApiClient, JsonApiError, SaleaeLogicDriver, TimeSample};
pub use scpi::ScpiClient;
pub use sigrok::{SigrokDriver, SigrokTarget};
