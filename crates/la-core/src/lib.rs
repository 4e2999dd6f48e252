//! `la-core`
//!
//! Shared building blocks for the logic-analyzer driver stack: the capture data
//! model, capability descriptions, firmware version negotiation, the error
//! taxonomy and the [`AnalyzerDriver`] contract every transport implements.
//!
//! ## Key Types
//!
//! - [`CaptureSession`]: one acquisition request, returned with samples filled
//! - [`DeviceCapabilities`]: immutable capability snapshot of a connected device
//! - [`AnalyzerDriver`]: async driver contract, used as `Arc<dyn AnalyzerDriver>`
//! - [`CaptureHandle`] / [`CaptureTicket`]: exactly-once capture completion
//! - [`VersionValidator`]: firmware version parsing and minimum-version gating
//!
//! ## Example
//!
//! ```rust,ignore
//! use la_core::{AnalyzerDriver, CaptureSession, ConnectionParams};
//!
//! driver.connect(&ConnectionParams::default()).await?;
//! let session = CaptureSession::new(1_000_000, 100, 900)
//!     .with_channels([0, 1, 2, 3])
//!     .with_edge_trigger(0, false);
//! let handle = driver.start_capture(session).await.map_err(|r| r.error)?;
//! let completion = handle.wait().await?;
//! ```

pub mod capabilities;
pub mod capture;
pub mod completion;
pub mod driver;
pub mod error;
pub mod limits;
pub mod state;
pub mod stream;
pub mod version;

pub use capabilities::{Connectivity, DeviceCapabilities, TriggerCapabilities};
pub use capture::{
    AnalyzerChannel, BurstInfo, CaptureLimits, CaptureMode, CaptureSession, TriggerType,
    EXTERNAL_TRIGGER_CHANNEL,
};
pub use completion::{CaptureCompletion, CaptureHandle, CaptureRejection, CaptureTicket};
pub use driver::{
    AnalyzerDriver, ConnectionParams, ConnectionResult, DeviceInfo, DeviceStatus, DriverType,
    SharedDriver,
};
pub use error::{CaptureError, ConnectError, DriverConstructionError};
pub use state::{DriverEvent, DriverState};
pub use version::{DeviceVersion, VersionValidator};
