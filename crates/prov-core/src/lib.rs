//! Prov-Core: USB provisioning station for cloud-managed IoT devices.
//!
//! Devices plugged into the station are registered with a cloud product,
//! optionally claimed, renamed and grouped, flashed over DFU with a known
//! system firmware and the product firmware, and watched until they report
//! online.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Catalog / Module info / Plan**: version resolution, module prefix
//!   decoding and flash plan building
//! - **Staging**: cached downloads and resolved plans for one configuration
//! - **Transport**: USB abstraction (nusb, mock)
//! - **DFU util / Flash**: the external flashing utility and the per-plan
//!   executor driving it
//! - **Cloud / Correlator**: REST client, event stream and event waits
//! - **Tracker / Provision**: USB session lifecycle and the per-device workflow
//! - **Events**: observer pattern for UI decoupling
//! - **Orchestrator**: the context owning all of the above
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use prov_core::{
//!     DfuUtil, HttpAssets, NusbBackend, Orchestrator, ParticleCloud, ProvisionConfig, TracingObserver,
//! };
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = ProvisionConfig::load_from_file("prov.toml")?;
//! let cloud = ParticleCloud::new(&config.api_base_url, "token", config.product_id);
//! let orchestrator = Orchestrator::new(
//!     config.clone(),
//!     Arc::new(cloud),
//!     Arc::new(HttpAssets::new(&config.assets_base_url)),
//!     Arc::new(NusbBackend::new()),
//!     Arc::new(DfuUtil::new(&config.dfu_util_path)),
//!     Arc::new(TracingObserver),
//! );
//! orchestrator.initialize().await?;
//! orchestrator.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod cloud;
pub mod config;
pub mod correlator;
pub mod device_log;
pub mod dfu_util;
pub mod events;
pub mod flash;
pub mod module_info;
pub mod orchestrator;
pub mod plan;
pub mod provision;
pub mod staging;
pub mod tracker;
pub mod transport;

// Re-exports for convenience
pub use catalog::{PlatformInfo, RestoreCatalog, VersionTable, VersionTriple, resolve_triple};
pub use cloud::{AssetSource, CloudApi, CloudError, HttpAssets, MockCloud, ParticleCloud};
pub use config::{ConfigError, GroupFormat, ProvisionConfig};
pub use correlator::{DeviceEvent, EventCorrelator, EventFilter, WaitError};
pub use device_log::DeviceLogs;
pub use dfu_util::{DfuUtil, FlashTool, MockFlashTool, ToolError};
pub use events::{
    BroadcastObserver, LogLevel, NullObserver, Observers, RecordingObserver, Reporter, StatusEvent,
    StatusObserver, TracingObserver,
};
pub use flash::{FlashError, FlashExecutor, FlashSettings};
pub use module_info::{ModuleInfoMap, ModulePrefix};
pub use orchestrator::Orchestrator;
pub use plan::{FlashPart, FlashPlan, PartName, build_plan};
pub use provision::{Provisioner, SetupOutcome, StepError};
pub use staging::{StagedFirmware, stage_firmware};
pub use tracker::{SessionTable, UsbTracker};
pub use transport::{MockUsb, NusbBackend, TransportError, UsbBackend, UsbDevice};
