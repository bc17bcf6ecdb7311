//! Orchestrator context.
//!
//! Owns every piece of shared state for one provisioning station: the
//! session table, the event correlator and its name cache, and the staged
//! firmware. Several orchestrators can coexist in one process.

use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cloud::{AssetSource, CloudApi, CloudError};
use crate::config::ProvisionConfig;
use crate::correlator::EventCorrelator;
use crate::device_log::DeviceLogs;
use crate::dfu_util::FlashTool;
use crate::events::{LogLevel, Reporter, StatusObserver};
use crate::flash::FlashSettings;
use crate::provision::Provisioner;
use crate::staging::{StagedFirmware, stage_firmware};
use crate::tracker::{SessionTable, UsbTracker};
use crate::transport::UsbBackend;

pub struct Orchestrator<C, A, U, T> {
    config: Arc<ProvisionConfig>,
    cloud: Arc<C>,
    assets: Arc<A>,
    usb: Arc<U>,
    tool: Arc<T>,
    reporter: Reporter,
    correlator: EventCorrelator,
    sessions: SessionTable,
    staged: OnceLock<Arc<StagedFirmware>>,
}

impl<C, A, U, T> Orchestrator<C, A, U, T>
where
    C: CloudApi,
    A: AssetSource,
    U: UsbBackend,
    T: FlashTool,
{
    pub fn new(
        config: ProvisionConfig,
        cloud: Arc<C>,
        assets: Arc<A>,
        usb: Arc<U>,
        tool: Arc<T>,
        observer: Arc<dyn StatusObserver>,
    ) -> Self {
        let logs = DeviceLogs::new(&config.device_logs_dir);
        Self {
            config: Arc::new(config),
            cloud,
            assets,
            usb,
            tool,
            reporter: Reporter::new(observer, logs.clone()),
            correlator: EventCorrelator::new(logs),
            sessions: SessionTable::new(),
            staged: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn correlator(&self) -> &EventCorrelator {
        &self.correlator
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Staged firmware, once [`Orchestrator::initialize`] has succeeded.
    pub fn staged(&self) -> Option<&Arc<StagedFirmware>> {
        self.staged.get()
    }

    /// Stage firmware, warm the device-name cache and subscribe to the
    /// product event stream. Any failure here is fatal to the station.
    pub async fn initialize(&self) -> Result<Arc<StagedFirmware>> {
        if let Some(staged) = self.staged.get() {
            return Ok(staged.clone());
        }

        let staged = stage_firmware(&self.config, self.cloud.as_ref(), self.assets.as_ref()).await?;
        let staged = self.staged.get_or_init(|| Arc::new(staged)).clone();

        let named = self
            .warm_name_cache()
            .await
            .context("failed to retrieve product device list")?;
        info!(named, "Product device list retrieved");

        self.correlator.connect(self.cloud.clone());

        self.reporter.log(
            LogLevel::Info,
            format!(
                "ready: product {} ({}), firmware v{}, {}",
                staged.product.id, staged.platform.name, staged.firmware_version, staged.triple
            ),
        );
        Ok(staged)
    }

    /// Record the name of every named device in the product. Returns how many.
    async fn warm_name_cache(&self) -> Result<usize, CloudError> {
        let mut named = 0;
        let mut page = 1;
        loop {
            let result = self.cloud.list_devices(page).await?;
            for device in &result.devices {
                if let Some(name) = &device.name {
                    self.correlator.set_device_name(&device.id, name);
                    named += 1;
                }
            }
            if page >= result.meta.total_pages {
                break;
            }
            page += 1;
        }
        Ok(named)
    }

    /// Workflow runner for the staged firmware.
    pub fn provisioner(&self) -> Result<Provisioner<C, U, T>> {
        let staged = self.staged.get().cloned().context("firmware not staged")?;
        let settings = FlashSettings {
            flash_timeout: self.config.flash_timeout(),
            ..FlashSettings::default()
        };
        Ok(Provisioner::new(
            self.config.clone(),
            staged,
            self.cloud.clone(),
            self.usb.clone(),
            self.tool.clone(),
            settings,
            self.correlator.clone(),
            self.reporter.clone(),
        ))
    }

    pub fn tracker(&self) -> Result<UsbTracker<U, Provisioner<C, U, T>>> {
        Ok(UsbTracker::new(
            self.usb.clone(),
            Arc::new(self.provisioner()?),
            self.sessions.clone(),
            self.reporter.clone(),
            self.config.max_concurrent_runs,
        ))
    }

    /// Scan USB forever, provisioning every device that shows up.
    pub async fn run(&self) -> Result<()> {
        let tracker = self.tracker()?;
        self.reporter
            .log(LogLevel::Info, "initialization complete, scanning USB now...");
        tracker.run(self.config.usb_scan_period()).await;
        Ok(())
    }

    /// Ask the cloud to make a device flash its status LED.
    pub async fn signal_device(&self, device_id: &str) -> bool {
        match self.cloud.signal_device(device_id).await {
            Ok(()) => {
                self.reporter.device_log(device_id, "signaling device");
                true
            }
            Err(e) => {
                warn!(device = %device_id, error = %e, "Signal failed");
                self.reporter.device_log(device_id, "error signaling device");
                false
            }
        }
    }
}
