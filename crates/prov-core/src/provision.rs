//! Per-device provisioning workflow.
//!
//! A linear sequence of steps run once per USB connection. Configuration
//! flags gate the optional steps. The first failing step ends the run with a
//! `SetupFailed` status event; a completed run ends with `SetupDone`. Devices
//! of the wrong platform are ignored without either.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::cloud::{CloudApi, CloudError, DeviceInfo, DeviceUpdate};
use crate::config::{GroupFormat, ProvisionConfig};
use crate::correlator::{EventCorrelator, EventFilter, WaitError};
use crate::dfu_util::FlashTool;
use crate::events::{LogLevel, Reporter, StatusEvent};
use crate::flash::{FlashError, FlashExecutor, FlashSettings, reopen_device};
use crate::staging::StagedFirmware;
use crate::tracker::{ProvisionRunner, SessionHandle};
use crate::transport::{TransportError, UsbBackend, UsbDevice};

/// Device status event name and the payload sent when it connects.
pub const STATUS_EVENT: &str = "spark/status";
pub const ONLINE_STATUS: &str = "online";
pub const ONLINE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Reconnect bound before the coprocessor plan.
pub const NCP_RECONNECT_ATTEMPTS: u32 = 5;
pub const NCP_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Vendor control request that puts a tracker into shipping mode.
pub const SHIPPING_MODE_REQUEST: u16 = 10;
pub const SHIPPING_MODE_PAYLOAD: &[u8] = br#"{"cmd":"enter_shipping"}"#;

#[derive(Error, Debug)]
pub enum StepError {
    #[error("{step} failed: {source}")]
    Cloud {
        step: &'static str,
        #[source]
        source: CloudError,
    },

    #[error(transparent)]
    Flash(#[from] FlashError),

    #[error("device {id} did not reconnect before the coprocessor update")]
    Reconnect { id: String },

    #[error("device did not come online: {0}")]
    Online(#[from] WaitError),
}

impl StepError {
    fn cloud(step: &'static str) -> impl FnOnce(CloudError) -> Self {
        move |source| StepError::Cloud { step, source }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupOutcome {
    /// Wrong platform; nothing was done.
    Skipped,
    Done,
    Failed,
}

/// Group to assign, from a fixed name or generated from `today`.
pub fn device_group_name(config: &ProvisionConfig, today: NaiveDate) -> Option<String> {
    if let Some(name) = &config.device_group_name {
        return Some(name.clone());
    }
    let date = today.format("%Y%m%d");
    match config.device_group_format? {
        GroupFormat::Date => Some(date.to_string()),
        GroupFormat::DateQuantity => Some(format!("{date}_{}", config.batch_size?)),
    }
}

pub struct Provisioner<C, U, T> {
    config: Arc<ProvisionConfig>,
    staged: Arc<StagedFirmware>,
    cloud: Arc<C>,
    usb: Arc<U>,
    flasher: FlashExecutor<U, T>,
    correlator: EventCorrelator,
    reporter: Reporter,
}

impl<C, U, T> Provisioner<C, U, T>
where
    C: CloudApi,
    U: UsbBackend,
    T: FlashTool,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ProvisionConfig>,
        staged: Arc<StagedFirmware>,
        cloud: Arc<C>,
        usb: Arc<U>,
        tool: Arc<T>,
        flash_settings: FlashSettings,
        correlator: EventCorrelator,
        reporter: Reporter,
    ) -> Self {
        let flasher = FlashExecutor::new(usb.clone(), tool, flash_settings, reporter.clone());
        Self {
            config,
            staged,
            cloud,
            usb,
            flasher,
            correlator,
            reporter,
        }
    }

    /// Run the whole workflow for one connected device.
    #[instrument(skip_all, fields(device = %device.id()))]
    pub async fn provision(&self, device: U::Device, session: &SessionHandle) -> SetupOutcome {
        let id = device.id().to_string();

        let expected = self.staged.product.platform_id;
        if device.platform_id() != expected {
            info!(platform = device.platform_id(), expected, "Wrong type of device, ignoring");
            self.reporter
                .log(LogLevel::Info, format!("wrong type of device, ignoring {id}"));
            return SetupOutcome::Skipped;
        }

        self.reporter.device_log(&id, "connected by USB");

        match self.run_steps(&id, device, session).await {
            Ok(()) => {
                self.reporter.device_log(&id, "setup done!");
                self.reporter.emit(StatusEvent::SetupDone { id });
                SetupOutcome::Done
            }
            Err(e) => {
                error!(error = %e, "Provisioning failed");
                self.reporter.device_log(&id, "Exception flashing device");
                self.reporter.emit(StatusEvent::SetupFailed { id });
                SetupOutcome::Failed
            }
        }
    }

    async fn run_steps(&self, id: &str, device: U::Device, session: &SessionHandle) -> Result<(), StepError> {
        if let Err(e) = self.cloud.add_device_to_product(id).await {
            self.reporter.device_log(id, "failed to add to product");
            return Err(StepError::cloud("add to product")(e));
        }
        self.reporter.device_log(id, "added to product");

        let info = match self.cloud.get_device(id).await {
            Ok(info) => info,
            Err(e) => {
                self.reporter.device_log(id, "failed get device info");
                return Err(StepError::cloud("get device info")(e));
            }
        };
        self.publish_info(id, &info);

        if self.config.claim_device {
            self.reporter.device_log(id, "claiming device");
            self.cloud
                .claim_device(id)
                .await
                .map_err(StepError::cloud("claim device"))?;
            let user = self
                .cloud
                .current_user()
                .await
                .map_err(StepError::cloud("get current user"))?;
            self.merge_json(id, json!({ "claimDevice": user.username }));
        }

        let update = self.device_update(&info);
        if let Some(name) = &update.name {
            self.correlator.set_device_name(id, name);
        }
        if !update.is_empty() {
            self.reporter.device_log(id, "setting device info");
            self.cloud
                .update_device(id, &update)
                .await
                .map_err(StepError::cloud("update device"))?;
        }

        if let Some(group) = device_group_name(&self.config, Local::now().date_naive()) {
            self.reporter.device_log(id, "assigning device group");
            self.cloud
                .assign_device_groups(id, std::slice::from_ref(&group))
                .await
                .map_err(StepError::cloud("assign device group"))?;
            self.merge_json(id, json!({ "deviceGroup": group }));
        }

        let info = self
            .cloud
            .get_device(id)
            .await
            .map_err(StepError::cloud("refresh device info"))?;
        self.merge_json(id, json!({ "deviceInfo": info.to_value() }));
        self.publish_info(id, &info);

        let mut device = if self.config.flash_firmware {
            self.flasher
                .flash_firmware(device, &self.staged.primary_plan, session)
                .await?
        } else {
            Some(device)
        };

        let ncp_plan = self.staged.ncp_plan.as_ref().filter(|_| self.config.flash_tracker_ncp);
        if let Some(plan) = ncp_plan {
            drop(device.take());
            let handle = reopen_device(self.usb.as_ref(), id, NCP_RECONNECT_ATTEMPTS, NCP_RECONNECT_DELAY)
                .await
                .ok_or_else(|| StepError::Reconnect { id: id.to_string() })?;

            self.reporter.device_log(id, "flashing NCP");
            device = self.flasher.flash_firmware(handle, plan, session).await?;
        }
        // Later steps reopen the device themselves
        drop(device);

        if self.config.wait_device_online {
            self.wait_online(id).await?;
        }

        if self.config.tracker_shipping_mode && self.staged.platform.is_tracker() {
            self.enter_shipping_mode(id).await;
        }

        Ok(())
    }

    fn device_update(&self, info: &DeviceInfo) -> DeviceUpdate {
        let mut update = DeviceUpdate::default();
        if self.config.mark_as_development {
            update.development = Some(true);
        }
        if self.config.device_name_is_serial_number {
            update.name = info.serial_number.clone();
        }
        if let Some(version) = self.config.lock_firmware_version {
            update.desired_firmware_version = Some(version);
            if self.config.flash_now {
                update.flash = Some(true);
            }
        }
        update
    }

    async fn wait_online(&self, id: &str) -> Result<(), StepError> {
        self.reporter.device_log(id, "waiting for device online");

        let filter = EventFilter::named(STATUS_EVENT).with_data(ONLINE_STATUS);
        match self.correlator.wait_for_event(id, filter, Some(ONLINE_TIMEOUT)).await {
            Ok(_) => {
                self.merge_json(id, json!({ "online": true }));
                Ok(())
            }
            Err(e) => {
                self.merge_json(id, json!({ "online": false }));
                self.reporter.device_log(id, "device did not come online");
                Err(e.into())
            }
        }
    }

    async fn enter_shipping_mode(&self, id: &str) {
        let result: Result<(), TransportError> = async {
            let device = self.usb.open_by_id(id).await?;
            device
                .send_control_request(SHIPPING_MODE_REQUEST, SHIPPING_MODE_PAYLOAD)
                .await
        }
        .await;

        match result {
            Ok(()) => self.reporter.device_log(id, "entered shipping mode"),
            Err(e) => {
                warn!(device = %id, error = %e, "Shipping mode request failed");
                self.reporter.device_log(id, "shipping mode failed");
            }
        }
    }

    fn publish_info(&self, id: &str, info: &DeviceInfo) {
        if let Some(name) = &info.name {
            self.correlator.set_device_name(id, name);
        }
        self.reporter.device_info(id, info.to_value());
    }

    fn merge_json(&self, id: &str, obj: Value) {
        if let Err(e) = self.reporter.logs().merge_json(id, obj) {
            warn!(device = %id, error = %e, "Failed to update device record");
        }
    }
}

impl<C, U, T> ProvisionRunner<U::Device> for Provisioner<C, U, T>
where
    C: CloudApi,
    U: UsbBackend,
    T: FlashTool,
{
    async fn run(&self, device: U::Device, session: SessionHandle) {
        self.provision(device, &session).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{PlatformInfo, TRACKER_PLATFORM_ID, VersionTriple};
    use crate::cloud::{CloudCall, MockCloud, Product, RawEvent};
    use crate::device_log::DeviceLogs;
    use crate::dfu_util::MockFlashTool;
    use crate::events::RecordingObserver;
    use crate::plan::{A5_MARKER_ADDRESS, FlashPart, FlashPlan, MARKER_ALT, PartName};
    use crate::tracker::SessionTable;
    use crate::transport::MockUsb;
    use tokio::time::Instant;

    struct Fixture {
        usb: MockUsb,
        cloud: MockCloud,
        tool: Arc<MockFlashTool>,
        recorder: Arc<RecordingObserver>,
        correlator: EventCorrelator,
        logs: DeviceLogs,
        sessions: SessionTable,
        dir: tempfile::TempDir,
    }

    fn a5_plan(dir: &std::path::Path) -> FlashPlan {
        FlashPlan {
            parts: vec![FlashPart {
                name: PartName::A5,
                binary_path: dir.join("a5.bin"),
                address: A5_MARKER_ADDRESS,
                alt_setting: MARKER_ALT,
                leave: true,
            }],
        }
    }

    fn fixture(platform_id: u16) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let logs = DeviceLogs::new(dir.path().join("logs"));
        Fixture {
            usb: MockUsb::new(),
            cloud: MockCloud::new().with_product(1234, platform_id),
            tool: Arc::new(MockFlashTool::new()),
            recorder: Arc::new(RecordingObserver::new()),
            correlator: EventCorrelator::new(logs.clone()),
            logs,
            sessions: SessionTable::new(),
            dir,
        }
    }

    fn staged(f: &Fixture, platform_id: u16, with_ncp: bool) -> StagedFirmware {
        StagedFirmware {
            product: Product {
                id: 1234,
                platform_id,
                name: "widgets".into(),
                extra: serde_json::Map::new(),
            },
            platform: PlatformInfo {
                id: platform_id,
                name: if platform_id == TRACKER_PLATFORM_ID { "tracker" } else { "boron" }.into(),
                generation: 3,
            },
            triple: VersionTriple {
                system_version: 4000,
                sem_ver: Some("4.0.0".into()),
                restore_sem_ver: "4.0.0".into(),
            },
            firmware_version: 3,
            should_upgrade_ncp: with_ncp,
            primary_plan: a5_plan(f.dir.path()),
            ncp_plan: with_ncp.then(|| a5_plan(f.dir.path())),
        }
    }

    fn provisioner(f: &Fixture, config: ProvisionConfig, staged: StagedFirmware) -> Provisioner<MockCloud, MockUsb, MockFlashTool> {
        Provisioner::new(
            Arc::new(config),
            Arc::new(staged),
            Arc::new(f.cloud.clone()),
            Arc::new(f.usb.clone()),
            f.tool.clone(),
            FlashSettings::default(),
            f.correlator.clone(),
            Reporter::new(f.recorder.clone(), f.logs.clone()),
        )
    }

    fn base_config() -> ProvisionConfig {
        ProvisionConfig {
            product_id: 1234,
            auth_token: Some("tok".into()),
            wait_device_online: false,
            ..Default::default()
        }
    }

    fn device_lines(recorder: &RecordingObserver, id: &str) -> Vec<String> {
        recorder
            .events_for(id)
            .into_iter()
            .filter_map(|e| match e {
                StatusEvent::DeviceLog { msg, .. } => Some(msg),
                _ => None,
            })
            .collect()
    }

    fn count_done(recorder: &RecordingObserver) -> usize {
        recorder.count(|e| matches!(e, StatusEvent::SetupDone { .. }))
    }

    fn count_failed(recorder: &RecordingObserver) -> usize {
        recorder.count(|e| matches!(e, StatusEvent::SetupFailed { .. }))
    }

    /// Publish "online" for `id` once a wait is registered.
    fn go_online_when_awaited(correlator: &EventCorrelator, id: &'static str) {
        let correlator = correlator.clone();
        tokio::spawn(async move {
            while correlator.pending_waits() == 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            correlator.dispatch(&RawEvent::new(id, STATUS_EVENT, ONLINE_STATUS));
        });
    }

    async fn run(f: &Fixture, p: &Provisioner<MockCloud, MockUsb, MockFlashTool>, id: &str) -> SetupOutcome {
        f.sessions.touch(id, Instant::now());
        let device = f.usb.open_by_id(id).await.unwrap();
        p.provision(device, &f.sessions.handle(id)).await
    }

    #[test]
    fn test_group_names() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        let mut config = base_config();
        assert_eq!(device_group_name(&config, today), None);

        config.device_group_format = Some(GroupFormat::Date);
        assert_eq!(device_group_name(&config, today).as_deref(), Some("20240307"));

        config.device_group_format = Some(GroupFormat::DateQuantity);
        config.batch_size = Some(50);
        assert_eq!(device_group_name(&config, today).as_deref(), Some("20240307_50"));

        config.device_group_format = None;
        config.device_group_name = Some("line-a".into());
        assert_eq!(device_group_name(&config, today).as_deref(), Some("line-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_platform_is_ignored_silently() {
        let f = fixture(13);
        f.usb.attach("D2", 6);
        let p = provisioner(&f, base_config(), staged(&f, 13, false));

        assert_eq!(run(&f, &p, "D2").await, SetupOutcome::Skipped);

        assert!(f.cloud.calls().is_empty());
        assert_eq!(count_failed(&f.recorder), 0);
        assert_eq!(count_done(&f.recorder), 0);
        assert!(f.tool.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_steps_enabled_completes_once() {
        let f = fixture(13);
        f.usb.attach("D1", 13);
        f.cloud.add_device("D1", Some("old-name"), Some("SN123"));

        let config = ProvisionConfig {
            claim_device: true,
            mark_as_development: true,
            device_name_is_serial_number: true,
            lock_firmware_version: Some(3),
            flash_now: true,
            device_group_name: Some("line-a".into()),
            wait_device_online: true,
            ..base_config()
        };
        let p = provisioner(&f, config, staged(&f, 13, false));
        go_online_when_awaited(&f.correlator, "D1");

        assert_eq!(run(&f, &p, "D1").await, SetupOutcome::Done);
        assert_eq!(count_done(&f.recorder), 1);
        assert_eq!(count_failed(&f.recorder), 0);

        let lines = device_lines(&f.recorder, "D1");
        for expected in [
            "connected by USB",
            "added to product",
            "claiming device",
            "setting device info",
            "assigning device group",
            "flashing a5",
            "flash firmware done!",
            "waiting for device online",
            "setup done!",
        ] {
            assert!(lines.iter().any(|l| l == expected), "missing {expected:?} in {lines:?}");
        }
        assert_eq!(lines.last().map(String::as_str), Some("setup done!"));

        let log_dir = f.logs.dir("D1", false).unwrap().unwrap();
        let log = std::fs::read_to_string(log_dir.join("log.txt")).unwrap();
        let logged: Vec<&str> = log
            .lines()
            .filter_map(|line| line.split_once(": ").map(|(_, msg)| msg))
            .collect();
        for step in [
            "connected by USB",
            "added to product",
            "claiming device",
            "setting device info",
            "assigning device group",
            "flash firmware done!",
            "waiting for device online",
            "setup done!",
        ] {
            assert!(logged.contains(&step), "missing {step:?} in log.txt:\n{log}");
        }

        let updates = f.cloud.updates();
        assert_eq!(updates.len(), 1);
        let update = &updates[0].1;
        assert_eq!(update.name.as_deref(), Some("SN123"));
        assert_eq!(update.development, Some(true));
        assert_eq!(update.desired_firmware_version, Some(3));
        assert_eq!(update.flash, Some(true));
        assert!(
            f.cloud
                .calls()
                .contains(&CloudCall::AssignGroups("D1".into(), vec!["line-a".into()]))
        );
        assert_eq!(f.correlator.device_name("D1").as_deref(), Some("SN123"));

        let record = f.logs.read_json("D1").unwrap();
        assert_eq!(record["claimDevice"], "operator@example.com");
        assert_eq!(record["deviceGroup"], "line-a");
        assert_eq!(record["deviceInfo"]["name"], "SN123");
        assert_eq!(record["flashSuccess"], true);
        assert_eq!(record["online"], true);
        assert_eq!(f.tool.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_flashes_ncp_and_enters_shipping_mode() {
        let f = fixture(TRACKER_PLATFORM_ID);
        f.usb.attach("T1", TRACKER_PLATFORM_ID);
        let config = ProvisionConfig {
            tracker_shipping_mode: true,
            ..base_config()
        };
        let p = provisioner(&f, config, staged(&f, TRACKER_PLATFORM_ID, true));

        assert_eq!(run(&f, &p, "T1").await, SetupOutcome::Done);

        assert_eq!(f.tool.calls().len(), 2);
        let lines = device_lines(&f.recorder, "T1");
        assert!(lines.iter().any(|l| l == "flashing NCP"));
        assert!(lines.iter().any(|l| l == "entered shipping mode"));
        assert_eq!(
            f.usb.control_requests("T1"),
            vec![(SHIPPING_MODE_REQUEST, SHIPPING_MODE_PAYLOAD.to_vec())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_step_reports_failure_once() {
        let f = fixture(13);
        f.usb.attach("D1", 13);
        f.cloud.fail("claim_device");
        let config = ProvisionConfig {
            claim_device: true,
            ..base_config()
        };
        let p = provisioner(&f, config, staged(&f, 13, false));

        assert_eq!(run(&f, &p, "D1").await, SetupOutcome::Failed);
        assert_eq!(count_failed(&f.recorder), 1);
        assert_eq!(count_done(&f.recorder), 0);
        assert!(f.tool.calls().is_empty());
        let lines = device_lines(&f.recorder, "D1");
        assert_eq!(lines.last().map(String::as_str), Some("Exception flashing device"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flash_failure_fails_the_run() {
        let f = fixture(13);
        f.usb.attach("D1", 13);
        f.tool.queue_exit_codes(&[74]);
        let p = provisioner(&f, base_config(), staged(&f, 13, false));

        assert_eq!(run(&f, &p, "D1").await, SetupOutcome::Failed);
        let lines = device_lines(&f.recorder, "D1");
        assert!(lines.iter().any(|l| l == "flash firmware failed"));
        assert_eq!(count_failed(&f.recorder), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_online_timeout_is_a_failure() {
        let f = fixture(13);
        f.usb.attach("D1", 13);
        let config = ProvisionConfig {
            flash_firmware: false,
            wait_device_online: true,
            ..base_config()
        };
        let p = provisioner(&f, config, staged(&f, 13, false));

        assert_eq!(run(&f, &p, "D1").await, SetupOutcome::Failed);
        assert_eq!(f.logs.read_json("D1").unwrap()["online"], false);
        assert_eq!(f.correlator.pending_waits(), 0);
    }
}
