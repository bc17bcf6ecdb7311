//! DFU flash executor.
//!
//! Drives one device through DFU entry, writes each part of a [`FlashPlan`]
//! with the external flashing utility and reconnects after every part.
//!
//! Phase flow:
//!
//! ```text
//! NotInDfu -> EnteringDfu -> InDfu(i) -> Flashed(i) -> Reopening -> InDfu(i+1) ... -> Done
//!                                                  \-> Failed
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::dfu_util::{FlashTool, ToolError, dfu_util_args};
use crate::events::Reporter;
use crate::plan::{FlashPart, FlashPlan, PartName};
use crate::tracker::SessionHandle;
use crate::transport::{UsbBackend, UsbDevice};

#[derive(Error, Debug)]
pub enum FlashError {
    #[error("flashing {part} failed with exit code {exit_code}")]
    PartFailed { part: PartName, exit_code: i32 },

    #[error("flashing {part}: {source}")]
    Tool {
        part: PartName,
        #[source]
        source: ToolError,
    },

    #[error("device lost before flashing {part}")]
    DeviceLost { part: PartName },

    #[error("could not reopen device {id} after {attempts} attempts")]
    Reopen { id: String, attempts: u32 },
}

/// Executor phase, reported on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashPhase {
    NotInDfu,
    EnteringDfu,
    InDfu(usize),
    Flashed(usize),
    Reopening,
    Done,
    Failed,
}

impl fmt::Display for FlashPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashPhase::NotInDfu => write!(f, "not in DFU"),
            FlashPhase::EnteringDfu => write!(f, "entering DFU"),
            FlashPhase::InDfu(i) => write!(f, "in DFU (part {i})"),
            FlashPhase::Flashed(i) => write!(f, "flashed (part {i})"),
            FlashPhase::Reopening => write!(f, "reopening"),
            FlashPhase::Done => write!(f, "done"),
            FlashPhase::Failed => write!(f, "failed"),
        }
    }
}

/// Timing knobs. Defaults match what the hardware needs.
#[derive(Debug, Clone)]
pub struct FlashSettings {
    /// Bound on one flashing utility run; also the disconnect timeout while flashing.
    pub flash_timeout: Duration,
    /// Wait after asking the device to enter DFU mode.
    pub dfu_settle: Duration,
    /// Wait after a part with `leave` set, while the device reboots.
    pub leave_settle: Duration,
    pub reopen_attempts: u32,
    pub reopen_delay: Duration,
}

impl Default for FlashSettings {
    fn default() -> Self {
        Self {
            flash_timeout: Duration::from_millis(120_000),
            dfu_settle: Duration::from_secs(2),
            leave_settle: Duration::from_secs(8),
            reopen_attempts: 10,
            reopen_delay: Duration::from_secs(2),
        }
    }
}

/// Open `id`, retrying up to `attempts` times `delay` apart.
pub async fn reopen_device<U: UsbBackend>(usb: &U, id: &str, attempts: u32, delay: Duration) -> Option<U::Device> {
    for attempt in 1..=attempts {
        match usb.open_by_id(id).await {
            Ok(device) => return Some(device),
            Err(e) => debug!(device = %id, attempt, error = %e, "Reopen failed"),
        }
        tokio::time::sleep(delay).await;
    }
    None
}

pub struct FlashExecutor<U, T> {
    usb: Arc<U>,
    tool: Arc<T>,
    settings: FlashSettings,
    reporter: Reporter,
}

impl<U, T> FlashExecutor<U, T>
where
    U: UsbBackend,
    T: FlashTool,
{
    pub fn new(usb: Arc<U>, tool: Arc<T>, settings: FlashSettings, reporter: Reporter) -> Self {
        Self {
            usb,
            tool,
            settings,
            reporter,
        }
    }

    /// Write every part of `plan` to `device`.
    ///
    /// Returns the reopened handle, or `None` if the device did not come back
    /// after the last part.
    #[instrument(skip_all, fields(device = %session.id(), parts = plan.len()))]
    pub async fn flash_firmware(
        &self,
        device: U::Device,
        plan: &FlashPlan,
        session: &SessionHandle,
    ) -> Result<Option<U::Device>, FlashError> {
        let id = session.id().to_string();
        session.extend_timeout(self.settings.flash_timeout);

        let result = self.flash_parts(&id, device, plan, session).await;
        session.restore_timeout();

        match &result {
            Ok(_) => {
                self.transition(&id, FlashPhase::Done, plan);
                if let Err(e) = self.reporter.logs().merge_json(&id, json!({ "flashSuccess": true })) {
                    warn!(device = %id, error = %e, "Failed to record flash result");
                }
            }
            Err(e) => {
                warn!(device = %id, error = %e, "Flash failed");
                self.transition(&id, FlashPhase::Failed, plan);
            }
        }
        result
    }

    async fn flash_parts(
        &self,
        id: &str,
        device: U::Device,
        plan: &FlashPlan,
        session: &SessionHandle,
    ) -> Result<Option<U::Device>, FlashError> {
        let mut device = Some(self.enter_dfu(id, device, plan).await?);

        for (index, part) in plan.parts.iter().enumerate() {
            let current = device.take().ok_or(FlashError::DeviceLost { part: part.name })?;
            self.transition(id, FlashPhase::InDfu(index), plan);

            let args = dfu_util_args(
                current.vendor_id(),
                current.product_id(),
                &current.dfu_selector(),
                part,
            );
            // The utility needs exclusive access
            drop(current);

            let output = match self.tool.run(&args, self.settings.flash_timeout).await {
                Ok(output) => output,
                Err(source) => {
                    self.reporter
                        .device_log(id, format!("flashing {} by DFU failed", part.name));
                    return Err(FlashError::Tool {
                        part: part.name,
                        source,
                    });
                }
            };
            self.transition(id, FlashPhase::Flashed(index), plan);

            if let Err(e) = self
                .reporter
                .logs()
                .append_tool_transcript(id, part.name.as_str(), &output.output)
            {
                warn!(device = %id, part = %part.name, error = %e, "Failed to write transcript");
            }

            device = self.reconnect(id, part, plan).await;
            session.touch();

            if !output.success() {
                self.reporter
                    .device_log(id, format!("flashing {} by DFU failed", part.name));
                return Err(FlashError::PartFailed {
                    part: part.name,
                    exit_code: output.exit_code,
                });
            }
        }

        Ok(device)
    }

    async fn enter_dfu(&self, id: &str, mut device: U::Device, plan: &FlashPlan) -> Result<U::Device, FlashError> {
        if !device.is_in_dfu_mode() {
            self.transition(id, FlashPhase::NotInDfu, plan);
        }

        // The device decides when it is in DFU mode; no bound here
        while !device.is_in_dfu_mode() {
            self.transition(id, FlashPhase::EnteringDfu, plan);

            // The device resets mid-request, so an error here is expected
            if let Err(e) = device.enter_dfu_mode().await {
                debug!(device = %id, error = %e, "Enter DFU request returned an error");
            }
            drop(device);

            tokio::time::sleep(self.settings.dfu_settle).await;

            device = reopen_device(
                self.usb.as_ref(),
                id,
                self.settings.reopen_attempts,
                self.settings.reopen_delay,
            )
            .await
            .ok_or_else(|| FlashError::Reopen {
                id: id.to_string(),
                attempts: self.settings.reopen_attempts,
            })?;
        }

        Ok(device)
    }

    async fn reconnect(&self, id: &str, part: &FlashPart, plan: &FlashPlan) -> Option<U::Device> {
        if part.leave {
            tokio::time::sleep(self.settings.leave_settle).await;
        }

        self.transition(id, FlashPhase::Reopening, plan);
        let device = reopen_device(
            self.usb.as_ref(),
            id,
            self.settings.reopen_attempts,
            self.settings.reopen_delay,
        )
        .await;

        if device.is_none() {
            warn!(device = %id, part = %part.name, "Device did not come back after flashing");
        }
        device
    }

    fn transition(&self, id: &str, phase: FlashPhase, plan: &FlashPlan) {
        debug!(device = %id, phase = %phase, "Flash phase");

        let msg = match phase {
            FlashPhase::NotInDfu => "device not in DFU mode".to_string(),
            FlashPhase::EnteringDfu => "entering DFU mode".to_string(),
            FlashPhase::InDfu(i) => {
                let part = &plan.parts[i];
                info!(
                    device = %id,
                    part = %part.name,
                    alt = part.alt_setting,
                    address = %format!("0x{:08x}", part.address),
                    "Flashing part"
                );
                format!("flashing {}", part.name)
            }
            FlashPhase::Flashed(i) => format!("flashed {}", plan.parts[i].name),
            FlashPhase::Reopening => "reopening device".to_string(),
            FlashPhase::Done => "flash firmware done!".to_string(),
            FlashPhase::Failed => "flash firmware failed".to_string(),
        };
        self.reporter.device_log(id, msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use tokio::time::Instant;

    use crate::device_log::DeviceLogs;
    use crate::dfu_util::MockFlashTool;
    use crate::events::{RecordingObserver, StatusEvent};
    use crate::tracker::{DEFAULT_DISCONNECT_TIMEOUT, SessionTable};
    use crate::transport::MockUsb;

    struct Fixture {
        usb: MockUsb,
        tool: MockFlashTool,
        recorder: Arc<RecordingObserver>,
        sessions: SessionTable,
        executor: FlashExecutor<MockUsb, MockFlashTool>,
        dir: tempfile::TempDir,
        logs: DeviceLogs,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let logs = DeviceLogs::new(dir.path());
        let usb = MockUsb::new();
        usb.attach("d1", 13);
        let tool = MockFlashTool::new();
        let recorder = Arc::new(RecordingObserver::new());
        let reporter = Reporter::new(recorder.clone(), logs.clone());
        let executor = FlashExecutor::new(
            Arc::new(usb.clone()),
            Arc::new(tool.clone()),
            FlashSettings::default(),
            reporter,
        );
        let sessions = SessionTable::new();
        sessions.touch("d1", Instant::now());
        Fixture {
            usb,
            tool,
            recorder,
            sessions,
            executor,
            dir,
            logs,
        }
    }

    fn plan(names: &[PartName]) -> FlashPlan {
        FlashPlan {
            parts: names
                .iter()
                .enumerate()
                .map(|(i, &name)| FlashPart {
                    name,
                    binary_path: PathBuf::from(format!("/staging/{name}.bin")),
                    address: 0x30000 + i as u32 * 0x1000,
                    alt_setting: 0,
                    leave: name == PartName::A5,
                })
                .collect(),
        }
    }

    fn device_logs(recorder: &RecordingObserver) -> Vec<String> {
        recorder
            .events()
            .into_iter()
            .filter_map(|e| match e {
                StatusEvent::DeviceLog { msg, .. } => Some(msg),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_plan_enters_dfu_and_flashes_in_order() {
        let f = fixture();
        let device = f.usb.open_by_id("d1").await.unwrap();
        let plan = plan(&[PartName::SystemPart1, PartName::Firmware, PartName::A5]);
        let session = f.sessions.handle("d1");

        let device = f.executor.flash_firmware(device, &plan, &session).await.unwrap();
        assert!(device.unwrap().is_in_dfu_mode());

        assert_eq!(f.usb.dfu_requests("d1"), 1);
        let calls = f.tool.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0][1], "0x2b04:0xd00d");
        assert!(calls[2].contains(&"0x00032000:leave".to_string()));

        assert_eq!(
            device_logs(&f.recorder),
            vec![
                "device not in DFU mode",
                "entering DFU mode",
                "flashing system-part1",
                "flashed system-part1",
                "reopening device",
                "flashing firmware",
                "flashed firmware",
                "reopening device",
                "flashing a5",
                "flashed a5",
                "reopening device",
                "flash firmware done!"
            ]
        );
        assert_eq!(f.logs.read_json("d1").unwrap()["flashSuccess"], true);
        assert_eq!(session.disconnect_timeout(), Some(DEFAULT_DISCONNECT_TIMEOUT));
        assert!(f.dir.path().join("d1/dfu-a5.txt").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_part_stops_the_plan() {
        let f = fixture();
        f.tool.queue_exit_codes(&[0, 74]);
        let device = f.usb.open_by_id("d1").await.unwrap();
        let plan = plan(&[PartName::SystemPart1, PartName::SystemPart2, PartName::Firmware]);

        let err = f
            .executor
            .flash_firmware(device, &plan, &f.sessions.handle("d1"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            FlashError::PartFailed {
                part: PartName::SystemPart2,
                exit_code: 74
            }
        ));
        assert_eq!(f.tool.calls().len(), 2);
        assert!(device_logs(&f.recorder).contains(&"flashing system-part2 by DFU failed".to_string()));
        assert!(f.logs.read_json("d1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_device_fails_next_part() {
        let f = fixture();
        f.usb.set_dfu("d1", true);
        let device = f.usb.open_by_id("d1").await.unwrap();
        f.usb.fail_next_opens("d1", 100);
        let plan = plan(&[PartName::SystemPart1, PartName::Firmware]);

        let start = Instant::now();
        let err = f
            .executor
            .flash_firmware(device, &plan, &f.sessions.handle("d1"))
            .await
            .unwrap_err();

        assert!(matches!(err, FlashError::DeviceLost { part: PartName::Firmware }));
        assert_eq!(f.tool.calls().len(), 1);
        assert_eq!(f.usb.dfu_requests("d1"), 0);
        assert!(start.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_extended_while_flashing() {
        let f = fixture();
        f.usb.set_dfu("d1", true);
        let device = f.usb.open_by_id("d1").await.unwrap();
        let session = f.sessions.handle("d1");

        // Observe the timeout from inside a run via the tool
        struct TimeoutSpy {
            session: SessionHandle,
            seen: std::sync::Mutex<Option<Duration>>,
        }
        impl FlashTool for TimeoutSpy {
            async fn run(&self, _args: &[String], _timeout: Duration) -> Result<crate::dfu_util::ToolOutput, ToolError> {
                *self.seen.lock().unwrap() = self.session.disconnect_timeout();
                Ok(crate::dfu_util::ToolOutput {
                    exit_code: 0,
                    output: String::new(),
                })
            }
        }
        let spy = Arc::new(TimeoutSpy {
            session: session.clone(),
            seen: std::sync::Mutex::new(None),
        });
        let executor = FlashExecutor::new(
            Arc::new(f.usb.clone()),
            spy.clone(),
            FlashSettings::default(),
            Reporter::new(f.recorder.clone(), f.logs.clone()),
        );

        executor
            .flash_firmware(device, &plan(&[PartName::Firmware]), &session)
            .await
            .unwrap();
        assert_eq!(*spy.seen.lock().unwrap(), Some(Duration::from_millis(120_000)));
        assert_eq!(session.disconnect_timeout(), Some(DEFAULT_DISCONNECT_TIMEOUT));
    }
}
