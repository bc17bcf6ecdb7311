//! External flashing utility.
//!
//! Parts are written by `dfu-util`, run as a bounded subprocess:
//!
//! ```text
//! dfu-util -d <vid:pid> (-p <bus-port> | -S <serial>) -a <alt> -s <addr>[:leave] -D <file>
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::plan::FlashPart;
use crate::transport::DfuSelector;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("{tool} process error: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} has timed out after {}s", timeout.as_secs())]
    TimedOut { tool: String, timeout: Duration },

    #[error("{tool} was terminated by a signal")]
    Terminated { tool: String },
}

/// Result of one tool run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub exit_code: i32,
    /// Combined stdout and stderr.
    pub output: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs the flashing utility.
pub trait FlashTool: Send + Sync + 'static {
    fn run(
        &self,
        args: &[String],
        timeout: Duration,
    ) -> impl Future<Output = Result<ToolOutput, ToolError>> + Send;
}

fn hex16(n: u16) -> String {
    format!("0x{:04x}", n)
}

fn hex32(n: u32) -> String {
    format!("0x{:08x}", n)
}

/// Argument list for writing `part` to the device.
pub fn dfu_util_args(vendor_id: u16, product_id: u16, selector: &DfuSelector, part: &FlashPart) -> Vec<String> {
    let mut args = vec!["-d".to_string(), format!("{}:{}", hex16(vendor_id), hex16(product_id))];

    match selector {
        DfuSelector::BusPort(port) => args.extend(["-p".to_string(), port.clone()]),
        DfuSelector::Serial(serial) => args.extend(["-S".to_string(), serial.clone()]),
    }

    let address = if part.leave {
        format!("{}:leave", hex32(part.address))
    } else {
        hex32(part.address)
    };

    args.extend([
        "-a".to_string(),
        part.alt_setting.to_string(),
        "-s".to_string(),
        address,
        "-D".to_string(),
        part.binary_path.display().to_string(),
    ]);
    args
}

/// `dfu-util` executable.
#[derive(Debug, Clone)]
pub struct DfuUtil {
    program: PathBuf,
}

impl DfuUtil {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn name(&self) -> String {
        self.program.display().to_string()
    }
}

impl Default for DfuUtil {
    fn default() -> Self {
        Self::new("dfu-util")
    }
}

impl FlashTool for DfuUtil {
    #[instrument(skip(self), fields(tool = %self.program.display()))]
    async fn run(&self, args: &[String], timeout: Duration) -> Result<ToolOutput, ToolError> {
        let child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                tool: self.name(),
                source,
            })?;

        // Dropping the child on timeout kills it
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| ToolError::TimedOut {
                tool: self.name(),
                timeout,
            })?
            .map_err(|source| ToolError::Spawn {
                tool: self.name(),
                source,
            })?;

        let exit_code = output.status.code().ok_or_else(|| ToolError::Terminated { tool: self.name() })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        debug!(exit_code, "Tool finished");
        Ok(ToolOutput {
            exit_code,
            output: combined,
        })
    }
}

/// Scripted tool for tests: returns queued exit codes and records every call.
#[derive(Clone, Default)]
pub struct MockFlashTool {
    exit_codes: Arc<Mutex<VecDeque<i32>>>,
    calls: Arc<Mutex<Vec<Vec<String>>>>,
}

impl MockFlashTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue exit codes; once drained every run exits 0.
    pub fn queue_exit_codes(&self, codes: &[i32]) {
        self.exit_codes.lock().unwrap().extend(codes.iter().copied());
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

impl FlashTool for MockFlashTool {
    async fn run(&self, args: &[String], _timeout: Duration) -> Result<ToolOutput, ToolError> {
        self.calls.lock().unwrap().push(args.to_vec());
        let exit_code = self.exit_codes.lock().unwrap().pop_front().unwrap_or(0);
        Ok(ToolOutput {
            exit_code,
            output: format!("mock dfu-util exit {exit_code}\n"),
        })
    }
}
