//! Per-device artifacts.
//!
//! Each device id gets its own directory under the logs root holding:
//! - `log.txt`: timestamped provisioning log lines
//! - `device.json`: merged metadata snapshot
//! - `events.txt`: cloud events seen while the device is tracked
//! - `diag.json`: latest diagnostics report
//! - `dfu-<part>.txt`: flashing utility transcript per part

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{Map, Value};

#[derive(Debug, Clone)]
pub struct DeviceLogs {
    root: PathBuf,
}

impl DeviceLogs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory for a device; `None` if absent and `create` is false.
    pub fn dir(&self, device_id: &str, create: bool) -> io::Result<Option<PathBuf>> {
        let dir = self.root.join(device_id);
        if !dir.is_dir() {
            if !create {
                return Ok(None);
            }
            fs::create_dir_all(&dir)?;
        }
        Ok(Some(dir))
    }

    fn created_dir(&self, device_id: &str) -> io::Result<PathBuf> {
        let dir = self.root.join(device_id);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn append_log(&self, device_id: &str, msg: &str) -> io::Result<()> {
        let path = self.created_dir(device_id)?.join("log.txt");
        append(&path, &format!("{}: {}\n", timestamp(), msg))
    }

    /// Merge the top-level keys of `obj` into `device.json`.
    pub fn merge_json(&self, device_id: &str, obj: Value) -> io::Result<()> {
        let path = self.created_dir(device_id)?.join("device.json");

        let mut merged: Map<String, Value> = fs::read(&path)
            .ok()
            .and_then(|data| serde_json::from_slice(&data).ok())
            .unwrap_or_default();

        if let Value::Object(map) = obj {
            merged.extend(map);
        }

        let text = serde_json::to_string_pretty(&Value::Object(merged))?;
        fs::write(path, text)
    }

    pub fn read_json(&self, device_id: &str) -> Option<Value> {
        let data = fs::read(self.root.join(device_id).join("device.json")).ok()?;
        serde_json::from_slice(&data).ok()
    }

    /// Append a cloud event; skipped for devices without a log directory.
    pub fn append_event(
        &self,
        device_id: &str,
        name: &str,
        data: &str,
        published_at: &str,
    ) -> io::Result<bool> {
        let Some(dir) = self.dir(device_id, false)? else {
            return Ok(false);
        };
        let entry = format!("name: {name}\ndata: {data}\ntime: {published_at}\n\n");
        append(&dir.join("events.txt"), &entry)?;
        Ok(true)
    }

    /// Overwrite the diagnostics snapshot; skipped for untracked devices.
    pub fn write_diagnostics(&self, device_id: &str, diag: &Value) -> io::Result<bool> {
        let Some(dir) = self.dir(device_id, false)? else {
            return Ok(false);
        };
        fs::write(dir.join("diag.json"), serde_json::to_string_pretty(diag)?)?;
        Ok(true)
    }

    pub fn append_tool_transcript(&self, device_id: &str, part: &str, output: &str) -> io::Result<()> {
        let path = self.created_dir(device_id)?.join(format!("dfu-{part}.txt"));
        append(&path, &format!("{}:\n{}\n\n", timestamp(), output))
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn append(path: &Path, text: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(text.as_bytes())
}
