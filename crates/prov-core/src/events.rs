//! Status events for UI decoupling.
//!
//! The console, the live status stream and tests all subscribe to the same
//! discrete events without coupling to the provisioning logic.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::device_log::DeviceLogs;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Events published to status observers.
///
/// Serializes with an `op` tag, the shape the status stream sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum StatusEvent {
    /// General log line.
    Log { level: LogLevel, msg: String },
    /// Log line about one device.
    DeviceLog { id: String, msg: String },
    /// Device metadata snapshot from the cloud.
    DeviceInfo { id: String, info: serde_json::Value },
    /// Device session evicted after it stopped showing up on USB.
    UsbDisconnect { id: String },
    /// Provisioning finished for the device.
    SetupDone { id: String },
    /// Provisioning failed for the device.
    SetupFailed { id: String },
}

impl StatusEvent {
    pub fn device_id(&self) -> Option<&str> {
        match self {
            StatusEvent::Log { .. } => None,
            StatusEvent::DeviceLog { id, .. }
            | StatusEvent::DeviceInfo { id, .. }
            | StatusEvent::UsbDisconnect { id }
            | StatusEvent::SetupDone { id }
            | StatusEvent::SetupFailed { id } => Some(id),
        }
    }
}

/// Observer trait for receiving status events.
pub trait StatusObserver: Send + Sync {
    fn on_event(&self, event: &StatusEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl StatusObserver for NullObserver {
    fn on_event(&self, _event: &StatusEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl StatusObserver for TracingObserver {
    fn on_event(&self, event: &StatusEvent) {
        match event {
            StatusEvent::Log { level, msg } => match level {
                LogLevel::Debug => tracing::debug!("{}", msg),
                LogLevel::Info => tracing::info!("{}", msg),
                LogLevel::Warn => tracing::warn!("{}", msg),
                LogLevel::Error => tracing::error!("{}", msg),
            },
            StatusEvent::DeviceLog { id, msg } => {
                tracing::info!(device = %id, "{}", msg);
            }
            StatusEvent::DeviceInfo { id, info } => {
                tracing::debug!(device = %id, info = %info, "Device info");
            }
            StatusEvent::UsbDisconnect { id } => {
                tracing::info!(device = %id, "USB disconnected");
            }
            StatusEvent::SetupDone { id } => {
                tracing::info!(device = %id, "Setup done");
            }
            StatusEvent::SetupFailed { id } => {
                tracing::error!(device = %id, "Setup failed");
            }
        }
    }
}

/// Observer feeding a broadcast channel, for the live status stream.
pub struct BroadcastObserver {
    tx: broadcast::Sender<StatusEvent>,
}

impl BroadcastObserver {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }
}

impl StatusObserver for BroadcastObserver {
    fn on_event(&self, event: &StatusEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event.clone());
    }
}

/// Observer that keeps every event, for tests and diagnostics.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<StatusEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_for(&self, id: &str) -> Vec<StatusEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.device_id() == Some(id))
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&StatusEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}

impl StatusObserver for RecordingObserver {
    fn on_event(&self, event: &StatusEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Fan-out to several observers.
#[derive(Default, Clone)]
pub struct Observers(Vec<Arc<dyn StatusObserver>>);

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn StatusObserver>) -> Self {
        self.0.push(observer);
        self
    }
}

impl StatusObserver for Observers {
    fn on_event(&self, event: &StatusEvent) {
        for observer in &self.0 {
            observer.on_event(event);
        }
    }
}

/// Emits status events and mirrors per-device lines into the device log.
#[derive(Clone)]
pub struct Reporter {
    observer: Arc<dyn StatusObserver>,
    logs: DeviceLogs,
}

impl Reporter {
    pub fn new(observer: Arc<dyn StatusObserver>, logs: DeviceLogs) -> Self {
        Self { observer, logs }
    }

    pub fn logs(&self) -> &DeviceLogs {
        &self.logs
    }

    pub fn emit(&self, event: StatusEvent) {
        self.observer.on_event(&event);
    }

    pub fn log(&self, level: LogLevel, msg: impl Into<String>) {
        self.emit(StatusEvent::Log {
            level,
            msg: msg.into(),
        });
    }

    pub fn device_log(&self, id: &str, msg: impl Into<String>) {
        let msg = msg.into();
        if let Err(e) = self.logs.append_log(id, &msg) {
            tracing::warn!(device = %id, error = %e, "Failed to write device log");
        }
        self.emit(StatusEvent::DeviceLog {
            id: id.to_string(),
            msg,
        });
    }

    pub fn device_info(&self, id: &str, info: serde_json::Value) {
        self.emit(StatusEvent::DeviceInfo {
            id: id.to_string(),
            info,
        });
    }
}
