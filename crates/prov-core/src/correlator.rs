//! Event correlator.
//!
//! One persistent subscription to the product event stream resolves one-shot
//! waits registered by provisioning runs. Every event is also recorded in the
//! device's artifact directory when one exists.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::cloud::{CloudApi, RawEvent};
use crate::device_log::DeviceLogs;

/// Event carrying a device's latest diagnostics report.
pub const DIAGNOSTICS_EVENT: &str = "spark/device/diagnostics/update";

/// Delay before reopening a stream that ended or failed to open.
pub const STREAM_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    #[error("timed out waiting for event from {device_id}")]
    Timeout { device_id: String },

    #[error("event correlator dropped the wait")]
    Closed,
}

/// Normalized stream event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    pub event_name: String,
    pub published_at: String,
    /// JSON-decoded payload, or the raw string when it is not JSON.
    pub event_data: Value,
}

impl DeviceEvent {
    fn normalize(raw: &RawEvent, device_name: Option<String>) -> Self {
        let event_data = serde_json::from_str(&raw.data).unwrap_or_else(|_| Value::String(raw.data.clone()));
        Self {
            device_id: raw.coreid.clone(),
            device_name,
            event_name: raw.name.clone(),
            published_at: raw.published_at.clone(),
            event_data,
        }
    }
}

/// What a wait accepts. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub name: Option<String>,
    pub data: Option<Value>,
}

impl EventFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            data: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = Some(data.into());
        self
    }

    fn matches(&self, event: &DeviceEvent) -> bool {
        self.name.as_deref().is_none_or(|n| n == event.event_name)
            && self.data.as_ref().is_none_or(|d| *d == event.event_data)
    }
}

struct Waiter {
    id: u64,
    device_id: String,
    filter: EventFilter,
    tx: oneshot::Sender<DeviceEvent>,
}

#[derive(Default)]
struct State {
    waiters: Vec<Waiter>,
    next_id: u64,
    names: HashMap<String, String>,
}

/// Shared correlator. Clones share state.
#[derive(Clone)]
pub struct EventCorrelator {
    state: Arc<Mutex<State>>,
    logs: DeviceLogs,
    connected: Arc<AtomicBool>,
}

impl EventCorrelator {
    pub fn new(logs: DeviceLogs) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            logs,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Record a device name to attach to its events.
    pub fn set_device_name(&self, device_id: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .names
            .insert(device_id.to_string(), name.to_string());
    }

    pub fn device_name(&self, device_id: &str) -> Option<String> {
        self.state.lock().unwrap().names.get(device_id).cloned()
    }

    pub fn pending_waits(&self) -> usize {
        self.state.lock().unwrap().waiters.len()
    }

    /// Register a wait now; await it later with [`EventWait::wait`].
    pub fn register(&self, device_id: &str, filter: EventFilter) -> EventWait {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.waiters.push(Waiter {
            id,
            device_id: device_id.to_string(),
            filter,
            tx,
        });

        EventWait {
            id,
            device_id: device_id.to_string(),
            rx,
            state: self.state.clone(),
        }
    }

    /// Wait for the first matching event from `device_id`.
    pub async fn wait_for_event(
        &self,
        device_id: &str,
        filter: EventFilter,
        timeout: Option<Duration>,
    ) -> Result<DeviceEvent, WaitError> {
        self.register(device_id, filter).wait(timeout).await
    }

    /// Record one stream event and resolve every wait it matches.
    ///
    /// Returns how many waits were resolved.
    pub fn dispatch(&self, raw: &RawEvent) -> usize {
        let device_name = self.device_name(&raw.coreid);
        let event = DeviceEvent::normalize(raw, device_name);

        self.record(raw, &event);

        let matched: Vec<Waiter> = {
            let mut state = self.state.lock().unwrap();
            let mut matched = Vec::new();
            // Newest registration first
            for i in (0..state.waiters.len()).rev() {
                let waiter = &state.waiters[i];
                if waiter.device_id == event.device_id && waiter.filter.matches(&event) {
                    matched.push(state.waiters.remove(i));
                }
            }
            matched
        };

        let count = matched.len();
        for waiter in matched {
            debug!(device = %waiter.device_id, wait = waiter.id, event = %event.event_name, "Wait resolved");
            // The waiter may have given up already
            let _ = waiter.tx.send(event.clone());
        }
        count
    }

    fn record(&self, raw: &RawEvent, event: &DeviceEvent) {
        let id = &raw.coreid;
        match self.logs.append_event(id, &raw.name, &raw.data, &raw.published_at) {
            Ok(false) => return,
            Ok(true) => {}
            Err(e) => warn!(device = %id, error = %e, "Failed to record event"),
        }

        if raw.name == DIAGNOSTICS_EVENT {
            if let Err(e) = self.logs.write_diagnostics(id, &event.event_data) {
                warn!(device = %id, error = %e, "Failed to write diagnostics");
            }
        }
    }

    /// Start the stream subscription. Later calls are no-ops.
    ///
    /// The subscription reopens after [`STREAM_RETRY_DELAY`] whenever the
    /// stream ends or cannot be opened.
    pub fn connect<C: CloudApi>(&self, cloud: Arc<C>) -> bool {
        if self.connected.swap(true, Ordering::SeqCst) {
            return false;
        }

        let correlator = self.clone();
        tokio::spawn(async move {
            loop {
                match cloud.open_event_stream().await {
                    Ok(mut stream) => {
                        info!("Event stream connected");
                        while let Some(item) = stream.next().await {
                            match item {
                                Ok(raw) => {
                                    correlator.dispatch(&raw);
                                }
                                Err(e) => {
                                    warn!(error = %e, "Event stream error");
                                    break;
                                }
                            }
                        }
                        warn!("Event stream ended");
                    }
                    Err(e) => warn!(error = %e, "Error opening event stream"),
                }
                tokio::time::sleep(STREAM_RETRY_DELAY).await;
            }
        });
        true
    }
}

/// A registered wait. Dropping it unregisters it.
pub struct EventWait {
    id: u64,
    device_id: String,
    rx: oneshot::Receiver<DeviceEvent>,
    state: Arc<Mutex<State>>,
}

impl EventWait {
    pub async fn wait(mut self, timeout: Option<Duration>) -> Result<DeviceEvent, WaitError> {
        match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, &mut self.rx).await {
                Ok(received) => received.map_err(|_| WaitError::Closed),
                Err(_) => Err(WaitError::Timeout {
                    device_id: self.device_id.clone(),
                }),
            },
            None => (&mut self.rx).await.map_err(|_| WaitError::Closed),
        }
    }
}

impl Drop for EventWait {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.waiters.retain(|w| w.id != self.id);
        }
    }
}
