//! In-memory cloud for tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use serde_json::Map;
use tokio::sync::mpsc;

use super::{
    CloudApi, CloudError, DeviceInfo, DevicePage, DeviceUpdate, EventStream, PageMeta, Product, ProductFirmware,
    RawEvent, UserInfo,
};

/// A recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudCall {
    AddDevice(String),
    GetDevice(String),
    ClaimDevice(String),
    UpdateDevice(String),
    AssignGroups(String, Vec<String>),
    SignalDevice(String),
    ListDevices(u32),
    DownloadFirmware(u32),
}

#[derive(Default)]
struct State {
    product: Option<Product>,
    firmware: Vec<ProductFirmware>,
    binaries: HashMap<u32, Bytes>,
    devices: Vec<DeviceInfo>,
    updates: Vec<(String, DeviceUpdate)>,
    calls: Vec<CloudCall>,
    failing: HashSet<&'static str>,
    page_size: usize,
    stream_opens: usize,
}

/// Mock cloud. Events pushed with [`MockCloud::publish`] reach the stream
/// opened by [`CloudApi::open_event_stream`].
#[derive(Clone)]
pub struct MockCloud {
    state: Arc<Mutex<State>>,
    events_tx: mpsc::UnboundedSender<RawEvent>,
    events_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<RawEvent>>>>,
}

impl Default for MockCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCloud {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = State {
            page_size: 25,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            events_tx,
            events_rx: Arc::new(Mutex::new(Some(events_rx))),
        }
    }

    pub fn with_product(self, id: u32, platform_id: u16) -> Self {
        self.state.lock().unwrap().product = Some(Product {
            id,
            platform_id,
            name: format!("product {id}"),
            extra: Map::new(),
        });
        self
    }

    pub fn add_firmware(&self, version: u32, product_default: bool, binary: impl Into<Bytes>) {
        let mut state = self.state.lock().unwrap();
        state.firmware.push(ProductFirmware {
            version,
            title: format!("v{version}"),
            product_default,
        });
        state.binaries.insert(version, binary.into());
    }

    pub fn add_device(&self, id: &str, name: Option<&str>, serial_number: Option<&str>) {
        self.state.lock().unwrap().devices.push(DeviceInfo {
            id: id.to_string(),
            name: name.map(str::to_string),
            serial_number: serial_number.map(str::to_string),
            extra: Map::new(),
        });
    }

    pub fn set_page_size(&self, size: usize) {
        self.state.lock().unwrap().page_size = size.max(1);
    }

    /// Make every call of `method` (e.g. `"claim_device"`) fail.
    pub fn fail(&self, method: &'static str) {
        self.state.lock().unwrap().failing.insert(method);
    }

    pub fn publish(&self, event: RawEvent) {
        // Receiver gone just means nobody is listening
        let _ = self.events_tx.send(event);
    }

    pub fn calls(&self) -> Vec<CloudCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn updates(&self) -> Vec<(String, DeviceUpdate)> {
        self.state.lock().unwrap().updates.clone()
    }

    pub fn stream_opens(&self) -> usize {
        self.state.lock().unwrap().stream_opens
    }

    fn record(&self, method: &'static str, call: Option<CloudCall>) -> Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();
        if let Some(call) = call {
            state.calls.push(call);
        }
        if state.failing.contains(method) {
            return Err(CloudError::Other(format!("{method} failed")));
        }
        Ok(())
    }
}

impl CloudApi for MockCloud {
    async fn get_product(&self) -> Result<Product, CloudError> {
        self.record("get_product", None)?;
        self.state
            .lock()
            .unwrap()
            .product
            .clone()
            .ok_or_else(|| CloudError::Other("no product".into()))
    }

    async fn list_product_firmware(&self) -> Result<Vec<ProductFirmware>, CloudError> {
        self.record("list_product_firmware", None)?;
        Ok(self.state.lock().unwrap().firmware.clone())
    }

    async fn download_product_firmware(&self, version: u32) -> Result<Bytes, CloudError> {
        self.record("download_product_firmware", Some(CloudCall::DownloadFirmware(version)))?;
        self.state
            .lock()
            .unwrap()
            .binaries
            .get(&version)
            .cloned()
            .ok_or_else(|| CloudError::Other(format!("no firmware {version}")))
    }

    async fn list_devices(&self, page: u32) -> Result<DevicePage, CloudError> {
        self.record("list_devices", Some(CloudCall::ListDevices(page)))?;
        let state = self.state.lock().unwrap();
        let total_pages = state.devices.len().div_ceil(state.page_size) as u32;
        let devices = state
            .devices
            .chunks(state.page_size)
            .nth(page.saturating_sub(1) as usize)
            .map(<[DeviceInfo]>::to_vec)
            .unwrap_or_default();
        Ok(DevicePage {
            devices,
            meta: PageMeta { total_pages },
        })
    }

    async fn add_device_to_product(&self, device_id: &str) -> Result<(), CloudError> {
        self.record("add_device_to_product", Some(CloudCall::AddDevice(device_id.into())))?;
        let mut state = self.state.lock().unwrap();
        if !state.devices.iter().any(|d| d.id == device_id) {
            state.devices.push(DeviceInfo {
                id: device_id.to_string(),
                name: None,
                serial_number: None,
                extra: Map::new(),
            });
        }
        Ok(())
    }

    async fn get_device(&self, device_id: &str) -> Result<DeviceInfo, CloudError> {
        self.record("get_device", Some(CloudCall::GetDevice(device_id.into())))?;
        self.state
            .lock()
            .unwrap()
            .devices
            .iter()
            .find(|d| d.id == device_id)
            .cloned()
            .ok_or_else(|| CloudError::Status {
                method: "GET".into(),
                url: format!("/devices/{device_id}"),
                status: 404,
                body: String::new(),
            })
    }

    async fn current_user(&self) -> Result<UserInfo, CloudError> {
        self.record("current_user", None)?;
        Ok(UserInfo {
            username: "operator@example.com".into(),
        })
    }

    async fn claim_device(&self, device_id: &str) -> Result<(), CloudError> {
        self.record("claim_device", Some(CloudCall::ClaimDevice(device_id.into())))
    }

    async fn update_device(&self, device_id: &str, update: &DeviceUpdate) -> Result<(), CloudError> {
        self.record("update_device", Some(CloudCall::UpdateDevice(device_id.into())))?;
        let mut state = self.state.lock().unwrap();
        state.updates.push((device_id.to_string(), update.clone()));
        if let Some(name) = &update.name {
            if let Some(device) = state.devices.iter_mut().find(|d| d.id == device_id) {
                device.name = Some(name.clone());
            }
        }
        Ok(())
    }

    async fn assign_device_groups(&self, device_id: &str, groups: &[String]) -> Result<(), CloudError> {
        self.record(
            "assign_device_groups",
            Some(CloudCall::AssignGroups(device_id.into(), groups.to_vec())),
        )
    }

    async fn signal_device(&self, device_id: &str) -> Result<(), CloudError> {
        self.record("signal_device", Some(CloudCall::SignalDevice(device_id.into())))
    }

    async fn open_event_stream(&self) -> Result<EventStream, CloudError> {
        self.record("open_event_stream", None)?;
        self.state.lock().unwrap().stream_opens += 1;

        let rx = self.events_rx.lock().unwrap().take().ok_or(CloudError::StreamClosed)?;
        Ok(stream::unfold(rx, |mut rx| async move {
            let event = rx.recv().await?;
            Some((Ok(event), rx))
        })
        .boxed())
    }
}
