//! Mock USB backend for testing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::traits::{DeviceListing, DfuSelector, TransportError, UsbBackend, UsbDevice};
use super::{DFU_PRODUCT_BASE, NORMAL_PRODUCT_BASE, PARTICLE_VENDOR_ID};

#[derive(Debug, Clone, Default)]
struct MockDeviceState {
    platform_id: u16,
    dfu: bool,
    attached: bool,
    /// Opens that fail before one succeeds.
    open_failures: usize,
    /// Held by another process; every open fails.
    locked: bool,
    opens: usize,
    dfu_requests: usize,
    control_requests: Vec<(u16, Vec<u8>)>,
}

/// Mock USB backend for unit testing the tracker and flash executor.
#[derive(Clone, Default)]
pub struct MockUsb {
    devices: Arc<Mutex<HashMap<String, MockDeviceState>>>,
    order: Arc<Mutex<Vec<String>>>,
}

impl MockUsb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device in normal (non-DFU) mode.
    pub fn attach(&self, id: &str, platform_id: u16) {
        let mut devices = self.devices.lock().unwrap();
        let state = devices.entry(id.to_string()).or_default();
        state.platform_id = platform_id;
        state.attached = true;
        let mut order = self.order.lock().unwrap();
        if !order.iter().any(|d| d == id) {
            order.push(id.to_string());
        }
    }

    /// Simulate unplugging.
    pub fn detach(&self, id: &str) {
        if let Some(state) = self.devices.lock().unwrap().get_mut(id) {
            state.attached = false;
        }
    }

    pub fn set_dfu(&self, id: &str, dfu: bool) {
        self.with_state(id, |s| s.dfu = dfu);
    }

    pub fn set_locked(&self, id: &str, locked: bool) {
        self.with_state(id, |s| s.locked = locked);
    }

    pub fn fail_next_opens(&self, id: &str, count: usize) {
        self.with_state(id, |s| s.open_failures = count);
    }

    pub fn open_count(&self, id: &str) -> usize {
        self.read_state(id, |s| s.opens)
    }

    pub fn dfu_requests(&self, id: &str) -> usize {
        self.read_state(id, |s| s.dfu_requests)
    }

    pub fn control_requests(&self, id: &str) -> Vec<(u16, Vec<u8>)> {
        self.read_state(id, |s| s.control_requests.clone())
    }

    fn with_state(&self, id: &str, f: impl FnOnce(&mut MockDeviceState)) {
        if let Some(state) = self.devices.lock().unwrap().get_mut(id) {
            f(state);
        }
    }

    fn read_state<T: Default>(&self, id: &str, f: impl FnOnce(&MockDeviceState) -> T) -> T {
        self.devices.lock().unwrap().get(id).map(f).unwrap_or_default()
    }
}

fn product_id(platform_id: u16, dfu: bool) -> u16 {
    if dfu {
        DFU_PRODUCT_BASE | platform_id
    } else {
        NORMAL_PRODUCT_BASE | platform_id
    }
}

impl UsbBackend for MockUsb {
    type Device = MockDevice;

    async fn list_devices(&self) -> Result<Vec<DeviceListing>, TransportError> {
        let devices = self.devices.lock().unwrap();
        Ok(self
            .order
            .lock()
            .unwrap()
            .iter()
            .filter_map(|id| {
                let state = devices.get(id).filter(|s| s.attached)?;
                Some(DeviceListing {
                    id: id.clone(),
                    vendor_id: PARTICLE_VENDOR_ID,
                    product_id: product_id(state.platform_id, state.dfu),
                })
            })
            .collect())
    }

    async fn open_by_id(&self, id: &str) -> Result<MockDevice, TransportError> {
        let mut devices = self.devices.lock().unwrap();
        let state = devices
            .get_mut(id)
            .filter(|s| s.attached)
            .ok_or_else(|| TransportError::DeviceNotFound { id: id.to_string() })?;

        if state.locked {
            return Err(TransportError::OpenFailed("device busy".into()));
        }
        if state.open_failures > 0 {
            state.open_failures -= 1;
            return Err(TransportError::OpenFailed("device not ready".into()));
        }
        state.opens += 1;

        Ok(MockDevice {
            id: id.to_string(),
            platform_id: state.platform_id,
            dfu: state.dfu,
            devices: self.devices.clone(),
        })
    }
}

/// Handle returned by [`MockUsb`]. The DFU flag is a snapshot taken at open.
#[derive(Debug)]
pub struct MockDevice {
    id: String,
    platform_id: u16,
    dfu: bool,
    devices: Arc<Mutex<HashMap<String, MockDeviceState>>>,
}

impl UsbDevice for MockDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn vendor_id(&self) -> u16 {
        PARTICLE_VENDOR_ID
    }

    fn product_id(&self) -> u16 {
        product_id(self.platform_id, self.dfu)
    }

    fn platform_id(&self) -> u16 {
        self.platform_id
    }

    fn is_in_dfu_mode(&self) -> bool {
        self.dfu
    }

    fn dfu_selector(&self) -> DfuSelector {
        DfuSelector::Serial(self.id.clone())
    }

    async fn enter_dfu_mode(&self) -> Result<(), TransportError> {
        let mut devices = self.devices.lock().unwrap();
        let state = devices.get_mut(&self.id).ok_or(TransportError::Disconnected)?;
        state.dfu_requests += 1;
        state.dfu = true;
        Ok(())
    }

    async fn send_control_request(&self, request_type: u16, payload: &[u8]) -> Result<(), TransportError> {
        let mut devices = self.devices.lock().unwrap();
        let state = devices.get_mut(&self.id).ok_or(TransportError::Disconnected)?;
        state.control_requests.push((request_type, payload.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_listing_and_open() {
        let usb = MockUsb::new();
        usb.attach("d1", 13);
        usb.attach("d2", 26);
        usb.detach("d2");

        let listed = usb.list_devices().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].product_id, 0xC00D);

        let dev = usb.open_by_id("d1").await.unwrap();
        assert!(!dev.is_in_dfu_mode());
        assert!(usb.open_by_id("d2").await.is_err());
    }

    #[tokio::test]
    async fn test_mock_dfu_visible_after_reopen() {
        let usb = MockUsb::new();
        usb.attach("d1", 13);

        let dev = usb.open_by_id("d1").await.unwrap();
        dev.enter_dfu_mode().await.unwrap();
        assert!(!dev.is_in_dfu_mode());
        drop(dev);

        let dev = usb.open_by_id("d1").await.unwrap();
        assert!(dev.is_in_dfu_mode());
        assert_eq!(dev.product_id(), 0xD00D);
        assert_eq!(usb.dfu_requests("d1"), 1);
    }

    #[tokio::test]
    async fn test_mock_open_failures_and_lock() {
        let usb = MockUsb::new();
        usb.attach("d1", 13);
        usb.fail_next_opens("d1", 2);
        assert!(usb.open_by_id("d1").await.is_err());
        assert!(usb.open_by_id("d1").await.is_err());
        assert!(usb.open_by_id("d1").await.is_ok());

        usb.set_locked("d1", true);
        assert!(usb.open_by_id("d1").await.is_err());
        assert_eq!(usb.open_count("d1"), 1);
    }
}
