//! nusb-based USB backend.
//!
//! nusb calls are blocking behind `.wait()`, so each one runs on the tokio
//! blocking pool. Control requests use the service handshake in
//! [`super::control`].

use std::time::Duration;

use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient};
use nusb::{Interface, MaybeFuture, list_devices};
use tracing::{debug, instrument};

use super::control::{ControlPipe, ServiceTiming, ServiceType, send_service_request};
use super::traits::{DeviceListing, DfuSelector, TransportError, UsbBackend, UsbDevice};
use super::{DFU_PRODUCT_BASE, PARTICLE_VENDOR_ID, PRODUCT_MODE_MASK};

/// Request type asking the device to reboot into DFU mode.
pub const REQUEST_ENTER_DFU_MODE: u16 = 50;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(2);

/// nusb-based backend matching devices by vendor id.
#[derive(Debug, Clone)]
pub struct NusbBackend {
    vendor_id: u16,
}

impl Default for NusbBackend {
    fn default() -> Self {
        Self {
            vendor_id: PARTICLE_VENDOR_ID,
        }
    }
}

impl NusbBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn matching_devices(vendor_id: u16) -> Result<Vec<nusb::DeviceInfo>, TransportError> {
    Ok(list_devices()
        .wait()
        .map_err(|e| TransportError::EnumerateFailed(e.to_string()))?
        .filter(|d| d.vendor_id() == vendor_id && d.serial_number().is_some())
        .collect())
}

fn device_id(info: &nusb::DeviceInfo) -> Option<String> {
    info.serial_number().map(|s| s.to_ascii_lowercase())
}

fn bus_port(info: &nusb::DeviceInfo) -> String {
    let bus = info
        .bus_id()
        .parse::<u32>()
        .map(|n| n.to_string())
        .unwrap_or_else(|_| info.bus_id().to_string());
    let ports: Vec<String> = info.port_chain().iter().map(|p| p.to_string()).collect();
    format!("{}-{}", bus, ports.join("."))
}

impl UsbBackend for NusbBackend {
    type Device = NusbDevice;

    async fn list_devices(&self) -> Result<Vec<DeviceListing>, TransportError> {
        let vendor_id = self.vendor_id;
        let infos = tokio::task::spawn_blocking(move || matching_devices(vendor_id))
            .await
            .map_err(|e| TransportError::EnumerateFailed(e.to_string()))??;

        Ok(infos
            .iter()
            .filter_map(|info| {
                Some(DeviceListing {
                    id: device_id(info)?,
                    vendor_id: info.vendor_id(),
                    product_id: info.product_id(),
                })
            })
            .collect())
    }

    #[instrument(level = "debug", skip(self))]
    async fn open_by_id(&self, id: &str) -> Result<NusbDevice, TransportError> {
        let vendor_id = self.vendor_id;
        let id = id.to_string();
        tokio::task::spawn_blocking(move || open_blocking(vendor_id, id))
            .await
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
    }
}

fn open_blocking(vendor_id: u16, id: String) -> Result<NusbDevice, TransportError> {
    let info = matching_devices(vendor_id)?
        .into_iter()
        .find(|d| device_id(d).as_deref() == Some(id.as_str()))
        .ok_or_else(|| TransportError::DeviceNotFound { id: id.clone() })?;

    let device = info
        .open()
        .wait()
        .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

    // Claiming fails while the flashing utility holds the device
    let interface = device
        .claim_interface(0)
        .wait()
        .map_err(|e| TransportError::ClaimInterfaceFailed {
            interface: 0,
            message: e.to_string(),
        })?;

    debug!(
        device = %id,
        vid = %format!("{:04X}", info.vendor_id()),
        pid = %format!("{:04X}", info.product_id()),
        "Device opened"
    );

    Ok(NusbDevice {
        id,
        vendor_id: info.vendor_id(),
        product_id: info.product_id(),
        bus_port: bus_port(&info),
        interface,
    })
}

/// Open device with interface 0 claimed.
pub struct NusbDevice {
    id: String,
    vendor_id: u16,
    product_id: u16,
    bus_port: String,
    interface: Interface,
}

struct InterfacePipe(Interface);

impl ControlPipe for InterfacePipe {
    fn vendor_in(&mut self, service: ServiceType, value: u16, index: u16, length: u16) -> Result<Vec<u8>, String> {
        self.0
            .control_in(
                ControlIn {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request: service as u8,
                    value,
                    index,
                    length,
                },
                CONTROL_TIMEOUT,
            )
            .wait()
            .map_err(|e| e.to_string())
    }

    fn vendor_out(&mut self, service: ServiceType, value: u16, index: u16, data: &[u8]) -> Result<(), String> {
        self.0
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request: service as u8,
                    value,
                    index,
                    data,
                },
                CONTROL_TIMEOUT,
            )
            .wait()
            .map_err(|e| e.to_string())
    }
}

impl NusbDevice {
    async fn service_request(&self, request_type: u16, payload: &[u8]) -> Result<(), TransportError> {
        let mut pipe = InterfacePipe(self.interface.clone());
        let payload = payload.to_vec();
        let reply = tokio::task::spawn_blocking(move || {
            send_service_request(&mut pipe, request_type, &payload, ServiceTiming::default())
        })
        .await
        .map_err(|e| TransportError::ControlFailed {
            request_type,
            message: e.to_string(),
        })??;
        debug!(device = %self.id, request_type, reply_len = reply.len(), "Control request done");
        Ok(())
    }
}

impl UsbDevice for NusbDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    fn product_id(&self) -> u16 {
        self.product_id
    }

    fn platform_id(&self) -> u16 {
        self.product_id & !PRODUCT_MODE_MASK
    }

    fn is_in_dfu_mode(&self) -> bool {
        self.product_id & PRODUCT_MODE_MASK == DFU_PRODUCT_BASE
    }

    fn dfu_selector(&self) -> DfuSelector {
        if cfg!(target_os = "linux") {
            DfuSelector::BusPort(self.bus_port.clone())
        } else {
            DfuSelector::Serial(self.id.clone())
        }
    }

    async fn enter_dfu_mode(&self) -> Result<(), TransportError> {
        self.service_request(REQUEST_ENTER_DFU_MODE, &[]).await
    }

    async fn send_control_request(&self, request_type: u16, payload: &[u8]) -> Result<(), TransportError> {
        self.service_request(request_type, payload).await
    }
}
