//! USB transport abstraction.
//!
//! Defines the `UsbBackend` / `UsbDevice` traits the tracker and flash
//! executor use, allowing different implementations (nusb, mock, etc.).
//! Dropping a device handle closes it.

use std::future::Future;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: {id}")]
    DeviceNotFound { id: String },

    #[error("Failed to enumerate devices: {0}")]
    EnumerateFailed(String),

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Control request {request_type} failed: {message}")]
    ControlFailed { request_type: u16, message: String },

    #[error("Device disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the flashing utility should pick the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DfuSelector {
    /// `-p <bus>-<port.port...>`
    BusPort(String),
    /// `-S <serial>`
    Serial(String),
}

/// A device seen during enumeration, before it is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceListing {
    pub id: String,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// An open device handle.
pub trait UsbDevice: Send + Sync + 'static {
    /// Stable device id (USB serial number, also the cloud device id).
    fn id(&self) -> &str;

    fn vendor_id(&self) -> u16;

    fn product_id(&self) -> u16;

    fn platform_id(&self) -> u16;

    fn is_in_dfu_mode(&self) -> bool;

    fn dfu_selector(&self) -> DfuSelector;

    /// Ask the device to reboot into DFU mode.
    fn enter_dfu_mode(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Issue a vendor control request carrying `payload`.
    fn send_control_request(
        &self,
        request_type: u16,
        payload: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Enumerate and open devices.
pub trait UsbBackend: Send + Sync + 'static {
    type Device: UsbDevice;

    fn list_devices(&self) -> impl Future<Output = Result<Vec<DeviceListing>, TransportError>> + Send;

    /// Open by id. Fails while another process holds the device.
    fn open_by_id(&self, id: &str) -> impl Future<Output = Result<Self::Device, TransportError>> + Send;
}
