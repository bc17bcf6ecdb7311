//! Transport layer module.

pub mod control;
pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{MockDevice, MockUsb};
pub use nusb::{NusbBackend, NusbDevice};
pub use traits::{DeviceListing, DfuSelector, TransportError, UsbBackend, UsbDevice};

/// Particle USB vendor id.
pub const PARTICLE_VENDOR_ID: u16 = 0x2B04;

/// Product id high byte selects the mode, low byte is the platform id.
pub const PRODUCT_MODE_MASK: u16 = 0xF000;
pub const NORMAL_PRODUCT_BASE: u16 = 0xC000;
pub const DFU_PRODUCT_BASE: u16 = 0xD000;
