//! Cloud device-management API.
//!
//! [`CloudApi`] is the seam the provisioning workflow and the event
//! correlator talk through. [`ParticleCloud`] is the REST implementation,
//! [`MockCloud`] the in-memory one used by tests.

use std::future::Future;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

mod assets;
mod mock;
mod particle;
mod sse;

pub use assets::{AssetSource, DEFAULT_ASSETS_BASE_URL, HttpAssets, MemoryAssets};
pub use mock::{CloudCall, MockCloud};
pub use particle::{DEFAULT_API_BASE_URL, ParticleCloud};
pub use sse::{SseDecoder, SseFrame};

#[derive(Error, Debug)]
pub enum CloudError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: String,
        url: String,
        status: u16,
        body: String,
    },

    #[error("Invalid response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Asset not found: {0}")]
    AssetNotFound(String),

    #[error("Event stream closed")]
    StreamClosed,

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: u32,
    pub platform_id: u16,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductFirmware {
    pub version: u32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub product_default: bool,
}

/// Device record as the cloud reports it. Unknown fields are kept so the
/// full record can be published and logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeviceInfo {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageMeta {
    #[serde(default)]
    pub total_pages: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DevicePage {
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
    #[serde(default)]
    pub meta: PageMeta,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserInfo {
    pub username: String,
}

/// Attributes set on a device. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub development: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_firmware_version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flash: Option<bool>,
}

impl DeviceUpdate {
    pub fn is_empty(&self) -> bool {
        self.development.is_none()
            && self.name.is_none()
            && self.desired_firmware_version.is_none()
            && self.flash.is_none()
    }
}

/// Event as published on the product event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub published_at: String,
    pub coreid: String,
}

impl RawEvent {
    pub fn new(coreid: &str, name: &str, data: &str) -> Self {
        Self {
            name: name.to_string(),
            data: data.to_string(),
            published_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            coreid: coreid.to_string(),
        }
    }
}

pub type EventStream = BoxStream<'static, Result<RawEvent, CloudError>>;

/// Product-scoped cloud operations.
pub trait CloudApi: Send + Sync + 'static {
    fn get_product(&self) -> impl Future<Output = Result<Product, CloudError>> + Send;

    fn list_product_firmware(&self) -> impl Future<Output = Result<Vec<ProductFirmware>, CloudError>> + Send;

    fn download_product_firmware(&self, version: u32) -> impl Future<Output = Result<Bytes, CloudError>> + Send;

    /// One page (1-based) of the product's device list.
    fn list_devices(&self, page: u32) -> impl Future<Output = Result<DevicePage, CloudError>> + Send;

    /// Succeeds for devices already in the product, including quarantined ones.
    fn add_device_to_product(&self, device_id: &str) -> impl Future<Output = Result<(), CloudError>> + Send;

    fn get_device(&self, device_id: &str) -> impl Future<Output = Result<DeviceInfo, CloudError>> + Send;

    fn current_user(&self) -> impl Future<Output = Result<UserInfo, CloudError>> + Send;

    fn claim_device(&self, device_id: &str) -> impl Future<Output = Result<(), CloudError>> + Send;

    fn update_device(
        &self,
        device_id: &str,
        update: &DeviceUpdate,
    ) -> impl Future<Output = Result<(), CloudError>> + Send;

    fn assign_device_groups(
        &self,
        device_id: &str,
        groups: &[String],
    ) -> impl Future<Output = Result<(), CloudError>> + Send;

    /// Make the device flash its status LED.
    fn signal_device(&self, device_id: &str) -> impl Future<Output = Result<(), CloudError>> + Send;

    fn open_event_stream(&self) -> impl Future<Output = Result<EventStream, CloudError>> + Send;
}
