//! Published restore catalogs and images.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use reqwest::{Client, StatusCode};
use tracing::debug;

use super::CloudError;

pub const DEFAULT_ASSETS_BASE_URL: &str = "https://docs.particle.io/assets/files";

/// Read-only file source addressed by relative path.
pub trait AssetSource: Send + Sync + 'static {
    fn fetch(&self, path: &str) -> impl Future<Output = Result<Bytes, CloudError>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpAssets {
    client: Client,
    base_url: String,
}

impl HttpAssets {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Default for HttpAssets {
    fn default() -> Self {
        Self::new(DEFAULT_ASSETS_BASE_URL)
    }
}

impl AssetSource for HttpAssets {
    async fn fetch(&self, path: &str) -> Result<Bytes, CloudError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        debug!(url = %url, "Fetching asset");

        let response = self.client.get(&url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(CloudError::AssetNotFound(path.to_string())),
            status if !status.is_success() => Err(CloudError::Status {
                method: "GET".to_string(),
                url,
                status: status.as_u16(),
                body: String::new(),
            }),
            _ => Ok(response.bytes().await?),
        }
    }
}

/// In-memory assets for tests.
#[derive(Clone, Default)]
pub struct MemoryAssets {
    files: Arc<Mutex<HashMap<String, Bytes>>>,
}

impl MemoryAssets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &str, data: impl Into<Bytes>) {
        self.files.lock().unwrap().insert(path.to_string(), data.into());
    }
}

impl AssetSource for MemoryAssets {
    async fn fetch(&self, path: &str) -> Result<Bytes, CloudError> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| CloudError::AssetNotFound(path.to_string()))
    }
}
