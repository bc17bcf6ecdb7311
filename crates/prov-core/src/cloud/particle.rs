use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, instrument};

use super::sse::SseDecoder;
use super::{
    CloudApi, CloudError, DeviceInfo, DevicePage, DeviceUpdate, EventStream, Product, ProductFirmware, UserInfo,
};

pub const DEFAULT_API_BASE_URL: &str = "https://api.particle.io";

/// REST client scoped to one product.
#[derive(Debug, Clone)]
pub struct ParticleCloud {
    client: Client,
    base_url: String,
    token: String,
    product_id: u32,
}

impl ParticleCloud {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, product_id: u32) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            product_id,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn product_url(&self, path: &str) -> String {
        self.url(&format!("/v1/products/{}{}", self.product_id, path))
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client.request(method, url).bearer_auth(&self.token)
    }

    async fn send(&self, method: Method, url: String, body: Option<serde_json::Value>) -> Result<Response, CloudError> {
        let method_name = method.to_string();
        let mut req = self.request(method, &url);
        if let Some(body) = body {
            req = req.json(&body);
        }

        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CloudError::Status {
                method: method_name,
                url,
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: String,
        body: Option<serde_json::Value>,
    ) -> Result<T, CloudError> {
        let bytes = self.send(method, url, body).await?.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl CloudApi for ParticleCloud {
    async fn get_product(&self) -> Result<Product, CloudError> {
        #[derive(Deserialize)]
        struct Wrapper {
            product: Product,
        }
        let wrapper: Wrapper = self.send_json(Method::GET, self.product_url(""), None).await?;
        Ok(wrapper.product)
    }

    async fn list_product_firmware(&self) -> Result<Vec<ProductFirmware>, CloudError> {
        self.send_json(Method::GET, self.product_url("/firmware"), None).await
    }

    #[instrument(skip(self))]
    async fn download_product_firmware(&self, version: u32) -> Result<Bytes, CloudError> {
        let url = self.product_url(&format!("/firmware/{version}/binary"));
        let response = self.send(Method::GET, url, None).await?;
        Ok(response.bytes().await?)
    }

    async fn list_devices(&self, page: u32) -> Result<DevicePage, CloudError> {
        self.send_json(Method::GET, self.product_url(&format!("/devices?page={page}")), None)
            .await
    }

    async fn add_device_to_product(&self, device_id: &str) -> Result<(), CloudError> {
        self.send(Method::POST, self.product_url("/devices"), Some(json!({ "id": device_id })))
            .await?;
        Ok(())
    }

    async fn get_device(&self, device_id: &str) -> Result<DeviceInfo, CloudError> {
        self.send_json(Method::GET, self.product_url(&format!("/devices/{device_id}")), None)
            .await
    }

    async fn current_user(&self) -> Result<UserInfo, CloudError> {
        self.send_json(Method::GET, self.url("/v1/user"), None).await
    }

    async fn claim_device(&self, device_id: &str) -> Result<(), CloudError> {
        self.send(Method::POST, self.url("/v1/devices"), Some(json!({ "id": device_id })))
            .await?;
        Ok(())
    }

    async fn update_device(&self, device_id: &str, update: &DeviceUpdate) -> Result<(), CloudError> {
        let body = serde_json::to_value(update)?;
        self.send(Method::PUT, self.product_url(&format!("/devices/{device_id}")), Some(body))
            .await?;
        Ok(())
    }

    async fn assign_device_groups(&self, device_id: &str, groups: &[String]) -> Result<(), CloudError> {
        self.send(
            Method::PUT,
            self.product_url(&format!("/devices/{device_id}")),
            Some(json!({ "groups": groups })),
        )
        .await?;
        Ok(())
    }

    async fn signal_device(&self, device_id: &str) -> Result<(), CloudError> {
        self.send(
            Method::PUT,
            self.product_url(&format!("/devices/{device_id}")),
            Some(json!({ "signal": "1" })),
        )
        .await?;
        Ok(())
    }

    async fn open_event_stream(&self) -> Result<EventStream, CloudError> {
        let response = self.send(Method::GET, self.product_url("/events"), None).await?;
        debug!(product = self.product_id, "Event stream opened");

        let mut decoder = SseDecoder::new();
        let events = response
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => decoder
                    .feed(&bytes)
                    .into_iter()
                    .filter_map(|frame| frame.into_event())
                    .map(Ok)
                    .collect::<Vec<_>>(),
                Err(e) => vec![Err(CloudError::from(e))],
            })
            .flat_map(stream::iter)
            .boxed();
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_are_product_scoped() {
        let cloud = ParticleCloud::new("https://api.example.com/", "tok", 1234);
        assert_eq!(
            cloud.product_url("/devices/abc"),
            "https://api.example.com/v1/products/1234/devices/abc"
        );
        assert_eq!(cloud.url("/v1/devices"), "https://api.example.com/v1/devices");
    }

    #[test]
    fn test_device_update_skips_unset_fields() {
        let update = DeviceUpdate {
            development: Some(true),
            desired_firmware_version: Some(7),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            json!({"development": true, "desired_firmware_version": 7})
        );
    }

    #[test]
    fn test_device_page_decodes_with_extra_fields() {
        let page: DevicePage = serde_json::from_value(json!({
            "devices": [{"id": "d1", "name": "alpha", "online": false}],
            "meta": {"total_pages": 3}
        }))
        .unwrap();
        assert_eq!(page.meta.total_pages, 3);
        assert_eq!(page.devices[0].name.as_deref(), Some("alpha"));
        assert_eq!(page.devices[0].extra["online"], false);
    }
}
