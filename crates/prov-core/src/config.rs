//! Provisioning configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::cloud::{DEFAULT_API_BASE_URL, DEFAULT_ASSETS_BASE_URL};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("product_id must be set to the product devices are provisioned into")]
    MissingProductId,

    #[error("no auth token: set auth_token, pass --token or set PROV_AUTH_TOKEN")]
    MissingAuthToken,

    #[error("device_group_name and device_group_format are mutually exclusive")]
    ConflictingGroupSettings,

    #[error("device_group_name must not contain whitespace: {0:?}")]
    InvalidGroupName(String),

    #[error("device_group_format = \"date_quantity\" requires batch_size")]
    MissingBatchSize,

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// How generated group names are formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupFormat {
    /// `YYYYMMDD`
    Date,
    /// `YYYYMMDD_<batch_size>`
    DateQuantity,
}

/// Provisioning configuration, loaded from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Product devices are added to.
    pub product_id: u32,
    /// Cloud access token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub api_base_url: String,
    pub assets_base_url: String,

    /// Flash Device OS and user firmware over USB.
    pub flash_firmware: bool,
    /// Device OS semantic version to use instead of the firmware's dependency.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_system_version: Option<String>,
    /// Product firmware version to flash; product default when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<u32>,
    /// Lock devices to this product firmware version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_firmware_version: Option<u32>,
    /// With a locked version, ask the cloud to flash it immediately.
    pub flash_now: bool,
    /// Flash the tracker radio coprocessor when the Device OS needs it.
    pub flash_tracker_ncp: bool,

    pub claim_device: bool,
    pub mark_as_development: bool,
    pub device_name_is_serial_number: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_group_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_group_format: Option<GroupFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,

    /// Wait for the device to report online after setup.
    pub wait_device_online: bool,
    /// Put trackers into shipping mode at the end of setup.
    pub tracker_shipping_mode: bool,

    /// Port of the local status server.
    pub server_port: u16,
    pub staging_dir: PathBuf,
    pub device_logs_dir: PathBuf,
    pub flash_timeout_ms: u64,
    pub usb_scan_period_ms: u64,
    pub dfu_util_path: PathBuf,
    /// Devices provisioned at the same time.
    pub max_concurrent_runs: usize,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            product_id: 0,
            auth_token: None,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            assets_base_url: DEFAULT_ASSETS_BASE_URL.to_string(),
            flash_firmware: true,
            force_system_version: None,
            firmware_version: None,
            lock_firmware_version: None,
            flash_now: false,
            flash_tracker_ncp: true,
            claim_device: false,
            mark_as_development: false,
            device_name_is_serial_number: false,
            device_group_name: None,
            device_group_format: None,
            batch_size: None,
            wait_device_online: true,
            tracker_shipping_mode: false,
            server_port: 5222,
            staging_dir: PathBuf::from("staging"),
            device_logs_dir: PathBuf::from("deviceLogs"),
            flash_timeout_ms: 120_000,
            usb_scan_period_ms: 5_000,
            dfu_util_path: PathBuf::from("dfu-util"),
            max_concurrent_runs: 8,
        }
    }
}

impl ProvisionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        let config: ProvisionConfig =
            toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.product_id == 0 {
            return Err(ConfigError::MissingProductId);
        }
        if self.auth_token.as_deref().is_none_or(|t| t.trim().is_empty()) {
            return Err(ConfigError::MissingAuthToken);
        }
        if self.device_group_name.is_some() && self.device_group_format.is_some() {
            return Err(ConfigError::ConflictingGroupSettings);
        }
        if let Some(name) = &self.device_group_name {
            if name.is_empty() || name.chars().any(char::is_whitespace) {
                return Err(ConfigError::InvalidGroupName(name.clone()));
            }
        }
        if self.device_group_format == Some(GroupFormat::DateQuantity) && self.batch_size.is_none() {
            return Err(ConfigError::MissingBatchSize);
        }
        if self.usb_scan_period_ms == 0 {
            return Err(ConfigError::Zero("usb_scan_period_ms"));
        }
        if self.flash_timeout_ms == 0 {
            return Err(ConfigError::Zero("flash_timeout_ms"));
        }
        if self.max_concurrent_runs == 0 {
            return Err(ConfigError::Zero("max_concurrent_runs"));
        }
        Ok(())
    }

    /// Hex SHA-256 of the configuration, token excluded. Keys the staging cache.
    pub fn config_hash(&self) -> String {
        let mut hashed = self.clone();
        hashed.auth_token = None;
        // Serializing a plain struct of strings and numbers cannot fail
        let json = serde_json::to_vec(&hashed).unwrap_or_default();
        hex::encode(Sha256::digest(&json))
    }

    pub fn flash_timeout(&self) -> Duration {
        Duration::from_millis(self.flash_timeout_ms)
    }

    pub fn usb_scan_period(&self) -> Duration {
        Duration::from_millis(self.usb_scan_period_ms)
    }
}
