use serde::{Deserialize, Serialize};

use crate::{codec::DEFAULT_HEADER_CAPACITY, retry::RetryPolicy};

pub const DEFAULT_UPLOAD_URL: &str =
    "https://us-central1-egr425-lab3-2024.cloudfunctions.net/StoreSensorData";
pub const DEFAULT_RETRIEVE_URL: &str =
    "https://us-west2-egr425-lab3-2024.cloudfunctions.net/function-1";
pub const DEFAULT_USER_ID: &str = "MyUserName";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    pub upload_url: String,
    pub retrieve_url: String,
    #[serde(default)]
    pub file_upload_url: String,
    pub user_id: String,
    pub header_capacity: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
    pub request_timeout_ms: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            upload_url: DEFAULT_UPLOAD_URL.to_string(),
            retrieve_url: DEFAULT_RETRIEVE_URL.to_string(),
            file_upload_url: String::new(),
            user_id: DEFAULT_USER_ID.to_string(),
            header_capacity: DEFAULT_HEADER_CAPACITY,
            retry: RetryPolicy::default(),
            request_timeout_ms: 15_000,
        }
    }
}

impl CloudConfig {
    pub fn file_upload_url(&self) -> &str {
        if self.file_upload_url.trim().is_empty() {
            &self.upload_url
        } else {
            &self.file_upload_url
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub cycle_interval_ms: u64,
    pub file_upload_enabled: bool,
    pub storage_root: String,
    pub display_utc_offset_secs: i32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            cycle_interval_ms: 5_000,
            file_upload_enabled: false,
            storage_root: "/sdcard".to_string(),
            display_utc_offset_secs: -7 * 3600,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub device: DeviceConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.device.cycle_interval_ms = self.device.cycle_interval_ms.max(1_000);
        self.device.display_utc_offset_secs =
            self.device.display_utc_offset_secs.clamp(-14 * 3600, 14 * 3600);
        self.cloud.header_capacity = self.cloud.header_capacity.max(64);
        self.cloud.retry.max_attempts = self.cloud.retry.max_attempts.clamp(1, 50);
        self.cloud.request_timeout_ms = self.cloud.request_timeout_ms.clamp(1_000, 120_000);

        if self.cloud.user_id.trim().is_empty() {
            self.cloud.user_id = DEFAULT_USER_ID.to_string();
        }
    }
}
