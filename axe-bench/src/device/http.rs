use std::time::Duration;

use async_trait::async_trait;

use super::types::{SystemInfo, SystemSettingsPatch};
use super::{DeviceClient, DeviceError, DeviceInfo, Telemetry};
use crate::tracing::prelude::*;
use crate::types::Configuration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const INFO_ENDPOINT: &str = "/api/system/info";
const SETTINGS_ENDPOINT: &str = "/api/system";
const RESTART_ENDPOINT: &str = "/api/system/restart";

/// [`DeviceClient`] for the AxeOS HTTP API.
pub struct HttpDeviceClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpDeviceClient {
    /// Create a client for the device at `address`.
    ///
    /// Accepts a bare IP or host name (`192.168.2.26`) as well as a full
    /// URL (`http://bitaxe.local`).
    pub fn new(address: &str) -> Result<Self, DeviceError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            base_url: base_url(address),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn system_info(&self) -> Result<SystemInfo, DeviceError> {
        let response = self
            .client
            .get(self.url(INFO_ENDPOINT))
            .send()
            .await?;
        let response = check_status(INFO_ENDPOINT, response)?;

        response
            .json::<SystemInfo>()
            .await
            .map_err(|e| DeviceError::Decode(e.to_string()))
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }
}

#[async_trait]
impl DeviceClient for HttpDeviceClient {
    async fn device_info(&self) -> Result<DeviceInfo, DeviceError> {
        let info = self.system_info().await?;
        Ok(DeviceInfo::from(&info))
    }

    async fn read_telemetry(&self) -> Result<Telemetry, DeviceError> {
        let info = self.system_info().await?;
        Ok(Telemetry::from(&info))
    }

    async fn apply_configuration(&self, configuration: Configuration) -> Result<(), DeviceError> {
        debug!(%configuration, "Sending settings to device");
        let response = self
            .client
            .patch(self.url(SETTINGS_ENDPOINT))
            .json(&SystemSettingsPatch::from(configuration))
            .send()
            .await?;
        check_status(SETTINGS_ENDPOINT, response)?;
        Ok(())
    }

    async fn restart(&self) -> Result<(), DeviceError> {
        debug!("Requesting device restart");
        let response = self.client.post(self.url(RESTART_ENDPOINT)).send().await?;
        check_status(RESTART_ENDPOINT, response)?;
        Ok(())
    }
}

fn check_status(
    endpoint: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, DeviceError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(DeviceError::Status {
            endpoint,
            status: status.as_u16(),
        })
    }
}

fn base_url(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}
