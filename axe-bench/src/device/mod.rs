//! Access to the device under test.
//!
//! The benchmark only needs four calls from a device: identify it, read
//! its telemetry, apply a voltage/frequency setting, and restart it. They
//! are expressed as the [`DeviceClient`] trait so the control loop can be
//! driven by a scripted device in tests. [`HttpDeviceClient`] implements it
//! against the AxeOS REST API.

mod http;
#[cfg(test)]
pub(crate) mod scripted;
pub mod types;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::Configuration;

pub use http::HttpDeviceClient;

/// Errors talking to the device.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("request to device failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("device returned HTTP {status} for {endpoint}")]
    Status { endpoint: &'static str, status: u16 },

    #[error("unexpected response from device: {0}")]
    Decode(String),

    #[error("{0}")]
    Other(String),
}

/// Static facts about the device, read once before the search starts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub hostname: Option<String>,
    pub asic_model: Option<String>,

    /// Settings the device was running before the benchmark touched it.
    pub current: Option<Configuration>,

    pub small_core_count: u32,
    pub asic_count: u32,
}

impl DeviceInfo {
    /// Total small cores across all ASICs; zero if the device didn't say.
    pub fn total_cores(&self) -> u32 {
        self.small_core_count.saturating_mul(self.asic_count)
    }

    /// Theoretical hashrate in GH/s at the given frequency: every small
    /// core produces one hash per clock.
    pub fn expected_hashrate_ghs(&self, frequency_mhz: u32) -> f64 {
        f64::from(frequency_mhz) * f64::from(self.total_cores()) / 1000.0
    }
}

/// A raw telemetry reading, before plausibility checks.
///
/// Fields the device didn't report are `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Telemetry {
    /// GH/s
    pub hashrate_ghs: Option<f64>,
    pub chip_temp_c: Option<f64>,
    pub vr_temp_c: Option<f64>,
    pub power_w: Option<f64>,
    /// Supply voltage, mV.
    pub input_voltage_mv: Option<f64>,
}

#[async_trait]
pub trait DeviceClient: Send + Sync {
    async fn device_info(&self) -> Result<DeviceInfo, DeviceError>;

    async fn read_telemetry(&self) -> Result<Telemetry, DeviceError>;

    /// Store new core voltage and frequency. Takes effect after
    /// [`restart`](Self::restart).
    async fn apply_configuration(&self, configuration: Configuration) -> Result<(), DeviceError>;

    async fn restart(&self) -> Result<(), DeviceError>;
}
