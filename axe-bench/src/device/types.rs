//! AxeOS API data transfer objects.
//!
//! Only the fields the benchmark reads are modelled; everything else the
//! firmware sends is ignored. Numbers are taken as `f64` because firmware
//! versions disagree on whether they are integers.

use serde::{Deserialize, Serialize};

use super::{DeviceInfo, Telemetry};
use crate::types::Configuration;

/// Response of `GET /api/system/info`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    /// GH/s
    pub hash_rate: Option<f64>,
    /// Chip temperature, °C.
    pub temp: Option<f64>,
    pub vr_temp: Option<f64>,
    /// W
    pub power: Option<f64>,
    /// Supply voltage, mV.
    pub voltage: Option<f64>,
    /// Configured core voltage, mV.
    pub core_voltage: Option<f64>,
    /// Configured frequency, MHz.
    pub frequency: Option<f64>,
    pub small_core_count: Option<f64>,
    pub asic_count: Option<f64>,
    pub hostname: Option<String>,
    #[serde(rename = "ASICModel")]
    pub asic_model: Option<String>,
}

impl From<&SystemInfo> for Telemetry {
    fn from(info: &SystemInfo) -> Self {
        Self {
            hashrate_ghs: info.hash_rate,
            chip_temp_c: info.temp,
            vr_temp_c: info.vr_temp,
            power_w: info.power,
            input_voltage_mv: info.voltage,
        }
    }
}

impl From<&SystemInfo> for DeviceInfo {
    fn from(info: &SystemInfo) -> Self {
        let current = match (info.core_voltage, info.frequency) {
            (Some(voltage), Some(frequency)) => Some(Configuration::new(
                as_count(voltage),
                as_count(frequency),
            )),
            _ => None,
        };

        Self {
            hostname: info.hostname.clone(),
            asic_model: info.asic_model.clone(),
            current,
            small_core_count: info.small_core_count.map(as_count).unwrap_or(0),
            asic_count: info.asic_count.map(as_count).unwrap_or(0),
        }
    }
}

/// Body of `PATCH /api/system`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSettingsPatch {
    pub core_voltage: u32,
    pub frequency: u32,
}

impl From<Configuration> for SystemSettingsPatch {
    fn from(configuration: Configuration) -> Self {
        Self {
            core_voltage: configuration.voltage_mv,
            frequency: configuration.frequency_mhz,
        }
    }
}

fn as_count(value: f64) -> u32 {
    if value.is_finite() && value > 0.0 {
        value.round().min(f64::from(u32::MAX)) as u32
    } else {
        0
    }
}
