//! Value types shared across the benchmark pipeline.

mod run_result;

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub use run_result::RunResult;

/// A core voltage/frequency pair: the unit under test for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Configuration {
    #[serde(rename = "coreVoltage")]
    pub voltage_mv: u32,
    #[serde(rename = "frequency")]
    pub frequency_mhz: u32,
}

impl Configuration {
    pub const fn new(voltage_mv: u32, frequency_mhz: u32) -> Self {
        Self {
            voltage_mv,
            frequency_mhz,
        }
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}mV @ {}MHz", self.voltage_mv, self.frequency_mhz)
    }
}

/// One validated telemetry reading taken during a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Hashrate in GH/s.
    pub hashrate_ghs: f64,
    pub chip_temp_c: f64,
    /// Voltage regulator temperature, on boards that report it.
    pub vr_temp_c: Option<f64>,
    pub power_w: f64,
    /// Supply (input) voltage in mV.
    pub input_voltage_mv: f64,
    pub captured_at: Instant,
}
