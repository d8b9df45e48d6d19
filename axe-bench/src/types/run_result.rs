use serde::{Deserialize, Serialize};

use super::Configuration;

/// Outcome of one completed (non-aborted) run.
///
/// Field names follow the JSON report format so results can be written out
/// as-is.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    #[serde(flatten)]
    pub configuration: Configuration,

    /// Trimmed mean hashrate in GH/s.
    #[serde(rename = "averageHashRate")]
    pub average_hashrate: f64,

    /// Mean chip temperature after warmup, °C.
    pub average_temperature: f64,

    #[serde(rename = "averageVRTemp", skip_serializing_if = "Option::is_none", default)]
    pub average_vr_temp: Option<f64>,

    pub average_power: f64,

    /// Joules per terahash.
    #[serde(rename = "efficiencyJTH")]
    pub efficiency_jth: f64,

    pub input_voltages: Vec<f64>,

    /// Theoretical hashrate for the tested frequency, GH/s. Zero when the
    /// device did not report its core layout.
    #[serde(rename = "expectedHashRate")]
    pub expected_hashrate: f64,

    /// Within the wider tolerance band; eligible for ranking.
    pub valid: bool,

    /// Within the narrow tolerance band; the search may move past it.
    pub stable: bool,
}
