//! Turns a run's sample series into a [`RunResult`].
//!
//! Hashrate is averaged after dropping the most extreme readings on each
//! side, temperatures after leaving out the warmup period, and the average
//! is compared against what the chip should produce at the tested
//! frequency.

use thiserror::Error;

use crate::config::ProcessingConfig;
use crate::tracing::prelude::*;
use crate::types::{Configuration, RunResult, Sample};

/// Why a run produced no usable result.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("insufficient data: {valid} valid samples, {required} required")]
    InsufficientData { valid: usize, required: usize },

    #[error("zero hashrate")]
    ZeroHashrate,

    /// Hashrate fell short of the stable band. The result is still
    /// reported so it can be recorded.
    #[error(
        "hashrate {:.1} GH/s short of expected {:.1} GH/s",
        .0.average_hashrate,
        .0.expected_hashrate
    )]
    Unstable(Box<RunResult>),
}

#[derive(Debug, Clone)]
pub struct ResultProcessor {
    config: ProcessingConfig,
}

impl ResultProcessor {
    pub fn new(config: ProcessingConfig) -> Self {
        Self { config }
    }

    /// Reduce `samples` taken at `configuration` to a result.
    ///
    /// `expected_hashrate_ghs` is the theoretical maximum at the tested
    /// frequency. Zero disables the tolerance check.
    pub fn process(
        &self,
        samples: &[Sample],
        configuration: Configuration,
        expected_hashrate_ghs: f64,
    ) -> Result<RunResult, Rejection> {
        let required = self.config.min_valid_samples;
        if samples.len() < required {
            return Err(Rejection::InsufficientData {
                valid: samples.len(),
                required,
            });
        }

        let average_hashrate = self.trimmed_mean_hashrate(samples);
        if average_hashrate <= 0.0 {
            return Err(Rejection::ZeroHashrate);
        }

        let settled = self.after_warmup(samples);
        let average_temperature = mean(settled.iter().map(|s| s.chip_temp_c));
        let vr_temps: Vec<f64> = settled.iter().filter_map(|s| s.vr_temp_c).collect();
        let average_vr_temp = (!vr_temps.is_empty()).then(|| mean(vr_temps.iter().copied()));
        let average_power = mean(samples.iter().map(|s| s.power_w));
        let efficiency_jth = average_power / (average_hashrate / 1000.0);

        let stable = within(
            average_hashrate,
            expected_hashrate_ghs,
            self.config.stable_tolerance,
        );
        let valid = within(
            average_hashrate,
            expected_hashrate_ghs,
            self.config.valid_tolerance,
        );

        let result = RunResult {
            configuration,
            average_hashrate,
            average_temperature,
            average_vr_temp,
            average_power,
            efficiency_jth,
            input_voltages: samples.iter().map(|s| s.input_voltage_mv).collect(),
            expected_hashrate: expected_hashrate_ghs,
            valid,
            stable,
        };

        info!(
            %configuration,
            average_hashrate_ghs = result.average_hashrate,
            expected_hashrate_ghs = result.expected_hashrate,
            average_temp_c = result.average_temperature,
            average_vr_temp_c = ?result.average_vr_temp,
            efficiency_jth = result.efficiency_jth,
            stable,
            valid,
            "Run complete"
        );

        if stable {
            Ok(result)
        } else {
            Err(Rejection::Unstable(Box::new(result)))
        }
    }

    /// Mean of the hashrate readings with the `outlier_trim` highest and
    /// lowest removed. Falls back to the plain mean when trimming would
    /// leave nothing.
    fn trimmed_mean_hashrate(&self, samples: &[Sample]) -> f64 {
        let mut hashrates: Vec<f64> = samples.iter().map(|s| s.hashrate_ghs).collect();
        hashrates.sort_by(f64::total_cmp);

        let trim = self.config.outlier_trim;
        if hashrates.len() > 2 * trim {
            mean(hashrates[trim..hashrates.len() - trim].iter().copied())
        } else {
            mean(hashrates.into_iter())
        }
    }

    fn after_warmup<'s>(&self, samples: &'s [Sample]) -> &'s [Sample] {
        samples
            .get(self.config.warmup_samples..)
            .filter(|settled| !settled.is_empty())
            .unwrap_or(samples)
    }
}

/// True when `average` is no more than `tolerance` (a fraction) below
/// `expected`.
fn within(average: f64, expected: f64, tolerance: f64) -> bool {
    expected <= 0.0 || average >= expected * (1.0 - tolerance)
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 { 0.0 } else { sum / count as f64 }
}
