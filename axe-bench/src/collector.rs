//! Telemetry sampling for one run.
//!
//! The collector polls the device at a fixed interval for the configured
//! benchmark time. Each reading first goes through the [`SafetyMonitor`],
//! then through a plausibility check; implausible readings are dropped and
//! don't count toward the minimum sample count.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{SafetyLimits, SamplingConfig};
use crate::device::{DeviceClient, Telemetry};
use crate::safety::{AbortReason, SafetyMonitor, SafetyStatus};
use crate::tracing::prelude::*;
use crate::types::{Configuration, Sample};

const MAX_PREALLOCATED_SAMPLES: usize = 64;

/// How a collection ended.
#[derive(Debug)]
pub enum Collection {
    /// Full duration sampled with enough valid readings.
    Complete(Vec<Sample>),

    /// Full duration sampled but too many readings were discarded.
    Insufficient { samples: Vec<Sample>, required: usize },

    /// A safety limit was breached; polling stopped immediately.
    Aborted(AbortReason),

    /// Operator cancellation.
    Cancelled,
}

pub struct SampleCollector<'a> {
    device: &'a dyn DeviceClient,
    sampling: &'a SamplingConfig,
    safety: &'a SafetyLimits,
    min_valid_samples: usize,
}

impl<'a> SampleCollector<'a> {
    pub fn new(
        device: &'a dyn DeviceClient,
        sampling: &'a SamplingConfig,
        safety: &'a SafetyLimits,
        min_valid_samples: usize,
    ) -> Self {
        Self {
            device,
            sampling,
            safety,
            min_valid_samples,
        }
    }

    /// Sample the device, which is expected to be running `configuration`.
    pub async fn collect(
        &self,
        configuration: Configuration,
        cancellation: &CancellationToken,
    ) -> Collection {
        let total = self.sampling.total_samples();
        let mut monitor = SafetyMonitor::new(self.safety.clone());
        let mut samples = Vec::with_capacity(total.min(MAX_PREALLOCATED_SAMPLES));
        let mut consecutive_failures = 0u32;

        for index in 0..total {
            if cancellation.is_cancelled() {
                return Collection::Cancelled;
            }

            match self.device.read_telemetry().await {
                Ok(reading) => {
                    consecutive_failures = 0;

                    if let SafetyStatus::Tripped(reason) = monitor.check(&reading) {
                        error!(%configuration, %reason, "Safety limit reached, aborting run");
                        return Collection::Aborted(reason);
                    }

                    match self.validate(&reading) {
                        Ok(sample) => {
                            log_progress(index, total, configuration, &sample);
                            samples.push(sample);
                        }
                        Err(problem) => {
                            warn!(
                                sample = index + 1,
                                %problem,
                                "Discarding implausible reading"
                            );
                        }
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(
                        sample = index + 1,
                        attempt = consecutive_failures,
                        max_attempts = self.sampling.max_consecutive_read_failures,
                        "Failed to read telemetry: {e}"
                    );

                    if consecutive_failures >= self.sampling.max_consecutive_read_failures {
                        if let SafetyStatus::Tripped(reason) =
                            monitor.telemetry_lost(consecutive_failures)
                        {
                            error!(%configuration, %reason, "Lost contact with device, aborting run");
                            return Collection::Aborted(reason);
                        }
                    }
                }
            }

            if index + 1 < total
                && !sleep_or_cancel(self.sampling.sample_interval, cancellation).await
            {
                return Collection::Cancelled;
            }
        }

        if samples.len() < self.min_valid_samples {
            warn!(
                %configuration,
                valid = samples.len(),
                required = self.min_valid_samples,
                "Not enough valid samples"
            );
            return Collection::Insufficient {
                samples,
                required: self.min_valid_samples,
            };
        }

        Collection::Complete(samples)
    }

    fn validate(&self, reading: &Telemetry) -> Result<Sample, &'static str> {
        let hashrate_ghs = reading.hashrate_ghs.ok_or("hashrate missing")?;
        if !hashrate_ghs.is_finite() || hashrate_ghs < 0.0 {
            return Err("hashrate negative or not finite");
        }

        let chip_temp_c = reading.chip_temp_c.ok_or("temperature missing")?;
        if !chip_temp_c.is_finite() || chip_temp_c <= self.sampling.min_plausible_temp_c {
            return Err("temperature implausibly low");
        }

        let power_w = reading
            .power_w
            .filter(|p| p.is_finite() && *p >= 0.0)
            .ok_or("power missing")?;
        let input_voltage_mv = reading
            .input_voltage_mv
            .filter(|v| v.is_finite())
            .ok_or("input voltage missing")?;

        Ok(Sample {
            hashrate_ghs,
            chip_temp_c,
            vr_temp_c: reading.vr_temp_c.filter(|t| t.is_finite()),
            power_w,
            input_voltage_mv,
            captured_at: Instant::now(),
        })
    }
}

/// Sleep for `duration` unless cancelled first. Returns `false` on
/// cancellation.
pub(crate) async fn sleep_or_cancel(duration: Duration, cancellation: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancellation.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

fn log_progress(index: usize, total: usize, configuration: Configuration, sample: &Sample) {
    let percent = (index + 1) as f64 / total as f64 * 100.0;
    info!(
        core_voltage_mv = configuration.voltage_mv,
        frequency_mhz = configuration.frequency_mhz,
        hashrate_ghs = sample.hashrate_ghs.round(),
        input_voltage_mv = sample.input_voltage_mv.round(),
        temp_c = sample.chip_temp_c,
        vr_temp_c = ?sample.vr_temp_c,
        power_w = sample.power_w,
        "[{:2}/{:2}] {:5.1}%",
        index + 1,
        total,
        percent
    );
}
