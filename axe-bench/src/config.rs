//! Benchmark limits, steps and timings.
//!
//! Everything here is immutable once a run starts. Components take the
//! piece they need at construction; tests tighten limits by building a
//! config rather than touching the defaults.

use std::time::Duration;

use thiserror::Error;

use crate::types::Configuration;

/// Hard limits. Breaching any of them aborts the run.
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyLimits {
    /// Chip temperature (°C) at or above which the run aborts.
    pub max_chip_temp_c: f64,

    /// Voltage regulator temperature (°C) at or above which the run
    /// aborts. Only checked on boards that report it.
    pub max_vr_temp_c: f64,

    /// Power draw (W) at or above which the run aborts. The barrel jack on
    /// most boards is rated for 45 W.
    pub max_power_w: f64,

    /// Supply voltage window (mV). Readings strictly outside abort.
    pub min_input_voltage_mv: f64,
    pub max_input_voltage_mv: f64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_chip_temp_c: 65.0,
            max_vr_temp_c: 75.0,
            max_power_w: 45.0,
            min_input_voltage_mv: 4800.0,
            max_input_voltage_mv: 5500.0,
        }
    }
}

/// What to do with frequency when a run comes back unstable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffMode {
    /// Retry the same frequency one voltage step higher.
    #[default]
    HoldFrequency,

    /// Raise voltage one step and drop frequency one step.
    RetreatFrequency,
}

/// Bounds and steps of the voltage/frequency search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchLimits {
    pub min_voltage_mv: u32,
    pub max_voltage_mv: u32,
    pub min_frequency_mhz: u32,
    pub max_frequency_mhz: u32,
    pub voltage_step_mv: u32,
    pub frequency_step_mhz: u32,
    pub backoff: BackoffMode,

    /// Stop after this many failed runs in a row. `None` leaves the voltage
    /// ceiling as the only bound on a failing streak.
    pub max_consecutive_failures: Option<u32>,
}

impl SearchLimits {
    pub fn contains(&self, configuration: Configuration) -> bool {
        (self.min_voltage_mv..=self.max_voltage_mv).contains(&configuration.voltage_mv)
            && (self.min_frequency_mhz..=self.max_frequency_mhz)
                .contains(&configuration.frequency_mhz)
    }

    /// The most conservative configuration inside the bounds.
    pub fn floor(&self) -> Configuration {
        Configuration::new(self.min_voltage_mv, self.min_frequency_mhz)
    }
}

impl Default for SearchLimits {
    fn default() -> Self {
        Self {
            min_voltage_mv: 1150,
            max_voltage_mv: 1400,
            min_frequency_mhz: 525,
            max_frequency_mhz: 1250,
            voltage_step_mv: 20,
            frequency_step_mhz: 25,
            backoff: BackoffMode::default(),
            max_consecutive_failures: None,
        }
    }
}

/// Timing of device interaction.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    /// How long each configuration is sampled.
    pub benchmark_time: Duration,

    /// Delay between telemetry polls.
    pub sample_interval: Duration,

    /// Pause after applying settings, before the restart request.
    pub apply_settle: Duration,

    /// Pause after a restart so hashrate and temperatures can settle.
    pub stabilization_pause: Duration,

    /// Readings at or below this chip temperature (°C) are sensor glitches
    /// and get discarded.
    pub min_plausible_temp_c: f64,

    /// Failed telemetry reads in a row before the device is considered
    /// unobservable and the run aborts.
    pub max_consecutive_read_failures: u32,
}

impl SamplingConfig {
    /// Number of polls taken per run. Saturates at `usize::MAX`.
    pub fn total_samples(&self) -> usize {
        let interval_ms = self.sample_interval.as_millis();
        if interval_ms == 0 {
            return 0;
        }
        usize::try_from(self.benchmark_time.as_millis() / interval_ms).unwrap_or(usize::MAX)
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            benchmark_time: Duration::from_secs(150),
            sample_interval: Duration::from_secs(15),
            apply_settle: Duration::from_secs(2),
            stabilization_pause: Duration::from_secs(90),
            min_plausible_temp_c: 5.0,
            max_consecutive_read_failures: 3,
        }
    }
}

/// Statistics applied to a finished sample series.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingConfig {
    /// Fewer valid samples than this and the run is rejected.
    pub min_valid_samples: usize,

    /// Leading samples left out of the temperature averages.
    pub warmup_samples: usize,

    /// Hashrate readings dropped from each end of the sorted series.
    pub outlier_trim: usize,

    /// Allowed shortfall from the theoretical hashrate for a run to count
    /// as stable (fraction, 0.06 = 6%).
    pub stable_tolerance: f64,

    /// Allowed shortfall for a run to count as valid and be ranked.
    pub valid_tolerance: f64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            min_valid_samples: 7,
            warmup_samples: 6,
            outlier_trim: 3,
            stable_tolerance: 0.06,
            valid_tolerance: 0.08,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BenchmarkConfig {
    /// First configuration tested.
    pub initial: Option<Configuration>,
    pub safety: SafetyLimits,
    pub search: SearchLimits,
    pub sampling: SamplingConfig,
    pub processing: ProcessingConfig,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("initial voltage {value}mV is outside the allowed range {min}-{max}mV")]
    VoltageOutOfRange { value: u32, min: u32, max: u32 },

    #[error("initial frequency {value}MHz is outside the allowed range {min}-{max}MHz")]
    FrequencyOutOfRange { value: u32, min: u32, max: u32 },

    #[error(
        "benchmark time is too short: {samples} samples per run, at least {required} required; \
         increase the benchmark time or decrease the sample interval"
    )]
    TooFewSamples { samples: usize, required: usize },

    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },

    #[error("tolerance {name} = {value} must be within [0, 1)")]
    ToleranceOutOfRange { name: &'static str, value: f64 },

    #[error("stable tolerance ({stable}) must not exceed valid tolerance ({valid})")]
    ToleranceOrder { stable: f64, valid: f64 },
}

impl BenchmarkConfig {
    /// The configuration the search starts from.
    pub fn initial_configuration(&self) -> Configuration {
        self.initial.unwrap_or_else(|| self.search.floor())
    }

    /// Check the parameters before anything is sent to the device.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let initial = self.initial_configuration();
        let search = &self.search;

        for (name, value) in [
            ("voltage_step_mv", search.voltage_step_mv),
            ("frequency_step_mhz", search.frequency_step_mhz),
            (
                "max_consecutive_read_failures",
                self.sampling.max_consecutive_read_failures,
            ),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { name });
            }
        }

        if !(search.min_voltage_mv..=search.max_voltage_mv).contains(&initial.voltage_mv) {
            return Err(ConfigError::VoltageOutOfRange {
                value: initial.voltage_mv,
                min: search.min_voltage_mv,
                max: search.max_voltage_mv,
            });
        }

        if !(search.min_frequency_mhz..=search.max_frequency_mhz).contains(&initial.frequency_mhz)
        {
            return Err(ConfigError::FrequencyOutOfRange {
                value: initial.frequency_mhz,
                min: search.min_frequency_mhz,
                max: search.max_frequency_mhz,
            });
        }

        let samples = self.sampling.total_samples();
        let required = self.processing.min_valid_samples;
        if samples < required {
            return Err(ConfigError::TooFewSamples { samples, required });
        }

        let processing = &self.processing;
        for (name, value) in [
            ("stable_tolerance", processing.stable_tolerance),
            ("valid_tolerance", processing.valid_tolerance),
        ] {
            if !(0.0..1.0).contains(&value) {
                return Err(ConfigError::ToleranceOutOfRange { name, value });
            }
        }
        if processing.stable_tolerance > processing.valid_tolerance {
            return Err(ConfigError::ToleranceOrder {
                stable: processing.stable_tolerance,
                valid: processing.valid_tolerance,
            });
        }

        Ok(())
    }
}
