use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::state::{SearchState, StopReason, Transition};
use crate::collector::{Collection, SampleCollector, sleep_or_cancel};
use crate::config::{BenchmarkConfig, ConfigError};
use crate::device::{DeviceClient, DeviceError, DeviceInfo};
use crate::processor::{Rejection, ResultProcessor};
use crate::report::{ReportWriter, top_by_efficiency, top_by_hashrate};
use crate::tracing::prelude::*;
use crate::types::{Configuration, RunResult};

/// Everything the search produced.
#[derive(Debug)]
pub struct BenchmarkOutcome {
    pub device: DeviceInfo,

    /// Every recorded run in test order, stable or not. Aborted runs are
    /// not recorded.
    pub results: Vec<RunResult>,

    pub stop_reason: StopReason,

    pub best_by_hashrate: Option<RunResult>,
    pub best_by_efficiency: Option<RunResult>,

    /// Valid results ranked by hashrate, then by efficiency.
    pub top_performers: Vec<RunResult>,
    pub most_efficient: Vec<RunResult>,

    /// The configuration the device was left on, if applying it worked.
    pub final_configuration: Option<Configuration>,

    /// Why the final configuration could not be applied.
    pub final_apply_error: Option<String>,
}

impl BenchmarkOutcome {
    /// Process exit code: 2 after a safety abort, 1 after a device error,
    /// 0 otherwise.
    pub fn exit_code(&self) -> u8 {
        match self.stop_reason {
            StopReason::SafetyAbort(_) => 2,
            StopReason::DeviceError(_) => 1,
            _ if self.final_apply_error.is_some() => 1,
            _ => 0,
        }
    }
}

/// Drives the device through the search.
///
/// Each iteration applies the current configuration, restarts the device,
/// waits for it to settle, samples it and feeds the processed result to
/// [`SearchState::evaluate`]. Whatever ends the search, the device is put
/// back on the best configuration found.
pub struct SearchController {
    device: Arc<dyn DeviceClient>,
    config: BenchmarkConfig,
    processor: ResultProcessor,
    state: SearchState,
    results: Vec<RunResult>,
    report: Option<ReportWriter>,
    info: DeviceInfo,
}

impl SearchController {
    /// Fails if `config` doesn't pass [`BenchmarkConfig::validate`]; the
    /// device is not contacted in that case.
    pub fn new(
        device: Arc<dyn DeviceClient>,
        config: BenchmarkConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let state = SearchState::new(config.initial_configuration());
        let processor = ResultProcessor::new(config.processing.clone());

        Ok(Self {
            device,
            config,
            processor,
            state,
            results: Vec::new(),
            report: None,
            info: DeviceInfo::default(),
        })
    }

    /// Save the report after every recorded run.
    pub fn with_report(mut self, writer: ReportWriter) -> Self {
        self.report = Some(writer);
        self
    }

    pub fn state(&self) -> &SearchState {
        &self.state
    }

    pub async fn run(mut self, cancellation: CancellationToken) -> BenchmarkOutcome {
        self.info = self.identify().await;

        let stop_reason = self.search(&cancellation).await;
        self.state.stop(stop_reason.clone());
        match &stop_reason {
            StopReason::SafetyAbort(reason) => error!(%reason, "Benchmark aborted"),
            StopReason::DeviceError(e) => error!(error = %e, "Benchmark stopped"),
            StopReason::Cancelled => warn!("Benchmark interrupted"),
            reason => info!(%reason, runs = self.results.len(), "Benchmark finished"),
        }

        let (final_configuration, final_apply_error) = self.apply_final().await;

        BenchmarkOutcome {
            device: self.info,
            top_performers: top_by_hashrate(&self.results),
            most_efficient: top_by_efficiency(&self.results),
            best_by_hashrate: self.state.best_by_hashrate().cloned(),
            best_by_efficiency: self.state.best_by_efficiency().cloned(),
            results: self.results,
            stop_reason,
            final_configuration,
            final_apply_error,
        }
    }

    async fn identify(&self) -> DeviceInfo {
        let info = match self.device.device_info().await {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "Could not read device info");
                DeviceInfo::default()
            }
        };

        if info.total_cores() == 0 {
            warn!("Device did not report its core count; hashrate tolerance check disabled");
        }

        info!(
            hostname = ?info.hostname,
            asic_model = ?info.asic_model,
            small_cores = info.small_core_count,
            asics = info.asic_count,
            current = ?info.current,
            "Device identified"
        );

        info
    }

    async fn search(&mut self, cancellation: &CancellationToken) -> StopReason {
        loop {
            if cancellation.is_cancelled() {
                return StopReason::Cancelled;
            }

            let configuration = self.state.current();
            self.state.begin_test();
            info!(
                run = self.results.len() + 1,
                core_voltage_mv = configuration.voltage_mv,
                frequency_mhz = configuration.frequency_mhz,
                "Testing configuration"
            );

            match self.prepare(configuration, cancellation).await {
                Ok(true) => {}
                Ok(false) => return StopReason::Cancelled,
                Err(e) => {
                    error!(%configuration, error = %e, "Failed to apply configuration");
                    return StopReason::DeviceError(e.to_string());
                }
            }

            let collection = SampleCollector::new(
                self.device.as_ref(),
                &self.config.sampling,
                &self.config.safety,
                self.config.processing.min_valid_samples,
            )
            .collect(configuration, cancellation)
            .await;

            let outcome = match collection {
                Collection::Complete(samples) => {
                    self.state.begin_evaluation();
                    let expected = self.info.expected_hashrate_ghs(configuration.frequency_mhz);
                    self.processor.process(&samples, configuration, expected)
                }
                Collection::Insufficient { samples, required } => {
                    self.state.begin_evaluation();
                    Err(Rejection::InsufficientData {
                        valid: samples.len(),
                        required,
                    })
                }
                Collection::Aborted(reason) => return StopReason::SafetyAbort(reason),
                Collection::Cancelled => return StopReason::Cancelled,
            };

            match &outcome {
                Ok(result) => self.record(result.clone()).await,
                Err(rejection) => {
                    warn!(%configuration, %rejection, "Run rejected");
                    if let Rejection::Unstable(result) = rejection {
                        self.record(result.as_ref().clone()).await;
                    }
                }
            }

            match self.state.evaluate(&outcome, &self.config.search) {
                Transition::Advance(next) => {
                    info!(next = %next, "Stable, raising frequency");
                }
                Transition::BackOff(next) => {
                    info!(
                        next = %next,
                        failures = self.state.consecutive_failures(),
                        "Not stable, raising voltage"
                    );
                }
                Transition::Stop(reason) => return reason,
            }
        }
    }

    /// Apply `configuration`, restart, and wait for the device to settle.
    /// Returns `Ok(false)` if cancelled while waiting.
    async fn prepare(
        &self,
        configuration: Configuration,
        cancellation: &CancellationToken,
    ) -> Result<bool, DeviceError> {
        self.device.apply_configuration(configuration).await?;
        if !sleep_or_cancel(self.config.sampling.apply_settle, cancellation).await {
            return Ok(false);
        }

        self.device.restart().await?;
        debug!(
            pause_secs = self.config.sampling.stabilization_pause.as_secs(),
            "Waiting for device to stabilize"
        );
        Ok(sleep_or_cancel(self.config.sampling.stabilization_pause, cancellation).await)
    }

    async fn record(&mut self, result: RunResult) {
        self.results.push(result);

        if let Some(writer) = &self.report {
            if let Err(e) = writer.save(&self.results).await {
                warn!(path = %writer.path().display(), error = %e, "Failed to save results");
            }
        }
    }

    /// Best stable result, else best valid result, else the settings the
    /// device had at startup if they are inside the search bounds, else the
    /// search floor.
    fn final_target(&self) -> Configuration {
        let limits = &self.config.search;
        self.state
            .best_by_hashrate()
            .or(self.state.best_by_efficiency())
            .map(|best| best.configuration)
            .or(self.info.current.filter(|c| limits.contains(*c)))
            .unwrap_or_else(|| limits.floor())
    }

    /// One attempt to leave the device on [`final_target`](Self::final_target).
    async fn apply_final(&self) -> (Option<Configuration>, Option<String>) {
        let target = self.final_target();
        info!(configuration = %target, "Applying final settings");

        let applied = async {
            self.device.apply_configuration(target).await?;
            self.device.restart().await
        }
        .await;

        match applied {
            Ok(()) => (Some(target), None),
            Err(e) => {
                error!(configuration = %target, error = %e, "Failed to apply final settings");
                (None, Some(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{BackoffMode, SearchLimits};
    use crate::device::Telemetry;
    use crate::device::scripted::{ScriptedDevice, gamma, healthy};
    use crate::safety::AbortReason;

    /// Hashrate a Gamma reaches at `configuration`, scaled by `fraction`.
    fn hashing(configuration: Configuration, fraction: f64) -> Telemetry {
        healthy(gamma().expected_hashrate_ghs(configuration.frequency_mhz) * fraction)
    }

    fn stable_device() -> ScriptedDevice {
        ScriptedDevice::new(gamma(), |configuration, _| Ok(hashing(configuration, 1.0)))
    }

    async fn run(device: &Arc<ScriptedDevice>, config: BenchmarkConfig) -> BenchmarkOutcome {
        SearchController::new(device.clone(), config)
            .unwrap()
            .run(CancellationToken::new())
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn stable_device_climbs_to_max_frequency() {
        let device = Arc::new(stable_device());

        let outcome = run(&device, BenchmarkConfig::default()).await;

        assert_eq!(outcome.stop_reason, StopReason::MaxFrequency);
        assert_eq!(outcome.results.len(), 30);
        let frequencies: Vec<u32> = outcome
            .results
            .iter()
            .map(|r| r.configuration.frequency_mhz)
            .collect();
        assert_eq!(frequencies, (525..=1250).step_by(25).collect::<Vec<_>>());
        assert!(outcome.results.iter().all(|r| r.configuration.voltage_mv == 1150));

        assert_eq!(
            outcome.final_configuration,
            Some(Configuration::new(1150, 1250))
        );
        assert_eq!(device.last_applied(), Some(Configuration::new(1150, 1250)));
        assert_eq!(outcome.top_performers.len(), 5);
        assert_eq!(
            outcome.top_performers[0].configuration,
            Configuration::new(1150, 1250)
        );
        assert_eq!(outcome.exit_code(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn every_configuration_is_applied_and_restarted() {
        let device = Arc::new(stable_device());
        let config = BenchmarkConfig {
            search: SearchLimits {
                max_frequency_mhz: 575,
                ..Default::default()
            },
            ..Default::default()
        };

        run(&device, config).await;

        // Three tests plus the final apply.
        assert_eq!(
            device.applied(),
            [
                Configuration::new(1150, 525),
                Configuration::new(1150, 550),
                Configuration::new(1150, 575),
                Configuration::new(1150, 575),
            ]
        );
        assert_eq!(device.restarts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_stabilization_before_sampling() {
        let device = Arc::new(stable_device());
        let config = BenchmarkConfig {
            search: SearchLimits {
                max_frequency_mhz: 525,
                ..Default::default()
            },
            ..Default::default()
        };
        let start = tokio::time::Instant::now();

        run(&device, config).await;

        // 2s settle + 90s pause + nine 15s sample waits.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(227) && elapsed < Duration::from_secs(228));
    }

    #[tokio::test(start_paused = true)]
    async fn power_spike_aborts_and_restores_best() {
        let device = Arc::new(ScriptedDevice::new(gamma(), |configuration, index| {
            if configuration.frequency_mhz == 550 && index == 2 {
                Ok(Telemetry {
                    power_w: Some(46.0),
                    ..hashing(configuration, 1.0)
                })
            } else {
                Ok(hashing(configuration, 1.0))
            }
        }));

        let outcome = run(&device, BenchmarkConfig::default()).await;

        assert!(matches!(
            outcome.stop_reason,
            StopReason::SafetyAbort(AbortReason::Power { .. })
        ));
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(
            outcome.final_configuration,
            Some(Configuration::new(1150, 525))
        );
        assert_eq!(device.last_applied(), Some(Configuration::new(1150, 525)));
        assert_eq!(outcome.exit_code(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_applies_best_so_far() {
        let cancellation = CancellationToken::new();
        let trigger = cancellation.clone();
        let device = Arc::new(ScriptedDevice::new(gamma(), move |configuration, index| {
            if configuration.frequency_mhz == 575 && index == 3 {
                trigger.cancel();
            }
            Ok(hashing(configuration, 1.0))
        }));

        let outcome = SearchController::new(device.clone(), BenchmarkConfig::default())
            .unwrap()
            .run(cancellation)
            .await;

        assert_eq!(outcome.stop_reason, StopReason::Cancelled);
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(
            outcome.final_configuration,
            Some(Configuration::new(1150, 550))
        );
        assert_eq!(outcome.exit_code(), 0);
    }

    #[test]
    fn out_of_bounds_initial_configuration_is_refused() {
        let device = Arc::new(stable_device());
        let config = BenchmarkConfig {
            initial: Some(Configuration::new(1500, 1240)),
            ..Default::default()
        };

        let refused = SearchController::new(device.clone(), config);

        assert!(matches!(
            refused,
            Err(ConfigError::VoltageOutOfRange { value: 1500, .. })
        ));
        assert!(device.applied().is_empty());
        assert_eq!(device.restarts(), 0);
    }

    #[test]
    fn zero_frequency_step_is_refused() {
        let config = BenchmarkConfig {
            search: SearchLimits {
                frequency_step_mhz: 0,
                ..Default::default()
            },
            ..Default::default()
        };

        assert!(matches!(
            SearchController::new(Arc::new(stable_device()), config),
            Err(ConfigError::Zero {
                name: "frequency_step_mhz"
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn startup_settings_outside_bounds_fall_back_to_floor() {
        let info = DeviceInfo {
            current: Some(Configuration::new(1500, 1300)),
            ..gamma()
        };
        let device = Arc::new(ScriptedDevice::new(info, |configuration, _| {
            Ok(hashing(configuration, 0.5))
        }));
        let config = BenchmarkConfig {
            search: SearchLimits {
                max_voltage_mv: 1150,
                ..Default::default()
            },
            ..Default::default()
        };

        let outcome = run(&device, config).await;

        assert_eq!(outcome.stop_reason, StopReason::MaxVoltage);
        assert_eq!(
            outcome.final_configuration,
            Some(Configuration::new(1150, 525))
        );
    }

    /// Cancel `after` into the search. The first run (525 MHz) ends at
    /// 227 s; the second applies at 227 s, restarts at 229 s and pauses
    /// until 319 s.
    async fn cancel_after(after: Duration) -> (Arc<ScriptedDevice>, BenchmarkOutcome) {
        let device = Arc::new(stable_device());
        let cancellation = CancellationToken::new();
        let trigger = cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            trigger.cancel();
        });

        let outcome = SearchController::new(device.clone(), BenchmarkConfig::default())
            .unwrap()
            .run(cancellation)
            .await;
        (device, outcome)
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_settle_restores_best() {
        let (device, outcome) = cancel_after(Duration::from_secs(228)).await;

        assert_eq!(outcome.stop_reason, StopReason::Cancelled);
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(
            outcome.final_configuration,
            Some(Configuration::new(1150, 525))
        );
        assert_eq!(
            device.applied(),
            [
                Configuration::new(1150, 525),
                Configuration::new(1150, 550),
                Configuration::new(1150, 525),
            ]
        );
        // Restart for the first run and the final apply only.
        assert_eq!(device.restarts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_stabilization_restores_best() {
        let (device, outcome) = cancel_after(Duration::from_secs(300)).await;

        assert_eq!(outcome.stop_reason, StopReason::Cancelled);
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(
            outcome.results[0].configuration,
            Configuration::new(1150, 525)
        );
        assert_eq!(
            outcome.final_configuration,
            Some(Configuration::new(1150, 525))
        );
        assert_eq!(device.restarts(), 3);
        assert_eq!(outcome.exit_code(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_leaves_device_on_startup_settings() {
        let device = Arc::new(stable_device());
        let cancellation = CancellationToken::new();
        cancellation.cancel();

        let outcome = SearchController::new(device.clone(), BenchmarkConfig::default())
            .unwrap()
            .run(cancellation)
            .await;

        assert_eq!(outcome.stop_reason, StopReason::Cancelled);
        assert!(outcome.results.is_empty());
        assert_eq!(device.applied(), [Configuration::new(1200, 575)]);
    }

    #[tokio::test(start_paused = true)]
    async fn apply_failure_stops_and_resets_once() {
        let device = Arc::new(stable_device().rejecting(Configuration::new(1150, 575)));

        let outcome = run(&device, BenchmarkConfig::default()).await;

        assert!(matches!(outcome.stop_reason, StopReason::DeviceError(_)));
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(
            outcome.final_configuration,
            Some(Configuration::new(1150, 550))
        );
        assert_eq!(device.applied().len(), 3);
        assert_eq!(outcome.exit_code(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_apply_of_first_configuration_restores_startup_settings() {
        let device = Arc::new(stable_device().rejecting(Configuration::new(1150, 525)));

        let outcome = run(&device, BenchmarkConfig::default()).await;

        assert!(matches!(outcome.stop_reason, StopReason::DeviceError(_)));
        assert!(outcome.results.is_empty());
        assert_eq!(
            outcome.final_configuration,
            Some(Configuration::new(1200, 575))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_final_apply_is_reported() {
        let device = Arc::new(stable_device().rejecting(Configuration::new(1200, 575)));
        let cancellation = CancellationToken::new();
        cancellation.cancel();

        let outcome = SearchController::new(device.clone(), BenchmarkConfig::default())
            .unwrap()
            .run(cancellation)
            .await;

        assert_eq!(outcome.final_configuration, None);
        assert!(outcome.final_apply_error.is_some());
        assert_eq!(device.restarts(), 0);
        assert_eq!(outcome.exit_code(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unstable_device_climbs_voltage_then_restores_startup_settings() {
        let device = Arc::new(ScriptedDevice::new(gamma(), |configuration, _| {
            Ok(hashing(configuration, 0.5))
        }));

        let outcome = run(&device, BenchmarkConfig::default()).await;

        assert_eq!(outcome.stop_reason, StopReason::MaxVoltage);
        let voltages: Vec<u32> = outcome
            .results
            .iter()
            .map(|r| r.configuration.voltage_mv)
            .collect();
        assert_eq!(voltages, (1150..=1390).step_by(20).collect::<Vec<_>>());
        assert!(outcome.results.iter().all(|r| r.configuration.frequency_mhz == 525));
        assert!(outcome.results.iter().all(|r| !r.valid && !r.stable));
        assert!(outcome.top_performers.is_empty());
        assert_eq!(
            outcome.final_configuration,
            Some(Configuration::new(1200, 575))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn valid_but_unstable_result_is_the_fallback() {
        let device = Arc::new(ScriptedDevice::new(gamma(), |configuration, _| {
            Ok(hashing(configuration, 0.93))
        }));
        let config = BenchmarkConfig {
            search: SearchLimits {
                max_voltage_mv: 1170,
                ..Default::default()
            },
            ..Default::default()
        };

        let outcome = run(&device, config).await;

        assert_eq!(outcome.stop_reason, StopReason::MaxVoltage);
        assert!(outcome.best_by_hashrate.is_none());
        assert_eq!(
            outcome.final_configuration,
            Some(Configuration::new(1150, 525))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retreating_below_min_frequency_stops() {
        let info = DeviceInfo {
            current: None,
            ..gamma()
        };
        let device = Arc::new(ScriptedDevice::new(info, |configuration, _| {
            Ok(hashing(configuration, 0.5))
        }));
        let config = BenchmarkConfig {
            search: SearchLimits {
                backoff: BackoffMode::RetreatFrequency,
                ..Default::default()
            },
            ..Default::default()
        };

        let outcome = run(&device, config).await;

        assert_eq!(outcome.stop_reason, StopReason::MinFrequency);
        assert_eq!(outcome.results.len(), 1);
        // No results worth keeping and no startup settings: search floor.
        assert_eq!(
            outcome.final_configuration,
            Some(Configuration::new(1150, 525))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn insufficient_data_counts_toward_failure_streak() {
        let device = Arc::new(ScriptedDevice::new(gamma(), |configuration, _| {
            Ok(Telemetry {
                chip_temp_c: None,
                ..hashing(configuration, 1.0)
            })
        }));
        let config = BenchmarkConfig {
            search: SearchLimits {
                max_consecutive_failures: Some(2),
                ..Default::default()
            },
            ..Default::default()
        };

        let outcome = run(&device, config).await;

        assert_eq!(outcome.stop_reason, StopReason::TooManyFailures(2));
        assert!(outcome.results.is_empty());
        assert_eq!(
            &device.applied()[..2],
            [Configuration::new(1150, 525), Configuration::new(1170, 525)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn saves_report_after_each_run() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ReportWriter::new(dir.path(), "10.0.0.7");
        let path = writer.path().to_path_buf();
        let device = Arc::new(stable_device());
        let config = BenchmarkConfig {
            search: SearchLimits {
                max_frequency_mhz: 575,
                ..Default::default()
            },
            ..Default::default()
        };

        let outcome = SearchController::new(device, config)
            .unwrap()
            .with_report(writer)
            .run(CancellationToken::new())
            .await;

        let saved: crate::report::BenchmarkReport =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        let saved_configurations: Vec<Configuration> =
            saved.all_results.iter().map(|r| r.configuration).collect();
        let configurations: Vec<Configuration> =
            outcome.results.iter().map(|r| r.configuration).collect();
        assert_eq!(saved_configurations, configurations);
        assert_eq!(saved.top_performers.len(), 3);
    }
}
