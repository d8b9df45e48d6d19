use std::fmt;

use strum::Display;

use crate::config::{BackoffMode, SearchLimits};
use crate::processor::Rejection;
use crate::safety::AbortReason;
use crate::types::{Configuration, RunResult};

/// Where the search is in its cycle.
///
/// ```text
/// Idle ─► Testing ─► Evaluating ─┬─► Advancing ──┐
///            ▲                   ├─► BackingOff ─┤
///            │                   └─► Stopping    │
///            └───────────────────────────────────┘
/// ```
///
/// `Stopping` is also entered directly from `Testing` on a safety abort,
/// a device error, or cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SearchPhase {
    Idle,
    Testing,
    Evaluating,
    Advancing,
    BackingOff,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Direction {
    Increasing,
    Decreasing,
}

/// Why the search ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    /// The next frequency step would exceed the maximum.
    MaxFrequency,
    /// The next voltage step would exceed the maximum.
    MaxVoltage,
    MinFrequency,
    MinVoltage,
    /// Too many unstable or insufficient runs in a row.
    TooManyFailures(u32),
    SafetyAbort(AbortReason),
    /// Applying settings or restarting failed; the device state is unknown.
    DeviceError(String),
    Cancelled,
}

impl StopReason {
    /// Whether the search ran out of configurations to try, as opposed to
    /// being cut short.
    pub fn is_exhausted(&self) -> bool {
        matches!(
            self,
            StopReason::MaxFrequency
                | StopReason::MaxVoltage
                | StopReason::MinFrequency
                | StopReason::MinVoltage
                | StopReason::TooManyFailures(_)
        )
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::MaxFrequency => write!(f, "reached max frequency"),
            StopReason::MaxVoltage => write!(f, "reached max voltage"),
            StopReason::MinFrequency => write!(f, "reached min frequency"),
            StopReason::MinVoltage => write!(f, "reached min voltage"),
            StopReason::TooManyFailures(count) => {
                write!(f, "{count} unstable runs in a row")
            }
            StopReason::SafetyAbort(reason) => write!(f, "safety abort: {reason}"),
            StopReason::DeviceError(error) => write!(f, "device error: {error}"),
            StopReason::Cancelled => write!(f, "interrupted by operator"),
        }
    }
}

/// Decision taken after evaluating a run.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Stable: try a higher frequency.
    Advance(Configuration),
    /// Unstable or no data: try more voltage.
    BackOff(Configuration),
    Stop(StopReason),
}

/// Mutable state of the search, changed only by its transitions.
#[derive(Debug, Clone)]
pub struct SearchState {
    phase: SearchPhase,
    current: Configuration,
    direction: Direction,
    consecutive_failures: u32,
    best_by_hashrate: Option<RunResult>,
    best_by_efficiency: Option<RunResult>,
    stop_reason: Option<StopReason>,
}

impl SearchState {
    pub fn new(initial: Configuration) -> Self {
        Self {
            phase: SearchPhase::Idle,
            current: initial,
            direction: Direction::Increasing,
            consecutive_failures: 0,
            best_by_hashrate: None,
            best_by_efficiency: None,
            stop_reason: None,
        }
    }

    pub fn phase(&self) -> SearchPhase {
        self.phase
    }

    /// The configuration under test, or next to be tested.
    pub fn current(&self) -> Configuration {
        self.current
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Highest-hashrate stable result so far.
    pub fn best_by_hashrate(&self) -> Option<&RunResult> {
        self.best_by_hashrate.as_ref()
    }

    /// Lowest J/TH valid result so far.
    pub fn best_by_efficiency(&self) -> Option<&RunResult> {
        self.best_by_efficiency.as_ref()
    }

    pub fn stop_reason(&self) -> Option<&StopReason> {
        self.stop_reason.as_ref()
    }

    /// Start testing the current configuration.
    pub fn begin_test(&mut self) {
        debug_assert!(
            matches!(
                self.phase,
                SearchPhase::Idle | SearchPhase::Advancing | SearchPhase::BackingOff
            ),
            "cannot start a test from {}",
            self.phase
        );
        self.phase = SearchPhase::Testing;
    }

    /// Samples are in; the outcome is about to be evaluated.
    pub fn begin_evaluation(&mut self) {
        debug_assert_eq!(self.phase, SearchPhase::Testing);
        self.phase = SearchPhase::Evaluating;
    }

    /// Decide the next step from the outcome of the run at [`current`](Self::current).
    pub fn evaluate(
        &mut self,
        outcome: &Result<RunResult, Rejection>,
        limits: &SearchLimits,
    ) -> Transition {
        let transition = match outcome {
            Ok(result) => {
                self.record(result);
                self.consecutive_failures = 0;
                self.advance(limits)
            }
            Err(rejection) => {
                if let Rejection::Unstable(result) = rejection {
                    self.record(result);
                }
                self.consecutive_failures += 1;
                self.back_off(limits)
            }
        };

        match &transition {
            Transition::Advance(next) => {
                self.phase = SearchPhase::Advancing;
                self.current = *next;
            }
            Transition::BackOff(next) => {
                self.phase = SearchPhase::BackingOff;
                self.current = *next;
            }
            Transition::Stop(reason) => self.stop(reason.clone()),
        }

        transition
    }

    /// End the search.
    pub fn stop(&mut self, reason: StopReason) {
        self.phase = SearchPhase::Stopping;
        self.stop_reason = Some(reason);
    }

    fn record(&mut self, result: &RunResult) {
        if result.stable
            && self
                .best_by_hashrate
                .as_ref()
                .is_none_or(|best| result.average_hashrate > best.average_hashrate)
        {
            self.best_by_hashrate = Some(result.clone());
        }

        if result.valid
            && self
                .best_by_efficiency
                .as_ref()
                .is_none_or(|best| result.efficiency_jth < best.efficiency_jth)
        {
            self.best_by_efficiency = Some(result.clone());
        }
    }

    fn advance(&mut self, limits: &SearchLimits) -> Transition {
        let next_frequency = self.current.frequency_mhz + limits.frequency_step_mhz;
        if next_frequency > limits.max_frequency_mhz {
            return Transition::Stop(StopReason::MaxFrequency);
        }

        self.direction = Direction::Increasing;
        Transition::Advance(Configuration::new(self.current.voltage_mv, next_frequency))
    }

    fn back_off(&mut self, limits: &SearchLimits) -> Transition {
        if let Some(max) = limits.max_consecutive_failures {
            if self.consecutive_failures >= max {
                return Transition::Stop(StopReason::TooManyFailures(self.consecutive_failures));
            }
        }

        let next_voltage = self.current.voltage_mv + limits.voltage_step_mv;
        if next_voltage > limits.max_voltage_mv {
            return Transition::Stop(StopReason::MaxVoltage);
        }
        if next_voltage < limits.min_voltage_mv {
            return Transition::Stop(StopReason::MinVoltage);
        }

        let next_frequency = match limits.backoff {
            BackoffMode::HoldFrequency => Some(self.current.frequency_mhz),
            BackoffMode::RetreatFrequency => {
                self.direction = Direction::Decreasing;
                self.current
                    .frequency_mhz
                    .checked_sub(limits.frequency_step_mhz)
            }
        };
        let Some(next_frequency) = next_frequency.filter(|f| *f >= limits.min_frequency_mhz)
        else {
            return Transition::Stop(StopReason::MinFrequency);
        };

        Transition::BackOff(Configuration::new(next_voltage, next_frequency))
    }
}
