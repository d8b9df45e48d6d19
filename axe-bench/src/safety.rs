//! Hard-limit monitor for a single run.
//!
//! # State Machine
//!
//! ```text
//!               reading within limits
//!              ┌────────────────────┐
//!              ▼                    │
//!         Monitoring ───────────────┘
//!              │
//!              │  reading at/over a limit, or telemetry lost
//!              ▼
//!      Aborted(reason) ◄── any further input
//! ```
//!
//! - **Monitoring:** Every reading so far was inside the limits.
//! - **Aborted:** A limit was breached. Terminal: the monitor keeps
//!   reporting the original reason until it is dropped. A new monitor is
//!   built for every run.
//!
//! [`SafetyMonitor::check`] returns a [`SafetyStatus`] describing the
//! transition, so the caller can act on exactly the edge where the abort
//! happened.

use std::fmt;

use crate::config::SafetyLimits;
use crate::device::Telemetry;

/// Why a run was aborted.
#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    ChipTemperature { temp_c: f64, limit_c: f64 },
    VrTemperature { temp_c: f64, limit_c: f64 },
    Power { power_w: f64, limit_w: f64 },
    InputVoltageLow { voltage_mv: f64, limit_mv: f64 },
    InputVoltageHigh { voltage_mv: f64, limit_mv: f64 },
    /// Consecutive telemetry reads failed; the device can't be observed.
    TelemetryLost { failures: u32 },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::ChipTemperature { temp_c, limit_c } => {
                write!(f, "chip temperature {temp_c:.1}°C ≥ {limit_c}°C")
            }
            AbortReason::VrTemperature { temp_c, limit_c } => {
                write!(f, "VR temperature {temp_c:.1}°C ≥ {limit_c}°C")
            }
            AbortReason::Power { power_w, limit_w } => {
                write!(f, "power {power_w:.1}W ≥ {limit_w}W")
            }
            AbortReason::InputVoltageLow {
                voltage_mv,
                limit_mv,
            } => write!(f, "input voltage {voltage_mv:.0}mV < {limit_mv}mV"),
            AbortReason::InputVoltageHigh {
                voltage_mv,
                limit_mv,
            } => write!(f, "input voltage {voltage_mv:.0}mV > {limit_mv}mV"),
            AbortReason::TelemetryLost { failures } => {
                write!(f, "telemetry unavailable after {failures} attempts")
            }
        }
    }
}

/// Result of feeding one input to the monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum SafetyStatus {
    /// Still monitoring, reading was within limits.
    Clear,

    /// This input breached a limit. Returned exactly once.
    Tripped(AbortReason),

    /// Already aborted earlier; input ignored.
    Aborted,
}

#[derive(Debug)]
enum State {
    Monitoring,
    Aborted(AbortReason),
}

#[derive(Debug)]
pub struct SafetyMonitor {
    limits: SafetyLimits,
    state: State,
}

impl SafetyMonitor {
    pub fn new(limits: SafetyLimits) -> Self {
        Self {
            limits,
            state: State::Monitoring,
        }
    }

    /// Check a reading against the limits.
    ///
    /// Only fields present in the reading are checked; a missing VR
    /// temperature, for instance, can't trip the VR limit. Maxima are
    /// inclusive: a chip at exactly the limit aborts.
    pub fn check(&mut self, reading: &Telemetry) -> SafetyStatus {
        if let State::Aborted(_) = self.state {
            return SafetyStatus::Aborted;
        }

        match self.violation(reading) {
            Some(reason) => self.trip(reason),
            None => SafetyStatus::Clear,
        }
    }

    /// Report that telemetry could not be read `failures` times in a row.
    pub fn telemetry_lost(&mut self, failures: u32) -> SafetyStatus {
        if let State::Aborted(_) = self.state {
            return SafetyStatus::Aborted;
        }
        self.trip(AbortReason::TelemetryLost { failures })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.state, State::Aborted(_))
    }

    /// The reason the monitor aborted, if it has.
    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match &self.state {
            State::Aborted(reason) => Some(reason),
            State::Monitoring => None,
        }
    }

    fn trip(&mut self, reason: AbortReason) -> SafetyStatus {
        self.state = State::Aborted(reason.clone());
        SafetyStatus::Tripped(reason)
    }

    fn violation(&self, reading: &Telemetry) -> Option<AbortReason> {
        let limits = &self.limits;

        if let Some(temp_c) = reading.chip_temp_c.filter(|t| *t >= limits.max_chip_temp_c) {
            return Some(AbortReason::ChipTemperature {
                temp_c,
                limit_c: limits.max_chip_temp_c,
            });
        }

        if let Some(temp_c) = reading.vr_temp_c.filter(|t| *t >= limits.max_vr_temp_c) {
            return Some(AbortReason::VrTemperature {
                temp_c,
                limit_c: limits.max_vr_temp_c,
            });
        }

        if let Some(power_w) = reading.power_w.filter(|p| *p >= limits.max_power_w) {
            return Some(AbortReason::Power {
                power_w,
                limit_w: limits.max_power_w,
            });
        }

        if let Some(voltage_mv) = reading.input_voltage_mv {
            if voltage_mv < limits.min_input_voltage_mv {
                return Some(AbortReason::InputVoltageLow {
                    voltage_mv,
                    limit_mv: limits.min_input_voltage_mv,
                });
            }
            if voltage_mv > limits.max_input_voltage_mv {
                return Some(AbortReason::InputVoltageHigh {
                    voltage_mv,
                    limit_mv: limits.max_input_voltage_mv,
                });
            }
        }

        None
    }
}
