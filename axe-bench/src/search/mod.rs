//! Voltage/frequency search.
//!
//! [`SearchState`] is the pure decision logic: given the outcome of a run
//! it picks the next configuration or stops. [`SearchController`] is the
//! async driver that talks to the device, sleeps, samples and persists.

mod controller;
mod state;

pub use controller::{BenchmarkOutcome, SearchController};
pub use state::{Direction, SearchPhase, SearchState, StopReason, Transition};
