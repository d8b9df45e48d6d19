//! Voltage/frequency benchmark for AxeOS mining devices.
//!
//! The benchmark walks the device through a sequence of core voltage and
//! frequency settings, samples its telemetry while it hashes, and keeps the
//! settings that produce the best stable hashrate. Hard safety limits are
//! enforced on every sample; breaching one ends the run and puts the device
//! back on the best settings seen so far.

pub mod collector;
pub mod config;
pub mod device;
pub mod error;
pub mod processor;
pub mod report;
pub mod safety;
pub mod search;
pub mod tracing;
pub mod types;
