//! In-memory device for driving the benchmark in tests.
//!
//! Telemetry comes from a closure that receives the configuration the
//! device is currently running and the index of the read since the last
//! restart, so a test can describe behavior per configuration and per
//! sample without real hardware.

use std::sync::Mutex;

use async_trait::async_trait;

use super::{DeviceClient, DeviceError, DeviceInfo, Telemetry};
use crate::types::Configuration;

type Script = Box<dyn FnMut(Configuration, usize) -> Result<Telemetry, DeviceError> + Send>;

pub(crate) struct ScriptedDevice {
    info: DeviceInfo,
    inner: Mutex<Inner>,
}

struct Inner {
    script: Script,
    running: Configuration,
    reads_since_restart: usize,
    applied: Vec<Configuration>,
    restarts: usize,
    reject_apply: Vec<Configuration>,
}

impl ScriptedDevice {
    pub(crate) fn new(
        info: DeviceInfo,
        script: impl FnMut(Configuration, usize) -> Result<Telemetry, DeviceError> + Send + 'static,
    ) -> Self {
        let running = info.current.unwrap_or(Configuration::new(1150, 525));
        Self {
            info,
            inner: Mutex::new(Inner {
                script: Box::new(script),
                running,
                reads_since_restart: 0,
                applied: Vec::new(),
                restarts: 0,
                reject_apply: Vec::new(),
            }),
        }
    }

    /// Make `apply_configuration` fail for `configuration`.
    pub(crate) fn rejecting(self, configuration: Configuration) -> Self {
        self.inner.lock().unwrap().reject_apply.push(configuration);
        self
    }

    /// Every configuration successfully applied, in order.
    pub(crate) fn applied(&self) -> Vec<Configuration> {
        self.inner.lock().unwrap().applied.clone()
    }

    pub(crate) fn last_applied(&self) -> Option<Configuration> {
        self.applied().last().copied()
    }

    pub(crate) fn restarts(&self) -> usize {
        self.inner.lock().unwrap().restarts
    }
}

#[async_trait]
impl DeviceClient for ScriptedDevice {
    async fn device_info(&self) -> Result<DeviceInfo, DeviceError> {
        Ok(self.info.clone())
    }

    async fn read_telemetry(&self) -> Result<Telemetry, DeviceError> {
        let mut inner = self.inner.lock().unwrap();
        let index = inner.reads_since_restart;
        inner.reads_since_restart += 1;
        let running = inner.running;
        (inner.script)(running, index)
    }

    async fn apply_configuration(&self, configuration: Configuration) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.reject_apply.contains(&configuration) {
            return Err(DeviceError::Other(format!("rejected {configuration}")));
        }
        inner.applied.push(configuration);
        inner.running = configuration;
        Ok(())
    }

    async fn restart(&self) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().unwrap();
        inner.restarts += 1;
        inner.reads_since_restart = 0;
        Ok(())
    }
}

/// A Bitaxe Gamma: one BM1370 with 2040 small cores, idling at the
/// factory default settings.
pub(crate) fn gamma() -> DeviceInfo {
    DeviceInfo {
        hostname: Some("bitaxe".into()),
        asic_model: Some("BM1370".into()),
        current: Some(Configuration::new(1200, 575)),
        small_core_count: 2040,
        asic_count: 1,
    }
}

/// Comfortable readings at the given hashrate.
pub(crate) fn healthy(hashrate_ghs: f64) -> Telemetry {
    Telemetry {
        hashrate_ghs: Some(hashrate_ghs),
        chip_temp_c: Some(52.0),
        vr_temp_c: Some(48.0),
        power_w: Some(15.0),
        input_voltage_mv: Some(5050.0),
    }
}
