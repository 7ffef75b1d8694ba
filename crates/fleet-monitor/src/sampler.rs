//! Host CPU sampling.

use crate::{MonitorError, MonitorResult};
use async_trait::async_trait;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::Mutex;

/// Source of host-wide CPU utilization in percent.
#[async_trait]
pub trait CpuSampler: Send + Sync {
    async fn sample(&self) -> MonitorResult<f32>;
}

/// Samples through `sysinfo`, measuring usage over a short window.
pub struct SysinfoSampler {
    system: Mutex<System>,
    window: Duration,
}

impl SysinfoSampler {
    pub fn new(window: Duration) -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();
        Self { system: Mutex::new(system), window: window.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL) }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl CpuSampler for SysinfoSampler {
    async fn sample(&self) -> MonitorResult<f32> {
        let mut system = self.system.lock().await;
        system.refresh_cpu_usage();
        tokio::time::sleep(self.window).await;
        system.refresh_cpu_usage();

        if system.cpus().is_empty() {
            return Err(MonitorError::Sample("no CPUs reported by the host".into()));
        }
        let usage = system.global_cpu_usage();
        if usage.is_finite() {
            Ok(usage)
        } else {
            Err(MonitorError::Sample(format!("invalid CPU reading {usage}")))
        }
    }
}
