//! The admission monitor loop.

use crate::breaker::{Breaker, TriggerMode};
use crate::sampler::CpuSampler;
use fleet_lifecycle::FleetHandle;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Percent; strictly greater trips the breaker
    #[serde(default = "default_threshold")]
    pub cpu_threshold: f32,

    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    #[serde(default)]
    pub trigger: TriggerMode,
}

fn default_enabled() -> bool {
    true
}

fn default_threshold() -> f32 {
    90.0
}

fn default_check_interval() -> u64 {
    60
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            cpu_threshold: default_threshold(),
            check_interval_secs: default_check_interval(),
            trigger: TriggerMode::default(),
        }
    }
}

impl MonitorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }
}

// ─── Handle ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Shared {
    enabled: AtomicBool,
    last_usage: Mutex<Option<f32>>,
}

/// Cloneable toggle and status view for a running monitor.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    shared: Arc<Shared>,
    config: MonitorConfig,
}

/// Point-in-time view of the monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorStatus {
    pub enabled: bool,
    pub cpu_threshold: f32,
    pub check_interval_secs: u64,
    pub trigger: TriggerMode,
    pub last_usage: Option<f32>,
}

impl MonitorHandle {
    pub fn new(config: MonitorConfig) -> Self {
        let shared = Shared { enabled: AtomicBool::new(config.enabled), last_usage: Mutex::new(None) };
        Self { shared: Arc::new(shared), config }
    }

    /// Takes effect at the next iteration.
    pub fn enable(&self) {
        self.shared.enabled.store(true, Ordering::SeqCst);
        info!("CPU monitor enabled");
    }

    pub fn disable(&self) {
        self.shared.enabled.store(false, Ordering::SeqCst);
        info!("CPU monitor disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn status(&self) -> MonitorStatus {
        MonitorStatus {
            enabled: self.is_enabled(),
            cpu_threshold: self.config.cpu_threshold,
            check_interval_secs: self.config.check_interval_secs,
            trigger: self.config.trigger,
            last_usage: *self.shared.last_usage.lock(),
        }
    }

    fn record(&self, usage: f32) {
        *self.shared.last_usage.lock() = Some(usage);
    }
}

// ─── Monitor ──────────────────────────────────────────────────────────────────

/// What one iteration did.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Disabled,
    SampleFailed,
    /// At or below threshold, or an already reported breach in edge mode.
    Quiet { usage: f32 },
    Tripped { usage: f32, stopped: usize },
    StopFailed { usage: f32 },
}

pub struct AdmissionMonitor {
    sampler: Arc<dyn CpuSampler>,
    fleet: FleetHandle,
    breaker: Breaker,
    handle: MonitorHandle,
    period: Duration,
}

impl AdmissionMonitor {
    /// Build a monitor driven by `handle`; its config fixes threshold,
    /// interval and trigger mode.
    pub fn new(handle: MonitorHandle, sampler: Arc<dyn CpuSampler>, fleet: FleetHandle) -> Self {
        let breaker = Breaker::new(handle.config.trigger, handle.config.cpu_threshold);
        let period = handle.config.check_interval();
        Self { sampler, fleet, breaker, handle, period }
    }

    pub fn handle(&self) -> MonitorHandle {
        self.handle.clone()
    }

    /// One sample-and-decide step. Never fails.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        if !self.handle.is_enabled() {
            return CycleOutcome::Disabled;
        }

        let usage = match self.sampler.sample().await {
            Ok(usage) => usage,
            Err(e) => {
                error!(error = %e, "CPU sampling failed");
                return CycleOutcome::SampleFailed;
            }
        };
        self.handle.record(usage);
        debug!(usage, threshold = self.breaker.threshold(), "CPU sampled");

        if !self.breaker.observe(usage) {
            return CycleOutcome::Quiet { usage };
        }

        warn!(
            usage,
            threshold = self.breaker.threshold(),
            mode = %self.breaker.mode(),
            "CPU usage above threshold, stopping all containers"
        );
        let reason = format!("CPU usage {usage:.1}% exceeded {:.1}%", self.breaker.threshold());
        match self.fleet.force_stop_all(reason).await {
            Ok(stopped) => {
                warn!(stopped, "all containers stopped due to high CPU usage");
                CycleOutcome::Tripped { usage, stopped }
            }
            Err(e) => {
                error!(error = %e, "failed to stop containers after CPU breach");
                self.breaker.rearm();
                CycleOutcome::StopFailed { usage }
            }
        }
    }

    /// Run until the task is aborted.
    pub async fn run(mut self) {
        info!(
            threshold = self.breaker.threshold(),
            interval_secs = self.period.as_secs(),
            mode = %self.breaker.mode(),
            enabled = self.handle.is_enabled(),
            "CPU monitor started"
        );
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.run_cycle().await;
        }
    }
}
