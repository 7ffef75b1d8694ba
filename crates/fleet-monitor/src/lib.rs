//! Host CPU admission monitor for the Incus fleet core.
//!
//! Samples host CPU on an interval and, when usage exceeds the configured
//! threshold, asks the lifecycle manager to force-stop every container.

#![forbid(unsafe_code)]

pub mod breaker;
pub mod monitor;
pub mod sampler;

use thiserror::Error;

pub use breaker::{Breaker, TriggerMode};
pub use monitor::{AdmissionMonitor, CycleOutcome, MonitorConfig, MonitorHandle, MonitorStatus};
pub use sampler::{CpuSampler, SysinfoSampler};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("CPU sample failed: {0}")]
    Sample(String),
}

pub type MonitorResult<T> = Result<T, MonitorError>;
