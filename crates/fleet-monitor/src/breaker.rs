//! Threshold breaker deciding when a CPU sample should trip the fleet.

use serde::{Deserialize, Serialize};

/// How repeated breaches are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// Fire once per breach; re-arm after a sample at or below threshold.
    #[default]
    Edge,
    /// Fire on every sample above threshold.
    Level,
}

impl std::fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Edge => write!(f, "edge"),
            Self::Level => write!(f, "level"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Breaker {
    mode: TriggerMode,
    threshold: f32,
    armed: bool,
}

impl Breaker {
    pub fn new(mode: TriggerMode, threshold: f32) -> Self {
        Self { mode, threshold, armed: true }
    }

    pub fn mode(&self) -> TriggerMode {
        self.mode
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Feed one sample; true when the fleet should be stopped.
    pub fn observe(&mut self, usage: f32) -> bool {
        if usage <= self.threshold {
            self.armed = true;
            return false;
        }
        match self.mode {
            TriggerMode::Level => true,
            TriggerMode::Edge => std::mem::replace(&mut self.armed, false),
        }
    }

    /// Allow the next breached sample to fire again (after a failed stop).
    pub fn rearm(&mut self) {
        self.armed = true;
    }
}
