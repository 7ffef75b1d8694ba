//! Node configuration

use fleet_lifecycle::LifecycleConfig;
use fleet_monitor::MonitorConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{NodeError, NodeResult};

/// Configuration for the fleetnode operator daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Directory holding `state/{user_data,vps_data,admin_data}.json`
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// Tenant id with super-admin capability; not part of the admin set
    #[serde(default)]
    pub super_admin_id: String,

    /// Runtime CLI, image, timeouts, settle delays and plan catalog
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// CPU admission monitor
    #[serde(default)]
    pub monitor: MonitorConfig,
}

fn default_state_path() -> PathBuf {
    PathBuf::from("/var/lib/fleetnode")
}

impl FleetConfig {
    pub fn load(path: &Path) -> NodeResult<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|source| NodeError::ConfigRead { path: path.to_path_buf(), source })?;
        let config: Self = serde_json::from_str(&data)
            .map_err(|e| NodeError::Config(format!("parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> NodeResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn validate(&self) -> NodeResult<()> {
        if self.lifecycle.runtime_bin.trim().is_empty() {
            return Err(NodeError::Config("runtime_bin must not be empty".into()));
        }
        let threshold = self.monitor.cpu_threshold;
        if !(0.0..=100.0).contains(&threshold) {
            return Err(NodeError::Config(format!("cpu_threshold {threshold} is outside 0-100")));
        }
        if self.lifecycle.plans.iter().any(|p| p.ram_gb == 0 || p.cpu == 0) {
            return Err(NodeError::Config("every plan needs non-zero ram_gb and cpu".into()));
        }
        Ok(())
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            super_admin_id: String::new(),
            lifecycle: LifecycleConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}
