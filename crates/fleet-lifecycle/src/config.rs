//! Lifecycle settings and the plan catalog

use fleet_proto::DEFAULT_STORAGE_GB;
use fleet_runner::{LONG_TIMEOUT, SHUTDOWN_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Settings the lifecycle manager needs to talk to the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Runtime CLI binary (e.g. `incus`)
    #[serde(default = "default_runtime_bin")]
    pub runtime_bin: String,

    /// Image every container is launched from
    #[serde(default = "default_image")]
    pub image: String,

    /// Storage pool passed to `launch -s`
    #[serde(default = "default_storage_pool")]
    pub storage_pool: String,

    /// Primary network interface inside containers
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Wait after launch before reading addresses
    #[serde(default = "default_launch_settle")]
    pub launch_settle_secs: u64,

    /// Wait after a static address restart before re-reading addresses
    #[serde(default = "default_static_ip_settle")]
    pub static_ip_settle_secs: u64,

    /// Wait after starting a tmate session before reading its SSH command
    #[serde(default = "default_ssh_settle")]
    pub ssh_settle_secs: u64,

    /// Bound for launches, deletes, snapshots and exec
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Bound for stop and stop-all
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Disk size recorded for containers created without a plan
    #[serde(default = "default_storage_gb")]
    pub default_storage_gb: u32,

    #[serde(default = "default_plans")]
    pub plans: Vec<PlanSpec>,
}

/// A purchasable resource bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSpec {
    pub name: String,
    pub ram_gb: u32,
    pub cpu: u32,
    pub storage_gb: u32,
    /// Processor name → price in credits
    pub prices: BTreeMap<String, u64>,
}

impl LifecycleConfig {
    pub fn launch_settle(&self) -> Duration {
        Duration::from_secs(self.launch_settle_secs)
    }

    pub fn static_ip_settle(&self) -> Duration {
        Duration::from_secs(self.static_ip_settle_secs)
    }

    pub fn ssh_settle(&self) -> Duration {
        Duration::from_secs(self.ssh_settle_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn plan(&self, name: &str) -> Option<&PlanSpec> {
        self.plans.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }
}

impl PlanSpec {
    /// Catalog spelling of `processor` and its price.
    pub fn offer(&self, processor: &str) -> Option<(&str, u64)> {
        self.prices
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(processor))
            .map(|(name, price)| (name.as_str(), *price))
    }

    pub fn price(&self, processor: &str) -> Option<u64> {
        self.offer(processor).map(|(_, price)| price)
    }
}

fn default_runtime_bin() -> String {
    "incus".to_string()
}

fn default_image() -> String {
    "ubuntu:22.04".to_string()
}

fn default_storage_pool() -> String {
    "btrpool".to_string()
}

fn default_interface() -> String {
    "eth0".to_string()
}

fn default_launch_settle() -> u64 {
    10
}

fn default_static_ip_settle() -> u64 {
    5
}

fn default_ssh_settle() -> u64 {
    3
}

fn default_command_timeout() -> u64 {
    LONG_TIMEOUT.as_secs()
}

fn default_shutdown_timeout() -> u64 {
    SHUTDOWN_TIMEOUT.as_secs()
}

fn default_storage_gb() -> u32 {
    DEFAULT_STORAGE_GB
}

fn plan(name: &str, ram_gb: u32, cpu: u32, intel: u64, amd: u64) -> PlanSpec {
    PlanSpec {
        name: name.to_string(),
        ram_gb,
        cpu,
        storage_gb: DEFAULT_STORAGE_GB,
        prices: [("Intel".to_string(), intel), ("AMD".to_string(), amd)].into_iter().collect(),
    }
}

fn default_plans() -> Vec<PlanSpec> {
    vec![
        plan("Starter", 4, 1, 42, 83),
        plan("Basic", 8, 1, 96, 164),
        plan("Standard", 12, 2, 192, 320),
        plan("Pro", 16, 2, 220, 340),
    ]
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            runtime_bin: default_runtime_bin(),
            image: default_image(),
            storage_pool: default_storage_pool(),
            interface: default_interface(),
            launch_settle_secs: default_launch_settle(),
            static_ip_settle_secs: default_static_ip_settle(),
            ssh_settle_secs: default_ssh_settle(),
            command_timeout_secs: default_command_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            default_storage_gb: default_storage_gb(),
            plans: default_plans(),
        }
    }
}
