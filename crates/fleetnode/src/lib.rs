//! fleetnode: Incus fleet operator daemon
//!
//! Wires the record store, lifecycle manager and CPU admission monitor
//! together and exposes fleet operations as JSON commands.

#![forbid(unsafe_code)]

pub mod access;
pub mod account_cmd;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod error;
pub mod fleet_cmd;
pub mod vps_cmd;

use fleet_lifecycle::{LifecycleManager, SharedStore};
use fleet_monitor::MonitorHandle;
use fleet_runner::CommandRunner;
use fleet_store::RecordStore;
use std::sync::Arc;
use tokio::sync::RwLock;

pub use config::FleetConfig;

/// Every command `handle_command` understands.
pub const COMMANDS: &[&str] = &[
    // VPS lifecycle
    "vps.create",
    "vps.purchase",
    "vps.list",
    "vps.info",
    "vps.start",
    "vps.stop",
    "vps.restart",
    "vps.reinstall",
    "vps.delete",
    "vps.set_ip",
    "vps.share",
    "vps.revoke",
    "vps.snapshot",
    "vps.snapshots",
    "vps.restore",
    "vps.exec",
    "vps.ssh",
    // Accounts
    "credits.balance",
    "credits.add",
    "credits.remove",
    "admin.list",
    "admin.add",
    "admin.remove",
    // Fleet
    "fleet.stats",
    "fleet.stop_all",
    "monitor.status",
    "monitor.enable",
    "monitor.disable",
    "node.commands",
];

// ─── Node state ───────────────────────────────────────────────────────────────

/// Shared state passed by reference into every command handler. Cloning is
/// cheap; clones share the store, manager and monitor.
#[derive(Clone)]
pub struct NodeState {
    pub config: FleetConfig,
    pub store: SharedStore,
    pub manager: Arc<LifecycleManager>,
    pub monitor: MonitorHandle,
}

impl NodeState {
    pub fn new(config: FleetConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let store = Arc::new(RwLock::new(RecordStore::open(&config.state_path)));
        let manager =
            Arc::new(LifecycleManager::new(runner, Arc::clone(&store), config.lifecycle.clone()));
        let monitor = MonitorHandle::new(config.monitor.clone());
        Self { config, store, manager, monitor }
    }
}

/// Create node state backed by the real runtime CLI.
pub fn create_state(config: FleetConfig) -> NodeState {
    NodeState::new(config, Arc::new(fleet_runner::ProcessRunner))
}
