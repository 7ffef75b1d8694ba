//! Shared fixtures for the fleet integration tests.
//!
//! [`Fleet`] wires a record store in a temp dir to a lifecycle manager
//! driven by a scripted runner; [`FixedSampler`] feeds the admission
//! monitor a prepared series of CPU readings.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use fleet_lifecycle::testing::ScriptedRunner;
use fleet_lifecycle::{LifecycleConfig, LifecycleManager, SharedStore};
use fleet_monitor::{CpuSampler, MonitorError, MonitorResult};
use fleet_runner::CommandRunner;
use fleet_store::RecordStore;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::RwLock;

/// Address listing every launched container reports.
pub const IP_OUTPUT: &str = "    inet 10.20.0.7/24 brd 10.20.0.255 scope global eth0\n    \
                             inet6 fd42::7/64 scope global\n";

pub struct Fleet {
    pub dir: TempDir,
    pub runner: Arc<ScriptedRunner>,
    pub store: SharedStore,
    pub manager: Arc<LifecycleManager>,
}

impl Fleet {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        Self::open(dir)
    }

    /// Seed `state/vps_data.json` with `inventory` before opening.
    pub fn with_inventory(inventory: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = dir.path().join("state");
        std::fs::create_dir_all(&state).expect("state dir");
        std::fs::write(state.join("vps_data.json"), inventory).expect("seed inventory");
        Self::open(dir)
    }

    fn open(dir: TempDir) -> Self {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("ip addr show", 0, IP_OUTPUT, "");
        let store = Arc::new(RwLock::new(RecordStore::open(dir.path())));
        let config = LifecycleConfig {
            launch_settle_secs: 0,
            static_ip_settle_secs: 0,
            ssh_settle_secs: 0,
            ..LifecycleConfig::default()
        };
        let manager = Arc::new(LifecycleManager::new(
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            Arc::clone(&store),
            config,
        ));
        Self { dir, runner, store, manager }
    }

    pub fn state_path(&self) -> &Path {
        self.dir.path()
    }

    /// A fresh store read back from disk.
    pub fn reload(&self) -> RecordStore {
        RecordStore::open(self.dir.path())
    }

    /// Raw JSON of one persisted document.
    pub fn document(&self, domain: &str) -> String {
        let path = self.dir.path().join("state").join(format!("{domain}.json"));
        std::fs::read_to_string(path).expect("state document")
    }
}

impl Default for Fleet {
    fn default() -> Self {
        Self::new()
    }
}

/// Replays prepared readings; `None` entries fail the sample.
pub struct FixedSampler {
    readings: Mutex<VecDeque<Option<f32>>>,
}

impl FixedSampler {
    pub fn new(readings: &[Option<f32>]) -> Arc<Self> {
        Arc::new(Self { readings: Mutex::new(readings.iter().copied().collect()) })
    }
}

#[async_trait]
impl CpuSampler for FixedSampler {
    async fn sample(&self) -> MonitorResult<f32> {
        match self.readings.lock().pop_front() {
            Some(Some(usage)) => Ok(usage),
            Some(None) => Err(MonitorError::Sample("reading unavailable".into())),
            None => Ok(0.0),
        }
    }
}
