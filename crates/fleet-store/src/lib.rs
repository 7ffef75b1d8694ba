//! Record store for the Incus fleet core.
//!
//! Owns the canonical in-memory copy of the three fleet documents (credit
//! ledger, VPS inventory, admin set) and flushes all of them through
//! [`fleet_persist::JsonStore`] after every mutation. A mutation whose flush
//! fails is rolled back in memory, so memory never runs ahead of disk.

#![forbid(unsafe_code)]

pub mod legacy;

use fleet_persist::JsonStore;
use fleet_proto::{TenantId, VpsRecord, VpsStatus, container_id_for};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use legacy::{LegacyInventoryEntry, normalize_inventory};

/// Tenant id → VPS records in creation order (index + 1 = VPS number).
pub type Inventory = BTreeMap<TenantId, Vec<VpsRecord>>;

pub const LEDGER_DOMAIN: &str = "user_data";
pub const INVENTORY_DOMAIN: &str = "vps_data";
pub const ADMIN_DOMAIN: &str = "admin_data";

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("container '{0}' already exists in inventory")]
    Duplicate(String),

    #[error("insufficient credits: need {need}, have {have}")]
    InsufficientCredits { need: u64, have: u64 },
}

pub type StoreResult<T> = Result<T, StoreError>;

// ─── Documents ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(default)]
    pub credits: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct AdminDocument {
    #[serde(default)]
    admins: BTreeSet<TenantId>,
}

/// Where a record sits in the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VpsLocation {
    pub owner_id: TenantId,
    /// 1-based, tenant-facing.
    pub number: usize,
}

/// Fleet-wide totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FleetStats {
    pub tenants: usize,
    pub owners: usize,
    pub total_vps: usize,
    pub running_vps: usize,
    pub total_ram_gb: u64,
    pub total_cpu: u64,
    pub total_credits: u64,
}

// ─── Store ────────────────────────────────────────────────────────────────────

/// In-memory fleet state backed by three JSON documents.
pub struct RecordStore {
    ledger: BTreeMap<TenantId, LedgerEntry>,
    inventory: Inventory,
    admins: BTreeSet<TenantId>,
    ledger_store: JsonStore,
    inventory_store: JsonStore,
    admin_store: JsonStore,
}

impl RecordStore {
    /// Load all documents under `state_path`, normalizing legacy shapes.
    pub fn open(state_path: &Path) -> Self {
        let ledger_store = JsonStore::new(state_path, LEDGER_DOMAIN);
        let inventory_store = JsonStore::new(state_path, INVENTORY_DOMAIN);
        let admin_store = JsonStore::new(state_path, ADMIN_DOMAIN);

        let ledger: BTreeMap<TenantId, LedgerEntry> = ledger_store.load();
        let raw: BTreeMap<TenantId, LegacyInventoryEntry> = inventory_store.load();
        let inventory = normalize_inventory(raw);
        let admins = admin_store.load::<AdminDocument>().admins;

        info!(
            tenants = ledger.len(),
            owners = inventory.len(),
            vps = inventory.values().map(Vec::len).sum::<usize>(),
            admins = admins.len(),
            "loaded fleet state"
        );

        Self { ledger, inventory, admins, ledger_store, inventory_store, admin_store }
    }

    /// Persist all three documents. Every write is attempted; the first
    /// failure is returned.
    pub fn flush(&self) -> StoreResult<()> {
        let admin_doc = AdminDocument { admins: self.admins.clone() };
        let results = [
            write(&self.ledger_store, &self.ledger),
            write(&self.inventory_store, &self.inventory),
            write(&self.admin_store, &admin_doc),
        ];
        let mut first_error = None;
        for result in results {
            if let Err(e) = result {
                error!(error = %e, "error saving fleet state");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                debug!("fleet state saved");
                Ok(())
            }
        }
    }

    // ─── Inventory queries ───────────────────────────────────────────────

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn records_of(&self, owner: &str) -> &[VpsRecord] {
        self.inventory.get(owner).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn find(&self, container_id: &str) -> Option<&VpsRecord> {
        self.inventory.values().flatten().find(|r| r.container_id == container_id)
    }

    pub fn contains(&self, container_id: &str) -> bool {
        self.find(container_id).is_some()
    }

    pub fn locate(&self, container_id: &str) -> Option<VpsLocation> {
        self.inventory.iter().find_map(|(owner, records)| {
            records
                .iter()
                .position(|r| r.container_id == container_id)
                .map(|idx| VpsLocation { owner_id: owner.clone(), number: idx + 1 })
        })
    }

    /// Record by tenant-facing number (1-based).
    pub fn resolve(&self, owner: &str, number: usize) -> Option<&VpsRecord> {
        number.checked_sub(1).and_then(|idx| self.records_of(owner).get(idx))
    }

    /// Records other owners have shared with `tenant`, with their location.
    pub fn shared_with(&self, tenant: &str) -> Vec<(VpsLocation, &VpsRecord)> {
        self.inventory
            .iter()
            .flat_map(|(owner, records)| {
                records.iter().enumerate().filter_map(move |(idx, r)| {
                    r.shared_with.contains(tenant).then(|| {
                        (VpsLocation { owner_id: owner.clone(), number: idx + 1 }, r)
                    })
                })
            })
            .collect()
    }

    /// Next unused container id for `owner`, skipping ids already present or
    /// held in `reserved`.
    pub fn next_container_id(&self, owner: &str, reserved: &HashSet<String>) -> String {
        let mut seq = self.records_of(owner).len() + 1;
        loop {
            let id = container_id_for(owner, seq);
            if !self.contains(&id) && !reserved.contains(&id) {
                return id;
            }
            seq += 1;
        }
    }

    pub fn stats(&self) -> FleetStats {
        let records = self.inventory.values().flatten();
        let mut stats = FleetStats {
            tenants: self.ledger.len(),
            owners: self.inventory.len(),
            total_credits: self.ledger.values().map(|e| e.credits).sum(),
            ..FleetStats::default()
        };
        for record in records {
            stats.total_vps += 1;
            stats.total_ram_gb += u64::from(record.ram);
            stats.total_cpu += u64::from(record.cpu);
            if record.is_running() {
                stats.running_vps += 1;
            }
        }
        stats
    }

    // ─── Mutations ───────────────────────────────────────────────────────

    /// Apply `mutate` and flush. If the flush fails the in-memory documents
    /// are restored and the error returned; the next successful flush
    /// rewrites any document that did reach disk.
    fn commit<R>(&mut self, mutate: impl FnOnce(&mut Self) -> R) -> StoreResult<R> {
        let snapshot = (self.ledger.clone(), self.inventory.clone(), self.admins.clone());
        let out = mutate(self);
        if let Err(e) = self.flush() {
            warn!(error = %e, "fleet state not saved, rolling back in-memory change");
            (self.ledger, self.inventory, self.admins) = snapshot;
            return Err(e);
        }
        Ok(out)
    }

    /// Append a record to its owner's list; returns its VPS number.
    pub fn insert(&mut self, record: VpsRecord) -> StoreResult<usize> {
        if self.contains(&record.container_id) {
            return Err(StoreError::Duplicate(record.container_id));
        }
        self.commit(|store| {
            let list = store.inventory.entry(record.owner_id.clone()).or_default();
            list.push(record);
            list.len()
        })
    }

    /// Remove a record; the owner's entry goes too once it is empty.
    pub fn remove(&mut self, container_id: &str) -> StoreResult<Option<VpsRecord>> {
        let Some(location) = self.locate(container_id) else {
            return Ok(None);
        };
        self.commit(|store| {
            let list = store.inventory.get_mut(&location.owner_id)?;
            let removed = list.remove(location.number - 1);
            if list.is_empty() {
                store.inventory.remove(&location.owner_id);
            }
            Some(removed)
        })
    }

    /// Apply `f` to the record and flush. `None` if no such record.
    pub fn update<R>(
        &mut self,
        container_id: &str,
        f: impl FnOnce(&mut VpsRecord) -> R,
    ) -> StoreResult<Option<R>> {
        if !self.contains(container_id) {
            return Ok(None);
        }
        self.commit(|store| {
            store
                .inventory
                .values_mut()
                .flatten()
                .find(|r| r.container_id == container_id)
                .map(f)
        })
    }

    /// Flip every running record to stopped; returns how many changed.
    pub fn mark_all_stopped(&mut self) -> StoreResult<usize> {
        self.commit(|store| {
            let mut changed = 0;
            for record in store.inventory.values_mut().flatten() {
                if record.status == VpsStatus::Running {
                    record.status = VpsStatus::Stopped;
                    changed += 1;
                }
            }
            changed
        })
    }

    // ─── Ledger ──────────────────────────────────────────────────────────

    pub fn credits(&self, tenant: &str) -> u64 {
        self.ledger.get(tenant).map_or(0, |e| e.credits)
    }

    pub fn add_credits(&mut self, tenant: &str, amount: u64) -> StoreResult<u64> {
        self.commit(|store| {
            let entry = store.ledger.entry(tenant.to_string()).or_default();
            entry.credits = entry.credits.saturating_add(amount);
            entry.credits
        })
    }

    /// Remove `amount` credits (all of them when `None`), never below zero.
    pub fn remove_credits(&mut self, tenant: &str, amount: Option<u64>) -> StoreResult<u64> {
        self.commit(|store| {
            let entry = store.ledger.entry(tenant.to_string()).or_default();
            entry.credits = match amount {
                Some(n) => entry.credits.saturating_sub(n),
                None => 0,
            };
            entry.credits
        })
    }

    /// Charge `amount`, failing without change if the balance is short.
    pub fn debit(&mut self, tenant: &str, amount: u64) -> StoreResult<u64> {
        let have = self.credits(tenant);
        if have < amount {
            return Err(StoreError::InsufficientCredits { need: amount, have });
        }
        self.commit(|store| {
            let entry = store.ledger.entry(tenant.to_string()).or_default();
            entry.credits = have - amount;
            entry.credits
        })
    }

    // ─── Admin set ───────────────────────────────────────────────────────

    pub fn is_admin(&self, tenant: &str) -> bool {
        self.admins.contains(tenant)
    }

    pub fn admins(&self) -> impl Iterator<Item = &TenantId> {
        self.admins.iter()
    }

    /// Returns false if the tenant already was an admin.
    pub fn add_admin(&mut self, tenant: &str) -> StoreResult<bool> {
        if self.is_admin(tenant) {
            return Ok(false);
        }
        self.commit(|store| store.admins.insert(tenant.to_string()))
    }

    /// Returns false if the tenant was not an admin.
    pub fn remove_admin(&mut self, tenant: &str) -> StoreResult<bool> {
        if !self.is_admin(tenant) {
            return Ok(false);
        }
        self.commit(|store| store.admins.remove(tenant))
    }
}

fn write<T: Serialize>(store: &JsonStore, data: &T) -> StoreResult<()> {
    store.save(data).map_err(|source| StoreError::Io { path: store.path().to_path_buf(), source })
}
