//! Shared types for the Incus fleet core.
//!
//! Defines the VPS record persisted per container, its status and lifecycle
//! states, and the capability flag callers attach to every operation.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Tenant identifier (chat-platform user id, kept as an opaque string).
pub type TenantId = String;

/// Address placeholder for an interface with no address of that family.
pub const NOT_ASSIGNED: &str = "Not assigned";

/// Address placeholder written when the address query itself failed.
pub const ADDRESS_ERROR: &str = "Error";

/// Disk size recorded for containers created without a plan.
pub const DEFAULT_STORAGE_GB: u32 = 10;

// ─── Status & Lifecycle ───────────────────────────────────────────────────────

/// Last successfully observed runtime state of a container.
///
/// Set optimistically when an operation succeeds, never polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VpsStatus {
    #[default]
    Running,
    Stopped,
}

impl std::fmt::Display for VpsStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Lifecycle state of a VPS as seen by the lifecycle manager.
///
/// `Provisioning` and `Reinstalling` only exist while an operation is in
/// flight; `Deleted` is terminal and means no record remains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Provisioning,
    Running,
    Stopped,
    Reinstalling,
    Deleted,
}

impl From<VpsStatus> for LifecycleState {
    fn from(status: VpsStatus) -> Self {
        match status {
            VpsStatus::Running => Self::Running,
            VpsStatus::Stopped => Self::Stopped,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisioning => write!(f, "provisioning"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Reinstalling => write!(f, "reinstalling"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

// ─── Capability ───────────────────────────────────────────────────────────────

/// Capability the caller holds for one operation, resolved outside the core.
///
/// The core trusts this flag and only checks that it is sufficient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Owns the VPS the operation targets.
    Owner,
    /// Listed in the VPS's `shared_with` set.
    Shared,
    /// Member of the admin set.
    Admin,
    /// The configured super-admin.
    SuperAdmin,
}

impl Capability {
    pub fn is_admin(self) -> bool {
        matches!(self, Self::Admin | Self::SuperAdmin)
    }

    pub fn is_super_admin(self) -> bool {
        self == Self::SuperAdmin
    }

    pub fn is_owner(self) -> bool {
        self == Self::Owner
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Owner => write!(f, "owner"),
            Self::Shared => write!(f, "shared"),
            Self::Admin => write!(f, "admin"),
            Self::SuperAdmin => write!(f, "super_admin"),
        }
    }
}

// ─── VPS Record ───────────────────────────────────────────────────────────────

/// Persisted representation of one container and its ownership metadata.
///
/// Resource quantities are whole units (GB of RAM and disk, CPU cores).
/// Conversion to the runtime's native units happens at invocation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpsRecord {
    #[serde(alias = "container_name")]
    pub container_id: String,
    /// Filled from the inventory key when absent in older files.
    #[serde(default)]
    pub owner_id: TenantId,
    #[serde(deserialize_with = "legacy::quantity")]
    pub ram: u32,
    #[serde(deserialize_with = "legacy::quantity")]
    pub cpu: u32,
    #[serde(default = "default_storage", deserialize_with = "legacy::quantity")]
    pub storage: u32,
    #[serde(default)]
    pub status: VpsStatus,
    #[serde(default = "Utc::now", deserialize_with = "legacy::timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "not_assigned")]
    pub ipv4: String,
    #[serde(default = "not_assigned")]
    pub ipv6: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processor: Option<String>,
    #[serde(default)]
    pub shared_with: BTreeSet<TenantId>,
}

fn default_storage() -> u32 {
    DEFAULT_STORAGE_GB
}

fn not_assigned() -> String {
    NOT_ASSIGNED.to_string()
}

impl VpsRecord {
    /// A freshly launched, running container with no addresses yet.
    pub fn new(container_id: String, owner_id: TenantId, ram: u32, cpu: u32, storage: u32) -> Self {
        Self {
            container_id,
            owner_id,
            ram,
            cpu,
            storage,
            status: VpsStatus::Running,
            created_at: Utc::now(),
            ipv4: not_assigned(),
            ipv6: not_assigned(),
            plan: None,
            processor: None,
            shared_with: BTreeSet::new(),
        }
    }

    /// RAM in the runtime's native unit (MB).
    pub fn ram_mb(&self) -> u64 {
        u64::from(self.ram) * 1024
    }

    pub fn is_running(&self) -> bool {
        self.status == VpsStatus::Running
    }

    /// True for the owner and every tenant the VPS is shared with.
    pub fn is_accessible_by(&self, tenant: &str) -> bool {
        self.owner_id == tenant || self.shared_with.contains(tenant)
    }
}

/// Container id for the `seq`-th VPS of `owner` (1-based).
pub fn container_id_for(owner: &str, seq: usize) -> String {
    format!("vps-{owner}-{seq}")
}

// ─── Legacy field decoding ────────────────────────────────────────────────────

/// Deserializers accepting the field encodings older state files used.
pub mod legacy {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, de::Error};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawQuantity {
        Number(u64),
        Text(String),
    }

    /// Accepts `4`, `"4"` and `"4GB"`.
    pub fn quantity<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        match RawQuantity::deserialize(deserializer)? {
            RawQuantity::Number(n) => u32::try_from(n).map_err(D::Error::custom),
            RawQuantity::Text(s) => parse_quantity(&s).map_err(D::Error::custom),
        }
    }

    pub fn parse_quantity(s: &str) -> Result<u32, String> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_suffix("GB")
            .or_else(|| trimmed.strip_suffix("gb"))
            .unwrap_or(trimmed)
            .trim();
        digits
            .parse::<u32>()
            .map_err(|e| format!("invalid quantity '{s}': {e}"))
    }

    /// Accepts RFC 3339 and naive ISO-8601 (read as UTC).
    pub fn timestamp<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_timestamp(&raw).map_err(D::Error::custom)
    }

    pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Ok(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|e| format!("invalid timestamp '{raw}': {e}"))
    }
}
