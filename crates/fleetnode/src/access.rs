//! Resolving a caller's capability for one operation.
//!
//! The lifecycle core trusts the capability it is handed; this is where it
//! is derived from the super-admin id, the admin set and record ownership.

use fleet_proto::{Capability, VpsRecord};
use fleet_store::RecordStore;

/// Which relation the operation cares about most.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Need {
    /// Owner-only operations: an owning admin acts as owner.
    Owner,
    /// Everything else: elevated capability wins over ownership.
    Any,
}

/// Strongest applicable capability, or `None` if the caller has no
/// relation to the record and no elevated rights.
pub fn resolve(
    super_admin_id: &str,
    store: &RecordStore,
    caller: &str,
    record: Option<&VpsRecord>,
    need: Need,
) -> Option<Capability> {
    let owner = record.is_some_and(|r| r.owner_id == caller);
    if need == Need::Owner && owner {
        return Some(Capability::Owner);
    }

    let elevated = if !super_admin_id.is_empty() && caller == super_admin_id {
        Some(Capability::SuperAdmin)
    } else if store.is_admin(caller) {
        Some(Capability::Admin)
    } else {
        None
    };
    let relation = match record {
        Some(_) if owner => Some(Capability::Owner),
        Some(r) if r.shared_with.contains(caller) => Some(Capability::Shared),
        _ => None,
    };
    elevated.or(relation)
}
