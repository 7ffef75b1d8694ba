//! Decoding of historical inventory shapes.
//!
//! Older state files stored a tenant's VPS as a bare record, as a mapping of
//! arbitrary keys to records, or as a list. Everything is normalized to a
//! list once, at load time; nothing past this module sees the ambiguity.

use crate::Inventory;
use fleet_proto::{TenantId, VpsRecord};
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tracing::warn;

/// Keys that mark an object as a bare record rather than a keyed mapping.
const RECORD_KEYS: [&str; 2] = ["container_id", "container_name"];

/// One tenant's value in `vps_data.json`, in any known encoding.
///
/// Records stay undecoded here so one malformed record cannot hide its
/// siblings; [`LegacyInventoryEntry::into_records`] decodes them one by one.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum LegacyInventoryEntry {
    List(Vec<Value>),
    Object(RawObject),
    Unrecognized(Value),
}

/// JSON object fields in document order.
#[derive(Debug)]
pub struct RawObject(pub Vec<(String, Value)>);

impl<'de> Deserialize<'de> for RawObject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ObjectVisitor;

        impl<'de> Visitor<'de> for ObjectVisitor {
            type Value = RawObject;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut fields = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(field) = map.next_entry::<String, Value>()? {
                    fields.push(field);
                }
                Ok(RawObject(fields))
            }
        }

        deserializer.deserialize_map(ObjectVisitor)
    }
}

impl RawObject {
    fn is_record(&self) -> bool {
        self.0.iter().any(|(key, _)| RECORD_KEYS.contains(&key.as_str()))
    }
}

impl LegacyInventoryEntry {
    /// Records in this entry, or `None` when the shape is unknown.
    ///
    /// Elements that do not decode as a record are dropped with a warning.
    pub fn into_records(self, owner: &str) -> Option<Vec<VpsRecord>> {
        let values: Vec<Value> = match self {
            Self::List(values) => values,
            Self::Object(object) if object.is_record() => {
                vec![Value::Object(object.0.into_iter().collect())]
            }
            Self::Object(object) => object.0.into_iter().map(|(_, value)| value).collect(),
            Self::Unrecognized(_) => return None,
        };

        let records = values
            .into_iter()
            .filter_map(|value| {
                let container = value
                    .get("container_id")
                    .or_else(|| value.get("container_name"))
                    .and_then(Value::as_str)
                    .unwrap_or("<unknown>")
                    .to_string();
                match serde_json::from_value::<VpsRecord>(value) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!(tenant = %owner, container = %container, error = %e, "malformed VPS record, dropping it");
                        None
                    }
                }
            })
            .collect();
        Some(records)
    }
}

/// Normalize a raw inventory document into the canonical shape.
///
/// The tenant key is authoritative for `owner_id`, the owner is scrubbed from
/// `shared_with`, duplicate container ids are dropped, and tenants left with
/// no records are omitted.
pub fn normalize_inventory(raw: BTreeMap<TenantId, LegacyInventoryEntry>) -> Inventory {
    let mut inventory = Inventory::new();
    let mut seen: HashSet<String> = HashSet::new();

    for (owner, entry) in raw {
        let Some(records) = entry.into_records(&owner) else {
            warn!(tenant = %owner, "unknown VPS data format, skipping tenant");
            continue;
        };

        let mut list = Vec::with_capacity(records.len());
        for mut record in records {
            if !seen.insert(record.container_id.clone()) {
                warn!(tenant = %owner, container = %record.container_id, "duplicate container id, dropping record");
                continue;
            }
            record.owner_id.clone_from(&owner);
            record.shared_with.remove(&owner);
            list.push(record);
        }

        if !list.is_empty() {
            inventory.insert(owner, list);
        }
    }

    inventory
}
