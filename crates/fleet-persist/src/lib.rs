//! JSON file-backed persistence for fleet state.
//!
//! Each [`JsonStore`] owns one document at `{state_path}/state/{domain}.json`.
//! Reads never fail; writes replace the document by rename so a reader sees
//! either the old or the new content.

#![forbid(unsafe_code)]

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One domain of fleet state on disk.
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    pub fn new(state_path: &Path, domain: &str) -> Self {
        Self { path: state_path.join("state").join(format!("{domain}.json")) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }

    /// Decode the document, or `T::default()` if it is missing, unreadable
    /// or not valid for `T`.
    pub fn load<T: DeserializeOwned + Default>(&self) -> T {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "state document missing, using empty state");
                return T::default();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "state document unreadable, using empty state");
                return T::default();
            }
        };

        serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "state document corrupt, using empty state");
            T::default()
        })
    }

    /// Write the document through a staging file and rename it into place.
    pub fn save<T: Serialize>(&self, data: &T) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let body = serde_json::to_vec_pretty(data).map_err(std::io::Error::other)?;

        let staging = self.staging_path();
        std::fs::write(&staging, &body)?;
        std::fs::rename(&staging, &self.path)?;
        debug!(path = %self.path.display(), bytes = body.len(), "state document written");
        Ok(())
    }
}
