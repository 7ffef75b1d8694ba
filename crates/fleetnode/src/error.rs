//! Node error types

use std::path::PathBuf;
use thiserror::Error;

/// Failures outside command handlers: config files and request framing.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("cannot read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Config(String),

    #[error("malformed request: {0}")]
    Request(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type NodeResult<T> = Result<T, NodeError>;
