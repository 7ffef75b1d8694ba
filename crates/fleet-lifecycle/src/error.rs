//! Lifecycle error types

use fleet_runner::ExecError;
use fleet_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("insufficient credits: need {need}, have {have}")]
    InsufficientCredits { need: u64, have: u64 },

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(
        "reinstall of '{container_id}' is incomplete: the old container was deleted but the relaunch failed, recreate it manually. Cause: {source}"
    )]
    ReinstallIncomplete {
        container_id: String,
        #[source]
        source: ExecError,
    },

    #[error("SSH session for '{container_id}' did not report a connection command")]
    SshUnavailable { container_id: String },

    #[error(transparent)]
    Store(StoreError),

    #[error("lifecycle manager is not accepting commands")]
    ManagerUnavailable,
}

impl From<StoreError> for FleetError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InsufficientCredits { need, have } => Self::InsufficientCredits { need, have },
            other => Self::Store(other),
        }
    }
}

pub type FleetResult<T> = Result<T, FleetError>;
