//! Container lifecycle manager for the Incus fleet core.
//!
//! Drives the runtime CLI through a [`fleet_runner::CommandRunner`], keeps
//! the [`fleet_store::RecordStore`] in step with successful operations and
//! serialises work per container.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod locks;
pub mod manager;
pub mod runtime;
pub mod server;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{LifecycleConfig, PlanSpec};
pub use error::{FleetError, FleetResult};
pub use locks::ContainerLocks;
pub use manager::{
    CreateOutcome, CreateRequest, ExecOutput, LifecycleManager, OUTPUT_LIMIT, PurchaseOutcome,
    SharedStore, SshSession, StaticIp, TRUNCATION_MARKER, Warning, session_name, snapshot_name,
    truncate_output,
};
pub use runtime::RuntimeCli;
pub use server::{FleetCommand, FleetHandle, command_channel};
