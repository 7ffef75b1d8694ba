//! Command channel into the lifecycle manager.
//!
//! Background tasks (the admission monitor) never call the manager
//! directly; they send a [`FleetCommand`] and await the reply.

use crate::error::{FleetError, FleetResult};
use crate::manager::LifecycleManager;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub const COMMAND_BUFFER: usize = 16;

#[derive(Debug)]
pub enum FleetCommand {
    /// Stop every container on the host and mark all records stopped.
    ForceStopAll {
        reason: String,
        reply: oneshot::Sender<FleetResult<usize>>,
    },
}

/// Cloneable sender side of the command channel.
#[derive(Debug, Clone)]
pub struct FleetHandle {
    tx: mpsc::Sender<FleetCommand>,
}

pub fn command_channel() -> (FleetHandle, mpsc::Receiver<FleetCommand>) {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    (FleetHandle { tx }, rx)
}

impl FleetHandle {
    /// Request a host-wide forced stop and wait until the store is flushed.
    pub async fn force_stop_all(&self, reason: impl Into<String>) -> FleetResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(FleetCommand::ForceStopAll { reason: reason.into(), reply })
            .await
            .map_err(|_| FleetError::ManagerUnavailable)?;
        rx.await.map_err(|_| FleetError::ManagerUnavailable)?
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl LifecycleManager {
    /// Consume commands until every [`FleetHandle`] is dropped.
    pub async fn serve(self: Arc<Self>, mut rx: mpsc::Receiver<FleetCommand>) {
        info!("lifecycle command server started");
        while let Some(command) = rx.recv().await {
            match command {
                FleetCommand::ForceStopAll { reason, reply } => {
                    let result = self.stop_all(&reason).await;
                    if reply.send(result).is_err() {
                        warn!("stop-all requester went away before the reply");
                    }
                }
            }
            debug!("fleet command handled");
        }
        info!("lifecycle command server stopped");
    }
}
