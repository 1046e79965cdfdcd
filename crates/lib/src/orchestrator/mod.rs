//! Orchestrator: discovers messages, schedules them under the configured strategy, polls the
//! status store until each reaches a terminal state, and publishes snapshots.
//!
//! One task owns all state. Callers talk to it through [`OrchestratorHandle`]; poll, discovery
//! and cleanup tasks report back through the same command queue. Snapshots are whole-state
//! replacements on a `watch` channel, so readers never see a half-applied update.

mod actor;
mod command;
mod poller;
mod safety;
mod state;

pub use safety::{Repair, SafetyMonitor};
pub use state::Snapshot;

use crate::config::AutopilotConfig;
use crate::ingest::MessageIngestor;
use crate::message::{Message, MessageId, MessageStatus, TransitionError};
use crate::store::{MessageSource, SessionContext, StatusStore, StoreError};
use actor::Actor;
use command::Command;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

const COMMAND_QUEUE: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("message {0} not found")]
    NotFound(MessageId),
    #[error("message {id} is {status}, only errored messages can be retried")]
    NotRetryable { id: MessageId, status: MessageStatus },
    #[error("processing backend unhealthy: {0}")]
    Unhealthy(#[source] StoreError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("orchestrator stopped")]
    Stopped,
}

pub struct Orchestrator;

impl Orchestrator {
    /// Start the orchestrator loop. It starts inactive; call [`OrchestratorHandle::activate`].
    pub fn spawn(
        source: Arc<dyn MessageSource>,
        store: Arc<dyn StatusStore>,
        config: AutopilotConfig,
        ctx: SessionContext,
    ) -> (OrchestratorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(Snapshot {
            strategy: config.strategy,
            ..Default::default()
        }));
        let cancel = CancellationToken::new();
        let ingestor = MessageIngestor::new(source, ctx);
        let actor = Actor::new(
            config,
            store.clone(),
            ingestor,
            tx.clone(),
            cancel.clone(),
            snapshot_tx,
        );
        let join = tokio::spawn(actor.run(rx));
        let handle = OrchestratorHandle {
            tx,
            snapshots: snapshot_rx,
            store,
            _stop_on_drop: Arc::new(cancel.clone().drop_guard()),
            cancel,
        };
        (handle, join)
    }
}

/// Cheap to clone; every clone talks to the same loop. Dropping the last clone stops the
/// orchestrator as if [`OrchestratorHandle::shutdown`] had been called.
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<Command>,
    snapshots: watch::Receiver<Arc<Snapshot>>,
    store: Arc<dyn StatusStore>,
    cancel: CancellationToken,
    _stop_on_drop: Arc<DropGuard>,
}

impl OrchestratorHandle {
    /// Turn autopilot on after a successful health check. Resolves once the new state is
    /// published.
    pub async fn activate(&self) -> Result<(), OrchestratorError> {
        self.store
            .check_health()
            .await
            .map_err(OrchestratorError::Unhealthy)?;
        self.set_active(true).await
    }

    /// Stop starting new work. In-flight poll loops run to completion.
    pub async fn deactivate(&self) -> Result<(), OrchestratorError> {
        self.set_active(false).await
    }

    async fn set_active(&self, active: bool) -> Result<(), OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetActive { active, reply }).await?;
        rx.await.map_err(|_| OrchestratorError::Stopped)
    }

    pub fn is_autopilot_active(&self) -> bool {
        self.snapshots.borrow().active
    }

    /// Latest published state.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshots.borrow().clone()
    }

    /// Receiver that wakes on every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshots.clone()
    }

    /// Reset an errored message to `new` so it is scheduled again.
    pub async fn retry(&self, id: impl Into<MessageId>) -> Result<(), OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Retry {
            id: id.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| OrchestratorError::Stopped)?
    }

    /// Track a locally created message. Placeholder ids are held until reconciled.
    pub async fn track(&self, message: Message) -> Result<(), OrchestratorError> {
        self.send(Command::Track { message }).await
    }

    pub async fn reconcile_id(
        &self,
        placeholder: impl Into<MessageId>,
        permanent: impl Into<MessageId>,
    ) -> Result<(), OrchestratorError> {
        self.send(Command::ReconcileId {
            placeholder: placeholder.into(),
            permanent: permanent.into(),
        })
        .await
    }

    /// Cancel every poll loop and timer and stop the orchestrator. Await the `JoinHandle`
    /// from [`Orchestrator::spawn`] to wait for teardown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn send(&self, cmd: Command) -> Result<(), OrchestratorError> {
        self.tx.send(cmd).await.map_err(|_| OrchestratorError::Stopped)
    }
}
