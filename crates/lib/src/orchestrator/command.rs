//! Commands consumed by the orchestrator loop. Handles, poll tasks, discovery and cleanup
//! timers all talk to the loop through these; nothing else touches orchestrator state.

use super::OrchestratorError;
use crate::ingest::Discovery;
use crate::message::{Message, MessageId};
use crate::status::StatusUpdate;
use std::fmt;
use tokio::sync::oneshot;

pub(crate) enum Command {
    SetActive {
        active: bool,
        reply: oneshot::Sender<()>,
    },
    Retry {
        id: MessageId,
        reply: oneshot::Sender<Result<(), OrchestratorError>>,
    },
    /// Track a locally created message (e.g. one with a placeholder id).
    Track {
        message: Message,
    },
    ReconcileId {
        placeholder: MessageId,
        permanent: MessageId,
    },
    Discovered(Discovery),
    Job(JobEvent),
    CleanupDue {
        id: MessageId,
    },
}

/// Event from a poll task. `id` is the message (or batch primary) the task is bound to.
#[derive(Debug)]
pub(crate) struct JobEvent {
    pub job: u64,
    pub id: MessageId,
    pub kind: JobEventKind,
}

#[derive(Debug)]
pub(crate) enum JobEventKind {
    Accepted,
    InitiateFailed(String),
    Polled(StatusUpdate),
    /// No status record: finished and expired.
    Expired,
    PollFailed(String),
    TimedOut,
    BatchPolled(StatusUpdate),
    BatchFallback(FallbackReason),
    BatchFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FallbackReason {
    EmptyStatus(u32),
    Ceiling,
    InitiateFailed(String),
    SafetyTimeout,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::EmptyStatus(n) => write!(f, "{} consecutive empty status responses", n),
            FallbackReason::Ceiling => f.write_str("batch wall-clock ceiling reached"),
            FallbackReason::InitiateFailed(e) => write!(f, "batch initiate failed: {}", e),
            FallbackReason::SafetyTimeout => f.write_str("processing timeout"),
        }
    }
}
