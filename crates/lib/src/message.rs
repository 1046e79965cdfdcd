//! Customer message as tracked by the autopilot, and the rules for moving it between states.
//!
//! Statuses only move forward (`new` → in-flight → terminal). The one way back is an explicit
//! retry of an errored message. Every transition names its cause so the few non-obvious jumps
//! (empty status inferred as completed, batch members mirroring their primary) are checked
//! rather than silently accepted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque message identifier assigned by the store (or a `temp-` placeholder before that).
pub type MessageId = String;

/// Prefix of client-generated ids that the store has not yet replaced.
pub const PLACEHOLDER_PREFIX: &str = "temp-";

/// Generate a placeholder id for a locally created message.
pub fn placeholder_id() -> MessageId {
    format!("{}{}", PLACEHOLDER_PREFIX, uuid::Uuid::new_v4())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    New,
    Analyzing,
    Delegating,
    Replying,
    Completed,
    Error,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::New => "new",
            MessageStatus::Analyzing => "analyzing",
            MessageStatus::Delegating => "delegating",
            MessageStatus::Replying => "replying",
            MessageStatus::Completed => "completed",
            MessageStatus::Error => "error",
        }
    }

    /// `completed` or `error`.
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Completed | MessageStatus::Error)
    }

    /// Accepted by the store and not yet terminal.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            MessageStatus::Analyzing | MessageStatus::Delegating | MessageStatus::Replying
        )
    }

    fn rank(self) -> u8 {
        match self {
            MessageStatus::New => 0,
            MessageStatus::Analyzing => 1,
            MessageStatus::Delegating => 2,
            MessageStatus::Replying => 3,
            MessageStatus::Completed | MessageStatus::Error => 4,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a status change is being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCause {
    /// The store accepted an initiate-processing call.
    Initiated,
    /// A poll response reported this status.
    Remote,
    /// The store had no status record left; the job finished and the record expired.
    InferredFromEmpty,
    /// A batch member copying the terminal status of its primary.
    BatchMirror,
    /// The processing ceiling elapsed without a terminal status.
    Timeout,
    /// A local initiate/poll failure.
    Failure,
    /// Manual "try again" on an errored message.
    Retry,
}

/// Whether `from -> to` is a legal edge for the given cause.
pub fn is_allowed(from: MessageStatus, to: MessageStatus, cause: TransitionCause) -> bool {
    use MessageStatus::*;
    use TransitionCause::*;
    match (from, to) {
        (Error, New) => cause == Retry,
        (_, New) => false,
        (Completed, _) | (Error, _) => false,
        (New, Analyzing) => cause == Initiated,
        (New, Delegating) | (New, Replying) => false,
        (New, Completed) => matches!(cause, InferredFromEmpty | BatchMirror),
        (New, Error) => matches!(cause, Failure | Timeout | BatchMirror),
        (_, Completed) => matches!(cause, Remote | InferredFromEmpty | BatchMirror),
        (_, Error) => matches!(cause, Remote | Failure | Timeout | BatchMirror),
        // in-flight -> in-flight: never backwards
        (a, b) => b.rank() >= a.rank() && matches!(cause, Initiated | Remote),
    }
}

#[derive(Debug, thiserror::Error)]
#[error("illegal transition {from} -> {to} ({cause:?})")]
pub struct TransitionError {
    pub from: MessageStatus,
    pub to: MessageStatus,
    pub cause: TransitionCause,
}

/// Human-readable progress. Informational only; never used to decide transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingStage {
    pub stage: String,
    pub details: String,
}

impl ProcessingStage {
    pub fn new(stage: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            details: details.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub contact_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_stage: Option<ProcessingStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_handler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default)]
    pub error_cleanup_scheduled: bool,
}

impl Message {
    pub fn new(
        id: impl Into<MessageId>,
        contact_id: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            contact_id: contact_id.into(),
            content: content.into(),
            timestamp,
            status: MessageStatus::New,
            processing_stage: None,
            assigned_handler: None,
            response: None,
            error_cleanup_scheduled: false,
        }
    }

    /// True while the id is still a client-generated placeholder.
    pub fn is_placeholder(&self) -> bool {
        self.id.starts_with(PLACEHOLDER_PREFIX)
    }

    /// Move to `to`, or return an error and leave the message untouched.
    /// A same-status update on an in-flight message is accepted as a refresh.
    pub fn transition(
        &mut self,
        to: MessageStatus,
        cause: TransitionCause,
    ) -> Result<(), TransitionError> {
        if !is_allowed(self.status, to, cause) {
            return Err(TransitionError {
                from: self.status,
                to,
                cause,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Mark as failed with an `Error: ...` detail for display.
    pub fn fail(&mut self, cause: TransitionCause, detail: &str) -> Result<(), TransitionError> {
        self.transition(MessageStatus::Error, cause)?;
        self.processing_stage = Some(ProcessingStage::new("error", format!("Error: {}", detail)));
        Ok(())
    }
}

/// Oldest first; ties broken by id so ordering is stable across snapshots.
pub fn sort_chronological(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
}
