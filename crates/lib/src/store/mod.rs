//! Collaborator contracts consumed by the orchestrator.
//!
//! The storage layer (unseen-message discovery and the viewed claim) and the AI processing
//! backend (initiate, poll, health) are external systems. They are reached only through the
//! two traits here; `HttpBackend` is the REST implementation used by the binary.

mod http;
mod types;

pub use http::HttpBackend;
pub use types::{
    CredentialMode, ProcessingRequest, RawMessage, SessionContext, StatusRecord,
};

use crate::message::MessageId;
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store api error: {0}")]
    Api(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Source of newly arrived customer messages.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Messages not yet claimed as viewed, in the given credential context.
    async fn discover_unseen(&self, ctx: &SessionContext) -> Result<Vec<RawMessage>, StoreError>;

    /// Mark messages as viewed so later discovery excludes them. Idempotent.
    async fn claim_viewed(&self, ids: &[MessageId]) -> Result<(), StoreError>;
}

/// System of record for per-message processing status.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Start asynchronous processing of one message or a batch.
    async fn initiate_processing(&self, request: &ProcessingRequest) -> Result<(), StoreError>;

    /// Current status, or `None` when the store holds no record for the id.
    async fn poll_status(&self, id: &str) -> Result<Option<StatusRecord>, StoreError>;

    /// Liveness check; gates autopilot activation.
    async fn check_health(&self) -> Result<(), StoreError>;
}
