//! Wire shapes exchanged with the store and the processing backend.

use crate::message::{Message, MessageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which credentials discovery runs under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialMode {
    /// Operator credentials: sees every tenant's conversations.
    Admin,
    /// Scoped to one tenant.
    #[default]
    Tenant,
}

impl CredentialMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialMode::Admin => "admin",
            CredentialMode::Tenant => "tenant",
        }
    }
}

/// Per-session context passed to discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    pub mode: CredentialMode,
    pub tenant_id: Option<String>,
}

impl SessionContext {
    pub fn admin() -> Self {
        Self {
            mode: CredentialMode::Admin,
            tenant_id: None,
        }
    }

    pub fn tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            mode: CredentialMode::Tenant,
            tenant_id: Some(tenant_id.into()),
        }
    }
}

/// A message row as returned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    pub id: MessageId,
    pub contact_id: String,
    #[serde(default)]
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// "customer" for inbound messages; bot/agent replies carry other values.
    #[serde(default)]
    pub sender: Option<String>,
}

impl RawMessage {
    /// Inbound customer message (rows without a sender are treated as customer messages).
    pub fn is_from_customer(&self) -> bool {
        match self.sender.as_deref() {
            None => true,
            Some(s) => s.trim().eq_ignore_ascii_case("customer"),
        }
    }
}

impl From<RawMessage> for Message {
    fn from(raw: RawMessage) -> Self {
        Message::new(raw.id, raw.contact_id, raw.content.trim(), raw.created_at)
    }
}

/// Start processing for a single message or a batch tracked by its primary id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum ProcessingRequest {
    Batch {
        message_ids: Vec<MessageId>,
        primary_message_id: MessageId,
        combined_content: String,
    },
    Single {
        message_id: MessageId,
    },
}

impl ProcessingRequest {
    pub fn single(id: impl Into<MessageId>) -> Self {
        ProcessingRequest::Single {
            message_id: id.into(),
        }
    }

    /// Id whose status record tracks this request.
    pub fn primary_id(&self) -> &str {
        match self {
            ProcessingRequest::Single { message_id } => message_id,
            ProcessingRequest::Batch {
                primary_message_id, ..
            } => primary_message_id,
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, ProcessingRequest::Batch { .. })
    }
}

/// Processing status as reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Structured handler name; authoritative when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusRecord {
    pub fn with_status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            ..Self::default()
        }
    }
}
