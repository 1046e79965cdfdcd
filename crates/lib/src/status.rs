//! Normalize backend poll responses into local updates.
//!
//! The structured `handler` field is the only source of truth for the assigned handler.
//! Pulling a name out of free-text stage details is kept as a display fallback.

use crate::message::{MessageStatus, ProcessingStage};
use crate::store::StatusRecord;
use regex::Regex;
use std::sync::OnceLock;

/// A poll response reduced to what the orchestrator applies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    /// None when the backend reported a status string we do not recognise.
    pub status: Option<MessageStatus>,
    pub stage: Option<ProcessingStage>,
    /// From the structured field only.
    pub handler: Option<String>,
    /// Extracted from stage details when the structured field is absent. Display only.
    pub display_handler: Option<String>,
    pub response: Option<String>,
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn is_terminal(&self) -> bool {
        self.status.map(MessageStatus::is_terminal).unwrap_or(false)
    }

    /// Handler to show: structured when known, otherwise the text fallback.
    pub fn shown_handler(&self) -> Option<&str> {
        self.handler
            .as_deref()
            .or(self.display_handler.as_deref())
    }
}

/// Map a backend status string (case-insensitive, with common synonyms).
pub fn parse_remote_status(s: &str) -> Option<MessageStatus> {
    match s.trim().to_lowercase().as_str() {
        "new" | "pending" | "queued" | "accepted" | "processing" | "analyzing" | "analysing" => {
            Some(MessageStatus::Analyzing)
        }
        "delegating" | "delegated" | "routing" => Some(MessageStatus::Delegating),
        "replying" | "responding" | "generating" => Some(MessageStatus::Replying),
        "completed" | "complete" | "done" | "success" | "succeeded" => Some(MessageStatus::Completed),
        "error" | "failed" | "failure" | "timeout" => Some(MessageStatus::Error),
        _ => None,
    }
}

fn handler_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\b(?:delegat(?:ing|ed)\s+to|assigned\s+to|handed\s+off\s+to|handler)\s*:?\s+["']?([^"'.,;!\n]+)"#)
            .expect("handler pattern compiles")
    })
}

/// Best-effort handler name from free text such as "Delegating to Billing Bot".
pub fn handler_from_details(details: &str) -> Option<String> {
    handler_pattern()
        .captures(details)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn non_empty(s: &Option<String>) -> Option<String> {
    s.as_ref()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn normalize(record: &StatusRecord) -> StatusUpdate {
    let status = parse_remote_status(&record.status);
    let details = non_empty(&record.details);
    let stage_name = non_empty(&record.stage);
    let stage = match (stage_name, details.clone()) {
        (None, None) => None,
        (name, details) => Some(ProcessingStage::new(
            name.unwrap_or_else(|| record.status.trim().to_lowercase()),
            details.unwrap_or_default(),
        )),
    };
    let handler = non_empty(&record.handler);
    let display_handler = if handler.is_none() {
        details.as_deref().and_then(handler_from_details)
    } else {
        None
    };
    StatusUpdate {
        status,
        stage,
        handler,
        display_handler,
        response: record.response.clone().filter(|r| !r.is_empty()),
        error: non_empty(&record.error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synonyms_map_to_states() {
        assert_eq!(parse_remote_status("Processing"), Some(MessageStatus::Analyzing));
        assert_eq!(parse_remote_status("responding"), Some(MessageStatus::Replying));
        assert_eq!(parse_remote_status(" DONE "), Some(MessageStatus::Completed));
        assert_eq!(parse_remote_status("failed"), Some(MessageStatus::Error));
        assert_eq!(parse_remote_status("thinking hard"), None);
    }

    #[test]
    fn structured_handler_wins() {
        let record = StatusRecord {
            status: "delegating".into(),
            details: Some("Delegating to Billing Bot".into()),
            handler: Some("Sales Bot".into()),
            ..Default::default()
        };
        let u = normalize(&record);
        assert_eq!(u.handler.as_deref(), Some("Sales Bot"));
        assert!(u.display_handler.is_none());
        assert_eq!(u.shown_handler(), Some("Sales Bot"));
    }

    #[test]
    fn text_handler_is_display_only() {
        let record = StatusRecord {
            status: "delegating".into(),
            details: Some("Delegating to Billing Bot.".into()),
            ..Default::default()
        };
        let u = normalize(&record);
        assert!(u.handler.is_none());
        assert_eq!(u.display_handler.as_deref(), Some("Billing Bot"));
    }

    #[test]
    fn handler_extraction_patterns() {
        assert_eq!(
            handler_from_details("Request assigned to: Support Agent").as_deref(),
            Some("Support Agent")
        );
        assert_eq!(
            handler_from_details("handler: \"Refunds\"").as_deref(),
            Some("Refunds")
        );
        assert_eq!(handler_from_details("Analyzing the message"), None);
    }

    #[test]
    fn stage_falls_back_to_status_name() {
        let record = StatusRecord {
            status: "Replying".into(),
            details: Some("Writing the answer".into()),
            response: Some("Hel".into()),
            ..Default::default()
        };
        let u = normalize(&record);
        assert!(!u.is_terminal());
        assert_eq!(u.response.as_deref(), Some("Hel"));
        let stage = u.stage.unwrap();
        assert_eq!(stage.stage, "replying");
        assert_eq!(stage.details, "Writing the answer");
    }

    #[test]
    fn bare_completed_is_terminal() {
        let u = normalize(&StatusRecord {
            status: "completed".into(),
            response: Some("Hi!".into()),
            ..Default::default()
        });
        assert!(u.is_terminal());
        assert!(u.stage.is_none());
        assert_eq!(u.response.as_deref(), Some("Hi!"));
    }
}
