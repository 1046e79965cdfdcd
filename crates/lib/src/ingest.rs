//! Message ingestion: find unseen customer messages and claim them before anyone processes them.
//!
//! The claim is at-least-once. When marking messages viewed fails, the batch is still handed to
//! the orchestrator and may be rediscovered on a later tick; the orchestrator's session
//! de-duplication and registry absorb that.

use crate::message::{sort_chronological, Message, MessageId};
use crate::store::{MessageSource, SessionContext};
use std::collections::HashSet;
use std::sync::Arc;

/// Result of one discovery pass.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    /// Newly discovered messages, oldest first.
    pub messages: Vec<Message>,
    /// Set when the discovery call itself failed (messages is then empty).
    pub error: Option<String>,
    /// Set when the viewed claim failed; messages may come back on a later pass.
    pub claim_error: Option<String>,
}

impl Discovery {
    fn failed(error: String) -> Self {
        Self {
            messages: Vec::new(),
            error: Some(error),
            claim_error: None,
        }
    }
}

#[derive(Clone)]
pub struct MessageIngestor {
    source: Arc<dyn MessageSource>,
    ctx: SessionContext,
}

impl MessageIngestor {
    pub fn new(source: Arc<dyn MessageSource>, ctx: SessionContext) -> Self {
        Self { source, ctx }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Query unseen messages, keep customer messages, claim them, return them oldest first.
    /// Never retries; the caller's next tick is the retry.
    pub async fn discover(&self) -> Discovery {
        let raw = match self.source.discover_unseen(&self.ctx).await {
            Ok(r) => r,
            Err(e) => {
                log::warn!("ingest: discovery failed: {}", e);
                return Discovery::failed(e.to_string());
            }
        };

        let mut seen: HashSet<MessageId> = HashSet::new();
        let mut messages: Vec<Message> = raw
            .into_iter()
            .filter(|r| r.is_from_customer())
            .filter(|r| seen.insert(r.id.clone()))
            .map(Message::from)
            .collect();
        if messages.is_empty() {
            return Discovery::default();
        }
        sort_chronological(&mut messages);

        let ids: Vec<MessageId> = messages.iter().map(|m| m.id.clone()).collect();
        let claim_error = match self.source.claim_viewed(&ids).await {
            Ok(()) => None,
            Err(e) => {
                log::warn!(
                    "ingest: claiming {} message(s) as viewed failed, they may be rediscovered: {}",
                    ids.len(),
                    e
                );
                Some(e.to_string())
            }
        };
        log::info!("ingest: discovered {} new message(s)", messages.len());
        Discovery {
            messages,
            error: None,
            claim_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RawMessage, StoreError};
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Inbox {
        rows: Mutex<Vec<RawMessage>>,
        viewed: Mutex<HashSet<MessageId>>,
        fail_claim: bool,
        fail_discover: bool,
    }

    #[async_trait]
    impl MessageSource for Inbox {
        async fn discover_unseen(&self, _ctx: &SessionContext) -> Result<Vec<RawMessage>, StoreError> {
            if self.fail_discover {
                return Err(StoreError::Unavailable("offline".into()));
            }
            let viewed = self.viewed.lock().unwrap();
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|r| !viewed.contains(&r.id))
                .cloned()
                .collect())
        }

        async fn claim_viewed(&self, ids: &[MessageId]) -> Result<(), StoreError> {
            if self.fail_claim {
                return Err(StoreError::Api("claim rejected".into()));
            }
            self.viewed.lock().unwrap().extend(ids.iter().cloned());
            Ok(())
        }
    }

    fn row(id: &str, secs_ago: i64, sender: Option<&str>) -> RawMessage {
        RawMessage {
            id: id.into(),
            contact_id: "c1".into(),
            content: format!("text {}", id),
            created_at: Utc::now() - Duration::seconds(secs_ago),
            sender: sender.map(String::from),
        }
    }

    fn inbox(rows: Vec<RawMessage>) -> Inbox {
        let i = Inbox::default();
        *i.rows.lock().unwrap() = rows;
        i
    }

    #[tokio::test]
    async fn discovery_after_claim_is_disjoint() {
        let source = Arc::new(inbox(vec![row("m1", 10, None), row("m2", 5, None)]));
        let ingestor = MessageIngestor::new(source.clone(), SessionContext::admin());
        let first = ingestor.discover().await;
        assert_eq!(first.messages.len(), 2);
        source.rows.lock().unwrap().push(row("m3", 1, None));
        let second = ingestor.discover().await;
        let ids: Vec<_> = second.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m3"]);
    }

    #[tokio::test]
    async fn filters_non_customer_and_sorts_oldest_first() {
        let source = Arc::new(inbox(vec![
            row("newer", 1, Some("customer")),
            row("reply", 3, Some("bot")),
            row("older", 9, None),
            row("older", 9, None),
        ]));
        let ingestor = MessageIngestor::new(source, SessionContext::tenant("t1"));
        let d = ingestor.discover().await;
        let ids: Vec<_> = d.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["older", "newer"]);
        assert!(d.error.is_none());
    }

    #[tokio::test]
    async fn claim_failure_still_returns_batch() {
        let mut i = inbox(vec![row("m1", 2, None)]);
        i.fail_claim = true;
        let ingestor = MessageIngestor::new(Arc::new(i), SessionContext::admin());
        let d = ingestor.discover().await;
        assert_eq!(d.messages.len(), 1);
        assert!(d.claim_error.is_some());
    }

    #[tokio::test]
    async fn discovery_failure_is_empty_with_error() {
        let mut i = inbox(vec![row("m1", 2, None)]);
        i.fail_discover = true;
        let ingestor = MessageIngestor::new(Arc::new(i), SessionContext::admin());
        let d = ingestor.discover().await;
        assert!(d.messages.is_empty());
        assert!(d.error.unwrap().contains("offline"));
    }
}
