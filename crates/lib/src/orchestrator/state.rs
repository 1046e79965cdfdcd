//! Orchestrator-owned state. Only the actor loop mutates it.

use crate::config::Strategy;
use crate::message::{sort_chronological, Message, MessageId, MessageStatus};
use crate::registry::ProcessingRegistry;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::time::Instant;

/// A poll task currently bound to a claimed id.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ActiveJob {
    /// Sequence number carried by every event the task emits; stale events are dropped.
    pub job: u64,
    pub started_at: Instant,
}

/// Same-contact messages submitted as one request, tracked by the primary (oldest) id.
#[derive(Debug, Clone)]
pub(crate) struct BatchRun {
    pub primary: MessageId,
    /// Oldest first; includes the primary.
    pub members: Vec<MessageId>,
}

#[derive(Debug, Default)]
pub(crate) struct OrchestratorState {
    /// Kept in chronological order.
    pub messages: Vec<Message>,
    pub registry: ProcessingRegistry,
    pub jobs: HashMap<MessageId, ActiveJob>,
    /// Completed ids; never processed again this session.
    pub processed: HashSet<MessageId>,
    /// Sequential/batch mode: the one message (or batch primary) being worked on.
    pub current: Option<MessageId>,
    pub batch: Option<BatchRun>,
    /// Former batch members waiting for individual processing, oldest first.
    pub fallback_queue: VecDeque<MessageId>,
    pub active: bool,
    pub last_discovery_error: Option<String>,
    next_job: u64,
}

impl OrchestratorState {
    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Add messages not already known or processed. Returns the ids that were added.
    pub fn merge(&mut self, incoming: Vec<Message>) -> Vec<MessageId> {
        let mut added = Vec::new();
        for m in incoming {
            if self.contains(&m.id) || self.processed.contains(&m.id) {
                continue;
            }
            added.push(m.id.clone());
            self.messages.push(m);
        }
        if !added.is_empty() {
            sort_chronological(&mut self.messages);
        }
        added
    }

    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let i = self.messages.iter().position(|m| m.id == id)?;
        self.fallback_queue.retain(|q| q != id);
        Some(self.messages.remove(i))
    }

    pub fn next_job_id(&mut self) -> u64 {
        self.next_job += 1;
        self.next_job
    }

    /// True if `job` is the live poll task for `id`.
    pub fn owns_job(&self, id: &str, job: u64) -> bool {
        self.registry.is_claimed(id) && self.jobs.get(id).map(|j| j.job == job).unwrap_or(false)
    }

    /// Release the claim (cancelling the poll task) and forget the job.
    pub fn release(&mut self, id: &str) -> bool {
        self.jobs.remove(id);
        self.registry.release(id)
    }

    pub fn in_batch(&self, id: &str) -> bool {
        self.batch
            .as_ref()
            .map(|b| b.members.iter().any(|m| m == id))
            .unwrap_or(false)
    }

    pub fn is_batch_primary(&self, id: &str) -> bool {
        self.batch.as_ref().map(|b| b.primary == id).unwrap_or(false)
    }

    pub fn is_queued(&self, id: &str) -> bool {
        self.fallback_queue.iter().any(|q| q == id)
    }

    /// `new`, not claimed, not part of a running batch, not a placeholder, not processed.
    pub fn is_pending(&self, m: &Message) -> bool {
        m.status == MessageStatus::New
            && !m.is_placeholder()
            && !self.registry.is_claimed(&m.id)
            && !self.in_batch(&m.id)
            && !self.processed.contains(&m.id)
    }

    /// Pending ids, oldest first.
    pub fn pending_ids(&self) -> Vec<MessageId> {
        self.messages
            .iter()
            .filter(|m| self.is_pending(m))
            .map(|m| m.id.clone())
            .collect()
    }

    /// The oldest pending message's contact and its other pending messages, when there are
    /// at least two. Messages waiting in the fallback queue are never re-batched.
    pub fn next_batch_group(&self, max: usize) -> Option<Vec<MessageId>> {
        let pending: Vec<&Message> = self
            .messages
            .iter()
            .filter(|m| self.is_pending(m) && !self.is_queued(&m.id))
            .collect();
        let first = pending.first()?;
        let group: Vec<MessageId> = pending
            .iter()
            .filter(|m| m.contact_id == first.contact_id)
            .take(max)
            .map(|m| m.id.clone())
            .collect();
        if group.len() >= 2 {
            Some(group)
        } else {
            None
        }
    }

    pub fn snapshot(&self, strategy: Strategy) -> Snapshot {
        Snapshot {
            active: self.active,
            strategy,
            messages: self.messages.clone(),
            in_flight: self.registry.ids(),
            current: self.current.clone(),
            batch_primary: self.batch.as_ref().map(|b| b.primary.clone()),
            queued: self.fallback_queue.iter().cloned().collect(),
            last_discovery_error: self.last_discovery_error.clone(),
        }
    }
}

/// Read-only view published after every state change.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Autopilot toggle.
    pub active: bool,
    pub strategy: Strategy,
    /// In-flight and terminal messages, oldest first.
    pub messages: Vec<Message>,
    /// Ids with a live poll loop.
    pub in_flight: Vec<MessageId>,
    pub current: Option<MessageId>,
    pub batch_primary: Option<MessageId>,
    /// Waiting for individual processing after a batch fallback.
    pub queued: Vec<MessageId>,
    /// Last discovery failure, cleared by the next successful pass.
    pub last_discovery_error: Option<String>,
}

impl Snapshot {
    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn status(&self, id: &str) -> Option<MessageStatus> {
        self.message(id).map(|m| m.status)
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.in_flight.iter().any(|i| i == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn msg(id: &str, contact: &str, secs_ago: i64) -> Message {
        Message::new(id, contact, format!("body {}", id), Utc::now() - Duration::seconds(secs_ago))
    }

    #[test]
    fn merge_skips_known_and_processed() {
        let mut s = OrchestratorState::default();
        s.processed.insert("done".into());
        let added = s.merge(vec![msg("b", "c", 1), msg("a", "c", 5), msg("done", "c", 9)]);
        assert_eq!(added, vec!["b".to_string(), "a".to_string()]);
        let again = s.merge(vec![msg("a", "c", 5)]);
        assert!(again.is_empty());
        let order: Vec<_> = s.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn batch_group_takes_oldest_contact() {
        let mut s = OrchestratorState::default();
        s.merge(vec![
            msg("x1", "other", 1),
            msg("c1", "c", 10),
            msg("c2", "c", 5),
            msg("c3", "c", 2),
        ]);
        assert_eq!(
            s.next_batch_group(2),
            Some(vec!["c1".to_string(), "c2".to_string()])
        );
        assert_eq!(s.next_batch_group(10).map(|g| g.len()), Some(3));
    }

    #[test]
    fn single_message_contact_is_not_batched() {
        let mut s = OrchestratorState::default();
        s.merge(vec![msg("a", "c1", 10), msg("b", "c2", 5)]);
        assert_eq!(s.next_batch_group(10), None);
    }

    #[test]
    fn queued_and_claimed_messages_are_not_batched() {
        let mut s = OrchestratorState::default();
        s.merge(vec![msg("a", "c", 10), msg("b", "c", 5), msg("d", "c", 1)]);
        s.fallback_queue.push_back("a".into());
        s.registry.try_claim("b");
        assert_eq!(s.next_batch_group(10), None);
        assert_eq!(s.pending_ids(), vec!["a".to_string(), "d".to_string()]);
    }

    #[test]
    fn placeholders_are_not_pending() {
        let mut s = OrchestratorState::default();
        let mut m = msg("x", "c", 1);
        m.id = crate::message::placeholder_id();
        s.merge(vec![m]);
        assert!(s.pending_ids().is_empty());
    }

    #[test]
    fn owns_job_requires_claim_and_matching_sequence() {
        let mut s = OrchestratorState::default();
        let job = s.next_job_id();
        s.registry.try_claim("a");
        s.jobs.insert(
            "a".into(),
            ActiveJob {
                job,
                started_at: Instant::now(),
            },
        );
        assert!(s.owns_job("a", job));
        assert!(!s.owns_job("a", job + 1));
        s.release("a");
        assert!(!s.owns_job("a", job));
    }
}
