//! Processing registry: ids currently under active processing in this session.
//!
//! Owned by the orchestrator loop (single writer), so no locking. Each claimed id may own the
//! cancellation token of its poll task; releasing the id cancels that task, which keeps
//! "claimed" and "has a live poll loop" the same set.

use crate::message::MessageId;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct ProcessingRegistry {
    entries: HashMap<MessageId, Option<CancellationToken>>,
}

impl ProcessingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id`; false if it is already claimed.
    pub fn try_claim(&mut self, id: &str) -> bool {
        if self.entries.contains_key(id) {
            return false;
        }
        self.entries.insert(id.to_string(), None);
        true
    }

    /// Bind the poll task's token to a claimed id. False if `id` is not claimed.
    pub fn attach(&mut self, id: &str, token: CancellationToken) -> bool {
        match self.entries.get_mut(id) {
            Some(slot) => {
                if let Some(old) = slot.replace(token) {
                    old.cancel();
                }
                true
            }
            None => false,
        }
    }

    /// Release `id`, cancelling its poll task. False if it was not claimed.
    pub fn release(&mut self, id: &str) -> bool {
        match self.entries.remove(id) {
            Some(token) => {
                if let Some(t) = token {
                    t.cancel();
                }
                true
            }
            None => false,
        }
    }

    pub fn is_claimed(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Claimed ids, sorted.
    pub fn ids(&self) -> Vec<MessageId> {
        let mut ids: Vec<MessageId> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Release everything (teardown). Returns how many entries were dropped.
    pub fn release_all(&mut self) -> usize {
        let n = self.entries.len();
        for (_, token) in self.entries.drain() {
            if let Some(t) = token {
                t.cancel();
            }
        }
        n
    }
}
