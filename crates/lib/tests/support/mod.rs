//! Scripted in-memory backend shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use autopilot::message::MessageId;
use autopilot::orchestrator::{OrchestratorHandle, Snapshot};
use autopilot::store::{
    MessageSource, ProcessingRequest, RawMessage, SessionContext, StatusRecord, StatusStore,
    StoreError,
};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One scripted response to `poll_status`.
#[derive(Debug, Clone)]
pub enum PollStep {
    Status(StatusRecord),
    Empty,
    Fail,
}

impl PollStep {
    pub fn status(s: &str) -> Self {
        PollStep::Status(StatusRecord::with_status(s))
    }
}

/// Message source and status store in one. Poll scripts are consumed in order; the last
/// step repeats once the script runs out. Unscripted ids report `analyzing`.
pub struct MockBackend {
    rows: Mutex<Vec<RawMessage>>,
    viewed: Mutex<HashSet<MessageId>>,
    scripts: Mutex<HashMap<MessageId, VecDeque<PollStep>>>,
    polls: Mutex<HashMap<MessageId, usize>>,
    initiations: Mutex<Vec<ProcessingRequest>>,
    failing_initiate: Mutex<HashSet<MessageId>>,
    hanging_initiate: Mutex<HashSet<MessageId>>,
    healthy: AtomicBool,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            viewed: Mutex::new(HashSet::new()),
            scripts: Mutex::new(HashMap::new()),
            polls: Mutex::new(HashMap::new()),
            initiations: Mutex::new(Vec::new()),
            failing_initiate: Mutex::new(HashSet::new()),
            hanging_initiate: Mutex::new(HashSet::new()),
            healthy: AtomicBool::new(true),
        }
    }
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add an unseen customer message `secs_ago` seconds old.
    pub fn push(&self, id: &str, contact: &str, secs_ago: i64) {
        self.rows.lock().unwrap().push(RawMessage {
            id: id.into(),
            contact_id: contact.into(),
            content: format!("message {}", id),
            created_at: Utc::now() - ChronoDuration::seconds(secs_ago),
            sender: Some("customer".into()),
        });
    }

    pub fn script(&self, id: &str, steps: Vec<PollStep>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(id.into(), steps.into_iter().collect());
    }

    pub fn fail_initiate(&self, id: &str, fail: bool) {
        let mut f = self.failing_initiate.lock().unwrap();
        if fail {
            f.insert(id.into());
        } else {
            f.remove(id);
        }
    }

    /// Requests whose primary id is `id` are recorded but never answered.
    pub fn hang_initiate(&self, id: &str) {
        self.hanging_initiate.lock().unwrap().insert(id.into());
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn initiations(&self) -> Vec<ProcessingRequest> {
        self.initiations.lock().unwrap().clone()
    }

    pub fn poll_count(&self, id: &str) -> usize {
        self.polls.lock().unwrap().get(id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl MessageSource for MockBackend {
    async fn discover_unseen(&self, _ctx: &SessionContext) -> Result<Vec<RawMessage>, StoreError> {
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
        self.viewed.lock().unwrap().extend(ids.iter().cloned());
        Ok(())
    }
}

#[async_trait]
impl StatusStore for MockBackend {
    async fn initiate_processing(&self, request: &ProcessingRequest) -> Result<(), StoreError> {
        self.initiations.lock().unwrap().push(request.clone());
        let hang = self
            .hanging_initiate
            .lock()
            .unwrap()
            .contains(request.primary_id());
        if hang {
            std::future::pending::<()>().await;
        }
        if self
            .failing_initiate
            .lock()
            .unwrap()
            .contains(request.primary_id())
        {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        Ok(())
    }

    async fn poll_status(&self, id: &str) -> Result<Option<StatusRecord>, StoreError> {
        *self.polls.lock().unwrap().entry(id.to_string()).or_insert(0) += 1;
        let step = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(id) {
                Some(steps) if steps.len() > 1 => steps.pop_front(),
                Some(steps) => steps.front().cloned(),
                None => None,
            }
        };
        match step.unwrap_or_else(|| PollStep::status("analyzing")) {
            PollStep::Status(record) => Ok(Some(record)),
            PollStep::Empty => Ok(None),
            PollStep::Fail => Err(StoreError::Api("status lookup failed".into())),
        }
    }

    async fn check_health(&self) -> Result<(), StoreError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("backend down".into()))
        }
    }
}

/// Wait (in virtual time under a paused clock) until a published snapshot satisfies `pred`.
pub async fn wait_for(
    handle: &OrchestratorHandle,
    within: Duration,
    pred: impl Fn(&Snapshot) -> bool,
) -> Arc<Snapshot> {
    let mut rx = handle.subscribe();
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let snap = rx.borrow_and_update().clone();
        if pred(&snap) {
            return snap;
        }
        match tokio::time::timeout_at(deadline, rx.changed()).await {
            Ok(Ok(())) => {}
            _ => panic!("condition not reached within {:?}; last snapshot: {:#?}", within, snap),
        }
    }
}
