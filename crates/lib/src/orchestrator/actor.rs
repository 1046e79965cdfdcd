//! The orchestrator loop: single consumer of the command queue and sole writer of state.
//!
//! Handlers never await. Anything that does I/O (initiate, poll, discovery) or waits
//! (cleanup timers) runs in a spawned task that reports back through the queue.

use super::command::{Command, FallbackReason, JobEvent, JobEventKind};
use super::poller::{self, BatchPlan};
use super::safety::{Repair, SafetyMonitor};
use super::state::{ActiveJob, BatchRun, OrchestratorState, Snapshot};
use super::OrchestratorError;
use crate::config::{AutopilotConfig, Strategy};
use crate::ingest::{Discovery, MessageIngestor};
use crate::message::{
    sort_chronological, Message, MessageId, MessageStatus, ProcessingStage, TransitionCause,
};
use crate::status::StatusUpdate;
use crate::store::{ProcessingRequest, StatusStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub(crate) struct Actor {
    state: OrchestratorState,
    config: AutopilotConfig,
    store: Arc<dyn StatusStore>,
    ingestor: MessageIngestor,
    tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
    snapshot_tx: watch::Sender<Arc<Snapshot>>,
    safety: SafetyMonitor,
    cleanups: HashMap<MessageId, CancellationToken>,
    discovery_in_flight: bool,
}

impl Actor {
    pub(crate) fn new(
        config: AutopilotConfig,
        store: Arc<dyn StatusStore>,
        ingestor: MessageIngestor,
        tx: mpsc::Sender<Command>,
        cancel: CancellationToken,
        snapshot_tx: watch::Sender<Arc<Snapshot>>,
    ) -> Self {
        let safety = SafetyMonitor::new(config.processing_timeout() + config.poll_interval());
        Self {
            state: OrchestratorState::default(),
            config,
            store,
            ingestor,
            tx,
            cancel,
            snapshot_tx,
            safety,
            cleanups: HashMap::new(),
            discovery_in_flight: false,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let cancel = self.cancel.clone();
        let mut discovery = tokio::time::interval(self.config.discovery_interval());
        discovery.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let safety_every = self.config.safety_interval();
        let mut safety = tokio::time::interval_at(Instant::now() + safety_every, safety_every);
        safety.set_missed_tick_behavior(MissedTickBehavior::Skip);
        log::info!(
            "orchestrator: started ({:?} strategy)",
            self.config.strategy
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                // The loop holds a sender itself; handles stop it through the token.
                Some(cmd) = rx.recv() => self.handle(cmd),
                _ = discovery.tick() => self.start_discovery(),
                _ = safety.tick() => self.run_safety_pass(),
            }
            self.publish();
        }

        self.teardown();
        self.publish();
    }

    fn publish(&self) {
        self.snapshot_tx
            .send_replace(Arc::new(self.state.snapshot(self.config.strategy)));
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::SetActive { active, reply } => {
                self.set_active(active);
                self.publish();
                let _ = reply.send(());
            }
            Command::Retry { id, reply } => {
                let result = self.retry(&id);
                self.publish();
                let _ = reply.send(result);
            }
            Command::Track { message } => {
                self.state.merge(vec![message]);
                self.schedule();
            }
            Command::ReconcileId {
                placeholder,
                permanent,
            } => self.reconcile_id(&placeholder, permanent),
            Command::Discovered(discovery) => self.on_discovered(discovery),
            Command::Job(event) => self.on_job_event(event),
            Command::CleanupDue { id } => self.on_cleanup_due(&id),
        }
    }

    fn set_active(&mut self, active: bool) {
        if self.state.active == active {
            return;
        }
        self.state.active = active;
        if active {
            log::info!("orchestrator: autopilot activated");
            self.start_discovery();
            self.schedule();
        } else {
            log::info!(
                "orchestrator: autopilot deactivated ({} in flight will finish)",
                self.state.registry.len()
            );
        }
    }

    fn start_discovery(&mut self) {
        if !self.state.active || self.discovery_in_flight {
            return;
        }
        self.discovery_in_flight = true;
        tokio::spawn(poller::run_discovery(
            self.ingestor.clone(),
            self.tx.clone(),
            self.cancel.child_token(),
        ));
    }

    fn on_discovered(&mut self, discovery: Discovery) {
        self.discovery_in_flight = false;
        self.state.last_discovery_error = discovery.error;
        let added = self.state.merge(discovery.messages);
        if !added.is_empty() {
            log::debug!("orchestrator: tracking {} new message(s)", added.len());
        }
        self.schedule();
    }

    fn reconcile_id(&mut self, placeholder: &str, permanent: MessageId) {
        if self.state.contains(&permanent) {
            self.state.remove(placeholder);
        } else if let Some(m) = self.state.get_mut(placeholder) {
            m.id = permanent;
            sort_chronological(&mut self.state.messages);
        }
        self.schedule();
    }

    // ---------------------------------------------------------------------
    // Scheduling
    // ---------------------------------------------------------------------

    fn schedule(&mut self) {
        if !self.state.active {
            return;
        }
        match self.config.strategy {
            Strategy::Sequential => self.advance_sequential(false),
            Strategy::Batch => self.advance_sequential(true),
            Strategy::Parallel => self.fill_parallel_slots(),
        }
    }

    fn current_is_live(&self, id: &str) -> bool {
        self.state.registry.is_claimed(id)
            && self
                .state
                .get(id)
                .map(|m| !m.status.is_terminal())
                .unwrap_or(false)
    }

    fn advance_sequential(&mut self, batching: bool) {
        if let Some(cur) = self.state.current.clone() {
            if self.current_is_live(&cur) {
                return;
            }
            log::debug!("orchestrator: current message {} is stale, clearing", cur);
            self.drop_claim(&cur);
        }

        while let Some(id) = self.state.fallback_queue.pop_front() {
            let runnable = self
                .state
                .get(&id)
                .map(|m| !m.status.is_terminal())
                .unwrap_or(false);
            if runnable && self.start_single(&id) {
                return;
            }
        }

        if batching {
            if let Some(group) = self.state.next_batch_group(self.config.max_batch_size()) {
                self.start_batch(group);
                return;
            }
        }

        if let Some(id) = self.state.pending_ids().into_iter().next() {
            self.start_single(&id);
        }
    }

    fn fill_parallel_slots(&mut self) {
        let limit = self.config.parallel_limit();
        for id in self.state.pending_ids() {
            if self.state.registry.len() >= limit {
                break;
            }
            self.start_single(&id);
        }
    }

    /// Claim `id` and bind a fresh job to it. Returns the job sequence and its token.
    fn claim(&mut self, id: &str) -> Option<(u64, CancellationToken)> {
        if !self.state.registry.try_claim(id) {
            return None;
        }
        let token = self.cancel.child_token();
        self.state.registry.attach(id, token.clone());
        let job = self.state.next_job_id();
        self.state.jobs.insert(
            id.to_string(),
            ActiveJob {
                job,
                started_at: Instant::now(),
            },
        );
        Some((job, token))
    }

    fn start_single(&mut self, id: &str) -> bool {
        if self.state.processed.contains(id) {
            log::debug!("orchestrator: {} already completed this session, skipping", id);
            return false;
        }
        match self.state.get(id) {
            Some(m) if !m.status.is_terminal() && !m.is_placeholder() => {}
            _ => return false,
        }
        let Some((job, token)) = self.claim(id) else {
            return false;
        };
        if self.config.strategy != Strategy::Parallel {
            self.state.current = Some(id.to_string());
        }
        if let Some(m) = self.state.get_mut(id) {
            m.processing_stage = Some(ProcessingStage::new("initiating", "Submitting for processing"));
        }
        log::info!("orchestrator: processing message {}", id);
        tokio::spawn(poller::run_single(
            self.store.clone(),
            self.tx.clone(),
            token,
            job,
            id.to_string(),
            self.config.poll_interval(),
            self.config.processing_timeout(),
        ));
        true
    }

    fn start_batch(&mut self, members: Vec<MessageId>) {
        let Some(primary) = members.first().cloned() else {
            return;
        };
        let Some((job, token)) = self.claim(&primary) else {
            return;
        };
        let combined_content = members
            .iter()
            .filter_map(|id| self.state.get(id))
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join(self.config.batch_separator.as_str());
        for id in &members {
            if let Some(m) = self.state.get_mut(id) {
                m.processing_stage = Some(if *id == primary {
                    ProcessingStage::new("initiating", "Submitting batch for processing")
                } else {
                    ProcessingStage::new("batched", format!("Grouped with {}", primary))
                });
            }
        }
        let contact = self
            .state
            .get(&primary)
            .map(|m| m.contact_id.clone())
            .unwrap_or_default();
        log::info!(
            "orchestrator: batching {} message(s) for contact {} (primary {})",
            members.len(),
            contact,
            primary
        );
        self.state.current = Some(primary.clone());
        self.state.batch = Some(BatchRun {
            primary: primary.clone(),
            members: members.clone(),
        });
        let plan = BatchPlan {
            request: ProcessingRequest::Batch {
                message_ids: members,
                primary_message_id: primary,
                combined_content,
            },
            interval: self.config.batch_poll_interval(),
            ceiling: self.config.batch_ceiling(),
            max_empty_polls: self.config.batch_max_empty_polls.max(1),
        };
        tokio::spawn(poller::run_batch(
            self.store.clone(),
            self.tx.clone(),
            token,
            job,
            plan,
        ));
    }

    /// Release a claim and forget any sequential/batch bookkeeping pointing at it.
    fn drop_claim(&mut self, id: &str) {
        self.state.release(id);
        if self.state.current.as_deref() == Some(id) {
            self.state.current = None;
        }
        if self.state.is_batch_primary(id) {
            self.state.batch = None;
        }
    }

    // ---------------------------------------------------------------------
    // Job events
    // ---------------------------------------------------------------------

    fn on_job_event(&mut self, event: JobEvent) {
        let JobEvent { job, id, kind } = event;
        if !self.state.owns_job(&id, job) {
            log::debug!("orchestrator: dropping stale event for {} (job {})", id, job);
            return;
        }
        match kind {
            JobEventKind::Accepted => self.on_accepted(&id),
            JobEventKind::InitiateFailed(error) => {
                log::warn!("orchestrator: initiate failed for {}: {}", id, error);
                self.fail(&id, TransitionCause::Failure, &error);
            }
            JobEventKind::Polled(update) => {
                let terminal = update.is_terminal();
                self.apply_update(&id, &update);
                if terminal {
                    self.finish(&id);
                }
            }
            JobEventKind::Expired => self.on_expired(&id),
            JobEventKind::PollFailed(error) => {
                log::warn!("orchestrator: poll failed for {}: {}", id, error);
                self.fail(&id, TransitionCause::Failure, &error);
            }
            JobEventKind::TimedOut => {
                log::warn!("orchestrator: {} timed out", id);
                let detail = self.timeout_detail();
                self.fail(&id, TransitionCause::Timeout, &detail);
            }
            JobEventKind::BatchPolled(update) => {
                let terminal = update.is_terminal();
                self.apply_update(&id, &update);
                if terminal {
                    self.finish_batch(&id);
                }
            }
            JobEventKind::BatchFallback(reason) => self.fallback(&id, reason),
            JobEventKind::BatchFailed(error) => {
                log::warn!("orchestrator: batch poll failed for {}: {}", id, error);
                if let Some(m) = self.state.get_mut(&id) {
                    if let Err(e) = m.fail(TransitionCause::Failure, &error) {
                        log::debug!("orchestrator: {}", e);
                    }
                }
                self.finish_batch(&id);
            }
        }
    }

    fn timeout_detail(&self) -> String {
        format!(
            "timed out after {}s without a terminal status",
            self.config.processing_timeout().as_secs()
        )
    }

    fn on_accepted(&mut self, id: &str) {
        let Some(m) = self.state.get_mut(id) else {
            return;
        };
        if let Err(e) = m.transition(MessageStatus::Analyzing, TransitionCause::Initiated) {
            log::debug!("orchestrator: {}", e);
            return;
        }
        m.processing_stage = Some(ProcessingStage::new("analyzing", "Accepted for processing"));
    }

    fn apply_update(&mut self, id: &str, update: &StatusUpdate) {
        let Some(m) = self.state.get_mut(id) else {
            return;
        };
        apply_status_update(m, update);
    }

    fn on_expired(&mut self, id: &str) {
        if let Some(m) = self.state.get_mut(id) {
            match m.transition(MessageStatus::Completed, TransitionCause::InferredFromEmpty) {
                Ok(()) => {
                    m.processing_stage = Some(ProcessingStage::new(
                        "completed",
                        "Status record expired; processing already finished",
                    ));
                }
                Err(e) => log::debug!("orchestrator: {}", e),
            }
        }
        self.finish(id);
    }

    fn fail(&mut self, id: &str, cause: TransitionCause, detail: &str) {
        if let Some(m) = self.state.get_mut(id) {
            if let Err(e) = m.fail(cause, detail) {
                log::debug!("orchestrator: {}", e);
            }
        }
        self.finish(id);
    }

    /// Terminal (or abandoned) single job: release, settle, move on.
    fn finish(&mut self, id: &str) {
        self.drop_claim(id);
        self.settle(id);
        self.schedule();
    }

    /// Post-terminal bookkeeping for one message.
    fn settle(&mut self, id: &str) {
        if self.state.current.as_deref() == Some(id) {
            self.state.current = None;
        }
        match self.state.get(id).map(|m| m.status) {
            Some(MessageStatus::Completed) => {
                self.state.processed.insert(id.to_string());
                log::info!("orchestrator: message {} completed", id);
            }
            Some(MessageStatus::Error) => {
                log::warn!("orchestrator: message {} failed", id);
                self.schedule_cleanup(id);
            }
            Some(other) => {
                log::debug!("orchestrator: {} released while {}", id, other);
            }
            None => {}
        }
    }

    /// Primary reached a terminal status: members copy it, then everyone settles.
    fn finish_batch(&mut self, primary: &str) {
        let run = match self.state.batch.take() {
            Some(b) if b.primary == primary => b,
            other => {
                self.state.batch = other;
                self.finish(primary);
                return;
            }
        };
        let (status, response, handler, detail) = match self.state.get(primary) {
            Some(p) => (
                p.status,
                p.response.clone(),
                p.assigned_handler.clone(),
                p.processing_stage
                    .as_ref()
                    .map(|s| s.details.trim_start_matches("Error: ").to_string())
                    .unwrap_or_default(),
            ),
            None => (MessageStatus::Error, None, None, "batch primary disappeared".to_string()),
        };
        for id in run.members.iter().filter(|m| m.as_str() != primary) {
            let Some(m) = self.state.get_mut(id) else {
                continue;
            };
            let mirrored = match status {
                MessageStatus::Completed => m
                    .transition(MessageStatus::Completed, TransitionCause::BatchMirror)
                    .map(|_| {
                        m.response = response.clone();
                        m.assigned_handler = handler.clone();
                        m.processing_stage = Some(ProcessingStage::new(
                            "completed",
                            format!("Answered together with {}", primary),
                        ));
                    }),
                _ => m.fail(TransitionCause::BatchMirror, &detail),
            };
            if let Err(e) = mirrored {
                log::debug!("orchestrator: {}", e);
            }
        }
        self.drop_claim(primary);
        for id in &run.members {
            self.settle(id);
        }
        self.schedule();
    }

    /// Hand the batch's members to individual processing, oldest first. Only the first
    /// fallback for a batch does anything; later triggers find no matching batch.
    fn fallback(&mut self, primary: &str, reason: FallbackReason) {
        let run = match self.state.batch.take() {
            Some(b) if b.primary == primary => b,
            other => {
                self.state.batch = other;
                log::debug!("orchestrator: fallback for {} already handled", primary);
                return;
            }
        };
        log::warn!(
            "orchestrator: batch {} falling back to individual processing ({})",
            primary,
            reason
        );
        self.drop_claim(primary);
        for id in &run.members {
            if let Some(m) = self.state.get_mut(id) {
                m.processing_stage = Some(ProcessingStage::new(
                    "queued",
                    format!("Retrying individually: {}", reason),
                ));
            }
        }
        self.state.fallback_queue.extend(run.members);
        self.schedule();
    }

    // ---------------------------------------------------------------------
    // Errors, cleanup, retry
    // ---------------------------------------------------------------------

    fn schedule_cleanup(&mut self, id: &str) {
        let Some(m) = self.state.get_mut(id) else {
            return;
        };
        if m.error_cleanup_scheduled {
            return;
        }
        m.error_cleanup_scheduled = true;
        let token = self.cancel.child_token();
        if let Some(old) = self.cleanups.insert(id.to_string(), token.clone()) {
            old.cancel();
        }
        tokio::spawn(poller::run_cleanup(
            self.tx.clone(),
            token,
            id.to_string(),
            self.config.error_cleanup_delay(),
        ));
    }

    fn on_cleanup_due(&mut self, id: &str) {
        self.cleanups.remove(id);
        let due = self
            .state
            .get(id)
            .map(|m| m.status == MessageStatus::Error && m.error_cleanup_scheduled)
            .unwrap_or(false);
        if due {
            self.state.remove(id);
            log::debug!("orchestrator: removed errored message {} from view", id);
        }
    }

    fn retry(&mut self, id: &str) -> Result<(), OrchestratorError> {
        let m = self
            .state
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
        if m.status != MessageStatus::Error {
            return Err(OrchestratorError::NotRetryable {
                id: id.to_string(),
                status: m.status,
            });
        }
        m.transition(MessageStatus::New, TransitionCause::Retry)?;
        m.processing_stage = None;
        m.response = None;
        m.assigned_handler = None;
        m.error_cleanup_scheduled = false;
        if let Some(t) = self.cleanups.remove(id) {
            t.cancel();
        }
        self.drop_claim(id);
        log::info!("orchestrator: retrying message {}", id);
        self.schedule();
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Safety and teardown
    // ---------------------------------------------------------------------

    fn run_safety_pass(&mut self) {
        if !self.state.active {
            return;
        }
        let repairs = self.safety.inspect(&self.state, Instant::now());
        for repair in repairs {
            log::debug!("orchestrator: safety repair {:?}", repair);
            match repair {
                Repair::ReleaseOrphan(id) => self.drop_claim(&id),
                Repair::ClearCurrent(id) => {
                    if self.state.current.as_deref() == Some(id.as_str()) {
                        self.state.current = None;
                    }
                }
                Repair::ForceTimeout(id) => {
                    if self.state.is_batch_primary(&id) {
                        self.fallback(&id, FallbackReason::SafetyTimeout);
                    } else {
                        let detail = self.timeout_detail();
                        self.fail(&id, TransitionCause::Timeout, &detail);
                    }
                }
                Repair::Abandon(id) => {
                    if let Some(m) = self.state.get_mut(&id) {
                        if let Err(e) = m.fail(TransitionCause::Failure, "processing was interrupted") {
                            log::debug!("orchestrator: {}", e);
                        }
                    }
                    self.settle(&id);
                }
                Repair::Kick => self.start_discovery(),
            }
        }
        self.schedule();
    }

    fn teardown(&mut self) {
        let cancelled = self.state.registry.release_all();
        self.state.jobs.clear();
        for (_, token) in self.cleanups.drain() {
            token.cancel();
        }
        self.cancel.cancel();
        self.state.active = false;
        self.state.current = None;
        self.state.batch = None;
        log::info!(
            "orchestrator: stopped ({} in-flight poll(s) cancelled)",
            cancelled
        );
    }
}

/// Apply a normalized poll response. Status regressions are ignored; stage text, handler
/// and (speculative) response are display data and always refreshed.
fn apply_status_update(m: &mut Message, update: &StatusUpdate) {
    if let Some(status) = update.status {
        if status == MessageStatus::Error {
            let detail = update
                .error
                .clone()
                .or_else(|| update.stage.as_ref().map(|s| s.details.clone()))
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| "processing failed".to_string());
            if let Err(e) = m.fail(TransitionCause::Remote, &detail) {
                log::debug!("orchestrator: {}", e);
            }
            return;
        }
        if let Err(e) = m.transition(status, TransitionCause::Remote) {
            log::debug!("orchestrator: ignoring {}", e);
        }
    }
    if let Some(ref stage) = update.stage {
        m.processing_stage = Some(stage.clone());
    }
    if let Some(handler) = update.shown_handler() {
        m.assigned_handler = Some(handler.to_string());
    }
    if let Some(ref response) = update.response {
        m.response = Some(response.clone());
    }
}
