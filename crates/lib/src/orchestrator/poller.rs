//! Spawned tasks: per-message poll loops, batch poll loop, discovery pass, error cleanup timer.
//!
//! Every task owns a cancellation token and reports back to the orchestrator loop over its
//! command channel. A task never touches orchestrator state directly.

use super::command::{Command, FallbackReason, JobEvent, JobEventKind};
use crate::ingest::MessageIngestor;
use crate::message::MessageId;
use crate::status;
use crate::store::{ProcessingRequest, StatusStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Sends to the orchestrator loop on behalf of one job.
struct Reporter {
    tx: mpsc::Sender<Command>,
    job: u64,
    id: MessageId,
}

impl Reporter {
    /// False once the orchestrator has gone away.
    async fn emit(&self, kind: JobEventKind) -> bool {
        let event = JobEvent {
            job: self.job,
            id: self.id.clone(),
            kind,
        };
        self.tx.send(Command::Job(event)).await.is_ok()
    }
}

fn ticker(interval: Duration) -> tokio::time::Interval {
    let mut t = tokio::time::interval_at(Instant::now() + interval, interval);
    t.set_missed_tick_behavior(MissedTickBehavior::Delay);
    t
}

/// Single-message job: initiate, then poll every `interval` until terminal, empty, failure,
/// or `timeout` after the job started.
pub(crate) async fn run_single(
    store: Arc<dyn StatusStore>,
    tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
    job: u64,
    id: MessageId,
    interval: Duration,
    timeout: Duration,
) {
    let reporter = Reporter { tx, job, id };
    tokio::select! {
        _ = cancel.cancelled() => {
            log::debug!("poll {}: cancelled", reporter.id);
        }
        _ = single_job(store.as_ref(), &reporter, interval, timeout) => {}
    }
}

async fn single_job(
    store: &dyn StatusStore,
    reporter: &Reporter,
    interval: Duration,
    timeout: Duration,
) {
    // The deadline covers a hung initiate as well as polling.
    let deadline = Instant::now() + timeout;
    if tokio::time::timeout_at(deadline, initiate_then_poll(store, reporter, interval))
        .await
        .is_err()
    {
        reporter.emit(JobEventKind::TimedOut).await;
    }
}

async fn initiate_then_poll(store: &dyn StatusStore, reporter: &Reporter, interval: Duration) {
    let request = ProcessingRequest::single(reporter.id.clone());
    if let Err(e) = store.initiate_processing(&request).await {
        reporter.emit(JobEventKind::InitiateFailed(e.to_string())).await;
        return;
    }
    if !reporter.emit(JobEventKind::Accepted).await {
        return;
    }
    poll_until_done(store, reporter, interval).await;
}

async fn poll_until_done(store: &dyn StatusStore, reporter: &Reporter, interval: Duration) {
    let mut ticker = ticker(interval);
    loop {
        ticker.tick().await;
        match store.poll_status(&reporter.id).await {
            Ok(Some(record)) => {
                let update = status::normalize(&record);
                let done = update.is_terminal();
                if !reporter.emit(JobEventKind::Polled(update)).await || done {
                    return;
                }
            }
            Ok(None) => {
                reporter.emit(JobEventKind::Expired).await;
                return;
            }
            Err(e) => {
                reporter.emit(JobEventKind::PollFailed(e.to_string())).await;
                return;
            }
        }
    }
}

/// Batch tuning handed to `run_batch`.
pub(crate) struct BatchPlan {
    pub request: ProcessingRequest,
    pub interval: Duration,
    pub ceiling: Duration,
    pub max_empty_polls: u32,
}

/// Batch job: one request for all members, polled through the primary id. Falls back when
/// the ceiling elapses (initiate included) or too many consecutive polls come back empty.
pub(crate) async fn run_batch(
    store: Arc<dyn StatusStore>,
    tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
    job: u64,
    plan: BatchPlan,
) {
    let reporter = Reporter {
        tx,
        job,
        id: plan.request.primary_id().to_string(),
    };
    tokio::select! {
        _ = cancel.cancelled() => {
            log::debug!("batch {}: cancelled", reporter.id);
        }
        _ = batch_job(store.as_ref(), &reporter, &plan) => {}
    }
}

async fn batch_job(store: &dyn StatusStore, reporter: &Reporter, plan: &BatchPlan) {
    let deadline = Instant::now() + plan.ceiling;
    if tokio::time::timeout_at(deadline, initiate_then_poll_batch(store, reporter, plan))
        .await
        .is_err()
    {
        reporter
            .emit(JobEventKind::BatchFallback(FallbackReason::Ceiling))
            .await;
    }
}

async fn initiate_then_poll_batch(store: &dyn StatusStore, reporter: &Reporter, plan: &BatchPlan) {
    if let Err(e) = store.initiate_processing(&plan.request).await {
        reporter
            .emit(JobEventKind::BatchFallback(FallbackReason::InitiateFailed(
                e.to_string(),
            )))
            .await;
        return;
    }
    if !reporter.emit(JobEventKind::Accepted).await {
        return;
    }
    poll_batch(store, reporter, plan.interval, plan.max_empty_polls).await;
}

async fn poll_batch(
    store: &dyn StatusStore,
    reporter: &Reporter,
    interval: Duration,
    max_empty_polls: u32,
) {
    let mut ticker = ticker(interval);
    let mut empty = 0u32;
    loop {
        ticker.tick().await;
        match store.poll_status(&reporter.id).await {
            Ok(Some(record)) => {
                empty = 0;
                let update = status::normalize(&record);
                let done = update.is_terminal();
                if !reporter.emit(JobEventKind::BatchPolled(update)).await || done {
                    return;
                }
            }
            Ok(None) => {
                empty += 1;
                log::debug!("batch {}: empty status ({}/{})", reporter.id, empty, max_empty_polls);
                if empty >= max_empty_polls {
                    reporter
                        .emit(JobEventKind::BatchFallback(FallbackReason::EmptyStatus(empty)))
                        .await;
                    return;
                }
            }
            Err(e) => {
                reporter.emit(JobEventKind::BatchFailed(e.to_string())).await;
                return;
            }
        }
    }
}

/// One discovery pass, reported as `Command::Discovered`.
pub(crate) async fn run_discovery(
    ingestor: MessageIngestor,
    tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        discovery = ingestor.discover() => {
            let _ = tx.send(Command::Discovered(discovery)).await;
        }
    }
}

/// Fires `Command::CleanupDue` after `delay` unless cancelled (retry or teardown).
pub(crate) async fn run_cleanup(
    tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
    id: MessageId,
    delay: Duration,
) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(delay) => {
            let _ = tx.send(Command::CleanupDue { id }).await;
        }
    }
}
