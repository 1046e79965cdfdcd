//! Safety monitor: periodic reconciliation of the registry against local message state.
//!
//! `inspect` is pure; the orchestrator loop applies the repairs it returns. It adds no business
//! logic of its own, it only brings registry, current pointer and message state back in line.

use super::state::OrchestratorState;
use crate::message::MessageId;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Repair {
    /// Claimed, but the message is gone, terminal, or has no poll task.
    ReleaseOrphan(MessageId),
    /// `current` points at an id that is no longer claimed.
    ClearCurrent(MessageId),
    /// Claimed and non-terminal for longer than the processing ceiling.
    ForceTimeout(MessageId),
    /// In flight locally but nothing is polling it or queued to.
    Abandon(MessageId),
    /// Nothing claimed while `new` messages wait: run discovery and scheduling.
    Kick,
}

#[derive(Debug, Clone)]
pub struct SafetyMonitor {
    stuck_after: Duration,
}

impl SafetyMonitor {
    /// `stuck_after` is the processing timeout plus one poll interval of grace.
    pub fn new(stuck_after: Duration) -> Self {
        Self { stuck_after }
    }

    pub(crate) fn inspect(&self, state: &OrchestratorState, now: Instant) -> Vec<Repair> {
        let mut repairs = Vec::new();

        for id in state.registry.ids() {
            let message = state.get(&id);
            let job = state.jobs.get(&id);
            match (message, job) {
                (None, _) | (_, None) => repairs.push(Repair::ReleaseOrphan(id)),
                (Some(m), _) if m.status.is_terminal() => repairs.push(Repair::ReleaseOrphan(id)),
                (Some(_), Some(j)) => {
                    if now.saturating_duration_since(j.started_at) > self.stuck_after {
                        repairs.push(Repair::ForceTimeout(id));
                    }
                }
            }
        }

        if let Some(ref cur) = state.current {
            if !state.registry.is_claimed(cur) {
                repairs.push(Repair::ClearCurrent(cur.clone()));
            }
        }

        for m in &state.messages {
            if m.status.is_in_flight()
                && !state.registry.is_claimed(&m.id)
                && !state.is_queued(&m.id)
            {
                repairs.push(Repair::Abandon(m.id.clone()));
            }
        }

        if state.registry.is_empty() && state.messages.iter().any(|m| state.is_pending(m)) {
            repairs.push(Repair::Kick);
        }

        repairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, MessageStatus, TransitionCause};
    use crate::orchestrator::state::ActiveJob;
    use chrono::Utc;

    fn monitor() -> SafetyMonitor {
        SafetyMonitor::new(Duration::from_secs(122))
    }

    fn claim(state: &mut OrchestratorState, id: &str, started_at: Instant) {
        let job = state.next_job_id();
        state.registry.try_claim(id);
        state.jobs.insert(id.to_string(), ActiveJob { job, started_at });
    }

    #[test]
    fn healthy_state_needs_no_repair() {
        let mut s = OrchestratorState::default();
        let mut m = Message::new("a", "c", "x", Utc::now());
        m.transition(MessageStatus::Analyzing, TransitionCause::Initiated).unwrap();
        s.merge(vec![m]);
        let now = Instant::now();
        claim(&mut s, "a", now);
        s.current = Some("a".into());
        assert!(monitor().inspect(&s, now).is_empty());
    }

    #[test]
    fn claims_on_missing_or_terminal_messages_are_released() {
        let mut s = OrchestratorState::default();
        let mut done = Message::new("done", "c", "x", Utc::now());
        done.transition(MessageStatus::Completed, TransitionCause::InferredFromEmpty)
            .unwrap();
        s.merge(vec![done]);
        let now = Instant::now();
        claim(&mut s, "done", now);
        claim(&mut s, "ghost", now);
        let repairs = monitor().inspect(&s, now);
        assert!(repairs.contains(&Repair::ReleaseOrphan("done".into())));
        assert!(repairs.contains(&Repair::ReleaseOrphan("ghost".into())));
    }

    #[test]
    fn stale_current_is_cleared_and_idle_pending_kicks() {
        let mut s = OrchestratorState::default();
        s.merge(vec![Message::new("a", "c", "x", Utc::now())]);
        s.current = Some("a".into());
        let repairs = monitor().inspect(&s, Instant::now());
        assert_eq!(
            repairs,
            vec![Repair::ClearCurrent("a".into()), Repair::Kick]
        );
    }

    #[test]
    fn overdue_claim_is_force_timed_out() {
        let mut s = OrchestratorState::default();
        let mut m = Message::new("a", "c", "x", Utc::now());
        m.transition(MessageStatus::Analyzing, TransitionCause::Initiated).unwrap();
        s.merge(vec![m]);
        let started = Instant::now();
        claim(&mut s, "a", started);
        let later = started + Duration::from_secs(123);
        assert_eq!(
            monitor().inspect(&s, later),
            vec![Repair::ForceTimeout("a".into())]
        );
    }

    #[test]
    fn unclaimed_in_flight_message_is_abandoned_unless_queued() {
        let mut s = OrchestratorState::default();
        let mut m = Message::new("a", "c", "x", Utc::now());
        m.transition(MessageStatus::Analyzing, TransitionCause::Initiated).unwrap();
        s.merge(vec![m]);
        assert_eq!(
            monitor().inspect(&s, Instant::now()),
            vec![Repair::Abandon("a".into())]
        );
        s.fallback_queue.push_back("a".into());
        assert!(monitor().inspect(&s, Instant::now()).is_empty());
    }
}
