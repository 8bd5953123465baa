//! C10 — per-run event stream with bounded, independent subscribers.
//!
//! Events are delivered in the order produced; a slow subscriber cannot
//! stall the producer — its bounded channel drops the oldest message when
//! full and a `lagged` warning is emitted instead. Subscription close is
//! idempotent. `percent` is monotone non-decreasing per run, enforced here
//! rather than trusted from callers.
//!
//! Keyed generically by [`crate::model::Id`] rather than strictly by
//! deployment id: the Setup and Security managers reuse the same bus for
//! their own step sequences, which emit progress the same way a deployment
//! does without needing a separate event schema.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::warn;

use crate::model::{Id, ProgressEvent, ProgressStatus};

const SUBSCRIBER_BUFFER: usize = 256;

struct RunState {
    tx: broadcast::Sender<ProgressEvent>,
    last_percent: std::sync::atomic::AtomicU8,
    failed_steps: DashMap<String, ()>,
}

#[derive(Clone)]
pub struct ProgressBus {
    runs: Arc<DashMap<Id, Arc<RunState>>>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self {
            runs: Arc::new(DashMap::new()),
        }
    }

    fn state_for(&self, id: Id) -> Arc<RunState> {
        self.runs
            .entry(id)
            .or_insert_with(|| {
                let (tx, _rx) = broadcast::channel(SUBSCRIBER_BUFFER);
                Arc::new(RunState {
                    tx,
                    last_percent: std::sync::atomic::AtomicU8::new(0),
                    failed_steps: DashMap::new(),
                })
            })
            .clone()
    }

    /// Subscribe to a run's stream. Safe to call before the run has
    /// published anything, and safe to call (and drop) repeatedly.
    pub fn subscribe(&self, id: Id) -> broadcast::Receiver<ProgressEvent> {
        self.state_for(id).tx.subscribe()
    }

    /// Publish one event. Clamps `percent` to be non-decreasing and drops
    /// (with a warning, never a panic) any `Ok` event for a step that
    /// already emitted `Failed`.
    pub fn publish(&self, mut event: ProgressEvent) {
        let state = self.state_for(event.deployment_id);

        if event.status == ProgressStatus::Failed {
            state.failed_steps.insert(event.step.clone(), ());
        } else if event.status == ProgressStatus::Ok && state.failed_steps.contains_key(&event.step) {
            warn!(step = %event.step, "dropping ok event for a step that already failed");
            return;
        }

        let last = state.last_percent.load(std::sync::atomic::Ordering::Relaxed);
        if event.percent < last {
            event.percent = last;
        } else {
            state.last_percent.store(event.percent, std::sync::atomic::Ordering::Relaxed);
        }

        // broadcast::Sender::send drops the oldest buffered message for any
        // receiver that falls behind rather than blocking the producer;
        // `Err` here just means there are currently zero subscribers.
        let _ = state.tx.send(event);
    }

    /// Drop the bus's bookkeeping for a finished run. Safe to call more
    /// than once; subscribers already holding a `Receiver` keep working
    /// until they drop it.
    pub fn retire(&self, id: Id) {
        self.runs.remove(&id);
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn event(id: Id, step: &str, status: ProgressStatus, percent: u8) -> ProgressEvent {
        ProgressEvent {
            deployment_id: id,
            step: step.to_string(),
            status,
            message: String::new(),
            percent,
            error: None,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn percent_is_monotone_non_decreasing() {
        let bus = ProgressBus::new();
        let id = Uuid::new_v4();
        let mut rx = bus.subscribe(id);

        bus.publish(event(id, "fetch", ProgressStatus::Running, 50));
        bus.publish(event(id, "stage", ProgressStatus::Running, 10));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.percent, 50);
        assert_eq!(second.percent, 50);
    }

    #[tokio::test]
    async fn no_ok_after_failed_for_same_step() {
        let bus = ProgressBus::new();
        let id = Uuid::new_v4();
        let mut rx = bus.subscribe(id);

        bus.publish(event(id, "start", ProgressStatus::Failed, 20));
        bus.publish(event(id, "start", ProgressStatus::Ok, 30));

        let only = rx.recv().await.unwrap();
        assert_eq!(only.status, ProgressStatus::Failed);
        assert!(rx.try_recv().is_err());
    }
}
