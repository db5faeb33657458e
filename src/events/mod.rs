//! # Event Publisher
//!
//! Lifecycle events for live streaming. Every event carries `{run_id,
//! timestamp, payload}`; for a given run, `run_registered` comes first,
//! timestamps are non-decreasing, and exactly one terminal event
//! (`run_completed` or `run_error`) is emitted — the publisher drops any
//! further terminal event for an already-terminated run.
//!
//! Delivery is a `tokio::sync::broadcast` channel plus a replay buffer:
//! subscribers opening mid-run first receive the history from the beginning
//! and then the live feed (at-least-once across the seam).

use crate::protocol::{RunStatus, StepStatus, SuiteStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::warn;

/// One lifecycle event.
#[derive(Debug, Clone, Serialize)]
pub struct EngineEvent {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Event payloads, tagged `event` on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    RunRegistered {
        label: Option<String>,
    },
    RunStarted {
        suite_count: usize,
    },
    SuiteStarted {
        node_id: String,
        suite_name: String,
        wave: usize,
    },
    SuiteCompleted {
        node_id: String,
        status: SuiteStatus,
        duration_ms: u64,
        steps_failed: usize,
    },
    StepCompleted {
        node_id: String,
        step_id: String,
        status: StepStatus,
        duration_ms: u64,
    },
    RunError {
        message: String,
    },
    RunCompleted {
        status: RunStatus,
        success_rate: f64,
        total_duration_ms: u64,
    },
}

impl EventKind {
    /// SSE event-type tag.
    pub fn tag(&self) -> &'static str {
        match self {
            EventKind::RunRegistered { .. } => "run_registered",
            EventKind::RunStarted { .. } => "run_started",
            EventKind::SuiteStarted { .. } => "suite_started",
            EventKind::SuiteCompleted { .. } => "suite_completed",
            EventKind::StepCompleted { .. } => "step_completed",
            EventKind::RunError { .. } => "run_error",
            EventKind::RunCompleted { .. } => "run_completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::RunError { .. } | EventKind::RunCompleted { .. }
        )
    }
}

/// Broadcast publisher with replay-from-beginning for late subscribers.
pub struct EventPublisher {
    tx: broadcast::Sender<EngineEvent>,
    history: RwLock<Vec<EngineEvent>>,
    terminated: RwLock<HashSet<String>>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Arc::new(Self {
            tx,
            history: RwLock::new(Vec::new()),
            terminated: RwLock::new(HashSet::new()),
        })
    }

    /// Emit one event. Terminal events for an already-terminated run are
    /// dropped so each run has exactly one terminal event.
    pub fn publish(&self, run_id: &str, kind: EventKind) {
        if kind.is_terminal() {
            let mut terminated = self.terminated.write().expect("terminated lock");
            if !terminated.insert(run_id.to_string()) {
                warn!(run_id, event = kind.tag(), "duplicate terminal event dropped");
                return;
            }
        }
        let event = EngineEvent {
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
            kind,
        };
        self.history.write().expect("history lock").push(event.clone());
        // No receivers is fine; history still records the run.
        let _ = self.tx.send(event);
    }

    /// Re-open a terminated run so a re-execution (orchestrator retry keeps
    /// the run id) gets its own terminal event.
    pub fn reopen(&self, run_id: &str) {
        self.terminated
            .write()
            .expect("terminated lock")
            .remove(run_id);
    }

    /// Replay snapshot plus a live receiver. Taking the snapshot and the
    /// receiver under one history read keeps the seam at-least-once.
    pub fn subscribe(&self) -> (Vec<EngineEvent>, broadcast::Receiver<EngineEvent>) {
        let history = self.history.read().expect("history lock");
        let rx = self.tx.subscribe();
        (history.clone(), rx)
    }

    pub fn history_for(&self, run_id: &str) -> Vec<EngineEvent> {
        self.history
            .read()
            .expect("history lock")
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect()
    }
}

/// A publisher bound to one run id; what the scheduler and suite runner
/// carry around.
#[derive(Clone)]
pub struct RunEvents {
    pub publisher: Arc<EventPublisher>,
    pub run_id: String,
}

impl RunEvents {
    pub fn new(publisher: Arc<EventPublisher>, run_id: impl Into<String>) -> Self {
        Self {
            publisher,
            run_id: run_id.into(),
        }
    }

    pub fn emit(&self, kind: EventKind) {
        self.publisher.publish(&self.run_id, kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered() -> EventKind {
        EventKind::RunRegistered { label: None }
    }

    fn completed() -> EventKind {
        EventKind::RunCompleted {
            status: RunStatus::Success,
            success_rate: 1.0,
            total_duration_ms: 10,
        }
    }

    #[test]
    fn run_registered_first_and_timestamps_non_decreasing() {
        let publisher = EventPublisher::new(64);
        publisher.publish("r1", registered());
        publisher.publish("r1", EventKind::RunStarted { suite_count: 2 });
        publisher.publish(
            "r1",
            EventKind::SuiteStarted {
                node_id: "a".into(),
                suite_name: "A".into(),
                wave: 0,
            },
        );
        publisher.publish("r1", completed());

        let history = publisher.history_for("r1");
        assert_eq!(history[0].kind.tag(), "run_registered");
        for pair in history.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
        let terminal = history.iter().filter(|e| e.kind.is_terminal()).count();
        assert_eq!(terminal, 1);
    }

    #[test]
    fn duplicate_terminal_events_are_dropped() {
        let publisher = EventPublisher::new(64);
        publisher.publish("r1", registered());
        publisher.publish("r1", completed());
        publisher.publish(
            "r1",
            EventKind::RunError {
                message: "late".into(),
            },
        );
        let history = publisher.history_for("r1");
        assert_eq!(history.iter().filter(|e| e.kind.is_terminal()).count(), 1);
        assert_eq!(history.last().unwrap().kind.tag(), "run_completed");
    }

    #[tokio::test]
    async fn mid_run_subscription_replays_from_beginning() {
        let publisher = EventPublisher::new(64);
        publisher.publish("r1", registered());
        publisher.publish("r1", EventKind::RunStarted { suite_count: 1 });

        let (replay, mut rx) = publisher.subscribe();
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].kind.tag(), "run_registered");

        publisher.publish("r1", completed());
        let live = rx.recv().await.unwrap();
        assert_eq!(live.kind.tag(), "run_completed");
    }

    #[test]
    fn runs_are_isolated_in_history() {
        let publisher = EventPublisher::new(64);
        publisher.publish("r1", registered());
        publisher.publish("r2", registered());
        publisher.publish("r1", completed());
        assert_eq!(publisher.history_for("r1").len(), 2);
        assert_eq!(publisher.history_for("r2").len(), 1);
    }
}
