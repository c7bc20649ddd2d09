use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::Job;

/// One dispatched job waiting in (or taken from) a named queue.
pub struct QueuedJob {
    pub job: Arc<dyn Job>,
    pub key: String,
    pub queue: String,
    /// Failed attempts so far; releases do not count.
    pub attempts: u32,
    pub releases: u32,
    pub enqueued_at: Instant,
    available_at: Instant,
}

impl QueuedJob {
    pub fn available_at(&self) -> Instant {
        self.available_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Succeeded,
    Failed,
}

/// Final state of a job, kept for operator inspection.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub name: String,
    pub key: String,
    pub queue: String,
    pub state: JobState,
    pub attempts: u32,
    pub releases: u32,
    pub detail: Value,
    pub finished_at: DateTime<Utc>,
}

#[derive(Default)]
struct QueueState {
    pending: IndexMap<String, VecDeque<QueuedJob>>,
    /// Keys that are queued or running.
    active: HashSet<String>,
    history: Vec<JobRecord>,
}

/// In-process named queues with idempotency-key dedupe. Clones share state.
#[derive(Clone, Default)]
pub struct JobQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn dispatch(&self, job: Arc<dyn Job>) -> bool {
        self.dispatch_with_key(job, None)
    }

    /// Enqueue unless a job with the same key is already queued or running.
    /// Returns whether the job was accepted.
    pub fn dispatch_with_key(&self, job: Arc<dyn Job>, key: Option<String>) -> bool {
        let key = key.unwrap_or_else(|| job.idempotency_key());
        let queue = job.queue().to_string();
        {
            let mut state = self.state();
            if !state.active.insert(key.clone()) {
                debug!(idempotency_key = %key, job = job.name(), "duplicate dispatch collapsed");
                return false;
            }
            let now = Instant::now();
            state.pending.entry(queue.clone()).or_default().push_back(QueuedJob {
                job,
                key: key.clone(),
                queue: queue.clone(),
                attempts: 0,
                releases: 0,
                enqueued_at: now,
                available_at: now,
            });
        }
        debug!(idempotency_key = %key, queue = %queue, "job queued");
        self.notify.notify_one();
        true
    }

    /// First ready job, scanning `queues` in order (all queues when empty).
    pub(crate) fn take_ready(&self, queues: &[String]) -> Option<QueuedJob> {
        let now = Instant::now();
        let mut state = self.state();
        let names: Vec<String> = if queues.is_empty() {
            state.pending.keys().cloned().collect()
        } else {
            queues.to_vec()
        };
        for name in names {
            let Some(list) = state.pending.get_mut(&name) else {
                continue;
            };
            if let Some(pos) = list.iter().position(|j| j.available_at <= now) {
                return list.remove(pos);
            }
        }
        None
    }

    /// Earliest time a job in `queues` becomes ready.
    pub(crate) fn next_ready_at(&self, queues: &[String]) -> Option<Instant> {
        let state = self.state();
        state
            .pending
            .iter()
            .filter(|(name, _)| queues.is_empty() || queues.contains(name))
            .flat_map(|(_, list)| list.iter().map(|j| j.available_at))
            .min()
    }

    /// Put a taken job back, available after `delay`. Its key stays active.
    pub(crate) fn requeue(&self, mut job: QueuedJob, delay: Duration) {
        job.available_at = Instant::now() + delay;
        self.state()
            .pending
            .entry(job.queue.clone())
            .or_default()
            .push_back(job);
        self.notify.notify_one();
    }

    pub(crate) fn finish(&self, job: &QueuedJob, state: JobState, detail: Value) {
        let mut guard = self.state();
        guard.active.remove(&job.key);
        guard.history.push(JobRecord {
            name: job.job.name().to_string(),
            key: job.key.clone(),
            queue: job.queue.clone(),
            state,
            attempts: job.attempts,
            releases: job.releases,
            detail,
            finished_at: Utc::now(),
        });
    }

    pub(crate) async fn notified(&self) {
        self.notify.notified().await
    }

    pub fn pending(&self) -> usize {
        self.state().pending.values().map(VecDeque::len).sum()
    }

    pub fn pending_in(&self, queue: &str) -> usize {
        self.state().pending.get(queue).map_or(0, VecDeque::len)
    }

    /// Keys of every queued job, in queue order.
    pub fn pending_keys(&self) -> Vec<String> {
        self.state()
            .pending
            .values()
            .flat_map(|list| list.iter().map(|j| j.key.clone()))
            .collect()
    }

    pub fn history(&self) -> Vec<JobRecord> {
        self.state().history.clone()
    }

    pub fn failures(&self) -> Vec<JobRecord> {
        self.state()
            .history
            .iter()
            .filter(|r| r.state == JobState::Failed)
            .cloned()
            .collect()
    }
}
