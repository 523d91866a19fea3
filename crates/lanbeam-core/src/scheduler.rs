//! Outbound transfer scheduling.
//!
//! Limits how many sends run at once, globally and per peer. The decision
//! core ([`Scheduler`]) is synchronous; [`TransferScheduler`] drives it from
//! async code and runs admitted jobs.
//!
//! Admission runs on every enqueue and every completion:
//!
//! ```text
//!   running peers ──► promote waiting peers (oldest pending first)
//!        │                      until max_active_peers
//!        ▼
//!   per active peer: quota = max_concurrent / active − running
//!        │           smallest files first
//!        ▼
//!   pooled fill of leftover slots, oldest enqueue first
//! ```

use crate::config::SchedulerConfig;
use lanbeam_signal::PeerId;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Identifies one outbound file send
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    /// Receiving peer
    pub peer: PeerId,
    /// File id within the invite
    pub file_id: String,
}

impl TaskKey {
    /// Key for `file_id` sent to `peer`
    pub fn new(peer: PeerId, file_id: impl Into<String>) -> Self {
        Self {
            peer,
            file_id: file_id.into(),
        }
    }
}

/// A task waiting for, or granted, a slot
#[derive(Debug)]
pub struct QueuedTask<T> {
    /// Task identity
    pub key: TaskKey,
    /// File size in bytes
    pub size: u64,
    /// Enqueue sequence number; lower is older
    pub enqueued_at: u64,
    /// Work to run once admitted
    pub job: T,
}

/// Point-in-time scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Running tasks
    pub running: usize,
    /// Waiting tasks
    pub pending: usize,
    /// Distinct peers with running tasks
    pub active_peers: usize,
}

/// Synchronous admission state
#[derive(Debug)]
pub struct Scheduler<T> {
    config: SchedulerConfig,
    pending: Vec<QueuedTask<T>>,
    /// Running task → its enqueue sequence
    running: HashMap<TaskKey, u64>,
    seq: u64,
}

impl<T> Scheduler<T> {
    /// Create an empty scheduler
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            pending: Vec::new(),
            running: HashMap::new(),
            seq: 0,
        }
    }

    /// Limits in effect
    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    /// Queue one task and return whatever became runnable
    pub fn enqueue(&mut self, key: TaskKey, size: u64, job: T) -> Vec<QueuedTask<T>> {
        self.push(key, size, job);
        self.admit()
    }

    /// Queue several tasks, then admit once
    ///
    /// Tasks queued together compete on size, so small files of a batch
    /// start before large ones.
    pub fn enqueue_many<I>(&mut self, tasks: I) -> Vec<QueuedTask<T>>
    where
        I: IntoIterator<Item = (TaskKey, u64, T)>,
    {
        for (key, size, job) in tasks {
            self.push(key, size, job);
        }
        self.admit()
    }

    /// Release the slot held by `key` and return whatever became runnable
    pub fn complete(&mut self, key: &TaskKey) -> Vec<QueuedTask<T>> {
        if self.running.remove(key).is_none() {
            tracing::debug!("Completion for unknown task {}/{}", key.peer, key.file_id);
        }
        self.admit()
    }

    /// Drop every pending task for `peer`
    ///
    /// Running tasks keep their slots until they complete.
    pub fn cancel_peer(&mut self, peer: &PeerId) -> Vec<QueuedTask<T>> {
        let (cancelled, kept) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|task| &task.key.peer == peer);
        self.pending = kept;
        cancelled
    }

    /// Drop every pending task
    pub fn cancel_all(&mut self) -> Vec<QueuedTask<T>> {
        std::mem::take(&mut self.pending)
    }

    /// Keys of the running tasks
    pub fn running_keys(&self) -> Vec<TaskKey> {
        self.running.keys().cloned().collect()
    }

    /// Number of running tasks
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Number of waiting tasks
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of distinct peers with running tasks
    pub fn active_peers(&self) -> usize {
        self.running
            .keys()
            .map(|key| &key.peer)
            .collect::<HashSet<_>>()
            .len()
    }

    /// Whether `key` holds a slot
    pub fn is_running(&self, key: &TaskKey) -> bool {
        self.running.contains_key(key)
    }

    /// Current counters
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            running: self.running_count(),
            pending: self.pending_count(),
            active_peers: self.active_peers(),
        }
    }

    fn push(&mut self, key: TaskKey, size: u64, job: T) {
        if self.running.contains_key(&key) || self.pending.iter().any(|t| t.key == key) {
            tracing::warn!("Task {}/{} already scheduled", key.peer, key.file_id);
            return;
        }
        let enqueued_at = self.seq;
        self.seq += 1;
        self.pending.push(QueuedTask {
            key,
            size,
            enqueued_at,
            job,
        });
    }

    fn admit(&mut self) -> Vec<QueuedTask<T>> {
        let max = self.config.max_concurrent_transfers;
        let mut admitted = Vec::new();
        if self.running.len() >= max || self.pending.is_empty() {
            return admitted;
        }

        let active = self.active_order();
        if active.is_empty() {
            return admitted;
        }

        let share = max / active.len();
        for peer in &active {
            let free = max - self.running.len();
            if free == 0 {
                break;
            }
            let running_for = self.running.keys().filter(|k| &k.peer == peer).count();
            let quota = share.saturating_sub(running_for).min(free);

            let mut mine: Vec<(u64, u64, usize)> = self
                .pending
                .iter()
                .enumerate()
                .filter(|(_, t)| &t.key.peer == peer)
                .map(|(i, t)| (t.size, t.enqueued_at, i))
                .collect();
            mine.sort_unstable();
            let picks: Vec<usize> = mine.into_iter().take(quota).map(|(_, _, i)| i).collect();
            self.take(picks, &mut admitted);
        }

        let free = max - self.running.len();
        if free > 0 {
            let mut pooled: Vec<(u64, usize)> = self
                .pending
                .iter()
                .enumerate()
                .filter(|(_, t)| active.contains(&t.key.peer))
                .map(|(i, t)| (t.enqueued_at, i))
                .collect();
            pooled.sort_unstable();
            let picks: Vec<usize> = pooled.into_iter().take(free).map(|(_, i)| i).collect();
            self.take(picks, &mut admitted);
        }

        for task in &admitted {
            tracing::debug!(
                "Admitted {}/{} ({} bytes)",
                task.key.peer,
                task.key.file_id,
                task.size
            );
        }
        admitted
    }

    /// Peers allowed to run, in priority order
    fn active_order(&self) -> Vec<PeerId> {
        let mut running: HashMap<&PeerId, u64> = HashMap::new();
        for (key, &at) in &self.running {
            let earliest = running.entry(&key.peer).or_insert(at);
            *earliest = (*earliest).min(at);
        }
        let mut active: Vec<(u64, PeerId)> = running
            .into_iter()
            .map(|(peer, at)| (at, peer.clone()))
            .collect();
        active.sort();

        let mut waiting: HashMap<&PeerId, u64> = HashMap::new();
        for task in &self.pending {
            if active.iter().any(|(_, p)| p == &task.key.peer) {
                continue;
            }
            let oldest = waiting.entry(&task.key.peer).or_insert(task.enqueued_at);
            *oldest = (*oldest).min(task.enqueued_at);
        }
        let mut waiting: Vec<(u64, PeerId)> = waiting
            .into_iter()
            .map(|(peer, at)| (at, peer.clone()))
            .collect();
        waiting.sort();

        let room = self.config.max_active_peers.saturating_sub(active.len());
        active.extend(waiting.into_iter().take(room));
        active.into_iter().map(|(_, peer)| peer).collect()
    }

    /// Move pending tasks at `indices` to running
    fn take(&mut self, mut indices: Vec<usize>, admitted: &mut Vec<QueuedTask<T>>) {
        // Remove from the back so earlier indices stay valid
        indices.sort_unstable_by(|a, b| b.cmp(a));
        let mut taken: Vec<QueuedTask<T>> = indices
            .into_iter()
            .map(|i| self.pending.remove(i))
            .collect();
        taken.sort_by_key(|t| (t.size, t.enqueued_at));
        for task in taken {
            self.running.insert(task.key.clone(), task.enqueued_at);
            admitted.push(task);
        }
    }
}

/// Boxed send job
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Async driver for [`Scheduler`]
///
/// Admitted jobs are spawned; a job's slot is released when it finishes,
/// whether it succeeded, failed or panicked.
#[derive(Clone)]
pub struct TransferScheduler {
    state: Arc<Mutex<Scheduler<Job>>>,
}

impl std::fmt::Debug for TransferScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferScheduler").finish_non_exhaustive()
    }
}

impl TransferScheduler {
    /// Create a driver with the given limits
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(Scheduler::new(config))),
        }
    }

    /// Queue one send
    pub async fn submit<F>(&self, peer: PeerId, file_id: impl Into<String>, size: u64, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let admitted = {
            let mut state = self.state.lock().await;
            state.enqueue(TaskKey::new(peer, file_id), size, Box::pin(job))
        };
        self.launch(admitted);
    }

    /// Queue a batch of sends
    pub async fn submit_all(&self, jobs: Vec<(TaskKey, u64, Job)>) {
        let admitted = {
            let mut state = self.state.lock().await;
            state.enqueue_many(jobs)
        };
        self.launch(admitted);
    }

    /// Drop pending sends to `peer`; returns how many were dropped
    pub async fn cancel_peer(&self, peer: &PeerId) -> usize {
        let cancelled = self.state.lock().await.cancel_peer(peer);
        if !cancelled.is_empty() {
            tracing::debug!("Dropped {} queued sends to {}", cancelled.len(), peer);
        }
        cancelled.len()
    }

    /// Drop every pending send; returns the dropped keys
    pub async fn cancel_all(&self) -> Vec<TaskKey> {
        let cancelled = self.state.lock().await.cancel_all();
        cancelled.into_iter().map(|task| task.key).collect()
    }

    /// Keys of the sends holding a slot
    pub async fn running_keys(&self) -> Vec<TaskKey> {
        self.state.lock().await.running_keys()
    }

    /// Current counters
    pub async fn stats(&self) -> SchedulerStats {
        self.state.lock().await.stats()
    }

    fn launch(&self, admitted: Vec<QueuedTask<Job>>) {
        for task in admitted {
            let this = self.clone();
            tokio::spawn(async move {
                let key = task.key;
                if let Err(e) = tokio::spawn(task.job).await {
                    tracing::warn!("Send {}/{} aborted: {}", key.peer, key.file_id, e);
                }
                let next = this.state.lock().await.complete(&key);
                this.launch(next);
            });
        }
    }
}
