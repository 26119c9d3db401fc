//! Server-side view of worker health, fed by heartbeats.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::scheduler::bucket::{BucketId, WorkerId};

/// Derived health of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Healthy,
    Silent,
    NotRegistered,
    Blocked,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Healthy => write!(f, "healthy"),
            WorkerStatus::Silent => write!(f, "silent"),
            WorkerStatus::NotRegistered => write!(f, "not_registered"),
            WorkerStatus::Blocked => write!(f, "blocked"),
        }
    }
}

/// Point-in-time answer about one worker.
///
/// `is_in_working_condition` and `silent` are independent: a blocked or
/// unknown worker is neither.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerAliveness {
    pub is_in_working_condition: bool,
    pub silent: bool,
    pub bucket_ids_being_processed: HashSet<BucketId>,
    pub status: WorkerStatus,
}

impl WorkerAliveness {
    fn unknown() -> Self {
        Self {
            is_in_working_condition: false,
            silent: false,
            bucket_ids_being_processed: HashSet::new(),
            status: WorkerStatus::NotRegistered,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatusReport {
    pub worker_id: WorkerId,
    pub status: WorkerStatus,
    pub bucket_ids_being_processed: Vec<BucketId>,
    /// Milliseconds since the last heartbeat or registration.
    pub last_seen_ms_ago: u64,
}

#[derive(Debug)]
struct WorkerEntry {
    last_alive_at: Instant,
    blocked: bool,
    processing: HashSet<BucketId>,
    /// Buckets handed out recently, trusted even if a heartbeat omits them.
    recent_dequeues: HashMap<BucketId, Instant>,
}

impl WorkerEntry {
    fn new(now: Instant) -> Self {
        Self {
            last_alive_at: now,
            blocked: false,
            processing: HashSet::new(),
            recent_dequeues: HashMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Workers {
    entries: HashMap<WorkerId, WorkerEntry>,
}

/// Tracks heartbeats and in-progress sets per worker.
///
/// Has its own lock, separate from the queue holder, so heartbeats never
/// wait on queue traffic.
#[derive(Debug)]
pub struct WorkerAlivenessTracker {
    silence_timeout: Duration,
    dequeue_grace_period: Duration,
    workers: RwLock<Workers>,
}

impl WorkerAlivenessTracker {
    pub fn new(silence_timeout: Duration, dequeue_grace_period: Duration) -> Self {
        Self {
            silence_timeout,
            dequeue_grace_period,
            workers: RwLock::new(Workers::default()),
        }
    }

    /// Register a worker. Returns false if the worker is blocked.
    pub async fn did_register_worker(&self, worker_id: &WorkerId) -> bool {
        let now = Instant::now();
        let mut workers = self.workers.write().await;
        let entry = workers
            .entries
            .entry(worker_id.clone())
            .or_insert_with(|| WorkerEntry::new(now));
        if entry.blocked {
            return false;
        }
        entry.last_alive_at = now;
        tracing::info!(worker_id = %worker_id, "Worker registered");
        true
    }

    /// Record a heartbeat and replace the worker's in-progress set.
    ///
    /// An unknown worker is registered on its first heartbeat. Returns false
    /// if the worker is blocked.
    pub async fn report_alive(&self, worker_id: &WorkerId, bucket_ids: HashSet<BucketId>) -> bool {
        let now = Instant::now();
        let grace = self.dequeue_grace_period;
        let mut workers = self.workers.write().await;
        let entry = workers.entries.entry(worker_id.clone()).or_insert_with(|| {
            tracing::info!(worker_id = %worker_id, "Worker registered by heartbeat");
            WorkerEntry::new(now)
        });
        if entry.blocked {
            return false;
        }
        entry
            .recent_dequeues
            .retain(|_, dequeued_at| now.duration_since(*dequeued_at) < grace);
        let mut processing = bucket_ids;
        processing.extend(entry.recent_dequeues.keys().copied());
        entry.processing = processing;
        entry.last_alive_at = now;
        tracing::trace!(worker_id = %worker_id, buckets = entry.processing.len(), "Worker alive");
        true
    }

    /// The bucket now belongs to the worker's in-progress set.
    pub async fn did_dequeue_bucket(&self, worker_id: &WorkerId, bucket_id: BucketId) {
        let now = Instant::now();
        let mut workers = self.workers.write().await;
        let entry = workers
            .entries
            .entry(worker_id.clone())
            .or_insert_with(|| WorkerEntry::new(now));
        entry.processing.insert(bucket_id);
        entry.recent_dequeues.insert(bucket_id, now);
    }

    pub async fn bucket_completed(&self, worker_id: &WorkerId, bucket_id: BucketId) {
        let mut workers = self.workers.write().await;
        if let Some(entry) = workers.entries.get_mut(worker_id) {
            entry.processing.remove(&bucket_id);
            entry.recent_dequeues.remove(&bucket_id);
        }
    }

    /// Declare a worker dead. It stays blocked for the lifetime of the tracker.
    pub async fn block_worker(&self, worker_id: &WorkerId) {
        let now = Instant::now();
        let mut workers = self.workers.write().await;
        let entry = workers
            .entries
            .entry(worker_id.clone())
            .or_insert_with(|| WorkerEntry::new(now));
        entry.blocked = true;
        tracing::warn!(worker_id = %worker_id, "Worker blocked");
    }

    pub async fn is_blocked(&self, worker_id: &WorkerId) -> bool {
        self.workers
            .read()
            .await
            .entries
            .get(worker_id)
            .is_some_and(|e| e.blocked)
    }

    fn aliveness_of(&self, entry: &WorkerEntry, now: Instant) -> WorkerAliveness {
        if entry.blocked {
            return WorkerAliveness {
                is_in_working_condition: false,
                silent: false,
                bucket_ids_being_processed: entry.processing.clone(),
                status: WorkerStatus::Blocked,
            };
        }
        let silent = now.duration_since(entry.last_alive_at) >= self.silence_timeout;
        WorkerAliveness {
            is_in_working_condition: !silent,
            silent,
            bucket_ids_being_processed: entry.processing.clone(),
            status: if silent {
                WorkerStatus::Silent
            } else {
                WorkerStatus::Healthy
            },
        }
    }

    pub async fn aliveness_for_worker(&self, worker_id: &WorkerId) -> WorkerAliveness {
        let now = Instant::now();
        let workers = self.workers.read().await;
        match workers.entries.get(worker_id) {
            Some(entry) => self.aliveness_of(entry, now),
            None => WorkerAliveness::unknown(),
        }
    }

    /// Aliveness of every known worker, taken under one lock acquisition.
    pub async fn snapshot(&self) -> AlivenessSnapshot {
        let now = Instant::now();
        let workers = self.workers.read().await;
        AlivenessSnapshot {
            taken_at: Utc::now(),
            workers: workers
                .entries
                .iter()
                .map(|(id, entry)| (id.clone(), self.aliveness_of(entry, now)))
                .collect(),
        }
    }

    pub async fn worker_statuses(&self) -> Vec<WorkerStatusReport> {
        let now = Instant::now();
        let workers = self.workers.read().await;
        let mut reports: Vec<WorkerStatusReport> = workers
            .entries
            .iter()
            .map(|(id, entry)| {
                let aliveness = self.aliveness_of(entry, now);
                let mut bucket_ids: Vec<BucketId> =
                    aliveness.bucket_ids_being_processed.into_iter().collect();
                bucket_ids.sort_by_key(|b| b.0);
                WorkerStatusReport {
                    worker_id: id.clone(),
                    status: aliveness.status,
                    bucket_ids_being_processed: bucket_ids,
                    last_seen_ms_ago: now.duration_since(entry.last_alive_at).as_millis() as u64,
                }
            })
            .collect();
        reports.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        reports
    }
}

/// Frozen aliveness of all workers, used for one reenqueue pass.
#[derive(Debug, Clone)]
pub struct AlivenessSnapshot {
    taken_at: DateTime<Utc>,
    workers: HashMap<WorkerId, WorkerAliveness>,
}

impl AlivenessSnapshot {
    /// Buckets dequeued after this instant are not covered by the snapshot.
    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn aliveness_for_worker(&self, worker_id: &WorkerId) -> WorkerAliveness {
        self.workers
            .get(worker_id)
            .cloned()
            .unwrap_or_else(WorkerAliveness::unknown)
    }
}
