use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tokio::sync::{RwLock, RwLockWriteGuard};

use crate::scheduler::assigner::select_bucket_index;
use crate::scheduler::bucket::{
    Bucket, BucketId, DequeuedBucket, EnqueuedBucket, JobId, PrioritizedJob, WorkerCapability,
    WorkerId,
};

/// Outcome of handing a finished bucket back to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Completed(DequeuedBucket),
    /// The bucket is not dequeued (already completed, reclaimed, or its job deleted).
    NotDequeued,
    /// The bucket is dequeued, but to somebody else.
    OwnedByAnotherWorker(WorkerId),
}

/// Per-job bucket counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketCounts {
    pub enqueued: usize,
    pub dequeued: usize,
}

impl BucketCounts {
    pub fn is_depleted(&self) -> bool {
        self.enqueued == 0 && self.dequeued == 0
    }
}

/// All enqueued and dequeued buckets.
///
/// A bucket id is present in at most one of the two sets, and a dequeued
/// bucket belongs to exactly one worker. Only reachable through
/// [`BucketQueueHolder`].
#[derive(Debug, Default)]
pub struct QueueState {
    enqueued: Vec<EnqueuedBucket>,
    /// Ids of `enqueued`, kept in step with it.
    enqueued_ids: HashSet<BucketId>,
    dequeued: HashMap<BucketId, DequeuedBucket>,
    next_sequence: u64,
}

impl QueueState {
    /// Append buckets in submission order.
    ///
    /// # Panics
    ///
    /// Panics if any bucket id is already held; bucket ids are generated fresh
    /// for every bucket, so a collision means a bucket was enqueued twice.
    pub fn enqueue(&mut self, buckets: Vec<Bucket>, job: &PrioritizedJob) {
        let now = Utc::now();
        for bucket in buckets {
            let bucket_id = bucket.bucket_id();
            assert!(
                !self.contains(bucket_id),
                "bucket {} is already held by the queue",
                bucket_id
            );
            self.enqueued_ids.insert(bucket_id);
            self.enqueued.push(EnqueuedBucket {
                bucket,
                job: job.clone(),
                enqueued_at: now,
                sequence: self.next_sequence,
            });
            self.next_sequence += 1;
        }
    }

    /// Move the highest-priority eligible bucket to the dequeued set.
    pub fn dequeue(
        &mut self,
        worker_id: &WorkerId,
        capabilities: &[WorkerCapability],
        is_job_running: impl Fn(&JobId) -> bool,
    ) -> Option<DequeuedBucket> {
        let index = select_bucket_index(&self.enqueued, capabilities, is_job_running)?;
        let enqueued = self.enqueued.remove(index);
        self.enqueued_ids.remove(&enqueued.bucket.bucket_id());
        let dequeued = DequeuedBucket {
            enqueued,
            worker_id: worker_id.clone(),
            dequeued_at: Utc::now(),
        };
        self.dequeued.insert(dequeued.bucket_id(), dequeued.clone());
        Some(dequeued)
    }

    /// Release a bucket that `worker_id` finished.
    pub fn complete(&mut self, bucket_id: BucketId, worker_id: &WorkerId) -> Completion {
        match self.dequeued.get(&bucket_id) {
            None => Completion::NotDequeued,
            Some(dequeued) if &dequeued.worker_id != worker_id => {
                Completion::OwnedByAnotherWorker(dequeued.worker_id.clone())
            }
            Some(_) => match self.dequeued.remove(&bucket_id) {
                Some(dequeued) => Completion::Completed(dequeued),
                None => Completion::NotDequeued,
            },
        }
    }

    /// Drop a dequeued bucket without a result.
    ///
    /// # Panics
    ///
    /// Panics if the bucket is not currently dequeued to the same worker.
    pub fn remove(&mut self, dequeued: &DequeuedBucket) {
        let removed = self.dequeued.remove(&dequeued.bucket_id());
        match removed {
            Some(held) if held.worker_id == dequeued.worker_id => {}
            other => panic!(
                "bucket {} was removed without being dequeued to {} (held: {:?})",
                dequeued.bucket_id(),
                dequeued.worker_id,
                other.map(|d| d.worker_id)
            ),
        }
    }

    /// Purge every bucket of `job_id`; returns how many were dropped.
    pub fn remove_job(&mut self, job_id: &JobId) -> BucketCounts {
        let before = self.counts_for_job(job_id);
        self.enqueued.retain(|e| &e.job.job_id != job_id);
        self.enqueued_ids = self.enqueued.iter().map(|e| e.bucket.bucket_id()).collect();
        self.dequeued.retain(|_, d| d.job_id() != job_id);
        before
    }

    /// Dequeued buckets in the order they were originally enqueued.
    pub fn all_dequeued_buckets(&self) -> Vec<DequeuedBucket> {
        let mut buckets: Vec<DequeuedBucket> = self.dequeued.values().cloned().collect();
        buckets.sort_by_key(|d| d.enqueued.sequence);
        buckets
    }

    pub fn enqueued_buckets(&self) -> &[EnqueuedBucket] {
        &self.enqueued
    }

    pub fn dequeued_bucket(&self, bucket_id: BucketId) -> Option<&DequeuedBucket> {
        self.dequeued.get(&bucket_id)
    }

    pub fn contains(&self, bucket_id: BucketId) -> bool {
        self.dequeued.contains_key(&bucket_id) || self.enqueued_ids.contains(&bucket_id)
    }

    pub fn counts_for_job(&self, job_id: &JobId) -> BucketCounts {
        BucketCounts {
            enqueued: self.enqueued.iter().filter(|e| &e.job.job_id == job_id).count(),
            dequeued: self.dequeued.values().filter(|d| d.job_id() == job_id).count(),
        }
    }

    pub fn counts(&self) -> BucketCounts {
        BucketCounts {
            enqueued: self.enqueued.len(),
            dequeued: self.dequeued.len(),
        }
    }
}

/// Single serialization point for queue state.
///
/// Every mutation runs to completion inside [`perform_exclusive`](Self::perform_exclusive)
/// or while an [`exclusive`](Self::exclusive) guard is held;
/// read-only queries share the lock with each other but never overlap a mutation.
#[derive(Debug, Default)]
pub struct BucketQueueHolder {
    state: RwLock<QueueState>,
}

impl BucketQueueHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with exclusive access to the whole queue state.
    pub async fn perform_exclusive<R>(&self, f: impl FnOnce(&mut QueueState) -> R) -> R {
        let mut state = self.state.write().await;
        f(&mut state)
    }

    /// Exclusive access that stays held across awaits, for mutations that
    /// must update other components before any other holder user runs.
    pub async fn exclusive(&self) -> RwLockWriteGuard<'_, QueueState> {
        self.state.write().await
    }

    /// Run `f` against a consistent read-only view of the queue state.
    pub async fn read<R>(&self, f: impl FnOnce(&QueueState) -> R) -> R {
        let state = self.state.read().await;
        f(&state)
    }

    pub async fn enqueue(&self, buckets: Vec<Bucket>, job: &PrioritizedJob) {
        self.perform_exclusive(|state| state.enqueue(buckets, job))
            .await
    }

    pub async fn dequeue(
        &self,
        worker_id: &WorkerId,
        capabilities: &[WorkerCapability],
        is_job_running: impl Fn(&JobId) -> bool,
    ) -> Option<DequeuedBucket> {
        self.perform_exclusive(|state| state.dequeue(worker_id, capabilities, is_job_running))
            .await
    }

    pub async fn complete(&self, bucket_id: BucketId, worker_id: &WorkerId) -> Completion {
        self.perform_exclusive(|state| state.complete(bucket_id, worker_id))
            .await
    }

    pub async fn remove(&self, dequeued: &DequeuedBucket) {
        self.perform_exclusive(|state| state.remove(dequeued)).await
    }

    pub async fn all_dequeued_buckets(&self) -> Vec<DequeuedBucket> {
        self.read(|state| state.all_dequeued_buckets()).await
    }

    pub async fn counts_for_job(&self, job_id: &JobId) -> BucketCounts {
        self.read(|state| state.counts_for_job(job_id)).await
    }
}
