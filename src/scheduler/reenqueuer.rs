//! Reclaims buckets whose worker died or forgot about them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::scheduler::bucket::{Bucket, BucketId, DequeuedBucket, WorkerId};
use crate::scheduler::queue::{BucketQueueHolder, QueueState};
use crate::scheduler::split::BucketEnqueuer;
use crate::worker::aliveness::{AlivenessSnapshot, WorkerAliveness, WorkerAlivenessTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StuckBucketReason {
    /// The worker stopped sending heartbeats.
    WorkerIsSilent,
    /// The worker is alive but no longer reports the bucket as in progress.
    BucketLost,
}

impl std::fmt::Display for StuckBucketReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StuckBucketReason::WorkerIsSilent => write!(f, "worker is silent"),
            StuckBucketReason::BucketLost => write!(f, "worker lost track of bucket"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuckBucket {
    pub reason: StuckBucketReason,
    pub bucket: DequeuedBucket,
    pub worker_id: WorkerId,
    /// Ids of the unary buckets enqueued in its place. Empty if enqueueing failed.
    pub replacement_ids: Vec<BucketId>,
}

/// Decide whether a dequeued bucket is stuck.
///
/// Workers that are neither in working condition nor silent (blocked or
/// unknown) are left alone.
pub fn classify(dequeued: &DequeuedBucket, aliveness: &WorkerAliveness) -> Option<StuckBucketReason> {
    if aliveness.is_in_working_condition {
        if aliveness
            .bucket_ids_being_processed
            .contains(&dequeued.bucket_id())
        {
            None
        } else {
            Some(StuckBucketReason::BucketLost)
        }
    } else if aliveness.silent {
        Some(StuckBucketReason::WorkerIsSilent)
    } else {
        None
    }
}

/// One bucket per test entry, each with a fresh id.
fn unary_replacements(bucket: &Bucket) -> Vec<Bucket> {
    bucket
        .test_entries()
        .iter()
        .filter_map(|entry| {
            bucket
                .with_test_entries(BucketId::generate(), vec![entry.clone()])
                .ok()
        })
        .collect()
}

/// Classify, remove and replace stuck buckets. Must run inside the holder's
/// exclusive scope so no job looks depleted between removal and re-enqueue.
pub fn reenqueue_in(
    state: &mut QueueState,
    snapshot: &AlivenessSnapshot,
    enqueuer: &dyn BucketEnqueuer,
) -> Vec<StuckBucket> {
    let mut stuck = Vec::new();
    for dequeued in state.all_dequeued_buckets() {
        if dequeued.dequeued_at >= snapshot.taken_at() {
            continue;
        }
        let aliveness = snapshot.aliveness_for_worker(&dequeued.worker_id);
        let Some(reason) = classify(&dequeued, &aliveness) else {
            continue;
        };
        state.remove(&dequeued);

        let replacements = unary_replacements(dequeued.bucket());
        let replacement_ids: Vec<BucketId> = replacements.iter().map(Bucket::bucket_id).collect();
        let replacement_ids = match enqueuer.enqueue(state, replacements, &dequeued.enqueued.job) {
            Ok(()) => replacement_ids,
            Err(e) => {
                tracing::error!(
                    bucket_id = %dequeued.bucket_id(),
                    job_id = %dequeued.job_id(),
                    error = %e,
                    "Failed to reenqueue stuck bucket"
                );
                Vec::new()
            }
        };
        stuck.push(StuckBucket {
            reason,
            worker_id: dequeued.worker_id.clone(),
            bucket: dequeued,
            replacement_ids,
        });
    }
    stuck
}

/// Periodic pass over dequeued buckets.
pub struct StuckBucketsReenqueuer {
    holder: Arc<BucketQueueHolder>,
    enqueuer: Arc<dyn BucketEnqueuer>,
    aliveness: Arc<WorkerAlivenessTracker>,
}

impl StuckBucketsReenqueuer {
    pub fn new(
        holder: Arc<BucketQueueHolder>,
        enqueuer: Arc<dyn BucketEnqueuer>,
        aliveness: Arc<WorkerAlivenessTracker>,
    ) -> Self {
        Self {
            holder,
            enqueuer,
            aliveness,
        }
    }

    pub async fn reenqueue_stuck_buckets(&self) -> Vec<StuckBucket> {
        // Snapshot under the holder so every dequeue it can see is already
        // recorded by the tracker.
        let stuck = {
            let mut state = self.holder.exclusive().await;
            let snapshot = self.aliveness.snapshot().await;
            reenqueue_in(&mut state, &snapshot, self.enqueuer.as_ref())
        };

        for s in &stuck {
            let replacements: Vec<String> = s.replacement_ids.iter().map(|id| id.to_string()).collect();
            tracing::warn!(
                bucket_id = %s.bucket.bucket_id(),
                job_id = %s.bucket.job_id(),
                worker_id = %s.worker_id,
                reason = %s.reason,
                replacement_ids = ?replacements,
                "Reenqueued stuck bucket"
            );
            self.aliveness
                .bucket_completed(&s.worker_id, s.bucket.bucket_id())
                .await;
        }
        stuck
    }
}
