use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scheduler::bucket::{
    DequeuedBucket, EnqueuedBucket, JobId, WorkerCapability, WorkerId,
};
use crate::scheduler::queue::{BucketQueueHolder, QueueState};
use crate::utilization::{WorkerUtilizationPermission, WorkerUtilizationStatusPoller};
use crate::worker::aliveness::WorkerAlivenessTracker;

/// Answer to a worker asking for work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DequeueResult {
    Dequeued { bucket: DequeuedBucket },
    /// Nothing eligible right now; ask again after the hint.
    CheckAgainLater { check_after_ms: u64 },
    /// All jobs are depleted; the worker may stop polling.
    QueueIsEmpty,
    /// The utilization gate does not currently let this queue use the worker.
    WorkerNotAllowed { check_after_ms: u64 },
}

/// What to tell a worker when no bucket is eligible for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NothingToDequeueBehavior {
    CheckLater { check_after: Duration },
    WaitForAllQueuesToDeplete { check_after: Duration },
}

impl NothingToDequeueBehavior {
    pub fn check_after(&self) -> Duration {
        match self {
            NothingToDequeueBehavior::CheckLater { check_after }
            | NothingToDequeueBehavior::WaitForAllQueuesToDeplete { check_after } => *check_after,
        }
    }

    pub fn response(&self, state: &QueueState) -> DequeueResult {
        let check_after_ms = self.check_after().as_millis() as u64;
        match self {
            NothingToDequeueBehavior::CheckLater { .. } => {
                DequeueResult::CheckAgainLater { check_after_ms }
            }
            NothingToDequeueBehavior::WaitForAllQueuesToDeplete { .. } => {
                if state.counts().is_depleted() {
                    DequeueResult::QueueIsEmpty
                } else {
                    DequeueResult::CheckAgainLater { check_after_ms }
                }
            }
        }
    }
}

/// Order two candidates: job group priority, then job priority, then FIFO.
fn compare_candidates(a: &EnqueuedBucket, b: &EnqueuedBucket) -> Ordering {
    a.job
        .job_group_priority
        .cmp(&b.job.job_group_priority)
        .then(a.job.job_priority.cmp(&b.job.job_priority))
        .then(b.sequence.cmp(&a.sequence))
}

/// Index of the bucket to hand out next, if any is eligible.
pub fn select_bucket_index(
    enqueued: &[EnqueuedBucket],
    capabilities: &[WorkerCapability],
    is_job_running: impl Fn(&JobId) -> bool,
) -> Option<usize> {
    enqueued
        .iter()
        .enumerate()
        .filter(|(_, e)| is_job_running(&e.job.job_id) && e.bucket.can_be_run_by(capabilities))
        .max_by(|(_, a), (_, b)| compare_candidates(a, b))
        .map(|(index, _)| index)
}

/// Picks buckets for workers that are allowed to work for this queue.
pub struct DequeueScheduler {
    holder: Arc<BucketQueueHolder>,
    aliveness: Arc<WorkerAlivenessTracker>,
    utilization: Arc<WorkerUtilizationStatusPoller>,
    nothing_to_dequeue: NothingToDequeueBehavior,
}

impl DequeueScheduler {
    pub fn new(
        holder: Arc<BucketQueueHolder>,
        aliveness: Arc<WorkerAlivenessTracker>,
        utilization: Arc<WorkerUtilizationStatusPoller>,
        nothing_to_dequeue: NothingToDequeueBehavior,
    ) -> Self {
        Self {
            holder,
            aliveness,
            utilization,
            nothing_to_dequeue,
        }
    }

    /// Hand the best eligible bucket to `worker_id`, or tell it when to come back.
    ///
    /// Never blocks waiting for work to appear.
    pub async fn dequeue(
        &self,
        worker_id: &WorkerId,
        capabilities: &[WorkerCapability],
        running_jobs: &HashSet<JobId>,
    ) -> DequeueResult {
        let permission = self
            .utilization
            .utilization_permission_for_worker(worker_id)
            .await;
        if permission == WorkerUtilizationPermission::NotAllowedToUtilize {
            tracing::debug!(worker_id = %worker_id, "Worker is not allowed to be utilized");
            return DequeueResult::WorkerNotAllowed {
                check_after_ms: self.nothing_to_dequeue.check_after().as_millis() as u64,
            };
        }

        let mut state = self.holder.exclusive().await;
        let Some(bucket) =
            state.dequeue(worker_id, capabilities, |job_id| running_jobs.contains(job_id))
        else {
            return self.nothing_to_dequeue.response(&state);
        };
        // The tracker learns about the bucket before the holder is released, so
        // a stuck-bucket scan never sees it dequeued but unaccounted for.
        self.aliveness
            .did_dequeue_bucket(worker_id, bucket.bucket_id())
            .await;
        drop(state);

        tracing::info!(
            worker_id = %worker_id,
            bucket_id = %bucket.bucket_id(),
            job_id = %bucket.job_id(),
            tests = bucket.bucket().test_entries().len(),
            "Bucket dequeued"
        );
        DequeueResult::Dequeued { bucket }
    }
}
