use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::scheduler::bucket::{BucketId, WorkerId};
use crate::server::connection::QueueConnection;

/// Buckets the worker is currently running, shared with the heartbeat task.
pub type InProgressBuckets = Arc<RwLock<HashSet<BucketId>>>;

/// Periodically tells the queue this worker is alive and what it is running.
pub struct HeartbeatSender {
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Report alive every interval until `cancel` fires.
    ///
    /// A blocked worker cancels `cancel` itself so the agent stops too.
    /// Other failures are logged and the next tick tries again.
    pub async fn run(
        &self,
        connection: Arc<dyn QueueConnection>,
        worker_id: WorkerId,
        in_progress: InProgressBuckets,
        cancel: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let bucket_ids: Vec<BucketId> = in_progress.read().await.iter().copied().collect();
            match connection.report_alive(&worker_id, bucket_ids).await {
                Ok(()) => {}
                Err(e) if e.is_worker_blocked() => {
                    tracing::warn!(worker_id = %worker_id, "Worker was blocked by the queue, stopping");
                    cancel.cancel();
                    break;
                }
                Err(e) => {
                    tracing::warn!(worker_id = %worker_id, error = %e, "Failed to report alive");
                }
            }
        }
        tracing::debug!(worker_id = %worker_id, "Heartbeat stopped");
    }
}
