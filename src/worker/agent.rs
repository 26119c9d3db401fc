//! The worker process loop: register, heartbeat, dequeue, execute, report.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::retry::run_retrying;
use crate::scheduler::assigner::DequeueResult;
use crate::scheduler::bucket::DequeuedBucket;
use crate::server::connection::QueueConnection;
use crate::worker::executor::TestExecutor;
use crate::worker::heartbeat::{HeartbeatSender, InProgressBuckets};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every job is depleted.
    QueueIsEmpty,
    Cancelled,
    /// The queue blocked this worker.
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentSummary {
    pub buckets_executed: usize,
    pub stop_reason: StopReason,
}

pub struct WorkerAgent {
    config: WorkerConfig,
    connection: Arc<dyn QueueConnection>,
    executor: Arc<dyn TestExecutor>,
    in_progress: InProgressBuckets,
}

impl WorkerAgent {
    pub fn new(
        config: WorkerConfig,
        connection: Arc<dyn QueueConnection>,
        executor: Arc<dyn TestExecutor>,
    ) -> Self {
        Self {
            config,
            connection,
            executor,
            in_progress: InProgressBuckets::default(),
        }
    }

    /// Work until the queue is empty, the worker is blocked, or `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<AgentSummary> {
        let worker_id = self.config.worker_id.clone();
        let configuration = match run_retrying(&self.config.report_retry, "register worker", || {
            self.connection.register_worker(&worker_id)
        })
        .await
        {
            Ok(configuration) => configuration,
            Err(e) => {
                tracing::error!(worker_id = %worker_id, error = %e, "Failed to register worker");
                return Err(e);
            }
        };
        tracing::info!(
            worker_id = %worker_id,
            report_alive_interval_ms = configuration.report_alive_interval_ms,
            "Worker registered with queue"
        );

        let agent_cancel = cancel.child_token();
        let heartbeat = {
            let sender = HeartbeatSender::new(Duration::from_millis(
                configuration.report_alive_interval_ms.max(1),
            ));
            let connection = self.connection.clone();
            let worker_id = worker_id.clone();
            let in_progress = self.in_progress.clone();
            let cancel = agent_cancel.clone();
            tokio::spawn(async move { sender.run(connection, worker_id, in_progress, cancel).await })
        };

        let fallback_delay = Duration::from_millis(configuration.check_again_after_ms.max(1));
        let mut buckets_executed = 0;
        let stop_reason = loop {
            let dequeued = tokio::select! {
                _ = agent_cancel.cancelled() => break self.cancel_reason(&cancel),
                result = self.connection.dequeue_bucket(&worker_id, &self.config.capabilities) => result,
            };

            let wait = match dequeued {
                Ok(DequeueResult::Dequeued { bucket }) => {
                    self.process(bucket).await;
                    buckets_executed += 1;
                    continue;
                }
                Ok(DequeueResult::QueueIsEmpty) => break StopReason::QueueIsEmpty,
                Ok(DequeueResult::CheckAgainLater { check_after_ms }) => {
                    Duration::from_millis(check_after_ms)
                }
                Ok(DequeueResult::WorkerNotAllowed { check_after_ms }) => {
                    tracing::debug!(worker_id = %worker_id, "Not allowed to work for this queue yet");
                    Duration::from_millis(check_after_ms)
                }
                Err(e) if e.is_worker_blocked() => break StopReason::Blocked,
                Err(e) => {
                    tracing::warn!(worker_id = %worker_id, error = %e, "Dequeue failed");
                    fallback_delay
                }
            };

            tokio::select! {
                _ = agent_cancel.cancelled() => break self.cancel_reason(&cancel),
                _ = tokio::time::sleep(wait) => {}
            }
        };

        agent_cancel.cancel();
        if let Err(e) = heartbeat.await {
            tracing::warn!(worker_id = %worker_id, error = %e, "Heartbeat task ended abnormally");
        }
        tracing::info!(
            worker_id = %worker_id,
            buckets_executed,
            reason = ?stop_reason,
            "Worker stopped"
        );
        Ok(AgentSummary {
            buckets_executed,
            stop_reason,
        })
    }

    /// The agent token fires on shutdown and when the heartbeat learns of a block.
    fn cancel_reason(&self, cancel: &CancellationToken) -> StopReason {
        if cancel.is_cancelled() {
            StopReason::Cancelled
        } else {
            StopReason::Blocked
        }
    }

    async fn process(&self, dequeued: DequeuedBucket) {
        let worker_id = &self.config.worker_id;
        let bucket_id = dequeued.bucket_id();
        self.in_progress.write().await.insert(bucket_id);

        let result = self.executor.execute_bucket(dequeued.bucket()).await;
        let reported = run_retrying(&self.config.report_retry, "report result", || {
            self.connection.report_result(worker_id, result.clone())
        })
        .await;
        match reported {
            Ok(outcome) => {
                tracing::debug!(worker_id = %worker_id, bucket_id = %bucket_id, outcome = ?outcome, "Result reported")
            }
            // The queue reclaims the bucket once heartbeats stop listing it.
            Err(e) => {
                tracing::error!(worker_id = %worker_id, bucket_id = %bucket_id, error = %e, "Giving up on reporting result")
            }
        }

        self.in_progress.write().await.remove(&bucket_id);
    }
}
