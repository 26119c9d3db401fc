use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::QueueServerConfig;
use crate::error::{QueueError, Result};
use crate::scheduler::assigner::{DequeueResult, DequeueScheduler};
use crate::scheduler::bucket::{
    BucketId, DequeuedBucket, JobId, TestEntry, TestEntryResult, TestName, TestOutcome,
    TestingResult, WorkerCapability, WorkerId,
};
use crate::scheduler::job::{JobRegistry, JobResults, JobState, Registration};
use crate::scheduler::queue::{BucketQueueHolder, Completion, QueueState};
use crate::scheduler::reenqueuer::{StuckBucket, StuckBucketsReenqueuer};
use crate::scheduler::split::{BucketEnqueuer, BucketSplitInfo, QueueBucketEnqueuer};
use crate::server::connection::{
    QueueConnection, QueueStateReport, ReportResultOutcome, ScheduleTestsRequest,
    ScheduleTestsResponse, WorkerConfiguration,
};
use crate::utilization::WorkerUtilizationStatusPoller;
use crate::worker::aliveness::{WorkerAlivenessTracker, WorkerStatus, WorkerStatusReport};

/// The queue server: composes the holder, registry, scheduler, aliveness
/// tracker and reenqueuer behind one set of operations.
///
/// Lock order is registry, then holder, then the aliveness tracker. Nothing
/// takes them the other way round.
pub struct QueueServer {
    config: QueueServerConfig,
    holder: Arc<BucketQueueHolder>,
    registry: RwLock<JobRegistry>,
    enqueuer: Arc<dyn BucketEnqueuer>,
    scheduler: DequeueScheduler,
    aliveness: Arc<WorkerAlivenessTracker>,
    utilization: Arc<WorkerUtilizationStatusPoller>,
    reenqueuer: StuckBucketsReenqueuer,
}

/// What a completed bucket turned into.
struct CompletedBucket {
    dequeued: DequeuedBucket,
    final_results: Vec<TestEntryResult>,
    retried_entries: usize,
}

impl QueueServer {
    pub fn new(config: QueueServerConfig, utilization: Arc<WorkerUtilizationStatusPoller>) -> Self {
        Self::with_enqueuer(config, utilization, Arc::new(QueueBucketEnqueuer))
    }

    pub fn with_enqueuer(
        config: QueueServerConfig,
        utilization: Arc<WorkerUtilizationStatusPoller>,
        enqueuer: Arc<dyn BucketEnqueuer>,
    ) -> Self {
        let holder = Arc::new(BucketQueueHolder::new());
        let aliveness = Arc::new(WorkerAlivenessTracker::new(
            config.worker_silence_timeout,
            config.dequeue_grace_period,
        ));
        let scheduler = DequeueScheduler::new(
            holder.clone(),
            aliveness.clone(),
            utilization.clone(),
            config.nothing_to_dequeue_behavior(),
        );
        let reenqueuer =
            StuckBucketsReenqueuer::new(holder.clone(), enqueuer.clone(), aliveness.clone());
        Self {
            config,
            holder,
            registry: RwLock::new(JobRegistry::new()),
            enqueuer,
            scheduler,
            aliveness,
            utilization,
            reenqueuer,
        }
    }

    pub fn config(&self) -> &QueueServerConfig {
        &self.config
    }

    pub fn holder(&self) -> &Arc<BucketQueueHolder> {
        &self.holder
    }

    pub fn aliveness(&self) -> &Arc<WorkerAlivenessTracker> {
        &self.aliveness
    }

    pub fn utilization(&self) -> &Arc<WorkerUtilizationStatusPoller> {
        &self.utilization
    }

    /// Concurrency hint for splitting: the permitted worker set if the gate
    /// restricts it, else the number of healthy workers.
    async fn split_info(&self) -> BucketSplitInfo {
        let workers = match self.utilization.permitted_worker_count().await {
            Some(count) => count,
            None => self
                .aliveness
                .worker_statuses()
                .await
                .iter()
                .filter(|w| w.status == WorkerStatus::Healthy)
                .count(),
        };
        BucketSplitInfo::new(workers)
    }

    pub async fn schedule_tests(
        &self,
        request: ScheduleTestsRequest,
    ) -> Result<ScheduleTestsResponse> {
        if request.test_entry_configurations.is_empty() {
            return Err(QueueError::InvalidRequest(
                "no test entries to schedule".to_string(),
            ));
        }
        let job_id = request.prioritized_job.job_id.clone();
        let info = self.split_info().await;

        let mut registry = self.registry.write().await;
        let registration = registry.register(&request.prioritized_job, &request.request_id)?;
        if registration == Registration::DuplicateRequest {
            tracing::info!(
                job_id = %job_id,
                request_id = %request.request_id,
                "Duplicate schedule request ignored"
            );
            return Ok(ScheduleTestsResponse {
                job_id,
                enqueued: false,
                bucket_ids: Vec::new(),
            });
        }
        let job = registry.job(&job_id)?.job.clone();

        let enqueued = self
            .holder
            .perform_exclusive(|state| {
                self.enqueuer.enqueue_tests(
                    state,
                    &job,
                    request.schedule_strategy,
                    &request.test_entry_configurations,
                    &info,
                )
            })
            .await;

        match enqueued {
            Ok(bucket_ids) => {
                tracing::info!(
                    job_id = %job_id,
                    tests = request.test_entry_configurations.len(),
                    buckets = bucket_ids.len(),
                    strategy = ?request.schedule_strategy,
                    "Tests scheduled"
                );
                Ok(ScheduleTestsResponse {
                    job_id,
                    enqueued: true,
                    bucket_ids,
                })
            }
            Err(e) => {
                registry.abandon_request(&job_id, &request.request_id, registration);
                tracing::error!(job_id = %job_id, error = %e, "Failed to schedule tests");
                Err(e)
            }
        }
    }

    pub async fn register_worker(&self, worker_id: &WorkerId) -> Result<WorkerConfiguration> {
        if !self.aliveness.did_register_worker(worker_id).await {
            return Err(QueueError::WorkerBlocked(worker_id.clone()));
        }
        Ok(WorkerConfiguration {
            report_alive_interval_ms: self.config.report_alive_interval.as_millis() as u64,
            check_again_after_ms: self.config.check_again_after.as_millis() as u64,
        })
    }

    pub async fn dequeue_bucket(
        &self,
        worker_id: &WorkerId,
        capabilities: &[WorkerCapability],
    ) -> Result<DequeueResult> {
        if self.aliveness.is_blocked(worker_id).await {
            return Err(QueueError::WorkerBlocked(worker_id.clone()));
        }
        // Held across the dequeue so a job cannot be deleted in between.
        let registry = self.registry.read().await;
        let running = registry.running_job_ids();
        Ok(self
            .scheduler
            .dequeue(worker_id, capabilities, &running)
            .await)
    }

    pub async fn report_alive(&self, worker_id: &WorkerId, bucket_ids: Vec<BucketId>) -> Result<()> {
        let bucket_ids: HashSet<BucketId> = bucket_ids.into_iter().collect();
        if !self.aliveness.report_alive(worker_id, bucket_ids).await {
            return Err(QueueError::WorkerBlocked(worker_id.clone()));
        }
        Ok(())
    }

    /// Accept a worker's results for a bucket it holds.
    ///
    /// Failed entries with retries left go back to the queue as unary buckets
    /// in the same holder scope; everything else is recorded as final.
    pub async fn report_result(
        &self,
        worker_id: &WorkerId,
        testing_result: TestingResult,
    ) -> Result<ReportResultOutcome> {
        let bucket_id = testing_result.bucket_id;
        let mut registry = self.registry.write().await;

        let completed = self
            .holder
            .perform_exclusive(|state| {
                match state.complete(bucket_id, worker_id) {
                    Completion::Completed(dequeued) => {
                        Some(self.settle(state, dequeued, testing_result.results))
                    }
                    Completion::NotDequeued => {
                        tracing::warn!(
                            worker_id = %worker_id,
                            bucket_id = %bucket_id,
                            "Result for a bucket that is not dequeued, ignoring"
                        );
                        None
                    }
                    Completion::OwnedByAnotherWorker(owner) => {
                        tracing::warn!(
                            worker_id = %worker_id,
                            owner = %owner,
                            bucket_id = %bucket_id,
                            "Result for a bucket dequeued to another worker, ignoring"
                        );
                        None
                    }
                }
            })
            .await;

        let Some(completed) = completed else {
            return Ok(ReportResultOutcome::Ignored);
        };
        let job_id = completed.dequeued.job_id().clone();
        if !completed.final_results.is_empty() {
            let recorded = registry.record_result(
                &job_id,
                TestingResult {
                    bucket_id,
                    results: completed.final_results,
                },
            );
            if !recorded {
                tracing::warn!(job_id = %job_id, bucket_id = %bucket_id, "Results were not recorded");
            }
        }
        drop(registry);

        tracing::info!(
            worker_id = %worker_id,
            bucket_id = %bucket_id,
            job_id = %job_id,
            retried_entries = completed.retried_entries,
            "Bucket completed"
        );
        self.aliveness.bucket_completed(worker_id, bucket_id).await;
        Ok(ReportResultOutcome::Accepted {
            retried_entries: completed.retried_entries,
        })
    }

    /// Match reported results to the bucket's entries by test name.
    ///
    /// The first result per entry wins. Results for tests outside the bucket
    /// are dropped, and entries nobody reported on are lost.
    fn reconcile(dequeued: &DequeuedBucket, reported: Vec<TestEntryResult>) -> Vec<TestEntryResult> {
        let bucket = dequeued.bucket();
        let expected: HashSet<TestName> =
            bucket.test_entries().iter().map(TestEntry::test_name).collect();
        let mut by_name: HashMap<TestName, TestEntryResult> = HashMap::new();
        for result in reported {
            let name = result.test_entry.test_name();
            if !expected.contains(&name) {
                tracing::warn!(
                    worker_id = %dequeued.worker_id,
                    bucket_id = %dequeued.bucket_id(),
                    test = %name,
                    "Result for a test that is not in the bucket, dropping"
                );
                continue;
            }
            match by_name.entry(name) {
                Entry::Vacant(slot) => {
                    slot.insert(result);
                }
                Entry::Occupied(slot) => {
                    tracing::warn!(
                        worker_id = %dequeued.worker_id,
                        bucket_id = %dequeued.bucket_id(),
                        test = %slot.key(),
                        "Duplicate result for a test, keeping the first"
                    );
                }
            }
        }

        bucket
            .test_entries()
            .iter()
            .map(|entry| match by_name.remove(&entry.test_name()) {
                Some(result) => TestEntryResult {
                    test_entry: entry.clone(),
                    ..result
                },
                None => TestEntryResult {
                    test_entry: entry.clone(),
                    outcome: TestOutcome::Lost,
                    duration_ms: 0,
                    message: Some("no result reported".to_string()),
                },
            })
            .collect()
    }

    /// Split reported results into final ones and retries, enqueueing retries.
    fn settle(
        &self,
        state: &mut QueueState,
        dequeued: DequeuedBucket,
        reported: Vec<TestEntryResult>,
    ) -> CompletedBucket {
        let results = Self::reconcile(&dequeued, reported);
        let bucket = dequeued.bucket();

        let (retry, mut final_results): (Vec<TestEntryResult>, Vec<TestEntryResult>) = results
            .into_iter()
            .partition(|r| !r.succeeded() && bucket.has_retries_left());

        let mut retried_entries = 0;
        if !retry.is_empty() {
            let retries = retry
                .iter()
                .map(|r| bucket.retrying(BucketId::generate(), r.test_entry.clone()))
                .collect();
            match self.enqueuer.enqueue(state, retries, &dequeued.enqueued.job) {
                Ok(()) => retried_entries = retry.len(),
                Err(e) => {
                    tracing::error!(
                        bucket_id = %dequeued.bucket_id(),
                        error = %e,
                        "Failed to enqueue retries, recording failures as final"
                    );
                    final_results.extend(retry);
                }
            }
        }

        CompletedBucket {
            dequeued,
            final_results,
            retried_entries,
        }
    }

    pub async fn job_state(&self, job_id: &JobId) -> Result<JobState> {
        let registry = self.registry.read().await;
        let counts = self.holder.counts_for_job(job_id).await;
        registry.job_state(job_id, counts)
    }

    pub async fn job_results(&self, job_id: &JobId) -> Result<JobResults> {
        self.registry.read().await.results(job_id)
    }

    /// Delete a job and purge its buckets. Deleting twice is fine.
    pub async fn delete_job(&self, job_id: &JobId) -> Result<()> {
        let mut registry = self.registry.write().await;
        if registry.delete(job_id)? {
            let removed = self
                .holder
                .perform_exclusive(|state| state.remove_job(job_id))
                .await;
            tracing::info!(
                job_id = %job_id,
                enqueued = removed.enqueued,
                dequeued = removed.dequeued,
                "Purged buckets of deleted job"
            );
        }
        Ok(())
    }

    pub async fn block_worker(&self, worker_id: &WorkerId) {
        self.aliveness.block_worker(worker_id).await;
    }

    pub async fn queue_state(&self) -> QueueStateReport {
        let registry = self.registry.read().await;
        let counts = self.holder.read(|state| state.counts()).await;
        let mut running_jobs: Vec<JobId> = registry.running_job_ids().into_iter().collect();
        running_jobs.sort();
        QueueStateReport {
            enqueued_buckets: counts.enqueued,
            dequeued_buckets: counts.dequeued,
            running_jobs,
        }
    }

    pub async fn worker_statuses(&self) -> Vec<WorkerStatusReport> {
        self.aliveness.worker_statuses().await
    }

    pub async fn reenqueue_stuck_buckets(&self) -> Vec<StuckBucket> {
        self.reenqueuer.reenqueue_stuck_buckets().await
    }
}

#[async_trait]
impl QueueConnection for QueueServer {
    async fn schedule_tests(&self, request: ScheduleTestsRequest) -> Result<ScheduleTestsResponse> {
        QueueServer::schedule_tests(self, request).await
    }

    async fn register_worker(&self, worker_id: &WorkerId) -> Result<WorkerConfiguration> {
        QueueServer::register_worker(self, worker_id).await
    }

    async fn dequeue_bucket(
        &self,
        worker_id: &WorkerId,
        capabilities: &[WorkerCapability],
    ) -> Result<DequeueResult> {
        QueueServer::dequeue_bucket(self, worker_id, capabilities).await
    }

    async fn report_alive(&self, worker_id: &WorkerId, bucket_ids: Vec<BucketId>) -> Result<()> {
        QueueServer::report_alive(self, worker_id, bucket_ids).await
    }

    async fn report_result(
        &self,
        worker_id: &WorkerId,
        testing_result: TestingResult,
    ) -> Result<ReportResultOutcome> {
        QueueServer::report_result(self, worker_id, testing_result).await
    }

    async fn job_state(&self, job_id: &JobId) -> Result<JobState> {
        QueueServer::job_state(self, job_id).await
    }

    async fn job_results(&self, job_id: &JobId) -> Result<JobResults> {
        QueueServer::job_results(self, job_id).await
    }

    async fn delete_job(&self, job_id: &JobId) -> Result<()> {
        QueueServer::delete_job(self, job_id).await
    }

    async fn block_worker(&self, worker_id: &WorkerId) -> Result<()> {
        QueueServer::block_worker(self, worker_id).await;
        Ok(())
    }

    async fn queue_state(&self) -> Result<QueueStateReport> {
        Ok(QueueServer::queue_state(self).await)
    }

    async fn worker_statuses(&self) -> Result<Vec<WorkerStatusReport>> {
        Ok(QueueServer::worker_statuses(self).await)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::scheduler::bucket::{PrioritizedJob, Priority, TestEntryConfiguration};
    use crate::scheduler::split::ScheduleStrategy;

    fn server() -> QueueServer {
        QueueServer::new(
            QueueServerConfig::default().with_check_again_after(Duration::from_secs(1)),
            Arc::new(WorkerUtilizationStatusPoller::unrestricted()),
        )
    }

    fn request(job: &str, tests: &[&str], retries: u32) -> ScheduleTestsRequest {
        let configurations = tests
            .iter()
            .map(|t| {
                let mut c = TestEntryConfiguration::new(TestEntry::new("Suite", *t));
                c.execution.number_of_retries = retries;
                c
            })
            .collect();
        ScheduleTestsRequest::new(
            PrioritizedJob::standalone(JobId::new(job), Priority::default()),
            ScheduleStrategy::Individual,
            configurations,
        )
    }

    fn failed(entry: &TestEntry) -> TestEntryResult {
        TestEntryResult {
            test_entry: entry.clone(),
            outcome: TestOutcome::Failed,
            duration_ms: 1,
            message: Some("boom".to_string()),
        }
    }

    async fn dequeue(server: &QueueServer, worker: &WorkerId) -> DequeuedBucket {
        match server.dequeue_bucket(worker, &[]).await.unwrap() {
            DequeueResult::Dequeued { bucket } => bucket,
            other => panic!("expected a bucket, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_schedule_is_rejected() {
        let err = server().schedule_tests(request("j", &[], 0)).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn duplicate_request_id_enqueues_once() {
        let server = server();
        let req = request("j", &["a", "b"], 0);
        assert!(server.schedule_tests(req.clone()).await.unwrap().enqueued);
        let again = server.schedule_tests(req).await.unwrap();
        assert!(!again.enqueued);
        assert_eq!(server.queue_state().await.enqueued_buckets, 2);
    }

    #[tokio::test]
    async fn failed_entry_is_retried_through_the_queue() {
        let server = server();
        server.schedule_tests(request("j", &["a"], 1)).await.unwrap();
        let w = WorkerId::new("w");

        let first = dequeue(&server, &w).await;
        let entry = first.bucket().test_entries()[0].clone();
        let outcome = server
            .report_result(
                &w,
                TestingResult {
                    bucket_id: first.bucket_id(),
                    results: vec![failed(&entry)],
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, ReportResultOutcome::Accepted { retried_entries: 1 });
        assert!(!server.job_state(&JobId::new("j")).await.unwrap().is_depleted());
        assert!(server
            .job_results(&JobId::new("j"))
            .await
            .unwrap()
            .testing_results
            .is_empty());

        let retry = dequeue(&server, &w).await;
        assert_eq!(retry.bucket().retry_attempt(), 1);
        server
            .report_result(
                &w,
                TestingResult {
                    bucket_id: retry.bucket_id(),
                    results: vec![failed(&entry)],
                },
            )
            .await
            .unwrap();
        assert!(server.job_state(&JobId::new("j")).await.unwrap().is_depleted());
    }

    #[tokio::test]
    async fn missing_entries_are_recorded_as_lost() {
        let server = server();
        let mut req = request("j", &["a", "b"], 0);
        req.schedule_strategy = ScheduleStrategy::Unsplit;
        server.schedule_tests(req).await.unwrap();
        let w = WorkerId::new("w");
        let bucket = dequeue(&server, &w).await;

        server
            .report_result(
                &w,
                TestingResult {
                    bucket_id: bucket.bucket_id(),
                    results: Vec::new(),
                },
            )
            .await
            .unwrap();
        let results = server.job_results(&JobId::new("j")).await.unwrap();
        let outcomes: Vec<TestOutcome> = results.testing_results[0]
            .results
            .iter()
            .map(|r| r.outcome)
            .collect();
        assert_eq!(outcomes, vec![TestOutcome::Lost, TestOutcome::Lost]);
    }

    #[tokio::test]
    async fn foreign_and_duplicate_results_are_dropped() {
        let server = server();
        server.schedule_tests(request("j", &["a"], 1)).await.unwrap();
        let w = WorkerId::new("w");
        let bucket = dequeue(&server, &w).await;
        let entry = bucket.bucket().test_entries()[0].clone();

        let outcome = server
            .report_result(
                &w,
                TestingResult {
                    bucket_id: bucket.bucket_id(),
                    results: vec![
                        failed(&entry),
                        failed(&entry),
                        failed(&TestEntry::new("Suite", "injected")),
                    ],
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome, ReportResultOutcome::Accepted { retried_entries: 1 });
        assert_eq!(server.queue_state().await.enqueued_buckets, 1);
        let retry = dequeue(&server, &w).await;
        assert_eq!(retry.bucket().test_entries(), &[entry]);
    }

    #[tokio::test]
    async fn results_are_matched_by_test_name() {
        let server = server();
        server.schedule_tests(request("j", &["a"], 0)).await.unwrap();
        let w = WorkerId::new("w");
        let bucket = dequeue(&server, &w).await;
        let entry = bucket.bucket().test_entries()[0].clone();

        let mut reported = TestEntry::new("Suite", "a");
        reported.tags = vec!["smoke".to_string()];
        reported.case_id = Some(7);
        server
            .report_result(
                &w,
                TestingResult {
                    bucket_id: bucket.bucket_id(),
                    results: vec![TestEntryResult {
                        test_entry: reported,
                        outcome: TestOutcome::Passed,
                        duration_ms: 3,
                        message: None,
                    }],
                },
            )
            .await
            .unwrap();

        let results = server.job_results(&JobId::new("j")).await.unwrap();
        assert_eq!(results.testing_results.len(), 1);
        let recorded = &results.testing_results[0].results;
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].outcome, TestOutcome::Passed);
        assert_eq!(recorded[0].duration_ms, 3);
        assert_eq!(recorded[0].test_entry, entry);
    }

    #[tokio::test]
    async fn blocked_worker_cannot_dequeue_or_register() {
        let server = server();
        let w = WorkerId::new("w");
        server.block_worker(&w).await;
        assert!(matches!(
            server.dequeue_bucket(&w, &[]).await,
            Err(QueueError::WorkerBlocked(_))
        ));
        assert!(matches!(
            server.register_worker(&w).await,
            Err(QueueError::WorkerBlocked(_))
        ));
    }

    #[tokio::test]
    async fn deleted_job_cannot_be_extended() {
        let server = server();
        server.schedule_tests(request("j", &["a"], 0)).await.unwrap();
        server.delete_job(&JobId::new("j")).await.unwrap();
        server.delete_job(&JobId::new("j")).await.unwrap();
        assert!(matches!(
            server.schedule_tests(request("j", &["b"], 0)).await,
            Err(QueueError::JobDeleted(_))
        ));
        assert_eq!(
            server.job_state(&JobId::new("j")).await.unwrap(),
            JobState::Deleted
        );
    }
}
