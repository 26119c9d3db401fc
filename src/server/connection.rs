//! Request/response types and the operations workers and clients call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::scheduler::assigner::DequeueResult;
use crate::scheduler::bucket::{
    BucketId, JobId, PrioritizedJob, TestEntryConfiguration, TestingResult, WorkerCapability,
    WorkerId,
};
use crate::scheduler::job::{JobResults, JobState};
use crate::scheduler::split::ScheduleStrategy;
use crate::worker::aliveness::WorkerStatusReport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleTestsRequest {
    pub prioritized_job: PrioritizedJob,
    #[serde(default)]
    pub schedule_strategy: ScheduleStrategy,
    pub test_entry_configurations: Vec<TestEntryConfiguration>,
    /// Resubmitting the same id for the same job enqueues nothing.
    pub request_id: String,
}

impl ScheduleTestsRequest {
    pub fn new(
        prioritized_job: PrioritizedJob,
        schedule_strategy: ScheduleStrategy,
        test_entry_configurations: Vec<TestEntryConfiguration>,
    ) -> Self {
        Self {
            prioritized_job,
            schedule_strategy,
            test_entry_configurations,
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleTestsResponse {
    pub job_id: JobId,
    /// False when the request id had already been accepted.
    pub enqueued: bool,
    pub bucket_ids: Vec<BucketId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterWorkerRequest {
    pub worker_id: WorkerId,
}

/// What a worker needs to know after registering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfiguration {
    pub report_alive_interval_ms: u64,
    pub check_again_after_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DequeueRequest {
    pub worker_id: WorkerId,
    #[serde(default)]
    pub capabilities: Vec<WorkerCapability>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportAliveRequest {
    pub worker_id: WorkerId,
    #[serde(default)]
    pub bucket_ids_being_processed: Vec<BucketId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportResultRequest {
    pub worker_id: WorkerId,
    pub testing_result: TestingResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReportResultOutcome {
    /// Results stored; `retried_entries` went back to the queue.
    Accepted { retried_entries: usize },
    /// The bucket is not dequeued to this worker (duplicate report, reclaimed
    /// bucket, or deleted job). Nothing changed.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStateReport {
    pub enqueued_buckets: usize,
    pub dequeued_buckets: usize,
    pub running_jobs: Vec<JobId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Operations of a queue server, in-process or remote.
#[async_trait]
pub trait QueueConnection: Send + Sync {
    async fn schedule_tests(&self, request: ScheduleTestsRequest) -> Result<ScheduleTestsResponse>;

    async fn register_worker(&self, worker_id: &WorkerId) -> Result<WorkerConfiguration>;

    async fn dequeue_bucket(
        &self,
        worker_id: &WorkerId,
        capabilities: &[WorkerCapability],
    ) -> Result<DequeueResult>;

    async fn report_alive(&self, worker_id: &WorkerId, bucket_ids: Vec<BucketId>) -> Result<()>;

    async fn report_result(
        &self,
        worker_id: &WorkerId,
        testing_result: TestingResult,
    ) -> Result<ReportResultOutcome>;

    async fn job_state(&self, job_id: &JobId) -> Result<JobState>;

    async fn job_results(&self, job_id: &JobId) -> Result<JobResults>;

    async fn delete_job(&self, job_id: &JobId) -> Result<()>;

    async fn block_worker(&self, worker_id: &WorkerId) -> Result<()>;

    async fn queue_state(&self) -> Result<QueueStateReport>;

    async fn worker_statuses(&self) -> Result<Vec<WorkerStatusReport>>;
}
