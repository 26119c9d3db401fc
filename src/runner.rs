//! Client flow: schedule tests, wait until the job is depleted, collect
//! results, delete the job.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::RunnerConfig;
use crate::error::{QueueError, Result};
use crate::retry::run_retrying;
use crate::scheduler::bucket::{JobId, PrioritizedJob, TestEntry, TestEntryConfiguration, TestName};
use crate::scheduler::job::{JobResults, JobState};
use crate::scheduler::split::ScheduleStrategy;
use crate::server::connection::{QueueConnection, ScheduleTestsRequest};

/// Lists the tests that actually exist in the build under test.
#[async_trait]
pub trait TestDiscoverer: Send + Sync {
    async fn discover(&self) -> Result<Vec<TestEntry>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub job_id: JobId,
    pub results: JobResults,
    /// Requested tests the discoverer did not find; never scheduled.
    pub unavailable_tests: Vec<TestEntry>,
}

pub struct TestRunner {
    connection: Arc<dyn QueueConnection>,
    config: RunnerConfig,
    discoverer: Option<Arc<dyn TestDiscoverer>>,
}

impl TestRunner {
    pub fn new(connection: Arc<dyn QueueConnection>, config: RunnerConfig) -> Self {
        Self {
            connection,
            config,
            discoverer: None,
        }
    }

    pub fn with_discoverer(mut self, discoverer: Arc<dyn TestDiscoverer>) -> Self {
        self.discoverer = Some(discoverer);
        self
    }

    /// Drop requested tests that the runtime does not have.
    async fn filter_available(
        &self,
        configurations: Vec<TestEntryConfiguration>,
    ) -> Result<(Vec<TestEntryConfiguration>, Vec<TestEntry>)> {
        let Some(discoverer) = &self.discoverer else {
            return Ok((configurations, Vec::new()));
        };
        let available: HashSet<TestName> =
            run_retrying(&self.config.discovery_retry, "discover tests", || {
                discoverer.discover()
            })
            .await?
            .iter()
            .map(TestEntry::test_name)
            .collect();

        let (present, missing): (Vec<_>, Vec<_>) = configurations
            .into_iter()
            .partition(|c| available.contains(&c.test_entry.test_name()));
        let missing: Vec<TestEntry> = missing.into_iter().map(|c| c.test_entry).collect();
        if !missing.is_empty() {
            tracing::warn!(
                unavailable = missing.len(),
                "Some requested tests are not available in the runtime"
            );
        }
        Ok((present, missing))
    }

    /// Run the whole flow. The job is deleted on the way out whenever it was
    /// scheduled, including on failure and cancellation.
    pub async fn run(
        &self,
        job: PrioritizedJob,
        strategy: ScheduleStrategy,
        configurations: Vec<TestEntryConfiguration>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let (configurations, unavailable_tests) = self.filter_available(configurations).await?;
        if configurations.is_empty() {
            return Err(QueueError::InvalidRequest(
                "none of the requested tests can be scheduled".to_string(),
            ));
        }

        let job_id = job.job_id.clone();
        let request = ScheduleTestsRequest::new(job, strategy, configurations);
        let scheduled = self.connection.schedule_tests(request).await?;
        tracing::info!(
            job_id = %job_id,
            buckets = scheduled.bucket_ids.len(),
            "Job scheduled, waiting for results"
        );

        let outcome = self.collect(&job_id, &cancel).await;

        if let Err(e) = self.connection.delete_job(&job_id).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to delete job");
        }

        Ok(RunOutcome {
            job_id,
            results: outcome?,
            unavailable_tests,
        })
    }

    async fn collect(&self, job_id: &JobId, cancel: &CancellationToken) -> Result<JobResults> {
        self.wait_for_depletion(job_id, cancel).await?;
        self.connection.job_results(job_id).await
    }

    /// Poll the job state until nothing of it is enqueued or dequeued.
    ///
    /// Cancellation interrupts both the pause between polls and a state
    /// request that is still in flight.
    pub async fn wait_for_depletion(&self, job_id: &JobId, cancel: &CancellationToken) -> Result<()> {
        loop {
            let state = tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled(job_id)),
                state = self.connection.job_state(job_id) => state,
            };
            match state {
                Ok(state) if state.is_depleted() => return Ok(()),
                Ok(JobState::Deleted) => return Err(QueueError::JobDeleted(job_id.clone())),
                Ok(state) => tracing::debug!(job_id = %job_id, state = %state, "Job still running"),
                Err(e) if e.is_transient() => {
                    tracing::warn!(job_id = %job_id, error = %e, "Failed to fetch job state");
                }
                Err(e) => return Err(e),
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled(job_id)),
                _ = tokio::time::sleep(self.config.job_poll_interval) => {}
            }
        }
    }
}

fn cancelled(job_id: &JobId) -> QueueError {
    QueueError::Internal(format!("waiting for job {} was cancelled", job_id))
}
