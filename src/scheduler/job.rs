use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};
use crate::scheduler::bucket::{BucketId, JobId, PrioritizedJob, TestingResult};
use crate::scheduler::queue::BucketCounts;

/// Externally visible job state. Depletion is derived from the queue, not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobState {
    Running {
        is_depleted: bool,
        enqueued_buckets: usize,
        dequeued_buckets: usize,
    },
    Deleted,
}

impl JobState {
    pub fn is_depleted(&self) -> bool {
        matches!(self, JobState::Running { is_depleted: true, .. })
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Running {
                is_depleted: true, ..
            } => write!(f, "depleted"),
            JobState::Running {
                enqueued_buckets,
                dequeued_buckets,
                ..
            } => write!(
                f,
                "running ({} enqueued, {} dequeued)",
                enqueued_buckets, dequeued_buckets
            ),
            JobState::Deleted => write!(f, "deleted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResults {
    pub job_id: JobId,
    pub testing_results: Vec<TestingResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First submission for this job id.
    NewJob,
    /// More tests for a job that already runs.
    ExistingJob,
    /// This request id was already accepted; nothing should be enqueued.
    DuplicateRequest,
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job: PrioritizedJob,
    pub created_at: DateTime<Utc>,
    results: Vec<TestingResult>,
    result_bucket_ids: HashSet<BucketId>,
    request_ids: HashSet<String>,
}

impl JobRecord {
    fn new(job: PrioritizedJob) -> Self {
        Self {
            job,
            created_at: Utc::now(),
            results: Vec::new(),
            result_bucket_ids: HashSet::new(),
            request_ids: HashSet::new(),
        }
    }

    pub fn results(&self) -> &[TestingResult] {
        &self.results
    }
}

/// Job lifecycle and collected results.
///
/// Deleted jobs leave a tombstone so their state stays observable.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: HashMap<JobId, JobRecord>,
    deleted: HashSet<JobId>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a scheduling request for `job`.
    pub fn register(&mut self, job: &PrioritizedJob, request_id: &str) -> Result<Registration> {
        if self.deleted.contains(&job.job_id) {
            return Err(QueueError::JobDeleted(job.job_id.clone()));
        }
        let (record, registration) = match self.jobs.get_mut(&job.job_id) {
            Some(record) => {
                if record.request_ids.contains(request_id) {
                    return Ok(Registration::DuplicateRequest);
                }
                if record.job != *job {
                    tracing::warn!(
                        job_id = %job.job_id,
                        "Job rescheduled with different priorities, keeping the original ones"
                    );
                }
                (record, Registration::ExistingJob)
            }
            None => {
                tracing::info!(
                    job_id = %job.job_id,
                    job_group_id = %job.job_group_id,
                    job_priority = job.job_priority.value(),
                    job_group_priority = job.job_group_priority.value(),
                    "Job registered"
                );
                let record = self
                    .jobs
                    .entry(job.job_id.clone())
                    .or_insert_with(|| JobRecord::new(job.clone()));
                (record, Registration::NewJob)
            }
        };
        record.request_ids.insert(request_id.to_string());
        Ok(registration)
    }

    /// Undo [`register`](Self::register) after the buckets could not be enqueued.
    pub fn abandon_request(&mut self, job_id: &JobId, request_id: &str, registration: Registration) {
        match registration {
            Registration::NewJob => {
                self.jobs.remove(job_id);
            }
            Registration::ExistingJob => {
                if let Some(record) = self.jobs.get_mut(job_id) {
                    record.request_ids.remove(request_id);
                }
            }
            Registration::DuplicateRequest => {}
        }
    }

    /// The registered job, with its original priorities.
    pub fn job(&self, job_id: &JobId) -> Result<&JobRecord> {
        if self.deleted.contains(job_id) {
            return Err(QueueError::JobDeleted(job_id.clone()));
        }
        self.jobs
            .get(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.clone()))
    }

    pub fn is_running(&self, job_id: &JobId) -> bool {
        self.jobs.contains_key(job_id)
    }

    pub fn running_job_ids(&self) -> HashSet<JobId> {
        self.jobs.keys().cloned().collect()
    }

    /// Store a bucket's final results. Returns false for unknown or deleted
    /// jobs and for buckets that were already recorded.
    pub fn record_result(&mut self, job_id: &JobId, result: TestingResult) -> bool {
        let Some(record) = self.jobs.get_mut(job_id) else {
            return false;
        };
        if !record.result_bucket_ids.insert(result.bucket_id) {
            return false;
        }
        record.results.push(result);
        true
    }

    pub fn job_state(&self, job_id: &JobId, counts: BucketCounts) -> Result<JobState> {
        if self.deleted.contains(job_id) {
            return Ok(JobState::Deleted);
        }
        if !self.jobs.contains_key(job_id) {
            return Err(QueueError::JobNotFound(job_id.clone()));
        }
        Ok(JobState::Running {
            is_depleted: counts.is_depleted(),
            enqueued_buckets: counts.enqueued,
            dequeued_buckets: counts.dequeued,
        })
    }

    pub fn results(&self, job_id: &JobId) -> Result<JobResults> {
        let record = self.job(job_id)?;
        Ok(JobResults {
            job_id: job_id.clone(),
            testing_results: record.results.clone(),
        })
    }

    /// Mark the job deleted and drop its results.
    ///
    /// Returns false when the job was already deleted.
    pub fn delete(&mut self, job_id: &JobId) -> Result<bool> {
        if self.deleted.contains(job_id) {
            return Ok(false);
        }
        match self.jobs.remove(job_id) {
            Some(record) => {
                tracing::info!(job_id = %job_id, results = record.results.len(), "Job deleted");
                self.deleted.insert(job_id.clone());
                Ok(true)
            }
            None => Err(QueueError::JobNotFound(job_id.clone())),
        }
    }
}
