//! Turning submitted test entries into buckets.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};
use crate::scheduler::bucket::{
    Bucket, BucketId, PrioritizedJob, TestEntry, TestEntryConfiguration, TestExecutionBehavior,
    WorkerCapabilityRequirement,
};
use crate::scheduler::queue::QueueState;

/// How a job's tests are grouped into buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleStrategy {
    /// One bucket per test.
    #[default]
    Individual,
    /// Buckets of at most `size` tests.
    FixedBucketSize { size: usize },
    /// One bucket per worker, tests spread evenly.
    EquallyDivided,
    /// Large buckets first, shrinking towards single tests at the tail.
    Progressive,
    /// Everything in a single bucket.
    Unsplit,
}

/// Share of all entries handed out in each progressive round.
const PROGRESSIVE_ROUNDS_PERCENT: [usize; 4] = [40, 20, 10, 5];

/// Concurrency hint for splitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSplitInfo {
    pub number_of_workers: usize,
}

impl BucketSplitInfo {
    pub fn new(number_of_workers: usize) -> Self {
        Self {
            number_of_workers: number_of_workers.max(1),
        }
    }
}

/// Sizes of `parts` nearly equal chunks covering `count` items.
fn equal_chunks(count: usize, parts: usize) -> Vec<usize> {
    if count == 0 {
        return Vec::new();
    }
    let per_chunk = count.div_ceil(parts.max(1));
    let mut sizes = Vec::new();
    let mut left = count;
    while left > 0 {
        let size = per_chunk.min(left);
        sizes.push(size);
        left -= size;
    }
    sizes
}

impl ScheduleStrategy {
    /// Bucket sizes for `count` entries, in order; they always sum to `count`.
    pub fn chunk_sizes(&self, count: usize, info: &BucketSplitInfo) -> Vec<usize> {
        let workers = info.number_of_workers.max(1);
        match *self {
            ScheduleStrategy::Individual => vec![1; count],
            ScheduleStrategy::FixedBucketSize { size } => {
                let size = size.max(1);
                (0..count).step_by(size).map(|start| size.min(count - start)).collect()
            }
            ScheduleStrategy::EquallyDivided => equal_chunks(count, workers),
            ScheduleStrategy::Unsplit => {
                if count == 0 {
                    Vec::new()
                } else {
                    vec![count]
                }
            }
            ScheduleStrategy::Progressive => {
                let mut sizes = Vec::new();
                let mut left = count;
                for percent in PROGRESSIVE_ROUNDS_PERCENT {
                    let portion = (count * percent / 100).min(left);
                    sizes.extend(equal_chunks(portion, workers));
                    left -= portion;
                }
                sizes.extend(std::iter::repeat(1).take(left));
                sizes
            }
        }
    }

    /// Split configurations into buckets.
    ///
    /// Entries that differ in requirements, analytics tag or execution
    /// behavior never share a bucket; groups keep first-appearance order.
    pub fn split(
        &self,
        configurations: &[TestEntryConfiguration],
        info: &BucketSplitInfo,
    ) -> Result<Vec<Bucket>> {
        let mut buckets = Vec::new();
        for group in group_configurations(configurations) {
            let mut entries = group.entries.into_iter();
            for size in self.chunk_sizes(entries.len(), info) {
                let chunk: Vec<TestEntry> = entries.by_ref().take(size).collect();
                buckets.push(Bucket::new(
                    BucketId::generate(),
                    chunk,
                    group.requirements.clone(),
                    group.analytics_tag.clone(),
                    group.execution.clone(),
                )?);
            }
        }
        Ok(buckets)
    }
}

struct ConfigurationGroup {
    requirements: BTreeSet<WorkerCapabilityRequirement>,
    analytics_tag: Option<String>,
    execution: TestExecutionBehavior,
    entries: Vec<TestEntry>,
}

fn group_configurations(configurations: &[TestEntryConfiguration]) -> Vec<ConfigurationGroup> {
    let mut groups: Vec<ConfigurationGroup> = Vec::new();
    for configuration in configurations {
        let existing = groups.iter_mut().find(|g| {
            g.requirements == configuration.worker_capability_requirements
                && g.analytics_tag == configuration.analytics_tag
                && g.execution == configuration.execution
        });
        match existing {
            Some(group) => group.entries.push(configuration.test_entry.clone()),
            None => groups.push(ConfigurationGroup {
                requirements: configuration.worker_capability_requirements.clone(),
                analytics_tag: configuration.analytics_tag.clone(),
                execution: configuration.execution.clone(),
                entries: vec![configuration.test_entry.clone()],
            }),
        }
    }
    groups
}

/// Inserts new buckets into the queue state.
///
/// Runs inside the holder's exclusive scope, so implementations must not block.
pub trait BucketEnqueuer: Send + Sync {
    fn enqueue(
        &self,
        state: &mut QueueState,
        buckets: Vec<Bucket>,
        job: &PrioritizedJob,
    ) -> Result<()>;

    /// Split `configurations` with `strategy` and enqueue the result.
    fn enqueue_tests(
        &self,
        state: &mut QueueState,
        job: &PrioritizedJob,
        strategy: ScheduleStrategy,
        configurations: &[TestEntryConfiguration],
        info: &BucketSplitInfo,
    ) -> Result<Vec<BucketId>> {
        let buckets = strategy.split(configurations, info)?;
        let ids = buckets.iter().map(Bucket::bucket_id).collect();
        self.enqueue(state, buckets, job)?;
        Ok(ids)
    }
}

/// Appends buckets to the queue in submission order.
#[derive(Debug, Default)]
pub struct QueueBucketEnqueuer;

impl BucketEnqueuer for QueueBucketEnqueuer {
    fn enqueue(
        &self,
        state: &mut QueueState,
        buckets: Vec<Bucket>,
        job: &PrioritizedJob,
    ) -> Result<()> {
        if buckets.is_empty() {
            return Err(QueueError::InvalidRequest(
                "nothing to enqueue".to_string(),
            ));
        }
        tracing::debug!(job_id = %job.job_id, buckets = buckets.len(), "Enqueueing buckets");
        state.enqueue(buckets, job);
        Ok(())
    }
}
