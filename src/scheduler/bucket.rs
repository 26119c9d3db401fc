//! Work unit ("bucket") model shared by the queue, the workers and the clients.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QueueError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketId(pub Uuid);

impl BucketId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(WorkerId);
string_id!(JobId);
string_id!(JobGroupId);

/// Scheduling priority in `0..=999`; higher is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Priority(u16);

impl Priority {
    pub const MAX: u16 = 999;

    pub fn new(value: u16) -> Result<Self> {
        if value > Self::MAX {
            return Err(QueueError::InvalidRequest(format!(
                "priority {} is out of range 0..={}",
                value,
                Self::MAX
            )));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self(500)
    }
}

impl TryFrom<u16> for Priority {
    type Error = QueueError;

    fn try_from(value: u16) -> Result<Self> {
        Priority::new(value)
    }
}

impl From<Priority> for u16 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

/// Identity of a test: two entries with the same name are the same test.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestName {
    pub class_name: String,
    pub method_name: String,
}

impl fmt::Display for TestName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.class_name, self.method_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestEntry {
    pub class_name: String,
    pub method_name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub case_id: Option<u64>,
}

impl TestEntry {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            tags: Vec::new(),
            case_id: None,
        }
    }

    pub fn test_name(&self) -> TestName {
        TestName {
            class_name: self.class_name.clone(),
            method_name: self.method_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CapabilityConstraint {
    Present,
    Absent,
    Equal(String),
    NotEqual(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerCapabilityRequirement {
    pub name: String,
    pub constraint: CapabilityConstraint,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerCapability {
    pub name: String,
    pub value: String,
}

impl WorkerCapabilityRequirement {
    pub fn is_satisfied_by(&self, capabilities: &[WorkerCapability]) -> bool {
        let value = capabilities
            .iter()
            .find(|c| c.name == self.name)
            .map(|c| c.value.as_str());
        match (&self.constraint, value) {
            (CapabilityConstraint::Present, found) => found.is_some(),
            (CapabilityConstraint::Absent, found) => found.is_none(),
            (CapabilityConstraint::Equal(expected), Some(v)) => v == expected,
            (CapabilityConstraint::Equal(_), None) => false,
            (CapabilityConstraint::NotEqual(expected), Some(v)) => v != expected,
            (CapabilityConstraint::NotEqual(_), None) => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestExecutionBehavior {
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub number_of_retries: u32,
}

/// One requested test plus everything needed to run it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestEntryConfiguration {
    pub test_entry: TestEntry,
    #[serde(default)]
    pub worker_capability_requirements: BTreeSet<WorkerCapabilityRequirement>,
    #[serde(default)]
    pub analytics_tag: Option<String>,
    #[serde(default)]
    pub execution: TestExecutionBehavior,
}

impl TestEntryConfiguration {
    pub fn new(test_entry: TestEntry) -> Self {
        Self {
            test_entry,
            worker_capability_requirements: BTreeSet::new(),
            analytics_tag: None,
            execution: TestExecutionBehavior::default(),
        }
    }
}

/// An immutable group of test entries dispatched to a single worker.
///
/// Buckets are never mutated: reenqueueing and retrying produce new buckets
/// with fresh ids via [`Bucket::with_test_entries`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BucketFields")]
pub struct Bucket {
    bucket_id: BucketId,
    test_entries: Vec<TestEntry>,
    worker_capability_requirements: BTreeSet<WorkerCapabilityRequirement>,
    analytics_tag: Option<String>,
    execution: TestExecutionBehavior,
    retry_attempt: u32,
}

/// Wire shape of [`Bucket`], validated on the way in.
#[derive(Deserialize)]
struct BucketFields {
    bucket_id: BucketId,
    test_entries: Vec<TestEntry>,
    #[serde(default)]
    worker_capability_requirements: BTreeSet<WorkerCapabilityRequirement>,
    #[serde(default)]
    analytics_tag: Option<String>,
    #[serde(default)]
    execution: TestExecutionBehavior,
    #[serde(default)]
    retry_attempt: u32,
}

impl TryFrom<BucketFields> for Bucket {
    type Error = QueueError;

    fn try_from(fields: BucketFields) -> Result<Self> {
        let mut bucket = Bucket::new(
            fields.bucket_id,
            fields.test_entries,
            fields.worker_capability_requirements,
            fields.analytics_tag,
            fields.execution,
        )?;
        bucket.retry_attempt = fields.retry_attempt;
        Ok(bucket)
    }
}

impl Bucket {
    pub fn new(
        bucket_id: BucketId,
        test_entries: Vec<TestEntry>,
        worker_capability_requirements: BTreeSet<WorkerCapabilityRequirement>,
        analytics_tag: Option<String>,
        execution: TestExecutionBehavior,
    ) -> Result<Self> {
        if test_entries.is_empty() {
            return Err(QueueError::EmptyBucket);
        }
        Ok(Self {
            bucket_id,
            test_entries,
            worker_capability_requirements,
            analytics_tag,
            execution,
            retry_attempt: 0,
        })
    }

    /// Derive a new bucket with the same settings but other entries.
    pub fn with_test_entries(&self, bucket_id: BucketId, test_entries: Vec<TestEntry>) -> Result<Self> {
        if test_entries.is_empty() {
            return Err(QueueError::EmptyBucket);
        }
        Ok(Self {
            bucket_id,
            test_entries,
            worker_capability_requirements: self.worker_capability_requirements.clone(),
            analytics_tag: self.analytics_tag.clone(),
            execution: self.execution.clone(),
            retry_attempt: self.retry_attempt,
        })
    }

    /// Derive the bucket that retries `test_entry` after a failed attempt.
    pub fn retrying(&self, bucket_id: BucketId, test_entry: TestEntry) -> Self {
        Self {
            bucket_id,
            test_entries: vec![test_entry],
            worker_capability_requirements: self.worker_capability_requirements.clone(),
            analytics_tag: self.analytics_tag.clone(),
            execution: self.execution.clone(),
            retry_attempt: self.retry_attempt + 1,
        }
    }

    pub fn bucket_id(&self) -> BucketId {
        self.bucket_id
    }

    pub fn test_entries(&self) -> &[TestEntry] {
        &self.test_entries
    }

    pub fn worker_capability_requirements(&self) -> &BTreeSet<WorkerCapabilityRequirement> {
        &self.worker_capability_requirements
    }

    pub fn analytics_tag(&self) -> Option<&str> {
        self.analytics_tag.as_deref()
    }

    pub fn execution(&self) -> &TestExecutionBehavior {
        &self.execution
    }

    pub fn retry_attempt(&self) -> u32 {
        self.retry_attempt
    }

    pub fn has_retries_left(&self) -> bool {
        self.retry_attempt < self.execution.number_of_retries
    }

    pub fn can_be_run_by(&self, capabilities: &[WorkerCapability]) -> bool {
        self.worker_capability_requirements
            .iter()
            .all(|requirement| requirement.is_satisfied_by(capabilities))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrioritizedJob {
    pub job_id: JobId,
    pub job_group_id: JobGroupId,
    #[serde(default)]
    pub job_priority: Priority,
    #[serde(default)]
    pub job_group_priority: Priority,
}

impl PrioritizedJob {
    /// A job that forms its own group.
    pub fn standalone(job_id: JobId, priority: Priority) -> Self {
        Self {
            job_group_id: JobGroupId::new(job_id.as_str()),
            job_id,
            job_priority: priority,
            job_group_priority: priority,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueuedBucket {
    pub bucket: Bucket,
    pub job: PrioritizedJob,
    pub enqueued_at: DateTime<Utc>,
    /// Monotonic submission order, used as the FIFO tie-break.
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DequeuedBucket {
    pub enqueued: EnqueuedBucket,
    pub worker_id: WorkerId,
    pub dequeued_at: DateTime<Utc>,
}

impl DequeuedBucket {
    pub fn bucket(&self) -> &Bucket {
        &self.enqueued.bucket
    }

    pub fn bucket_id(&self) -> BucketId {
        self.enqueued.bucket.bucket_id()
    }

    pub fn job_id(&self) -> &JobId {
        &self.enqueued.job.job_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    Failed,
    /// The worker could not produce a verdict (runner crashed, timed out).
    Lost,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestEntryResult {
    pub test_entry: TestEntry,
    pub outcome: TestOutcome,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub message: Option<String>,
}

impl TestEntryResult {
    pub fn succeeded(&self) -> bool {
        self.outcome == TestOutcome::Passed
    }
}

/// What a worker reports back after running a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestingResult {
    pub bucket_id: BucketId,
    pub results: Vec<TestEntryResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(pairs: &[(&str, &str)]) -> Vec<WorkerCapability> {
        pairs
            .iter()
            .map(|(n, v)| WorkerCapability {
                name: n.to_string(),
                value: v.to_string(),
            })
            .collect()
    }

    fn requirement(name: &str, constraint: CapabilityConstraint) -> WorkerCapabilityRequirement {
        WorkerCapabilityRequirement {
            name: name.to_string(),
            constraint,
        }
    }

    #[test]
    fn bucket_rejects_empty_entries() {
        let result = Bucket::new(
            BucketId::generate(),
            Vec::new(),
            BTreeSet::new(),
            None,
            TestExecutionBehavior::default(),
        );
        assert!(matches!(result, Err(QueueError::EmptyBucket)));
    }

    #[test]
    fn deserialized_bucket_is_validated() {
        let bucket = Bucket::new(
            BucketId::generate(),
            vec![TestEntry::new("A", "a")],
            BTreeSet::new(),
            Some("nightly".to_string()),
            TestExecutionBehavior::default(),
        )
        .unwrap()
        .retrying(BucketId::generate(), TestEntry::new("A", "a"));
        let json = serde_json::to_value(&bucket).unwrap();
        let parsed: Bucket = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(parsed, bucket);
        assert_eq!(parsed.retry_attempt(), 1);

        let mut empty = json;
        empty["test_entries"] = serde_json::json!([]);
        let err = serde_json::from_value::<Bucket>(empty).unwrap_err();
        assert!(err.to_string().contains("at least one test entry"), "{}", err);
    }

    #[test]
    fn test_name_ignores_tags_and_case_id() {
        let mut a = TestEntry::new("LoginTests", "testLogin");
        let b = TestEntry::new("LoginTests", "testLogin");
        a.tags.push("smoke".to_string());
        a.case_id = Some(42);
        assert_eq!(a.test_name(), b.test_name());
    }

    #[test]
    fn capability_constraints() {
        let worker = caps(&[("os", "14.0"), ("gpu", "yes")]);

        assert!(requirement("os", CapabilityConstraint::Present).is_satisfied_by(&worker));
        assert!(!requirement("arm", CapabilityConstraint::Present).is_satisfied_by(&worker));
        assert!(requirement("arm", CapabilityConstraint::Absent).is_satisfied_by(&worker));
        assert!(
            requirement("os", CapabilityConstraint::Equal("14.0".into())).is_satisfied_by(&worker)
        );
        assert!(
            !requirement("os", CapabilityConstraint::Equal("15.0".into())).is_satisfied_by(&worker)
        );
        assert!(requirement("os", CapabilityConstraint::NotEqual("15.0".into()))
            .is_satisfied_by(&worker));
        assert!(requirement("arm", CapabilityConstraint::NotEqual("x".into()))
            .is_satisfied_by(&worker));
    }

    #[test]
    fn bucket_without_requirements_runs_anywhere() {
        let bucket = Bucket::new(
            BucketId::generate(),
            vec![TestEntry::new("A", "a")],
            BTreeSet::new(),
            None,
            TestExecutionBehavior::default(),
        )
        .unwrap();
        assert!(bucket.can_be_run_by(&[]));
    }

    #[test]
    fn retrying_bumps_attempt_and_keeps_settings() {
        let bucket = Bucket::new(
            BucketId::generate(),
            vec![TestEntry::new("A", "a"), TestEntry::new("A", "b")],
            BTreeSet::from([requirement("os", CapabilityConstraint::Present)]),
            Some("nightly".to_string()),
            TestExecutionBehavior {
                environment: BTreeMap::new(),
                number_of_retries: 1,
            },
        )
        .unwrap();
        assert!(bucket.has_retries_left());

        let retry = bucket.retrying(BucketId::generate(), TestEntry::new("A", "b"));
        assert_ne!(retry.bucket_id(), bucket.bucket_id());
        assert_eq!(retry.retry_attempt(), 1);
        assert_eq!(retry.test_entries().len(), 1);
        assert_eq!(retry.analytics_tag(), Some("nightly"));
        assert!(!retry.has_retries_left());
    }

    #[test]
    fn priority_range_is_enforced() {
        assert!(Priority::new(999).is_ok());
        assert!(Priority::new(1000).is_err());
        assert_eq!(Priority::default().value(), 500);

        let parsed: std::result::Result<Priority, _> = serde_json::from_str("1200");
        assert!(parsed.is_err());
    }
}
