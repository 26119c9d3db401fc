use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{QueueError, Result};
use crate::scheduler::bucket::{
    Bucket, TestEntry, TestEntryResult, TestOutcome, TestingResult,
};

pub const TEST_CLASS_NAME_ENV: &str = "TEST_CLASS_NAME";
pub const TEST_METHOD_NAME_ENV: &str = "TEST_METHOD_NAME";

/// Runs the tests of a bucket on this machine.
///
/// Always produces a result: failures to run a test are reported as
/// [`TestOutcome::Lost`] entries, never as errors.
#[async_trait]
pub trait TestExecutor: Send + Sync {
    async fn execute_bucket(&self, bucket: &Bucket) -> TestingResult;
}

/// Runs a fixed command once per test entry.
///
/// The entry is passed through `TEST_CLASS_NAME` and `TEST_METHOD_NAME`,
/// together with the bucket's environment. Exit status 0 means passed.
#[derive(Debug, Clone)]
pub struct ProcessTestExecutor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessTestExecutor {
    pub fn new(command: Vec<String>, timeout: Duration) -> Result<Self> {
        let mut parts = command.into_iter();
        let program = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| QueueError::InvalidRequest("test command is empty".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            timeout,
        })
    }

    async fn execute_entry(&self, bucket: &Bucket, entry: &TestEntry) -> TestEntryResult {
        tracing::debug!(
            bucket_id = %bucket.bucket_id(),
            test = %entry.test_name(),
            "Running test"
        );

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&bucket.execution().environment)
            .env(TEST_CLASS_NAME_ENV, &entry.class_name)
            .env(TEST_METHOD_NAME_ENV, &entry.method_name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let output = tokio::time::timeout(self.timeout, command.output()).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (outcome, message) = match output {
            Ok(Ok(output)) if output.status.success() => (TestOutcome::Passed, None),
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let message = if stderr.is_empty() {
                    format!("Exit code: {:?}", output.status.code())
                } else {
                    stderr
                };
                (TestOutcome::Failed, Some(message))
            }
            Ok(Err(e)) => {
                tracing::error!(test = %entry.test_name(), error = %e, "Failed to start test");
                (TestOutcome::Lost, Some(e.to_string()))
            }
            Err(_) => {
                tracing::warn!(test = %entry.test_name(), timeout = ?self.timeout, "Test timed out");
                (
                    TestOutcome::Lost,
                    Some(format!("timed out after {:?}", self.timeout)),
                )
            }
        };

        TestEntryResult {
            test_entry: entry.clone(),
            outcome,
            duration_ms,
            message,
        }
    }
}

#[async_trait]
impl TestExecutor for ProcessTestExecutor {
    async fn execute_bucket(&self, bucket: &Bucket) -> TestingResult {
        let mut results = Vec::with_capacity(bucket.test_entries().len());
        for entry in bucket.test_entries() {
            results.push(self.execute_entry(bucket, entry).await);
        }
        let failed = results.iter().filter(|r| !r.succeeded()).count();
        tracing::info!(
            bucket_id = %bucket.bucket_id(),
            tests = results.len(),
            failed,
            "Bucket executed"
        );
        TestingResult {
            bucket_id: bucket.bucket_id(),
            results,
        }
    }
}
