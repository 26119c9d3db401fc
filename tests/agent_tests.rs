//! Worker agents running against an in-process queue server.

mod test_harness;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use bucket_queue::config::{QueueServerConfig, WorkerConfig};
use bucket_queue::error::QueueError;
use bucket_queue::retry::RetryPolicy;
use bucket_queue::scheduler::bucket::{
    Bucket, JobId, TestEntry, TestEntryConfiguration, TestEntryResult, TestName, TestOutcome,
    TestingResult, WorkerId,
};
use bucket_queue::scheduler::split::ScheduleStrategy;
use bucket_queue::server::connection::ScheduleTestsRequest;
use bucket_queue::server::{QueueConnection, QueueServer};
use bucket_queue::worker::{StopReason, TestExecutor, WorkerAgent};
use test_harness::{assert_eventually, job, schedule, test_config, test_server};

/// Fails each listed test the given number of times, then passes it.
#[derive(Default)]
struct ScriptedExecutor {
    failures_left: Mutex<HashMap<TestName, u32>>,
    executed: Mutex<Vec<TestName>>,
}

impl ScriptedExecutor {
    fn failing(test: &str, times: u32) -> Self {
        let (class_name, method_name) = test.split_once('/').unwrap();
        let executor = Self::default();
        executor
            .failures_left
            .try_lock()
            .unwrap()
            .insert(TestEntry::new(class_name, method_name).test_name(), times);
        executor
    }

    async fn executed(&self) -> Vec<TestName> {
        self.executed.lock().await.clone()
    }
}

#[async_trait]
impl TestExecutor for ScriptedExecutor {
    async fn execute_bucket(&self, bucket: &Bucket) -> TestingResult {
        let mut results = Vec::new();
        for entry in bucket.test_entries() {
            let name = entry.test_name();
            self.executed.lock().await.push(name.clone());
            let outcome = match self.failures_left.lock().await.get_mut(&name) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    TestOutcome::Failed
                }
                _ => TestOutcome::Passed,
            };
            results.push(TestEntryResult {
                test_entry: entry.clone(),
                outcome,
                duration_ms: 1,
                message: None,
            });
        }
        TestingResult {
            bucket_id: bucket.bucket_id(),
            results,
        }
    }
}

fn draining_config() -> QueueServerConfig {
    let mut config = test_config().with_wait_for_all_queues_to_deplete(true);
    config.report_alive_interval = Duration::from_millis(50);
    config
}

fn worker_config(id: &str) -> WorkerConfig {
    WorkerConfig::new(id, "in-process").with_report_retry(
        RetryPolicy::default()
            .with_max_attempts(3)
            .with_initial_delay(Duration::from_millis(10)),
    )
}

fn agent(server: &Arc<QueueServer>, id: &str, executor: Arc<ScriptedExecutor>) -> WorkerAgent {
    let connection: Arc<dyn QueueConnection> = server.clone();
    WorkerAgent::new(worker_config(id), connection, executor)
}

#[tokio::test]
async fn test_agent_drains_queue_and_stops() {
    let server = test_server(draining_config());
    schedule(
        &server,
        job("J", 500, 500),
        ScheduleStrategy::Individual,
        &["A/a", "A/b", "A/c"],
    )
    .await;
    let executor = Arc::new(ScriptedExecutor::default());

    let summary = agent(&server, "w1", executor.clone())
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.stop_reason, StopReason::QueueIsEmpty);
    assert_eq!(summary.buckets_executed, 3);
    assert_eq!(executor.executed().await.len(), 3);
    let job_id = JobId::new("J");
    assert!(server.job_state(&job_id).await.unwrap().is_depleted());
    let results = server.job_results(&job_id).await.unwrap();
    assert_eq!(results.testing_results.len(), 3);
}

#[tokio::test]
async fn test_failed_test_is_retried_through_the_queue() {
    let server = test_server(draining_config());
    let mut flaky = TestEntryConfiguration::new(TestEntry::new("A", "flaky"));
    flaky.execution.number_of_retries = 2;
    server
        .schedule_tests(ScheduleTestsRequest::new(
            job("J", 500, 500),
            ScheduleStrategy::Individual,
            vec![flaky],
        ))
        .await
        .unwrap();
    let executor = Arc::new(ScriptedExecutor::failing("A/flaky", 1));

    let summary = agent(&server, "w1", executor.clone())
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.buckets_executed, 2);
    let results = server.job_results(&JobId::new("J")).await.unwrap();
    let outcomes: Vec<TestOutcome> = results
        .testing_results
        .iter()
        .flat_map(|r| r.results.iter().map(|e| e.outcome))
        .collect();
    assert_eq!(outcomes, vec![TestOutcome::Passed]);
}

#[tokio::test]
async fn test_exhausted_retries_record_the_failure() {
    let server = test_server(draining_config());
    let mut broken = TestEntryConfiguration::new(TestEntry::new("A", "broken"));
    broken.execution.number_of_retries = 1;
    server
        .schedule_tests(ScheduleTestsRequest::new(
            job("J", 500, 500),
            ScheduleStrategy::Individual,
            vec![broken],
        ))
        .await
        .unwrap();
    let executor = Arc::new(ScriptedExecutor::failing("A/broken", 10));

    let summary = agent(&server, "w1", executor.clone())
        .run(CancellationToken::new())
        .await
        .unwrap();

    // The first run plus one retry.
    assert_eq!(summary.buckets_executed, 2);
    let results = server.job_results(&JobId::new("J")).await.unwrap();
    assert_eq!(results.testing_results.len(), 1);
    assert_eq!(results.testing_results[0].results[0].outcome, TestOutcome::Failed);
}

#[tokio::test]
async fn test_two_agents_share_the_work() {
    let server = test_server(draining_config());
    let tests: Vec<String> = (0..20).map(|i| format!("Suite/test{}", i)).collect();
    let names: Vec<&str> = tests.iter().map(String::as_str).collect();
    schedule(&server, job("J", 500, 500), ScheduleStrategy::Individual, &names).await;

    let first_executor = Arc::new(ScriptedExecutor::default());
    let second_executor = Arc::new(ScriptedExecutor::default());
    let first = agent(&server, "w1", first_executor.clone());
    let second = agent(&server, "w2", second_executor.clone());

    let (a, b) = tokio::join!(
        first.run(CancellationToken::new()),
        second.run(CancellationToken::new())
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.buckets_executed + b.buckets_executed, 20);
    let mut executed = first_executor.executed().await;
    executed.extend(second_executor.executed().await);
    executed.sort();
    executed.dedup();
    assert_eq!(executed.len(), 20, "every test runs exactly once");
}

#[tokio::test]
async fn test_agent_stops_on_cancel_while_waiting() {
    // Without drain-waiting an empty queue keeps workers polling.
    let server = test_server(test_config());
    let cancel = CancellationToken::new();
    let executor = Arc::new(ScriptedExecutor::default());
    let running = {
        let agent = agent(&server, "w1", executor);
        let cancel = cancel.clone();
        tokio::spawn(async move { agent.run(cancel).await })
    };

    assert_eventually(
        || async { !server.worker_statuses().await.is_empty() },
        Duration::from_secs(5),
        "worker should register",
    )
    .await;
    cancel.cancel();

    let summary = running.await.unwrap().unwrap();
    assert_eq!(summary.stop_reason, StopReason::Cancelled);
    assert_eq!(summary.buckets_executed, 0);
}

#[tokio::test]
async fn test_blocked_agent_stops() {
    let mut config = test_config();
    config.report_alive_interval = Duration::from_millis(20);
    let server = test_server(config);
    let worker = WorkerId::new("w1");
    let running = {
        let agent = agent(&server, "w1", Arc::new(ScriptedExecutor::default()));
        tokio::spawn(async move { agent.run(CancellationToken::new()).await })
    };
    assert_eventually(
        || async { !server.worker_statuses().await.is_empty() },
        Duration::from_secs(5),
        "worker should register",
    )
    .await;

    server.block_worker(&worker).await;

    let summary = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("agent should stop once blocked")
        .unwrap()
        .unwrap();
    assert_eq!(summary.stop_reason, StopReason::Blocked);
}

#[tokio::test]
async fn test_blocked_worker_cannot_register() {
    let server = test_server(draining_config());
    server.block_worker(&WorkerId::new("w1")).await;

    let err = agent(&server, "w1", Arc::new(ScriptedExecutor::default()))
        .run(CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::WorkerBlocked(_)));
}
