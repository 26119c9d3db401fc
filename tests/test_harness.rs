//! Shared helpers for queue server integration tests.
//!
//! Builds in-process servers with short timings and drives workers through
//! the same operations a remote worker would call.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use bucket_queue::config::QueueServerConfig;
use bucket_queue::scheduler::assigner::DequeueResult;
use bucket_queue::scheduler::bucket::{
    DequeuedBucket, JobGroupId, JobId, PrioritizedJob, Priority, TestEntry,
    TestEntryConfiguration, TestEntryResult, TestOutcome, TestingResult, WorkerId,
};
use bucket_queue::scheduler::split::ScheduleStrategy;
use bucket_queue::server::api;
use bucket_queue::server::connection::{ScheduleTestsRequest, ScheduleTestsResponse};
use bucket_queue::server::QueueServer;
use bucket_queue::utilization::WorkerUtilizationStatusPoller;

/// Server config with timings small enough for tests.
pub fn test_config() -> QueueServerConfig {
    QueueServerConfig::default()
        .with_worker_silence_timeout(Duration::from_secs(90))
        .with_dequeue_grace_period(Duration::from_secs(60))
        .with_check_again_after(Duration::from_millis(50))
}

pub fn test_server(config: QueueServerConfig) -> Arc<QueueServer> {
    Arc::new(QueueServer::new(
        config,
        Arc::new(WorkerUtilizationStatusPoller::unrestricted()),
    ))
}

pub fn job(id: &str, group_priority: u16, priority: u16) -> PrioritizedJob {
    PrioritizedJob {
        job_id: JobId::new(id),
        job_group_id: JobGroupId::new(format!("{}-group", id)),
        job_priority: Priority::new(priority).unwrap(),
        job_group_priority: Priority::new(group_priority).unwrap(),
    }
}

/// One configuration per `Class/method` name.
pub fn configurations(tests: &[&str]) -> Vec<TestEntryConfiguration> {
    tests
        .iter()
        .map(|name| {
            let (class_name, method_name) = name.split_once('/').unwrap();
            TestEntryConfiguration::new(TestEntry::new(class_name, method_name))
        })
        .collect()
}

pub async fn schedule(
    server: &QueueServer,
    job: PrioritizedJob,
    strategy: ScheduleStrategy,
    tests: &[&str],
) -> ScheduleTestsResponse {
    server
        .schedule_tests(ScheduleTestsRequest::new(job, strategy, configurations(tests)))
        .await
        .expect("scheduling should succeed")
}

/// Dequeue once and expect a bucket.
pub async fn dequeue(server: &QueueServer, worker: &str) -> DequeuedBucket {
    match server
        .dequeue_bucket(&WorkerId::new(worker), &[])
        .await
        .expect("dequeue should succeed")
    {
        DequeueResult::Dequeued { bucket } => bucket,
        other => panic!("expected a bucket for {}, got {:?}", worker, other),
    }
}

/// A result with the same outcome for every entry of the bucket.
pub fn result_for(bucket: &DequeuedBucket, outcome: TestOutcome) -> TestingResult {
    TestingResult {
        bucket_id: bucket.bucket_id(),
        results: bucket
            .bucket()
            .test_entries()
            .iter()
            .map(|entry| TestEntryResult {
                test_entry: entry.clone(),
                outcome,
                duration_ms: 10,
                message: None,
            })
            .collect(),
    }
}

/// Serve the HTTP API on an ephemeral port.
pub struct TestApi {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestApi {
    pub async fn start(server: Arc<QueueServer>) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            api::serve_on(listener, server, token).await.unwrap();
        });
        Self {
            addr,
            shutdown,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn assert_eventually<F, Fut>(condition: F, timeout: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("Condition not met within {:?}: {}", timeout, message);
}
