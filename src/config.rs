use std::net::SocketAddr;
use std::time::Duration;

use crate::deploy::DeploymentDestination;
use crate::retry::RetryPolicy;
use crate::scheduler::assigner::NothingToDequeueBehavior;
use crate::scheduler::bucket::{WorkerCapability, WorkerId};

/// Settings for the queue server process.
#[derive(Debug, Clone)]
pub struct QueueServerConfig {
    pub listen_addr: SocketAddr,
    /// How often workers are told to report alive.
    pub report_alive_interval: Duration,
    /// A registered worker with no heartbeat for this long is silent.
    pub worker_silence_timeout: Duration,
    /// How long a freshly dequeued bucket is trusted without appearing in heartbeats.
    pub dequeue_grace_period: Duration,
    pub stuck_bucket_scan_interval: Duration,
    /// Backoff hint returned when nothing can be dequeued.
    pub check_again_after: Duration,
    /// Answer `QueueIsEmpty` once every job is depleted instead of `CheckAgainLater`.
    pub wait_for_all_queues_to_deplete: bool,
    pub utilization_poll_interval: Duration,
    /// Workers this queue owns when the fleet is not shared, or as a fallback.
    pub default_deployments: Vec<DeploymentDestination>,
    /// Coordination endpoint deciding which workers this queue may use.
    pub coordination_url: Option<String>,
}

impl Default for QueueServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 41000)),
            report_alive_interval: Duration::from_secs(30),
            worker_silence_timeout: Duration::from_secs(90),
            dequeue_grace_period: Duration::from_secs(60),
            stuck_bucket_scan_interval: Duration::from_secs(30),
            check_again_after: Duration::from_secs(30),
            wait_for_all_queues_to_deplete: false,
            utilization_poll_interval: Duration::from_secs(60),
            default_deployments: Vec::new(),
            coordination_url: None,
        }
    }
}

impl QueueServerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_worker_silence_timeout(mut self, timeout: Duration) -> Self {
        self.worker_silence_timeout = timeout;
        self
    }

    pub fn with_dequeue_grace_period(mut self, grace: Duration) -> Self {
        self.dequeue_grace_period = grace;
        self
    }

    pub fn with_stuck_bucket_scan_interval(mut self, interval: Duration) -> Self {
        self.stuck_bucket_scan_interval = interval;
        self
    }

    pub fn with_check_again_after(mut self, check_again_after: Duration) -> Self {
        self.check_again_after = check_again_after;
        self
    }

    pub fn with_wait_for_all_queues_to_deplete(mut self, wait: bool) -> Self {
        self.wait_for_all_queues_to_deplete = wait;
        self
    }

    pub fn with_deployment(mut self, destination: DeploymentDestination) -> Self {
        self.default_deployments.push(destination);
        self
    }

    pub fn with_coordination_url(mut self, url: impl Into<String>) -> Self {
        self.coordination_url = Some(url.into());
        self
    }

    pub fn nothing_to_dequeue_behavior(&self) -> NothingToDequeueBehavior {
        if self.wait_for_all_queues_to_deplete {
            NothingToDequeueBehavior::WaitForAllQueuesToDeplete {
                check_after: self.check_again_after,
            }
        } else {
            NothingToDequeueBehavior::CheckLater {
                check_after: self.check_again_after,
            }
        }
    }
}

/// Settings for a worker agent.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: WorkerId,
    /// Base URL of the queue server, e.g. `http://127.0.0.1:41000`.
    pub queue_url: String,
    pub capabilities: Vec<WorkerCapability>,
    /// Program and arguments run once per test entry.
    pub command: Vec<String>,
    /// Per-entry time limit; the entry is reported lost when exceeded.
    pub test_timeout: Duration,
    /// Retry policy for reporting results and registering.
    pub report_retry: RetryPolicy,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>, queue_url: impl Into<String>) -> Self {
        Self {
            worker_id: WorkerId::new(worker_id),
            queue_url: queue_url.into(),
            capabilities: Vec::new(),
            command: Vec::new(),
            test_timeout: Duration::from_secs(600),
            report_retry: RetryPolicy::default()
                .with_initial_delay(Duration::from_millis(500)),
        }
    }

    pub fn with_capability(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.capabilities.push(WorkerCapability {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    pub fn with_test_timeout(mut self, timeout: Duration) -> Self {
        self.test_timeout = timeout;
        self
    }

    pub fn with_report_retry(mut self, policy: RetryPolicy) -> Self {
        self.report_retry = policy;
        self
    }
}

/// Settings for the client flow that schedules tests and waits for them.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub job_poll_interval: Duration,
    /// Used for runtime test discovery.
    pub discovery_retry: RetryPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            job_poll_interval: Duration::from_secs(30),
            discovery_retry: RetryPolicy::default(),
        }
    }
}

impl RunnerConfig {
    pub fn with_job_poll_interval(mut self, interval: Duration) -> Self {
        self.job_poll_interval = interval;
        self
    }

    pub fn with_discovery_retry(mut self, policy: RetryPolicy) -> Self {
        self.discovery_retry = policy;
        self
    }
}
