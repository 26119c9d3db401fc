//! Limits which workers this queue may use when a fleet is shared between
//! several queues.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::deploy::{worker_ids, DeploymentDestination};
use crate::error::{QueueError, Result};
use crate::scheduler::bucket::WorkerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerUtilizationPermission {
    AllowedToUtilize,
    NotAllowedToUtilize,
}

/// External service that knows how the worker fleet is split between queues.
#[async_trait]
pub trait CoordinationService: Send + Sync {
    async fn workers_to_utilize(
        &self,
        deployments: &[DeploymentDestination],
    ) -> Result<HashSet<WorkerId>>;
}

/// Used when the fleet is not shared: every configured worker is ours.
#[derive(Debug, Default)]
pub struct StaticCoordinationService;

#[async_trait]
impl CoordinationService for StaticCoordinationService {
    async fn workers_to_utilize(
        &self,
        deployments: &[DeploymentDestination],
    ) -> Result<HashSet<WorkerId>> {
        Ok(worker_ids(deployments).into_iter().collect())
    }
}

#[derive(Serialize)]
struct WorkersToUtilizeRequest<'a> {
    deployments: &'a [DeploymentDestination],
}

/// Asks a coordination endpoint over HTTP; expects a JSON array of worker ids.
#[derive(Debug, Clone)]
pub struct HttpCoordinationService {
    url: String,
    http: reqwest::Client,
}

impl HttpCoordinationService {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CoordinationService for HttpCoordinationService {
    async fn workers_to_utilize(
        &self,
        deployments: &[DeploymentDestination],
    ) -> Result<HashSet<WorkerId>> {
        let response = self
            .http
            .post(&self.url)
            .json(&WorkersToUtilizeRequest { deployments })
            .send()
            .await
            .map_err(|e| QueueError::Coordination(e.to_string()))?;
        if !response.status().is_success() {
            return Err(QueueError::Coordination(format!(
                "{} answered {}",
                self.url,
                response.status()
            )));
        }
        let workers: Vec<WorkerId> = response
            .json()
            .await
            .map_err(|e| QueueError::Coordination(e.to_string()))?;
        Ok(workers.into_iter().collect())
    }
}

struct PollingTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Keeps the set of workers this queue may currently draw from.
///
/// With no default deployments every worker is allowed until the
/// coordination service says otherwise. A failed poll keeps the previous set.
pub struct WorkerUtilizationStatusPoller {
    service: Arc<dyn CoordinationService>,
    default_deployments: Vec<DeploymentDestination>,
    poll_interval: Duration,
    /// `None` means unrestricted.
    permitted: RwLock<Option<HashSet<WorkerId>>>,
    polling: Mutex<Option<PollingTask>>,
}

impl WorkerUtilizationStatusPoller {
    pub fn new(
        service: Arc<dyn CoordinationService>,
        default_deployments: Vec<DeploymentDestination>,
        poll_interval: Duration,
    ) -> Self {
        let permitted = Self::default_set(&default_deployments);
        Self {
            service,
            default_deployments,
            poll_interval,
            permitted: RwLock::new(permitted),
            polling: Mutex::new(None),
        }
    }

    /// A gate that lets every worker through and never polls anything.
    pub fn unrestricted() -> Self {
        Self::new(
            Arc::new(StaticCoordinationService),
            Vec::new(),
            Duration::from_secs(60),
        )
    }

    fn default_set(deployments: &[DeploymentDestination]) -> Option<HashSet<WorkerId>> {
        if deployments.is_empty() {
            None
        } else {
            Some(worker_ids(deployments).into_iter().collect())
        }
    }

    pub fn default_deployments(&self) -> &[DeploymentDestination] {
        &self.default_deployments
    }

    /// Start refreshing the permitted set every poll interval. No-op if already polling.
    pub async fn start_polling(self: &Arc<Self>) {
        let mut polling = self.polling.lock().await;
        if polling.is_some() {
            return;
        }
        tracing::debug!(interval = ?self.poll_interval, "Starting polling workers to utilize");

        let cancel = CancellationToken::new();
        let poller = Arc::clone(self);
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poller.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        // Errors are logged inside; the last good set stays in place.
                        let _ = poller.fetch_workers_to_utilize().await;
                    }
                }
            }
        });
        *polling = Some(PollingTask { cancel, handle });
    }

    /// Stop polling and go back to the statically configured workers.
    pub async fn stop_polling_and_restore_default_config(&self) {
        if let Some(task) = self.polling.lock().await.take() {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                tracing::warn!(error = %e, "Utilization polling task ended abnormally");
            }
        }
        tracing::debug!("Stopped polling workers to utilize, restoring defaults");
        *self.permitted.write().await = Self::default_set(&self.default_deployments);
    }

    /// Ask the coordination service once and replace the permitted set on success.
    pub async fn fetch_workers_to_utilize(&self) -> Result<usize> {
        match self
            .service
            .workers_to_utilize(&self.default_deployments)
            .await
        {
            Ok(workers) => {
                let count = workers.len();
                tracing::debug!(workers = ?workers, "Fetched workers to utilize");
                *self.permitted.write().await = Some(workers);
                Ok(count)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to fetch workers to utilize, keeping previous set");
                Err(e)
            }
        }
    }

    pub async fn utilization_permission_for_worker(
        &self,
        worker_id: &WorkerId,
    ) -> WorkerUtilizationPermission {
        match self.permitted.read().await.as_ref() {
            Some(workers) if !workers.contains(worker_id) => {
                WorkerUtilizationPermission::NotAllowedToUtilize
            }
            _ => WorkerUtilizationPermission::AllowedToUtilize,
        }
    }

    /// Number of permitted workers, if the set is restricted.
    pub async fn permitted_worker_count(&self) -> Option<usize> {
        self.permitted.read().await.as_ref().map(HashSet::len)
    }
}
