use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::QueueServerConfig;
use crate::deploy::WorkerDeployer;
use crate::server::api;
use crate::server::QueueServer;
use crate::utilization::{
    CoordinationService, HttpCoordinationService, StaticCoordinationService,
    WorkerUtilizationStatusPoller,
};

/// A queue server process: the façade plus its background tasks.
pub struct QueueNode {
    config: QueueServerConfig,
    server: Arc<QueueServer>,
    deployer: Option<Arc<dyn WorkerDeployer>>,
}

impl QueueNode {
    pub fn new(config: QueueServerConfig) -> Self {
        let coordination: Arc<dyn CoordinationService> = match &config.coordination_url {
            Some(url) => Arc::new(HttpCoordinationService::new(url.clone())),
            None => Arc::new(StaticCoordinationService),
        };
        let utilization = Arc::new(WorkerUtilizationStatusPoller::new(
            coordination,
            config.default_deployments.clone(),
            config.utilization_poll_interval,
        ));
        let server = Arc::new(QueueServer::new(config.clone(), utilization));
        Self {
            config,
            server,
            deployer: None,
        }
    }

    pub fn with_deployer(mut self, deployer: Arc<dyn WorkerDeployer>) -> Self {
        self.deployer = Some(deployer);
        self
    }

    pub fn server(&self) -> Arc<QueueServer> {
        self.server.clone()
    }

    /// Run the node until `shutdown` is cancelled.
    ///
    /// 1. Deploys and starts the configured workers, if a deployer is set
    /// 2. Starts polling the coordination service, if one is configured
    /// 3. Spawns the periodic stuck-bucket scan
    /// 4. Serves the HTTP API (blocks)
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP listener cannot be bound or fails.
    /// Deployment failures are logged; the queue keeps serving whoever connects.
    pub async fn run(self, shutdown: CancellationToken) -> std::io::Result<()> {
        if let Some(deployer) = &self.deployer {
            let destinations = self.server.utilization().default_deployments();
            if !destinations.is_empty() {
                match deployer.deploy_and_start_workers(destinations).await {
                    Ok(()) => tracing::info!(workers = destinations.len(), "Workers deployed"),
                    Err(e) => tracing::error!(error = %e, "Failed to deploy workers"),
                }
            }
        }

        if self.config.coordination_url.is_some() {
            self.server.utilization().start_polling().await;
        }

        let scan_cancel = shutdown.child_token();
        let scan = tokio::spawn(Self::reenqueue_loop(
            self.server.clone(),
            self.config.stuck_bucket_scan_interval,
            scan_cancel.clone(),
        ));

        let served = api::serve(self.config.listen_addr, self.server.clone(), shutdown.clone()).await;

        scan_cancel.cancel();
        if let Err(e) = scan.await {
            tracing::warn!(error = %e, "Stuck bucket scan ended abnormally");
        }
        self.server
            .utilization()
            .stop_polling_and_restore_default_config()
            .await;
        tracing::info!("Queue node stopped");
        served
    }

    /// Scan for stuck buckets every `interval`. Scans never overlap.
    pub async fn reenqueue_loop(
        server: Arc<QueueServer>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so fresh workers get a full interval.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let stuck = server.reenqueue_stuck_buckets().await;
                    if !stuck.is_empty() {
                        tracing::info!(reclaimed = stuck.len(), "Stuck bucket scan finished");
                    }
                }
            }
        }
    }
}
