//! Where workers live and how they get started.
//!
//! Copying binaries to remote machines is handled by an injected
//! [`WorkerDeployer`]; this crate only decides when to call it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::scheduler::bucket::WorkerId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeploymentDestination {
    pub worker_id: WorkerId,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl DeploymentDestination {
    pub fn new(worker_id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            worker_id: WorkerId::new(worker_id),
            host: host.into(),
            port: default_ssh_port(),
            username: None,
        }
    }

    /// Parse `worker_id=user@host:port`, where user and port are optional.
    pub fn parse(raw: &str) -> Option<Self> {
        let (worker_id, target) = raw.split_once('=')?;
        let (username, host_port) = match target.split_once('@') {
            Some((user, rest)) => (Some(user.to_string()), rest),
            None => (None, target),
        };
        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().ok()?),
            None => (host_port, default_ssh_port()),
        };
        if worker_id.is_empty() || host.is_empty() {
            return None;
        }
        Some(Self {
            worker_id: WorkerId::new(worker_id),
            host: host.to_string(),
            port,
            username,
        })
    }
}

pub fn worker_ids(destinations: &[DeploymentDestination]) -> Vec<WorkerId> {
    destinations.iter().map(|d| d.worker_id.clone()).collect()
}

#[async_trait]
pub trait WorkerDeployer: Send + Sync {
    /// Ship the worker binary to every destination and start it.
    async fn deploy_and_start_workers(&self, destinations: &[DeploymentDestination]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_destination() {
        let d = DeploymentDestination::parse("mac-01=ci@10.0.0.5:2222").unwrap();
        assert_eq!(d.worker_id, WorkerId::new("mac-01"));
        assert_eq!(d.username.as_deref(), Some("ci"));
        assert_eq!(d.host, "10.0.0.5");
        assert_eq!(d.port, 2222);
    }

    #[test]
    fn parse_minimal_destination() {
        let d = DeploymentDestination::parse("w=host.local").unwrap();
        assert_eq!(d.port, 22);
        assert!(d.username.is_none());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(DeploymentDestination::parse("no-equals-sign").is_none());
        assert!(DeploymentDestination::parse("=host").is_none());
        assert!(DeploymentDestination::parse("w=host:notaport").is_none());
    }
}
