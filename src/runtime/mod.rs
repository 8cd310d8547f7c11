//! Container runtime drivers
//!
//! [`RuntimeDriver`] is the only way the rest of the crate touches the
//! container engine. Two variants exist:
//! - [`docker::DockerDriver`] talks to the Docker Engine API, over a local
//!   socket or a remote TCP endpoint
//! - [`cli::CliDriver`] shells out to the `docker` command line client

pub mod cli;
pub mod docker;

use crate::config::{DriverKind, RuntimeConfig};
use crate::error::RuntimeError;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Container state as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    Running,
    Exited,
    Created,
    /// The runtime does not know the handle
    Missing,
    /// Paused, restarting, dead, or anything unrecognized
    Unknown,
}

impl RuntimeState {
    /// Map a runtime status string (`docker inspect --format {{.State.Status}}`)
    pub fn from_status(status: &str) -> Self {
        match status.trim() {
            "running" => RuntimeState::Running,
            "exited" => RuntimeState::Exited,
            "created" => RuntimeState::Created,
            _ => RuntimeState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeState::Running => "running",
            RuntimeState::Exited => "exited",
            RuntimeState::Created => "created",
            RuntimeState::Missing => "missing",
            RuntimeState::Unknown => "unknown",
        }
    }
}

/// Everything needed to create and start one backend container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    /// Host interface the port is published on
    pub bind_host: String,
    pub host_port: u16,
    pub container_port: u16,
    pub env: HashMap<String, String>,
}

impl ContainerSpec {
    /// Environment as `KEY=value` pairs, sorted for stable output
    pub fn env_pairs(&self) -> Vec<String> {
        let mut pairs: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        pairs.sort();
        pairs
    }
}

#[async_trait]
pub trait RuntimeDriver: Send + Sync {
    /// True iff the daemon answers a liveness probe
    async fn daemon_healthy(&self) -> bool;

    async fn image_present(&self, image: &str) -> Result<bool, RuntimeError>;

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Create and start a container. On error nothing is left behind.
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start(&self, handle: &str) -> Result<(), RuntimeError>;

    async fn stop(&self, handle: &str) -> Result<(), RuntimeError>;

    /// Remove a container, stopping it first if it is still active
    async fn remove(&self, handle: &str) -> Result<(), RuntimeError>;

    async fn inspect_state(&self, handle: &str) -> Result<RuntimeState, RuntimeError>;
}

pub type SharedRuntime = Arc<dyn RuntimeDriver>;

/// Build the driver selected in configuration
pub fn from_config(config: &RuntimeConfig) -> anyhow::Result<SharedRuntime> {
    let driver: SharedRuntime = match config.driver {
        DriverKind::Api => Arc::new(docker::DockerDriver::new(config)?),
        DriverKind::Cli => Arc::new(cli::CliDriver::new(config)),
    };
    Ok(driver)
}

/// Bound a runtime call, turning an elapsed deadline into [`RuntimeError::Timeout`]
pub(crate) async fn with_timeout<T, F>(
    operation: &'static str,
    after: Duration,
    fut: F,
) -> Result<T, RuntimeError>
where
    F: Future<Output = Result<T, RuntimeError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(RuntimeError::Timeout { operation, after }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_status() {
        assert_eq!(RuntimeState::from_status("running\n"), RuntimeState::Running);
        assert_eq!(RuntimeState::from_status("exited"), RuntimeState::Exited);
        assert_eq!(RuntimeState::from_status("created"), RuntimeState::Created);
        assert_eq!(RuntimeState::from_status("paused"), RuntimeState::Unknown);
        assert_eq!(RuntimeState::from_status("dead"), RuntimeState::Unknown);
        assert_eq!(RuntimeState::from_status(""), RuntimeState::Unknown);
    }

    #[test]
    fn test_env_pairs_sorted() {
        let spec = ContainerSpec {
            image: "img".to_string(),
            name: "tenant-1".to_string(),
            bind_host: "127.0.0.1".to_string(),
            host_port: 3000,
            container_port: 3000,
            env: HashMap::from([
                ("WEBHOOK".to_string(), "https://x".to_string()),
                ("A".to_string(), "1".to_string()),
            ]),
        };
        assert_eq!(spec.env_pairs(), vec!["A=1", "WEBHOOK=https://x"]);
    }

    #[tokio::test]
    async fn test_with_timeout_elapses() {
        let result: Result<(), RuntimeError> = with_timeout(
            "inspect",
            Duration::from_millis(10),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;

        assert!(matches!(
            result,
            Err(RuntimeError::Timeout { operation: "inspect", .. })
        ));
    }
}
