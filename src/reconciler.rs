//! Periodic reconciliation of recorded instance status against the runtime
//!
//! Each pass inspects every instance that has a container, probes the
//! backend's health endpoint when the runtime reports it running, and writes
//! a new status only when it differs from the recorded one.

use crate::config::ReconcilerConfig;
use crate::error::{ReconcileError, RuntimeError};
use crate::health::SharedHealthProbe;
use crate::instance::{Instance, InstanceStatus};
use crate::registry::SharedRegistry;
use crate::runtime::{RuntimeState, SharedRuntime};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Status derived from the runtime state and, for running containers, the health probe
pub fn map_status(state: RuntimeState, healthy: bool) -> InstanceStatus {
    match state {
        RuntimeState::Running if healthy => InstanceStatus::Running,
        RuntimeState::Running => InstanceStatus::Error,
        RuntimeState::Exited => InstanceStatus::Stopped,
        RuntimeState::Created => InstanceStatus::Creating,
        RuntimeState::Missing | RuntimeState::Unknown => InstanceStatus::Error,
    }
}

/// Status recorded when inspection itself fails
fn status_for_inspect_failure(err: &RuntimeError) -> InstanceStatus {
    match err {
        RuntimeError::Unavailable(_) => InstanceStatus::DockerUnavailable,
        _ => InstanceStatus::Error,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusChange {
    pub id: String,
    pub name: String,
    pub from: InstanceStatus,
    pub to: InstanceStatus,
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Instances with a container that were inspected
    pub checked: usize,
    pub updated: Vec<StatusChange>,
}

pub struct Reconciler {
    registry: SharedRegistry,
    runtime: SharedRuntime,
    health: SharedHealthProbe,
    interval: Duration,
    concurrency: usize,
}

impl Reconciler {
    pub fn new(
        registry: SharedRegistry,
        runtime: SharedRuntime,
        health: SharedHealthProbe,
        config: &ReconcilerConfig,
    ) -> Self {
        Self {
            registry,
            runtime,
            health,
            interval: config.interval(),
            concurrency: config.concurrency.max(1),
        }
    }

    /// Run the reconciler until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Status reconciler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    match self.reconcile_once().await {
                        Ok(report) => {
                            debug!(checked = report.checked, updated = report.updated.len(), "Reconciliation pass complete");
                        }
                        Err(e) => warn!(error = %e, "Reconciliation pass failed"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Status reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass over every instance with a container.
    ///
    /// Fails without writing anything when the daemon is down.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, ReconcileError> {
        if !self.runtime.daemon_healthy().await {
            return Err(ReconcileError::DaemonUnavailable);
        }

        let instances: Vec<Instance> = self
            .registry
            .list()?
            .into_iter()
            .filter(|i| i.runtime_handle.is_some())
            .collect();
        let checked = instances.len();

        let updated: Vec<StatusChange> = stream::iter(instances)
            .map(|instance| self.reconcile_instance(instance))
            .buffer_unordered(self.concurrency)
            .filter_map(|change| async move { change })
            .collect()
            .await;

        for change in &updated {
            info!(
                instance_id = %change.id,
                from = %change.from,
                to = %change.to,
                "Instance status reconciled"
            );
        }

        Ok(ReconcileReport { checked, updated })
    }

    async fn observe(&self, instance: &Instance, handle: &str) -> InstanceStatus {
        match self.runtime.inspect_state(handle).await {
            Ok(RuntimeState::Running) => {
                let healthy = match instance.port {
                    Some(port) => self.health.is_healthy(port).await,
                    None => false,
                };
                map_status(RuntimeState::Running, healthy)
            }
            Ok(state) => map_status(state, false),
            Err(e) => {
                warn!(instance_id = %instance.id, handle, error = %e, "Failed to inspect container");
                status_for_inspect_failure(&e)
            }
        }
    }

    async fn reconcile_instance(&self, instance: Instance) -> Option<StatusChange> {
        let handle = instance.runtime_handle.as_deref()?;
        let observed = self.observe(&instance, handle).await;

        if observed == instance.status {
            return None;
        }

        // The record may have been stopped, removed or deleted since it was listed
        match self
            .registry
            .transition_status(&instance.id, handle, instance.status, observed)
        {
            Ok(Some(_)) => Some(StatusChange {
                id: instance.id.clone(),
                name: instance.name.clone(),
                from: instance.status,
                to: observed,
            }),
            Ok(None) => {
                debug!(instance_id = %instance.id, "Instance changed during reconciliation, skipping");
                None
            }
            Err(e) => {
                error!(instance_id = %instance.id, error = %e, "Failed to record reconciled status");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_status_table() {
        assert_eq!(map_status(RuntimeState::Running, true), InstanceStatus::Running);
        assert_eq!(map_status(RuntimeState::Running, false), InstanceStatus::Error);
        assert_eq!(map_status(RuntimeState::Exited, true), InstanceStatus::Stopped);
        assert_eq!(map_status(RuntimeState::Exited, false), InstanceStatus::Stopped);
        assert_eq!(map_status(RuntimeState::Created, false), InstanceStatus::Creating);
        assert_eq!(map_status(RuntimeState::Missing, true), InstanceStatus::Error);
        assert_eq!(map_status(RuntimeState::Unknown, false), InstanceStatus::Error);
    }

    #[test]
    fn test_inspect_failure_status() {
        assert_eq!(
            status_for_inspect_failure(&RuntimeError::Unavailable("gone".to_string())),
            InstanceStatus::DockerUnavailable
        );
        assert_eq!(
            status_for_inspect_failure(&RuntimeError::CommandFailed("boom".to_string())),
            InstanceStatus::Error
        );
    }

    #[test]
    fn test_report_serialization() {
        let report = ReconcileReport {
            checked: 2,
            updated: vec![StatusChange {
                id: "a".to_string(),
                name: "alpha".to_string(),
                from: InstanceStatus::Running,
                to: InstanceStatus::Stopped,
            }],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["checked"], 2);
        assert_eq!(json["updated"][0]["from"], "running");
        assert_eq!(json["updated"][0]["to"], "stopped");
    }
}
