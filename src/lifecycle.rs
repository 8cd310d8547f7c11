//! Instance lifecycle management
//!
//! The [`LifecycleManager`] drives the container runtime through
//! create/start/stop/remove and records every outcome on the instance.
//! A status of `running` is only ever written after the runtime confirmed a
//! successful create or start.

use crate::config::RuntimeConfig;
use crate::error::LifecycleError;
use crate::health::SharedHealthProbe;
use crate::instance::{Instance, InstancePatch, InstanceStatus, NewInstance};
use crate::ports::PortAllocator;
use crate::registry::SharedRegistry;
use crate::runtime::{ContainerSpec, RuntimeState, SharedRuntime};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

/// Result of a successful provisioning
#[derive(Debug, Clone, Serialize)]
pub struct CreatedInstance {
    pub instance: Instance,
    pub container: ContainerInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerInfo {
    pub handle: String,
    pub port: u16,
    pub name: String,
}

/// Live runtime view of one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeStatus {
    /// The instance has no container
    NotCreated,
    DockerUnavailable,
    /// Inspection failed
    Error,
    State(RuntimeState),
}

impl RuntimeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeStatus::NotCreated => "not_created",
            RuntimeStatus::DockerUnavailable => "docker_unavailable",
            RuntimeStatus::Error => "error",
            RuntimeStatus::State(state) => state.as_str(),
        }
    }
}

impl Serialize for RuntimeStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Combined recorded and observed status for one instance
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub instance_status: InstanceStatus,
    pub runtime_status: RuntimeStatus,
    pub healthy: bool,
    pub api_url: Option<String>,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Runtime environment readiness
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentStatus {
    pub docker_running: bool,
    pub image_available: bool,
    pub image: String,
    pub port_range: String,
}

pub struct LifecycleManager {
    registry: SharedRegistry,
    runtime: SharedRuntime,
    health: SharedHealthProbe,
    allocator: PortAllocator,
    config: RuntimeConfig,
    /// Host used to build backend URLs in status reports
    upstream_host: String,
}

impl LifecycleManager {
    pub fn new(
        registry: SharedRegistry,
        runtime: SharedRuntime,
        health: SharedHealthProbe,
        config: RuntimeConfig,
        upstream_host: impl Into<String>,
    ) -> Self {
        let allocator = PortAllocator::new(config.port_range_start, config.port_range_end);
        Self {
            registry,
            runtime,
            health,
            allocator,
            config,
            upstream_host: upstream_host.into(),
        }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn container_name(&self, instance: &Instance) -> String {
        format!("{}-{}", self.config.container_prefix, instance.id)
    }

    /// Insert a `creating` record and provision its container.
    ///
    /// On failure the record stays in `creating` without a port and the
    /// error is returned.
    pub async fn create_instance(&self, new: NewInstance) -> Result<CreatedInstance, LifecycleError> {
        let instance = self.registry.create(&new)?;
        info!(instance_id = %instance.id, name = %instance.name, "Instance record created");
        self.provision(&instance).await
    }

    /// Run preflight checks, allocate a port and start a container for `instance`
    pub async fn provision(&self, instance: &Instance) -> Result<CreatedInstance, LifecycleError> {
        if !self.runtime.daemon_healthy().await {
            warn!(instance_id = %instance.id, "Docker daemon unavailable, cannot create container");
            return Err(LifecycleError::DaemonUnavailable(
                "daemon did not answer the liveness probe".to_string(),
            ));
        }

        self.ensure_image().await?;

        let lease = loop {
            let used = self.registry.used_ports()?;
            let lease = self.allocator.allocate(&used).await?;
            // Another creation may have persisted this port after `used` was read
            if !self.registry.used_ports()?.contains(&lease.port()) {
                break lease;
            }
        };
        let port = lease.port();

        let spec = ContainerSpec {
            image: self.config.image.clone(),
            name: self.container_name(instance),
            bind_host: self.config.bind_host.clone(),
            host_port: port,
            container_port: self.config.container_port,
            env: self.container_env(instance),
        };

        info!(instance_id = %instance.id, port, name = %spec.name, "Creating container");

        let handle = self.runtime.create_and_start(&spec).await.map_err(|e| {
            error!(instance_id = %instance.id, port, error = %e, "Container creation failed");
            LifecycleError::from(e)
        })?;

        let patch = InstancePatch::provisioned(handle.clone(), port);
        let updated = match self.registry.update(&instance.id, &patch) {
            Ok(Some(updated)) => updated,
            Ok(None) => {
                self.discard_container(&handle).await;
                return Err(LifecycleError::Registry(anyhow::anyhow!(
                    "instance {} disappeared during creation",
                    instance.id
                )));
            }
            Err(e) => {
                self.discard_container(&handle).await;
                return Err(LifecycleError::Registry(e));
            }
        };
        drop(lease);

        info!(instance_id = %instance.id, handle, port, "Instance running");

        Ok(CreatedInstance {
            instance: updated,
            container: ContainerInfo {
                handle,
                port,
                name: spec.name,
            },
        })
    }

    /// Start an existing container
    pub async fn start(&self, instance: &Instance) -> Result<(), LifecycleError> {
        let handle = instance.runtime_handle.as_deref().ok_or(LifecycleError::NotCreated)?;

        if !self.runtime.daemon_healthy().await {
            warn!(instance_id = %instance.id, "Docker daemon unavailable, cannot start");
            return Err(LifecycleError::DaemonUnavailable(
                "daemon did not answer the liveness probe".to_string(),
            ));
        }

        match self.runtime.start(handle).await {
            Ok(()) => {
                self.registry
                    .update(&instance.id, &InstancePatch::status(InstanceStatus::Running))?;
                info!(instance_id = %instance.id, handle, "Instance started");
                Ok(())
            }
            Err(e) => {
                error!(instance_id = %instance.id, handle, error = %e, "Failed to start container");
                if let Err(db_err) = self
                    .registry
                    .update(&instance.id, &InstancePatch::status(InstanceStatus::Error))
                {
                    warn!(instance_id = %instance.id, error = %db_err, "Failed to record start failure");
                }
                Err(e.into())
            }
        }
    }

    /// Stop a running container
    pub async fn stop(&self, instance: &Instance) -> Result<(), LifecycleError> {
        let handle = instance.runtime_handle.as_deref().ok_or(LifecycleError::NotCreated)?;

        self.runtime.stop(handle).await.map_err(|e| {
            error!(instance_id = %instance.id, handle, error = %e, "Failed to stop container");
            LifecycleError::from(e)
        })?;

        self.registry
            .update(&instance.id, &InstancePatch::status(InstanceStatus::Stopped))?;
        info!(instance_id = %instance.id, handle, "Instance stopped");
        Ok(())
    }

    /// Stop and remove the container, then clear handle and port
    pub async fn remove(&self, instance: &Instance) -> Result<(), LifecycleError> {
        let handle = instance.runtime_handle.as_deref().ok_or(LifecycleError::NotCreated)?;

        if let Err(e) = self.runtime.stop(handle).await {
            debug!(instance_id = %instance.id, handle, error = %e, "Stop before remove failed");
        }

        self.runtime.remove(handle).await.map_err(|e| {
            error!(instance_id = %instance.id, handle, error = %e, "Failed to remove container");
            LifecycleError::from(e)
        })?;

        self.registry.update(&instance.id, &InstancePatch::removed())?;
        info!(instance_id = %instance.id, handle, "Container removed");
        Ok(())
    }

    /// Remove the container if any, then delete the record
    pub async fn delete_instance(&self, instance: &Instance) -> Result<(), LifecycleError> {
        if instance.runtime_handle.is_some() {
            self.remove(instance).await?;
        }

        self.registry.delete(&instance.id)?;
        info!(instance_id = %instance.id, name = %instance.name, "Instance deleted");
        Ok(())
    }

    pub async fn runtime_status(&self, instance: &Instance) -> RuntimeStatus {
        let Some(handle) = instance.runtime_handle.as_deref() else {
            return RuntimeStatus::NotCreated;
        };

        if !self.runtime.daemon_healthy().await {
            return RuntimeStatus::DockerUnavailable;
        }

        match self.runtime.inspect_state(handle).await {
            Ok(state) => RuntimeStatus::State(state),
            Err(e) => {
                warn!(instance_id = %instance.id, handle, error = %e, "Failed to inspect container");
                RuntimeStatus::Error
            }
        }
    }

    /// Recorded status, live runtime status and health of one instance
    pub async fn status_report(&self, instance: &Instance) -> StatusReport {
        let runtime_status = self.runtime_status(instance).await;

        let healthy = match (runtime_status, instance.port) {
            (RuntimeStatus::State(RuntimeState::Running), Some(port)) => {
                self.health.is_healthy(port).await
            }
            _ => false,
        };

        StatusReport {
            instance_status: instance.status,
            runtime_status,
            healthy,
            api_url: instance.api_url(&self.upstream_host),
            last_activity: instance.last_activity,
        }
    }

    pub async fn environment_status(&self) -> EnvironmentStatus {
        let docker_running = self.runtime.daemon_healthy().await;

        let image_available = if docker_running {
            match self.runtime.image_present(&self.config.image).await {
                Ok(present) => present,
                Err(e) => {
                    warn!(image = %self.config.image, error = %e, "Failed to check image");
                    false
                }
            }
        } else {
            false
        };

        EnvironmentStatus {
            docker_running,
            image_available,
            image: self.config.image.clone(),
            port_range: self.config.port_range_label(),
        }
    }

    async fn ensure_image(&self) -> Result<(), LifecycleError> {
        let image = &self.config.image;

        match self.runtime.image_present(image).await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            // An unanswered check counts as absent; the pull decides
            Err(e) => warn!(image = %image, error = %e, "Image check failed, pulling anyway"),
        }

        info!(image = %image, "Image not present locally, pulling");
        self.runtime.pull_image(image).await.map_err(|e| {
            error!(image = %image, error = %e, "Image pull failed");
            LifecycleError::ImageUnavailable {
                image: image.clone(),
                reason: e.to_string(),
            }
        })
    }

    fn container_env(&self, instance: &Instance) -> HashMap<String, String> {
        let mut env = self.config.env.clone();
        env.insert(
            "WEBHOOK".to_string(),
            instance.webhook_url.clone().unwrap_or_default(),
        );
        if let Some(secret) = &instance.webhook_secret {
            env.insert("WEBHOOK_SECRET".to_string(), secret.clone());
        }
        env
    }

    /// Remove a container that could not be attached to its record
    async fn discard_container(&self, handle: &str) {
        if let Err(e) = self.runtime.remove(handle).await {
            error!(handle, error = %e, "Failed to remove unattached container");
        }
    }
}
