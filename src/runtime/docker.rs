//! Runtime driver backed by the Docker Engine API

use super::{with_timeout, ContainerSpec, RuntimeDriver, RuntimeState};
use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerStateStatusEnum, HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Seconds the daemon waits for a graceful stop before killing
const STOP_GRACE_SECS: i64 = 10;

/// Driver talking to dockerd (or a compatible engine) over its HTTP API
pub struct DockerDriver {
    client: Docker,
    command_timeout: Duration,
    pull_timeout: Duration,
}

impl DockerDriver {
    /// Create a driver for the configured endpoint.
    ///
    /// Connection priority:
    /// 1. `runtime.docker_host`
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    ///
    /// No request is made here; an unreachable daemon shows up later through
    /// [`RuntimeDriver::daemon_healthy`].
    pub fn new(config: &RuntimeConfig) -> anyhow::Result<Self> {
        // Keep the client's own deadline above ours so pulls are bounded by pull_timeout
        let client_timeout = config.pull_timeout_secs.max(config.command_timeout_secs);

        let client = if let Some(host) = config.docker_host.as_deref() {
            Self::connect_to_host(host, client_timeout)?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host, client_timeout).map_err(|e| {
                anyhow::anyhow!("Failed to use DOCKER_HOST='{}': {}", host, e)
            })?
        } else {
            Self::connect_with_defaults(client_timeout)?
        };

        Ok(Self {
            client,
            command_timeout: config.command_timeout(),
            pull_timeout: config.pull_timeout(),
        })
    }

    fn connect_to_host(host: &str, timeout_secs: u64) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, timeout_secs, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot use Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, timeout_secs, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot use remote endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    fn connect_with_defaults(timeout_secs: u64) -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
            ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
            ("Rancher Desktop", format!("{}/.rd/docker.sock", home)),
            ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
        ];

        for (name, path) in &socket_paths {
            if path.starts_with('/') && !path.starts_with("//") && std::path::Path::new(path).exists() {
                debug!(path, name, "Found Docker socket");
                return Docker::connect_with_socket(path, timeout_secs, bollard::API_DEFAULT_VERSION)
                    .map_err(|e| anyhow::anyhow!("Cannot use Docker socket '{}': {}", path, e));
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot find a Docker socket at common locations. \
                 Set DOCKER_HOST or runtime.docker_host. Underlying error: {}",
                e
            )
        })
    }

    /// Classify a bollard error into a runtime error kind
    fn classify(&self, operation: &'static str, err: DockerError) -> RuntimeError {
        match err {
            DockerError::DockerResponseServerError {
                status_code,
                message,
            } => RuntimeError::CommandFailed(format!("{} (HTTP {})", message, status_code)),
            DockerError::RequestTimeoutError => RuntimeError::Timeout {
                operation,
                after: self.command_timeout,
            },
            other => RuntimeError::Unavailable(other.to_string()),
        }
    }

    async fn force_remove(&self, handle: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(handle, Some(options)).await {
            Ok(_) => {
                debug!(handle, "Removed Docker container");
                Ok(())
            }
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(handle, "Container already gone");
                Ok(())
            }
            Err(e) => Err(self.classify("remove", e)),
        }
    }
}

#[async_trait]
impl RuntimeDriver for DockerDriver {
    async fn daemon_healthy(&self) -> bool {
        let result = with_timeout("ping", self.command_timeout, async {
            self.client
                .ping()
                .await
                .map_err(|e| self.classify("ping", e))
        })
        .await;

        match result {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "Docker daemon is not responding");
                false
            }
        }
    }

    async fn image_present(&self, image: &str) -> Result<bool, RuntimeError> {
        with_timeout("inspect_image", self.command_timeout, async {
            match self.client.inspect_image(image).await {
                Ok(_) => Ok(true),
                Err(DockerError::DockerResponseServerError {
                    status_code: 404, ..
                }) => Ok(false),
                Err(e) => Err(self.classify("inspect_image", e)),
            }
        })
        .await
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        info!(image, "Pulling Docker image");

        with_timeout("pull", self.pull_timeout, async {
            let options = CreateImageOptions {
                from_image: image,
                ..Default::default()
            };

            let mut stream = self.client.create_image(Some(options), None, None);
            let mut last_error = None;

            while let Some(result) = stream.next().await {
                match result {
                    Ok(info) => {
                        if let Some(status) = info.status {
                            debug!(image, status, "Pull progress");
                        }
                        if let Some(error) = info.error {
                            last_error = Some(error);
                        }
                    }
                    Err(e) => {
                        let err_str = e.to_string();
                        if err_str.contains("manifest unknown") || err_str.contains("not found") {
                            return Err(RuntimeError::CommandFailed(format!(
                                "Image '{}' not found in registry. Check the image name and tag.",
                                image
                            )));
                        } else if err_str.contains("unauthorized")
                            || err_str.contains("authentication")
                        {
                            return Err(RuntimeError::CommandFailed(format!(
                                "Authentication required to pull '{}'. Run 'docker login' first.",
                                image
                            )));
                        }
                        return Err(self.classify("pull", e));
                    }
                }
            }

            if let Some(error) = last_error {
                return Err(RuntimeError::CommandFailed(format!(
                    "Failed to pull image '{}': {}",
                    image, error
                )));
            }

            info!(image, "Image pulled successfully");
            Ok(())
        })
        .await
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        // A leftover from an earlier failed attempt would block the name
        if let Err(e) = self.force_remove(&spec.name).await {
            debug!(name = %spec.name, error = %e, "No stale container removed");
        }

        let port_key = format!("{}/tcp", spec.container_port);
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some(spec.bind_host.clone()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        );

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let container_config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env_pairs()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = with_timeout("create", self.command_timeout, async {
            self.client
                .create_container(Some(create_options), container_config)
                .await
                .map_err(|e| self.classify("create", e))
        })
        .await?;

        let handle = response.id;
        debug!(handle, name = %spec.name, image = %spec.image, "Created Docker container");

        let started = with_timeout("start", self.command_timeout, async {
            self.client
                .start_container(&handle, None::<StartContainerOptions<String>>)
                .await
                .map_err(|e| self.classify("start", e))
        })
        .await;

        if let Err(e) = started {
            warn!(handle, error = %e, "Container failed to start, removing it");
            if let Err(cleanup) = self.force_remove(&handle).await {
                warn!(handle, error = %cleanup, "Failed to remove container after start failure");
            }
            let message = e.to_string();
            if message.contains("port is already allocated")
                || message.contains("address already in use")
            {
                return Err(RuntimeError::CommandFailed(format!(
                    "Port {} is already in use on the host: {}",
                    spec.host_port, message
                )));
            }
            return Err(e);
        }

        info!(handle, name = %spec.name, port = spec.host_port, "Started Docker container");
        Ok(handle)
    }

    async fn start(&self, handle: &str) -> Result<(), RuntimeError> {
        with_timeout("start", self.command_timeout, async {
            match self
                .client
                .start_container(handle, None::<StartContainerOptions<String>>)
                .await
            {
                Ok(_) => Ok(()),
                Err(DockerError::DockerResponseServerError {
                    status_code: 304, ..
                }) => {
                    debug!(handle, "Container was already running");
                    Ok(())
                }
                Err(e) => Err(self.classify("start", e)),
            }
        })
        .await
    }

    async fn stop(&self, handle: &str) -> Result<(), RuntimeError> {
        let options = StopContainerOptions { t: STOP_GRACE_SECS };

        with_timeout("stop", self.command_timeout, async {
            match self.client.stop_container(handle, Some(options)).await {
                Ok(_) => {
                    info!(handle, "Stopped Docker container");
                    Ok(())
                }
                Err(DockerError::DockerResponseServerError {
                    status_code: 304, ..
                }) => {
                    debug!(handle, "Container was already stopped");
                    Ok(())
                }
                Err(e) => Err(self.classify("stop", e)),
            }
        })
        .await
    }

    async fn remove(&self, handle: &str) -> Result<(), RuntimeError> {
        with_timeout("remove", self.command_timeout, self.force_remove(handle)).await
    }

    async fn inspect_state(&self, handle: &str) -> Result<RuntimeState, RuntimeError> {
        with_timeout("inspect", self.command_timeout, async {
            match self
                .client
                .inspect_container(handle, None::<InspectContainerOptions>)
                .await
            {
                Ok(info) => Ok(info
                    .state
                    .and_then(|s| s.status)
                    .map(state_from_enum)
                    .unwrap_or(RuntimeState::Unknown)),
                Err(DockerError::DockerResponseServerError {
                    status_code: 404, ..
                }) => Ok(RuntimeState::Missing),
                Err(e) => Err(self.classify("inspect", e)),
            }
        })
        .await
    }
}

fn state_from_enum(status: ContainerStateStatusEnum) -> RuntimeState {
    match status {
        ContainerStateStatusEnum::RUNNING => RuntimeState::Running,
        ContainerStateStatusEnum::EXITED => RuntimeState::Exited,
        ContainerStateStatusEnum::CREATED => RuntimeState::Created,
        _ => RuntimeState::Unknown,
    }
}
