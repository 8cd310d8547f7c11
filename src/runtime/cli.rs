//! Runtime driver that shells out to the `docker` command line client

use super::{with_timeout, ContainerSpec, RuntimeDriver, RuntimeState};
use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Output of one finished CLI invocation
#[derive(Debug)]
struct CliOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

pub struct CliDriver {
    docker_path: String,
    command_timeout: Duration,
    pull_timeout: Duration,
}

impl CliDriver {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            docker_path: config.cli_path.clone(),
            command_timeout: config.command_timeout(),
            pull_timeout: config.pull_timeout(),
        }
    }

    async fn exec(
        &self,
        operation: &'static str,
        after: Duration,
        args: &[String],
    ) -> Result<CliOutput, RuntimeError> {
        debug!(docker = %self.docker_path, ?args, "Running docker CLI");

        let mut cmd = Command::new(&self.docker_path);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        with_timeout(operation, after, async {
            let output = cmd.output().await.map_err(|e| {
                RuntimeError::Unavailable(format!(
                    "failed to run '{}': {}",
                    self.docker_path, e
                ))
            })?;

            Ok(CliOutput {
                success: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        })
        .await
    }

    /// Run a command and require it to succeed
    async fn run(&self, operation: &'static str, args: &[String]) -> Result<String, RuntimeError> {
        let output = self.exec(operation, self.command_timeout, args).await?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(classify_failure(&output.stderr))
        }
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Map CLI stderr to an error kind
fn classify_failure(stderr: &str) -> RuntimeError {
    let message = stderr.trim();
    if message.contains("Cannot connect to the Docker daemon")
        || message.contains("Is the docker daemon running")
        || message.contains("error during connect")
    {
        RuntimeError::Unavailable(message.to_string())
    } else if message.is_empty() {
        RuntimeError::CommandFailed("docker exited with a failure status".to_string())
    } else {
        RuntimeError::CommandFailed(message.to_string())
    }
}

fn is_missing_container(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("No such object")
}

/// Arguments for `docker run` creating a detached container
fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut out = args(&["run", "-d", "--name"]);
    out.push(spec.name.clone());
    out.push("-p".to_string());
    out.push(format!(
        "{}:{}:{}",
        spec.bind_host, spec.host_port, spec.container_port
    ));
    for pair in spec.env_pairs() {
        out.push("-e".to_string());
        out.push(pair);
    }
    out.push(spec.image.clone());
    out
}

#[async_trait]
impl RuntimeDriver for CliDriver {
    async fn daemon_healthy(&self) -> bool {
        let info_args = args(&["info", "--format", "{{.ServerVersion}}"]);
        match self.run("info", &info_args).await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "Docker daemon is not responding");
                false
            }
        }
    }

    async fn image_present(&self, image: &str) -> Result<bool, RuntimeError> {
        let stdout = self.run("images", &args(&["images", "-q", image])).await?;
        Ok(!stdout.trim().is_empty())
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        info!(image, "Pulling Docker image");
        let output = self
            .exec("pull", self.pull_timeout, &args(&["pull", image]))
            .await?;

        if output.success {
            info!(image, "Image pulled successfully");
            Ok(())
        } else {
            Err(classify_failure(&output.stderr))
        }
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let err = match self.exec("run", self.command_timeout, &run_args(spec)).await {
            Ok(output) if output.success => {
                let handle = output.stdout.trim().to_string();
                info!(handle, name = %spec.name, port = spec.host_port, "Started Docker container");
                return Ok(handle);
            }
            Ok(output) => classify_failure(&output.stderr),
            // A timed out `docker run` may still have reached the daemon
            Err(e) => e,
        };

        // Nothing may stay behind under this name without a handle
        if let Err(e) = self.remove(&spec.name).await {
            warn!(name = %spec.name, error = %e, "Failed to clean up after docker run failure");
        }
        Err(err)
    }

    async fn start(&self, handle: &str) -> Result<(), RuntimeError> {
        self.run("start", &args(&["start", handle])).await?;
        Ok(())
    }

    async fn stop(&self, handle: &str) -> Result<(), RuntimeError> {
        self.run("stop", &args(&["stop", handle])).await?;
        info!(handle, "Stopped Docker container");
        Ok(())
    }

    async fn remove(&self, handle: &str) -> Result<(), RuntimeError> {
        let output = self
            .exec("remove", self.command_timeout, &args(&["rm", "-f", handle]))
            .await?;

        if output.success || is_missing_container(&output.stderr) {
            debug!(handle, "Removed Docker container");
            Ok(())
        } else {
            Err(classify_failure(&output.stderr))
        }
    }

    async fn inspect_state(&self, handle: &str) -> Result<RuntimeState, RuntimeError> {
        let inspect_args = args(&["inspect", "--format", "{{.State.Status}}", handle]);
        let output = self
            .exec("inspect", self.command_timeout, &inspect_args)
            .await?;

        if output.success {
            Ok(RuntimeState::from_status(&output.stdout))
        } else if is_missing_container(&output.stderr) {
            Ok(RuntimeState::Missing)
        } else {
            Err(classify_failure(&output.stderr))
        }
    }
}
