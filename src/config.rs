use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the control plane
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Public listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Instance store
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Container runtime and provisioning settings
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Reverse proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Application-level health probe
    #[serde(default)]
    pub health: HealthConfig,

    /// Periodic status reconciliation
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port serving both the management API and the instance proxy (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Which runtime driver variant to use
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Docker Engine API over a local socket or a remote endpoint (default)
    #[default]
    Api,
    /// The `docker` command line client
    Cli,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Driver variant: "api" (default) or "cli"
    #[serde(default)]
    pub driver: DriverKind,

    /// Docker host URL for the API driver (default: DOCKER_HOST or the platform socket)
    pub docker_host: Option<String>,

    /// Path to the docker binary for the CLI driver
    #[serde(default = "default_cli_path")]
    pub cli_path: String,

    /// Backend image every instance runs
    #[serde(default = "default_image")]
    pub image: String,

    /// Port the backend listens on inside the container
    #[serde(default = "default_container_port")]
    pub container_port: u16,

    /// Host interface the published port binds to
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Container names are "{container_prefix}-{instance id}"
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,

    /// First host port handed out to instances
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// Last host port handed out to instances (inclusive)
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// Upper bound for a single runtime call in seconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Upper bound for an image pull in seconds
    #[serde(default = "default_pull_timeout")]
    pub pull_timeout_secs: u64,

    /// Extra environment variables passed to every backend
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::default(),
            docker_host: None,
            cli_path: default_cli_path(),
            image: default_image(),
            container_port: default_container_port(),
            bind_host: default_bind_host(),
            container_prefix: default_container_prefix(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            command_timeout_secs: default_command_timeout(),
            pull_timeout_secs: default_pull_timeout(),
            env: HashMap::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }

    /// Human-readable port range, e.g. "3000-3100"
    pub fn port_range_label(&self) -> String {
        format!("{}-{}", self.port_range_start, self.port_range_end)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Upstream request timeout in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Host used to reach instance backends
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,

    /// Maximum idle connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            upstream_host: default_upstream_host(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    /// Backend health endpoint path
    #[serde(default = "default_health_path")]
    pub path: String,

    /// Probe timeout in seconds
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            timeout_secs: default_health_timeout(),
        }
    }
}

impl HealthConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconcilerConfig {
    /// Run the periodic reconciliation loop (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between passes
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,

    /// Instances reconciled in parallel within a pass
    #[serde(default = "default_reconcile_concurrency")]
    pub concurrency: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_reconcile_interval(),
            concurrency: default_reconcile_concurrency(),
        }
    }
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_database_path() -> String {
    "./data/tenantgate.db".to_string()
}

fn default_cli_path() -> String {
    "docker".to_string()
}

fn default_image() -> String {
    "aldinokemal2104/go-whatsapp-web-multidevice:latest".to_string()
}

fn default_container_port() -> u16 {
    3000
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_container_prefix() -> String {
    "tenant".to_string()
}

fn default_port_range_start() -> u16 {
    3000
}

fn default_port_range_end() -> u16 {
    3100
}

fn default_command_timeout() -> u64 {
    30
}

fn default_pull_timeout() -> u64 {
    600 // 10 minutes, large images on slow links
}

fn default_request_timeout() -> u64 {
    30
}

fn default_upstream_host() -> String {
    "localhost".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_health_path() -> String {
    "/api/health".to_string()
}

fn default_health_timeout() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_reconcile_concurrency() -> usize {
    8
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();
        let runtime = &self.runtime;

        if runtime.image.trim().is_empty() {
            errors.push("runtime.image must not be empty".to_string());
        }
        if runtime.container_port == 0 {
            errors.push("runtime.container_port must be greater than 0".to_string());
        }
        if runtime.port_range_start == 0 {
            errors.push("runtime.port_range_start must be greater than 0".to_string());
        }
        if runtime.port_range_start > runtime.port_range_end {
            errors.push(format!(
                "runtime.port_range_start ({}) is greater than runtime.port_range_end ({})",
                runtime.port_range_start, runtime.port_range_end
            ));
        }
        if runtime.command_timeout_secs == 0 {
            errors.push("runtime.command_timeout_secs must be greater than 0".to_string());
        }
        if runtime.pull_timeout_secs == 0 {
            errors.push("runtime.pull_timeout_secs must be greater than 0".to_string());
        }
        if self.proxy.request_timeout_secs == 0 {
            errors.push("proxy.request_timeout_secs must be greater than 0".to_string());
        }
        if self.health.timeout_secs == 0 {
            errors.push("health.timeout_secs must be greater than 0".to_string());
        }
        if !self.health.path.starts_with('/') {
            errors.push(format!("health.path '{}' must start with '/'", self.health.path));
        }
        if self.reconciler.enabled && self.reconciler.interval_secs == 0 {
            errors.push("reconciler.interval_secs must be greater than 0".to_string());
        }
        if self.reconciler.concurrency == 0 {
            errors.push("reconciler.concurrency must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
