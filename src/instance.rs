//! Instance records managed by the control plane

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Recorded status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Record exists, container not (yet) running
    Creating,
    /// Container active and answering its health probe
    Running,
    /// Container stopped, or removed
    Stopped,
    /// A runtime operation or health probe failed
    Error,
    /// Never provisioned
    NotCreated,
    /// The runtime daemon could not be reached
    DockerUnavailable,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Creating => "creating",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Error => "error",
            InstanceStatus::NotCreated => "not_created",
            InstanceStatus::DockerUnavailable => "docker_unavailable",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(InstanceStatus::Creating),
            "running" => Ok(InstanceStatus::Running),
            "stopped" => Ok(InstanceStatus::Stopped),
            "error" => Ok(InstanceStatus::Error),
            "not_created" => Ok(InstanceStatus::NotCreated),
            "docker_unavailable" => Ok(InstanceStatus::DockerUnavailable),
            other => Err(format!("unknown instance status '{}'", other)),
        }
    }
}

/// A tenant instance and its control-plane metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    pub name: String,
    /// Runtime's container id; `None` until provisioned and after removal
    pub runtime_handle: Option<String>,
    /// Host port published for the backend
    pub port: Option<u16>,
    pub status: InstanceStatus,
    pub webhook_url: Option<String>,
    #[serde(skip_serializing)]
    pub webhook_secret: Option<String>,
    pub last_activity: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    /// Base URL of the backend, reachable only while a port is assigned
    pub fn api_url(&self, host: &str) -> Option<String> {
        self.port.map(|port| format!("http://{}:{}", host, port))
    }
}

/// Fields supplied when an instance is first recorded
#[derive(Debug, Clone, Default)]
pub struct NewInstance {
    pub name: String,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
}

/// A set of field changes applied to one instance in a single write.
///
/// Outer `None` leaves a field untouched; for nullable fields `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstancePatch {
    pub name: Option<String>,
    pub webhook_url: Option<Option<String>>,
    pub webhook_secret: Option<Option<String>>,
    pub runtime_handle: Option<Option<String>>,
    pub port: Option<Option<u16>>,
    pub status: Option<InstanceStatus>,
    pub last_activity: Option<DateTime<Utc>>,
}

impl InstancePatch {
    pub fn status(status: InstanceStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Bind a freshly provisioned container
    pub fn provisioned(handle: String, port: u16) -> Self {
        Self {
            runtime_handle: Some(Some(handle)),
            port: Some(Some(port)),
            status: Some(InstanceStatus::Running),
            ..Default::default()
        }
    }

    /// Detach a removed container, releasing its port
    pub fn removed() -> Self {
        Self {
            runtime_handle: Some(None),
            port: Some(None),
            status: Some(InstanceStatus::Stopped),
            ..Default::default()
        }
    }

    pub fn activity(at: DateTime<Utc>) -> Self {
        Self {
            last_activity: Some(at),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
