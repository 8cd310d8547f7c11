//! Shared fixtures for integration tests
//!
//! - [`FakeRuntime`]: scripted container runtime recording every call
//! - [`StubHealth`]: health probe with a switchable answer
//! - [`FixedClock`]: clock frozen at a known instant
//! - [`spawn_upstream`]: loopback HTTP backend with test endpoints

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tenantgate::clock::Clock;
use tenantgate::config::{ReconcilerConfig, RuntimeConfig};
use tenantgate::db::Database;
use tenantgate::error::RuntimeError;
use tenantgate::health::HealthProbe;
use tenantgate::instance::{Instance, InstancePatch, InstanceStatus, NewInstance};
use tenantgate::lifecycle::LifecycleManager;
use tenantgate::reconciler::Reconciler;
use tenantgate::registry::SharedRegistry;
use tenantgate::runtime::{ContainerSpec, RuntimeDriver, RuntimeState};
use tokio::net::TcpListener;

/// How a scripted runtime call fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Unavailable,
    CommandFailed,
}

impl Failure {
    fn to_error(self, operation: &str) -> RuntimeError {
        match self {
            Failure::Unavailable => RuntimeError::Unavailable(format!("{} failed: daemon gone", operation)),
            Failure::CommandFailed => {
                RuntimeError::CommandFailed(format!("{} failed: scripted failure", operation))
            }
        }
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    daemon_down: AtomicBool,
    image_missing: AtomicBool,
    next_handle: AtomicUsize,
    states: Mutex<HashMap<String, RuntimeState>>,
    failures: Mutex<HashMap<&'static str, Failure>>,
    calls: Mutex<Vec<String>>,
    specs: Mutex<Vec<ContainerSpec>>,
    inspect_hook: Mutex<Option<Box<dyn Fn(&str) + Send + Sync>>>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_daemon_up(&self, up: bool) {
        self.daemon_down.store(!up, Ordering::SeqCst);
    }

    pub fn set_image_missing(&self, missing: bool) {
        self.image_missing.store(missing, Ordering::SeqCst);
    }

    /// Make every later call to `operation` fail
    pub fn fail(&self, operation: &'static str, failure: Failure) {
        self.failures.lock().insert(operation, failure);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    pub fn set_state(&self, handle: &str, state: RuntimeState) {
        self.states.lock().insert(handle.to_string(), state);
    }

    /// Forget a container, as if removed behind our back
    pub fn remove_state(&self, handle: &str) {
        self.states.lock().remove(handle);
    }

    pub fn state(&self, handle: &str) -> Option<RuntimeState> {
        self.states.lock().get(handle).copied()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Calls other than liveness probes
    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("daemon_healthy") && !c.starts_with("inspect_state"))
            .collect()
    }

    /// Run `hook` with the handle at the start of every `inspect_state`
    pub fn on_inspect(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.inspect_hook.lock() = Some(Box::new(hook));
    }

    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.specs.lock().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn scripted(&self, operation: &'static str) -> Result<(), RuntimeError> {
        match self.failures.lock().get(operation) {
            Some(failure) => Err(failure.to_error(operation)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RuntimeDriver for FakeRuntime {
    async fn daemon_healthy(&self) -> bool {
        self.record("daemon_healthy".to_string());
        !self.daemon_down.load(Ordering::SeqCst)
    }

    async fn image_present(&self, image: &str) -> Result<bool, RuntimeError> {
        self.record(format!("image_present:{}", image));
        self.scripted("image_present")?;
        Ok(!self.image_missing.load(Ordering::SeqCst))
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.record(format!("pull_image:{}", image));
        self.scripted("pull_image")?;
        self.image_missing.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.record(format!("create_and_start:{}:{}", spec.name, spec.host_port));
        self.scripted("create_and_start")?;

        let handle = format!("ctr-{}", self.next_handle.fetch_add(1, Ordering::SeqCst) + 1);
        self.states.lock().insert(handle.clone(), RuntimeState::Running);
        self.specs.lock().push(spec.clone());
        Ok(handle)
    }

    async fn start(&self, handle: &str) -> Result<(), RuntimeError> {
        self.record(format!("start:{}", handle));
        self.scripted("start")?;
        self.states.lock().insert(handle.to_string(), RuntimeState::Running);
        Ok(())
    }

    async fn stop(&self, handle: &str) -> Result<(), RuntimeError> {
        self.record(format!("stop:{}", handle));
        self.scripted("stop")?;
        if let Some(state) = self.states.lock().get_mut(handle) {
            *state = RuntimeState::Exited;
        }
        Ok(())
    }

    async fn remove(&self, handle: &str) -> Result<(), RuntimeError> {
        self.record(format!("remove:{}", handle));
        self.scripted("remove")?;
        self.states.lock().remove(handle);
        Ok(())
    }

    async fn inspect_state(&self, handle: &str) -> Result<RuntimeState, RuntimeError> {
        self.record(format!("inspect_state:{}", handle));
        if let Some(hook) = self.inspect_hook.lock().as_ref() {
            hook(handle);
        }
        self.scripted("inspect_state")?;
        Ok(self.state(handle).unwrap_or(RuntimeState::Missing))
    }
}

/// Health probe answering from a switch, or per port when overridden
pub struct StubHealth {
    healthy: AtomicBool,
    unhealthy_ports: Mutex<HashSet<u16>>,
    probes: AtomicUsize,
}

impl StubHealth {
    pub fn new(healthy: bool) -> Arc<Self> {
        Arc::new(Self {
            healthy: AtomicBool::new(healthy),
            unhealthy_ports: Mutex::new(HashSet::new()),
            probes: AtomicUsize::new(0),
        })
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn mark_unhealthy(&self, port: u16) {
        self.unhealthy_ports.lock().insert(port);
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for StubHealth {
    async fn is_healthy(&self, port: u16) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.healthy.load(Ordering::SeqCst) && !self.unhealthy_ports.lock().contains(&port)
    }
}

pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    pub fn at_noon() -> Arc<Self> {
        Arc::new(Self(Utc.with_ymd_and_hms(2025, 6, 17, 12, 0, 0).unwrap()))
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// A start port with `len` following ports that nothing was listening on a moment ago
pub async fn free_port_range(len: u16) -> (u16, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let start = listener.local_addr().unwrap().port();
    drop(listener);
    let start = start.min(u16::MAX - len);
    (start, start + len)
}

/// Lifecycle manager and reconciler over an in-memory database and fake runtime
pub struct Harness {
    pub registry: SharedRegistry,
    pub runtime: Arc<FakeRuntime>,
    pub health: Arc<StubHealth>,
    pub lifecycle: Arc<LifecycleManager>,
    pub reconciler: Arc<Reconciler>,
    pub config: RuntimeConfig,
}

impl Harness {
    pub async fn new() -> Self {
        let (start, end) = free_port_range(40).await;
        Self::with_ports(start, end)
    }

    pub fn with_ports(start: u16, end: u16) -> Self {
        let registry: SharedRegistry = Arc::new(Database::open_in_memory().unwrap());
        let runtime = FakeRuntime::new();
        let health = StubHealth::new(true);

        let config = RuntimeConfig {
            image: "wa-backend:test".to_string(),
            port_range_start: start,
            port_range_end: end,
            env: HashMap::from([("APP_DEBUG".to_string(), "true".to_string())]),
            ..Default::default()
        };

        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::clone(&registry),
            runtime.clone(),
            health.clone(),
            config.clone(),
            "127.0.0.1",
        ));

        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&registry),
            runtime.clone(),
            health.clone(),
            &ReconcilerConfig::default(),
        ));

        Self {
            registry,
            runtime,
            health,
            lifecycle,
            reconciler,
            config,
        }
    }

    /// Insert a record directly, bypassing the runtime
    pub fn seed(
        &self,
        name: &str,
        handle: Option<&str>,
        port: Option<u16>,
        status: InstanceStatus,
    ) -> Instance {
        let instance = self
            .registry
            .create(&NewInstance {
                name: name.to_string(),
                ..Default::default()
            })
            .unwrap();

        let patch = InstancePatch {
            runtime_handle: Some(handle.map(str::to_string)),
            port: Some(port),
            status: Some(status),
            ..Default::default()
        };
        let instance = self.registry.update(&instance.id, &patch).unwrap().unwrap();

        if let Some(handle) = handle {
            let state = match status {
                InstanceStatus::Running => RuntimeState::Running,
                InstanceStatus::Stopped => RuntimeState::Exited,
                _ => RuntimeState::Created,
            };
            self.runtime.set_state(handle, state);
        }

        instance
    }

    pub fn reload(&self, id: &str) -> Instance {
        self.registry.get(id).unwrap().unwrap()
    }
}

/// Backend serving:
/// - `/messages`: `{"messages":[]}`
/// - `/headers`: received request headers as a JSON object
/// - `/echo`: method, path, query and body as JSON
/// - `/slow`: answers after 2 seconds
/// - `/error`: 500 with a plain body
///
/// Every response carries `X-Upstream: mock`.
pub async fn spawn_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(upstream_handler))
                    .await;
            });
        }
    });

    port
}

async fn upstream_handler(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await.map(|b| b.to_bytes()).unwrap_or_default();

    let (status, content_type, payload) = match parts.uri.path() {
        "/messages" => (
            StatusCode::OK,
            "application/json",
            r#"{"messages":[]}"#.to_string(),
        ),
        "/headers" => {
            let headers: serde_json::Map<String, serde_json::Value> = parts
                .headers
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        serde_json::Value::String(value.to_str().unwrap_or_default().to_string()),
                    )
                })
                .collect();
            (
                StatusCode::OK,
                "application/json",
                serde_json::Value::Object(headers).to_string(),
            )
        }
        "/slow" => {
            tokio::time::sleep(Duration::from_secs(2)).await;
            (StatusCode::OK, "text/plain", "slow response".to_string())
        }
        "/error" => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain",
            "backend exploded".to_string(),
        ),
        _ => (
            StatusCode::OK,
            "application/json",
            serde_json::json!({
                "method": parts.method.as_str(),
                "path": parts.uri.path(),
                "query": parts.uri.query(),
                "body": String::from_utf8_lossy(&body),
            })
            .to_string(),
        ),
    };

    Ok(Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .header("X-Upstream", "mock")
        .body(Full::new(Bytes::from(payload)))
        .unwrap())
}
