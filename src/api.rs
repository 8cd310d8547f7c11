//! HTTP management API for instances
//!
//! Endpoints:
//! - `GET /health`, `GET /version`
//! - `GET /runtime` runtime environment readiness
//! - `GET /instances`, `POST /instances`
//! - `POST /instances/reconcile` run one reconciliation pass
//! - `GET|PUT|DELETE /instances/{id}`
//! - `POST /instances/{id}/start`, `POST /instances/{id}/stop`
//! - `GET /instances/{id}/status`

use crate::error::{LifecycleError, ReconcileError};
use crate::instance::{Instance, InstancePatch, NewInstance};
use crate::lifecycle::LifecycleManager;
use crate::reconciler::Reconciler;
use crate::registry::SharedRegistry;
use anyhow::Result;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, Response, StatusCode, Uri};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Longest accepted instance name
const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "webhook_url")]
    pub webhook_url: Option<String>,
    #[serde(default, alias = "webhook_secret")]
    pub webhook_secret: Option<String>,
}

/// Partial update; an explicit `null` clears a nullable field
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInstanceRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "webhook_url", deserialize_with = "present")]
    pub webhook_url: Option<Option<String>>,
    #[serde(default, alias = "webhook_secret", deserialize_with = "present")]
    pub webhook_secret: Option<Option<String>>,
}

fn present<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Error body for failed operations
#[derive(Debug, Serialize)]
struct ApiError<'a> {
    error: &'a str,
    message: String,
    kind: &'a str,
}

/// Field-level validation failures, rendered as 422
#[derive(Debug, Default, Serialize)]
pub struct ValidationErrors {
    message: String,
    errors: BTreeMap<&'static str, Vec<String>>,
}

impl ValidationErrors {
    fn add(&mut self, field: &'static str, message: impl Into<String>) {
        let message = message.into();
        if self.message.is_empty() {
            self.message = message.clone();
        }
        self.errors.entry(field).or_default().push(message);
    }

    fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

/// True for absolute http(s) URLs with a host
pub fn is_valid_webhook_url(url: &str) -> bool {
    match url.parse::<Uri>() {
        Ok(uri) => {
            matches!(uri.scheme_str(), Some("http") | Some("https"))
                && uri.authority().is_some_and(|a| !a.host().is_empty())
        }
        Err(_) => false,
    }
}

pub struct ManagementApi {
    lifecycle: Arc<LifecycleManager>,
    reconciler: Arc<Reconciler>,
}

impl ManagementApi {
    pub fn new(lifecycle: Arc<LifecycleManager>, reconciler: Arc<Reconciler>) -> Self {
        Self {
            lifecycle,
            reconciler,
        }
    }

    fn registry(&self) -> &SharedRegistry {
        self.lifecycle.registry()
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(%method, %path, "API request");

        let response = match (&method, path.as_str()) {
            (&Method::GET, "/health") => Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#)),
            (&Method::GET, "/version") => {
                let version = serde_json::json!({
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                });
                Ok(json_response(StatusCode::OK, version.to_string()))
            }
            (&Method::GET, "/runtime") => self.runtime_status().await,
            (&Method::GET, "/instances") => self.list_instances(),
            (&Method::POST, "/instances") => self.create_instance(req).await,
            (&Method::POST, "/instances/reconcile") => self.reconcile().await,
            (_, path) if path.starts_with("/instances/") => {
                let rest = &path["/instances/".len()..];
                let (id, action) = match rest.split_once('/') {
                    Some((id, action)) => (id, Some(action)),
                    None => (rest, None),
                };

                match (&method, action) {
                    (_, _) if id.is_empty() => Ok(json_error(StatusCode::NOT_FOUND, "Not found")),
                    (&Method::GET, None) => self.get_instance(id),
                    (&Method::PUT, None) => self.update_instance(id, req).await,
                    (&Method::DELETE, None) => self.delete_instance(id).await,
                    (&Method::POST, Some("start")) => self.start_instance(id).await,
                    (&Method::POST, Some("stop")) => self.stop_instance(id).await,
                    (&Method::GET, Some("status")) => self.instance_status(id).await,
                    _ => Ok(json_error(StatusCode::NOT_FOUND, "Not found")),
                }
            }
            _ => Ok(json_error(StatusCode::NOT_FOUND, "Not found")),
        };

        response.unwrap_or_else(|e| {
            error!(error = %e, "API error");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal error: {:#}", e),
            )
        })
    }

    fn find(&self, id: &str) -> Result<Option<Instance>> {
        self.registry().get(id)
    }

    fn list_instances(&self) -> Result<Response<Full<Bytes>>> {
        let instances = self.registry().list()?;
        Ok(json_response(StatusCode::OK, serde_json::to_string(&instances)?))
    }

    fn get_instance(&self, id: &str) -> Result<Response<Full<Bytes>>> {
        match self.find(id)? {
            Some(instance) => Ok(json_response(StatusCode::OK, serde_json::to_string(&instance)?)),
            None => Ok(instance_not_found()),
        }
    }

    async fn create_instance<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        let create_req: CreateInstanceRequest = match read_json(req).await {
            Ok(r) => r,
            Err(response) => return Ok(response),
        };

        let mut errors = ValidationErrors::default();
        let name = create_req.name.as_deref().map(str::trim).unwrap_or_default();
        self.validate_name(name, None, true, &mut errors)?;
        validate_webhook(create_req.webhook_url.as_deref(), &mut errors);
        if !errors.is_empty() {
            return Ok(validation_response(&errors));
        }

        let new = NewInstance {
            name: name.to_string(),
            webhook_url: non_empty(create_req.webhook_url),
            webhook_secret: non_empty(create_req.webhook_secret),
        };

        match self.lifecycle.create_instance(new).await {
            Ok(created) => {
                info!(instance_id = %created.instance.id, port = created.container.port, "Instance created via API");
                Ok(json_response(StatusCode::CREATED, serde_json::to_string(&created)?))
            }
            Err(e) => Ok(lifecycle_error("Failed to create instance", &e)),
        }
    }

    async fn update_instance<B>(&self, id: &str, req: Request<B>) -> Result<Response<Full<Bytes>>>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        let Some(instance) = self.find(id)? else {
            return Ok(instance_not_found());
        };

        let update_req: UpdateInstanceRequest = match read_json(req).await {
            Ok(r) => r,
            Err(response) => return Ok(response),
        };

        let mut errors = ValidationErrors::default();
        let name = update_req.name.as_deref().map(str::trim);
        if let Some(name) = name {
            self.validate_name(name, Some(&instance.id), false, &mut errors)?;
        }
        if let Some(url) = &update_req.webhook_url {
            validate_webhook(url.as_deref(), &mut errors);
        }
        if !errors.is_empty() {
            return Ok(validation_response(&errors));
        }

        let patch = InstancePatch {
            name: name.map(str::to_string),
            webhook_url: update_req.webhook_url.map(non_empty),
            webhook_secret: update_req.webhook_secret.map(non_empty),
            ..Default::default()
        };

        if patch.is_empty() {
            return Ok(json_response(StatusCode::OK, serde_json::to_string(&instance)?));
        }

        match self.registry().update(&instance.id, &patch)? {
            Some(updated) => Ok(json_response(StatusCode::OK, serde_json::to_string(&updated)?)),
            None => Ok(instance_not_found()),
        }
    }

    async fn delete_instance(&self, id: &str) -> Result<Response<Full<Bytes>>> {
        let Some(instance) = self.find(id)? else {
            return Ok(instance_not_found());
        };

        match self.lifecycle.delete_instance(&instance).await {
            Ok(()) => Ok(message_response("Instance deleted successfully")),
            Err(e) => Ok(lifecycle_error("Failed to delete instance", &e)),
        }
    }

    async fn start_instance(&self, id: &str) -> Result<Response<Full<Bytes>>> {
        let Some(instance) = self.find(id)? else {
            return Ok(instance_not_found());
        };

        match self.lifecycle.start(&instance).await {
            Ok(()) => Ok(message_response("Instance started successfully")),
            Err(e) => Ok(lifecycle_error("Failed to start instance", &e)),
        }
    }

    async fn stop_instance(&self, id: &str) -> Result<Response<Full<Bytes>>> {
        let Some(instance) = self.find(id)? else {
            return Ok(instance_not_found());
        };

        match self.lifecycle.stop(&instance).await {
            Ok(()) => Ok(message_response("Instance stopped successfully")),
            Err(e) => Ok(lifecycle_error("Failed to stop instance", &e)),
        }
    }

    async fn instance_status(&self, id: &str) -> Result<Response<Full<Bytes>>> {
        let Some(instance) = self.find(id)? else {
            return Ok(instance_not_found());
        };

        let report = self.lifecycle.status_report(&instance).await;
        Ok(json_response(StatusCode::OK, serde_json::to_string(&report)?))
    }

    async fn runtime_status(&self) -> Result<Response<Full<Bytes>>> {
        let status = self.lifecycle.environment_status().await;
        Ok(json_response(StatusCode::OK, serde_json::to_string(&status)?))
    }

    async fn reconcile(&self) -> Result<Response<Full<Bytes>>> {
        match self.reconciler.reconcile_once().await {
            Ok(report) => Ok(json_response(StatusCode::OK, serde_json::to_string(&report)?)),
            Err(e) => {
                let status = match e {
                    ReconcileError::DaemonUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                    ReconcileError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                Ok(error_body(status, "Reconciliation failed", e.to_string(), e.kind()))
            }
        }
    }

    fn validate_name(
        &self,
        name: &str,
        ignore_id: Option<&str>,
        required: bool,
        errors: &mut ValidationErrors,
    ) -> Result<()> {
        if name.is_empty() {
            if required {
                errors.add("name", "The name field is required.");
            } else {
                errors.add("name", "The name field must not be empty.");
            }
            return Ok(());
        }
        if name.chars().count() > MAX_NAME_LEN {
            errors.add(
                "name",
                format!("The name field must not be greater than {} characters.", MAX_NAME_LEN),
            );
            return Ok(());
        }
        if let Some(existing) = self.registry().find_by_name(name)? {
            if Some(existing.id.as_str()) != ignore_id {
                errors.add("name", "The name has already been taken.");
            }
        }
        Ok(())
    }
}

fn validate_webhook(url: Option<&str>, errors: &mut ValidationErrors) {
    if let Some(url) = url.filter(|u| !u.is_empty()) {
        if !is_valid_webhook_url(url) {
            errors.add("webhookUrl", "The webhook url field must be a valid URL.");
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

async fn read_json<T, B>(req: Request<B>) -> std::result::Result<T, Response<Full<Bytes>>>
where
    T: for<'de> Deserialize<'de>,
    B: Body + Send,
    B::Data: Send,
    B::Error: std::fmt::Display,
{
    let body = req.into_body().collect().await.map_err(|e| {
        json_error(StatusCode::BAD_REQUEST, format!("Failed to read body: {}", e))
    })?;

    serde_json::from_slice(&body.to_bytes())
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, format!("Invalid JSON: {}", e)))
}

fn lifecycle_error(summary: &str, err: &LifecycleError) -> Response<Full<Bytes>> {
    error!(error = %err, kind = err.kind(), "{}", summary);
    error_body(err.status_code(), summary, err.to_string(), err.kind())
}

fn error_body(status: StatusCode, summary: &str, message: String, kind: &str) -> Response<Full<Bytes>> {
    let body = ApiError {
        error: summary,
        message,
        kind,
    };
    json_response(status, serde_json::to_string(&body).unwrap_or_default())
}

fn validation_response(errors: &ValidationErrors) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::UNPROCESSABLE_ENTITY,
        serde_json::to_string(errors).unwrap_or_default(),
    )
}

fn instance_not_found() -> Response<Full<Bytes>> {
    json_error(StatusCode::NOT_FOUND, "Instance not found")
}

fn message_response(message: &str) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        serde_json::json!({ "message": message }).to_string(),
    )
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .expect("valid response")
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    json_response(
        status,
        serde_json::json!({ "error": message.into() }).to_string(),
    )
}
