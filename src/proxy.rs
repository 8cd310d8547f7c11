//! Reverse proxy from `/instance/{id}/{subpath}` to the instance backend
//!
//! Only running instances receive traffic. The request method, query string
//! and body are forwarded as received; of the request headers only
//! [`FORWARDED_HEADERS`] pass through. Upstream responses are read in full
//! within the request timeout and then relayed with their status and headers.

use crate::clock::SharedClock;
use crate::config::ProxyConfig;
use crate::error::{proxy_error_response, ProxyErrorCode};
use crate::instance::InstancePatch;
use crate::pool::ConnectionPool;
use crate::registry::SharedRegistry;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::{
    HeaderMap, HeaderName, ACCEPT, AUTHORIZATION, CONTENT_TYPE, TRANSFER_ENCODING, USER_AGENT,
};
use hyper::{Request, Response};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Path prefix routed through the proxy
pub const INSTANCE_PREFIX: &str = "/instance/";

/// Request headers passed to the backend; everything else is dropped
pub const FORWARDED_HEADERS: [HeaderName; 4] = [CONTENT_TYPE, AUTHORIZATION, ACCEPT, USER_AGENT];

/// Split `/instance/{id}/{subpath}` into the id and the sub-path (without leading slash)
pub fn parse_instance_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix(INSTANCE_PREFIX)?;
    let (id, subpath) = rest.split_once('/')?;
    if id.is_empty() {
        return None;
    }
    Some((id, subpath))
}

/// Copy only the allow-listed headers
pub fn filter_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for name in FORWARDED_HEADERS.iter() {
        for value in headers.get_all(name) {
            filtered.append(name.clone(), value.clone());
        }
    }
    filtered
}

fn target_uri(host: &str, port: u16, subpath: &str, query: Option<&str>) -> String {
    match query {
        Some(q) => format!("http://{}:{}/{}?{}", host, port, subpath, q),
        None => format!("http://{}:{}/{}", host, port, subpath),
    }
}

pub struct InstanceProxy {
    registry: SharedRegistry,
    pool: Arc<ConnectionPool>,
    clock: SharedClock,
    request_timeout: Duration,
    upstream_host: String,
}

impl InstanceProxy {
    pub fn new(
        registry: SharedRegistry,
        pool: Arc<ConnectionPool>,
        clock: SharedClock,
        config: &ProxyConfig,
    ) -> Self {
        Self {
            registry,
            pool,
            clock,
            request_timeout: config.request_timeout(),
            upstream_host: config.upstream_host.clone(),
        }
    }

    /// Forward one request. Failures become structured error responses.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<BoxBody<Bytes, hyper::Error>>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        let path = req.uri().path().to_string();

        let Some((id, subpath)) = parse_instance_path(&path) else {
            debug!(path, "Rejected proxy path");
            return proxy_error_response(ProxyErrorCode::InvalidPath, None);
        };

        let instance = match self.registry.get(id) {
            Ok(Some(instance)) => instance,
            Ok(None) => return proxy_error_response(ProxyErrorCode::NotFound, None),
            Err(e) => {
                error!(instance_id = id, error = %e, "Instance lookup failed");
                return proxy_error_response(ProxyErrorCode::ProxyFailure, Some(e.to_string()));
            }
        };

        let port = match instance.port {
            Some(port) if instance.is_running() => port,
            _ => return proxy_error_response(ProxyErrorCode::NotRunning, None),
        };

        let uri = target_uri(&self.upstream_host, port, subpath, req.uri().query());
        debug!(instance_id = id, method = %req.method(), uri, "Forwarding request");

        match tokio::time::timeout(self.request_timeout, self.forward(req, &uri)).await {
            Ok(Ok(response)) => {
                let patch = InstancePatch::activity(self.clock.now());
                if let Err(e) = self.registry.update(&instance.id, &patch) {
                    warn!(instance_id = id, error = %e, "Failed to record last activity");
                }
                response
            }
            Ok(Err(message)) => {
                error!(instance_id = id, port, error = %message, "Proxy request failed");
                proxy_error_response(ProxyErrorCode::ProxyFailure, Some(message))
            }
            Err(_) => {
                warn!(
                    instance_id = id,
                    port,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Proxy request timed out"
                );
                proxy_error_response(
                    ProxyErrorCode::ProxyFailure,
                    Some(format!(
                        "Request timed out after {} seconds",
                        self.request_timeout.as_secs()
                    )),
                )
            }
        }
    }

    async fn forward<B>(
        &self,
        req: Request<B>,
        uri: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, String>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        let (parts, body) = req.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| format!("Failed to read request body: {}", e))?
            .to_bytes();

        let mut upstream = Request::builder()
            .method(parts.method)
            .uri(uri)
            .body(Full::new(body))
            .map_err(|e| e.to_string())?;
        *upstream.headers_mut() = filter_headers(&parts.headers);

        let response = self
            .pool
            .send_request(upstream)
            .await
            .map_err(|e| e.to_string())?;

        let (mut parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| format!("Failed to read upstream response: {}", e))?
            .to_bytes();

        // The body is re-framed from the buffered bytes
        parts.headers.remove(TRANSFER_ENCODING);

        Ok(Response::from_parts(
            parts,
            Full::new(body).map_err(|never| match never {}).boxed(),
        ))
    }
}
