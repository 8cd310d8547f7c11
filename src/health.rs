//! Application-level health probe for instance backends

use crate::config::HealthConfig;
use crate::pool::ConnectionPool;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// True iff the backend on `port` answers its health endpoint with 2xx
    async fn is_healthy(&self, port: u16) -> bool;
}

pub type SharedHealthProbe = Arc<dyn HealthProbe>;

/// Probes `GET http://{host}:{port}{path}` through the shared connection pool
pub struct HttpHealthProbe {
    pool: Arc<ConnectionPool>,
    host: String,
    path: String,
    timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(pool: Arc<ConnectionPool>, host: impl Into<String>, config: &HealthConfig) -> Self {
        Self {
            pool,
            host: host.into(),
            path: config.path.clone(),
            timeout: config.timeout(),
        }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn is_healthy(&self, port: u16) -> bool {
        self.pool
            .check_backend(&self.host, port, &self.path, self.timeout)
            .await
    }
}
