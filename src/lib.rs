//! Tenantgate - one backend container per tenant, one public endpoint
//!
//! This library provides the control plane for tenant instances:
//! - Provisions a container per instance through a pluggable runtime driver
//!   (Docker Engine API or the `docker` CLI)
//! - Assigns each instance a unique host port from a configured range
//! - Periodically reconciles recorded status against what the runtime reports
//! - Routes `/instance/{id}/...` traffic to the owning backend
//! - Exposes a JSON management API for creating and operating instances

pub mod api;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod instance;
pub mod lifecycle;
pub mod pool;
pub mod ports;
pub mod proxy;
pub mod reconciler;
pub mod registry;
pub mod runtime;
pub mod server;
