//! Host port allocation for instance backends
//!
//! A candidate port is accepted when no instance record holds it, no other
//! creation in this process has claimed it, and nothing on the host answers
//! a TCP connect on it. Claims are released when the returned [`PortLease`]
//! is dropped, which the lifecycle manager does once the record carries the
//! port (or creation has failed).

use crate::error::PortsExhausted;
use dashmap::DashSet;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Default timeout for the occupancy probe
const PROBE_TIMEOUT: Duration = Duration::from_millis(250);

pub struct PortAllocator {
    start: u16,
    end: u16,
    probe_timeout: Duration,
    claimed: Arc<DashSet<u16>>,
}

/// An in-process claim on a port, released on drop
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    claimed: Arc<DashSet<u16>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.claimed.remove(&self.port);
    }
}

impl PortAllocator {
    /// Allocator over the inclusive range `[start, end]`
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            probe_timeout: PROBE_TIMEOUT,
            claimed: Arc::new(DashSet::new()),
        }
    }

    /// Pick the lowest free port in the range.
    ///
    /// `used` holds the ports recorded on instances.
    pub async fn allocate(&self, used: &HashSet<u16>) -> Result<PortLease, PortsExhausted> {
        for port in self.start..=self.end {
            if used.contains(&port) || self.claimed.contains(&port) {
                continue;
            }

            if self.is_bound(port).await {
                debug!(port, "Port is in use on the host, skipping");
                continue;
            }

            // Another creation may have claimed it while we probed
            if self.claimed.insert(port) {
                debug!(port, "Allocated port");
                return Ok(PortLease {
                    port,
                    claimed: Arc::clone(&self.claimed),
                });
            }
        }

        Err(PortsExhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// True if something accepts connections on the port
    async fn is_bound(&self, port: u16) -> bool {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        matches!(
            tokio::time::timeout(self.probe_timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}
