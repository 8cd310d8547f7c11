//! Public listener serving the management API and the instance proxy
//!
//! Requests under [`INSTANCE_PREFIX`] go to the proxy, everything else to the
//! management API.

use crate::api::ManagementApi;
use crate::proxy::{InstanceProxy, INSTANCE_PREFIX};
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

pub struct GatewayServer {
    api: Arc<ManagementApi>,
    proxy: Arc<InstanceProxy>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(
        api: Arc<ManagementApi>,
        proxy: Arc<InstanceProxy>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            api,
            proxy,
            shutdown_rx,
        }
    }

    pub async fn run(self, bind_addr: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let api = Arc::clone(&self.api);
                            let proxy = Arc::clone(&self.proxy);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, api, proxy).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    api: Arc<ManagementApi>,
    proxy: Arc<InstanceProxy>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let api = Arc::clone(&api);
        let proxy = Arc::clone(&proxy);
        async move { Ok::<_, hyper::Error>(route(&api, &proxy, req).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Dispatch one request by path prefix
pub async fn route(
    api: &ManagementApi,
    proxy: &InstanceProxy,
    req: Request<Incoming>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    if req.uri().path().starts_with(INSTANCE_PREFIX) {
        proxy.handle(req).await
    } else {
        api.handle(req).await.map(|body| body.map_err(|never| match never {}).boxed())
    }
}
