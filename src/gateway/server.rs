use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::settings::Settings;

use super::handler::HttpGateway;

/// TCP accept loop serving the security gateway.
pub struct GatewayServer {
    settings: Arc<Settings>,
    gateway: Arc<HttpGateway>,
}

impl GatewayServer {
    pub fn new(settings: Arc<Settings>, gateway: Arc<HttpGateway>) -> Self {
        Self { settings, gateway }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = &self.settings.server.bind;
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %addr, "Gateway listener started");

        let timeout = Duration::from_secs(self.settings.server.request_timeout_secs);

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!("Failed to accept TCP connection: {}", err);
                    continue;
                }
            };

            let gateway = Arc::clone(&self.gateway);
            let peer_ip = peer_addr.ip();

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let gateway = Arc::clone(&gateway);
                    async move { Ok::<_, Infallible>(gateway.handle(req, peer_ip).await) }
                });

                let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
                let conn = builder.serve_connection(io, service);

                match tokio::time::timeout(timeout, conn).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(peer = %peer_ip, "Connection error: {}", e),
                    Err(_) => debug!(peer = %peer_ip, "Connection timed out"),
                }
            });
        }
    }
}
