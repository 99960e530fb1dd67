use crate::config_validation::GatewayConfig;
use crate::error::GatewayError;
use crate::reverse_proxy::ReverseProxy;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{debug, error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// The listening gateway: accepts connections and hands each request to the
/// [`ReverseProxy`].
pub struct Gateway {
    proxy: Arc<ReverseProxy>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            proxy: Arc::new(ReverseProxy::new(Arc::new(config))),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        self.proxy.config()
    }

    /// Binds the configured port on all interfaces.
    pub async fn bind(&self) -> Result<TcpListener, GatewayError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config().listen_port));
        info!("Binding HTTP listener to: {}", addr);
        let listener = TcpListener::bind(addr).await?;
        Ok(listener)
    }

    /// Binds the configured port and serves until the task is dropped.
    pub async fn run(self) -> Result<(), GatewayError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serves connections from `listener` until the task is dropped.
    pub async fn serve(self, listener: TcpListener) -> Result<(), GatewayError> {
        let local_addr = listener.local_addr()?;
        info!(
            "Gateway listening on: http://{} ({} routes)",
            local_addr,
            self.config().routes.len()
        );
        for route in self.config().routes.routes() {
            let egress = route.egress.as_ref().or(self.config().global_egress.as_ref());
            match egress {
                Some(egress) => info!("  {} -> {} ({})", route.prefix, route.target_base, egress),
                None => info!("  {} -> {}", route.prefix, route.target_base),
            }
        }

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            debug!("Accepted connection from {}", remote_addr);

            let proxy = self.proxy.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let proxy = proxy.clone();
                    async move { proxy.handle_request(req, remote_addr).await }
                });

                // Dropping the connection drops any in-flight upstream exchange.
                let conn = ServerBuilder::new()
                    .keep_alive(true)
                    .serve_connection(io, service)
                    .with_upgrades();
                if let Err(e) = conn.await {
                    debug!("Connection from {} ended with error: {}", remote_addr, e);
                }
            });
        }
    }
}
