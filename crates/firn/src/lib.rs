//! # Firn
//!
//! Serves iPXE binaries to network-booting machines over TFTP and HTTP at
//! the same time, sharing one image catalog and one shutdown signal.

use std::net::SocketAddr;
use std::sync::Arc;

use firn_core::{FirnError, Result};
use firn_http::HttpServer;
use firn_tftp::{BootHandler, TftpConfig, TftpServer};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info};

pub use firn_core::{Catalog, ServerConfig, ServerSpec};

/// Sockets handed to [`Server::serve`] by a caller that binds its own.
#[derive(Debug, Default)]
pub struct Listeners {
    pub tcp: Option<TcpListener>,
    pub udp: Option<UdpSocket>,
}

/// Where a transport gets its socket from.
enum Endpoint<S> {
    Bind(SocketAddr),
    Ready(S),
}

/// Runs both transports until cancelled or until one of them fails.
pub struct Server {
    config: ServerConfig,
    catalog: Arc<Catalog>,
}

impl Server {
    pub fn new(config: ServerConfig, catalog: Arc<Catalog>) -> Self {
        Self { config, catalog }
    }

    /// Bind the configured addresses and serve until `token` is cancelled.
    ///
    /// Unset addresses default to `0.0.0.0:69` (TFTP) and `0.0.0.0:8080` (HTTP).
    pub async fn listen_and_serve(&self, token: CancellationToken) -> Result<()> {
        let mut config = self.config.clone();
        config.merge_defaults(&ServerConfig::listen_defaults());

        let tftp = if config.tftp.disabled {
            None
        } else {
            Some(Endpoint::Bind(bind_addr(&config.tftp, "tftp")?))
        };
        let http = if config.http.disabled {
            None
        } else {
            Some(Endpoint::Bind(bind_addr(&config.http, "http")?))
        };

        self.run(config, tftp, http, token).await
    }

    /// Serve on sockets the caller already bound until `token` is cancelled.
    ///
    /// Every enabled transport needs its socket; configured addresses are ignored.
    pub async fn serve(&self, token: CancellationToken, listeners: Listeners) -> Result<()> {
        let mut config = self.config.clone();
        config.merge_defaults(&ServerConfig::serve_defaults());

        let tftp = if config.tftp.disabled {
            None
        } else {
            let socket = listeners.udp.ok_or(FirnError::MissingListener("udp"))?;
            Some(Endpoint::Ready(socket))
        };
        let http = if config.http.disabled {
            None
        } else {
            let listener = listeners.tcp.ok_or(FirnError::MissingListener("tcp"))?;
            Some(Endpoint::Ready(listener))
        };

        self.run(config, tftp, http, token).await
    }

    async fn run(
        &self,
        config: ServerConfig,
        tftp: Option<Endpoint<UdpSocket>>,
        http: Option<Endpoint<TcpListener>>,
        token: CancellationToken,
    ) -> Result<()> {
        let dispatch = config.dispatch();
        // a failing transport stops its sibling without cancelling the caller's token
        let token = token.child_token();
        let mut tasks = JoinSet::new();

        if let Some(endpoint) = tftp {
            let handler = Arc::new(BootHandler::new(self.catalog.clone(), config.tftp.patch.clone()));
            let server = TftpServer::new(
                handler,
                TftpConfig {
                    timeout: config.tftp.timeout,
                    max_block_size: config.tftp.block_size,
                    single_port: config.tftp_single_port,
                },
            );
            let token = token.clone();
            tasks.spawn(
                async move {
                    let result = match endpoint {
                        Endpoint::Bind(addr) => server.listen_and_serve(addr, token).await,
                        Endpoint::Ready(socket) => server.serve(socket, token).await,
                    };
                    result.map_err(|e| FirnError::Other(anyhow::Error::new(e).context("TFTP server")))
                }
                .with_subscriber(dispatch.clone()),
            );
        } else {
            debug!("TFTP server disabled");
        }

        if let Some(endpoint) = http {
            let server = HttpServer::new(self.catalog.clone(), config.http.patch.clone())
                .with_timeout(config.http.timeout)
                .with_dispatch(dispatch.clone());
            let token = token.clone();
            tasks.spawn(
                async move {
                    match endpoint {
                        Endpoint::Bind(addr) => server.listen_and_serve(addr, token).await,
                        Endpoint::Ready(listener) => server.serve(listener, token).await,
                    }
                }
                .with_subscriber(dispatch.clone()),
            );
        } else {
            debug!("HTTP server disabled");
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(FirnError::Other(anyhow::anyhow!("server task failed: {e}")))
            });
            if let Err(e) = result {
                error!(error = %e, "iPXE server failed");
                token.cancel();
                first_error.get_or_insert(e);
            }
        }

        if first_error.is_none() {
            // nothing left running, but the caller still decides when we stop
            token.cancelled().await;
        }
        info!("shutting down iPXE servers");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn bind_addr(spec: &ServerSpec, transport: &str) -> Result<SocketAddr> {
    spec.addr
        .ok_or_else(|| FirnError::InvalidConfig(format!("{transport} listen address is unset")))
}
