//! # Firn HTTP
//!
//! Serves the iPXE image catalog over plain HTTP. Any path resolves to the
//! catalog entry named by its last segment; only GET and HEAD are allowed.
//!
//! Responses always carry the whole image. `Range` and conditional headers
//! (`If-None-Match`, `If-Modified-Since`, ...) are not interpreted, so a
//! ranged GET gets `200 OK` with the full body.

mod boot;

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use bytes::Bytes;
use firn_core::{Catalog, RequestHandler, Result, Transport};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{Dispatch, info, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HttpServer {
    state: AppState,
    timeout: Duration,
}

#[derive(Clone)]
pub struct AppState {
    handler: Arc<RequestHandler>,
    dispatch: Dispatch,
}

impl HttpServer {
    pub fn new(catalog: Arc<Catalog>, patch: Bytes) -> Self {
        Self {
            state: AppState {
                handler: Arc::new(RequestHandler::new(Transport::Http, catalog, patch)),
                dispatch: tracing::dispatcher::get_default(Dispatch::clone),
            },
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Per-request timeout. A request still running when it expires gets a 408.
    /// Also bounds how long shutdown waits for responses still being written.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Log sink for request handling. Defaults to the one current at construction.
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.state.dispatch = dispatch;
        self
    }

    pub fn router(&self) -> Router {
        Router::new()
            .fallback(boot::serve_image)
            .with_state(self.state.clone())
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                self.timeout,
            ))
            .layer(TraceLayer::new_for_http())
    }

    /// Bind `addr` and serve until `token` is cancelled.
    pub async fn listen_and_serve(&self, addr: SocketAddr, token: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, token).await
    }

    /// Serve connections from `listener` until `token` is cancelled, then
    /// give open connections up to the request timeout to finish.
    pub async fn serve(&self, listener: TcpListener, token: CancellationToken) -> Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, timeout = ?self.timeout, "HTTP server listening");

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(token.clone().cancelled_owned())
            .into_future();
        tokio::pin!(server);

        tokio::select! {
            result = &mut server => result?,
            _ = token.cancelled() => {
                match tokio::time::timeout(self.timeout, &mut server).await {
                    Ok(result) => result?,
                    Err(_) => warn!(
                        addr = %addr,
                        grace = ?self.timeout,
                        "HTTP connections still open after shutdown grace period, dropping them"
                    ),
                }
            }
        }

        info!(addr = %addr, "HTTP server stopped");
        Ok(())
    }
}
