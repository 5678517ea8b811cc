use std::net::SocketAddr;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use firn_core::{BootRequest, Failure, RequestKind, Responder};
use tracing::instrument::WithSubscriber;

use crate::AppState;

const NOT_FOUND_BODY: &str = "404 page not found\n";
const METHOD_NOT_ALLOWED_BODY: &str = "Method not allowed";

/// Fallback handler: every path is looked up in the catalog.
pub(crate) async fn serve_image(State(state): State<AppState>, request: Request) -> Response {
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let kind = match *request.method() {
        Method::GET => RequestKind::Read,
        Method::HEAD => RequestKind::Head,
        ref method => RequestKind::Other(method.to_string()),
    };
    let boot = BootRequest {
        kind,
        path: request.uri().path().to_string(),
        client,
    };

    let mut responder = HttpResponder::default();
    state
        .handler
        .handle(&boot, &mut responder)
        .with_subscriber(state.dispatch.clone())
        .await;
    responder.into_response()
}

/// Collects the single response the shared handler decides on.
#[derive(Default)]
struct HttpResponder {
    response: Option<Response>,
}

#[async_trait]
impl Responder for HttpResponder {
    async fn transmit(&mut self, content: Bytes, headers_only: bool) -> std::io::Result<u64> {
        let length = content.len();
        let (body, sent) = if headers_only {
            (Body::empty(), 0)
        } else {
            (Body::from(content), length as u64)
        };
        self.response = Some(
            (
                StatusCode::OK,
                [
                    (
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("application/octet-stream"),
                    ),
                    (header::CONTENT_LENGTH, HeaderValue::from(length)),
                ],
                body,
            )
                .into_response(),
        );
        Ok(sent)
    }

    async fn reject(&mut self, failure: Failure, message: &str) {
        let response = match failure {
            Failure::NotFound => (StatusCode::NOT_FOUND, NOT_FOUND_BODY).into_response(),
            Failure::MethodNotAllowed => (
                StatusCode::METHOD_NOT_ALLOWED,
                [(header::ALLOW, HeaderValue::from_static("GET, HEAD"))],
                METHOD_NOT_ALLOWED_BODY,
            )
                .into_response(),
            Failure::PermissionDenied => (StatusCode::FORBIDDEN, message.to_string()).into_response(),
            Failure::Internal => {
                (StatusCode::INTERNAL_SERVER_ERROR, message.to_string()).into_response()
            }
        };
        self.response = Some(response);
    }
}

impl IntoResponse for HttpResponder {
    fn into_response(self) -> Response {
        self.response
            .unwrap_or_else(|| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}
