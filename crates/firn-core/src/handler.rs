//! Transport-independent request handling.
//!
//! Both transports run every request through [`RequestHandler::handle`]:
//! refuse anything but a read, decode an optional trace tag, look the file
//! up, patch it and hand the bytes to the transport's [`Responder`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{Instrument, Span, debug, error, field, info, info_span, warn};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::catalog::Catalog;
use crate::patch;
use crate::traceparent;
use crate::types::{BootRequest, MacAddress, RequestKind, Transport};

/// Why a request could not be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    NotFound,
    PermissionDenied,
    MethodNotAllowed,
    Internal,
}

/// The capabilities a transport gives the handler to answer one request.
#[async_trait]
pub trait Responder: Send {
    /// Send `content` to the client and return the number of body bytes
    /// written. With `headers_only`, advertise the content without sending it.
    async fn transmit(&mut self, content: Bytes, headers_only: bool) -> std::io::Result<u64>;

    /// Answer with a transport-appropriate failure.
    async fn reject(&mut self, failure: Failure, message: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Served,
    NotFound,
    Rejected(Failure),
    InternalError,
    TransmitFailed,
}

/// What happened to one request. Only used for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    /// Name the catalog was searched for.
    pub filename: String,
    /// Basename exactly as the client sent it.
    pub requested: String,
    pub status: OutcomeStatus,
    pub bytes_sent: u64,
    pub content_size: usize,
    pub error: Option<String>,
}

impl RequestOutcome {
    fn new(filename: &str, requested: &str, status: OutcomeStatus) -> Self {
        Self {
            filename: filename.to_string(),
            requested: requested.to_string(),
            status,
            bytes_sent: 0,
            content_size: 0,
            error: None,
        }
    }

    fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn is_served(&self) -> bool {
        self.status == OutcomeStatus::Served
    }
}

/// Serves catalog images for one transport.
#[derive(Debug, Clone)]
pub struct RequestHandler {
    transport: Transport,
    catalog: Arc<Catalog>,
    patch: Bytes,
}

impl RequestHandler {
    pub fn new(transport: Transport, catalog: Arc<Catalog>, patch: Bytes) -> Self {
        Self {
            transport,
            catalog,
            patch,
        }
    }

    pub async fn handle<R>(&self, request: &BootRequest, responder: &mut R) -> RequestOutcome
    where
        R: Responder + ?Sized,
    {
        let requested = basename(&request.path);

        match &request.kind {
            RequestKind::Read | RequestKind::Head => {}
            RequestKind::Write => {
                error!(
                    transport = %self.transport,
                    client = ?request.client,
                    event = "put",
                    filename = requested,
                    "access_violation: permission denied"
                );
                let failure = Failure::PermissionDenied;
                responder.reject(failure, "access_violation: permission denied").await;
                return RequestOutcome::new(requested, requested, OutcomeStatus::Rejected(failure));
            }
            RequestKind::Other(method) => {
                debug!(transport = %self.transport, method = %method, path = %request.path, "method not allowed");
                let failure = Failure::MethodNotAllowed;
                responder.reject(failure, "Method not allowed").await;
                return RequestOutcome::new(requested, requested, OutcomeStatus::Rejected(failure));
            }
        }

        let mac = MacAddress::from_request_path(&request.path);
        let mac = mac.map(|m| m.to_string()).unwrap_or_default();
        let ip = request
            .client
            .map(|addr| addr.ip().to_string())
            .unwrap_or_default();

        let (filename, parent) = match traceparent::extract(requested) {
            Ok(Some(tagged)) => {
                info!(
                    filename = tagged.filename,
                    filename_with_traceparent = requested,
                    "traceparent found in filename"
                );
                (tagged.filename, Some(tagged.parent))
            }
            Ok(None) => (requested, None),
            Err(e) => {
                warn!(filename = requested, error = %e, "failed to extract traceparent from filename");
                (requested, None)
            }
        };

        let span = info_span!(
            "request",
            otel.name = self.transport.span_name(),
            otel.kind = "server",
            otel.status_code = field::Empty,
            otel.status_message = field::Empty,
            filename,
            requested_filename = requested,
            ip = %ip,
            mac = %mac,
        );
        if let Some(parent) = parent {
            span.set_parent(parent.context());
        }

        self.serve(request, filename, requested, responder, &span)
            .instrument(span.clone())
            .await
    }

    async fn serve<R>(
        &self,
        request: &BootRequest,
        filename: &str,
        requested: &str,
        responder: &mut R,
        span: &Span,
    ) -> RequestOutcome
    where
        R: Responder + ?Sized,
    {
        let Some(content) = self.catalog.get(filename) else {
            let message = format!("file [{filename}] unknown: file does not exist");
            info!(filename, client = ?request.client, "file unknown");
            mark_failed(span, &message);
            responder.reject(Failure::NotFound, &message).await;
            return RequestOutcome::new(filename, requested, OutcomeStatus::NotFound).with_error(message);
        };

        let content = match patch::patch(content, &self.patch) {
            Ok(content) => content,
            Err(e) => {
                error!(filename, error = %e, "failed to patch binary");
                mark_failed(span, &e.to_string());
                responder.reject(Failure::Internal, &e.to_string()).await;
                return RequestOutcome::new(filename, requested, OutcomeStatus::InternalError)
                    .with_error(e);
            }
        };

        let content_size = content.len();
        let headers_only = request.kind == RequestKind::Head;
        match responder.transmit(content, headers_only).await {
            Ok(bytes_sent) => {
                info!(
                    filename,
                    client = ?request.client,
                    bytes_sent,
                    content_size,
                    "file served"
                );
                span.record("otel.status_code", "OK");
                RequestOutcome {
                    bytes_sent,
                    content_size,
                    ..RequestOutcome::new(filename, requested, OutcomeStatus::Served)
                }
            }
            Err(e) => {
                error!(filename, client = ?request.client, error = %e, content_size, "file serve failed");
                mark_failed(span, &e.to_string());
                RequestOutcome {
                    content_size,
                    ..RequestOutcome::new(filename, requested, OutcomeStatus::TransmitFailed)
                }
                .with_error(e)
            }
        }
    }
}

fn mark_failed(span: &Span, message: &str) {
    span.record("otel.status_code", "ERROR");
    span.record("otel.status_message", message);
}

/// Final path segment of a request target.
pub fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((_, name)) => name,
        None => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{SNP_EFI, UNDIONLY_KPXE};
    use crate::patch::MARKER;

    const TAGGED: &str = "snp.efi-00-23b1e307bb35484f535a1f772c06910e-d887dc3912240434-01";
    const ZERO_TRACE: &str = "snp.efi-00-00000000000000000000000000000000-d887dc3912240434-01";

    #[derive(Default)]
    struct Recorder {
        sent: Option<(Bytes, bool)>,
        rejected: Option<Failure>,
        fail_transmit: bool,
    }

    #[async_trait]
    impl Responder for Recorder {
        async fn transmit(&mut self, content: Bytes, headers_only: bool) -> std::io::Result<u64> {
            if self.fail_transmit {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "client went away",
                ));
            }
            let n = if headers_only { 0 } else { content.len() as u64 };
            self.sent = Some((content, headers_only));
            Ok(n)
        }

        async fn reject(&mut self, failure: Failure, _message: &str) {
            self.rejected = Some(failure);
        }
    }

    fn snp() -> Bytes {
        let mut content = b"snp header ".to_vec();
        content.extend_from_slice(MARKER);
        content.extend_from_slice(b" snp tail");
        Bytes::from(content)
    }

    fn handler(patch: &'static [u8]) -> RequestHandler {
        let catalog = Catalog::from_entries([
            (SNP_EFI, snp()),
            (UNDIONLY_KPXE, Bytes::from_static(b"bios")),
        ])
        .unwrap();
        RequestHandler::new(Transport::Tftp, Arc::new(catalog), Bytes::from_static(patch))
    }

    fn request(kind: RequestKind, path: &str) -> BootRequest {
        BootRequest {
            kind,
            path: path.to_string(),
            client: Some("127.0.0.1:9999".parse().unwrap()),
        }
    }

    #[tokio::test]
    async fn serves_known_file() {
        let mut responder = Recorder::default();
        let outcome = handler(b"").handle(&request(RequestKind::Read, "snp.efi"), &mut responder).await;

        assert!(outcome.is_served());
        assert_eq!(outcome.bytes_sent, snp().len() as u64);
        assert_eq!(responder.sent.unwrap().0, snp());
    }

    #[tokio::test]
    async fn strips_trace_tag_and_mac_directory() {
        let mut responder = Recorder::default();
        let path = format!("30:23:03:73:a5:a7/{TAGGED}");
        let outcome = handler(b"").handle(&request(RequestKind::Read, &path), &mut responder).await;

        assert!(outcome.is_served());
        assert_eq!(outcome.filename, "snp.efi");
        assert_eq!(outcome.requested, TAGGED);
    }

    #[tokio::test]
    async fn bad_trace_tag_falls_through_to_not_found() {
        let mut responder = Recorder::default();
        let outcome = handler(b"").handle(&request(RequestKind::Read, ZERO_TRACE), &mut responder).await;

        assert_eq!(outcome.status, OutcomeStatus::NotFound);
        assert_eq!(outcome.filename, ZERO_TRACE);
        assert_eq!(responder.rejected, Some(Failure::NotFound));
    }

    #[tokio::test]
    async fn unknown_file_is_not_found() {
        let mut responder = Recorder::default();
        let outcome = handler(b"").handle(&request(RequestKind::Read, "none.efi"), &mut responder).await;

        assert_eq!(outcome.status, OutcomeStatus::NotFound);
        assert!(responder.sent.is_none());
    }

    #[tokio::test]
    async fn write_is_permission_denied() {
        let mut responder = Recorder::default();
        let outcome = handler(b"").handle(&request(RequestKind::Write, "snp.efi"), &mut responder).await;

        assert_eq!(outcome.status, OutcomeStatus::Rejected(Failure::PermissionDenied));
        assert_eq!(responder.rejected, Some(Failure::PermissionDenied));
    }

    #[tokio::test]
    async fn other_methods_are_not_allowed() {
        let mut responder = Recorder::default();
        let outcome = handler(b"")
            .handle(&request(RequestKind::Other("POST".into()), "/snp.efi"), &mut responder)
            .await;

        assert_eq!(outcome.status, OutcomeStatus::Rejected(Failure::MethodNotAllowed));
    }

    #[tokio::test]
    async fn applies_patch() {
        let mut responder = Recorder::default();
        let outcome = handler(b"#!ipxe\necho 'hello world'")
            .handle(&request(RequestKind::Read, "snp.efi"), &mut responder)
            .await;

        assert!(outcome.is_served());
        let (sent, _) = responder.sent.unwrap();
        let expected = patch::patch(&snp(), b"#!ipxe\necho 'hello world'").unwrap();
        assert_eq!(sent, expected);
        assert_ne!(sent, snp());
    }

    #[tokio::test]
    async fn oversized_patch_is_internal_error() {
        let oversized: &'static [u8] = Box::leak(vec![0u8; 500].into_boxed_slice());
        let mut responder = Recorder::default();
        let outcome = handler(oversized)
            .handle(&request(RequestKind::Read, "snp.efi"), &mut responder)
            .await;

        assert_eq!(outcome.status, OutcomeStatus::InternalError);
        assert_eq!(responder.rejected, Some(Failure::Internal));
    }

    #[tokio::test]
    async fn unpatchable_image_ignores_patch() {
        let mut responder = Recorder::default();
        let outcome = handler(b"#!ipxe\nshell")
            .handle(&request(RequestKind::Read, "undionly.kpxe"), &mut responder)
            .await;

        assert!(outcome.is_served());
        assert_eq!(responder.sent.unwrap().0.as_ref(), b"bios");
    }

    #[tokio::test]
    async fn head_advertises_without_body() {
        let mut responder = Recorder::default();
        let outcome = handler(b"").handle(&request(RequestKind::Head, "snp.efi"), &mut responder).await;

        assert!(outcome.is_served());
        assert_eq!(outcome.bytes_sent, 0);
        assert_eq!(outcome.content_size, snp().len());
        assert!(responder.sent.unwrap().1);
    }

    #[tokio::test]
    async fn transmit_failure_is_reported() {
        let mut responder = Recorder {
            fail_transmit: true,
            ..Default::default()
        };
        let outcome = handler(b"").handle(&request(RequestKind::Read, "snp.efi"), &mut responder).await;

        assert_eq!(outcome.status, OutcomeStatus::TransmitFailed);
        assert!(outcome.error.unwrap().contains("client went away"));
    }

    #[test]
    fn basename_takes_last_segment() {
        assert_eq!(basename("/30:23:03:73:a5:a7/snp.efi"), "snp.efi");
        assert_eq!(basename("snp.efi"), "snp.efi");
        assert_eq!(basename("/ipxe/ipxe.efi/"), "ipxe.efi");
        assert_eq!(basename("/"), "");
    }

    /// Records the trace id of the span active while the image is transmitted.
    #[derive(Default)]
    struct TraceCapture {
        trace_id: Option<opentelemetry::trace::TraceId>,
    }

    #[async_trait]
    impl Responder for TraceCapture {
        async fn transmit(&mut self, content: Bytes, _headers_only: bool) -> std::io::Result<u64> {
            use opentelemetry::trace::TraceContextExt;
            let cx = Span::current().context();
            self.trace_id = Some(cx.span().span_context().trace_id());
            Ok(content.len() as u64)
        }

        async fn reject(&mut self, _failure: Failure, _message: &str) {}
    }

    async fn traced(path: &str) -> (RequestOutcome, Option<opentelemetry::trace::TraceId>) {
        use opentelemetry::trace::TracerProvider as _;
        use tracing::instrument::WithSubscriber;
        use tracing_subscriber::layer::SubscriberExt;

        let provider = opentelemetry_sdk::trace::TracerProvider::builder().build();
        let subscriber = tracing_subscriber::registry()
            .with(tracing_opentelemetry::layer().with_tracer(provider.tracer("firn-test")));

        let mut responder = TraceCapture::default();
        let handler = handler(b"");
        let outcome = handler
            .handle(&request(RequestKind::Read, path), &mut responder)
            .with_subscriber(subscriber)
            .await;
        (outcome, responder.trace_id)
    }

    #[tokio::test]
    async fn trace_tag_parents_request_span() {
        let (outcome, trace_id) = traced(&format!("30:23:03:73:a5:a7/{TAGGED}")).await;

        assert!(outcome.is_served());
        assert_eq!(
            trace_id.map(|id| id.to_string()).as_deref(),
            Some("23b1e307bb35484f535a1f772c06910e")
        );
    }

    #[tokio::test]
    async fn untagged_request_starts_new_trace() {
        let (outcome, trace_id) = traced("snp.efi").await;

        assert!(outcome.is_served());
        let trace_id = trace_id.unwrap();
        assert_ne!(trace_id, opentelemetry::trace::TraceId::INVALID);
        assert_ne!(trace_id.to_string(), "23b1e307bb35484f535a1f772c06910e");
    }
}
