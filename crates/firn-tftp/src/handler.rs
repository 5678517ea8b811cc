//! Request callbacks and the iPXE image handler.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use firn_core::{
    BootRequest, Catalog, Failure, OutcomeStatus, RequestHandler, RequestKind, Responder,
    Transport,
};

use crate::error::{Result, TftpError};
use crate::transfer::OutgoingTransfer;

/// Decides what to do with each request the server accepts.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Serve `filename` through `transfer`. An error is reported to the
    /// client as an ERROR packet.
    async fn handle_read(&self, filename: &str, transfer: &mut OutgoingTransfer) -> Result<()>;

    /// Decide on an upload. Uploads are never received: an error is sent to
    /// the client as is, and `Ok` is answered with "illegal operation".
    async fn handle_write(&self, filename: &str, remote: SocketAddr) -> Result<()>;
}

/// Serves the catalog over TFTP.
#[derive(Debug, Clone)]
pub struct BootHandler {
    inner: RequestHandler,
}

impl BootHandler {
    pub fn new(catalog: Arc<Catalog>, patch: Bytes) -> Self {
        Self {
            inner: RequestHandler::new(Transport::Tftp, catalog, patch),
        }
    }
}

#[async_trait]
impl Handler for BootHandler {
    async fn handle_read(&self, filename: &str, transfer: &mut OutgoingTransfer) -> Result<()> {
        let request = BootRequest {
            kind: RequestKind::Read,
            path: filename.to_string(),
            client: Some(transfer.remote_addr()),
        };
        let mut responder = TransferResponder::new(Some(transfer));
        let outcome = self.inner.handle(&request, &mut responder).await;

        match outcome.status {
            OutcomeStatus::Served => Ok(()),
            _ => Err(responder.into_error(outcome.error)),
        }
    }

    async fn handle_write(&self, filename: &str, remote: SocketAddr) -> Result<()> {
        let request = BootRequest {
            kind: RequestKind::Write,
            path: filename.to_string(),
            client: Some(remote),
        };
        let mut responder = TransferResponder::new(None);
        let outcome = self.inner.handle(&request, &mut responder).await;
        Err(responder.into_error(outcome.error))
    }
}

/// Adapts an [`OutgoingTransfer`] to the shared request handler and keeps
/// what went wrong in TFTP terms.
struct TransferResponder<'a> {
    transfer: Option<&'a mut OutgoingTransfer>,
    rejected: Option<(Failure, String)>,
    transfer_error: Option<TftpError>,
}

impl<'a> TransferResponder<'a> {
    fn new(transfer: Option<&'a mut OutgoingTransfer>) -> Self {
        Self {
            transfer,
            rejected: None,
            transfer_error: None,
        }
    }

    fn into_error(self, fallback: Option<String>) -> TftpError {
        if let Some(e) = self.transfer_error {
            return e;
        }
        match self.rejected {
            Some((Failure::NotFound, message)) => TftpError::FileNotFound(message),
            Some((Failure::PermissionDenied, _)) => {
                TftpError::AccessViolation("permission denied".to_string())
            }
            Some((Failure::MethodNotAllowed, message)) => TftpError::IllegalOperation(message),
            Some((Failure::Internal, message)) => TftpError::Tftp(message),
            None => TftpError::Tftp(fallback.unwrap_or_else(|| "request failed".to_string())),
        }
    }
}

#[async_trait]
impl Responder for TransferResponder<'_> {
    async fn transmit(&mut self, content: Bytes, _headers_only: bool) -> std::io::Result<u64> {
        let Some(transfer) = self.transfer.as_deref_mut() else {
            return Err(std::io::Error::other("no transfer to send on"));
        };
        match transfer.read_from(content).await {
            Ok(sent) => Ok(sent),
            Err(e) => {
                let message = e.to_string();
                self.transfer_error = Some(e);
                Err(std::io::Error::other(message))
            }
        }
    }

    async fn reject(&mut self, failure: Failure, message: &str) {
        self.rejected = Some((failure, message.to_string()));
    }
}
