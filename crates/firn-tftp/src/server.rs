//! TFTP serve loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TftpError};
use crate::handler::Handler;
use crate::protocol::{self, DEFAULT_BLOCK_SIZE, MAX_PACKET_SIZE, Opcode, ReadRequest, Request, TransferMode};
use crate::transfer::{self, Channel, OutgoingTransfer};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

// Datagrams queued for one single-port transfer before new ones are dropped
const SESSION_QUEUE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpConfig {
    /// Retransmission timeout when the client doesn't negotiate one.
    pub timeout: Duration,
    /// Largest block size the server agrees to.
    pub max_block_size: usize,
    /// Run all transfers over the listening socket.
    pub single_port: bool,
}

impl Default for TftpConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_block_size: DEFAULT_BLOCK_SIZE,
            single_port: false,
        }
    }
}

pub struct TftpServer {
    handler: Arc<dyn Handler>,
    config: TftpConfig,
}

impl TftpServer {
    pub fn new(handler: Arc<dyn Handler>, config: TftpConfig) -> Self {
        Self { handler, config }
    }

    /// Bind `addr` and serve until `token` is cancelled.
    pub async fn listen_and_serve(&self, addr: SocketAddr, token: CancellationToken) -> Result<()> {
        let socket = UdpSocket::bind(addr).await?;
        self.serve(socket, token).await
    }

    /// Serve requests arriving on `socket` until `token` is cancelled, then
    /// wait for in-flight transfers to stop.
    pub async fn serve(&self, socket: UdpSocket, token: CancellationToken) -> Result<()> {
        let socket = Arc::new(socket);
        let local = socket.local_addr()?;
        let tracker = TaskTracker::new();
        let mut sessions: HashMap<SocketAddr, mpsc::Sender<Bytes>> = HashMap::new();
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        info!(
            addr = %local,
            single_port = self.config.single_port,
            max_block_size = self.config.max_block_size,
            "TFTP server listening"
        );

        let result = loop {
            let (size, peer) = tokio::select! {
                _ = token.cancelled() => break Ok(()),
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    // ICMP port unreachable from an earlier peer surfaces here on some platforms
                    Err(e) if matches!(
                        e.kind(),
                        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionRefused
                    ) => {
                        debug!(error = %e, "ignoring receive error");
                        continue;
                    }
                    Err(e) => {
                        error!(error = %e, "error receiving TFTP packet");
                        break Err(TftpError::Io(e));
                    }
                },
            };
            let datagram = &buf[..size];

            if self.config.single_port {
                if let Some(inbox) = sessions.get(&peer)
                    && !inbox.is_closed()
                {
                    if inbox.try_send(Bytes::copy_from_slice(datagram)).is_err() {
                        debug!(client = %peer, "transfer queue full, dropping packet");
                    }
                    continue;
                }
                sessions.retain(|_, inbox| !inbox.is_closed());
            }

            if matches!(protocol::peek_opcode(datagram), Some(Opcode::Ack | Opcode::Error)) {
                debug!(client = %peer, "ignoring packet for unknown transfer");
                continue;
            }

            let request = protocol::parse_request(datagram);
            let channel = match self.open_channel(&socket, local, peer, &mut sessions).await {
                Ok(channel) => channel,
                Err(e) => {
                    error!(client = %peer, error = %e, "failed to open transfer socket");
                    continue;
                }
            };

            let handler = self.handler.clone();
            let config = self.config.clone();
            let token = token.clone();
            tracker.spawn(
                async move {
                    match request {
                        Ok(Request::Read(request)) => {
                            read(handler, channel, peer, request, config, token).await
                        }
                        Ok(Request::Write { filename }) => write(handler, channel, peer, filename).await,
                        Err(e) => {
                            warn!(client = %peer, error = %e, "invalid TFTP request");
                            transfer::send_error(&channel, &e).await;
                        }
                    }
                }
                .with_current_subscriber(),
            );
        };

        tracker.close();
        tracker.wait().await;
        info!(addr = %local, "TFTP server stopped");
        result
    }

    async fn open_channel(
        &self,
        socket: &Arc<UdpSocket>,
        local: SocketAddr,
        peer: SocketAddr,
        sessions: &mut HashMap<SocketAddr, mpsc::Sender<Bytes>>,
    ) -> std::io::Result<Channel> {
        if self.config.single_port {
            let (inbox_tx, inbox) = mpsc::channel(SESSION_QUEUE);
            sessions.insert(peer, inbox_tx);
            return Ok(Channel::Shared {
                socket: socket.clone(),
                peer,
                inbox,
            });
        }

        // RFC 1350: each transfer gets a new transfer ID
        let transfer_socket = UdpSocket::bind(SocketAddr::new(local.ip(), 0)).await?;
        transfer_socket.connect(peer).await?;
        Ok(Channel::Dedicated(transfer_socket))
    }
}

async fn read(
    handler: Arc<dyn Handler>,
    channel: Channel,
    peer: SocketAddr,
    request: ReadRequest,
    config: TftpConfig,
    token: CancellationToken,
) {
    debug!(
        client = %peer,
        filename = %request.filename,
        mode = ?request.mode,
        options = ?request.options,
        "RRQ"
    );

    if request.mode == TransferMode::Mail {
        warn!(client = %peer, "MAIL mode requested: obsolete and not supported");
        let e = TftpError::IllegalOperation("MAIL mode not supported".to_string());
        transfer::send_error(&channel, &e).await;
        return;
    }

    let mut transfer = OutgoingTransfer::new(
        channel,
        peer,
        request.options,
        config.max_block_size,
        config.timeout,
        token,
    );
    if let Err(e) = handler.handle_read(&request.filename, &mut transfer).await {
        debug!(client = %peer, filename = %request.filename, error = %e, "read request failed");
        transfer.abort(&e).await;
    }
}

async fn write(handler: Arc<dyn Handler>, channel: Channel, peer: SocketAddr, filename: String) {
    debug!(client = %peer, filename = %filename, "WRQ");
    let e = match handler.handle_write(&filename, peer).await {
        Ok(()) => TftpError::IllegalOperation("write not supported".to_string()),
        Err(e) => e,
    };
    transfer::send_error(&channel, &e).await;
}
