//! One outgoing file transfer: option negotiation and lock-step DATA/ACK.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, TftpError};
use crate::protocol::{self, DEFAULT_BLOCK_SIZE, Reply, RequestedOptions};

/// Retransmissions of an unacknowledged DATA or OACK packet.
pub const MAX_RETRIES: u32 = 5;

// ACK and ERROR packets are small
const RECV_BUFFER_SIZE: usize = 1024;

/// Where a transfer's packets go and come from.
pub(crate) enum Channel {
    /// A fresh socket connected to the client, i.e. a new transfer ID.
    Dedicated(UdpSocket),
    /// The listening socket, with the serve loop forwarding this peer's datagrams.
    Shared {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        inbox: mpsc::Receiver<Bytes>,
    },
}

impl Channel {
    pub(crate) async fn send(&self, packet: &[u8]) -> std::io::Result<()> {
        match self {
            Channel::Dedicated(socket) => socket.send(packet).await.map(|_| ()),
            Channel::Shared { socket, peer, .. } => socket.send_to(packet, peer).await.map(|_| ()),
        }
    }

    async fn recv(&mut self) -> std::io::Result<Bytes> {
        match self {
            Channel::Dedicated(socket) => {
                let mut buf = vec![0u8; RECV_BUFFER_SIZE];
                let size = socket.recv(&mut buf).await?;
                buf.truncate(size);
                Ok(Bytes::from(buf))
            }
            Channel::Shared { inbox, .. } => inbox.recv().await.ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "server stopped forwarding")
            }),
        }
    }
}

/// Sending side of a read request, handed to [`Handler::handle_read`].
///
/// [`Handler::handle_read`]: crate::Handler::handle_read
pub struct OutgoingTransfer {
    channel: Channel,
    remote: SocketAddr,
    requested: RequestedOptions,
    max_block_size: usize,
    timeout: Duration,
    token: CancellationToken,
    started: bool,
}

impl OutgoingTransfer {
    pub(crate) fn new(
        channel: Channel,
        remote: SocketAddr,
        requested: RequestedOptions,
        max_block_size: usize,
        timeout: Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            channel,
            remote,
            requested,
            max_block_size,
            timeout,
            token,
            started: false,
        }
    }

    /// Address of the client that asked for the file.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Send `content` to the client. Returns the number of payload bytes
    /// the client acknowledged.
    ///
    /// Can only be called once per transfer.
    pub async fn read_from(&mut self, content: Bytes) -> Result<u64> {
        if self.started {
            return Err(TftpError::Tftp("transfer already started".to_string()));
        }
        self.started = true;

        let mut block_size = DEFAULT_BLOCK_SIZE;
        let mut negotiated = Vec::new();
        if let Some(requested) = self.requested.block_size {
            block_size = requested.min(self.max_block_size);
            negotiated.push(("blksize", block_size.to_string()));
        }
        if let Some(timeout) = self.requested.timeout {
            self.timeout = Duration::from_secs(timeout);
            negotiated.push(("timeout", timeout.to_string()));
        }
        if self.requested.transfer_size {
            negotiated.push(("tsize", content.len().to_string()));
        }

        if !negotiated.is_empty() {
            debug!(client = %self.remote, options = ?negotiated, "sending OACK");
            let oack = protocol::oack_packet(&negotiated);
            self.exchange(&oack, 0).await?;
        }

        let mut block: u16 = 1;
        let mut offset = 0;
        loop {
            let end = (offset + block_size).min(content.len());
            let packet = protocol::data_packet(block, &content[offset..end]);
            self.exchange(&packet, block).await?;

            let sent = end - offset;
            offset = end;
            // RFC 1350: a block shorter than the block size ends the transfer
            if sent < block_size {
                break;
            }
            block = block.wrapping_add(1);
        }

        debug!(client = %self.remote, blocks = block, bytes = content.len(), "transfer complete");
        Ok(content.len() as u64)
    }

    /// Send `packet` until the client acknowledges `expected`.
    async fn exchange(&mut self, packet: &[u8], expected: u16) -> Result<()> {
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                debug!(client = %self.remote, block = expected, attempt, "retransmitting");
            }
            self.channel.send(packet).await?;

            let deadline = Instant::now() + self.timeout;
            loop {
                let received = tokio::select! {
                    _ = self.token.cancelled() => return Err(TftpError::Cancelled),
                    received = tokio::time::timeout_at(deadline, self.channel.recv()) => received,
                };
                let Ok(datagram) = received else {
                    break;
                };

                match protocol::parse_reply(&datagram?) {
                    Ok(Reply::Ack(block)) if block == expected => return Ok(()),
                    Ok(Reply::Ack(block)) => {
                        debug!(client = %self.remote, block, expected, "ignoring stale ACK");
                    }
                    Ok(Reply::Error { code, message }) => {
                        return Err(TftpError::Client { code, message });
                    }
                    Ok(Reply::Unexpected(opcode)) => {
                        warn!(client = %self.remote, ?opcode, "expected ACK");
                    }
                    Err(e) => {
                        warn!(client = %self.remote, error = %e, "invalid packet during transfer");
                    }
                }
            }
        }

        Err(TftpError::Timeout(expected))
    }

    /// End the transfer with an ERROR packet, unless the client already
    /// gave up or the server is stopping.
    pub(crate) async fn abort(&self, error: &TftpError) {
        send_error(&self.channel, error).await;
    }
}

pub(crate) async fn send_error(channel: &Channel, error: &TftpError) {
    if !error.notify_peer() {
        return;
    }
    let packet = protocol::error_packet(error.code(), &error.to_string());
    if let Err(e) = channel.send(&packet).await {
        debug!(error = %e, "failed to send ERROR packet");
    }
}
