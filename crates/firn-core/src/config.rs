//! Per-transport and aggregate server configuration.
//!
//! Callers may leave any field at its unset value (`None`, zero, empty) and
//! have it filled by [`ServerConfig::merge_defaults`]. A field the caller set
//! is never overwritten.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use tracing::Dispatch;

pub const DEFAULT_TFTP_PORT: u16 = 69;
pub const DEFAULT_HTTP_PORT: u16 = 8080;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// RFC 1350 standard block size
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Settings for one transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerSpec {
    /// Address to listen on. `None` is unset.
    pub addr: Option<SocketAddr>,
    /// Per-request timeout. Zero is unset.
    pub timeout: Duration,
    pub disabled: bool,
    /// Largest block size the TFTP server will negotiate. Zero is unset.
    pub block_size: usize,
    /// Script written over the marker of every image served. Empty disables patching.
    pub patch: Bytes,
}

impl ServerSpec {
    /// Fill every unset field from `defaults`.
    pub fn merge_defaults(&mut self, defaults: &ServerSpec) {
        if self.addr.is_none() {
            self.addr = defaults.addr;
        }
        if self.timeout.is_zero() {
            self.timeout = defaults.timeout;
        }
        if !self.disabled {
            self.disabled = defaults.disabled;
        }
        if self.block_size == 0 {
            self.block_size = defaults.block_size;
        }
        if self.patch.is_empty() {
            self.patch = defaults.patch.clone();
        }
    }
}

/// Configuration for both transports.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub tftp: ServerSpec,
    pub http: ServerSpec,
    /// Log sink for every task the server starts. `None` is unset.
    pub log: Option<Dispatch>,
    /// Run every TFTP transfer over the listening socket instead of a fresh
    /// ephemeral port per transfer. Needed where the host can't hand out
    /// dynamic ports (e.g. a container without host networking); costs
    /// throughput because all transfers share one socket.
    pub tftp_single_port: bool,
}

impl ServerConfig {
    /// Defaults used when the server binds its own sockets.
    pub fn listen_defaults() -> Self {
        Self {
            tftp: ServerSpec {
                addr: Some(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), DEFAULT_TFTP_PORT)),
                timeout: DEFAULT_TIMEOUT,
                block_size: DEFAULT_BLOCK_SIZE,
                ..Default::default()
            },
            http: ServerSpec {
                addr: Some(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), DEFAULT_HTTP_PORT)),
                timeout: DEFAULT_TIMEOUT,
                ..Default::default()
            },
            log: Some(current_dispatch()),
            tftp_single_port: false,
        }
    }

    /// Defaults used when the caller hands over already bound sockets.
    pub fn serve_defaults() -> Self {
        Self {
            tftp: ServerSpec {
                timeout: DEFAULT_TIMEOUT,
                block_size: DEFAULT_BLOCK_SIZE,
                ..Default::default()
            },
            http: ServerSpec {
                timeout: DEFAULT_TIMEOUT,
                ..Default::default()
            },
            log: Some(current_dispatch()),
            tftp_single_port: false,
        }
    }

    /// Fill every unset field from `defaults`.
    pub fn merge_defaults(&mut self, defaults: &ServerConfig) {
        self.tftp.merge_defaults(&defaults.tftp);
        self.http.merge_defaults(&defaults.http);
        if self.log.is_none() {
            self.log = defaults.log.clone();
        }
        if !self.tftp_single_port {
            self.tftp_single_port = defaults.tftp_single_port;
        }
    }

    /// The configured log sink, or the current default one.
    pub fn dispatch(&self) -> Dispatch {
        self.log.clone().unwrap_or_else(current_dispatch)
    }
}

fn current_dispatch() -> Dispatch {
    tracing::dispatcher::get_default(Dispatch::clone)
}
