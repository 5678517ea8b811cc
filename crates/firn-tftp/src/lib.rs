//! # Firn TFTP
//!
//! Read-only TFTP server (RFC 1350) with option negotiation (RFC 2347, 2348,
//! 2349) for booting machines fetching iPXE images.
//!
//! Requests are passed to a [`Handler`]; [`BootHandler`] serves a
//! [`firn_core::Catalog`].

pub mod error;
pub mod handler;
pub mod protocol;
pub mod server;
pub mod transfer;

pub use error::{Result, TftpError};
pub use handler::{BootHandler, Handler};
pub use server::{TftpConfig, TftpServer};
pub use transfer::OutgoingTransfer;
