//! # Firn Core
//!
//! Transport-independent pieces of the iPXE binary server:
//!
//! - the embedded image catalog
//! - the script patch engine
//! - trace tags carried in requested filenames
//! - the request handler shared by the TFTP and HTTP front ends

pub mod catalog;
pub mod config;
pub mod error;
pub mod handler;
pub mod patch;
pub mod traceparent;
pub mod types;

pub use catalog::Catalog;
pub use config::{ServerConfig, ServerSpec};
pub use error::{FirnError, Result};
pub use handler::{Failure, OutcomeStatus, RequestHandler, RequestOutcome, Responder};
pub use types::{BootRequest, MacAddress, RequestKind, Transport};
