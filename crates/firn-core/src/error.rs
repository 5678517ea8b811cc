use thiserror::Error;

use crate::traceparent::TraceTagError;

#[derive(Error, Debug)]
pub enum FirnError {
    #[error("patch is {len} bytes but the marker only holds {capacity}")]
    PatchTooLong { len: usize, capacity: usize },

    #[error("Trace tag error: {0}")]
    TraceTag(#[from] TraceTagError),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0} listener is required for an enabled transport")]
    MissingListener(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FirnError>;
