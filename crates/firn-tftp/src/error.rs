use thiserror::Error;

use crate::protocol::ErrorCode;

#[derive(Error, Debug)]
pub enum TftpError {
    #[error("TFTP error: {0}")]
    Tftp(String),

    #[error("{0}")]
    FileNotFound(String),

    #[error("{0}")]
    AccessViolation(String),

    #[error("{0}")]
    IllegalOperation(String),

    #[error("client sent error {code}: {message}")]
    Client { code: u16, message: String },

    #[error("timeout waiting for ACK of block {0}")]
    Timeout(u16),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TftpError {
    /// Error code put on the wire when this error ends a transfer.
    pub fn code(&self) -> ErrorCode {
        match self {
            TftpError::FileNotFound(_) => ErrorCode::FileNotFound,
            TftpError::AccessViolation(_) => ErrorCode::AccessViolation,
            TftpError::IllegalOperation(_) => ErrorCode::IllegalOperation,
            _ => ErrorCode::NotDefined,
        }
    }

    /// Whether the peer should still be sent an ERROR packet.
    pub(crate) fn notify_peer(&self) -> bool {
        !matches!(self, TftpError::Client { .. } | TftpError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, TftpError>;
