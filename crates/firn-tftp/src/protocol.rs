//! TFTP wire format.
//!
//! - RFC 1350: The TFTP Protocol (Revision 2)
//! - RFC 2347: Option Extension
//! - RFC 2348: Blocksize Option
//! - RFC 2349: Timeout Interval and Transfer Size Options

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TftpError};

pub const DEFAULT_BLOCK_SIZE: usize = 512; // RFC 1350 standard block size
pub const MIN_BLOCK_SIZE: usize = 8; // RFC 2348
pub const MAX_BLOCK_SIZE: usize = 65464; // RFC 2348 maximum block size
pub const MAX_PACKET_SIZE: usize = MAX_BLOCK_SIZE + 4;

// RFC 1350 strings (filenames, modes, options) are kept under this
const MAX_STRING_LENGTH: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Rrq = 1,   // Read request (RFC 1350)
    Wrq = 2,   // Write request (RFC 1350)
    Data = 3,  // Data packet (RFC 1350)
    Ack = 4,   // Acknowledgment (RFC 1350)
    Error = 5, // Error packet (RFC 1350)
    Oack = 6,  // Option acknowledgment (RFC 2347)
}

impl TryFrom<u16> for Opcode {
    type Error = TftpError;

    fn try_from(value: u16) -> std::result::Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            6 => Ok(Opcode::Oack),
            _ => Err(TftpError::IllegalOperation(format!("invalid opcode: {value}"))),
        }
    }
}

// RFC 1350 - TFTP Error Codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,        // Not defined, see error message
    FileNotFound = 1,      // File not found
    AccessViolation = 2,   // Access violation
    DiskFull = 3,          // Disk full or allocation exceeded
    IllegalOperation = 4,  // Illegal TFTP operation
    UnknownTid = 5,        // Unknown transfer ID
    FileExists = 6,        // File already exists
    NoSuchUser = 7,        // No such user
    OptionNegotiation = 8, // RFC 2347 - Option negotiation failure
}

/// Transfer mode named in a request.
///
/// Images are binary, so `netascii` is served byte-for-byte like `octet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Netascii,
    Octet,
    /// Obsolete, always refused.
    Mail,
}

impl TransferMode {
    fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "netascii" => Ok(TransferMode::Netascii),
            "octet" => Ok(TransferMode::Octet),
            "mail" => Ok(TransferMode::Mail),
            _ => Err(TftpError::IllegalOperation(format!("invalid transfer mode: {s}"))),
        }
    }
}

/// Options a client asked for (RFC 2347). Out of range values are dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestedOptions {
    pub block_size: Option<usize>,
    pub timeout: Option<u64>,
    pub transfer_size: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub filename: String,
    pub mode: TransferMode,
    pub options: RequestedOptions,
}

/// A datagram that opens a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Read(ReadRequest),
    Write { filename: String },
}

/// A datagram received while a transfer is in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ack(u16),
    Error { code: u16, message: String },
    Unexpected(Opcode),
}

/// First two bytes of a datagram, if they name a known opcode.
pub fn peek_opcode(datagram: &[u8]) -> Option<Opcode> {
    let raw = datagram.get(..2)?;
    Opcode::try_from(u16::from_be_bytes([raw[0], raw[1]])).ok()
}

/// Parse an RRQ or WRQ.
pub fn parse_request(datagram: &[u8]) -> Result<Request> {
    let mut bytes = BytesMut::from(datagram);
    if bytes.len() < 2 {
        return Err(TftpError::Tftp("packet too small".to_string()));
    }

    match Opcode::try_from(bytes.get_u16())? {
        Opcode::Rrq => {
            let filename = parse_string(&mut bytes)?;
            let mode = TransferMode::parse(&parse_string(&mut bytes)?)?;
            let options = parse_options(&mut bytes);
            Ok(Request::Read(ReadRequest {
                filename,
                mode,
                options,
            }))
        }
        Opcode::Wrq => {
            let filename = parse_string(&mut bytes)?;
            Ok(Request::Write { filename })
        }
        opcode => Err(TftpError::IllegalOperation(format!(
            "unexpected opcode {opcode:?}"
        ))),
    }
}

fn parse_options(bytes: &mut BytesMut) -> RequestedOptions {
    let mut options = RequestedOptions::default();

    while bytes.has_remaining() {
        let (Ok(name), Ok(value)) = (parse_string(bytes), parse_string(bytes)) else {
            break;
        };

        match name.to_ascii_lowercase().as_str() {
            "blksize" => {
                if let Ok(size) = value.parse::<usize>()
                    && (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&size)
                {
                    options.block_size = Some(size);
                }
            }
            "timeout" => {
                if let Ok(timeout) = value.parse::<u64>()
                    && (1..=255).contains(&timeout)
                {
                    options.timeout = Some(timeout);
                }
            }
            // For RRQ the client sends 0 and the server answers with the real size
            "tsize" => options.transfer_size = true,
            _ => {}
        }
    }

    options
}

/// Parse what a client sent back during a transfer.
pub fn parse_reply(datagram: &[u8]) -> Result<Reply> {
    let mut bytes = BytesMut::from(datagram);
    if bytes.len() < 4 {
        return Err(TftpError::Tftp("packet too small".to_string()));
    }

    match Opcode::try_from(bytes.get_u16())? {
        Opcode::Ack => Ok(Reply::Ack(bytes.get_u16())),
        Opcode::Error => {
            let code = bytes.get_u16();
            let message = parse_string(&mut bytes).unwrap_or_default();
            Ok(Reply::Error { code, message })
        }
        opcode => Ok(Reply::Unexpected(opcode)),
    }
}

pub fn data_packet(block: u16, payload: &[u8]) -> Bytes {
    let mut packet = BytesMut::with_capacity(4 + payload.len());
    packet.put_u16(Opcode::Data as u16);
    packet.put_u16(block);
    packet.put_slice(payload);
    packet.freeze()
}

pub fn error_packet(code: ErrorCode, message: &str) -> Bytes {
    let mut packet = BytesMut::with_capacity(5 + message.len());
    packet.put_u16(Opcode::Error as u16);
    packet.put_u16(code as u16);
    packet.put_slice(message.as_bytes());
    packet.put_u8(0);
    packet.freeze()
}

/// OACK listing `options` in order.
pub fn oack_packet(options: &[(&str, String)]) -> Bytes {
    let mut packet = BytesMut::new();
    packet.put_u16(Opcode::Oack as u16);
    for (name, value) in options {
        packet.put_slice(name.as_bytes());
        packet.put_u8(0);
        packet.put_slice(value.as_bytes());
        packet.put_u8(0);
    }
    packet.freeze()
}

/// Parse a null-terminated string of at most 255 bytes.
fn parse_string(bytes: &mut BytesMut) -> Result<String> {
    let null_pos = bytes
        .iter()
        .take(MAX_STRING_LENGTH + 1)
        .position(|&b| b == 0)
        .ok_or_else(|| {
            if bytes.len() > MAX_STRING_LENGTH {
                TftpError::Tftp("string too long (exceeds 255 bytes)".to_string())
            } else {
                TftpError::Tftp("no null terminator found".to_string())
            }
        })?;

    let string_bytes = bytes.split_to(null_pos);
    bytes.advance(1);

    String::from_utf8(string_bytes.to_vec())
        .map_err(|e| TftpError::Tftp(format!("invalid UTF-8: {e}")))
}
