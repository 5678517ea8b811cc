use std::net::SocketAddr;

/// MAC address representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn to_string_colon(&self) -> String {
        format!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }

    /// Best-effort extraction of a hardware address from the directory part
    /// of a request path, e.g. `0a:00:27:00:00:02/snp.efi` or
    /// `/30:23:03:73:a5:a7/snp.efi`.
    pub fn from_request_path(path: &str) -> Option<Self> {
        let (dir, _) = path.rsplit_once('/')?;
        let dir = dir.trim_start_matches('/');
        dir.rsplit('/').next()?.parse().ok()
    }
}

impl std::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_colon())
    }
}

impl std::str::FromStr for MacAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.replace([':', '-'], "");
        if s.len() != 12 || !s.is_ascii() {
            anyhow::bail!("Invalid MAC address length");
        }

        let mut bytes = [0u8; 6];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)?;
        }

        Ok(MacAddress(bytes))
    }
}

/// The network protocol a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tftp,
    Http,
}

impl Transport {
    /// Name of the per-request span.
    pub fn span_name(&self) -> &'static str {
        match self {
            Transport::Tftp => "TFTP get",
            Transport::Http => "HTTP get",
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tftp => write!(f, "TFTP"),
            Transport::Http => write!(f, "HTTP"),
        }
    }
}

/// What the client asked the transport to do with a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// Full download (TFTP RRQ, HTTP GET).
    Read,
    /// Metadata only (HTTP HEAD).
    Head,
    /// Upload (TFTP WRQ). Always refused.
    Write,
    /// Any other HTTP method.
    Other(String),
}

/// One inbound file request, independent of the transport it came from.
#[derive(Debug, Clone)]
pub struct BootRequest {
    pub kind: RequestKind,
    /// Raw request target: TFTP filename or HTTP URL path.
    pub path: String,
    pub client: Option<SocketAddr>,
}
