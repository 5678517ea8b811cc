use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use clap::ValueEnum;
use firn_core::config::{DEFAULT_BLOCK_SIZE, DEFAULT_HTTP_PORT, DEFAULT_TFTP_PORT};
use firn_core::patch::MARKER;
use firn_core::{FirnError, Result, ServerConfig, ServerSpec};
use serde::{Deserialize, Serialize};

// RFC 2348 maximum block size
const MAX_BLOCK_SIZE: usize = 65464;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub tftp: TftpSection,
    pub http: HttpSection,
    pub catalog: CatalogSection,
    pub logging: LoggingConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TftpSection {
    pub addr: SocketAddr,
    pub timeout_secs: u64,
    /// Largest block size a client may negotiate.
    pub block_size: usize,
    /// Serve every transfer from `addr` instead of a fresh port per transfer.
    /// Needed where the host can't hand out ephemeral ports; slower.
    pub single_port: bool,
    pub disabled: bool,
}

impl Default for TftpSection {
    fn default() -> Self {
        Self {
            addr: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), DEFAULT_TFTP_PORT),
            timeout_secs: 5,
            block_size: DEFAULT_BLOCK_SIZE,
            single_port: false,
            disabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub addr: SocketAddr,
    pub timeout_secs: u64,
    pub disabled: bool,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            addr: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), DEFAULT_HTTP_PORT),
            timeout_secs: 5,
            disabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSection {
    /// Directory holding ipxe.efi, undionly.kpxe, snp.efi and ipxe.iso.
    pub binary_dir: PathBuf,
    /// iPXE script written into every served image.
    pub patch: Option<String>,
    /// File holding the iPXE script. Mutually exclusive with `patch`.
    pub patch_file: Option<PathBuf>,
}

impl Default for CatalogSection {
    fn default() -> Self {
        Self {
            binary_dir: PathBuf::from("/var/lib/firn/ipxe"),
            patch: None,
            patch_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// OTLP gRPC endpoint for request spans. Unset disables export.
    pub otlp_endpoint: Option<String>,
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            service_name: "firn".to_string(),
        }
    }
}

impl FileConfig {
    /// The iPXE script to patch into served images, empty when none is configured.
    pub fn patch(&self) -> Result<Bytes> {
        match (&self.catalog.patch, &self.catalog.patch_file) {
            (Some(_), Some(_)) => Err(FirnError::InvalidConfig(
                "catalog.patch and catalog.patch_file are mutually exclusive".to_string(),
            )),
            (Some(script), None) => Ok(Bytes::from(script.clone())),
            (None, Some(path)) => {
                let script = std::fs::read(path).map_err(|e| {
                    FirnError::InvalidConfig(format!(
                        "catalog.patch_file {} is not readable: {e}",
                        path.display()
                    ))
                })?;
                Ok(Bytes::from(script))
            }
            (None, None) => Ok(Bytes::new()),
        }
    }

    /// Server settings for the orchestrator. Call [`validate_config`] first.
    pub fn server_config(&self) -> Result<ServerConfig> {
        let patch = self.patch()?;
        Ok(ServerConfig {
            tftp: ServerSpec {
                addr: Some(self.tftp.addr),
                timeout: Duration::from_secs(self.tftp.timeout_secs),
                disabled: self.tftp.disabled,
                block_size: self.tftp.block_size,
                patch: patch.clone(),
            },
            http: ServerSpec {
                addr: Some(self.http.addr),
                timeout: Duration::from_secs(self.http.timeout_secs),
                disabled: self.http.disabled,
                block_size: 0,
                patch,
            },
            log: None,
            tftp_single_port: self.tftp.single_port,
        })
    }
}

pub fn load_config(path: &Path) -> Result<FileConfig> {
    let contents = std::fs::read_to_string(path)?;
    toml::from_str(&contents).map_err(|e| {
        FirnError::InvalidConfig(format!("invalid config file {}: {e}", path.display()))
    })
}

pub fn write_config(path: &Path, config: &FileConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| FirnError::InvalidConfig(format!("failed to serialize config: {e}")))?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    Ok(())
}

/// Reject settings the servers can't run with.
pub fn validate_config(config: &FileConfig) -> Result<()> {
    if !(DEFAULT_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&config.tftp.block_size) {
        return Err(FirnError::InvalidConfig(format!(
            "tftp.block_size must be between {DEFAULT_BLOCK_SIZE} and {MAX_BLOCK_SIZE}, got {}",
            config.tftp.block_size
        )));
    }
    if config.tftp.timeout_secs < 1 {
        return Err(FirnError::InvalidConfig(
            "tftp.timeout_secs must be at least 1".to_string(),
        ));
    }
    if config.http.timeout_secs < 1 {
        return Err(FirnError::InvalidConfig(
            "http.timeout_secs must be at least 1".to_string(),
        ));
    }

    let patch = config.patch()?;
    if patch.len() > MARKER.len() {
        return Err(FirnError::InvalidConfig(format!(
            "patch is {} bytes but at most {} fit into an iPXE binary",
            patch.len(),
            MARKER.len()
        )));
    }

    match std::fs::metadata(&config.catalog.binary_dir) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(FirnError::InvalidConfig(
                "catalog.binary_dir must be a directory".to_string(),
            ));
        }
        Err(e) => {
            return Err(FirnError::InvalidConfig(format!(
                "catalog.binary_dir {} is not accessible: {e}",
                config.catalog.binary_dir.display()
            )));
        }
    }

    if let Some(ref log_file) = config.logging.file
        && log_file.file_name().is_none()
    {
        return Err(FirnError::InvalidConfig(
            "logging.file must include a file name".to_string(),
        ));
    }

    if let Some(ref endpoint) = config.telemetry.otlp_endpoint
        && endpoint.trim().is_empty()
    {
        return Err(FirnError::InvalidConfig(
            "telemetry.otlp_endpoint must not be empty".to_string(),
        ));
    }

    Ok(())
}
