mod config;
mod telemetry;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use firn::{Catalog, Server};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{FileConfig, LogFormat, load_config, validate_config, write_config};

#[derive(Parser, Debug)]
#[command(name = "firn", about = "Serve iPXE binaries over TFTP and HTTP")]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, env = "FIRN_CONFIG", default_value = "/etc/firn/config.toml")]
    config: PathBuf,

    /// Write the effective configuration to --config and exit
    #[arg(long)]
    init_config: bool,

    /// Validate the configuration and exit (no socket bind)
    #[arg(long)]
    check_config: bool,

    /// Directory holding the iPXE binaries
    #[arg(long, env = "FIRN_BINARY_DIR")]
    binary_dir: Option<PathBuf>,

    /// iPXE script to embed in served binaries
    #[arg(long, env = "FIRN_PATCH", conflicts_with = "patch_file")]
    patch: Option<String>,

    /// File holding the iPXE script to embed in served binaries
    #[arg(long, env = "FIRN_PATCH_FILE")]
    patch_file: Option<PathBuf>,

    /// Listen address for the TFTP server
    #[arg(long, env = "FIRN_TFTP_ADDR")]
    tftp_addr: Option<SocketAddr>,

    /// TFTP retransmission timeout in seconds
    #[arg(long, env = "FIRN_TFTP_TIMEOUT")]
    tftp_timeout: Option<u64>,

    /// Largest block size a TFTP client may negotiate
    #[arg(long, env = "FIRN_TFTP_BLOCKSIZE")]
    tftp_blocksize: Option<usize>,

    /// Serve all TFTP transfers from the listen port
    #[arg(long, env = "FIRN_TFTP_SINGLE_PORT", value_parser = clap::value_parser!(bool))]
    tftp_single_port: Option<bool>,

    /// Do not start the TFTP server
    #[arg(long, env = "FIRN_TFTP_DISABLED", value_parser = clap::value_parser!(bool))]
    tftp_disabled: Option<bool>,

    /// Listen address for the HTTP server
    #[arg(long, env = "FIRN_HTTP_ADDR")]
    http_addr: Option<SocketAddr>,

    /// HTTP request timeout in seconds
    #[arg(long, env = "FIRN_HTTP_TIMEOUT")]
    http_timeout: Option<u64>,

    /// Do not start the HTTP server
    #[arg(long, env = "FIRN_HTTP_DISABLED", value_parser = clap::value_parser!(bool))]
    http_disabled: Option<bool>,

    /// Log filter, e.g. "info" or "firn_tftp=debug"
    #[arg(long, env = "FIRN_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, env = "FIRN_LOG_FORMAT", value_enum)]
    log_format: Option<LogFormat>,

    /// Write logs to this file instead of stdout
    #[arg(long, env = "FIRN_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// OTLP gRPC endpoint for request spans
    #[arg(long, env = "FIRN_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

impl Cli {
    fn apply(&self, config: &mut FileConfig) {
        if let Some(ref dir) = self.binary_dir {
            config.catalog.binary_dir = dir.clone();
        }
        if let Some(ref script) = self.patch {
            config.catalog.patch = Some(script.clone());
            config.catalog.patch_file = None;
        }
        if let Some(ref path) = self.patch_file {
            config.catalog.patch_file = Some(path.clone());
            config.catalog.patch = None;
        }
        if let Some(addr) = self.tftp_addr {
            config.tftp.addr = addr;
        }
        if let Some(secs) = self.tftp_timeout {
            config.tftp.timeout_secs = secs;
        }
        if let Some(size) = self.tftp_blocksize {
            config.tftp.block_size = size;
        }
        if let Some(single_port) = self.tftp_single_port {
            config.tftp.single_port = single_port;
        }
        if let Some(disabled) = self.tftp_disabled {
            config.tftp.disabled = disabled;
        }
        if let Some(addr) = self.http_addr {
            config.http.addr = addr;
        }
        if let Some(secs) = self.http_timeout {
            config.http.timeout_secs = secs;
        }
        if let Some(disabled) = self.http_disabled {
            config.http.disabled = disabled;
        }
        if let Some(ref level) = self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
        if let Some(ref file) = self.log_file {
            config.logging.file = Some(file.clone());
        }
        if let Some(ref endpoint) = self.otlp_endpoint {
            config.telemetry.otlp_endpoint = Some(endpoint.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        FileConfig::default()
    };
    cli.apply(&mut config);

    if cli.init_config {
        write_config(&cli.config, &config)?;
        println!("Wrote config to {}", cli.config.display());
        return Ok(());
    }

    validate_config(&config)?;

    if cli.check_config {
        println!("Config OK: {}", cli.config.display());
        return Ok(());
    }

    let telemetry = telemetry::init(&config.logging, &config.telemetry)?;

    let result = run(&config).await;
    if let Err(ref e) = result {
        error!(error = %e, "firn exited with an error");
    }
    telemetry.shutdown();
    result
}

async fn run(config: &FileConfig) -> Result<()> {
    let catalog = Catalog::load_dir(&config.catalog.binary_dir)?;
    info!(
        dir = %config.catalog.binary_dir.display(),
        files = ?catalog.names(),
        "loaded iPXE binaries"
    );

    let server = Server::new(config.server_config()?, Arc::new(catalog));
    let token = CancellationToken::new();
    tokio::spawn(shutdown_signal(token.clone()));

    server.listen_and_serve(token).await?;
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
    token.cancel();
}
