use anyhow::{Context, Result};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, runtime, trace as sdktrace};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{LogFormat, LoggingConfig, TelemetryConfig};

/// Keeps log output flowing. Call [`Telemetry::shutdown`] before exiting.
pub struct Telemetry {
    _log_guard: Option<WorkerGuard>,
    otlp: bool,
}

impl Telemetry {
    /// Flush pending spans to the collector.
    pub fn shutdown(self) {
        if self.otlp {
            opentelemetry::global::shutdown_tracer_provider();
        }
    }
}

/// Install the global subscriber: formatted logs to stdout or a file, plus
/// OTLP span export when an endpoint is configured.
pub fn init(logging: &LoggingConfig, telemetry: &TelemetryConfig) -> Result<Telemetry> {
    let filter = EnvFilter::try_new(&logging.level)
        .with_context(|| format!("invalid log level {:?}", logging.level))?;

    let (writer, log_guard, ansi) = match logging.file {
        Some(ref log_file) => {
            let dir = match log_file.parent() {
                Some(path) if !path.as_os_str().is_empty() => path,
                _ => std::path::Path::new("."),
            };
            let file_name = log_file
                .file_name()
                .context("logging.file must include a file name")?;
            let file_appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            (BoxMakeWriter::new(non_blocking), Some(guard), false)
        }
        None => (BoxMakeWriter::new(std::io::stdout), None, true),
    };

    let fmt_layer = match logging.format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .boxed(),
    };

    let otel_layer = match telemetry.otlp_endpoint {
        Some(ref endpoint) => {
            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint.clone());
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                    vec![
                        KeyValue::new("service.name", telemetry.service_name.clone()),
                        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                    ],
                )))
                .install_batch(runtime::Tokio)
                .context("failed to install OTLP exporter")?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };
    let otlp = otel_layer.is_some();

    tracing_subscriber::registry()
        .with(filter)
        .with(otel_layer)
        .with(fmt_layer)
        .try_init()
        .context("failed to install log subscriber")?;

    if let Some(ref endpoint) = telemetry.otlp_endpoint {
        tracing::info!(
            service = %telemetry.service_name,
            endpoint = %endpoint,
            "OpenTelemetry export enabled"
        );
    }

    Ok(Telemetry {
        _log_guard: log_guard,
        otlp,
    })
}
