pub mod logging;
pub mod tracing;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use tracing::{init_tracing, shutdown_tracing, TracingConfig};

/// Logging for the CLI: OTLP export when `OTEL_EXPORTER_OTLP_ENDPOINT` is
/// set, plain console logging otherwise.
pub fn init_observability(service_name: &str, logging: LoggingConfig) -> anyhow::Result<()> {
    init_tracing(TracingConfig {
        service_name: service_name.to_string(),
        otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
            .ok()
            .filter(|endpoint| !endpoint.is_empty()),
        logging,
    })
}
