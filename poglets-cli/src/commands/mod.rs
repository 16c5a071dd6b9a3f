//! Subcommands and the flags they share

pub mod client;
pub mod server;
pub mod version;

use clap::Args;
use poglets_observability::{LogFormat, LoggingConfig};
use tokio::signal;
use tracing::{info, warn};

/// Console logging flags
#[derive(Args, Debug)]
pub struct LogArgs {
    /// Default log filter, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format: text or json
    #[arg(long, default_value_t = LogFormat::Text, env = "POGLETS_LOG_FORMAT")]
    log_format: LogFormat,
}

impl LogArgs {
    pub fn config(&self) -> LoggingConfig {
        LoggingConfig {
            level: self.log_level.clone(),
            format: self.log_format,
        }
    }
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received SIGTERM"),
    }
}
