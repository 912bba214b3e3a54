use clap::Parser;
use solar_core::app::App;
use solar_core::config::schema::AppConfig;
use solar_core::telemetry::{init_tracing, shutdown_signal};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

/// Supervised data-acquisition core for heterogeneous solar inverters and
/// BMS devices.
#[derive(Parser, Debug)]
#[command(name = "solar-core", version)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "solar-core.conf")]
    config: PathBuf,

    /// Parse and validate the configuration, then exit without connecting
    /// to any device.
    #[arg(long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let config = match AppConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::from(1);
        }
    };

    if cli.validate_config {
        info!(instances = config.instances.len(), "configuration is valid");
        return ExitCode::from(0);
    }

    let mut app = match App::build(config).await {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "failed to start");
            return ExitCode::from(3);
        }
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(());
    });

    let exit_code = app.run_until_shutdown(shutdown_rx).await;
    if let Err(e) = app.aggregator_task().await {
        error!(error = %e, "aggregator task panicked");
    }

    ExitCode::from(exit_code as u8)
}
