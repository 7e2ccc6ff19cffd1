use clap::Parser;
use kube::Client;
use pg_selector::config::{Cli, Commands, Config, LogFormat, LogLevel, RunArgs};
use pg_selector::controller::{self, Context};
use pg_selector::server::{run_health_server, shutdown_channel, wait_for_signal, ReadinessState};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Initialize tracing
///
/// `RUST_LOG` wins over `--log-level` when set.
fn init_tracing(level: LogLevel, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    init_tracing(args.log_level, args.log_format);

    let config = match Config::from_args(&args, |key| std::env::var(key).ok()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };

    info!(
        namespace = %config.target.namespace,
        member_set = %config.target.name,
        port = config.target.port,
        "Starting pg-selector replication-role synchronizer"
    );

    let (shutdown_controller, shutdown_signal) = shutdown_channel();
    let readiness = ReadinessState::new();

    let health_readiness = readiness.clone();
    let health_port = config.health_port;
    let health_handle = tokio::spawn(async move {
        if let Err(e) = run_health_server(health_port, health_readiness).await {
            warn!(error = %e, "Health server failed");
        }
    });

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    let ctx = Arc::new(Context::new(client, &config));
    let watcher_handle = tokio::spawn(controller::run(ctx, shutdown_signal));

    readiness.set_ready();

    let signal = wait_for_signal().await;
    match &signal {
        Ok(name) => info!(signal = *name, "Initiating graceful shutdown"),
        Err(e) => error!(error = %e, "Failed to register signal handlers, shutting down"),
    }
    readiness.set_not_ready();
    shutdown_controller.shutdown();

    // Let an in-flight cycle finish before exiting
    if let Err(e) = watcher_handle.await {
        error!(error = %e, "Watcher task failed");
    }
    health_handle.abort();

    signal?;
    info!("Shutdown worker service by system");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Run(args) => run(args).await,
    }
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
