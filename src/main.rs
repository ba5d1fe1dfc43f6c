#![forbid(unsafe_code)]

//! `tether-echo`: background echo service.
//!
//! Hosts the echo responder behind the channel endpoint and stays up until
//! a client sends the stop action or the process receives a shutdown
//! signal.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use tether::echo::EchoHooks;
use tether::ipc::service::spawn_service;
use tether::{AppError, ChannelConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "tether-echo", about = "Background echo service", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the service's local socket name.
    #[arg(long)]
    ipc_name: Option<String>,

    /// Ask to be kept in the foreground under this label.
    #[arg(long)]
    foreground: Option<String>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = match args.config {
        Some(ref path) => ChannelConfig::load_from_path(path)?,
        None => ChannelConfig::default(),
    };
    if let Some(name) = args.ipc_name {
        config = config.with_ipc_name(name)?;
    }

    let mut hooks = EchoHooks::new();
    if let Some(label) = args.foreground {
        hooks = hooks.with_foreground(label);
    }

    let service = spawn_service(&config, hooks)?;
    info!(ipc_name = %config.ipc_name, "tether-echo ready");

    let endpoint = std::sync::Arc::clone(service.endpoint());
    let stopped = endpoint.shutdown_token();
    tokio::select! {
        () = shutdown_signal() => {
            info!("shutdown signal received");
            endpoint.stop();
        }
        () = stopped.cancelled() => {}
    }

    service.wait().await;
    info!("tether-echo shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
