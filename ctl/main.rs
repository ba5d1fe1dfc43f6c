#![forbid(unsafe_code)]

//! `tether-chat`: line-oriented chat client for `tether-echo`.
//!
//! Starts (or reuses) the echo service, connects to it, and sends every
//! stdin line as a data message. Lifecycle events and replies are printed
//! to stdout; logs go to stderr.
//!
//! Commands: `/raw <action>` sends an out-of-band request to the service,
//! `/quit` (or end of input) disconnects and stops the service.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, EnvFilter};

use tether::ipc::handle::{ChannelHandle, PeerListener};
use tether::ipc::local::LocalHost;
use tether::ipc::transport::ServiceTarget;
use tether::models::message::RawRequest;
use tether::{AppError, ChannelConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "tether-chat",
    about = "Chat with the tether echo service",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Local socket name of the service (must match the service's `ipc_name`).
    #[arg(long)]
    ipc_name: Option<String>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

/// Prints channel events the way the chat history shows them.
struct ChatPrinter;

impl PeerListener for ChatPrinter {
    fn on_peer_connected(&self) {
        println!("service connected");
    }

    fn on_peer_disconnected(&self) {
        println!("service disconnected");
    }

    fn on_peer_died(&self) {
        println!("service died");
    }

    fn on_message(&self, arg1: i32, arg2: i32, payload: Option<String>) {
        println!(
            "received arg1: {arg1}, arg2: {arg2}, payload: {}",
            payload.as_deref().unwrap_or("<none>")
        );
    }
}

/// One parsed line of chat input.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Quit,
    Raw(&'a str),
    Say(&'a str),
    Blank,
}

fn parse_input(line: &str) -> Input<'_> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Input::Blank;
    }
    if line.trim() == "/quit" {
        return Input::Quit;
    }
    match line.strip_prefix("/raw") {
        Some(rest) if rest.is_empty() || rest.starts_with(' ') => Input::Raw(rest.trim()),
        _ => Input::Say(line),
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args));

    if let Err(ref err) = result {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
    result
}

async fn run(args: Cli) -> Result<()> {
    let mut config = match args.config {
        Some(ref path) => ChannelConfig::load_from_path(path)?,
        None => ChannelConfig::default(),
    };
    if let Some(name) = args.ipc_name {
        config = config.with_ipc_name(name)?;
    }

    let target = ServiceTarget::from_config(&config);
    let transport = Arc::new(LocalHost::new(config));
    let handle = ChannelHandle::new(target, transport, Arc::new(ChatPrinter));

    handle.connect().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        match parse_input(&line) {
            Input::Blank => {}
            Input::Quit => break,
            Input::Raw("") => eprintln!("usage: /raw <action>"),
            Input::Raw(action) => {
                if let Err(err) = handle.send_raw(RawRequest::new(action)).await {
                    eprintln!("raw request failed: {err}");
                }
            }
            Input::Say(text) => {
                if !handle.send(0, 0, Some(text.to_owned())) {
                    eprintln!("not connected ({})", handle.state());
                }
            }
        }
    }

    handle.disconnect().await;
    Ok(())
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
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
