//! wterm: share a terminal program with browser clients over WebSocket.
//!
//! Each accepted connection spawns the configured command on its own
//! pseudo-terminal: keystrokes flow from the browser to the PTY, terminal
//! output flows back, and closing the page signals and reaps the child.
//! The CLI here only assembles the immutable [`ServerConfig`]; everything
//! interesting happens in the library crate.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wterm::config::{self, ConfigError, ServerConfig, Signal};
use wterm::protocol;
use wterm::registry::SessionRegistry;
use wterm::server::{self, AppState};

/// Share a terminal program with browser clients over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "wterm", version, about, long_about = None)]
struct Args {
    /// Address to bind the WebSocket server
    #[arg(long, default_value = "127.0.0.1:7681")]
    bind: SocketAddr,

    /// Shared secret clients must present before a terminal is spawned
    #[arg(long, env = "WTERM_CREDENTIAL")]
    credential: Option<String>,

    /// Drop all client keystrokes (view-only terminals)
    #[arg(long)]
    readonly: bool,

    /// Require the WebSocket Origin host to match the Host header
    #[arg(long)]
    check_origin: bool,

    /// Serve a single session, then exit
    #[arg(long)]
    once: bool,

    /// Maximum concurrent clients (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_clients: usize,

    /// Signal sent to the child when its session closes (name or number)
    #[arg(long, default_value = "SIGHUP")]
    signal: String,

    /// Reconnect interval hint sent to clients, in seconds
    #[arg(long, default_value_t = 10)]
    reconnect: u32,

    /// Browser terminal preference as KEY=VALUE; may be repeated
    #[arg(short = 't', long = "client-option", value_name = "KEY=VALUE")]
    client_options: Vec<String>,

    /// Command to run in each session, with its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[derive(Error, Debug)]
enum WtermError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), WtermError> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "wterm=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = ServerConfig::new(args.command)?;
    config.credential = args.credential;
    config.readonly = args.readonly;
    config.check_origin = args.check_origin;
    config.once = args.once;
    config.max_clients = args.max_clients;
    config.term_signal = Signal::parse(&args.signal)?;
    config.reconnect = args.reconnect;
    config.prefs_json = config::prefs_from_options(&args.client_options)?;

    tracing::info!(command = %config.command.join(" "), "starting wterm");
    if config.credential.is_some() {
        tracing::info!("credential authentication enabled");
    }
    if config.readonly {
        tracing::info!("readonly mode, client input will be dropped");
    }

    let registry = SessionRegistry::new(config.once, config.max_clients);
    let state = AppState {
        config: Arc::new(config),
        registry,
    };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(addr = %args.bind, path = protocol::WS_PATH, "listening");

    server::serve(listener, state).await?;

    tracing::info!("wterm exiting");
    Ok(())
}
