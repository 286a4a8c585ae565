//! Standalone WebSocket echo server.
//!
//! Greets every client, then echoes each message back on the same
//! connection.
//!
//! Usage:
//! ```
//! cargo run --bin wsserver -- --port 6062
//! ```

use std::path::PathBuf;

use anyhow::Context;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::FmtSubscriber;
use wsserver_core::api::{init_core, start_server, stop_server, ServerConfig};
use wsserver_core::models::{CloseCode, Message};
use wsserver_core::protocol::{HandshakeRequest, SessionContext, SessionError, SessionHandler};

const GREETING: &str = "Welcome to the chat room";

struct EchoHandler {
    path: String,
}

impl SessionHandler for EchoHandler {
    fn on_open(&mut self, ctx: &mut SessionContext<'_>) {
        tracing::info!("Client {} joined {}", ctx.session_id(), self.path);
        if let Err(e) = ctx.send_text(GREETING) {
            tracing::debug!("Failed to queue greeting: {}", e);
        }
    }

    fn on_message(&mut self, message: Message, ctx: &mut SessionContext<'_>) {
        tracing::debug!("{} << {}", ctx.session_id(), message.preview());
        if let Err(e) = ctx.send(message) {
            tracing::debug!("Failed to queue echo: {}", e);
        }
    }

    fn on_close(&mut self, code: CloseCode, reason: &str) {
        tracing::info!("Client left {} ({} {})", self.path, code, reason);
    }

    fn on_error(&mut self, error: &SessionError) {
        tracing::debug!("Session on {} failed: {}", self.path, error);
    }
}

struct Args {
    config: ServerConfig,
    log_dir: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    match args.log_dir {
        Some(dir) => init_core(Some(dir))?,
        None => init_tracing(),
    }

    let addr = start_server(args.config, |request: &HandshakeRequest| EchoHandler {
        path: request.path.clone(),
    })
    .await?;
    tracing::info!("Echo server ready on ws://{}", addr);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    stop_server().await?;
    Ok(())
}

fn init_tracing() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(wsserver_core::api::server_api::resolve_log_level())
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Logging already initialised, level {}", LevelFilter::current());
    }
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut config_path: Option<PathBuf> = None;
    let mut port: Option<u16> = None;
    let mut bind_address: Option<String> = None;
    let mut log_dir = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--port" | "-p" => {
                if let Some(value) = args.next() {
                    port = Some(
                        value
                            .parse()
                            .with_context(|| format!("Invalid port {value:?}"))?,
                    );
                }
            }
            "--bind" => {
                bind_address = args.next();
            }
            "--config" => {
                config_path = args.next().map(PathBuf::from);
            }
            "--log-dir" => {
                log_dir = args.next();
            }
            "--help" | "-h" => {
                eprintln!("WebSocket echo server");
                eprintln!();
                eprintln!("Usage: wsserver [OPTIONS]");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  --port, -p <PORT>    Port to listen on (default: 6062)");
                eprintln!("  --bind <ADDR>        Bind address (default: 0.0.0.0)");
                eprintln!("  --config <FILE>      JSON server config; flags override it");
                eprintln!("  --log-dir <DIR>      Write logs to a daily rolling file");
                eprintln!("  --help, -h           Show this help");
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {arg}");
            }
        }
    }

    let mut config = match config_path {
        Some(path) => ServerConfig::from_json_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(bind_address) = bind_address {
        config.bind_address = bind_address;
    }

    Ok(Args { config, log_dir })
}
