//! Server control API
//!
//! Logging setup, server configuration and start/stop/status for the
//! process-wide WebSocket listener.

use crate::protocol::SessionConfig;
use crate::server::{run_server, HandlerFactory};
use anyhow::Context;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;

// Global server state
static SERVER_RUNNING: AtomicBool = AtomicBool::new(false);
static ACTIVE_SERVER_TASK: AtomicU64 = AtomicU64::new(0);
static ACTIVE_CONNECTIONS: AtomicU64 = AtomicU64::new(0);
static TOTAL_CONNECTIONS: AtomicU64 = AtomicU64::new(0);

/// Current listen address (port, bind_address)
static CURRENT_SERVER_ADDR: Lazy<RwLock<(u16, String)>> =
    Lazy::new(|| RwLock::new((DEFAULT_PORT, DEFAULT_BIND_ADDRESS.to_string())));

pub const DEFAULT_PORT: u16 = 6062;
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

/// Get the version of the core library
pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Initialize logging (call once at startup).
/// `log_dir` is where log files go in release builds.
#[allow(unused_variables)]
pub fn init_core(log_dir: Option<String>) -> anyhow::Result<()> {
    // Initialize tracing/logging based on build mode
    #[cfg(debug_assertions)]
    {
        // Debug mode: log to console (stderr)
        let level = resolve_log_level();
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .try_init();
    }

    #[cfg(not(debug_assertions))]
    {
        // Release mode: log to file
        let level = resolve_log_level();

        let log_dir = log_dir
            .as_ref()
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|| std::path::PathBuf::from("logs"));

        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
        let file_appender = tracing_appender::rolling::daily(&log_dir, "wsserver_core");
        let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

        // Logging should last until program exit
        std::mem::forget(_guard);

        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(non_blocking)
            .try_init();
    }

    tracing::info!("WebSocket server core initialized v{}", env!("CARGO_PKG_VERSION"));
    Ok(())
}

pub fn resolve_log_level() -> tracing::level_filters::LevelFilter {
    use tracing::level_filters::LevelFilter;

    match std::env::var("RUST_LOG") {
        Ok(val) => match val.to_lowercase().as_str() {
            "trace" => LevelFilter::TRACE,
            "debug" => LevelFilter::DEBUG,
            "info" => LevelFilter::INFO,
            "warn" | "warning" => LevelFilter::WARN,
            "error" => LevelFilter::ERROR,
            _ => LevelFilter::INFO,
        },
        Err(_) => LevelFilter::INFO,
    }
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,
    /// Bind address (e.g., "127.0.0.1")
    pub bind_address: String,
    /// Sub-protocols the server agrees to, in preference order
    pub subprotocols: Vec<String>,
    /// Limits applied to every session
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            subprotocols: Vec::new(),
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from a JSON file; absent fields keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Server status information
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    /// Whether the server is running
    pub is_running: bool,
    /// Current port
    pub port: u16,
    /// Bind address
    pub bind_address: String,
    /// Connections currently open
    pub active_connections: u64,
    /// Connections accepted since process start
    pub total_connections: u64,
}

/// Get current server status
pub fn get_server_status() -> ServerStatus {
    let (port, bind_address) = match CURRENT_SERVER_ADDR.read() {
        Ok(current) => (current.0, current.1.clone()),
        Err(poisoned) => {
            let current = poisoned.into_inner();
            (current.0, current.1.clone())
        }
    };
    ServerStatus {
        is_running: SERVER_RUNNING.load(Ordering::SeqCst),
        port,
        bind_address,
        active_connections: ACTIVE_CONNECTIONS.load(Ordering::SeqCst),
        total_connections: TOTAL_CONNECTIONS.load(Ordering::SeqCst),
    }
}

/// Internal helper to check if the accept loop should keep running
pub fn is_running_internal() -> bool {
    SERVER_RUNNING.load(Ordering::SeqCst)
}

/// Counts one connection for as long as it is alive
pub(crate) struct ConnectionGuard(());

pub(crate) fn track_connection() -> ConnectionGuard {
    ACTIVE_CONNECTIONS.fetch_add(1, Ordering::SeqCst);
    TOTAL_CONNECTIONS.fetch_add(1, Ordering::SeqCst);
    ConnectionGuard(())
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Start the server. Returns the bound address; port 0 picks a free port.
pub async fn start_server<F>(config: ServerConfig, factory: F) -> anyhow::Result<SocketAddr>
where
    F: HandlerFactory,
{
    // Only one caller gets past here until the flag is cleared again
    if SERVER_RUNNING
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        anyhow::bail!("WebSocket server already running");
    }

    let bound = TcpListener::bind(config.listen_addr())
        .await
        .and_then(|listener| listener.local_addr().map(|addr| (listener, addr)));
    let (listener, local_addr) = match bound {
        Ok(bound) => bound,
        Err(e) => {
            SERVER_RUNNING.store(false, Ordering::SeqCst);
            return Err(anyhow::Error::new(e)
                .context(format!("Failed to bind to {}", config.listen_addr())));
        }
    };

    // Store current address for status queries
    if let Ok(mut current) = CURRENT_SERVER_ADDR.write() {
        *current = (local_addr.port(), config.bind_address.clone());
    }
    tracing::info!("Starting WebSocket server on {}", local_addr);

    let config = Arc::new(config);
    let factory = Arc::new(factory);
    ACTIVE_SERVER_TASK.fetch_add(1, Ordering::SeqCst);
    tokio::spawn(async move {
        if let Err(e) = run_server(listener, config, factory).await {
            tracing::error!("WebSocket server error: {}", e);
        }

        // If server exits, ensure flag is cleared
        SERVER_RUNNING.store(false, Ordering::SeqCst);
        ACTIVE_SERVER_TASK.fetch_sub(1, Ordering::SeqCst);
    });

    Ok(local_addr)
}

/// Stop the accept loop. Sessions already running finish on their own.
pub async fn stop_server() -> anyhow::Result<()> {
    tracing::info!("Stopping WebSocket server");
    SERVER_RUNNING.store(false, Ordering::SeqCst);
    loop {
        if ACTIVE_SERVER_TASK.load(Ordering::SeqCst) == 0 {
            break;
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
    }
    Ok(())
}
