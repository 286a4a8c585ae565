//! Accept loop and per-connection upgrade
//!
//! One task per accepted socket: read the request head, validate the
//! handshake, answer 101 and hand the stream to a [`ConnectionSession`].

use crate::api::server_api::{is_running_internal, track_connection, ServerConfig};
use crate::protocol::handshake::{select_protocol, switching_protocols_response};
use crate::protocol::{validate, ConnectionSession, HandshakeRequest, SessionError, SessionHandler};
use crate::server::http::{
    read_handshake_request, reject_handshake, respond_with_status, write_switching_protocols,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

/// Time allowed for a client to send its complete upgrade request
const HANDSHAKE_TIMEOUT_SECS: u64 = 30;

/// Builds the application handler for each upgraded connection
pub trait HandlerFactory: Send + Sync + 'static {
    type Handler: SessionHandler + 'static;

    fn new_handler(&self, request: &HandshakeRequest) -> Self::Handler;
}

impl<F, H> HandlerFactory for F
where
    F: Fn(&HandshakeRequest) -> H + Send + Sync + 'static,
    H: SessionHandler + 'static,
{
    type Handler = H;

    fn new_handler(&self, request: &HandshakeRequest) -> H {
        self(request)
    }
}

/// Accept connections until the running flag is cleared
pub async fn run_server<F>(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    factory: Arc<F>,
) -> anyhow::Result<()>
where
    F: HandlerFactory,
{
    match listener.local_addr() {
        Ok(addr) => tracing::info!("WebSocket server listening on {}", addr),
        Err(_) => tracing::info!("WebSocket server listening"),
    }

    loop {
        if !is_running_internal() {
            break;
        }

        // Use accept with timeout so we can check cancellation periodically
        let accept_result =
            tokio::time::timeout(Duration::from_millis(500), listener.accept()).await;

        match accept_result {
            Ok(Ok((socket, peer_addr))) => {
                tracing::debug!("Connection from {}", peer_addr);
                if let Err(e) = socket.set_nodelay(true) {
                    tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
                }
                let config = config.clone();
                let factory = factory.clone();
                tokio::spawn(async move {
                    let _guard = track_connection();
                    if let Err(e) = handle_connection(socket, &config, factory.as_ref()).await {
                        // Downgrade expected errors to debug level:
                        // - "end of file" = client vanished without a Close frame
                        // - "broken pipe" / "connection reset" = client aborted
                        let err_str = e.to_string().to_lowercase();
                        if err_str.contains("eof")
                            || err_str.contains("end of file")
                            || err_str.contains("broken pipe")
                            || err_str.contains("connection reset")
                            || err_str.contains("connection closed")
                        {
                            tracing::debug!("Connection closed by client: {}", e);
                        } else {
                            tracing::error!("Error handling connection: {}", e);
                        }
                    }
                });
            }
            Ok(Err(e)) => tracing::error!("Accept error: {}", e),
            Err(_) => {
                // Timeout, check is_running flag and continue
                continue;
            }
        }
    }

    tracing::info!("WebSocket server stopped");
    Ok(())
}

/// Upgrade one connection and run its session to completion
pub async fn handle_connection<S, F>(
    mut stream: S,
    config: &ServerConfig,
    factory: &F,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    F: HandlerFactory,
{
    let raw = match tokio::time::timeout(
        Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
        read_handshake_request(&mut stream),
    )
    .await
    {
        Ok(Ok(raw)) => raw,
        Ok(Err(err)) => {
            tracing::warn!("Failed to parse request: {err}");
            let _ = respond_with_status(
                &mut stream,
                400,
                "Bad Request",
                "Unable to parse HTTP request",
            )
            .await;
            return Ok(());
        }
        Err(_) => {
            tracing::debug!("Timed out waiting for the upgrade request");
            return Ok(());
        }
    };

    if raw.version < 1 {
        tracing::warn!("Rejected HTTP/1.{} upgrade for {}", raw.version, raw.request.path);
        respond_with_status(
            &mut stream,
            400,
            "Bad Request",
            "WebSocket upgrade requires HTTP/1.1",
        )
        .await?;
        return Ok(());
    }

    let request = raw.request;
    let accept = match validate(&request) {
        Ok(accept) => accept,
        Err(err) => {
            tracing::warn!("Rejected upgrade for {}: {}", request.path, err);
            reject_handshake(&mut stream, &err).await?;
            return Ok(());
        }
    };

    let optional = request.optional_headers_present();
    if !optional.is_empty() {
        tracing::debug!("Upgrade for {} carries {}", request.path, optional.join(", "));
    }

    let protocol = select_protocol(&request, &config.subprotocols);
    let response = switching_protocols_response(&accept, protocol.as_deref())?;
    write_switching_protocols(&mut stream, &response).await?;

    let mut handler = factory.new_handler(&request);
    let session = ConnectionSession::with_prefix(stream, &raw.leftover, config.session.clone());
    tracing::info!(
        "WebSocket connection upgraded: {} {}{}",
        session.id(),
        request.path,
        protocol
            .as_deref()
            .map(|p| format!(" ({p})"))
            .unwrap_or_default()
    );

    match session.run(&mut handler).await {
        Ok(_) | Err(SessionError::Timeout) => Ok(()),
        Err(err) => Err(err.into()),
    }
}
