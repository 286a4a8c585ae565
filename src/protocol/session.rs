//! Connection session
//!
//! One `ConnectionSession` per upgraded connection. It owns the stream, the
//! partial-frame accumulator, the reassembler and the close state, and is
//! driven by exactly one task. Nothing in here is shared between connections.

use crate::models::{CloseCode, CloseReason, CloseState, Frame, Message, Opcode, MAX_CONTROL_PAYLOAD};
use crate::protocol::frame::{decode_frame_with_limit, encode_frame, Decoded};
use crate::protocol::handler::{Outbound, SessionContext, SessionHandle, SessionHandler};
use crate::protocol::reassembler::{Reassembler, DEFAULT_MAX_MESSAGE_SIZE};
use crate::protocol::{FrameDecodeError, SessionError};
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Per-connection limits and timeouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Largest single frame payload accepted
    pub max_frame_size: usize,
    /// Largest reassembled message accepted
    pub max_message_size: usize,
    /// Close the connection when the peer sends nothing for this long
    #[serde(with = "duration_ms", rename = "idle_timeout_ms")]
    pub idle_timeout: Duration,
    /// How long to wait for the peer's Close after sending ours
    #[serde(with = "duration_ms", rename = "close_timeout_ms")]
    pub close_timeout: Duration,
    /// Bytes reserved in the accumulator before each read
    pub read_buffer_size: usize,
    /// Capacity of the queue behind `SessionHandle`
    pub outbound_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            idle_timeout: Duration::from_secs(60),
            close_timeout: Duration::from_secs(5),
            read_buffer_size: 65536,
            outbound_queue: 64,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// State owned by one upgraded connection
pub struct ConnectionSession<S> {
    id: Arc<str>,
    stream: S,
    config: SessionConfig,
    /// Bytes received but not yet consumed by a complete frame
    buffer: BytesMut,
    reassembler: Reassembler,
    state: CloseState,
    handle: SessionHandle,
    outbound: mpsc::Receiver<Outbound>,
    close_deadline: Option<Instant>,
    peer_close: Option<CloseReason>,
}

impl<S> ConnectionSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, config: SessionConfig) -> Self {
        Self::with_prefix(stream, &[], config)
    }

    /// Start with bytes that were read past the HTTP request head
    pub fn with_prefix(stream: S, prefix: &[u8], config: SessionConfig) -> Self {
        let id: Arc<str> = Arc::from(uuid::Uuid::new_v4().to_string());
        let (tx, rx) = mpsc::channel(config.outbound_queue.max(1));
        let mut buffer = BytesMut::with_capacity(config.read_buffer_size.max(prefix.len()));
        buffer.extend_from_slice(prefix);
        Self {
            handle: SessionHandle::new(id.clone(), tx),
            id,
            stream,
            reassembler: Reassembler::new(config.max_message_size),
            config,
            buffer,
            state: CloseState::Open,
            outbound: rx,
            close_deadline: None,
            peer_close: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> CloseState {
        self.state
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Send a complete message as a single frame
    pub async fn send(&mut self, message: Message) -> Result<(), SessionError> {
        self.write_frame(message.kind.opcode(), &message.data).await
    }

    pub async fn ping(&mut self, payload: Bytes) -> Result<(), SessionError> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(FrameDecodeError::ControlFrameTooLarge(payload.len() as u64).into());
        }
        self.write_frame(Opcode::Ping, &payload).await
    }

    /// Begin the close handshake: Open -> CloseSent. A no-op while a close is
    /// already in progress.
    pub async fn close(&mut self, code: CloseCode, reason: &str) -> Result<(), SessionError> {
        self.start_close(CloseReason::new(code, reason)).await
    }

    async fn start_close(&mut self, reason: CloseReason) -> Result<(), SessionError> {
        match self.state {
            CloseState::Open => {
                self.write_frame(Opcode::Close, &reason.encode()).await?;
                self.state = CloseState::CloseSent;
                self.close_deadline = Some(Instant::now() + self.config.close_timeout);
                tracing::debug!("WebSocket {}: close sent ({:?})", self.id, reason.code);
                Ok(())
            }
            CloseState::CloseSent | CloseState::CloseReceived => Ok(()),
            CloseState::Closed => Err(SessionError::ConnectionClosed),
        }
    }

    /// Drive the connection until it is closed. Returns the close reason
    /// that ended a clean shutdown.
    pub async fn run<H: SessionHandler>(mut self, handler: &mut H) -> Result<CloseReason, SessionError> {
        tracing::debug!("WebSocket {}: session open", self.id);

        let result = match self.open(handler).await {
            Ok(()) => self.drive(handler).await,
            Err(err) => Err(err),
        };

        let outcome = match result {
            Ok(reason) => {
                self.state = CloseState::Closed;
                handler.on_close(reason.code_or_no_status(), &reason.reason);
                Ok(reason)
            }
            Err(err) => {
                handler.on_error(&err);
                let code = self.fail(&err).await;
                handler.on_close(code, &err.to_string());
                Err(err)
            }
        };

        self.release().await;
        match &outcome {
            Ok(reason) => tracing::info!(
                "WebSocket connection closed: {} ({})",
                self.id,
                reason.code_or_no_status()
            ),
            Err(err) => tracing::info!("WebSocket connection closed: {} ({})", self.id, err),
        }
        outcome
    }

    async fn open<H: SessionHandler>(&mut self, handler: &mut H) -> Result<(), SessionError> {
        let mut ctx = SessionContext::new(&self.handle, self.state);
        handler.on_open(&mut ctx);
        let pending = ctx.into_pending();
        self.flush(pending).await
    }

    async fn drive<H: SessionHandler>(&mut self, handler: &mut H) -> Result<CloseReason, SessionError> {
        let mut idle_deadline = Instant::now() + self.config.idle_timeout;

        loop {
            // Decode everything already buffered before reading again
            while self.state != CloseState::Closed {
                match decode_frame_with_limit(&self.buffer, self.config.max_frame_size as u64)? {
                    Decoded::Incomplete { .. } => break,
                    Decoded::Frame { frame, consumed } => {
                        self.buffer.advance(consumed);
                        self.handle_frame(frame, handler).await?;
                    }
                }
            }

            if self.state == CloseState::Closed {
                return Ok(self.peer_close.clone().unwrap_or_default());
            }

            let deadline = self.close_deadline.unwrap_or(idle_deadline);
            self.buffer.reserve(self.config.read_buffer_size);

            tokio::select! {
                read = self.stream.read_buf(&mut self.buffer) => {
                    match read? {
                        0 => {
                            tracing::debug!("WebSocket {}: peer closed the stream", self.id);
                            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                        }
                        n => {
                            tracing::trace!("WebSocket {}: read {} bytes", self.id, n);
                            idle_deadline = Instant::now() + self.config.idle_timeout;
                        }
                    }
                }
                Some(item) = self.outbound.recv() => {
                    self.write_outbound(item).await?;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    if self.close_deadline.is_some() {
                        tracing::debug!("WebSocket {}: close handshake timed out", self.id);
                        self.state = CloseState::Closed;
                        return Ok(CloseReason::new(CloseCode::Abnormal, "close handshake timed out"));
                    }
                    return Err(SessionError::Timeout);
                }
            }
        }
    }

    async fn handle_frame<H: SessionHandler>(
        &mut self,
        frame: Frame,
        handler: &mut H,
    ) -> Result<(), SessionError> {
        if !frame.masked {
            return Err(FrameDecodeError::UnmaskedFrame.into());
        }

        match frame.opcode {
            Opcode::Ping => {
                tracing::trace!("WebSocket {}: ping ({} bytes)", self.id, frame.payload.len());
                self.write_frame(Opcode::Pong, &frame.payload).await
            }
            Opcode::Pong => {
                tracing::trace!("WebSocket {}: pong", self.id);
                Ok(())
            }
            Opcode::Close => {
                let reason = CloseReason::parse(&frame.payload)?;
                tracing::debug!(
                    "WebSocket {}: close received ({}) in state {}",
                    self.id,
                    reason.code_or_no_status(),
                    self.state.as_str()
                );
                match self.state {
                    CloseState::Open => {
                        self.state = CloseState::CloseReceived;
                        let echo = CloseReason {
                            code: reason.code,
                            reason: String::new(),
                        };
                        self.write_frame(Opcode::Close, &echo.encode()).await?;
                        self.state = CloseState::Closed;
                    }
                    CloseState::CloseSent => self.state = CloseState::Closed,
                    CloseState::CloseReceived | CloseState::Closed => {}
                }
                self.peer_close = Some(reason);
                Ok(())
            }
            Opcode::Text | Opcode::Binary | Opcode::Continuation => {
                let Some(message) = self.reassembler.push(frame)? else {
                    return Ok(());
                };
                tracing::debug!("WebSocket {}: << {}", self.id, message.preview());
                let mut ctx = SessionContext::new(&self.handle, self.state);
                handler.on_message(message, &mut ctx);
                let pending = ctx.into_pending();
                self.flush(pending).await
            }
        }
    }

    async fn flush(&mut self, pending: Vec<Outbound>) -> Result<(), SessionError> {
        for item in pending {
            self.write_outbound(item).await?;
        }
        Ok(())
    }

    async fn write_outbound(&mut self, item: Outbound) -> Result<(), SessionError> {
        match item {
            Outbound::Message(message) => self.send(message).await,
            Outbound::Ping(payload) => self.ping(payload).await,
            Outbound::Close(reason) => self.start_close(reason).await,
        }
    }

    async fn write_frame(&mut self, opcode: Opcode, payload: &[u8]) -> Result<(), SessionError> {
        if self.state == CloseState::Closed {
            return Err(SessionError::ConnectionClosed);
        }
        let wire = encode_frame(opcode, payload, true);
        self.stream.write_all(&wire).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Best-effort Close for protocol errors, then Closed. Returns the code
    /// reported to the application.
    async fn fail(&mut self, err: &SessionError) -> CloseCode {
        let code = err.close_code();
        if let SessionError::Protocol(protocol_err) = err {
            tracing::warn!("WebSocket {}: protocol error: {}", self.id, protocol_err);
            if matches!(self.state, CloseState::Open | CloseState::CloseReceived) {
                let reason = CloseReason::new(code, protocol_err.to_string());
                let wire = encode_frame(Opcode::Close, &reason.encode(), true);
                if let Err(e) = self.stream.write_all(&wire).await {
                    tracing::debug!("WebSocket {}: error writing close frame: {}", self.id, e);
                }
                let _ = self.stream.flush().await;
            }
        }
        self.state = CloseState::Closed;
        self.reassembler.reset();
        code
    }

    /// Close the queue and the stream. Returns how many queued items were
    /// discarded unsent.
    async fn release(&mut self) -> usize {
        self.state = CloseState::Closed;
        self.outbound.close();
        let mut dropped = 0;
        while self.outbound.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            tracing::debug!(
                "WebSocket {}: discarded {} queued outbound item(s) after close",
                self.id,
                dropped
            );
        }
        if let Err(e) = self.stream.shutdown().await {
            tracing::trace!("WebSocket {}: shutdown error: {}", self.id, e);
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageKind;
    use crate::protocol::frame::{decode_frame, encode_masked_frame};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    const KEY: [u8; 4] = [0xA1, 0xB2, 0xC3, 0xD4];

    #[derive(Default)]
    struct Recorder {
        messages: Vec<Message>,
        closes: Vec<(CloseCode, String)>,
        errors: Vec<String>,
        echo: bool,
    }

    impl SessionHandler for Recorder {
        fn on_message(&mut self, message: Message, ctx: &mut SessionContext<'_>) {
            if self.echo {
                ctx.send(message.clone()).unwrap();
            }
            self.messages.push(message);
        }

        fn on_close(&mut self, code: CloseCode, reason: &str) {
            self.closes.push((code, reason.to_string()));
        }

        fn on_error(&mut self, error: &SessionError) {
            self.errors.push(error.to_string());
        }
    }

    fn client_frame(opcode: Opcode, payload: &[u8], fin: bool) -> Vec<u8> {
        encode_masked_frame(opcode, payload, fin, KEY)
    }

    fn close_payload(code: u16) -> Vec<u8> {
        code.to_be_bytes().to_vec()
    }

    /// Read server frames until a Close frame arrives
    async fn read_until_close(peer: &mut DuplexStream) -> Vec<Frame> {
        let mut buf = Vec::new();
        let mut frames = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            while let Decoded::Frame { frame, consumed } = decode_frame(&buf).unwrap() {
                buf.drain(..consumed);
                let is_close = frame.opcode == Opcode::Close;
                frames.push(frame);
                if is_close {
                    return frames;
                }
            }
            let n = peer.read(&mut chunk).await.unwrap();
            assert!(n > 0, "stream ended before a close frame");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[tokio::test]
    async fn echo_then_peer_initiated_close() {
        let (server, mut peer) = duplex(1 << 16);
        let mut handler = Recorder {
            echo: true,
            ..Default::default()
        };
        let session = ConnectionSession::new(server, SessionConfig::default());
        let task = tokio::spawn(async move {
            let result = session.run(&mut handler).await;
            (result, handler)
        });

        peer.write_all(&client_frame(Opcode::Text, b"hello", true)).await.unwrap();
        peer.write_all(&client_frame(Opcode::Close, &close_payload(1000), true))
            .await
            .unwrap();

        let frames = read_until_close(&mut peer).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].opcode, Opcode::Text);
        assert_eq!(&frames[0].payload[..], b"hello");
        assert!(!frames[0].masked);
        assert_eq!(frames[1].opcode, Opcode::Close);
        assert_eq!(&frames[1].payload[..], &close_payload(1000)[..]);

        let (result, handler) = task.await.unwrap();
        assert_eq!(result.unwrap().code, Some(CloseCode::Normal));
        assert_eq!(handler.messages.len(), 1);
        assert_eq!(handler.closes, vec![(CloseCode::Normal, String::new())]);
        assert!(handler.errors.is_empty());
    }

    #[tokio::test]
    async fn close_without_code_is_echoed_empty() {
        let (server, mut peer) = duplex(4096);
        let mut handler = Recorder::default();
        let session = ConnectionSession::new(server, SessionConfig::default());
        let task = tokio::spawn(async move { (session.run(&mut handler).await, handler) });

        peer.write_all(&client_frame(Opcode::Close, b"", true)).await.unwrap();
        let frames = read_until_close(&mut peer).await;
        assert!(frames[0].payload.is_empty());

        let (result, handler) = task.await.unwrap();
        assert_eq!(result.unwrap().code, None);
        assert_eq!(handler.closes[0].0, CloseCode::NoStatusReceived);
    }

    #[tokio::test]
    async fn ping_mid_fragmentation_gets_pong_and_keeps_message() {
        let (server, mut peer) = duplex(1 << 16);
        let mut handler = Recorder::default();
        let session = ConnectionSession::new(server, SessionConfig::default());
        let task = tokio::spawn(async move { (session.run(&mut handler).await, handler) });

        let mut wire = client_frame(Opcode::Text, b"frag", false);
        wire.extend(client_frame(Opcode::Ping, b"are you there", true));
        wire.extend(client_frame(Opcode::Continuation, b"mented", true));
        wire.extend(client_frame(Opcode::Close, &close_payload(1001), true));
        peer.write_all(&wire).await.unwrap();

        let frames = read_until_close(&mut peer).await;
        assert_eq!(frames[0].opcode, Opcode::Pong);
        assert_eq!(&frames[0].payload[..], b"are you there");
        assert_eq!(frames[1].opcode, Opcode::Close);

        let (result, handler) = task.await.unwrap();
        assert_eq!(result.unwrap().code, Some(CloseCode::GoingAway));
        assert_eq!(handler.messages.len(), 1);
        assert_eq!(handler.messages[0].as_text(), Some("fragmented"));
    }

    #[tokio::test]
    async fn byte_at_a_time_delivery() {
        let (server, mut peer) = duplex(64);
        let mut handler = Recorder::default();
        let session = ConnectionSession::new(server, SessionConfig::default());
        let task = tokio::spawn(async move { (session.run(&mut handler).await, handler) });

        let payload = vec![0x5Au8; 300];
        let mut wire = client_frame(Opcode::Binary, &payload, true);
        wire.extend(client_frame(Opcode::Close, &close_payload(1000), true));
        for byte in wire {
            peer.write_all(&[byte]).await.unwrap();
            peer.flush().await.unwrap();
        }
        read_until_close(&mut peer).await;

        let (result, handler) = task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(handler.messages.len(), 1);
        assert_eq!(handler.messages[0].kind, MessageKind::Binary);
        assert_eq!(&handler.messages[0].data[..], &payload[..]);
    }

    #[tokio::test]
    async fn prefix_bytes_are_decoded_first() {
        let (server, mut peer) = duplex(4096);
        let mut handler = Recorder::default();
        let prefix = client_frame(Opcode::Text, b"early", true);
        let session = ConnectionSession::with_prefix(server, &prefix, SessionConfig::default());
        let task = tokio::spawn(async move { (session.run(&mut handler).await, handler) });

        peer.write_all(&client_frame(Opcode::Close, &close_payload(1000), true))
            .await
            .unwrap();
        read_until_close(&mut peer).await;
        let (_, handler) = task.await.unwrap();
        assert_eq!(handler.messages[0].as_text(), Some("early"));
    }

    async fn expect_protocol_close(wire: Vec<u8>, expected: CloseCode) -> Recorder {
        let (server, mut peer) = duplex(1 << 16);
        let mut handler = Recorder::default();
        let session = ConnectionSession::new(server, SessionConfig::default());
        let task = tokio::spawn(async move { (session.run(&mut handler).await, handler) });

        peer.write_all(&wire).await.unwrap();
        let frames = read_until_close(&mut peer).await;
        let close = frames.last().unwrap();
        let reason = CloseReason::parse(&close.payload).unwrap();
        assert_eq!(reason.code, Some(expected));

        let (result, handler) = task.await.unwrap();
        assert!(matches!(result, Err(SessionError::Protocol(_))));
        assert_eq!(handler.errors.len(), 1);
        assert_eq!(handler.closes.len(), 1);
        assert_eq!(handler.closes[0].0, expected);
        handler
    }

    #[tokio::test]
    async fn decode_errors_close_with_matching_code() {
        // reserved bits
        expect_protocol_close(vec![0xC1, 0x80, 0, 0, 0, 0], CloseCode::ProtocolError).await;
        // continuation while idle
        expect_protocol_close(
            client_frame(Opcode::Continuation, b"orphan", true),
            CloseCode::ProtocolError,
        )
        .await;
        // invalid UTF-8 in a text message
        expect_protocol_close(client_frame(Opcode::Text, &[0xFF, 0xFE], true), CloseCode::InvalidPayload)
            .await;
        // unmasked client frame
        expect_protocol_close(encode_frame(Opcode::Text, b"plain", true), CloseCode::ProtocolError).await;
        // two data frames with no continuation between them
        let mut wire = client_frame(Opcode::Text, b"first", false);
        wire.extend(client_frame(Opcode::Text, b"second", true));
        let handler = expect_protocol_close(wire, CloseCode::ProtocolError).await;
        assert!(handler.messages.is_empty());
    }

    #[tokio::test]
    async fn header_and_close_payload_errors_close_with_matching_code() {
        let cases: Vec<(&str, Vec<u8>, CloseCode)> = vec![
            ("reserved opcode", vec![0x83, 0x80, 0, 0, 0, 0], CloseCode::ProtocolError),
            (
                "64-bit length with top bit set",
                vec![0x82, 0xFF, 0x80, 0, 0, 0, 0, 0, 0, 0],
                CloseCode::ProtocolError,
            ),
            (
                "fragmented ping",
                client_frame(Opcode::Ping, b"x", false),
                CloseCode::ProtocolError,
            ),
            (
                "ping over 125 bytes",
                client_frame(Opcode::Ping, &[0u8; 126], true),
                CloseCode::ProtocolError,
            ),
            (
                "one-byte close payload",
                client_frame(Opcode::Close, &[0x03], true),
                CloseCode::ProtocolError,
            ),
            (
                "close code 1005 on the wire",
                client_frame(Opcode::Close, &close_payload(1005), true),
                CloseCode::ProtocolError,
            ),
            (
                "close code below 1000",
                client_frame(Opcode::Close, &close_payload(999), true),
                CloseCode::ProtocolError,
            ),
            (
                "close reason not UTF-8",
                client_frame(Opcode::Close, &[0x03, 0xE8, 0xFF, 0xFE], true),
                CloseCode::InvalidPayload,
            ),
        ];

        for (name, wire, expected) in cases {
            let handler = expect_protocol_close(wire, expected).await;
            assert_eq!(handler.closes[0].0, expected, "{name}");
        }
    }

    #[tokio::test]
    async fn oversized_frame_closes_with_1009() {
        let (server, mut peer) = duplex(1 << 16);
        let mut handler = Recorder::default();
        let config = SessionConfig {
            max_frame_size: 16,
            ..Default::default()
        };
        let session = ConnectionSession::new(server, config);
        let task = tokio::spawn(async move { (session.run(&mut handler).await, handler) });

        peer.write_all(&client_frame(Opcode::Binary, &[0u8; 17], true)).await.unwrap();
        let frames = read_until_close(&mut peer).await;
        let reason = CloseReason::parse(&frames[0].payload).unwrap();
        assert_eq!(reason.code, Some(CloseCode::MessageTooBig));
        let (result, _) = task.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::Protocol(FrameDecodeError::MessageTooBig { .. }))
        ));
    }

    struct Closer;

    impl SessionHandler for Closer {
        fn on_open(&mut self, ctx: &mut SessionContext<'_>) {
            ctx.send_text("Welcome to the chat room").unwrap();
        }

        fn on_message(&mut self, message: Message, ctx: &mut SessionContext<'_>) {
            if message.as_text() == Some("Bye") {
                ctx.close(CloseCode::Normal, "goodbye");
            }
        }
    }

    #[tokio::test]
    async fn server_initiated_close_completes_on_peer_close() {
        let (server, mut peer) = duplex(4096);
        let session = ConnectionSession::new(server, SessionConfig::default());
        let task = tokio::spawn(async move { session.run(&mut Closer).await });

        peer.write_all(&client_frame(Opcode::Text, b"Bye", true)).await.unwrap();
        let frames = read_until_close(&mut peer).await;
        assert_eq!(frames[0].opcode, Opcode::Text);
        assert_eq!(&frames[0].payload[..], b"Welcome to the chat room");
        let sent = CloseReason::parse(&frames[1].payload).unwrap();
        assert_eq!(sent, CloseReason::new(CloseCode::Normal, "goodbye"));

        peer.write_all(&client_frame(Opcode::Close, &close_payload(1000), true))
            .await
            .unwrap();
        let reason = task.await.unwrap().unwrap();
        assert_eq!(reason.code, Some(CloseCode::Normal));
    }

    #[tokio::test]
    async fn close_timeout_ends_session() {
        let (server, mut peer) = duplex(4096);
        let config = SessionConfig {
            close_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let session = ConnectionSession::new(server, config);
        let task = tokio::spawn(async move { session.run(&mut Closer).await });

        peer.write_all(&client_frame(Opcode::Text, b"Bye", true)).await.unwrap();
        read_until_close(&mut peer).await;
        // never answer the close
        let reason = task.await.unwrap().unwrap();
        assert_eq!(reason.code, Some(CloseCode::Abnormal));
    }

    #[tokio::test]
    async fn idle_timeout_is_reported() {
        let (server, _peer) = duplex(4096);
        let mut handler = Recorder::default();
        let config = SessionConfig {
            idle_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let session = ConnectionSession::new(server, config);
        let result = session.run(&mut handler).await;
        assert!(matches!(result, Err(SessionError::Timeout)));
        assert_eq!(handler.closes[0].0, CloseCode::Abnormal);
    }

    #[tokio::test]
    async fn handle_sends_are_written_and_fail_after_close() {
        let (server, mut peer) = duplex(4096);
        let mut handler = Recorder::default();
        let session = ConnectionSession::new(server, SessionConfig::default());
        let handle = session.handle();
        assert_eq!(handle.id(), session.id());
        let task = tokio::spawn(async move { session.run(&mut handler).await });

        handle.send_text("pushed").await.unwrap();
        handle.send_binary(vec![1u8, 2, 3]).await.unwrap();
        handle.close(CloseCode::Normal, "").await.unwrap();
        let frames = read_until_close(&mut peer).await;
        assert_eq!(frames[0].opcode, Opcode::Text);
        assert_eq!(frames[1].opcode, Opcode::Binary);
        assert_eq!(frames[2].opcode, Opcode::Close);

        peer.write_all(&client_frame(Opcode::Close, &close_payload(1000), true))
            .await
            .unwrap();
        task.await.unwrap().unwrap();

        assert!(matches!(
            handle.send_text("too late").await,
            Err(SessionError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn release_discards_and_counts_queued_items() {
        let (server, _peer) = duplex(4096);
        let mut session = ConnectionSession::new(server, SessionConfig::default());
        let handle = session.handle();
        handle.send_text("one").await.unwrap();
        handle.send_binary(vec![2u8]).await.unwrap();

        assert_eq!(session.release().await, 2);
        assert!(handle.is_closed());
        assert!(matches!(
            handle.send_text("three").await,
            Err(SessionError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn items_queued_behind_a_close_are_not_written() {
        let (server, mut peer) = duplex(4096);
        let mut handler = Recorder::default();
        let prefix = client_frame(Opcode::Close, &close_payload(1000), true);
        let session = ConnectionSession::with_prefix(server, &prefix, SessionConfig::default());
        let handle = session.handle();
        handle.send_text("never sent").await.unwrap();

        session.run(&mut handler).await.unwrap();
        let mut written = Vec::new();
        peer.read_to_end(&mut written).await.unwrap();
        assert_eq!(written, encode_frame(Opcode::Close, &close_payload(1000), true));
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn direct_send_after_close_fails() {
        let (server, _peer) = duplex(4096);
        let mut session = ConnectionSession::new(server, SessionConfig::default());
        session.send(Message::text("hi")).await.unwrap();
        session.close(CloseCode::Normal, "").await.unwrap();
        assert_eq!(session.state(), CloseState::CloseSent);
        // sending is still allowed until the handshake completes
        session.send(Message::text("still open")).await.unwrap();
        session.state = CloseState::Closed;
        assert!(matches!(
            session.send(Message::text("closed")).await,
            Err(SessionError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn peer_eof_is_a_transport_error() {
        let (server, peer) = duplex(4096);
        let mut handler = Recorder::default();
        let session = ConnectionSession::new(server, SessionConfig::default());
        drop(peer);
        let result = session.run(&mut handler).await;
        assert!(matches!(result, Err(SessionError::Io(_))));
        assert_eq!(handler.closes[0].0, CloseCode::Abnormal);
    }

    #[tokio::test]
    async fn concurrent_sessions_do_not_share_partial_state() {
        let mut tasks = Vec::new();
        let mut peers = Vec::new();
        for name in ["alpha", "beta"] {
            let (server, peer) = duplex(1 << 16);
            let mut handler = Recorder::default();
            let session = ConnectionSession::new(server, SessionConfig::default());
            tasks.push(tokio::spawn(async move {
                session.run(&mut handler).await.unwrap();
                handler
            }));
            peers.push((name, peer));
        }

        // interleave the fragments of both messages
        for (name, peer) in peers.iter_mut() {
            peer.write_all(&client_frame(Opcode::Text, format!("{name}-1").as_bytes(), false))
                .await
                .unwrap();
        }
        for (name, peer) in peers.iter_mut() {
            peer.write_all(&client_frame(Opcode::Continuation, format!("-{name}-2").as_bytes(), true))
                .await
                .unwrap();
            peer.write_all(&client_frame(Opcode::Close, &close_payload(1000), true))
                .await
                .unwrap();
        }
        for (_, peer) in peers.iter_mut() {
            read_until_close(peer).await;
        }

        let handlers = futures::future::join_all(tasks).await;
        let texts: Vec<String> = handlers
            .into_iter()
            .map(|h| h.unwrap().messages[0].as_text().unwrap().to_string())
            .collect();
        assert_eq!(texts, vec!["alpha-1-alpha-2", "beta-1-beta-2"]);
    }
}
