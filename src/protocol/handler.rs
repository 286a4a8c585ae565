//! Application callback surface
//!
//! The session calls into a [`SessionHandler`]; the handler answers through
//! the [`SessionContext`] it is given, or from other tasks through a
//! [`SessionHandle`]. Every write still happens on the session's own task, so
//! frames for one connection go out in the order they were queued.

use crate::models::{CloseCode, CloseReason, CloseState, Message, MAX_CONTROL_PAYLOAD};
use crate::protocol::{FrameDecodeError, SessionError};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Work queued for the session's writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Message(Message),
    Ping(Bytes),
    Close(CloseReason),
}

/// Callbacks invoked by a running session
pub trait SessionHandler: Send {
    /// Called once before the first read
    fn on_open(&mut self, _ctx: &mut SessionContext<'_>) {}

    /// A complete Text or Binary message arrived
    fn on_message(&mut self, message: Message, ctx: &mut SessionContext<'_>);

    /// Called exactly once, when the session reaches Closed
    fn on_close(&mut self, _code: CloseCode, _reason: &str) {}

    /// Called before `on_close` when the session ends with an error
    fn on_error(&mut self, _error: &SessionError) {}
}

/// Handler-side view of the session during a callback. Replies are written
/// in queue order as soon as the callback returns.
pub struct SessionContext<'a> {
    handle: &'a SessionHandle,
    state: CloseState,
    pending: Vec<Outbound>,
}

impl<'a> SessionContext<'a> {
    pub(crate) fn new(handle: &'a SessionHandle, state: CloseState) -> Self {
        Self {
            handle,
            state,
            pending: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        self.handle.id()
    }

    pub fn state(&self) -> CloseState {
        self.state
    }

    /// Cloneable sender for use outside the callback
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn send(&mut self, message: Message) -> Result<(), SessionError> {
        if self.state == CloseState::Closed {
            return Err(SessionError::ConnectionClosed);
        }
        self.pending.push(Outbound::Message(message));
        Ok(())
    }

    pub fn send_text(&mut self, text: impl Into<String>) -> Result<(), SessionError> {
        self.send(Message::text(text))
    }

    pub fn send_binary(&mut self, data: impl Into<Bytes>) -> Result<(), SessionError> {
        self.send(Message::binary(data))
    }

    pub fn ping(&mut self, payload: impl Into<Bytes>) -> Result<(), SessionError> {
        let payload = payload.into();
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(FrameDecodeError::ControlFrameTooLarge(payload.len() as u64).into());
        }
        if self.state == CloseState::Closed {
            return Err(SessionError::ConnectionClosed);
        }
        self.pending.push(Outbound::Ping(payload));
        Ok(())
    }

    /// Start the close handshake once queued replies are written
    pub fn close(&mut self, code: CloseCode, reason: impl Into<String>) {
        if self.state != CloseState::Closed {
            self.pending.push(Outbound::Close(CloseReason::new(code, reason)));
        }
    }

    pub(crate) fn into_pending(self) -> Vec<Outbound> {
        self.pending
    }
}

/// Cloneable, `Send` sender into one session's outbound queue.
/// Sends wait for queue space; they fail once the session has closed.
/// `Ok` means the item was queued, not written: anything still queued when
/// the session reaches Closed is discarded.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Arc<str>,
    tx: mpsc::Sender<Outbound>,
}

impl SessionHandle {
    pub(crate) fn new(id: Arc<str>, tx: mpsc::Sender<Outbound>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn send(&self, message: Message) -> Result<(), SessionError> {
        self.enqueue(Outbound::Message(message)).await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.send(Message::text(text)).await
    }

    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), SessionError> {
        self.send(Message::binary(data)).await
    }

    pub async fn close(&self, code: CloseCode, reason: impl Into<String>) -> Result<(), SessionError> {
        self.enqueue(Outbound::Close(CloseReason::new(code, reason)))
            .await
    }

    async fn enqueue(&self, item: Outbound) -> Result<(), SessionError> {
        self.tx
            .send(item)
            .await
            .map_err(|_| SessionError::ConnectionClosed)
    }
}
