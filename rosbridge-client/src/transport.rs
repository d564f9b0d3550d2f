//! Transport abstraction.
//!
//! The connection core depends on a small capability set rather than a
//! concrete socket type: a ready state, a synchronous `send`, a `close`, and
//! a stream of events. A factory produces the transport together with its
//! event receiver; the bundled WebSocket adapter lives in
//! [`crate::websocket`], and tests inject scripted transports through the
//! same factory seam.

use crate::error::TransportError;
use rosbridge_protocol::Payload;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Connection readiness, numbered like the WebSocket `readyState` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

/// Events emitted by a transport over its lifetime.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The socket finished its handshake and is ready for traffic.
    Open,
    /// A complete frame arrived.
    Message(Payload),
    /// The socket reported an error. A `Closed` event usually follows.
    Error(String),
    /// The socket is gone.
    Closed {
        code: Option<u16>,
        reason: Option<String>,
    },
}

/// A connected (or connecting) socket owned by the client core.
pub trait Transport: Send {
    fn ready_state(&self) -> ReadyState;

    /// Queues a frame for sending. Must fail unless the state is `Open`.
    fn send(&self, payload: Payload) -> Result<(), TransportError>;

    /// Initiates close. Idempotent; the transport emits `Closed` when done.
    fn close(&self);
}

/// Factory invoked for every connection attempt.
///
/// Returns the transport plus the receiver for its events. The factory may
/// return immediately with a transport in `Connecting` state and emit `Open`
/// asynchronously.
pub type TransportFactory = Arc<
    dyn Fn(&str) -> Result<(Box<dyn Transport>, mpsc::UnboundedReceiver<TransportEvent>), TransportError>
        + Send
        + Sync,
>;
