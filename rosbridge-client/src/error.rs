//! Client error types.

use rosbridge_protocol::ProtocolError;
use thiserror::Error;

/// Transport-level errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("WebSocket is not connected")]
    NotConnected,

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),
}

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket is not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("interrupted by disconnect; resend after reconnect")]
    Disconnected,

    #[error("service call {id} to {service} timed out")]
    ServiceTimeout { service: String, id: String },

    #[error("action goal {id} for {action} timed out")]
    ActionTimeout { action: String, id: String },

    #[error("cancel request {key} timed out")]
    CancelTimeout { key: String },

    #[error("cli request {id} timed out")]
    CliTimeout { id: String },

    #[error("service call failed: {0}")]
    ServiceFailure(String),

    #[error("action goal {id} completed with non-success status {status}")]
    ActionStatus { id: String, status: i64 },

    #[error("action failed: {0}")]
    ActionFailure(String),

    #[error("cancel request failed: {0}")]
    CancelFailure(String),

    #[error("cli request failed: {0}")]
    CliFailure(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
