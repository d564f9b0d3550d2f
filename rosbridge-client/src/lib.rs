//! # rosbridge-client
//!
//! Async client for rosbridge-compatible servers, extended with a native
//! action RPC protocol and a remote CLI channel.
//!
//! This crate provides:
//! - A connection core with automatic reconnection (exponential backoff with
//!   jitter) and post-reconnect subscription replay
//! - Topic pub/sub, service calls, long-running actions with streamed
//!   feedback, and CLI execution over one multiplexed connection
//! - A transport abstraction with a bundled WebSocket adapter and an
//!   injectable factory for tests and embedding

pub mod client;
pub mod connection;
pub mod error;
pub mod reconnect;
pub mod transport;
pub mod websocket;

pub use client::{ActionGoal, ActionHandle, CallOptions, CancelOptions, Client};
pub use connection::{ActionEventHook, ClientConfig, ClientEvent, TopicCallback};
pub use error::{ClientError, TransportError};
pub use reconnect::{ReconnectConfig, ReconnectReason, RetryContext, RetryPredicate};
pub use transport::{ReadyState, Transport, TransportEvent, TransportFactory};
pub use websocket::websocket_factory;
