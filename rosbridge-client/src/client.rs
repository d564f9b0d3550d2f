//! High-level client API.
//!
//! [`Client`] is a cheap handle over the connection task; clones share the
//! same connection, tables, and reconnect state.

use crate::connection::{
    spawn_connection, ActionEventHook, ClientConfig, ClientEvent, Command, ConnectionHandle,
    TopicCallback,
};
use crate::error::ClientError;
use crate::transport::TransportFactory;
use crate::websocket::websocket_factory;
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};

/// Per-call options for service calls and CLI requests.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Correlation id; generated when unset. Collisions overwrite.
    pub id: Option<String>,
    /// Per-call timeout; falls back to the client default when unset.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// An action goal request.
pub struct ActionGoal {
    pub(crate) action: String,
    pub(crate) action_type: String,
    pub(crate) goal: Value,
    pub(crate) id: Option<String>,
    pub(crate) session_id: Option<String>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) on_request: Option<ActionEventHook>,
    pub(crate) on_feedback: Option<ActionEventHook>,
    pub(crate) on_result: Option<ActionEventHook>,
}

impl ActionGoal {
    pub fn new(action: impl Into<String>, action_type: impl Into<String>, goal: Value) -> Self {
        Self {
            action: action.into(),
            action_type: action_type.into(),
            goal,
            id: None,
            session_id: None,
            timeout: None,
            on_request: None,
            on_feedback: None,
            on_result: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Session id echoed in action events; supply one when running several
    /// goals concurrently so events and cancels can be correlated.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Invoked with the server's `request` acknowledgement envelope.
    pub fn on_request(mut self, hook: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.on_request = Some(Box::new(hook));
        self
    }

    /// Invoked with each streamed `feedback` payload.
    pub fn on_feedback(mut self, hook: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.on_feedback = Some(Box::new(hook));
        self
    }

    /// Invoked with the terminal `result` envelope, before the completion
    /// resolves.
    pub fn on_result(mut self, hook: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.on_result = Some(Box::new(hook));
        self
    }
}

/// Options for [`Client::cancel_action_goal`].
#[derive(Debug, Clone, Default)]
pub struct CancelOptions {
    /// Session id of the goal to cancel; `"default"` is used on the
    /// correlation key when unset.
    pub session_id: Option<String>,
    pub timeout: Option<Duration>,
}

impl CancelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A started action goal.
///
/// The goal is already on the wire when this is handed back, so it can be
/// cancelled by session id right away. [`ActionHandle::completion`] waits for
/// the terminal event.
pub struct ActionHandle {
    pub id: String,
    pub session_id: Option<String>,
    completion: oneshot::Receiver<Result<Value, ClientError>>,
}

impl ActionHandle {
    /// Waits for the terminal event: resolves with the action result on
    /// success, fails on non-success status, server error, timeout, or
    /// disconnect.
    pub async fn completion(self) -> Result<Value, ClientError> {
        self.completion
            .await
            .map_err(|_| ClientError::ConnectionClosed)?
    }
}

/// Client for rosbridge-compatible servers.
#[derive(Clone)]
pub struct Client {
    handle: ConnectionHandle,
}

impl Client {
    /// Creates a client using the native WebSocket transport.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_transport(config, websocket_factory())
    }

    /// Creates a client over an injected transport factory. Core semantics
    /// are identical to [`Client::new`]; only the socket construction
    /// differs.
    pub fn with_transport(config: ClientConfig, factory: TransportFactory) -> Self {
        Self {
            handle: spawn_connection(config, factory),
        }
    }

    /// Subscribes to structured client events (connection lifecycle, socket
    /// errors, reconnect scheduling).
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.handle.events.subscribe()
    }

    /// Returns whether the connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.handle.connected.load(Ordering::SeqCst)
    }

    fn send_command(&self, command: Command) -> Result<(), ClientError> {
        self.handle
            .cmd_tx
            .send(command)
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Connects to the server. Concurrent calls share one attempt and one
    /// transport instantiation; a later call after a connection is
    /// established opens a fresh socket.
    pub async fn connect(&self, url: impl Into<String>) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Connect {
            url: url.into(),
            reply,
        })?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Closes the connection and suppresses reconnection until the next
    /// [`Client::connect`]. Outstanding calls are not failed here; transport
    /// close handling rejects them.
    pub async fn close(&self) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Close { reply })?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)
    }

    /// Subscribes `callback` to a topic.
    ///
    /// The subscription entry is recorded even when the wire send fails (for
    /// replay after reconnect), and the error is still returned. Re-passing
    /// the same `Arc` callback is a no-op; a changed message type or
    /// compression re-sends the subscription.
    pub async fn subscribe(
        &self,
        topic: impl Into<String>,
        msg_type: impl Into<String>,
        callback: TopicCallback,
    ) -> Result<(), ClientError> {
        self.subscribe_inner(topic.into(), msg_type.into(), None, callback)
            .await
    }

    /// Subscribes with a compression hint (`none`, `png`, `cbor`,
    /// `cbor-raw`, or any server-understood string).
    pub async fn subscribe_with_compression(
        &self,
        topic: impl Into<String>,
        msg_type: impl Into<String>,
        compression: impl Into<String>,
        callback: TopicCallback,
    ) -> Result<(), ClientError> {
        self.subscribe_inner(topic.into(), msg_type.into(), Some(compression.into()), callback)
            .await
    }

    async fn subscribe_inner(
        &self,
        topic: String,
        msg_type: String,
        compression: Option<String>,
        callback: TopicCallback,
    ) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Subscribe {
            topic,
            msg_type,
            compression,
            callback,
            reply,
        })?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Drops the whole subscription entry for a topic and tells the server.
    pub async fn unsubscribe(&self, topic: impl Into<String>) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Unsubscribe {
            topic: topic.into(),
            reply,
        })?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Advertises a topic. Advertisements are replayed after reconnect and
    /// never auto-removed.
    pub async fn advertise(
        &self,
        topic: impl Into<String>,
        msg_type: impl Into<String>,
    ) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Advertise {
            topic: topic.into(),
            msg_type: msg_type.into(),
            reply,
        })?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Publishes a message. A prior advertise is not required.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        msg: Value,
    ) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Publish {
            topic: topic.into(),
            msg,
            reply,
        })?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Calls a service and waits for its response.
    pub async fn call_service(
        &self,
        service: impl Into<String>,
        srv_type: impl Into<String>,
        args: Value,
    ) -> Result<Value, ClientError> {
        self.call_service_with(service, srv_type, args, CallOptions::default())
            .await
    }

    /// Calls a service with an explicit id and/or timeout.
    pub async fn call_service_with(
        &self,
        service: impl Into<String>,
        srv_type: impl Into<String>,
        args: Value,
        options: CallOptions,
    ) -> Result<Value, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::CallService {
            service: service.into(),
            srv_type: srv_type.into(),
            args,
            id: options.id,
            timeout: options.timeout,
            reply,
        })?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Sends an action goal. Returns once the goal is on the wire; the
    /// returned handle carries the allocated id and the completion.
    pub async fn send_action_goal(&self, goal: ActionGoal) -> Result<ActionHandle, ClientError> {
        let (completion_tx, completion_rx) = oneshot::channel();
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::SendActionGoal {
            goal,
            completion: completion_tx,
            reply,
        })?;
        let started = rx.await.map_err(|_| ClientError::ConnectionClosed)??;
        Ok(ActionHandle {
            id: started.id,
            session_id: started.session_id,
            completion: completion_rx,
        })
    }

    /// Requests cancellation of an action goal and waits for the server's
    /// `cancel_action_result`, which is returned whole on success.
    pub async fn cancel_action_goal(
        &self,
        action: impl Into<String>,
        action_type: impl Into<String>,
        options: CancelOptions,
    ) -> Result<Value, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::CancelActionGoal {
            action: action.into(),
            action_type: action_type.into(),
            session_id: options.session_id,
            timeout: options.timeout,
            reply,
        })?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Runs a remote CLI command and waits for its output.
    pub async fn run_cli_command(&self, command: impl Into<String>) -> Result<Value, ClientError> {
        self.run_cli_command_with(command, CallOptions::default()).await
    }

    /// Runs a remote CLI command with an explicit id and/or timeout.
    pub async fn run_cli_command_with(
        &self,
        command: impl Into<String>,
        options: CallOptions,
    ) -> Result<Value, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::RunCliCommand {
            command: command.into(),
            id: options.id,
            timeout: options.timeout,
            reply,
        })?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }
}
