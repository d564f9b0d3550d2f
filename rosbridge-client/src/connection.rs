//! Connection core.
//!
//! A single spawned task owns the transport, every correlation table, the
//! socket generations, and the reconnect timer. Public API methods talk to it
//! over an unbounded command channel and wait on oneshot completions, so all
//! state mutation happens between suspension points of one task.
//!
//! Transport events are tagged with the generation captured when their socket
//! was opened; events whose tag no longer matches the active generation come
//! from a stale socket and are discarded. This is what keeps the close of a
//! previous transport (during reconnect) from scheduling another reconnect
//! against the newer, active one.

use crate::client::ActionGoal;
use crate::error::ClientError;
use crate::reconnect::{ReconnectConfig, ReconnectReason, RetryContext};
use crate::transport::{ReadyState, Transport, TransportEvent, TransportFactory};
use rosbridge_protocol::{
    build_envelope, parse_incoming, ActionEvent, Codec, Incoming, IncomingMessage, MessageBuilder,
    OutgoingMessage, Payload,
};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Callback invoked for every message published on a subscribed topic.
pub type TopicCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Hook invoked for intermediate action events (`request`, `feedback`,
/// `result`).
pub type ActionEventHook = Box<dyn Fn(&Value) + Send + Sync>;

/// Capacity of the structured client event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Envelope codec, fixed for the lifetime of the client.
    pub codec: Codec,
    /// Reconnect behavior.
    pub reconnect: ReconnectConfig,
    /// Default timeout for service calls, action goals, cancels, and CLI
    /// requests when the per-call option is unset. `None` disables timeouts.
    pub call_timeout: Option<Duration>,
    /// Alternative envelope builder; the built-in fallback is always used
    /// when it yields no valid envelope.
    pub builder: Option<Arc<dyn MessageBuilder>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            codec: Codec::Auto,
            reconnect: ReconnectConfig::default(),
            call_timeout: Some(Duration::from_secs(30)),
            builder: None,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn without_call_timeout(mut self) -> Self {
        self.call_timeout = None;
        self
    }

    pub fn with_builder(mut self, builder: Arc<dyn MessageBuilder>) -> Self {
        self.builder = Some(builder);
        self
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("codec", &self.codec)
            .field("reconnect", &self.reconnect)
            .field("call_timeout", &self.call_timeout)
            .field("builder", &self.builder.is_some())
            .finish()
    }
}

/// Structured events for observers. The core logs nothing above debug level;
/// applications integrate logging and metrics here.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The socket opened and state replay succeeded.
    Connected,
    /// The active socket closed.
    Disconnected {
        code: Option<u16>,
        reason: Option<String>,
    },
    /// The active socket (or a connection attempt) reported an error.
    SocketError { message: String },
    /// A reconnect timer was armed.
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
        reason: ReconnectReason,
    },
}

/// A started action goal, handed back before any server event arrives.
pub(crate) struct StartedGoal {
    pub id: String,
    pub session_id: Option<String>,
}

pub(crate) enum Command {
    Connect {
        url: String,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    Subscribe {
        topic: String,
        msg_type: String,
        compression: Option<String>,
        callback: TopicCallback,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Unsubscribe {
        topic: String,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Advertise {
        topic: String,
        msg_type: String,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Publish {
        topic: String,
        msg: Value,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    CallService {
        service: String,
        srv_type: String,
        args: Value,
        id: Option<String>,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<Value, ClientError>>,
    },
    SendActionGoal {
        goal: ActionGoal,
        completion: oneshot::Sender<Result<Value, ClientError>>,
        reply: oneshot::Sender<Result<StartedGoal, ClientError>>,
    },
    CancelActionGoal {
        action: String,
        action_type: String,
        session_id: Option<String>,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<Value, ClientError>>,
    },
    RunCliCommand {
        command: String,
        id: Option<String>,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<Value, ClientError>>,
    },
    ServiceTimeout { id: String },
    ActionTimeout { id: String },
    CancelTimeout { key: String },
    CliTimeout { id: String },
    ReconnectFire,
}

struct SubscriptionEntry {
    msg_type: String,
    compression: Option<String>,
    callbacks: Vec<TopicCallback>,
}

struct PendingService {
    service: String,
    reply: oneshot::Sender<Result<Value, ClientError>>,
    timeout: Option<JoinHandle<()>>,
}

struct PendingAction {
    action: String,
    session_id: Option<String>,
    completion: oneshot::Sender<Result<Value, ClientError>>,
    timeout: Option<JoinHandle<()>>,
    on_request: Option<ActionEventHook>,
    on_feedback: Option<ActionEventHook>,
    on_result: Option<ActionEventHook>,
}

struct PendingCancel {
    reply: oneshot::Sender<Result<Value, ClientError>>,
    timeout: Option<JoinHandle<()>>,
}

struct PendingCli {
    reply: oneshot::Sender<Result<Value, ClientError>>,
    timeout: Option<JoinHandle<()>>,
}

fn clear_timeout(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        handle.abort();
    }
}

fn cancel_key(action: &str, session_id: Option<&str>) -> String {
    format!("{}::{}", action, session_id.unwrap_or("default"))
}

#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    pub(crate) cmd_tx: mpsc::UnboundedSender<Command>,
    pub(crate) events: broadcast::Sender<ClientEvent>,
    pub(crate) connected: Arc<AtomicBool>,
}

/// Spawns the connection task and returns the channels for the public API.
pub(crate) fn spawn_connection(config: ClientConfig, factory: TransportFactory) -> ConnectionHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (socket_tx, socket_rx) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let connected = Arc::new(AtomicBool::new(false));

    let connection = Connection {
        config,
        factory,
        cmd_tx: cmd_tx.clone(),
        socket_tx,
        events: events.clone(),
        connected: connected.clone(),
        url: None,
        manual_close: false,
        transport: None,
        socket_generation: 0,
        active_generation: 0,
        connect_waiters: Vec::new(),
        subscriptions: Vec::new(),
        advertised: Vec::new(),
        pending_services: HashMap::new(),
        pending_actions: HashMap::new(),
        actions_by_session: HashMap::new(),
        pending_cancels: HashMap::new(),
        pending_cli: HashMap::new(),
        reconnect_attempt: 0,
        reconnect_timer: None,
        next_call_id: 0,
    };
    tokio::spawn(connection.run(cmd_rx, socket_rx));

    ConnectionHandle {
        cmd_tx,
        events,
        connected,
    }
}

struct Connection {
    config: ClientConfig,
    factory: TransportFactory,
    cmd_tx: mpsc::UnboundedSender<Command>,
    socket_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    events: broadcast::Sender<ClientEvent>,
    connected: Arc<AtomicBool>,

    url: Option<String>,
    manual_close: bool,
    transport: Option<Box<dyn Transport>>,

    /// Generation of the most recently attempted socket.
    socket_generation: u64,
    /// Generation whose events are currently accepted.
    active_generation: u64,

    /// Completions for the in-flight connect, if any. Non-empty means a
    /// connect is in flight and further connects join it.
    connect_waiters: Vec<oneshot::Sender<Result<(), ClientError>>>,

    /// Subscription table in insertion order (replayed in order on open).
    subscriptions: Vec<(String, SubscriptionEntry)>,
    /// Advertised topics in insertion order.
    advertised: Vec<(String, String)>,

    pending_services: HashMap<String, PendingService>,
    pending_actions: HashMap<String, PendingAction>,
    /// Reverse index: session id -> pending action id.
    actions_by_session: HashMap<String, String>,
    pending_cancels: HashMap<String, PendingCancel>,
    pending_cli: HashMap<String, PendingCli>,

    reconnect_attempt: u32,
    reconnect_timer: Option<JoinHandle<()>>,
    next_call_id: u64,
}

impl Connection {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut socket_rx: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
    ) {
        loop {
            tokio::select! {
                command = cmd_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = socket_rx.recv() => {
                    if let Some((generation, event)) = event {
                        self.handle_socket_event(generation, event);
                    }
                }
            }
        }
        self.cancel_reconnect_timer();
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { url, reply } => self.handle_connect(url, reply),
            Command::Close { reply } => self.handle_close(reply),
            Command::Subscribe {
                topic,
                msg_type,
                compression,
                callback,
                reply,
            } => {
                let result = self.subscribe(topic, msg_type, compression, callback);
                let _ = reply.send(result);
            }
            Command::Unsubscribe { topic, reply } => {
                let result = self.unsubscribe(topic);
                let _ = reply.send(result);
            }
            Command::Advertise {
                topic,
                msg_type,
                reply,
            } => {
                let result = self.advertise(topic, msg_type);
                let _ = reply.send(result);
            }
            Command::Publish { topic, msg, reply } => {
                let result = self.send_message(&OutgoingMessage::Publish { topic, msg });
                let _ = reply.send(result);
            }
            Command::CallService {
                service,
                srv_type,
                args,
                id,
                timeout,
                reply,
            } => self.call_service(service, srv_type, args, id, timeout, reply),
            Command::SendActionGoal {
                goal,
                completion,
                reply,
            } => self.send_action_goal(goal, completion, reply),
            Command::CancelActionGoal {
                action,
                action_type,
                session_id,
                timeout,
                reply,
            } => self.cancel_action_goal(action, action_type, session_id, timeout, reply),
            Command::RunCliCommand {
                command,
                id,
                timeout,
                reply,
            } => self.run_cli_command(command, id, timeout, reply),
            Command::ServiceTimeout { id } => self.service_timeout(id),
            Command::ActionTimeout { id } => self.action_timeout(id),
            Command::CancelTimeout { key } => self.cancel_timeout(key),
            Command::CliTimeout { id } => self.cli_timeout(id),
            Command::ReconnectFire => self.reconnect_fire(),
        }
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    fn handle_connect(&mut self, url: String, reply: oneshot::Sender<Result<(), ClientError>>) {
        self.manual_close = false;
        if !self.connect_waiters.is_empty() {
            // A connect is already in flight; join its completion.
            self.connect_waiters.push(reply);
            return;
        }
        self.url = Some(url);
        self.cancel_reconnect_timer();
        self.connect_waiters.push(reply);
        self.open_socket();
    }

    fn handle_close(&mut self, reply: oneshot::Sender<()>) {
        tracing::debug!("manual close");
        self.manual_close = true;
        self.cancel_reconnect_timer();
        self.reconnect_attempt = 0;
        // In-flight connect completions are discarded, not rejected.
        self.connect_waiters.clear();
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        self.connected.store(false, Ordering::SeqCst);
        let _ = reply.send(());
    }

    fn open_socket(&mut self) {
        let url = match self.url.clone() {
            Some(url) => url,
            None => {
                self.fail_connect_waiters("no URL configured".to_string());
                return;
            }
        };
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        self.socket_generation += 1;
        let generation = self.socket_generation;
        tracing::debug!("opening socket generation {} to {}", generation, url);

        match (self.factory)(&url) {
            Ok((transport, mut events)) => {
                self.active_generation = generation;
                self.transport = Some(transport);
                let socket_tx = self.socket_tx.clone();
                tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        if socket_tx.send((generation, event)).is_err() {
                            break;
                        }
                    }
                });
            }
            Err(e) => {
                let message = e.to_string();
                tracing::debug!("transport factory failed: {}", message);
                let _ = self.events.send(ClientEvent::SocketError {
                    message: message.clone(),
                });
                self.fail_connect_waiters(message.clone());
                self.schedule_reconnect(ReconnectReason::OpenSocketThrow, Some(message));
            }
        }
    }

    fn fail_connect_waiters(&mut self, message: String) {
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(ClientError::Connect(message.clone())));
        }
    }

    fn handle_socket_event(&mut self, generation: u64, event: TransportEvent) {
        if generation != self.active_generation {
            tracing::debug!(
                "ignoring event from stale socket generation {} (active {})",
                generation,
                self.active_generation
            );
            return;
        }
        match event {
            TransportEvent::Open => self.handle_open(),
            TransportEvent::Message(payload) => self.handle_frame(payload),
            TransportEvent::Error(message) => self.handle_socket_error(message),
            TransportEvent::Closed { code, reason } => self.handle_socket_close(code, reason),
        }
    }

    fn handle_open(&mut self) {
        if let Err(e) = self.replay_state() {
            let message = e.to_string();
            tracing::debug!("state replay failed: {}", message);
            let _ = self.events.send(ClientEvent::SocketError {
                message: message.clone(),
            });
            if let Some(transport) = self.transport.take() {
                transport.close();
            }
            self.fail_connect_waiters(message.clone());
            self.schedule_reconnect(ReconnectReason::ConnectError, Some(message));
            return;
        }
        tracing::debug!("socket generation {} open", self.active_generation);
        self.reconnect_attempt = 0;
        self.connected.store(true, Ordering::SeqCst);
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        let _ = self.events.send(ClientEvent::Connected);
    }

    /// Re-sends the subscription and advertisement tables, in insertion
    /// order, with the latest recorded attributes.
    fn replay_state(&self) -> Result<(), ClientError> {
        for (topic, entry) in &self.subscriptions {
            self.send_message(&OutgoingMessage::Subscribe {
                topic: topic.clone(),
                msg_type: entry.msg_type.clone(),
                compression: entry.compression.clone(),
            })?;
        }
        for (topic, msg_type) in &self.advertised {
            self.send_message(&OutgoingMessage::Advertise {
                topic: topic.clone(),
                msg_type: msg_type.clone(),
            })?;
        }
        Ok(())
    }

    fn handle_socket_error(&mut self, message: String) {
        tracing::debug!("socket error: {}", message);
        let _ = self.events.send(ClientEvent::SocketError {
            message: message.clone(),
        });
        if !self.connect_waiters.is_empty() {
            self.fail_connect_waiters(message.clone());
        }
        self.schedule_reconnect(ReconnectReason::SocketError, Some(message));
    }

    fn handle_socket_close(&mut self, code: Option<u16>, reason: Option<String>) {
        tracing::debug!("socket closed (code {:?})", code);
        self.transport = None;
        self.connected.store(false, Ordering::SeqCst);
        self.reject_outstanding_on_disconnect();
        if !self.connect_waiters.is_empty() {
            let message = reason
                .clone()
                .unwrap_or_else(|| "socket closed before open".to_string());
            self.fail_connect_waiters(message);
        }
        let _ = self.events.send(ClientEvent::Disconnected {
            code,
            reason: reason.clone(),
        });
        if !self.manual_close {
            self.schedule_reconnect(ReconnectReason::SocketClose, reason);
        }
    }

    /// Rejects pending actions, cancels, and CLI requests on disconnect.
    /// Pending service calls stay; they complete after a reconnect or via
    /// their own timeout.
    fn reject_outstanding_on_disconnect(&mut self) {
        for (_, action) in self.pending_actions.drain() {
            clear_timeout(action.timeout);
            let _ = action.completion.send(Err(ClientError::Disconnected));
        }
        self.actions_by_session.clear();
        for (_, cancel) in self.pending_cancels.drain() {
            clear_timeout(cancel.timeout);
            let _ = cancel.reply.send(Err(ClientError::Disconnected));
        }
        for (_, cli) in self.pending_cli.drain() {
            clear_timeout(cli.timeout);
            let _ = cli.reply.send(Err(ClientError::Disconnected));
        }
    }

    // =========================================================================
    // Reconnect scheduling
    // =========================================================================

    fn schedule_reconnect(&mut self, reason: ReconnectReason, error: Option<String>) {
        if self.manual_close || !self.config.reconnect.enabled || self.url.is_none() {
            return;
        }
        if self.reconnect_timer.is_some() {
            return;
        }
        let context = RetryContext {
            attempt: self.reconnect_attempt + 1,
            reason,
            error,
        };
        if let Some(predicate) = &self.config.reconnect.should_retry {
            if !predicate(&context) {
                return;
            }
        }
        self.reconnect_attempt += 1;
        let delay = self.config.reconnect.next_delay(self.reconnect_attempt);
        tracing::debug!(
            "scheduling reconnect attempt {} in {:?} ({})",
            self.reconnect_attempt,
            delay,
            reason
        );
        let _ = self.events.send(ClientEvent::ReconnectScheduled {
            attempt: self.reconnect_attempt,
            delay,
            reason,
        });
        let cmd_tx = self.cmd_tx.clone();
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = cmd_tx.send(Command::ReconnectFire);
        }));
    }

    fn reconnect_fire(&mut self) {
        if self.reconnect_timer.take().is_none() {
            // The timer was cancelled after this fire was queued.
            return;
        }
        if self.manual_close {
            return;
        }
        tracing::debug!("reconnect timer fired (attempt {})", self.reconnect_attempt);
        self.open_socket();
    }

    fn cancel_reconnect_timer(&mut self) {
        if let Some(handle) = self.reconnect_timer.take() {
            handle.abort();
        }
    }

    // =========================================================================
    // Outgoing operations
    // =========================================================================

    /// Builds, encodes, and sends one envelope over the active transport.
    fn send_message(&self, message: &OutgoingMessage) -> Result<(), ClientError> {
        let transport = self.transport.as_ref().ok_or(ClientError::NotConnected)?;
        if transport.ready_state() != ReadyState::Open {
            return Err(ClientError::NotConnected);
        }
        let envelope = build_envelope(self.config.builder.as_deref(), message)?;
        let payload = self.config.codec.encode(&envelope)?;
        transport.send(payload)?;
        Ok(())
    }

    fn subscribe(
        &mut self,
        topic: String,
        msg_type: String,
        compression: Option<String>,
        callback: TopicCallback,
    ) -> Result<(), ClientError> {
        if let Some(index) = self.subscriptions.iter().position(|(t, _)| *t == topic) {
            let entry = &mut self.subscriptions[index].1;
            if !entry
                .callbacks
                .iter()
                .any(|existing| Arc::ptr_eq(existing, &callback))
            {
                entry.callbacks.push(callback);
            }
            if entry.msg_type != msg_type || entry.compression != compression {
                entry.msg_type = msg_type.clone();
                entry.compression = compression.clone();
                return self.send_message(&OutgoingMessage::Subscribe {
                    topic,
                    msg_type,
                    compression,
                });
            }
            return Ok(());
        }
        self.subscriptions.push((
            topic.clone(),
            SubscriptionEntry {
                msg_type: msg_type.clone(),
                compression: compression.clone(),
                callbacks: vec![callback],
            },
        ));
        self.send_message(&OutgoingMessage::Subscribe {
            topic,
            msg_type,
            compression,
        })
    }

    fn unsubscribe(&mut self, topic: String) -> Result<(), ClientError> {
        let Some(index) = self.subscriptions.iter().position(|(t, _)| *t == topic) else {
            return Ok(());
        };
        self.subscriptions.remove(index);
        self.send_message(&OutgoingMessage::Unsubscribe { topic })
    }

    fn advertise(&mut self, topic: String, msg_type: String) -> Result<(), ClientError> {
        if let Some(entry) = self.advertised.iter_mut().find(|(t, _)| *t == topic) {
            entry.1 = msg_type.clone();
        } else {
            self.advertised.push((topic.clone(), msg_type.clone()));
        }
        self.send_message(&OutgoingMessage::Advertise { topic, msg_type })
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_call_id += 1;
        format!("{}:{}", prefix, self.next_call_id)
    }

    fn arm_timeout(&self, timeout: Option<Duration>, command: Command) -> Option<JoinHandle<()>> {
        let timeout = timeout.or(self.config.call_timeout)?;
        let cmd_tx = self.cmd_tx.clone();
        Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = cmd_tx.send(command);
        }))
    }

    fn call_service(
        &mut self,
        service: String,
        srv_type: String,
        args: Value,
        id: Option<String>,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<Value, ClientError>>,
    ) {
        let id = id.unwrap_or_else(|| self.next_id(&format!("call_service:{}", service)));
        let message = OutgoingMessage::CallService {
            service: service.clone(),
            srv_type,
            args,
            id: Some(id.clone()),
        };
        if let Err(e) = self.send_message(&message) {
            let _ = reply.send(Err(e));
            return;
        }
        let timeout = self.arm_timeout(timeout, Command::ServiceTimeout { id: id.clone() });
        if let Some(previous) = self.pending_services.insert(
            id,
            PendingService {
                service,
                reply,
                timeout,
            },
        ) {
            // Id collisions overwrite; the displaced caller sees its channel
            // close.
            clear_timeout(previous.timeout);
        }
    }

    fn send_action_goal(
        &mut self,
        goal: ActionGoal,
        completion: oneshot::Sender<Result<Value, ClientError>>,
        reply: oneshot::Sender<Result<StartedGoal, ClientError>>,
    ) {
        let ActionGoal {
            action,
            action_type,
            goal: goal_msg,
            id,
            session_id,
            timeout,
            on_request,
            on_feedback,
            on_result,
        } = goal;
        let id = id.unwrap_or_else(|| self.next_id(&format!("send_action_goal:{}", action)));
        let message = OutgoingMessage::SendActionGoal {
            action: action.clone(),
            action_type,
            goal: goal_msg,
            id: Some(id.clone()),
            session_id: session_id.clone(),
        };
        if let Err(e) = self.send_message(&message) {
            // No bookkeeping to roll back: nothing was recorded yet, and the
            // completion channel closes when `completion` drops here.
            let _ = reply.send(Err(e));
            return;
        }
        let timeout = self.arm_timeout(timeout, Command::ActionTimeout { id: id.clone() });
        if let Some(session) = &session_id {
            self.actions_by_session.insert(session.clone(), id.clone());
        }
        if let Some(previous) = self.pending_actions.insert(
            id.clone(),
            PendingAction {
                action,
                session_id: session_id.clone(),
                completion,
                timeout,
                on_request,
                on_feedback,
                on_result,
            },
        ) {
            clear_timeout(previous.timeout);
        }
        let _ = reply.send(Ok(StartedGoal { id, session_id }));
    }

    fn cancel_action_goal(
        &mut self,
        action: String,
        action_type: String,
        session_id: Option<String>,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<Value, ClientError>>,
    ) {
        let key = cancel_key(&action, session_id.as_deref());
        let message = OutgoingMessage::CancelActionGoal {
            action,
            action_type,
            session_id,
        };
        if let Err(e) = self.send_message(&message) {
            let _ = reply.send(Err(e));
            return;
        }
        let timeout = self.arm_timeout(timeout, Command::CancelTimeout { key: key.clone() });
        if let Some(previous) = self
            .pending_cancels
            .insert(key, PendingCancel { reply, timeout })
        {
            clear_timeout(previous.timeout);
        }
    }

    fn run_cli_command(
        &mut self,
        command: String,
        id: Option<String>,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<Value, ClientError>>,
    ) {
        let id = id.unwrap_or_else(|| self.next_id("cli_request"));
        let message = OutgoingMessage::CliRequest {
            command,
            id: Some(id.clone()),
        };
        if let Err(e) = self.send_message(&message) {
            let _ = reply.send(Err(e));
            return;
        }
        let timeout = self.arm_timeout(timeout, Command::CliTimeout { id: id.clone() });
        if let Some(previous) = self.pending_cli.insert(id, PendingCli { reply, timeout }) {
            clear_timeout(previous.timeout);
        }
    }

    // =========================================================================
    // Timeouts
    // =========================================================================

    fn service_timeout(&mut self, id: String) {
        if let Some(pending) = self.pending_services.remove(&id) {
            tracing::debug!("service call {} timed out", id);
            let _ = pending.reply.send(Err(ClientError::ServiceTimeout {
                service: pending.service,
                id,
            }));
        }
    }

    fn action_timeout(&mut self, id: String) {
        if let Some(pending) = self.remove_action(&id) {
            tracing::debug!("action goal {} timed out", id);
            let _ = pending.completion.send(Err(ClientError::ActionTimeout {
                action: pending.action.clone(),
                id,
            }));
        }
    }

    fn cancel_timeout(&mut self, key: String) {
        if let Some(pending) = self.pending_cancels.remove(&key) {
            tracing::debug!("cancel request {} timed out", key);
            let _ = pending.reply.send(Err(ClientError::CancelTimeout { key }));
        }
    }

    fn cli_timeout(&mut self, id: String) {
        if let Some(pending) = self.pending_cli.remove(&id) {
            tracing::debug!("cli request {} timed out", id);
            let _ = pending.reply.send(Err(ClientError::CliTimeout { id }));
        }
    }

    // =========================================================================
    // Incoming dispatch
    // =========================================================================

    fn handle_frame(&mut self, payload: Payload) {
        let value = match self.config.codec.decode(&payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!("dropping undecodable frame: {}", e);
                return;
            }
        };
        match parse_incoming(&value) {
            Some(Incoming::Op(message)) => self.handle_op(message, value),
            Some(Incoming::Event(event)) => self.handle_action_event(event, value),
            None => tracing::debug!("dropping unrecognized envelope"),
        }
    }

    fn handle_op(&mut self, message: IncomingMessage, raw: Value) {
        match message {
            IncomingMessage::Publish { topic, msg } => {
                let callbacks = match self.subscriptions.iter().find(|(t, _)| *t == topic) {
                    Some((_, entry)) => entry.callbacks.clone(),
                    None => {
                        tracing::debug!("publish for unknown topic {}", topic);
                        return;
                    }
                };
                for callback in callbacks {
                    callback(&msg);
                }
            }
            IncomingMessage::ServiceResponse {
                id,
                result,
                values,
                error,
                ..
            } => {
                let Some(id) = id else { return };
                let Some(pending) = self.pending_services.remove(&id) else {
                    tracing::debug!("service_response for unknown id {}", id);
                    return;
                };
                clear_timeout(pending.timeout);
                let outcome = if result {
                    Ok(values.unwrap_or_else(|| Value::Object(Default::default())))
                } else {
                    Err(ClientError::ServiceFailure(error.unwrap_or_else(|| {
                        format!("service call {} failed", pending.service)
                    })))
                };
                let _ = pending.reply.send(outcome);
            }
            IncomingMessage::CancelActionResult {
                action,
                session_id,
                result,
                error,
            } => {
                let key = cancel_key(&action, session_id.as_deref());
                let Some(pending) = self.pending_cancels.remove(&key) else {
                    tracing::debug!("cancel_action_result for unknown key {}", key);
                    return;
                };
                clear_timeout(pending.timeout);
                let outcome = if result {
                    Ok(raw)
                } else {
                    Err(ClientError::CancelFailure(error.unwrap_or_else(|| {
                        format!("cancel request {} failed", key)
                    })))
                };
                let _ = pending.reply.send(outcome);
            }
            IncomingMessage::ActionResult {
                id,
                session_id,
                result,
                error,
                ..
            } => {
                let Some(key) = self.find_pending_action(id.as_deref(), session_id.as_deref())
                else {
                    tracing::debug!("action_result matches no pending action");
                    return;
                };
                let Some(pending) = self.remove_action(&key) else { return };
                let outcome = match error {
                    Some(error) => Err(ClientError::ActionFailure(error)),
                    None => Ok(result.unwrap_or(raw)),
                };
                let _ = pending.completion.send(outcome);
            }
            IncomingMessage::CliResponse {
                id,
                result,
                output,
                error,
            } => {
                let Some(id) = id else { return };
                let Some(pending) = self.pending_cli.remove(&id) else {
                    tracing::debug!("cli_response for unknown id {}", id);
                    return;
                };
                clear_timeout(pending.timeout);
                let outcome = if result {
                    Ok(output.unwrap_or_else(|| Value::Object(Default::default())))
                } else {
                    Err(ClientError::CliFailure(
                        error.unwrap_or_else(|| format!("cli request {} failed", id)),
                    ))
                };
                let _ = pending.reply.send(outcome);
            }
            IncomingMessage::Error { error } => {
                // Out-of-band server error with no pending entry to complete.
                tracing::debug!("server error: {}", error.unwrap_or_default());
            }
        }
    }

    fn handle_action_event(&mut self, event: ActionEvent, raw: Value) {
        match event {
            ActionEvent::Request { id, session_id, .. } => {
                let Some(key) = self.find_pending_action(id.as_deref(), session_id.as_deref())
                else {
                    return;
                };
                if let Some(session) = session_id {
                    // Record a server-assigned session id so later cancels
                    // and events can find this goal.
                    if let Some(entry) = self.pending_actions.get_mut(&key) {
                        if entry.session_id.is_none() {
                            entry.session_id = Some(session.clone());
                            self.actions_by_session.insert(session, key.clone());
                        }
                    }
                }
                if let Some(entry) = self.pending_actions.get(&key) {
                    if let Some(hook) = &entry.on_request {
                        hook(&raw);
                    }
                }
            }
            ActionEvent::Feedback {
                id,
                session_id,
                feedback,
            } => {
                let Some(key) = self.find_pending_action(id.as_deref(), session_id.as_deref())
                else {
                    return;
                };
                if let Some(entry) = self.pending_actions.get(&key) {
                    if let Some(hook) = &entry.on_feedback {
                        hook(feedback.as_ref().unwrap_or(&raw));
                    }
                }
            }
            ActionEvent::Result {
                id,
                session_id,
                status,
                result,
            } => {
                let Some(key) = self.find_pending_action(id.as_deref(), session_id.as_deref())
                else {
                    return;
                };
                let Some(pending) = self.remove_action(&key) else { return };
                if let Some(hook) = &pending.on_result {
                    hook(&raw);
                }
                let outcome = match status {
                    Some(status) if status != 0 => Err(ClientError::ActionStatus {
                        id: key.clone(),
                        status,
                    }),
                    _ => Ok(result.unwrap_or(Value::Null)),
                };
                let _ = pending.completion.send(outcome);
            }
            ActionEvent::Error {
                id,
                session_id,
                message,
            } => {
                let Some(key) = self.find_pending_action(id.as_deref(), session_id.as_deref())
                else {
                    return;
                };
                let Some(pending) = self.remove_action(&key) else { return };
                let _ = pending.completion.send(Err(ClientError::ActionFailure(
                    message.unwrap_or_else(|| "action error".to_string()),
                )));
            }
        }
    }

    /// Finds a pending action by id, then by session id, then by being the
    /// only one outstanding. With several outstanding goals and no
    /// correlators the event is unattributable and dropped.
    fn find_pending_action(&self, id: Option<&str>, session_id: Option<&str>) -> Option<String> {
        if let Some(id) = id {
            if self.pending_actions.contains_key(id) {
                return Some(id.to_string());
            }
        }
        if let Some(session) = session_id {
            if let Some(id) = self.actions_by_session.get(session) {
                return Some(id.clone());
            }
        }
        if self.pending_actions.len() == 1 {
            return self.pending_actions.keys().next().cloned();
        }
        None
    }

    fn remove_action(&mut self, id: &str) -> Option<PendingAction> {
        let mut pending = self.pending_actions.remove(id)?;
        if let Some(session) = &pending.session_id {
            self.actions_by_session.remove(session);
        }
        clear_timeout(pending.timeout.take());
        Some(pending)
    }
}
