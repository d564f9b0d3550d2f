//! Scripted mock transport for end-to-end tests.
//!
//! The factory hands the client a transport whose events the test drives by
//! hand through a [`MockLink`]; frames the client sends are captured for
//! inspection.

#![allow(dead_code)]

use rosbridge_client::{
    Client, ClientConfig, ReadyState, Transport, TransportError, TransportEvent, TransportFactory,
};
use rosbridge_protocol::Payload;
use serde_json::Value;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

struct MockTransport {
    sent_tx: mpsc::UnboundedSender<Payload>,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Arc<AtomicU8>,
}

impl Transport for MockTransport {
    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn send(&self, payload: Payload) -> Result<(), TransportError> {
        if self.ready_state() != ReadyState::Open {
            return Err(TransportError::NotConnected);
        }
        self.sent_tx
            .send(payload)
            .map_err(|_| TransportError::Send("mock receiver gone".into()))
    }

    fn close(&self) {
        if self.ready_state() == ReadyState::Closed {
            return;
        }
        self.state.store(ReadyState::Closed as u8, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Closed {
            code: Some(1000),
            reason: None,
        });
    }
}

/// Server side of one mock connection.
pub struct MockLink {
    sent: mpsc::UnboundedReceiver<Payload>,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Arc<AtomicU8>,
}

impl MockLink {
    /// Completes the handshake.
    pub fn open(&self) {
        self.state.store(ReadyState::Open as u8, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Open);
    }

    pub fn error(&self, message: &str) {
        let _ = self.events.send(TransportEvent::Error(message.to_string()));
    }

    /// Drops the connection from the server side.
    pub fn close(&self) {
        self.state.store(ReadyState::Closed as u8, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Closed {
            code: Some(1006),
            reason: Some("mock close".into()),
        });
    }

    pub fn message_json(&self, value: Value) {
        let _ = self
            .events
            .send(TransportEvent::Message(Payload::Text(value.to_string())));
    }

    pub fn message_binary(&self, bytes: Vec<u8>) {
        let _ = self.events.send(TransportEvent::Message(Payload::Binary(bytes)));
    }

    /// Receives the next frame the client sent, decoded to JSON.
    pub async fn recv_json(&mut self) -> Value {
        match self.sent.recv().await.expect("client sent no frame") {
            Payload::Text(text) => serde_json::from_str(&text).expect("invalid JSON from client"),
            Payload::Binary(bytes) => {
                rosbridge_protocol::cbor::from_slice(&bytes).expect("invalid CBOR from client")
            }
        }
    }
}

pub struct MockServer {
    links: mpsc::UnboundedReceiver<MockLink>,
    fail_remaining: Arc<Mutex<u64>>,
    connects: Arc<AtomicUsize>,
}

impl MockServer {
    /// Waits for the next successful connection attempt.
    pub async fn accept(&mut self) -> MockLink {
        self.links.recv().await.expect("no connection attempt")
    }

    /// Makes the next `count` factory invocations fail.
    pub fn fail_next(&self, count: u64) {
        *self.fail_remaining.lock().unwrap() = count;
    }

    /// Total factory invocations, including failed ones.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

pub fn mock_factory() -> (TransportFactory, MockServer) {
    let (link_tx, links) = mpsc::unbounded_channel();
    let fail_remaining = Arc::new(Mutex::new(0u64));
    let connects = Arc::new(AtomicUsize::new(0));

    let factory: TransportFactory = {
        let fail_remaining = fail_remaining.clone();
        let connects = connects.clone();
        Arc::new(move |_url: &str| {
            connects.fetch_add(1, Ordering::SeqCst);
            {
                let mut remaining = fail_remaining.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TransportError::Connect("connection refused".into()));
                }
            }
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let (sent_tx, sent_rx) = mpsc::unbounded_channel();
            let state = Arc::new(AtomicU8::new(ReadyState::Connecting as u8));
            let transport = MockTransport {
                sent_tx,
                events: event_tx.clone(),
                state: state.clone(),
            };
            let _ = link_tx.send(MockLink {
                sent: sent_rx,
                events: event_tx,
                state,
            });
            Ok((
                Box::new(transport) as Box<dyn Transport>,
                event_rx,
            ))
        })
    };

    (
        factory,
        MockServer {
            links,
            fail_remaining,
            connects,
        },
    )
}

pub fn client_with_mock(config: ClientConfig) -> (Client, MockServer) {
    let (factory, server) = mock_factory();
    (Client::with_transport(config, factory), server)
}

/// Connects the client and completes the mock handshake.
pub async fn connect_client(client: &Client, server: &mut MockServer) -> MockLink {
    let (result, link) = tokio::join!(client.connect("ws://mock"), async {
        let link = server.accept().await;
        link.open();
        link
    });
    result.expect("connect failed");
    link
}
