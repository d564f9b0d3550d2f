//! WebSocket transport adapter (tokio-tungstenite).
//!
//! The factory returns immediately with a transport in `Connecting` state; a
//! spawned task performs the handshake, pumps frames in both directions, and
//! emits transport events. Outgoing frames travel over an unbounded channel
//! so `send` stays synchronous for the core.

use crate::error::TransportError;
use crate::transport::{ReadyState, Transport, TransportEvent, TransportFactory};
use futures_util::{SinkExt, StreamExt};
use rosbridge_protocol::Payload;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;

enum OutboundFrame {
    Payload(Payload),
    Close,
}

struct WsTransport {
    out_tx: mpsc::UnboundedSender<OutboundFrame>,
    state: Arc<AtomicU8>,
}

impl Transport for WsTransport {
    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn send(&self, payload: Payload) -> Result<(), TransportError> {
        if self.ready_state() != ReadyState::Open {
            return Err(TransportError::NotConnected);
        }
        self.out_tx
            .send(OutboundFrame::Payload(payload))
            .map_err(|_| TransportError::NotConnected)
    }

    fn close(&self) {
        match self.ready_state() {
            ReadyState::Closing | ReadyState::Closed => {}
            _ => {
                self.state.store(ReadyState::Closing as u8, Ordering::SeqCst);
                let _ = self.out_tx.send(OutboundFrame::Close);
            }
        }
    }
}

/// Returns the native WebSocket transport factory.
pub fn websocket_factory() -> TransportFactory {
    Arc::new(|url: &str| {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let state = Arc::new(AtomicU8::new(ReadyState::Connecting as u8));
        let transport = WsTransport {
            out_tx,
            state: state.clone(),
        };
        tokio::spawn(run_socket(url.to_string(), state, event_tx, out_rx));
        Ok((Box::new(transport) as Box<dyn Transport>, event_rx))
    })
}

async fn run_socket(
    url: String,
    state: Arc<AtomicU8>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    mut out_rx: mpsc::UnboundedReceiver<OutboundFrame>,
) {
    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            tracing::debug!("WebSocket handshake to {} failed: {}", url, e);
            state.store(ReadyState::Closed as u8, Ordering::SeqCst);
            let _ = event_tx.send(TransportEvent::Error(e.to_string()));
            let _ = event_tx.send(TransportEvent::Closed {
                code: None,
                reason: Some(e.to_string()),
            });
            return;
        }
    };

    state.store(ReadyState::Open as u8, Ordering::SeqCst);
    let _ = event_tx.send(TransportEvent::Open);

    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            frame = out_rx.recv() => {
                let message = match frame {
                    Some(OutboundFrame::Payload(Payload::Text(text))) => Message::Text(text),
                    Some(OutboundFrame::Payload(Payload::Binary(bytes))) => Message::Binary(bytes),
                    Some(OutboundFrame::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        state.store(ReadyState::Closed as u8, Ordering::SeqCst);
                        let _ = event_tx.send(TransportEvent::Closed {
                            code: Some(1000),
                            reason: None,
                        });
                        return;
                    }
                };
                if let Err(e) = sink.send(message).await {
                    tracing::debug!("WebSocket send failed: {}", e);
                    state.store(ReadyState::Closed as u8, Ordering::SeqCst);
                    let _ = event_tx.send(TransportEvent::Error(e.to_string()));
                    let _ = event_tx.send(TransportEvent::Closed {
                        code: None,
                        reason: Some(e.to_string()),
                    });
                    return;
                }
            }
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        let _ = event_tx.send(TransportEvent::Message(Payload::Text(text)));
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        let _ = event_tx.send(TransportEvent::Message(Payload::Binary(bytes)));
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        state.store(ReadyState::Closed as u8, Ordering::SeqCst);
                        let (code, reason) = match frame {
                            Some(frame) => (
                                Some(u16::from(frame.code)),
                                Some(frame.reason.into_owned()),
                            ),
                            None => (None, None),
                        };
                        let _ = event_tx.send(TransportEvent::Closed { code, reason });
                        return;
                    }
                    Some(Err(e)) => {
                        state.store(ReadyState::Closed as u8, Ordering::SeqCst);
                        let _ = event_tx.send(TransportEvent::Error(e.to_string()));
                        let _ = event_tx.send(TransportEvent::Closed {
                            code: None,
                            reason: Some(e.to_string()),
                        });
                        return;
                    }
                    None => {
                        state.store(ReadyState::Closed as u8, Ordering::SeqCst);
                        let _ = event_tx.send(TransportEvent::Closed { code: None, reason: None });
                        return;
                    }
                }
            }
        }
    }
}
