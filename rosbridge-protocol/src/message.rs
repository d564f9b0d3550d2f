//! Envelope types for the wire protocol.
//!
//! Outgoing envelopes are built from [`OutgoingMessage`]; field names are
//! literal on the wire and optional fields are omitted when unset. Incoming
//! envelopes are parsed into [`IncomingMessage`] (discriminated by `op`) or
//! [`ActionEvent`] (discriminated by `type`); anything else is dropped by the
//! caller.

use crate::error::ProtocolError;
use serde::Deserialize;
use serde_json::{json, Map, Value};

/// An outgoing protocol operation, prior to envelope rendering.
#[derive(Debug, Clone)]
pub enum OutgoingMessage {
    Subscribe {
        topic: String,
        msg_type: String,
        compression: Option<String>,
    },
    Unsubscribe {
        topic: String,
    },
    Advertise {
        topic: String,
        msg_type: String,
    },
    Publish {
        topic: String,
        msg: Value,
    },
    CallService {
        service: String,
        srv_type: String,
        args: Value,
        id: Option<String>,
    },
    SendActionGoal {
        action: String,
        action_type: String,
        goal: Value,
        id: Option<String>,
        session_id: Option<String>,
    },
    CancelActionGoal {
        action: String,
        action_type: String,
        session_id: Option<String>,
    },
    CliRequest {
        command: String,
        id: Option<String>,
    },
}

impl OutgoingMessage {
    /// Renders the envelope with the built-in (fallback) builder.
    ///
    /// Field order matches the wire convention; `None` fields are omitted.
    pub fn to_envelope(&self) -> Value {
        let mut env = Map::new();
        match self {
            OutgoingMessage::Subscribe {
                topic,
                msg_type,
                compression,
            } => {
                env.insert("op".into(), json!("subscribe"));
                env.insert("topic".into(), json!(topic));
                env.insert("type".into(), json!(msg_type));
                if let Some(compression) = compression {
                    env.insert("compression".into(), json!(compression));
                }
            }
            OutgoingMessage::Unsubscribe { topic } => {
                env.insert("op".into(), json!("unsubscribe"));
                env.insert("topic".into(), json!(topic));
            }
            OutgoingMessage::Advertise { topic, msg_type } => {
                env.insert("op".into(), json!("advertise"));
                env.insert("topic".into(), json!(topic));
                env.insert("type".into(), json!(msg_type));
            }
            OutgoingMessage::Publish { topic, msg } => {
                env.insert("op".into(), json!("publish"));
                env.insert("topic".into(), json!(topic));
                env.insert("msg".into(), msg.clone());
            }
            OutgoingMessage::CallService {
                service,
                srv_type,
                args,
                id,
            } => {
                env.insert("op".into(), json!("call_service"));
                env.insert("service".into(), json!(service));
                env.insert("type".into(), json!(srv_type));
                env.insert("args".into(), args.clone());
                if let Some(id) = id {
                    env.insert("id".into(), json!(id));
                }
            }
            OutgoingMessage::SendActionGoal {
                action,
                action_type,
                goal,
                id,
                session_id,
            } => {
                env.insert("op".into(), json!("send_action_goal"));
                env.insert("action".into(), json!(action));
                env.insert("action_type".into(), json!(action_type));
                env.insert("goal".into(), goal.clone());
                if let Some(id) = id {
                    env.insert("id".into(), json!(id));
                }
                if let Some(session_id) = session_id {
                    env.insert("session_id".into(), json!(session_id));
                }
            }
            OutgoingMessage::CancelActionGoal {
                action,
                action_type,
                session_id,
            } => {
                env.insert("op".into(), json!("cancel_action_goal"));
                env.insert("action".into(), json!(action));
                env.insert("action_type".into(), json!(action_type));
                if let Some(session_id) = session_id {
                    env.insert("session_id".into(), json!(session_id));
                }
            }
            OutgoingMessage::CliRequest { command, id } => {
                env.insert("op".into(), json!("cli_request"));
                env.insert("command".into(), json!(command));
                if let Some(id) = id {
                    env.insert("id".into(), json!(id));
                }
            }
        }
        Value::Object(env)
    }
}

/// Alternative envelope builder installed by the application.
///
/// Returning `None`, or an envelope whose `op` is missing or empty, makes the
/// caller retry through the built-in fallback.
pub trait MessageBuilder: Send + Sync {
    fn build(&self, message: &OutgoingMessage) -> Option<Value>;
}

/// Builds the wire envelope for `message`, preferring `builder` when present
/// and falling back to the built-in rendering.
pub fn build_envelope(
    builder: Option<&dyn MessageBuilder>,
    message: &OutgoingMessage,
) -> Result<Value, ProtocolError> {
    if let Some(builder) = builder {
        if let Some(envelope) = builder.build(message) {
            if has_valid_op(&envelope) {
                return Ok(envelope);
            }
        }
    }
    let envelope = message.to_envelope();
    if has_valid_op(&envelope) {
        Ok(envelope)
    } else {
        Err(ProtocolError::BuildFailed)
    }
}

fn has_valid_op(envelope: &Value) -> bool {
    envelope
        .get("op")
        .and_then(Value::as_str)
        .map_or(false, |op| !op.is_empty())
}

/// Incoming envelope discriminated by `op`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IncomingMessage {
    Publish {
        topic: String,
        #[serde(default)]
        msg: Value,
    },
    ServiceResponse {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        service: Option<String>,
        #[serde(default)]
        result: bool,
        #[serde(default)]
        values: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
    CancelActionResult {
        action: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        result: bool,
        #[serde(default)]
        error: Option<String>,
    },
    ActionResult {
        #[serde(default)]
        action: Option<String>,
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
    CliResponse {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        result: bool,
        #[serde(default)]
        output: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
    Error {
        #[serde(default)]
        error: Option<String>,
    },
}

/// Incoming action event discriminated by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionEvent {
    Request {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        action: Option<String>,
    },
    Feedback {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        feedback: Option<Value>,
    },
    Result {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        status: Option<i64>,
        #[serde(default)]
        result: Option<Value>,
    },
    Error {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
}

/// A parsed incoming envelope.
#[derive(Debug, Clone)]
pub enum Incoming {
    Op(IncomingMessage),
    Event(ActionEvent),
}

/// Parses an incoming envelope. `op` takes priority over `type`; an envelope
/// matching neither yields `None` and is dropped by the caller.
pub fn parse_incoming(value: &Value) -> Option<Incoming> {
    if !value.is_object() {
        return None;
    }
    if let Ok(message) = serde_json::from_value::<IncomingMessage>(value.clone()) {
        return Some(Incoming::Op(message));
    }
    if let Ok(event) = serde_json::from_value::<ActionEvent>(value.clone()) {
        return Some(Incoming::Event(event));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subscribe_envelope_fields() {
        let message = OutgoingMessage::Subscribe {
            topic: "/t".into(),
            msg_type: "std_msgs/String".into(),
            compression: Some("cbor-raw".into()),
        };
        assert_eq!(
            message.to_envelope(),
            json!({"op": "subscribe", "topic": "/t", "type": "std_msgs/String", "compression": "cbor-raw"})
        );
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let message = OutgoingMessage::Subscribe {
            topic: "/t".into(),
            msg_type: "std_msgs/String".into(),
            compression: None,
        };
        let envelope = message.to_envelope();
        assert!(envelope.get("compression").is_none());

        let message = OutgoingMessage::CallService {
            service: "/s".into(),
            srv_type: "srv/T".into(),
            args: json!({}),
            id: None,
        };
        assert!(message.to_envelope().get("id").is_none());
    }

    #[test]
    fn test_send_action_goal_envelope() {
        let message = OutgoingMessage::SendActionGoal {
            action: "/arm/move".into(),
            action_type: "demo/MoveArm".into(),
            goal: json!({"x": 1, "y": 2}),
            id: Some("g1".into()),
            session_id: Some("s1".into()),
        };
        assert_eq!(
            message.to_envelope(),
            json!({
                "op": "send_action_goal",
                "action": "/arm/move",
                "action_type": "demo/MoveArm",
                "goal": {"x": 1, "y": 2},
                "id": "g1",
                "session_id": "s1",
            })
        );
    }

    struct BrokenBuilder;

    impl MessageBuilder for BrokenBuilder {
        fn build(&self, _message: &OutgoingMessage) -> Option<Value> {
            Some(json!({"op": ""}))
        }
    }

    struct AbsentBuilder;

    impl MessageBuilder for AbsentBuilder {
        fn build(&self, _message: &OutgoingMessage) -> Option<Value> {
            None
        }
    }

    #[test]
    fn test_build_envelope_falls_back_on_invalid_op() {
        let message = OutgoingMessage::Unsubscribe { topic: "/t".into() };
        let envelope =
            build_envelope(Some(&BrokenBuilder as &dyn MessageBuilder), &message).unwrap();
        assert_eq!(envelope, json!({"op": "unsubscribe", "topic": "/t"}));

        let envelope =
            build_envelope(Some(&AbsentBuilder as &dyn MessageBuilder), &message).unwrap();
        assert_eq!(envelope["op"], "unsubscribe");
    }

    #[test]
    fn test_parse_incoming_priority_and_unknowns() {
        let publish = json!({"op": "publish", "topic": "/t", "msg": {"n": 1}});
        assert!(matches!(
            parse_incoming(&publish),
            Some(Incoming::Op(IncomingMessage::Publish { .. }))
        ));

        let feedback = json!({"type": "feedback", "session_id": "s", "feedback": {"p": 0.5}});
        assert!(matches!(
            parse_incoming(&feedback),
            Some(Incoming::Event(ActionEvent::Feedback { .. }))
        ));

        assert!(parse_incoming(&json!({"foo": "bar"})).is_none());
        assert!(parse_incoming(&json!({"op": "status", "msg": "x"})).is_none());
        assert!(parse_incoming(&json!(42)).is_none());
    }

    #[test]
    fn test_parse_service_response_defaults() {
        let value = json!({"op": "service_response", "id": "c1", "result": true});
        match parse_incoming(&value) {
            Some(Incoming::Op(IncomingMessage::ServiceResponse {
                id,
                result,
                values,
                error,
                ..
            })) => {
                assert_eq!(id.as_deref(), Some("c1"));
                assert!(result);
                assert!(values.is_none());
                assert!(error.is_none());
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }
}
