//! Envelope codecs: JSON text, CBOR binary, and auto-detection.

use crate::cbor;
use crate::error::ProtocolError;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// A single frame payload, either a UTF-8 text frame or a binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(s) => s.len(),
            Payload::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Envelope codec selected for a connection.
///
/// The codec is fixed per connection and cannot change mid-session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// JSON text frames both ways.
    Json,
    /// CBOR binary frames out; binary CBOR or stray JSON text in.
    Cbor,
    /// JSON text out (maximally compatible); inspects payload shape on decode.
    #[default]
    Auto,
}

impl Codec {
    /// Resolves a codec name. Resolution is idempotent:
    /// `Codec::resolve(c.name()) == Ok(c)`.
    pub fn resolve(name: &str) -> Result<Self, ProtocolError> {
        name.parse()
    }

    pub fn name(self) -> &'static str {
        match self {
            Codec::Json => "json",
            Codec::Cbor => "cbor",
            Codec::Auto => "auto",
        }
    }

    /// Encodes an envelope into a frame payload.
    pub fn encode(self, value: &Value) -> Result<Payload, ProtocolError> {
        match self {
            Codec::Json | Codec::Auto => Ok(Payload::Text(serde_json::to_string(value)?)),
            Codec::Cbor => Ok(Payload::Binary(cbor::to_vec(value)?)),
        }
    }

    /// Decodes a frame payload into an envelope.
    pub fn decode(self, payload: &Payload) -> Result<Value, ProtocolError> {
        match (self, payload) {
            (Codec::Json, Payload::Text(text)) => Ok(serde_json::from_str(text)?),
            (Codec::Json, Payload::Binary(bytes)) => parse_utf8_json(bytes),
            (Codec::Cbor, Payload::Binary(bytes)) => Ok(cbor::from_slice(bytes)?),
            // Some servers mix JSON text frames into a CBOR session.
            (Codec::Cbor, Payload::Text(text)) => Ok(serde_json::from_str(text)?),
            (Codec::Auto, Payload::Text(text)) => Ok(serde_json::from_str(text)?),
            (Codec::Auto, Payload::Binary(bytes)) => match cbor::from_slice(bytes) {
                Ok(value) => Ok(value),
                Err(_) => parse_utf8_json(bytes),
            },
        }
    }
}

fn parse_utf8_json(bytes: &[u8]) -> Result<Value, ProtocolError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
    Ok(serde_json::from_str(text)?)
}

impl FromStr for Codec {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Codec::Json),
            "cbor" => Ok(Codec::Cbor),
            "auto" => Ok(Codec::Auto),
            other => Err(ProtocolError::UnknownCodec(other.to_string())),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
