//! # rosbridge-protocol
//!
//! Wire protocol for rosbridge-compatible servers, extended with a native
//! action RPC protocol and a remote CLI channel.
//!
//! This crate provides:
//! - Envelope builders for every outgoing operation, with a pluggable
//!   alternative builder and a built-in fallback
//! - Typed parsing of incoming envelopes (`op`- and `type`-discriminated)
//! - JSON / CBOR / auto envelope codecs
//! - A self-contained CBOR encoder/decoder for the protocol subset

pub mod cbor;
pub mod codec;
pub mod error;
pub mod message;

pub use codec::{Codec, Payload};
pub use error::{CborError, ProtocolError};
pub use message::{
    build_envelope, parse_incoming, ActionEvent, Incoming, IncomingMessage, MessageBuilder,
    OutgoingMessage,
};
