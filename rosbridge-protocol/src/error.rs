//! Protocol error types.

use thiserror::Error;

/// Errors produced while encoding or decoding CBOR items.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CborError {
    #[error("unexpected end of input")]
    UnexpectedEnd,

    #[error("unsupported additional info: {0}")]
    UnsupportedAdditionalInfo(u8),

    #[error("trailing bytes after top-level item: {0}")]
    TrailingBytes(usize),

    #[error("invalid UTF-8 in text string")]
    InvalidUtf8,

    #[error("map key is not a text string")]
    NonStringKey,

    #[error("negative integer out of range")]
    IntegerOutOfRange,

    #[error("non-finite float cannot be represented")]
    NonFiniteFloat,

    #[error("nesting depth limit exceeded")]
    DepthLimit,
}

/// Errors that can occur during envelope handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CBOR error: {0}")]
    Cbor(#[from] CborError),

    #[error("invalid UTF-8 in text payload")]
    InvalidUtf8,

    #[error("unknown codec: {0}")]
    UnknownCodec(String),

    #[error("failed to build a valid protocol message")]
    BuildFailed,
}
