//! Protocol errors.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding, decoding or validating protocol messages.
///
/// Every variant is permanent: retrying the same bytes cannot succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// CBOR encoding failed.
    #[error("encoding failed: {0}")]
    Encode(String),

    /// CBOR decoding failed.
    #[error("decoding failed: {0}")]
    Decode(String),

    /// The peer speaks a different envelope schema.
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaMismatch {
        /// Version this node understands.
        expected: u16,
        /// Version carried by the message.
        found: u16,
    },

    /// The envelope is structurally invalid.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
}
