//! # Error Types
//!
//! Error handling for the relay protocol engine and transaction cache.
//!
//! Every variant belongs to one of five recovery tiers (see [`ErrorClass`]).
//! The connection engine decides what to do with an error purely from its
//! tier, so handlers only need to pick the right variant.
//!
//! ## Error Tiers
//! - **Framing**: malformed header or length, the stream position is lost
//! - **Resource exhaustion**: allocation failure, propagated and never retried
//! - **Validation**: a structurally complete message that is invalid or unauthorized
//! - **Handshake violation**: traffic that is not allowed before the handshake completes
//! - **Generic**: anything else raised while decoding or handling a message
//!
//! ## Example Usage
//! ```rust
//! use bdn_relay::error::{ErrorClass, RelayError};
//!
//! let err = RelayError::Validation("short id list truncated".into());
//! assert_eq!(err.class(), ErrorClass::Validation);
//! ```

use std::collections::TryReserveError;
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Framing errors
    pub const ERR_MALFORMED_TYPE_TAG: &str = "Malformed message type tag";
    pub const ERR_PAYLOAD_TOO_LARGE: &str = "Declared payload length exceeds limit";

    /// Validation errors
    pub const ERR_UNKNOWN_MESSAGE_TYPE: &str = "Unrecognized message type";
    pub const ERR_PAYLOAD_OUT_OF_BOUNDS: &str = "Payload length out of bounds for message type";
    pub const ERR_TRUNCATED_PAYLOAD: &str = "Payload truncated";
    pub const ERR_TRAILING_BYTES: &str = "Unexpected trailing bytes in payload";
    pub const ERR_LENGTH_MISMATCH: &str = "Header payload length does not match message size";

    /// Handshake errors
    pub const ERR_PRE_HANDSHAKE_MESSAGE: &str = "Message received before handshake completed";
    pub const ERR_UNSUPPORTED_VERSION: &str = "Unsupported protocol version";

    /// Synchronization errors
    pub const ERR_TX_CACHE_LOCK: &str = "Failed to acquire transaction cache lock";
    pub const ERR_PEER_REGISTRY_LOCK: &str = "Failed to acquire peer registry lock";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";

    /// Timer errors
    pub const ERR_TIMER_DELAY_OVERFLOW: &str = "Timer delay exceeds the clock range";
}

/// Recovery tier of an error, as seen by the connection engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Stream position is unknown; the connection must close.
    Framing,
    /// Allocation failure; propagated to the caller.
    ResourceExhaustion,
    /// Discard the offending message and count a strike.
    Validation,
    /// Close without strike accounting.
    HandshakeViolation,
    /// Recoverable only when the offending message was fully framed.
    Generic,
}

// RelayError is the primary error type for all relay operations
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized message: {0}")]
    Unauthorized(String),

    #[error("Handshake violation: {0}")]
    HandshakeViolation(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Buffer underflow: requested {requested} bytes, {available} available")]
    BufferUnderflow { requested: usize, available: usize },

    #[error("Version conversion failed: {0}")]
    Conversion(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Synchronization primitive poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl RelayError {
    /// Recovery tier the connection engine applies to this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            RelayError::Framing(_) => ErrorClass::Framing,
            RelayError::ResourceExhausted(_) => ErrorClass::ResourceExhaustion,
            RelayError::Validation(_) | RelayError::Unauthorized(_) => ErrorClass::Validation,
            RelayError::HandshakeViolation(_) => ErrorClass::HandshakeViolation,
            RelayError::Io(_)
            | RelayError::Processing(_)
            | RelayError::BufferUnderflow { .. }
            | RelayError::Conversion(_)
            | RelayError::ConnectionClosed
            | RelayError::Config(_)
            | RelayError::LockPoisoned(_) => ErrorClass::Generic,
        }
    }
}

impl From<TryReserveError> for RelayError {
    fn from(err: TryReserveError) -> Self {
        RelayError::ResourceExhausted(err.to_string())
    }
}

/// Type alias for Results using RelayError
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_tiers() {
        assert_eq!(RelayError::Framing("x".into()).class(), ErrorClass::Framing);
        assert_eq!(
            RelayError::Unauthorized("x".into()).class(),
            ErrorClass::Validation
        );
        assert_eq!(
            RelayError::HandshakeViolation("x".into()).class(),
            ErrorClass::HandshakeViolation
        );
        assert_eq!(
            RelayError::BufferUnderflow {
                requested: 4,
                available: 1
            }
            .class(),
            ErrorClass::Generic
        );
    }

    #[test]
    fn test_try_reserve_maps_to_resource_exhaustion() {
        let mut v: Vec<u8> = Vec::new();
        let err = v.try_reserve_exact(usize::MAX).unwrap_err();
        let relay_err: RelayError = err.into();
        assert_eq!(relay_err.class(), ErrorClass::ResourceExhaustion);
    }
}
