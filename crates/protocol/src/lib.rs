//! Wire protocol for the chatrelay server.
//!
//! Every frame carries one or more newline-separated JSON [`Envelope`]s.

pub mod constants;
pub mod envelope;
pub mod messages;

// Re-export primary types for convenience.
pub use constants::{ErrorCode, MessageType, SubType};
pub use envelope::{Body, Envelope, Payload, now_millis};
pub use messages::{
    ErrorPayload, LoginRequest, LoginResponse, UserInfo, UserListPayload, UserPresence,
};

/// Errors produced while encoding or decoding envelopes.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("unexpected payload shape: {0}")]
    Payload(#[source] serde_json::Error),

    #[error("payload must be a JSON object")]
    PayloadNotObject,
}
