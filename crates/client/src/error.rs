//! Client error types.
//!
//! Per-relay failures (a timeout, a rejection) are recorded and isolated;
//! they never fail an operation another relay can still satisfy. Only
//! exhaustion of all relays escalates to one of these errors.

use thiserror::Error;

/// Client error type
#[derive(Error, Debug)]
pub enum ClientError {
    /// Transport-level failure, retryable
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Malformed inbound message; the connection itself continues
    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::message::MessageError),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// The identity cannot produce a signature
    #[error("Signing error: {0}")]
    Signing(#[from] agora_core::SignerError),

    /// Event failed shape or signature validation before send
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Not connected to the relay
    #[error("Not connected to relay")]
    NotConnected,

    /// No relays in the pool can serve the request
    #[error("No relays available")]
    NoRelays,

    /// The relay is not a member of the pool
    #[error("Unknown relay: {0}")]
    UnknownRelay(String),

    /// Zero relays acknowledged a publish; one reason per attempted relay
    #[error("publish failed on all relays: {}", reasons.join("; "))]
    PublishFailed { reasons: Vec<String> },

    /// The pool has been shut down
    #[error("Pool is shut down")]
    Shutdown,
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
