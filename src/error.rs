//! Error types for the WAMP client

use thiserror::Error;

/// Errors that can occur when using the WAMP client
#[derive(Error, Debug)]
pub enum WampError {
    /// `open` was called on a connection that is already open
    #[error("The connection is already open")]
    AlreadyOpen,

    /// `close` was called on a connection that is not open
    #[error("The connection is already closed")]
    AlreadyClosed,

    /// The operation requires a closed session
    #[error("Session must be closed to call '{0}'")]
    SessionOpen(&'static str),

    /// The operation requires an open session
    #[error("Session must be open to call '{0}'")]
    SessionClosed(&'static str),

    /// A message was sent while the transport was down
    #[error("Transport must be connected to send a message")]
    NotConnected,

    /// A parameter that must be a WAMP URI is not one
    #[error("Invalid URI for '{name}': '{value}'")]
    InvalidUri { name: &'static str, value: String },

    /// An inbound message does not have the field layout of its type
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// An inbound message carries a type code this client does not handle
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u64),

    /// Failed to serialize/deserialize a message
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The default transport or scheduler needs a Tokio runtime to spawn on
    #[error("No Tokio runtime is running")]
    NoRuntime,

    /// The underlying socket failed
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type for WAMP client operations
pub type Result<T> = std::result::Result<T, WampError>;
