//! Error types shared across the server.
//!
//! `AuthError` and `UsageError` double as reply text: their `Display`
//! output is sent to the client verbatim.

use std::io;

use thiserror::Error;

/// A single frame could not be decoded. The frame is dropped and the
/// session keeps reading.
#[derive(Debug, Error)]
#[error("malformed frame: {0}")]
pub struct ProtocolError(#[from] serde_json::Error);

/// Failures that end the byte stream for a session.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    #[error("frame exceeds {limit} bytes")]
    FrameTooLong { limit: usize },

    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Rejections during the handshake. Each one is terminal for the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("First message must be a login or register request. Connection rejected.")]
    NotAuthenticated,

    #[error("Username and password are required. Connection rejected.")]
    MissingCredentials,

    #[error("Username must be at most 32 characters without spaces. Connection rejected.")]
    InvalidUsername,

    #[error("Username not found. Connection rejected.")]
    UnknownUser,

    #[error("Incorrect password. Connection rejected.")]
    WrongPassword,

    #[error("Username already exists. Connection rejected.")]
    UsernameTaken,

    #[error("User is already logged in. Connection rejected.")]
    AlreadyConnected,

    #[error("Authentication is unavailable right now. Connection rejected.")]
    Unavailable,
}

/// Bad command input from an authenticated client. Reported to the sender only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("Usage: /msg <user> <message>")]
    Msg,

    #[error("Usage: /me <action>")]
    Me,

    #[error("You are already logged in.")]
    AlreadyAuthenticated,

    #[error("Unknown command: {0}. Type /help for a list of commands.")]
    UnknownCommand(String),
}
