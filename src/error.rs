//! Error types for the chat server
//!
//! Defines application-level errors, login rejections and sink send errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Application-level errors
///
/// Covers both fatal errors (connection termination) and
/// login rejections (reported to the client, then connection closed).
#[derive(Debug, Error)]
pub enum AppError {
    /// IO error (fatal for the connection)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The registry actor is gone (fatal - internal channel broken)
    #[error("Client registry closed")]
    RegistryClosed,

    /// Writing to the session's own sink failed
    #[error("Send error: {0}")]
    Send(#[from] SendError),

    /// Login negotiation rejected the client
    #[error("Login rejected: {0}")]
    Login(#[from] LoginError),
}

/// Reasons a login is refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoginError {
    /// First line was missing, empty or whitespace-only
    #[error("empty username")]
    EmptyUsername,

    /// Another registered session already holds this username
    #[error("username '{0}' is taken")]
    UsernameTaken(String),
}

/// Sink send errors
///
/// Occurs when a line cannot be queued because the client's writer is gone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The writer task has stopped (client disconnected or write failed)
    #[error("Channel closed")]
    ChannelClosed,
}
