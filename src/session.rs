//! Session and sink definitions
//!
//! A `Session` is the server-side state of one connection; a `Sink` is the
//! cloneable write endpoint that queues lines for that connection's writer task.

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::SendError;
use crate::protocol::ServerMessage;
use crate::types::{SessionId, Username};

/// Outbound line queue of one client
///
/// Cloned into the registry on login. The receiving end is drained by the
/// connection's writer task.
#[derive(Debug, Clone)]
pub struct Sink {
    session_id: SessionId,
    sender: mpsc::Sender<String>,
}

impl Sink {
    pub fn new(session_id: SessionId, sender: mpsc::Sender<String>) -> Self {
        Self { session_id, sender }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Queue a rendered message, waiting for capacity
    pub async fn send(&self, msg: &ServerMessage) -> Result<(), SendError> {
        self.deliver(msg.to_string()).await
    }

    /// Queue a line, waiting for capacity
    ///
    /// Only fails once the writer task has stopped. A slow reader makes this
    /// wait rather than lose the line.
    pub async fn deliver(&self, line: String) -> Result<(), SendError> {
        self.sender
            .send(line)
            .await
            .map_err(|_| SendError::ChannelClosed)
    }

    /// Check if the writer task has stopped
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Resolves once the writer task has stopped
    pub async fn closed(&self) {
        self.sender.closed().await
    }
}

/// Lifecycle of a session
///
/// `AwaitingUsername → Registered → Active → Closed`. Any state may jump to
/// `Closed`; nothing leaves `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingUsername,
    Registered,
    Active,
    Closed,
}

/// Server-side state of one client connection
#[derive(Debug)]
pub struct Session {
    /// Unique identifier for this session
    pub id: SessionId,
    /// Remote address, for logs
    pub peer: String,
    /// Username (None until registered)
    username: Option<Username>,
    state: SessionState,
    /// Server → Client line queue
    pub sink: Sink,
}

impl Session {
    /// Create a new session awaiting its username
    pub fn new(id: SessionId, peer: String, sink: Sink) -> Self {
        Self {
            id,
            peer,
            username: None,
            state: SessionState::AwaitingUsername,
            sink,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn username(&self) -> Option<&Username> {
        self.username.as_ref()
    }

    /// Record a successful registry insert
    ///
    /// The username is assigned exactly once; later calls are ignored.
    pub fn mark_registered(&mut self, username: Username) {
        if self.state != SessionState::AwaitingUsername {
            return;
        }
        debug!("Session {} registered as '{}'", self.id, username);
        self.username = Some(username);
        self.state = SessionState::Registered;
    }

    /// Enter the message loop
    pub fn mark_active(&mut self) {
        if self.state == SessionState::Registered {
            self.state = SessionState::Active;
        }
    }

    /// Enter the terminal state
    ///
    /// Returns the username if this session had registered and was not
    /// already closed, so the caller knows whether a registry entry exists.
    pub fn close(&mut self) -> Option<Username> {
        if self.state == SessionState::Closed {
            return None;
        }
        debug!("Session {} closing from {:?}", self.id, self.state);
        self.state = SessionState::Closed;
        self.username.clone()
    }
}
