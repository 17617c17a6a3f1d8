//! Client registry actor
//!
//! A single task owns the `Username -> Sink` map and processes commands one
//! at a time, so every operation (including check-then-insert) is atomic.
//! Handlers talk to it through the cloneable `RegistryHandle`.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::error::AppError;
use crate::session::Sink;
use crate::types::Username;

/// Commands sent from handlers to the registry actor
#[derive(Debug)]
pub(crate) enum RegistryCommand {
    /// Insert if the username is free; replies whether it was inserted
    TryInsert {
        username: Username,
        sink: Sink,
        reply: oneshot::Sender<bool>,
    },
    /// Remove the entry; replies whether one existed
    Remove {
        username: Username,
        reply: oneshot::Sender<bool>,
    },
    /// Copy of every current entry
    Snapshot {
        reply: oneshot::Sender<Vec<(Username, Sink)>>,
    },
}

/// The registry actor
///
/// Holds at most one sink per username. An entry exists exactly while its
/// session is logged in.
pub(crate) struct ClientRegistry {
    /// Registered sessions: Username -> Sink
    clients: HashMap<Username, Sink>,
    /// Command receiver channel
    receiver: mpsc::Receiver<RegistryCommand>,
}

impl ClientRegistry {
    /// Create a new registry with the given command receiver
    pub fn new(receiver: mpsc::Receiver<RegistryCommand>) -> Self {
        Self {
            clients: HashMap::new(),
            receiver,
        }
    }

    /// Run the registry event loop
    ///
    /// Continuously receives and processes commands until all handles are dropped.
    pub async fn run(mut self) {
        debug!("ClientRegistry started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        debug!("ClientRegistry shutting down");
    }

    /// Process a single command
    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::TryInsert {
                username,
                sink,
                reply,
            } => {
                let _ = reply.send(self.try_insert(username, sink));
            }
            RegistryCommand::Remove { username, reply } => {
                let _ = reply.send(self.remove(&username));
            }
            RegistryCommand::Snapshot { reply } => {
                let snapshot = self
                    .clients
                    .iter()
                    .map(|(name, sink)| (name.clone(), sink.clone()))
                    .collect();
                let _ = reply.send(snapshot);
            }
        }
    }

    fn try_insert(&mut self, username: Username, sink: Sink) -> bool {
        match self.clients.entry(username) {
            Entry::Occupied(entry) => {
                debug!("Username '{}' already registered", entry.key());
                false
            }
            Entry::Vacant(entry) => {
                info!(
                    "Registered '{}' (session {})",
                    entry.key(),
                    sink.session_id()
                );
                entry.insert(sink);
                debug!("Total clients: {}", self.clients.len());
                true
            }
        }
    }

    fn remove(&mut self, username: &Username) -> bool {
        let removed = self.clients.remove(username).is_some();
        if removed {
            info!("Unregistered '{}'", username);
            debug!("Total clients: {}", self.clients.len());
        }
        removed
    }
}

/// Cloneable handle to the registry actor
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    /// Spawn the registry actor and return a handle to it
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        tokio::spawn(ClientRegistry::new(receiver).run());
        Self { sender }
    }

    /// Atomically insert `username -> sink` if the username is free
    pub async fn try_insert(&self, username: Username, sink: Sink) -> Result<bool, AppError> {
        self.request(|reply| RegistryCommand::TryInsert {
            username,
            sink,
            reply,
        })
        .await
    }

    /// Remove `username`; a second removal returns `false`
    pub async fn remove(&self, username: Username) -> Result<bool, AppError> {
        self.request(|reply| RegistryCommand::Remove { username, reply })
            .await
    }

    /// Copy of the current entries, taken in one step
    pub async fn snapshot(&self) -> Result<Vec<(Username, Sink)>, AppError> {
        self.request(|reply| RegistryCommand::Snapshot { reply })
            .await
    }

    /// Number of registered sessions, read from a snapshot
    pub async fn len(&self) -> Result<usize, AppError> {
        Ok(self.snapshot().await?.len())
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, AppError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(build(reply_tx))
            .await
            .map_err(|_| AppError::RegistryClosed)?;
        reply_rx.await.map_err(|_| AppError::RegistryClosed)
    }
}
