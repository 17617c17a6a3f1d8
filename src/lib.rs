//! Line-oriented TCP chat server library
//!
//! Clients connect over plain TCP, pick a unique username, and every line
//! they send afterwards is relayed to all connected clients (the sender
//! included). Messages are newline-terminated UTF-8 text.
//!
//! # Architecture
//! - `ChatServer` accepts connections and spawns one handler task each
//! - `ClientRegistry` is an actor owning the `Username -> Sink` map; all
//!   access goes through `RegistryHandle`, so check-then-insert is atomic
//! - `Broadcaster` copies a registry snapshot, then queues the line on
//!   every sink, waiting on slow readers outside the registry
//! - Each connection has a writer task draining its sink into the socket
//!
//! # Example
//! ```ignore
//! use line_chat::{ChatServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = ChatServer::bind(ServerConfig::default()).await.unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

pub mod broadcast;
pub mod config;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod types;

// Re-export main types for convenience
pub use broadcast::Broadcaster;
pub use config::ServerConfig;
pub use error::{AppError, LoginError, SendError};
pub use handler::{handle_connection, handle_stream};
pub use protocol::{ClientLine, ServerMessage};
pub use registry::RegistryHandle;
pub use server::ChatServer;
pub use session::{Session, SessionState, Sink};
pub use types::{SessionId, Username};
