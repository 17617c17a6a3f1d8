//! Listener / acceptor
//!
//! Binds the TCP port, owns the registry handle, and spawns one handler task
//! per accepted connection so a slow client never blocks the accept loop.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::error::AppError;
use crate::handler::handle_connection;
use crate::registry::RegistryHandle;

/// Pause after a transient accept error before accepting again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The chat server: a bound listener plus its client registry
pub struct ChatServer {
    listener: TcpListener,
    registry: RegistryHandle,
    sink_capacity: usize,
}

impl ChatServer {
    /// Bind the listener and start the registry actor
    ///
    /// A bind failure is fatal and returned to the caller.
    pub async fn bind(config: ServerConfig) -> Result<Self, AppError> {
        let listener = TcpListener::bind(&config.addr).await?;
        let registry = RegistryHandle::spawn(config.registry_capacity);

        Ok(Self {
            listener,
            registry,
            sink_capacity: config.sink_capacity,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> RegistryHandle {
        self.registry.clone()
    }

    /// Accept connections forever
    pub async fn run(self) -> Result<(), AppError> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` completes
    ///
    /// Transient accept errors are logged and skipped; an unrecoverable one
    /// ends the loop with an error. Sessions already running are left alone.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), AppError>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Listener shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        info!("New connection from {}", addr);
                        self.spawn_handler(stream);
                    }
                    Err(e) => recover_from_accept_error(e).await?,
                }
            }
        }
    }

    fn spawn_handler(&self, stream: TcpStream) {
        let registry = self.registry.clone();
        let sink_capacity = self.sink_capacity;

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, registry, sink_capacity).await {
                warn!("Connection handler error: {}", e);
            }
        });
    }
}

/// Back off after a transient accept error, or give up on a fatal one
///
/// Errors like EMFILE would otherwise make the accept loop spin.
async fn recover_from_accept_error(e: io::Error) -> Result<(), AppError> {
    if is_fatal_accept_error(&e) {
        error!("Listener failed: {}", e);
        return Err(e.into());
    }

    warn!("Failed to accept connection: {}", e);
    tokio::time::sleep(ACCEPT_BACKOFF).await;
    Ok(())
}

/// Errors after which the listening socket is unusable
fn is_fatal_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::InvalidInput
            | io::ErrorKind::NotConnected
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::Unsupported
    )
}
