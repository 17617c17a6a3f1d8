//! Broadcaster
//!
//! Delivers one line to every sink in a registry snapshot. A slow recipient
//! is waited on; a sink whose writer has stopped is logged and skipped.

use tracing::{info, warn};

use crate::error::AppError;
use crate::protocol::ServerMessage;
use crate::registry::RegistryHandle;

#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: RegistryHandle,
}

impl Broadcaster {
    pub fn new(registry: RegistryHandle) -> Self {
        Self { registry }
    }

    /// Send `msg` to every currently registered session, sender included
    ///
    /// Returns how many sinks accepted the line. The snapshot is copied out of
    /// the registry before any delivery, so registry mutations never wait on
    /// a recipient, even while this call waits for a slow one.
    pub async fn broadcast(&self, msg: &ServerMessage) -> Result<usize, AppError> {
        let line = msg.to_string();
        info!("Broadcast: {}", line);

        let recipients = self.registry.snapshot().await?;
        let mut delivered = 0;
        for (username, sink) in &recipients {
            match sink.deliver(line.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Skipped delivery to '{}': {}", username, e),
            }
        }

        Ok(delivered)
    }
}
