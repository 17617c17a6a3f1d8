//! Server configuration

/// Default server address
pub const DEFAULT_ADDR: &str = "0.0.0.0:12345";

/// Outbound line queue size per client
pub const DEFAULT_SINK_CAPACITY: usize = 256;

/// Channel buffer size for registry commands
pub const DEFAULT_REGISTRY_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address the listener binds to
    pub addr: String,
    /// Lines a client may fall behind before broadcasts to it are dropped
    pub sink_capacity: usize,
    /// Pending registry commands before handlers wait
    pub registry_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            sink_capacity: DEFAULT_SINK_CAPACITY,
            registry_capacity: DEFAULT_REGISTRY_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Build from command-line arguments (program name first)
    ///
    /// The first positional argument, if any, overrides the bind address.
    pub fn from_args<I>(args: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = Self::default();
        if let Some(addr) = args.into_iter().nth(1) {
            config.addr = addr;
        }
        config
    }

    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }
}
