use std::time::Duration;

use crate::local::LocalNetwork;

/// Configuration for a [`Router`](crate::Router).
///
/// ```rust
/// use canopy_network::{LocalNetwork, RouterConfig};
///
/// let config = RouterConfig::new()
///     .max_message_size(2 * 1024 * 1024)
///     .local_network(LocalNetwork::new());
/// ```
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum frame size accepted or produced, in bytes.
    pub(crate) max_message_size: usize,
    /// Shared in-process network, required for `local://` addresses.
    pub(crate) local_network: Option<LocalNetwork>,
    /// Upper bound on dialing a peer, handshake included.
    pub(crate) connect_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterConfig {
    pub fn new() -> Self {
        Self {
            max_message_size: 10 * 1024 * 1024, // 10 MiB
            local_network: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Set maximum frame size (default: 10 MiB).
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Set how long dialing a peer may take (default: 10 s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Attach the in-process network used by `local://` addresses.
    pub fn local_network(mut self, network: LocalNetwork) -> Self {
        self.local_network = Some(network);
        self
    }
}
