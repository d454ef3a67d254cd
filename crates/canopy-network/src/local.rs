//! In-process hosts: routers sharing a [`LocalNetwork`] talk over channels.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::{Address, NetworkError, ServerIdentity};

/// First port handed out when a local address asks for port 0.
const FIRST_LOCAL_PORT: u16 = 2000;

/// One frame between two local routers.
#[derive(Debug)]
pub(crate) struct LocalFrame {
    pub from: ServerIdentity,
    pub data: Vec<u8>,
}

type Listeners = HashMap<Address, mpsc::UnboundedSender<LocalFrame>>;

/// Registry of in-process listeners, keyed by address.
///
/// Cloning shares the registry. Channels are unbounded so two routers
/// sending to each other can never block on one another.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    listeners: Arc<Mutex<Listeners>>,
}

impl std::fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNetwork")
            .field("listeners", &self.lock().len())
            .finish()
    }
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a listener. Port 0 picks the lowest free even port from 2000,
    /// leaving the odd one above it free for a websocket surface.
    pub(crate) fn listen(
        &self,
        address: &Address,
    ) -> Result<(Address, mpsc::UnboundedReceiver<LocalFrame>), NetworkError> {
        let mut listeners = self.lock();
        let address = if address.port() == 0 {
            let mut port = FIRST_LOCAL_PORT;
            loop {
                let candidate = address.with_port(port);
                if !listeners.contains_key(&candidate) {
                    break candidate;
                }
                port = port
                    .checked_add(2)
                    .ok_or_else(|| NetworkError::AddressInUse(address.to_string()))?;
            }
        } else {
            address.clone()
        };
        if listeners.contains_key(&address) {
            return Err(NetworkError::AddressInUse(address.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(address.clone(), tx);
        Ok((address, rx))
    }

    pub(crate) fn sender(&self, address: &Address) -> Option<mpsc::UnboundedSender<LocalFrame>> {
        self.lock().get(address).cloned()
    }

    pub(crate) fn remove(&self, address: &Address) {
        self.lock().remove(address);
    }

    pub fn is_listening(&self, address: &Address) -> bool {
        self.lock().contains_key(address)
    }

    /// Number of routers currently registered.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_zero_picks_free_ports() {
        let net = LocalNetwork::new();
        let (a, _rx_a) = net.listen(&Address::local("127.0.0.1", 0)).unwrap();
        let (b, _rx_b) = net.listen(&Address::local("127.0.0.1", 0)).unwrap();
        assert_eq!(a.port(), 2000);
        assert_eq!(b.port(), 2002);
        assert_eq!(net.len(), 2);
    }

    #[test]
    fn duplicate_address_rejected() {
        let net = LocalNetwork::new();
        let addr = Address::local("127.0.0.1", 3000);
        let _rx = net.listen(&addr).unwrap();
        assert!(matches!(net.listen(&addr), Err(NetworkError::AddressInUse(_))));

        net.remove(&addr);
        assert!(!net.is_listening(&addr));
        assert!(net.listen(&addr).is_ok());
    }
}
