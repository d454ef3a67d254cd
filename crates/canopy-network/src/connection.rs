use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

use crate::local::{LocalFrame, LocalNetwork};
use crate::packet::write_framed;
use crate::{encode, ConnType, NetworkError, ServerIdentity, ServerIdentityId};

/// An open outbound link to one peer.
#[derive(Clone)]
pub(crate) enum Connection {
    Tcp(Arc<Mutex<OwnedWriteHalf>>),
    Local(mpsc::UnboundedSender<LocalFrame>),
}

impl Connection {
    pub async fn send(&self, from: &ServerIdentity, data: Vec<u8>) -> Result<(), String> {
        match self {
            Connection::Tcp(writer) => {
                let mut writer = writer.lock().await;
                write_framed(&mut *writer, &data)
                    .await
                    .map_err(|e| e.to_string())
            }
            Connection::Local(tx) => tx
                .send(LocalFrame {
                    from: from.clone(),
                    data,
                })
                .map_err(|_| "peer closed".to_string()),
        }
    }
}

/// Caches outbound connections per destination identity. The first send
/// connects, later sends reuse the link.
///
/// The cache lock only covers lookups and inserts; dialing happens outside
/// it, bounded by the connect timeout, so one unreachable peer never holds
/// up sends to the others.
pub(crate) struct ConnectionPool {
    own: ServerIdentity,
    local: Option<LocalNetwork>,
    connect_timeout: Duration,
    connections: Mutex<HashMap<ServerIdentityId, Connection>>,
}

impl Connection {
    fn is_alive(&self) -> bool {
        match self {
            Connection::Local(tx) => !tx.is_closed(),
            Connection::Tcp(_) => true,
        }
    }
}

impl ConnectionPool {
    pub fn new(own: ServerIdentity, local: Option<LocalNetwork>, connect_timeout: Duration) -> Self {
        Self {
            own,
            local,
            connect_timeout,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_connect(&self, to: &ServerIdentity) -> Result<Connection, NetworkError> {
        {
            let mut conns = self.connections.lock().await;
            match conns.get(&to.id) {
                Some(conn) if conn.is_alive() => return Ok(conn.clone()),
                Some(_) => {
                    conns.remove(&to.id);
                }
                None => {}
            }
        }

        let conn = match tokio::time::timeout(self.connect_timeout, self.connect(to)).await {
            Ok(conn) => conn?,
            Err(_) => {
                return Err(NetworkError::Connect {
                    address: to.address.to_string(),
                    reason: format!("timed out after {:?}", self.connect_timeout),
                })
            }
        };

        // Another send may have dialed the same peer meanwhile; keep the
        // first link so frames to one peer share one stream.
        let mut conns = self.connections.lock().await;
        match conns.get(&to.id) {
            Some(existing) if existing.is_alive() => Ok(existing.clone()),
            _ => {
                conns.insert(to.id, conn.clone());
                Ok(conn)
            }
        }
    }

    async fn connect(&self, to: &ServerIdentity) -> Result<Connection, NetworkError> {
        let connect_err = |reason: String| NetworkError::Connect {
            address: to.address.to_string(),
            reason,
        };
        match to.address.conn_type() {
            ConnType::Local => {
                let network = self
                    .local
                    .as_ref()
                    .ok_or_else(|| connect_err("router has no local network".into()))?;
                let tx = network
                    .sender(&to.address)
                    .ok_or_else(|| connect_err("nobody listening".into()))?;
                Ok(Connection::Local(tx))
            }
            ConnType::Tcp => {
                let stream = TcpStream::connect(to.address.network_address())
                    .await
                    .map_err(|e| connect_err(e.to_string()))?;
                stream.set_nodelay(true).map_err(|e| connect_err(e.to_string()))?;
                // Inbound traffic travels over the peer's own connection to us.
                let (_read, mut write) = stream.into_split();
                let hello = encode(&self.own)?;
                write_framed(&mut write, &hello)
                    .await
                    .map_err(|e| connect_err(e.to_string()))?;
                Ok(Connection::Tcp(Arc::new(Mutex::new(write))))
            }
            other => Err(NetworkError::UnsupportedConnType(other.to_string())),
        }
    }

    /// Drop a connection from the cache, e.g. after a send failure.
    pub async fn remove(&self, id: &ServerIdentityId) {
        self.connections.lock().await.remove(id);
    }

    pub async fn clear(&self) {
        self.connections.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }
}
