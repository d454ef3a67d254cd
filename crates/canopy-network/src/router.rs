use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use canopy_metrics::{Traffic, TrafficSnapshot};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::connection::ConnectionPool;
use crate::local::LocalFrame;
use crate::message::{Message, MessageTypeId};
use crate::packet::{read_framed, Frame};
use crate::{
    decode, encode, Address, ConnType, Dispatcher, NetworkError, Packet, Processor, RouterConfig,
    ServerIdentity,
};

/// Where inbound traffic comes from, held until [`Router::start`].
enum Host {
    Tcp(TcpListener),
    Local(mpsc::UnboundedReceiver<LocalFrame>),
}

struct Inner {
    identity: ServerIdentity,
    config: RouterConfig,
    dispatcher: Dispatcher,
    traffic: Traffic,
    pool: ConnectionPool,
    host: Mutex<Option<Host>>,
    loopback_tx: mpsc::UnboundedSender<Packet>,
    loopback_rx: Mutex<Option<mpsc::UnboundedReceiver<Packet>>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

/// Sends typed messages to other servers and hands inbound packets to the
/// processors registered for their type.
///
/// Cheap to clone; all clones drive the same host.
#[derive(Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

impl Router {
    /// Bind a host for `identity.address`.
    ///
    /// A port of 0 is replaced by the one actually bound; the returned
    /// router's [`server_identity`](Self::server_identity) carries it.
    pub async fn bind(identity: ServerIdentity, config: RouterConfig) -> Result<Self, NetworkError> {
        let address = identity.address.clone();
        if !address.valid() {
            return Err(NetworkError::InvalidAddress(address.to_string()));
        }

        let (host, bound) = match address.conn_type() {
            ConnType::Tcp => {
                let listener = TcpListener::bind(address.network_address())
                    .await
                    .map_err(|source| NetworkError::Bind {
                        address: address.to_string(),
                        source,
                    })?;
                let local = listener.local_addr().map_err(|source| NetworkError::Bind {
                    address: address.to_string(),
                    source,
                })?;
                (Host::Tcp(listener), address.with_port(local.port()))
            }
            ConnType::Local => {
                let network = config.local_network.as_ref().ok_or_else(|| {
                    NetworkError::Config("local:// address needs a LocalNetwork".into())
                })?;
                let (bound, rx) = network.listen(&address)?;
                (Host::Local(rx), bound)
            }
            other => return Err(NetworkError::UnsupportedConnType(other.to_string())),
        };

        let mut identity = identity;
        identity.address = bound;

        let (loopback_tx, loopback_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let pool = ConnectionPool::new(identity.clone(), config.local_network.clone(), config.connect_timeout);

        Ok(Self {
            inner: Arc::new(Inner {
                identity,
                config,
                dispatcher: Dispatcher::new(),
                traffic: Traffic::default(),
                pool,
                host: Mutex::new(Some(host)),
                loopback_tx,
                loopback_rx: Mutex::new(Some(loopback_rx)),
                shutdown,
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn server_identity(&self) -> &ServerIdentity {
        &self.inner.identity
    }

    pub fn address(&self) -> &Address {
        &self.inner.identity.address
    }

    pub fn register_processor(&self, msg_type: MessageTypeId, processor: Arc<dyn Processor>) {
        self.inner.dispatcher.register(msg_type, processor);
    }

    /// Register `processor` for the wire type of `M`.
    pub fn register<M: Message>(&self, processor: Arc<dyn Processor>) {
        self.register_processor(M::message_type(), processor);
    }

    pub fn unregister_processor(&self, msg_type: &MessageTypeId) -> bool {
        self.inner.dispatcher.unregister(msg_type)
    }

    /// Start delivering inbound packets. Calling it twice is a no-op.
    pub fn start(&self) {
        let host = self
            .inner
            .host
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let loopback = self
            .inner
            .loopback_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(rx) = loopback {
            tokio::spawn(loopback_loop(self.inner.clone(), rx));
        }
        match host {
            Some(Host::Tcp(listener)) => {
                tokio::spawn(accept_loop(self.inner.clone(), listener));
            }
            Some(Host::Local(rx)) => {
                tokio::spawn(local_loop(self.inner.clone(), rx));
            }
            None => {}
        }
    }

    /// Send a typed message. Returns the number of bytes put on the wire.
    pub async fn send<M: Message>(&self, to: &ServerIdentity, msg: &M) -> Result<usize, NetworkError> {
        self.send_raw(to, M::message_type(), encode(msg)?).await
    }

    /// Send an already encoded body of type `msg_type`.
    ///
    /// A send to our own identity is handed to the local dispatcher in
    /// order and never touches the network.
    pub async fn send_raw(
        &self,
        to: &ServerIdentity,
        msg_type: MessageTypeId,
        payload: Vec<u8>,
    ) -> Result<usize, NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Shutdown);
        }

        if to.id == self.inner.identity.id {
            let size = payload.len();
            let packet = Packet {
                server_identity: self.inner.identity.clone(),
                msg_type,
                payload,
                size: 0,
            };
            self.inner
                .loopback_tx
                .send(packet)
                .map_err(|_| NetworkError::Shutdown)?;
            return Ok(size);
        }

        let data = encode(&Frame { msg_type, payload })?;
        let max = self.inner.config.max_message_size;
        if data.len() > max {
            return Err(NetworkError::MessageTooLarge {
                size: data.len(),
                max,
            });
        }

        let size = data.len() + 4;
        let conn = self.inner.pool.get_or_connect(to).await?;
        if let Err(reason) = conn.send(&self.inner.identity, data.clone()).await {
            // The cached link may have died with the peer; retry once on a fresh one.
            tracing::debug!("send to {to} failed ({reason}), reconnecting");
            self.inner.pool.remove(&to.id).await;
            let conn = self.inner.pool.get_or_connect(to).await?;
            if let Err(reason) = conn.send(&self.inner.identity, data).await {
                self.inner.pool.remove(&to.id).await;
                return Err(NetworkError::Send {
                    address: to.address.to_string(),
                    reason,
                });
            }
        }
        self.inner.traffic.record_tx(size);
        Ok(size)
    }

    /// Stop accepting traffic and drop every outbound connection.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown.send(true);
        self.inner.pool.clear().await;
        // Processors may hold whatever owns this router.
        self.inner.dispatcher.clear();
        // A host never started still owns the listener.
        self.inner
            .host
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if self.inner.identity.address.conn_type() == ConnType::Local {
            if let Some(network) = &self.inner.config.local_network {
                network.remove(&self.inner.identity.address);
            }
        }
        tracing::debug!("router {} closed", self.inner.identity.address);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Bytes sent so far.
    pub fn tx(&self) -> u64 {
        self.inner.traffic.tx()
    }

    /// Bytes received so far.
    pub fn rx(&self) -> u64 {
        self.inner.traffic.rx()
    }

    pub fn traffic(&self) -> TrafficSnapshot {
        self.inner.traffic.snapshot()
    }

    /// Number of cached outbound connections.
    pub async fn connections(&self) -> usize {
        self.inner.pool.len().await
    }
}

// ── Inbound ──────────────────────────────────────────────────────────────

async fn deliver(inner: &Inner, from: &ServerIdentity, data: &[u8]) {
    let frame: Frame = match decode(data) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!("dropping malformed frame from {from}: {e}");
            return;
        }
    };
    inner.traffic.record_rx(data.len() + 4);
    let packet = Packet {
        server_identity: from.clone(),
        msg_type: frame.msg_type,
        payload: frame.payload,
        size: data.len() + 4,
    };
    if let Err(e) = inner.dispatcher.dispatch(packet).await {
        tracing::warn!("{} dropping packet from {from}: {e}", inner.identity.address);
    }
}

async fn loopback_loop(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<Packet>) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        tokio::select! {
            packet = rx.recv() => {
                let Some(packet) = packet else { break };
                if let Err(e) = inner.dispatcher.dispatch(packet).await {
                    tracing::warn!("{} dropping local packet: {e}", inner.identity.address);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn local_loop(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<LocalFrame>) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                deliver(&inner, &frame.from, &frame.data).await;
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(connection_loop(inner.clone(), stream));
                    }
                    Err(e) => {
                        tracing::warn!("{} accept failed: {e}", inner.identity.address);
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Read one inbound TCP connection: the peer's identity first, then frames
/// handled one at a time so the peer's order is kept.
async fn connection_loop(inner: Arc<Inner>, mut stream: TcpStream) {
    let max = inner.config.max_message_size;
    let mut shutdown = inner.shutdown.subscribe();

    let from: ServerIdentity = match read_framed(&mut stream, max).await {
        Ok(hello) => match decode(&hello) {
            Ok(si) => si,
            Err(e) => {
                tracing::warn!("bad handshake on {}: {e}", inner.identity.address);
                return;
            }
        },
        Err(e) => {
            tracing::debug!("connection closed before handshake: {e}");
            return;
        }
    };

    loop {
        tokio::select! {
            read = read_framed(&mut stream, max) => {
                match read {
                    Ok(data) => deliver(&inner, &from, &data).await,
                    Err(NetworkError::Receive(_)) => break,
                    Err(e) => {
                        tracing::warn!("closing connection from {from}: {e}");
                        break;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
