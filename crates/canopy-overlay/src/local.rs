//! Many servers in one process, for tests and simulations.

use std::sync::Arc;

use canopy_network::{Address, KeyPair, LocalNetwork, RouterConfig};

use crate::config::ServerConfig;
use crate::protocol::{ProtocolInstance, ProtocolStorage};
use crate::proxy::MessageProxyStore;
use crate::roster::Roster;
use crate::server::Server;
use crate::service::{Service, ServiceRegistry};
use crate::token::ServiceId;
use crate::tree::Tree;
use crate::websocket::Client;
use crate::OverlayError;

/// Attempts at finding two adjacent free TCP ports.
const PORT_ATTEMPTS: usize = 32;

/// Owns a set of servers sharing one protocol and service registry.
///
/// By default the servers talk over a [`LocalNetwork`]; a harness from
/// [`LocalTest::new_tcp`] uses loopback TCP and starts their websockets.
pub struct LocalTest {
    network: Option<LocalNetwork>,
    dir: tempfile::TempDir,
    protocols: Arc<ProtocolStorage>,
    services: Arc<ServiceRegistry>,
    proxies: Option<Arc<MessageProxyStore>>,
    servers: Vec<Arc<Server>>,
    closed: bool,
}

impl LocalTest {
    /// Servers on a fresh in-process network.
    pub fn new() -> Result<Self, OverlayError> {
        Self::with_network(Some(LocalNetwork::new()))
    }

    /// Servers on `127.0.0.1`, websocket included.
    pub fn new_tcp() -> Result<Self, OverlayError> {
        Self::with_network(None)
    }

    fn with_network(network: Option<LocalNetwork>) -> Result<Self, OverlayError> {
        Ok(Self {
            network,
            dir: tempfile::tempdir()?,
            protocols: Arc::new(ProtocolStorage::new()),
            services: Arc::new(ServiceRegistry::new()),
            proxies: None,
            servers: Vec::new(),
            closed: false,
        })
    }

    /// Protocols every generated server can run.
    pub fn protocols(mut self, protocols: Arc<ProtocolStorage>) -> Self {
        self.protocols = protocols;
        self
    }

    /// Services every generated server starts.
    pub fn services(mut self, services: Arc<ServiceRegistry>) -> Self {
        self.services = services;
        self
    }

    /// One proxy store shared by every generated server.
    pub fn proxies(mut self, proxies: Arc<MessageProxyStore>) -> Self {
        self.proxies = Some(proxies);
        self
    }

    pub fn protocol_storage(&self) -> &Arc<ProtocolStorage> {
        &self.protocols
    }

    pub fn service_registry(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn network(&self) -> Option<&LocalNetwork> {
        self.network.as_ref()
    }

    pub fn servers(&self) -> &[Arc<Server>] {
        &self.servers
    }

    fn check_open(&self) -> Result<(), OverlayError> {
        if self.closed {
            return Err(OverlayError::Closed);
        }
        Ok(())
    }

    /// Build and start `n` servers.
    pub async fn gen_servers(&mut self, n: usize) -> Result<Vec<Arc<Server>>, OverlayError> {
        self.check_open()?;
        let mut servers = Vec::with_capacity(n);
        for _ in 0..n {
            let server = Arc::new(self.new_server().await?);
            server.start().await?;
            self.servers.push(server.clone());
            servers.push(server);
        }
        Ok(servers)
    }

    async fn new_server(&self) -> Result<Server, OverlayError> {
        let (address, router) = match &self.network {
            Some(network) => (
                Address::local("127.0.0.1", 0),
                RouterConfig::new().local_network(network.clone()),
            ),
            None => (Address::tcp("127.0.0.1", free_port_pair()?), RouterConfig::new()),
        };
        let index = self.servers.len();
        let config = ServerConfig::new()
            .router(router)
            .db_dir(self.dir.path().join(format!("server-{index}")));
        let mut builder = Server::builder(KeyPair::generate(), address)
            .description(format!("local server {index}"))
            .config(config)
            .protocols(self.protocols.clone())
            .services(self.services.clone());
        if let Some(proxies) = &self.proxies {
            builder = builder.proxies(proxies.clone());
        }
        builder.build().await
    }

    /// `n` fresh servers, their roster and a binary tree over it. With
    /// `register` the first server learns the roster and the tree.
    pub async fn gen_tree(
        &mut self,
        n: usize,
        register: bool,
    ) -> Result<(Vec<Arc<Server>>, Arc<Roster>, Arc<Tree>), OverlayError> {
        let servers = self.gen_servers(n).await?;
        let roster = Arc::new(self.gen_roster_from_host(&servers));
        let tree = Arc::new(
            roster
                .generate_binary_tree()
                .ok_or_else(|| OverlayError::InvalidTree("no servers".into()))?,
        );
        if register {
            Self::register_on_first(&servers, &roster, &tree).await;
        }
        Ok((servers, roster, tree))
    }

    /// `nodes` tree nodes with branching factor `bf`, spread over `servers`
    /// fresh servers.
    pub async fn gen_big_tree(
        &mut self,
        nodes: usize,
        servers: usize,
        bf: usize,
        register: bool,
    ) -> Result<(Vec<Arc<Server>>, Arc<Roster>, Arc<Tree>), OverlayError> {
        let servers = self.gen_servers(servers).await?;
        let roster = Arc::new(self.gen_roster_from_host(&servers));
        let tree = Arc::new(
            roster
                .generate_big_nary_tree(bf, nodes)
                .ok_or_else(|| OverlayError::InvalidTree(format!("{nodes} nodes with bf {bf}")))?,
        );
        if register {
            Self::register_on_first(&servers, &roster, &tree).await;
        }
        Ok((servers, roster, tree))
    }

    async fn register_on_first(servers: &[Arc<Server>], roster: &Arc<Roster>, tree: &Arc<Tree>) {
        if let Some(first) = servers.first() {
            first.overlay().register_roster(roster.clone()).await;
            first.overlay().register_tree(tree.clone()).await;
        }
    }

    pub fn gen_roster_from_host(&self, servers: &[Arc<Server>]) -> Roster {
        Roster::new(servers.iter().map(|s| s.server_identity().clone()).collect())
    }

    fn root_server(&self, tree: &Tree) -> Result<&Arc<Server>, OverlayError> {
        let root = &tree.root().server_identity;
        self.servers
            .iter()
            .find(|s| s.server_identity().id == root.id)
            .ok_or(OverlayError::UnknownIdentity(root.id))
    }

    /// Create `name` on the server at the root of `tree`.
    pub async fn create_protocol(
        &self,
        name: &str,
        tree: &Arc<Tree>,
    ) -> Result<Arc<dyn ProtocolInstance>, OverlayError> {
        self.check_open()?;
        self.root_server(tree)?.create_protocol(name, tree.clone()).await
    }

    /// Create and start `name` on the server at the root of `tree`.
    pub async fn start_protocol(
        &self,
        name: &str,
        tree: &Arc<Tree>,
    ) -> Result<Arc<dyn ProtocolInstance>, OverlayError> {
        self.check_open()?;
        self.root_server(tree)?.start_protocol(name, tree.clone()).await
    }

    /// The service `name` of each of `servers`, in order. Servers without it
    /// are skipped.
    pub fn services_of<S: Service>(servers: &[Arc<Server>], name: &str) -> Vec<Arc<S>> {
        servers.iter().filter_map(|s| s.service::<S>(name)).collect()
    }

    /// Service id of `name` if it is registered with this harness.
    pub fn service_id(&self, name: &str) -> Option<ServiceId> {
        self.services.service_id(name)
    }

    pub fn new_client(&self, service: &str) -> Client {
        Client::new(service)
    }

    /// Close every server. Returns the number of protocol instances that
    /// were still alive; a clean test ends with zero.
    pub async fn close_all(&mut self) -> Result<usize, OverlayError> {
        if self.closed {
            return Ok(0);
        }
        self.closed = true;
        let mut lingering = 0;
        for server in self.servers.drain(..) {
            let live = server.close().await?;
            if live > 0 {
                tracing::warn!("{live} protocol instances lingering on {}", server.address());
            }
            lingering += live;
        }
        Ok(lingering)
    }
}

/// A port whose successor is free too, for a server and its websocket.
fn free_port_pair() -> Result<u16, OverlayError> {
    for _ in 0..PORT_ATTEMPTS {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
        let port = listener.local_addr()?.port();
        let Some(next) = port.checked_add(1) else {
            continue;
        };
        if std::net::TcpListener::bind(("127.0.0.1", next)).is_ok() {
            return Ok(port);
        }
    }
    Err(OverlayError::Config("no two adjacent free tcp ports".into()))
}
