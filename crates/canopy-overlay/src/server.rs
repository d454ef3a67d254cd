//! A complete node: router, overlay, services, store and websocket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use canopy_network::{Address, ConnType, KeyPair, Router, ServerIdentity};

use crate::config::{ServerConfig, ServerToml};
use crate::overlay::Overlay;
use crate::protocol::{ProtocolInstance, ProtocolStorage};
use crate::proxy::MessageProxyStore;
use crate::service::{Service, ServiceManager, ServiceRegistry};
use crate::status::{ServerStatus, StatusRegistry, STATUS_SERVICE};
use crate::store::KvStore;
use crate::token::ServiceId;
use crate::tree::Tree;
use crate::websocket::WebSocket;
use crate::OverlayError;

/// Builder for a [`Server`].
pub struct ServerBuilder {
    keypair: KeyPair,
    address: Address,
    description: String,
    config: ServerConfig,
    protocols: Option<Arc<ProtocolStorage>>,
    services: Option<Arc<ServiceRegistry>>,
    proxies: Option<Arc<MessageProxyStore>>,
}

impl ServerBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Protocols this server can run (default: none).
    pub fn protocols(mut self, protocols: Arc<ProtocolStorage>) -> Self {
        self.protocols = Some(protocols);
        self
    }

    /// Services started with the server (default: none).
    pub fn services(mut self, services: Arc<ServiceRegistry>) -> Self {
        self.services = Some(services);
        self
    }

    /// Message proxies (default: the default proxy only).
    pub fn proxies(mut self, proxies: Arc<MessageProxyStore>) -> Self {
        self.proxies = Some(proxies);
        self
    }

    /// Bind the transport and instantiate every service. Nothing is
    /// delivered until [`Server::start`].
    pub async fn build(self) -> Result<Server, OverlayError> {
        let si = ServerIdentity::new(self.keypair.public, self.address).with_description(self.description);
        let router = Router::bind(si, self.config.router.clone()).await?;
        let protocols = self.protocols.unwrap_or_default();
        let proxies = self.proxies.unwrap_or_default();
        let services = self.services.unwrap_or_default();

        let overlay = Overlay::new(router.clone(), self.keypair, protocols, proxies);

        let store = if self.config.in_memory_db {
            KvStore::in_memory()?
        } else {
            KvStore::open(&self.config.resolved_db_dir(), &self.keypair.public.to_hex())?
        };
        let store = Arc::new(store);

        let status = Arc::new(StatusRegistry::new());
        status.register(
            STATUS_SERVICE,
            Arc::new(ServerStatus::new(router.clone(), services.registered_names())),
        );
        let manager = ServiceManager::start(&overlay, &services, store.clone(), status.clone())?;

        let websocket = if self.config.websocket && router.address().conn_type() == ConnType::Tcp {
            Some(WebSocket::new(
                router.server_identity(),
                manager.clone(),
                self.config.websocket_grace,
            )?)
        } else {
            None
        };

        Ok(Server {
            router,
            overlay,
            manager,
            store,
            status,
            websocket,
            config: self.config,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }
}

/// One node of the overlay.
pub struct Server {
    router: Router,
    overlay: Arc<Overlay>,
    manager: Arc<ServiceManager>,
    store: Arc<KvStore>,
    status: Arc<StatusRegistry>,
    websocket: Option<WebSocket>,
    config: ServerConfig,
    started: AtomicBool,
    closed: AtomicBool,
}

impl Server {
    pub fn builder(keypair: KeyPair, address: Address) -> ServerBuilder {
        ServerBuilder {
            keypair,
            address,
            description: String::new(),
            config: ServerConfig::new(),
            protocols: None,
            services: None,
            proxies: None,
        }
    }

    /// Builder for the node described by a `private.toml`.
    pub fn builder_from_toml(toml: &ServerToml) -> Result<ServerBuilder, OverlayError> {
        Ok(Self::builder(toml.keypair()?, toml.address.clone()).description(toml.description.clone()))
    }

    /// Start the transport and the websocket. Calling it twice is a no-op.
    pub async fn start(&self) -> Result<(), OverlayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OverlayError::Closed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.router.start();
        if let Some(ws) = &self.websocket {
            ws.start().await?;
        }
        tracing::info!("server {} started", self.router.address());
        Ok(())
    }

    /// Stop the websocket, then every protocol instance, then the
    /// transport. Returns the number of instances that were still alive.
    /// Only the first call does anything.
    pub async fn close(&self) -> Result<usize, OverlayError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }
        if let Some(ws) = &self.websocket {
            ws.stop().await;
        }
        let live = self.overlay.close().await;
        self.router.close().await;
        if self.config.delete_db_on_close {
            if let Some(path) = self.store.path() {
                match std::fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        tracing::info!("server {} closed ({live} live instances)", self.router.address());
        Ok(live)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn server_identity(&self) -> &ServerIdentity {
        self.router.server_identity()
    }

    pub fn address(&self) -> &Address {
        self.router.address()
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn overlay(&self) -> &Arc<Overlay> {
        &self.overlay
    }

    pub fn service_manager(&self) -> &Arc<ServiceManager> {
        &self.manager
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }

    pub fn status(&self) -> &Arc<StatusRegistry> {
        &self.status
    }

    pub fn websocket(&self) -> Option<&WebSocket> {
        self.websocket.as_ref()
    }

    /// The running service `name`, as its concrete type.
    pub fn service<S: Service>(&self, name: &str) -> Option<Arc<S>> {
        self.manager.service::<S>(name)
    }

    /// A protocol instance at the root of `tree`, outside any service.
    pub async fn create_protocol(
        &self,
        name: &str,
        tree: Arc<Tree>,
    ) -> Result<Arc<dyn ProtocolInstance>, OverlayError> {
        self.overlay.create_protocol(name, tree, ServiceId::NIL).await
    }

    pub async fn start_protocol(
        &self,
        name: &str,
        tree: Arc<Tree>,
    ) -> Result<Arc<dyn ProtocolInstance>, OverlayError> {
        self.overlay.start_protocol(name, tree, ServiceId::NIL).await
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Server({})", self.router.address())
    }
}
