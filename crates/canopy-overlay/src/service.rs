//! Long-lived services hosted next to the overlay.
//!
//! A service is built once per server from a [`Context`]. It answers client
//! requests arriving on the websocket surface and may take over creation of
//! the protocol instances started for it.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use canopy_network::{
    decode, encode, Message, MessageTypeId, Processor, Router, ServerIdentity,
};
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::messages::GenericConfig;
use crate::overlay::Overlay;
use crate::protocol::{ProtocolInstance, ProtocolStorage};
use crate::roster::Roster;
use crate::status::{StatusRegistry, StatusReporter};
use crate::store::KvStore;
use crate::token::ServiceId;
use crate::tree::Tree;
use crate::treenode::TreeNodeInstance;
use crate::{ClientError, OverlayError};

/// Path answered by every websocket server; no service may take it.
pub const RESERVED_OK: &str = "ok";

#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Answer a client request sent to `/<service>/<path>`.
    async fn process_client_request(&self, path: &str, buf: &[u8]) -> Result<Vec<u8>, ClientError>;

    /// Build the instance for an inbound message of a protocol started by
    /// this service. `Ok(None)` falls back to the registered constructor.
    async fn new_protocol(
        &self,
        _tni: Arc<TreeNodeInstance>,
        _config: Option<GenericConfig>,
    ) -> Result<Option<Arc<dyn ProtocolInstance>>, OverlayError> {
        Ok(None)
    }
}

// ── Registry ─────────────────────────────────────────────────────────────

struct Built {
    service: Arc<dyn Service>,
    any: Arc<dyn Any + Send + Sync>,
}

type ServiceFactory = Arc<dyn Fn(Context) -> Result<Built, OverlayError> + Send + Sync>;

/// Service constructors by name, instantiated by every server built with
/// this registry.
#[derive(Default)]
pub struct ServiceRegistry {
    factories: RwLock<BTreeMap<String, ServiceFactory>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S, F>(&self, name: &str, factory: F) -> Result<ServiceId, OverlayError>
    where
        S: Service,
        F: Fn(Context) -> Result<S, OverlayError> + Send + Sync + 'static,
    {
        if name.is_empty() || name == RESERVED_OK || name.contains('/') {
            return Err(OverlayError::InvalidServiceName(name.to_string()));
        }
        let mut factories = self.factories.write().unwrap_or_else(|e| e.into_inner());
        if factories.contains_key(name) {
            return Err(OverlayError::DuplicateService(name.to_string()));
        }
        let factory: ServiceFactory = Arc::new(move |ctx| {
            let service = Arc::new(factory(ctx)?);
            Ok(Built {
                service: service.clone(),
                any: service,
            })
        });
        factories.insert(name.to_string(), factory);
        Ok(ServiceId::of(name))
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.factories
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some()
    }

    pub fn service_id(&self, name: &str) -> Option<ServiceId> {
        self.factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
            .then(|| ServiceId::of(name))
    }

    pub fn name(&self, id: &ServiceId) -> Option<String> {
        self.factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .find(|name| ServiceId::of(name) == *id)
            .cloned()
    }

    /// Names in alphabetical order.
    pub fn registered_names(&self) -> Vec<String> {
        self.factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    fn factories(&self) -> Vec<(String, ServiceFactory)> {
        self.factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, f)| (name.clone(), f.clone()))
            .collect()
    }
}

// ── Manager ──────────────────────────────────────────────────────────────

struct Entry {
    name: String,
    built: Built,
}

/// The services running on one server.
pub struct ServiceManager {
    protocols: Arc<ProtocolStorage>,
    store: Arc<KvStore>,
    services: RwLock<HashMap<ServiceId, Entry>>,
}

impl ServiceManager {
    /// Instantiate every service of `registry` and attach the manager to
    /// `overlay`.
    pub(crate) fn start(
        overlay: &Arc<Overlay>,
        registry: &ServiceRegistry,
        store: Arc<KvStore>,
        status: Arc<StatusRegistry>,
    ) -> Result<Arc<Self>, OverlayError> {
        let manager = Arc::new(Self {
            protocols: overlay.protocols().clone(),
            store: store.clone(),
            services: RwLock::new(HashMap::new()),
        });
        status.register("Db", store.clone());

        for (name, factory) in registry.factories() {
            let id = ServiceId::of(&name);
            store.create_bucket(&name)?;
            let ctx = Context {
                service_id: id,
                name: name.clone(),
                router: overlay.router().clone(),
                overlay: Arc::downgrade(overlay),
                manager: Arc::downgrade(&manager),
                store: store.clone(),
                status: status.clone(),
            };
            let built = factory(ctx)?;
            tracing::info!("{} started service {name}", overlay.router().address());
            manager
                .services
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(id, Entry { name, built });
        }

        overlay.set_service_manager(manager.clone());
        Ok(manager)
    }

    /// Build the protocol instance for `tni`: the owning service decides
    /// first, the protocol constructor otherwise.
    pub async fn new_protocol(
        &self,
        tni: Arc<TreeNodeInstance>,
        config: Option<GenericConfig>,
    ) -> Result<Arc<dyn ProtocolInstance>, OverlayError> {
        let service_id = tni.token().service_id();
        let service = if service_id.is_nil() {
            None
        } else {
            self.services
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(&service_id)
                .map(|e| e.built.service.clone())
        };
        if let Some(service) = service {
            if let Some(pi) = service.new_protocol(tni.clone(), config).await? {
                return Ok(pi);
            }
        }
        self.protocols.instantiate(&tni.token().protocol_id(), tni)
    }

    /// The running service `name`, as its concrete type.
    pub fn service<S: Service>(&self, name: &str) -> Option<Arc<S>> {
        let any = self
            .services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&ServiceId::of(name))
            .map(|e| e.built.any.clone())?;
        any.downcast::<S>().ok()
    }

    pub fn service_by_name(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.service_by_id(&ServiceId::of(name))
    }

    pub fn service_by_id(&self, id: &ServiceId) -> Option<Arc<dyn Service>> {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|e| e.built.service.clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|e| e.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }

    /// Route a websocket request to its service.
    pub async fn process_client_request(
        &self,
        service: &str,
        path: &str,
        buf: &[u8],
    ) -> Result<Vec<u8>, ClientError> {
        let svc = self.service_by_name(service).ok_or_else(|| {
            ClientError::new(ClientError::PATH_NOT_FOUND, format!("unknown service {service}"))
        })?;
        svc.process_client_request(path, buf).await
    }
}

// ── Context ──────────────────────────────────────────────────────────────

/// What a service can reach of the server hosting it.
#[derive(Clone)]
pub struct Context {
    service_id: ServiceId,
    name: String,
    router: Router,
    overlay: Weak<Overlay>,
    manager: Weak<ServiceManager>,
    store: Arc<KvStore>,
    status: Arc<StatusRegistry>,
}

impl Context {
    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }

    pub fn service_name(&self) -> &str {
        &self.name
    }

    pub fn server_identity(&self) -> &ServerIdentity {
        self.router.server_identity()
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn overlay(&self) -> Result<Arc<Overlay>, OverlayError> {
        self.overlay.upgrade().ok_or(OverlayError::Closed)
    }

    pub async fn register_tree(&self, tree: impl Into<Arc<Tree>>) -> Result<(), OverlayError> {
        self.overlay()?.register_tree(tree).await;
        Ok(())
    }

    pub async fn register_roster(&self, roster: impl Into<Arc<Roster>>) -> Result<(), OverlayError> {
        self.overlay()?.register_roster(roster).await;
        Ok(())
    }

    /// A protocol instance at the root of `tree`, owned by this service.
    pub async fn create_protocol(
        &self,
        name: &str,
        tree: Arc<Tree>,
    ) -> Result<Arc<dyn ProtocolInstance>, OverlayError> {
        self.overlay()?
            .create_protocol(name, tree, self.service_id)
            .await
    }

    pub async fn start_protocol(
        &self,
        name: &str,
        tree: Arc<Tree>,
    ) -> Result<Arc<dyn ProtocolInstance>, OverlayError> {
        self.overlay()?
            .start_protocol(name, tree, self.service_id)
            .await
    }

    /// Handle inter-service messages of type `msg_type`.
    pub fn register_processor(&self, msg_type: MessageTypeId, processor: Arc<dyn Processor>) {
        self.router.register_processor(msg_type, processor);
    }

    pub fn register<M: Message>(&self, processor: Arc<dyn Processor>) {
        self.router.register::<M>(processor);
    }

    pub async fn send<M: Message>(&self, to: &ServerIdentity, msg: &M) -> Result<usize, OverlayError> {
        Ok(self.router.send(to, msg).await?)
    }

    pub async fn send_raw(
        &self,
        to: &ServerIdentity,
        msg_type: MessageTypeId,
        payload: Vec<u8>,
    ) -> Result<usize, OverlayError> {
        Ok(self.router.send_raw(to, msg_type, payload).await?)
    }

    /// A sibling service on the same server.
    pub fn service<S: Service>(&self, name: &str) -> Option<Arc<S>> {
        self.manager.upgrade()?.service::<S>(name)
    }

    /// This service's own bucket.
    pub fn bucket(&self) -> Bucket {
        Bucket {
            store: self.store.clone(),
            name: self.name.clone(),
        }
    }

    /// The bucket `<service>_<suffix>`, created on first use.
    pub fn additional_bucket(&self, suffix: &str) -> Result<Bucket, OverlayError> {
        let name = format!("{}_{suffix}", self.name);
        self.store.create_bucket(&name)?;
        Ok(Bucket {
            store: self.store.clone(),
            name,
        })
    }

    /// Store `value` under `key` in this service's bucket.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<(), OverlayError> {
        self.bucket().put(key.as_bytes(), &encode(value)?)
    }

    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, OverlayError> {
        match self.bucket().get(key.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn status_registry(&self) -> &Arc<StatusRegistry> {
        &self.status
    }

    pub fn report_status(&self, name: &str, reporter: Arc<dyn StatusReporter>) {
        self.status.register(name, reporter);
    }
}

/// One named bucket of the server's store. Values are stored as given.
#[derive(Clone)]
pub struct Bucket {
    store: Arc<KvStore>,
    name: String,
}

impl Bucket {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), OverlayError> {
        self.store.put(&self.name, key, value)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, OverlayError> {
        self.store.get(&self.name, key)
    }

    pub fn delete(&self, key: &[u8]) -> Result<bool, OverlayError> {
        self.store.delete(&self.name, key)
    }

    pub fn keys(&self) -> Result<Vec<Vec<u8>>, OverlayError> {
        self.store.keys(&self.name)
    }
}

// ── Typed client handlers ────────────────────────────────────────────────

type ClientHandler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, ClientError>> + Send + Sync>;

/// Typed websocket handlers of one service, by path.
#[derive(Default)]
pub struct ServiceProcessor {
    handlers: RwLock<HashMap<String, ClientHandler>>,
}

impl ServiceProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `/<service>/<Req::NAME>` with `handler`. Bodies are
    /// MessagePack.
    pub fn register_handler<Req, Resp, F, Fut>(&self, handler: F)
    where
        Req: Message,
        Resp: Message,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, ClientError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let wrapped: ClientHandler = Arc::new(move |buf: Vec<u8>| -> BoxFuture<'static, Result<Vec<u8>, ClientError>> {
            let handler = handler.clone();
            Box::pin(async move {
                let req: Req = decode(&buf)
                    .map_err(|e| ClientError::new(ClientError::DECODE, e.to_string()))?;
                let resp = handler(req).await?;
                encode(&resp).map_err(|e| ClientError::new(ClientError::ENCODE, e.to_string()))
            })
        });
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(Req::NAME.to_string(), wrapped);
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    pub async fn process_client_request(&self, path: &str, buf: &[u8]) -> Result<Vec<u8>, ClientError> {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
            .ok_or_else(|| ClientError::new(ClientError::PATH_NOT_FOUND, format!("no handler for {path}")))?;
        handler(buf.to_vec()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct Hello {
        i: i64,
    }

    impl Message for Hello {
        const NAME: &'static str = "Hello";
    }

    struct Dummy;

    #[async_trait]
    impl Service for Dummy {
        async fn process_client_request(&self, _path: &str, _buf: &[u8]) -> Result<Vec<u8>, ClientError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn registry_rejects_duplicates_and_reserved_names() {
        let registry = ServiceRegistry::new();
        let id = registry.register("W", |_| Ok(Dummy)).unwrap();
        assert_eq!(id, ServiceId::of("W"));
        assert!(matches!(
            registry.register("W", |_| Ok(Dummy)),
            Err(OverlayError::DuplicateService(_))
        ));
        assert!(matches!(
            registry.register("ok", |_| Ok(Dummy)),
            Err(OverlayError::InvalidServiceName(_))
        ));
        assert!(matches!(
            registry.register("a/b", |_| Ok(Dummy)),
            Err(OverlayError::InvalidServiceName(_))
        ));
        assert_eq!(registry.service_id("W"), Some(id));
        assert_eq!(registry.name(&id).as_deref(), Some("W"));
        assert!(registry.unregister("W"));
        assert!(registry.registered_names().is_empty());
    }

    #[tokio::test]
    async fn processor_maps_failures_to_client_codes() {
        let processor = ServiceProcessor::new();
        processor.register_handler(|req: Hello| async move { Ok(Hello { i: req.i + 1 }) });
        assert_eq!(processor.paths(), vec!["Hello".to_string()]);

        let reply = processor
            .process_client_request("Hello", &encode(&Hello { i: 41 }).unwrap())
            .await
            .unwrap();
        assert_eq!(decode::<Hello>(&reply).unwrap().i, 42);

        let err = processor.process_client_request("Nope", &[]).await.unwrap_err();
        assert_eq!(err.code, ClientError::PATH_NOT_FOUND);

        let err = processor.process_client_request("Hello", &[0xc1]).await.unwrap_err();
        assert_eq!(err.code, ClientError::DECODE);
    }
}
