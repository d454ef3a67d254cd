//! The hub between the router and the protocol instances of one server.
//!
//! Inbound envelopes are unwrapped by the proxy registered for their packet
//! type. Topology messages are answered inline; protocol messages go to the
//! [`TreeNodeInstance`] named by their destination token, which is created on
//! first contact. Messages for a tree not known yet wait until the tree (and
//! its roster) have been fetched from the sender.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use async_trait::async_trait;
use canopy_network::{decode, KeyPair, Message, Packet, Processor, Router, ServerIdentity, ServerIdentityId};

use crate::messages::{ConfigMsg, GenericConfig, OverlayMsg, ProtocolMsg};
use crate::protocol::{ProtocolInstance, ProtocolStorage};
use crate::proxy::{MessageProxy, MessageProxyStore};
use crate::roster::{Roster, RosterId};
use crate::service::ServiceManager;
use crate::token::{ProtocolId, RoundId, ServiceId, Token, TokenId};
use crate::tree::{Tree, TreeId, TreeMarshal, TreeNode, TreeNodeId};
use crate::treenode::TreeNodeInstance;
use crate::OverlayError;

/// Tree nodes already looked up, by tree and node id.
#[derive(Default)]
pub struct TreeNodeCache {
    nodes: Mutex<HashMap<TreeId, HashMap<TreeNodeId, TreeNode>>>,
}

impl TreeNodeCache {
    pub fn cache(&self, tree: &Tree, node: &TreeNode) {
        self.nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(tree.id())
            .or_default()
            .insert(node.id, node.clone());
    }

    pub fn get(&self, tree_id: &TreeId, node_id: &TreeNodeId) -> Option<TreeNode> {
        self.nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(tree_id)
            .and_then(|nodes| nodes.get(node_id))
            .cloned()
    }

    pub fn get_from_token(&self, token: &Token) -> Option<TreeNode> {
        self.get(&token.tree_id(), &token.tree_node_id())
    }
}

#[derive(Default)]
struct Instances {
    tnis: HashMap<TokenId, Arc<TreeNodeInstance>>,
    protocols: HashMap<TokenId, Arc<dyn ProtocolInstance>>,
    /// Tokens whose instance called `done`; late messages are dropped.
    finished: HashSet<TokenId>,
}

/// Outcome of looking up the tree of an inbound message.
enum TreeLookup {
    Known(Arc<Tree>, ProtocolMsg),
    /// Saved for later. `request` is set when the sender was not asked for
    /// this tree yet.
    Pending { request: Option<(ServerIdentity, TreeId)> },
}

pub struct Overlay {
    router: Router,
    keypair: KeyPair,
    protocols: Arc<ProtocolStorage>,
    proxies: Arc<MessageProxyStore>,
    service_manager: OnceLock<Arc<ServiceManager>>,
    self_weak: Weak<Overlay>,

    trees: RwLock<HashMap<TreeId, Arc<Tree>>>,
    rosters: RwLock<HashMap<RosterId, Arc<Roster>>>,
    cache: TreeNodeCache,
    instances: Mutex<Instances>,

    pending_configs: Mutex<HashMap<TokenId, GenericConfig>>,
    pending_msgs: Mutex<Vec<(ProtocolMsg, Arc<dyn MessageProxy>)>>,
    pending_tree_marshal: Mutex<HashMap<RosterId, Vec<TreeMarshal>>>,
    /// Trees asked for and not received yet, with the server asked.
    tree_requests: Mutex<HashSet<(TreeId, ServerIdentityId)>>,

    closed: AtomicBool,
}

struct OverlayProcessor {
    overlay: Weak<Overlay>,
}

#[async_trait]
impl Processor for OverlayProcessor {
    async fn process(&self, packet: Packet) {
        if let Some(overlay) = self.overlay.upgrade() {
            overlay.process(packet).await;
        }
    }
}

impl Overlay {
    /// Build the overlay and register its processors on `router`: one per
    /// proxy packet type, plus the config handoff.
    pub fn new(
        router: Router,
        keypair: KeyPair,
        protocols: Arc<ProtocolStorage>,
        proxies: Arc<MessageProxyStore>,
    ) -> Arc<Self> {
        let overlay = Arc::new_cyclic(|weak: &Weak<Overlay>| Self {
            router,
            keypair,
            protocols,
            proxies,
            service_manager: OnceLock::new(),
            self_weak: weak.clone(),
            trees: RwLock::new(HashMap::new()),
            rosters: RwLock::new(HashMap::new()),
            cache: TreeNodeCache::default(),
            instances: Mutex::new(Instances::default()),
            pending_configs: Mutex::new(HashMap::new()),
            pending_msgs: Mutex::new(Vec::new()),
            pending_tree_marshal: Mutex::new(HashMap::new()),
            tree_requests: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        });
        for packet_type in overlay.proxies.packet_types() {
            overlay.router.register_processor(packet_type, overlay.processor());
        }
        overlay.router.register::<ConfigMsg>(overlay.processor());
        overlay
    }

    fn processor(&self) -> Arc<dyn Processor> {
        Arc::new(OverlayProcessor {
            overlay: self.self_weak.clone(),
        })
    }

    /// Add a proxy after construction and listen for its packet type.
    pub fn register_proxy(&self, proxy: Arc<dyn MessageProxy>) -> Result<(), OverlayError> {
        let packet_type = proxy.packet_type();
        self.proxies.register(proxy)?;
        self.router.register_processor(packet_type, self.processor());
        Ok(())
    }

    pub(crate) fn set_service_manager(&self, manager: Arc<ServiceManager>) {
        if self.service_manager.set(manager).is_err() {
            tracing::warn!("{} service manager already set", self.router.address());
        }
    }

    pub fn service_manager(&self) -> Option<&Arc<ServiceManager>> {
        self.service_manager.get()
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn server_identity(&self) -> &ServerIdentity {
        self.router.server_identity()
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    pub fn protocols(&self) -> &Arc<ProtocolStorage> {
        &self.protocols
    }

    pub fn proxies(&self) -> &Arc<MessageProxyStore> {
        &self.proxies
    }

    // ── Inbound ──────────────────────────────────────────────────────────

    /// Handle one inbound packet. Failures are logged, never returned.
    pub async fn process(&self, packet: Packet) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if packet.msg_type == ConfigMsg::message_type() {
            self.handle_config(&packet);
            return;
        }
        let Some(proxy) = self.proxies.by_packet_type(&packet.msg_type) else {
            tracing::warn!("{} no proxy for packet type {}", self.router.address(), packet.msg_type);
            return;
        };
        let msg = match proxy.unwrap(&packet.payload) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(
                    "{} dropping malformed envelope from {}: {e}",
                    self.router.address(),
                    packet.server_identity
                );
                return;
            }
        };

        let from = packet.server_identity;
        let kind = msg.kind();
        let result = match msg {
            OverlayMsg::TreeNode(mut m) => {
                m.server_identity = Some(from.clone());
                self.transmit_msg(m, proxy).await
            }
            OverlayMsg::RequestTree(id) => self.handle_request_tree(&from, id, proxy.as_ref()).await,
            OverlayMsg::TreeMarshal(tm) => self.handle_send_tree(&from, tm, proxy.as_ref()).await,
            OverlayMsg::RequestRoster(id) => self.handle_request_roster(&from, id, proxy.as_ref()).await,
            OverlayMsg::Roster(roster) => self.handle_send_roster(roster).await,
        };
        if let Err(e) = result {
            tracing::warn!("{} failed to handle {kind} from {from}: {e}", self.router.address());
        }
    }

    fn handle_config(&self, packet: &Packet) {
        match decode::<ConfigMsg>(&packet.payload) {
            Ok(msg) => {
                tracing::debug!("{} config for {}", self.router.address(), msg.dest);
                self.pending_configs
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(msg.dest, msg.config);
            }
            Err(e) => tracing::warn!(
                "{} dropping malformed config from {}: {e}",
                self.router.address(),
                packet.server_identity
            ),
        }
    }

    fn take_config(&self, id: &TokenId) -> Option<GenericConfig> {
        self.pending_configs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    async fn send_overlay_msg(
        &self,
        to: &ServerIdentity,
        msg: &OverlayMsg,
        proxy: &dyn MessageProxy,
    ) -> Result<(), OverlayError> {
        let payload = proxy.wrap(msg)?;
        self.router.send_raw(to, proxy.packet_type(), payload).await?;
        Ok(())
    }

    async fn handle_request_tree(
        &self,
        from: &ServerIdentity,
        id: TreeId,
        proxy: &dyn MessageProxy,
    ) -> Result<(), OverlayError> {
        let tm = match self.tree(&id) {
            Some(tree) => tree.marshal(),
            None => {
                tracing::debug!("{} asked for unknown tree {id}", self.router.address());
                TreeMarshal::empty()
            }
        };
        self.send_overlay_msg(from, &OverlayMsg::TreeMarshal(tm), proxy).await
    }

    async fn handle_send_tree(
        &self,
        from: &ServerIdentity,
        tm: TreeMarshal,
        proxy: &dyn MessageProxy,
    ) -> Result<(), OverlayError> {
        if tm.is_empty() {
            // The peer does not know what we asked for; a later message
            // from it may ask again.
            tracing::debug!("{} received an empty tree from {from}", self.router.address());
            self.tree_requests
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|(_, asked)| *asked != from.id);
            return Ok(());
        }
        let roster_id = tm.roster_id;
        let known = {
            let rosters = self.rosters.read().unwrap_or_else(|e| e.into_inner());
            match rosters.get(&roster_id) {
                Some(roster) => Some(roster.clone()),
                None => {
                    self.pending_tree_marshal
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .entry(roster_id)
                        .or_default()
                        .push(tm.clone());
                    None
                }
            }
        };
        match known {
            Some(roster) => {
                let tree = tm.make_tree(roster)?;
                self.register_tree(tree).await;
                Ok(())
            }
            None => {
                self.send_overlay_msg(from, &OverlayMsg::RequestRoster(roster_id), proxy)
                    .await
            }
        }
    }

    async fn handle_request_roster(
        &self,
        from: &ServerIdentity,
        id: RosterId,
        proxy: &dyn MessageProxy,
    ) -> Result<(), OverlayError> {
        let roster = match self.roster(&id) {
            Some(roster) => roster.as_ref().clone(),
            None => {
                tracing::debug!("{} asked for unknown roster {id}", self.router.address());
                Roster::empty()
            }
        };
        self.send_overlay_msg(from, &OverlayMsg::Roster(roster), proxy).await
    }

    async fn handle_send_roster(&self, roster: Roster) -> Result<(), OverlayError> {
        if roster.id.is_nil() {
            tracing::debug!("{} received an empty roster", self.router.address());
            return Ok(());
        }
        self.register_roster(roster).await;
        Ok(())
    }

    // ── Topology ─────────────────────────────────────────────────────────

    /// Make `tree` (and its roster) known, then deliver messages that were
    /// waiting for it.
    pub async fn register_tree(&self, tree: impl Into<Arc<Tree>>) {
        let tree: Arc<Tree> = tree.into();
        self.rosters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(tree.roster().id)
            .or_insert_with(|| tree.roster().clone());
        self.trees
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tree.id(), tree.clone());
        self.tree_requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(id, _)| *id != tree.id());
        self.check_pending_messages(&tree).await;
    }

    /// Make `roster` known, then rebuild trees that were waiting for it.
    pub async fn register_roster(&self, roster: impl Into<Arc<Roster>>) {
        let roster: Arc<Roster> = roster.into();
        self.rosters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(roster.id, roster.clone());
        self.check_pending_tree_marshal(&roster).await;
    }

    async fn check_pending_messages(&self, tree: &Arc<Tree>) {
        let ready: Vec<(ProtocolMsg, Arc<dyn MessageProxy>)> = {
            let mut pending = self.pending_msgs.lock().unwrap_or_else(|e| e.into_inner());
            let (ready, waiting): (Vec<_>, Vec<_>) = pending
                .drain(..)
                .partition(|(m, _)| m.to.tree_id() == tree.id());
            *pending = waiting;
            ready
        };
        for (msg, proxy) in ready {
            if let Err(e) = self.deliver(tree.clone(), msg, proxy).await {
                tracing::warn!("{} pending message for {}: {e}", self.router.address(), tree.id());
            }
        }
    }

    async fn check_pending_tree_marshal(&self, roster: &Arc<Roster>) {
        let waiting = self
            .pending_tree_marshal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&roster.id)
            .unwrap_or_default();
        for tm in waiting {
            match tm.make_tree(roster.clone()) {
                Ok(tree) => self.register_tree(tree).await,
                Err(e) => tracing::warn!("{} pending tree {}: {e}", self.router.address(), tm.tree_id),
            }
        }
    }

    pub fn tree(&self, id: &TreeId) -> Option<Arc<Tree>> {
        self.trees
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn roster(&self, id: &RosterId) -> Option<Arc<Roster>> {
        self.rosters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn tree_from_token(&self, token: &Token) -> Option<Arc<Tree>> {
        self.tree(&token.tree_id())
    }

    pub fn roster_from_token(&self, token: &Token) -> Option<Arc<Roster>> {
        self.roster(&token.roster_id())
    }

    /// The tree node `token` is addressed to.
    pub fn tree_node_from_token(&self, token: &Token) -> Result<TreeNode, OverlayError> {
        if let Some(node) = self.cache.get_from_token(token) {
            return Ok(node);
        }
        let tree = self
            .tree_from_token(token)
            .ok_or(OverlayError::UnknownTree(token.tree_id()))?;
        let node = tree
            .search(&token.tree_node_id())
            .ok_or(OverlayError::TreeNodeNotFound(token.tree_node_id()))?;
        self.cache.cache(&tree, node);
        Ok(node.clone())
    }

    // ── Instances ────────────────────────────────────────────────────────

    /// Route a protocol message to its instance, creating the instance on
    /// first contact. A message for an unknown tree is kept and the tree
    /// requested from every sender not already asked for it.
    pub async fn transmit_msg(&self, msg: ProtocolMsg, proxy: Arc<dyn MessageProxy>) -> Result<(), OverlayError> {
        match self.lookup_tree(msg, proxy.clone()) {
            TreeLookup::Known(tree, msg) => self.deliver(tree, msg, proxy).await,
            TreeLookup::Pending { request: Some((from, tree_id)) } => {
                tracing::debug!("{} requesting tree {tree_id} from {from}", self.router.address());
                let sent = self
                    .send_overlay_msg(&from, &OverlayMsg::RequestTree(tree_id), proxy.as_ref())
                    .await;
                if sent.is_err() {
                    self.tree_requests
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&(tree_id, from.id));
                }
                sent
            }
            TreeLookup::Pending { request: None } => Ok(()),
        }
    }

    fn lookup_tree(&self, msg: ProtocolMsg, proxy: Arc<dyn MessageProxy>) -> TreeLookup {
        let tree_id = msg.to.tree_id();
        // Pending messages are saved under the trees lock so a concurrent
        // register_tree always sees them.
        let trees = self.trees.read().unwrap_or_else(|e| e.into_inner());
        if let Some(tree) = trees.get(&tree_id) {
            return TreeLookup::Known(tree.clone(), msg);
        }
        let request = msg.server_identity.as_ref().and_then(|from| {
            self.tree_requests
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert((tree_id, from.id))
                .then(|| (from.clone(), tree_id))
        });
        self.pending_msgs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((msg, proxy));
        TreeLookup::Pending { request }
    }

    async fn deliver(
        &self,
        tree: Arc<Tree>,
        msg: ProtocolMsg,
        proxy: Arc<dyn MessageProxy>,
    ) -> Result<(), OverlayError> {
        let to = msg.to;
        let tree_node = self.tree_node_from_token(&to)?;
        // The instance is claimed under the lock and built outside it: the
        // creation hook may call back into the overlay.
        let (tni, fresh) = {
            let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
            if instances.finished.contains(&to.id()) {
                tracing::debug!("{} message for finished instance {}, dropping", self.router.address(), to.id());
                return Ok(());
            }
            match instances.tnis.get(&to.id()) {
                Some(tni) => (tni.clone(), false),
                None => {
                    let tni = self.new_tree_node_instance(tree, tree_node, to, proxy);
                    instances.tnis.insert(to.id(), tni.clone());
                    (tni, true)
                }
            }
        };
        // Queued until dispatch starts, so arrival order holds.
        tni.process_protocol_msg(msg);
        if fresh {
            self.init_instance(&tni).await?;
        }
        Ok(())
    }

    /// Bind a protocol to a freshly claimed inbound instance and start
    /// dispatching its queue.
    async fn init_instance(&self, tni: &Arc<TreeNodeInstance>) -> Result<(), OverlayError> {
        let token = *tni.token();
        let config = self.take_config(&token.id());
        let created = match self.service_manager() {
            Some(manager) => manager.new_protocol(tni.clone(), config).await,
            None => self.protocols.instantiate(&token.protocol_id(), tni.clone()),
        };
        if let Err(e) = created.and_then(|pi| self.register_protocol_instance(pi)) {
            self.remove_instance(&token.id());
            tni.close();
            return Err(e);
        }
        tni.spawn_dispatch();
        tracing::debug!("{} created instance {} of {}", self.router.address(), tni.info(), tni.protocol_name());
        Ok(())
    }

    fn new_tree_node_instance(
        &self,
        tree: Arc<Tree>,
        tree_node: TreeNode,
        token: Token,
        proxy: Arc<dyn MessageProxy>,
    ) -> Arc<TreeNodeInstance> {
        let protocol_name = self
            .protocols
            .name_of(&token.protocol_id())
            .unwrap_or_default();
        TreeNodeInstance::new(
            self.self_weak.clone(),
            self.server_identity().clone(),
            self.keypair.secret,
            protocol_name,
            tree,
            tree_node,
            token,
            proxy,
        )
    }

    fn remove_instance(&self, id: &TokenId) {
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        instances.tnis.remove(id);
        instances.protocols.remove(id);
    }

    /// Bind `pi` to its tree node instance. Each instance takes exactly one
    /// protocol.
    pub fn register_protocol_instance(&self, pi: Arc<dyn ProtocolInstance>) -> Result<(), OverlayError> {
        let id = pi.token().id();
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        if !instances.tnis.contains_key(&id) {
            return Err(OverlayError::NoInstance(id));
        }
        if instances.protocols.contains_key(&id) {
            return Err(OverlayError::AlreadyRegistered(id));
        }
        instances.protocols.insert(id, pi);
        Ok(())
    }

    /// Send `msg` to the tree node named by its destination token. A config
    /// goes first, on the same connection.
    pub async fn send_to_tree_node(
        &self,
        to: &TreeNode,
        msg: ProtocolMsg,
        proxy: &dyn MessageProxy,
        config: Option<GenericConfig>,
    ) -> Result<(), OverlayError> {
        if let Some(config) = config {
            let dest = msg.to.id();
            self.router
                .send(&to.server_identity, &ConfigMsg { config, dest })
                .await?;
        }
        self.send_overlay_msg(&to.server_identity, &OverlayMsg::TreeNode(msg), proxy)
            .await
    }

    /// Instantiate protocol `name` at the root of `tree` for a fresh round.
    ///
    /// The tree is registered here if it was not known yet.
    pub async fn create_protocol(
        &self,
        name: &str,
        tree: Arc<Tree>,
        service_id: ServiceId,
    ) -> Result<Arc<dyn ProtocolInstance>, OverlayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OverlayError::Closed);
        }
        let protocol_id = ProtocolId::of(name);
        if !self.protocols.exists(name) {
            return Err(OverlayError::UnknownProtocol(name.to_string()));
        }
        if self.tree(&tree.id()).is_none() {
            self.register_tree(tree.clone()).await;
        }
        let token = Token::new(
            tree.roster().id,
            tree.id(),
            protocol_id,
            service_id,
            RoundId::random(),
            tree.root().id,
        );
        let root = tree.root().clone();
        let proxy = self.proxies.by_name(name);
        let tni = self.new_tree_node_instance(tree, root, token, proxy);
        self.instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tnis
            .insert(token.id(), tni.clone());
        let pi = match self
            .protocols
            .instantiate(&protocol_id, tni.clone())
            .and_then(|pi| {
                self.register_protocol_instance(pi.clone())?;
                Ok(pi)
            }) {
            Ok(pi) => pi,
            Err(e) => {
                self.remove_instance(&token.id());
                tni.close();
                return Err(e);
            }
        };
        tni.spawn_dispatch();
        Ok(pi)
    }

    /// [`create_protocol`](Self::create_protocol), then run its `start` in
    /// its own task.
    pub async fn start_protocol(
        &self,
        name: &str,
        tree: Arc<Tree>,
        service_id: ServiceId,
    ) -> Result<Arc<dyn ProtocolInstance>, OverlayError> {
        let pi = self.create_protocol(name, tree, service_id).await?;
        let started = pi.clone();
        tokio::spawn(async move {
            if let Err(e) = started.start().await {
                tracing::warn!("{} failed to start: {e}", started.tree_node_instance().info());
            }
        });
        Ok(pi)
    }

    /// Tear down the instance of `token` and refuse its later messages.
    /// Calling it again is a no-op.
    pub async fn node_done(&self, token: &Token) {
        let id = token.id();
        let (tni, pi) = {
            let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
            instances.finished.insert(id);
            (instances.tnis.remove(&id), instances.protocols.remove(&id))
        };
        if let Some(tni) = tni {
            tni.close();
        }
        if let Some(pi) = pi {
            if let Err(e) = pi.shutdown().await {
                tracing::warn!("{} shutdown of {id} failed: {e}", self.router.address());
            }
        }
    }

    pub fn instance(&self, id: &TokenId) -> Option<Arc<TreeNodeInstance>> {
        self.instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tnis
            .get(id)
            .cloned()
    }

    /// Number of live tree node instances.
    pub fn instance_count(&self) -> usize {
        self.instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tnis
            .len()
    }

    pub fn is_finished(&self, id: &TokenId) -> bool {
        self.instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .finished
            .contains(id)
    }

    /// Shut every live instance down. Returns how many there were.
    pub async fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let (tnis, protocols) = {
            let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
            let ids: Vec<TokenId> = instances.tnis.keys().copied().collect();
            instances.finished.extend(ids);
            (
                std::mem::take(&mut instances.tnis),
                std::mem::take(&mut instances.protocols),
            )
        };
        let live = tnis.len();
        for tni in tnis.values() {
            tracing::debug!("{} closing {}", self.router.address(), tni.info());
            tni.close();
        }
        for (id, pi) in protocols {
            if let Err(e) = pi.shutdown().await {
                tracing::warn!("{} shutdown of {id} failed: {e}", self.router.address());
            }
        }
        self.pending_msgs.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.tree_requests.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.pending_configs.lock().unwrap_or_else(|e| e.into_inner()).clear();
        live
    }
}
