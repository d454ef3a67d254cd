//! The per-instance delivery machine between the overlay and a protocol.
//!
//! A [`TreeNodeInstance`] owns one FIFO queue. The overlay pushes inbound
//! messages onto it; one task per instance drains it, buffers sibling
//! messages for aggregated types and hands each batch to the handler or
//! channel registered for the body type.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use canopy_network::{decode, Message, MessageTypeId, PublicKey, SecretKey, ServerIdentity};
use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;

use crate::messages::{GenericConfig, ProtocolMsg};
use crate::overlay::Overlay;
use crate::protocol::ProtocolInstance;
use crate::proxy::MessageProxy;
use crate::roster::Roster;
use crate::token::{Token, TokenId};
use crate::tree::{Tree, TreeNode};
use crate::OverlayError;

/// A message body together with the tree node that sent it.
#[derive(Debug, Clone)]
pub struct TreeNodeMsg<M> {
    pub tree_node: TreeNode,
    pub msg: M,
}

type Deliver =
    Arc<dyn Fn(Vec<(TreeNode, Vec<u8>)>) -> BoxFuture<'static, Result<(), OverlayError>> + Send + Sync>;

#[derive(Clone)]
struct Route {
    /// Wait for one message per child before delivering.
    aggregate: bool,
    deliver: Deliver,
}

#[derive(Default)]
struct Queue {
    msgs: VecDeque<ProtocolMsg>,
    closing: bool,
}

type DoneCallback = Box<dyn Fn() -> bool + Send + Sync>;

pub struct TreeNodeInstance {
    token: Token,
    tree: Arc<Tree>,
    tree_node: TreeNode,
    server_identity: ServerIdentity,
    secret: SecretKey,
    protocol_name: String,
    overlay: Weak<Overlay>,
    proxy: Arc<dyn MessageProxy>,
    routes: RwLock<HashMap<MessageTypeId, Route>>,
    queue: Mutex<Queue>,
    wake: Notify,
    buffered: Mutex<HashMap<MessageTypeId, Vec<ProtocolMsg>>>,
    config: Mutex<Option<GenericConfig>>,
    on_done: Mutex<Option<DoneCallback>>,
    dispatching: AtomicBool,
}

impl std::fmt::Debug for TreeNodeInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TreeNodeInstance({})", self.info())
    }
}

impl TreeNodeInstance {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        overlay: Weak<Overlay>,
        server_identity: ServerIdentity,
        secret: SecretKey,
        protocol_name: String,
        tree: Arc<Tree>,
        tree_node: TreeNode,
        token: Token,
        proxy: Arc<dyn MessageProxy>,
    ) -> Arc<Self> {
        Arc::new(Self {
            token,
            tree,
            tree_node,
            server_identity,
            secret,
            protocol_name,
            overlay,
            proxy,
            routes: RwLock::new(HashMap::new()),
            queue: Mutex::new(Queue::default()),
            wake: Notify::new(),
            buffered: Mutex::new(HashMap::new()),
            config: Mutex::new(None),
            on_done: Mutex::new(None),
            dispatching: AtomicBool::new(false),
        })
    }

    fn overlay(&self) -> Result<Arc<Overlay>, OverlayError> {
        self.overlay.upgrade().ok_or(OverlayError::Closed)
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn token_id(&self) -> TokenId {
        self.token.id()
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub fn roster(&self) -> &Arc<Roster> {
        self.tree.roster()
    }

    pub fn tree_node(&self) -> &TreeNode {
        &self.tree_node
    }

    pub fn server_identity(&self) -> &ServerIdentity {
        &self.server_identity
    }

    pub fn public(&self) -> PublicKey {
        self.server_identity.public
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    pub fn parent(&self) -> Option<&TreeNode> {
        self.tree.parent_of(&self.tree_node)
    }

    pub fn children(&self) -> Vec<&TreeNode> {
        self.tree.children_of(&self.tree_node)
    }

    pub fn root(&self) -> &TreeNode {
        self.tree.root()
    }

    pub fn is_root(&self) -> bool {
        self.tree_node.is_root()
    }

    pub fn is_leaf(&self) -> bool {
        self.tree_node.is_leaf()
    }

    /// Every node of the tree, depth-first.
    pub fn list(&self) -> &[TreeNode] {
        self.tree.list()
    }

    /// Index of this node's identity in the roster.
    pub fn index(&self) -> usize {
        self.tree_node.roster_index
    }

    pub fn protocol_name(&self) -> &str {
        &self.protocol_name
    }

    pub fn name(&self) -> String {
        self.server_identity.address.to_string()
    }

    /// `<address> (<token id>)`, for logs.
    pub fn info(&self) -> String {
        format!("{} ({})", self.server_identity.address, self.token.id())
    }

    // ── Registration ─────────────────────────────────────────────────────

    fn add_route<F>(&self, msg_type: MessageTypeId, aggregate: bool, deliver: F)
    where
        F: Fn(Vec<(TreeNode, Vec<u8>)>) -> BoxFuture<'static, Result<(), OverlayError>> + Send + Sync + 'static,
    {
        let deliver: Deliver = Arc::new(deliver);
        self.routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(msg_type, Route { aggregate, deliver });
    }

    /// Call `handler` once per message of type `M`.
    pub fn register_handler<M, F, Fut>(&self, handler: F)
    where
        M: Message,
        F: Fn(TreeNodeMsg<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), OverlayError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.add_route(
            M::message_type(),
            false,
            move |batch| {
                let handler = handler.clone();
                Box::pin(async move {
                    for (tree_node, bytes) in batch {
                        let msg: M = decode(&bytes)?;
                        handler(TreeNodeMsg { tree_node, msg }).await?;
                    }
                    Ok(())
                })
            },
        );
    }

    /// Call `handler` once with one message of type `M` from every child.
    /// Messages from the parent are still delivered one by one.
    pub fn register_handler_aggregate<M, F, Fut>(&self, handler: F)
    where
        M: Message,
        F: Fn(Vec<TreeNodeMsg<M>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), OverlayError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.add_route(
            M::message_type(),
            true,
            move |batch| {
                let handler = handler.clone();
                Box::pin(async move { handler(decode_batch(batch)?).await })
            },
        );
    }

    /// Send every message of type `M` to `tx`.
    pub fn register_channel<M: Message>(&self, tx: mpsc::Sender<TreeNodeMsg<M>>) {
        self.add_route(
            M::message_type(),
            false,
            move |batch| {
                let tx = tx.clone();
                Box::pin(async move {
                    for record in decode_batch::<M>(batch)? {
                        tx.send(record)
                            .await
                            .map_err(|_| OverlayError::Handler(format!("channel for {} closed", M::NAME)))?;
                    }
                    Ok(())
                })
            },
        );
    }

    /// Send one batch per round of children's messages of type `M` to `tx`.
    pub fn register_channel_aggregate<M: Message>(&self, tx: mpsc::Sender<Vec<TreeNodeMsg<M>>>) {
        self.add_route(
            M::message_type(),
            true,
            move |batch| {
                let tx = tx.clone();
                Box::pin(async move {
                    tx.send(decode_batch::<M>(batch)?)
                        .await
                        .map_err(|_| OverlayError::Handler(format!("channel for {} closed", M::NAME)))
                })
            },
        );
    }

    /// Whether messages of type `M` are delivered in batches.
    pub fn is_aggregate<M: Message>(&self) -> bool {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&M::message_type())
            .is_some_and(|r| r.aggregate)
    }

    // ── Dispatch ─────────────────────────────────────────────────────────

    /// Queue an inbound message. Dropped once the instance is closing.
    pub fn process_protocol_msg(&self, msg: ProtocolMsg) {
        {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            if queue.closing {
                tracing::debug!("{} closing, dropping message", self.info());
                return;
            }
            queue.msgs.push_back(msg);
        }
        self.wake.notify_one();
    }

    /// Spawn the task draining the queue. Only the first call does anything.
    pub(crate) fn spawn_dispatch(self: &Arc<Self>) {
        if self.dispatching.swap(true, Ordering::SeqCst) {
            return;
        }
        let tni = self.clone();
        tokio::spawn(async move { tni.dispatch_loop().await });
    }

    async fn dispatch_loop(&self) {
        loop {
            let next = {
                let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
                if queue.closing {
                    break;
                }
                queue.msgs.pop_front()
            };
            match next {
                Some(msg) => {
                    let msg_type = msg.msg_type;
                    if let Err(e) = self.dispatch_msg(msg).await {
                        tracing::warn!("{}: dispatching {msg_type}: {e}", self.info());
                    }
                }
                None => self.wake.notified().await,
            }
        }
        tracing::debug!("{} dispatcher stopped", self.info());
    }

    async fn dispatch_msg(&self, msg: ProtocolMsg) -> Result<(), OverlayError> {
        let route = self
            .routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&msg.msg_type)
            .cloned()
            .ok_or(OverlayError::NoHandler(msg.msg_type))?;

        let Some(batch) = self.aggregate(route.aggregate, msg) else {
            return Ok(());
        };

        let records = batch
            .into_iter()
            .map(|m| {
                let from = m.from.tree_node_id();
                let node = self
                    .tree
                    .search(&from)
                    .cloned()
                    .ok_or(OverlayError::TreeNodeNotFound(from))?;
                Ok((node, m.msg_slice))
            })
            .collect::<Result<Vec<_>, OverlayError>>()?;

        (route.deliver)(records).await
    }

    /// The batch to deliver now, if any.
    fn aggregate(&self, aggregate: bool, msg: ProtocolMsg) -> Option<Vec<ProtocolMsg>> {
        let from_parent = self.tree_node.parent == Some(msg.from.tree_node_id());
        if from_parent || !aggregate {
            return Some(vec![msg]);
        }
        let mut buffered = self.buffered.lock().unwrap_or_else(|e| e.into_inner());
        let msg_type = msg.msg_type;
        let msgs = buffered.entry(msg_type).or_default();
        msgs.push(msg);
        tracing::trace!(
            "{} has {} of {} messages for {msg_type}",
            self.info(),
            msgs.len(),
            self.tree_node.children.len()
        );
        if msgs.len() == self.tree_node.children.len() {
            buffered.remove(&msg_type)
        } else {
            None
        }
    }

    // ── Sending ──────────────────────────────────────────────────────────

    /// Send `msg` to the instance of this run at `to`.
    ///
    /// A config set with [`set_config`](Self::set_config) goes out with the
    /// first send and is then cleared.
    pub async fn send_to<M: Message>(&self, to: &TreeNode, msg: &M) -> Result<(), OverlayError> {
        let overlay = self.overlay()?;
        let body = ProtocolMsg::new(self.token, self.token.change_tree_node_id(to.id), msg)?;
        let config = self.config.lock().unwrap_or_else(|e| e.into_inner()).take();
        overlay
            .send_to_tree_node(to, body, self.proxy.as_ref(), config)
            .await
    }

    /// No-op at the root.
    pub async fn send_to_parent<M: Message>(&self, msg: &M) -> Result<(), OverlayError> {
        match self.parent() {
            Some(parent) => {
                let parent = parent.clone();
                self.send_to(&parent, msg).await
            }
            None => Ok(()),
        }
    }

    /// Send to each child in turn, stopping at the first failure.
    pub async fn send_to_children<M: Message>(&self, msg: &M) -> Result<(), OverlayError> {
        let children: Vec<TreeNode> = self.children().into_iter().cloned().collect();
        for child in &children {
            self.send_to(child, msg).await?;
        }
        Ok(())
    }

    /// Send to every child concurrently. Every child is tried; failures are
    /// reported together.
    pub async fn send_to_children_in_parallel<M: Message + Clone>(
        self: &Arc<Self>,
        msg: &M,
    ) -> Result<(), OverlayError> {
        let mut tasks = JoinSet::new();
        for child in self.children().into_iter().cloned() {
            let tni = self.clone();
            let msg = msg.clone();
            tasks.spawn(async move {
                let name = child.name();
                tni.send_to(&child, &msg).await.map_err(|e| format!("{name}: {e}"))
            });
        }
        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(e.to_string()),
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(OverlayError::Send(errors.join("\n")))
        }
    }

    /// Send to every other node of the tree.
    pub async fn broadcast<M: Message>(&self, msg: &M) -> Result<(), OverlayError> {
        let others: Vec<TreeNode> = self
            .list()
            .iter()
            .filter(|n| n.id != self.tree_node.id)
            .cloned()
            .collect();
        self.multicast(msg, &others).await
    }

    pub async fn multicast<M: Message>(&self, msg: &M, nodes: &[TreeNode]) -> Result<(), OverlayError> {
        for node in nodes {
            self.send_to(node, msg).await?;
        }
        Ok(())
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Attach `config` to the next outgoing message.
    pub fn set_config(&self, config: GenericConfig) {
        *self.config.lock().unwrap_or_else(|e| e.into_inner()) = Some(config);
    }

    /// `done` only tears the instance down once `callback` returns true.
    pub fn on_done_callback(&self, callback: impl Fn() -> bool + Send + Sync + 'static) {
        *self.on_done.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(callback));
    }

    /// The protocol finished here: release the instance and refuse any
    /// further message for its token.
    pub async fn done(&self) {
        let approved = self
            .on_done
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(true, |callback| callback());
        if !approved {
            return;
        }
        tracing::debug!("{} has finished", self.info());
        if let Ok(overlay) = self.overlay() {
            overlay.node_done(&self.token).await;
        }
    }

    /// Stop the dispatcher. Queued messages are dropped.
    pub fn close(&self) {
        {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.closing = true;
            queue.msgs.clear();
        }
        // Handlers may hold the protocol, which holds us.
        self.routes.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.buffered.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.wake.notify_one();
    }

    pub fn is_closing(&self) -> bool {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).closing
    }

    /// A new protocol run of `name` on `tree`, for the same service.
    pub async fn create_protocol(
        &self,
        name: &str,
        tree: Arc<Tree>,
    ) -> Result<Arc<dyn ProtocolInstance>, OverlayError> {
        self.overlay()?
            .create_protocol(name, tree, self.token.service_id())
            .await
    }

    /// Like [`create_protocol`](Self::create_protocol), then start it.
    pub async fn start_protocol(
        &self,
        name: &str,
        tree: Arc<Tree>,
    ) -> Result<Arc<dyn ProtocolInstance>, OverlayError> {
        self.overlay()?
            .start_protocol(name, tree, self.token.service_id())
            .await
    }
}

fn decode_batch<M: Message>(batch: Vec<(TreeNode, Vec<u8>)>) -> Result<Vec<TreeNodeMsg<M>>, OverlayError> {
    batch
        .into_iter()
        .map(|(tree_node, bytes)| {
            Ok(TreeNodeMsg {
                tree_node,
                msg: decode(&bytes)?,
            })
        })
        .collect()
}
