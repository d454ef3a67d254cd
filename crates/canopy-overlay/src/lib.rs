//! canopy overlay runtime.
//!
//! Servers on a [`Roster`] run protocols along a [`Tree`]. Each server has
//! one [`Overlay`] that routes protocol messages to the
//! [`TreeNodeInstance`] named by their [`Token`], creating it on first
//! contact and fetching unknown trees and rosters from the sender. Services
//! live next to the overlay, keep state in a per-server key/value store and
//! answer clients over a websocket.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use canopy_overlay::{LocalTest, ProtocolInstance, ProtocolStorage, TreeNodeInstance};
//!
//! struct Hello(Arc<TreeNodeInstance>);
//!
//! impl ProtocolInstance for Hello {
//!     fn tree_node_instance(&self) -> &Arc<TreeNodeInstance> {
//!         &self.0
//!     }
//! }
//!
//! # async fn example() -> Result<(), canopy_overlay::OverlayError> {
//! let protocols = Arc::new(ProtocolStorage::new());
//! protocols.register("Hello", |tni| Ok(Hello(tni)))?;
//!
//! let mut local = LocalTest::new()?.protocols(protocols);
//! let (_servers, _roster, tree) = local.gen_tree(3, true).await?;
//! local.start_protocol("Hello", &tree).await?;
//! local.close_all().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod generate;
mod local;
mod messages;
mod overlay;
mod protocol;
mod proxy;
mod roster;
mod server;
mod service;
mod status;
mod store;
mod token;
mod tree;
mod treenode;
mod websocket;

pub use config::{load_group, save_group, ServerConfig, ServerToml, DATA_DIR_ENV};
pub use error::{ClientError, OverlayError};
pub use local::LocalTest;
pub use messages::{ConfigMsg, GenericConfig, OverlayMsg, ProtocolMsg};
pub use overlay::{Overlay, TreeNodeCache};
pub use protocol::{ProtocolInstance, ProtocolStorage};
pub use proxy::{DefaultProxy, MessageProxy, MessageProxyStore, DEFAULT_PROXY};
pub use roster::{Roster, RosterId, RosterToml};
pub use server::{Server, ServerBuilder};
pub use service::{Bucket, Context, Service, ServiceManager, ServiceProcessor, ServiceRegistry, RESERVED_OK};
pub use status::{
    Status, StatusRegistry, StatusReporter, StatusRequest, StatusResponse, StatusService, STATUS_SERVICE,
};
pub use store::KvStore;
pub use token::{ProtocolId, RoundId, ServiceId, Token, TokenId};
pub use tree::{Tree, TreeBuilder, TreeId, TreeMarshal, TreeNode, TreeNodeId};
pub use treenode::{TreeNodeInstance, TreeNodeMsg};
pub use websocket::{Client, WebSocket, DEFAULT_GRACE, MAX_RETRY_CONNECT, WAIT_RETRY};
