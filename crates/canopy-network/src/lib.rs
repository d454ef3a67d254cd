//! canopy network layer.
//!
//! Servers are identified by a Ristretto public key and reached at an
//! [`Address`]. A [`Router`] binds a host for its own address (TCP, or an
//! in-process [`LocalNetwork`]) and moves typed [`Message`]s between them,
//! handing every inbound [`Packet`] to the [`Processor`] registered for its
//! type.
//!
//! ```rust,no_run
//! use canopy_network::{processor_fn, Address, KeyPair, Router, RouterConfig, ServerIdentity};
//!
//! # async fn example() -> Result<(), canopy_network::NetworkError> {
//! let kp = KeyPair::generate();
//! let si = ServerIdentity::new(kp.public, Address::tcp("127.0.0.1", 0));
//! let router = Router::bind(si, RouterConfig::new()).await?;
//! router.register_processor(
//!     canopy_network::MessageTypeId::from_name("msgtype/Ping"),
//!     processor_fn(|packet| async move { println!("from {}", packet.server_identity) }),
//! );
//! router.start();
//! # Ok(())
//! # }
//! ```

mod address;
mod config;
mod connection;
mod dispatcher;
mod error;
mod identity;
mod key;
mod local;
mod message;
mod packet;
mod router;

pub use address::{Address, ConnType};
pub use config::RouterConfig;
pub use dispatcher::{processor_fn, Dispatcher, Processor};
pub use error::NetworkError;
pub use identity::{ServerIdentity, ServerIdentityId, ServerIdentityToml};
pub use key::{KeyPair, PublicKey, SecretKey};
pub use local::LocalNetwork;
pub use message::{decode, encode, uuid_from_name, Message, MessageTypeId, NAMESPACE_URL};
pub use packet::Packet;
pub use router::Router;
