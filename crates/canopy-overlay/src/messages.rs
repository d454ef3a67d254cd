//! Envelopes the overlay exchanges between servers.

use canopy_network::{Message, MessageTypeId, ServerIdentity};
use serde::{Deserialize, Serialize};

use crate::roster::{Roster, RosterId};
use crate::token::{Token, TokenId};
use crate::tree::{TreeId, TreeMarshal};

/// One protocol message between two tree node instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMsg {
    pub from: Token,
    pub to: Token,
    /// Wire id of the body type.
    pub msg_type: MessageTypeId,
    #[serde(with = "serde_bytes")]
    pub msg_slice: Vec<u8>,
    /// Set from the transport on arrival; never sent.
    #[serde(skip)]
    pub server_identity: Option<ServerIdentity>,
}

impl ProtocolMsg {
    pub fn new<M: Message>(from: Token, to: Token, body: &M) -> Result<Self, crate::OverlayError> {
        Ok(Self {
            from,
            to,
            msg_type: M::message_type(),
            msg_slice: canopy_network::encode(body)?,
            server_identity: None,
        })
    }
}

/// The overlay's routing envelope.
///
/// Only [`OverlayMsg::TreeNode`] reaches a protocol; the other variants are
/// the topology exchange handled by the overlay itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OverlayMsg {
    TreeNode(ProtocolMsg),
    RequestTree(TreeId),
    TreeMarshal(TreeMarshal),
    RequestRoster(RosterId),
    Roster(Roster),
}

impl OverlayMsg {
    /// Short name of the variant, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            OverlayMsg::TreeNode(_) => "TreeNode",
            OverlayMsg::RequestTree(_) => "RequestTree",
            OverlayMsg::TreeMarshal(_) => "TreeMarshal",
            OverlayMsg::RequestRoster(_) => "RequestRoster",
            OverlayMsg::Roster(_) => "Roster",
        }
    }
}

impl Message for OverlayMsg {
    const NAME: &'static str = "OverlayMsg";
}

/// Opaque bytes handed to a remote instance's creation hook.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GenericConfig {
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl GenericConfig {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }
}

/// Binds a config to the instance `dest` before its first message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMsg {
    pub config: GenericConfig,
    pub dest: TokenId,
}

impl Message for ConfigMsg {
    const NAME: &'static str = "ConfigMsg";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{ProtocolId, RoundId, ServiceId};
    use crate::tree::TreeNodeId;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Body {
        i: i64,
    }

    impl Message for Body {
        const NAME: &'static str = "Body";
    }

    fn token() -> Token {
        Token::new(
            RosterId::random(),
            TreeId::random(),
            ProtocolId::of("P"),
            ServiceId::NIL,
            RoundId::random(),
            TreeNodeId::random(),
        )
    }

    #[test]
    fn identity_is_not_sent() {
        let from = token();
        let mut msg = ProtocolMsg::new(from, from.change_tree_node_id(TreeNodeId::random()), &Body { i: 12 }).unwrap();
        msg.server_identity = Some(ServerIdentity::new(
            canopy_network::KeyPair::from_seed(1).public,
            canopy_network::Address::local("127.0.0.1", 2000),
        ));
        let bytes = rmp_serde::to_vec(&OverlayMsg::TreeNode(msg.clone())).unwrap();
        let OverlayMsg::TreeNode(back) = rmp_serde::from_slice(&bytes).unwrap() else {
            panic!("wrong variant");
        };
        assert!(back.server_identity.is_none());
        assert_eq!(back.msg_type, Body::message_type());
        let body: Body = canopy_network::decode(&back.msg_slice).unwrap();
        assert_eq!(body.i, 12);
    }

    #[test]
    fn kinds() {
        assert_eq!(OverlayMsg::RequestTree(TreeId::NIL).kind(), "RequestTree");
        assert_eq!(OverlayMsg::Roster(Roster::empty()).kind(), "Roster");
        assert_ne!(OverlayMsg::message_type(), ConfigMsg::message_type());
    }
}
