//! Addressing of a protocol instance at one tree node.

use std::fmt;

use canopy_network::define_id;
use serde::{Deserialize, Serialize};

use crate::roster::RosterId;
use crate::tree::{TreeId, TreeNodeId};

define_id!(
    /// Id of a [`Token`], derived from all of its fields.
    TokenId
);

define_id!(
    /// Id of one protocol run. Shared by every node of the run.
    RoundId
);

define_id!(
    /// Id of a protocol name.
    ProtocolId
);

define_id!(
    /// Id of a service name.
    ServiceId
);

impl ProtocolId {
    pub fn of(name: &str) -> Self {
        Self::from_name(&format!("protocolname/{name}"))
    }
}

impl ServiceId {
    pub fn of(name: &str) -> Self {
        Self::from_name(name)
    }
}

/// Names one protocol instance at one tree node.
///
/// Tokens are immutable: changing a field makes a new token with a new id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "TokenFields", into = "TokenFields")]
pub struct Token {
    roster_id: RosterId,
    tree_id: TreeId,
    protocol_id: ProtocolId,
    service_id: ServiceId,
    round_id: RoundId,
    tree_node_id: TreeNodeId,
    id: TokenId,
}

/// Wire form of a [`Token`]. The id is recomputed on arrival.
#[derive(Clone, Copy, Serialize, Deserialize)]
struct TokenFields {
    roster_id: RosterId,
    tree_id: TreeId,
    protocol_id: ProtocolId,
    service_id: ServiceId,
    round_id: RoundId,
    tree_node_id: TreeNodeId,
}

impl From<TokenFields> for Token {
    fn from(f: TokenFields) -> Self {
        Token::new(
            f.roster_id,
            f.tree_id,
            f.protocol_id,
            f.service_id,
            f.round_id,
            f.tree_node_id,
        )
    }
}

impl From<Token> for TokenFields {
    fn from(t: Token) -> Self {
        TokenFields {
            roster_id: t.roster_id,
            tree_id: t.tree_id,
            protocol_id: t.protocol_id,
            service_id: t.service_id,
            round_id: t.round_id,
            tree_node_id: t.tree_node_id,
        }
    }
}

impl Token {
    pub fn new(
        roster_id: RosterId,
        tree_id: TreeId,
        protocol_id: ProtocolId,
        service_id: ServiceId,
        round_id: RoundId,
        tree_node_id: TreeNodeId,
    ) -> Self {
        let id = TokenId::from_name(&format!(
            "token/{roster_id}{tree_id}{protocol_id}{service_id}{round_id}{tree_node_id}"
        ));
        Self {
            roster_id,
            tree_id,
            protocol_id,
            service_id,
            round_id,
            tree_node_id,
            id,
        }
    }

    pub fn id(&self) -> TokenId {
        self.id
    }

    pub fn roster_id(&self) -> RosterId {
        self.roster_id
    }

    pub fn tree_id(&self) -> TreeId {
        self.tree_id
    }

    pub fn protocol_id(&self) -> ProtocolId {
        self.protocol_id
    }

    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }

    pub fn round_id(&self) -> RoundId {
        self.round_id
    }

    pub fn tree_node_id(&self) -> TreeNodeId {
        self.tree_node_id
    }

    /// The same run addressed at another node of the tree.
    pub fn change_tree_node_id(&self, tree_node_id: TreeNodeId) -> Token {
        Token::new(
            self.roster_id,
            self.tree_id,
            self.protocol_id,
            self.service_id,
            self.round_id,
            tree_node_id,
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("id", &self.id)
            .field("tree", &self.tree_id)
            .field("node", &self.tree_node_id)
            .field("round", &self.round_id)
            .finish()
    }
}
