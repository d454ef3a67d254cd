use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::{define_id, Address, NetworkError, PublicKey};

define_id!(
    /// Content-stable id of a server: derived from its public key.
    ServerIdentityId
);

/// A network-addressable node with a long-term public key.
///
/// Two identities with the same `id` are the same node, whatever their
/// address or description says.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServerIdentity {
    pub public: PublicKey,
    pub id: ServerIdentityId,
    pub address: Address,
    pub description: String,
}

impl ServerIdentity {
    pub fn new(public: PublicKey, address: Address) -> Self {
        Self {
            id: ServerIdentityId::from_name(&format!("id/{}", public.to_hex())),
            public,
            address,
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Writable form for config files.
    pub fn to_toml(&self) -> ServerIdentityToml {
        ServerIdentityToml {
            public: self.public.to_hex(),
            address: self.address.clone(),
            description: self.description.clone(),
        }
    }
}

impl PartialEq for ServerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServerIdentity {}

impl Hash for ServerIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

impl fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerIdentity({}, {:?})", self.address, self.id)
    }
}

/// A [`ServerIdentity`] as it is written in config files: the key in hex,
/// the id recomputed on load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdentityToml {
    pub public: String,
    pub address: Address,
    #[serde(default)]
    pub description: String,
}

impl ServerIdentityToml {
    pub fn to_server_identity(&self) -> Result<ServerIdentity, NetworkError> {
        let public = PublicKey::from_hex(&self.public)?;
        Ok(ServerIdentity::new(public, self.address.clone()).with_description(self.description.clone()))
    }
}
