//! Server configuration and the files a node is set up from.

use std::path::{Path, PathBuf};
use std::time::Duration;

use canopy_network::{Address, KeyPair, PublicKey, RouterConfig, SecretKey, ServerIdentity};
use serde::{Deserialize, Serialize};

use crate::roster::RosterToml;
use crate::websocket::DEFAULT_GRACE;
use crate::OverlayError;

/// Environment variable naming the directory of server databases.
pub const DATA_DIR_ENV: &str = "CANOPY_DATA_DIR";

/// Configuration for a [`Server`](crate::Server).
///
/// ```rust
/// use std::time::Duration;
/// use canopy_overlay::ServerConfig;
///
/// let config = ServerConfig::new()
///     .db_dir("/tmp/canopy")
///     .delete_db_on_close(true)
///     .websocket_grace(Duration::from_millis(50));
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub(crate) router: RouterConfig,
    pub(crate) db_dir: Option<PathBuf>,
    pub(crate) in_memory_db: bool,
    pub(crate) delete_db_on_close: bool,
    pub(crate) websocket: bool,
    pub(crate) websocket_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self {
            router: RouterConfig::new(),
            db_dir: None,
            in_memory_db: false,
            delete_db_on_close: false,
            websocket: true,
            websocket_grace: DEFAULT_GRACE,
        }
    }

    pub fn router(mut self, router: RouterConfig) -> Self {
        self.router = router;
        self
    }

    /// Directory of the database file (default: `$CANOPY_DATA_DIR`, else
    /// the system temp dir).
    pub fn db_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.db_dir = Some(dir.into());
        self
    }

    /// Keep service state in memory only.
    pub fn in_memory_db(mut self, yes: bool) -> Self {
        self.in_memory_db = yes;
        self
    }

    /// Remove the database file when the server closes.
    pub fn delete_db_on_close(mut self, yes: bool) -> Self {
        self.delete_db_on_close = yes;
        self
    }

    /// Start the websocket surface (default: on). It is only started for
    /// `tcp://` servers.
    pub fn websocket(mut self, yes: bool) -> Self {
        self.websocket = yes;
        self
    }

    /// Time open websocket requests get when the server stops (default: 100 ms).
    pub fn websocket_grace(mut self, grace: Duration) -> Self {
        self.websocket_grace = grace;
        self
    }

    pub(crate) fn resolved_db_dir(&self) -> PathBuf {
        self.db_dir
            .clone()
            .or_else(|| std::env::var_os(DATA_DIR_ENV).map(PathBuf::from))
            .unwrap_or_else(|| std::env::temp_dir().join("canopy"))
    }
}

// ── Files ────────────────────────────────────────────────────────────────

/// Private configuration of one node, usually `private.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerToml {
    pub address: Address,
    pub public: String,
    pub private: String,
    #[serde(default)]
    pub description: String,
}

impl ServerToml {
    /// Fresh key pair for a node reachable at `address`.
    pub fn generate(address: Address, description: &str) -> Self {
        Self::from_keypair(&KeyPair::generate(), address, description)
    }

    pub fn from_keypair(kp: &KeyPair, address: Address, description: &str) -> Self {
        Self {
            address,
            public: kp.public.to_hex(),
            private: kp.secret.to_hex(),
            description: description.to_string(),
        }
    }

    /// The key pair, checking that both halves belong together.
    pub fn keypair(&self) -> Result<KeyPair, OverlayError> {
        let secret = SecretKey::from_hex(&self.private)?;
        let public = PublicKey::from_hex(&self.public)?;
        let kp = KeyPair::from_secret(secret);
        if kp.public != public {
            return Err(OverlayError::Config(
                "public key does not match private key".into(),
            ));
        }
        Ok(kp)
    }

    pub fn server_identity(&self) -> Result<ServerIdentity, OverlayError> {
        let kp = self.keypair()?;
        Ok(ServerIdentity::new(kp.public, self.address.clone()).with_description(self.description.clone()))
    }

    pub fn load(path: &Path) -> Result<Self, OverlayError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), OverlayError> {
        std::fs::write(path, toml::to_string(self)?)?;
        Ok(())
    }
}

/// Read a group file.
pub fn load_group(path: &Path) -> Result<RosterToml, OverlayError> {
    RosterToml::from_toml_str(&std::fs::read_to_string(path)?)
}

/// Write a group file.
pub fn save_group(path: &Path, group: &RosterToml) -> Result<(), OverlayError> {
    std::fs::write(path, group.to_toml_string()?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::Roster;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert!(config.websocket);
        assert!(!config.delete_db_on_close);
        assert_eq!(config.websocket_grace, Duration::from_millis(100));
        let config = config.db_dir("/some/where");
        assert_eq!(config.resolved_db_dir(), PathBuf::from("/some/where"));
    }

    #[test]
    fn server_toml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("private.toml");
        let toml = ServerToml::generate(Address::tcp("127.0.0.1", 7770), "test node");
        toml.save(&path).unwrap();
        let back = ServerToml::load(&path).unwrap();
        assert_eq!(back, toml);

        let si = back.server_identity().unwrap();
        assert_eq!(si.public.to_hex(), toml.public);
        assert_eq!(si.description, "test node");
        assert_eq!(si.address, Address::tcp("127.0.0.1", 7770));
    }

    #[test]
    fn mismatched_keys_are_rejected() {
        let mut toml = ServerToml::from_keypair(&KeyPair::from_seed(1), Address::tcp("127.0.0.1", 1), "");
        toml.public = KeyPair::from_seed(2).public.to_hex();
        assert!(matches!(toml.keypair(), Err(OverlayError::Config(_))));
    }

    #[test]
    fn group_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("group.toml");
        let list = (0..3)
            .map(|i| {
                ServerToml::from_keypair(&KeyPair::from_seed(i), Address::tcp("127.0.0.1", 7000 + i as u16), "")
                    .server_identity()
                    .unwrap()
            })
            .collect();
        let roster = Roster::new(list);
        save_group(&path, &roster.to_toml()).unwrap();
        let back = load_group(&path).unwrap().to_roster().unwrap();
        assert_eq!(back, roster);
    }
}
