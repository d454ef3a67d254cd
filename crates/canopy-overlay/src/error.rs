use canopy_network::{NetworkError, ServerIdentityId};

use crate::roster::RosterId;
use crate::token::TokenId;
use crate::tree::{TreeId, TreeNodeId};

/// Errors of the overlay runtime.
///
/// Wraps network errors and adds the registry, topology and instance
/// failures the overlay surfaces to its callers.
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("protocol {0} already registered")]
    DuplicateProtocol(String),

    #[error("no protocol constructor registered for {0}")]
    UnknownProtocol(String),

    #[error("service {0} already registered")]
    DuplicateService(String),

    #[error("invalid service name: {0}")]
    InvalidServiceName(String),

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("message proxy {0} already registered")]
    DuplicateProxy(String),

    #[error("message proxy: {0}")]
    Proxy(String),

    #[error("a protocol instance is already registered for {0}")]
    AlreadyRegistered(TokenId),

    #[error("no tree node instance for {0}")]
    NoInstance(TokenId),

    #[error("unknown tree {0}")]
    UnknownTree(TreeId),

    #[error("unknown roster {0}")]
    UnknownRoster(RosterId),

    #[error("tree node {0} not found")]
    TreeNodeNotFound(TreeNodeId),

    #[error("roster mismatch: tree wants {expected}, got {actual}")]
    RosterMismatch { expected: RosterId, actual: RosterId },

    #[error("identity {0} is not in the roster")]
    UnknownIdentity(ServerIdentityId),

    #[error("invalid tree: {0}")]
    InvalidTree(String),

    #[error("no handler or channel registered for message type {0}")]
    NoHandler(canopy_network::MessageTypeId),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("overlay is closed")]
    Closed,

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl From<rmp_serde::encode::Error> for OverlayError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        OverlayError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for OverlayError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        OverlayError::Deserialization(e.to_string())
    }
}

impl From<toml::de::Error> for OverlayError {
    fn from(e: toml::de::Error) -> Self {
        OverlayError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for OverlayError {
    fn from(e: toml::ser::Error) -> Self {
        OverlayError::Config(e.to_string())
    }
}

// ── Client errors ────────────────────────────────────────────────────────

/// Application error returned to a websocket client in the close frame.
///
/// Codes 4000 to 4999 belong to the application. Anything outside that
/// window is sent as [`ClientError::INVALID_ERROR_CODE`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("websocket error {code}: {message}")]
pub struct ClientError {
    pub code: u16,
    pub message: String,
}

impl ClientError {
    /// The requested `/<service>/<handler>` does not exist.
    pub const PATH_NOT_FOUND: u16 = 4000;
    /// The request body could not be decoded.
    pub const DECODE: u16 = 4001;
    /// The reply could not be encoded.
    pub const ENCODE: u16 = 4002;
    /// A service used a code outside the application range.
    pub const INVALID_ERROR_CODE: u16 = 4003;
    /// Reading from the connection failed.
    pub const READ_ERROR: u16 = 4004;

    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The code actually written to the close frame.
    pub fn wire_code(&self) -> u16 {
        if (4000..5000).contains(&self.code) {
            self.code
        } else {
            Self::INVALID_ERROR_CODE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_duplicate_protocol() {
        let err = OverlayError::DuplicateProtocol("Count".into());
        assert_eq!(err.to_string(), "protocol Count already registered");
    }

    #[test]
    fn display_roster_mismatch() {
        let err = OverlayError::RosterMismatch {
            expected: RosterId::NIL,
            actual: RosterId::NIL,
        };
        assert!(err.to_string().starts_with("roster mismatch"));
    }

    #[test]
    fn display_network_wraps() {
        let err: OverlayError = NetworkError::Shutdown.into();
        assert_eq!(err.to_string(), "network error: router is shut down");
    }

    #[test]
    fn client_codes_are_remapped() {
        assert_eq!(ClientError::new(4000, "x").wire_code(), 4000);
        assert_eq!(ClientError::new(4999, "x").wire_code(), 4999);
        assert_eq!(ClientError::new(42, "x").wire_code(), ClientError::INVALID_ERROR_CODE);
        assert_eq!(ClientError::new(5000, "x").wire_code(), ClientError::INVALID_ERROR_CODE);
        assert_eq!(
            ClientError::new(4005, "nope").to_string(),
            "websocket error 4005: nope"
        );
    }
}
