use crate::message::MessageTypeId;

/// Errors returned by the canopy network layer.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {address} failed: {reason}")]
    Connect { address: String, reason: String },

    #[error("send to {address} failed: {reason}")]
    Send { address: String, reason: String },

    #[error("receive failed: {0}")]
    Receive(#[source] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("message type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: MessageTypeId,
        actual: MessageTypeId,
    },

    #[error("no processor registered for message type {0}")]
    NoProcessor(MessageTypeId),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("unsupported connection type: {0}")]
    UnsupportedConnType(String),

    #[error("address already in use: {0}")]
    AddressInUse(String),

    #[error("router is shut down")]
    Shutdown,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<rmp_serde::encode::Error> for NetworkError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        NetworkError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for NetworkError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        NetworkError::Deserialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_message_too_large() {
        let err = NetworkError::MessageTooLarge { size: 20, max: 10 };
        assert_eq!(err.to_string(), "message too large: 20 bytes (max 10)");
    }

    #[test]
    fn display_connect() {
        let err = NetworkError::Connect {
            address: "tcp://127.0.0.1:2000".into(),
            reason: "refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "connection to tcp://127.0.0.1:2000 failed: refused"
        );
    }

    #[test]
    fn display_shutdown() {
        assert_eq!(NetworkError::Shutdown.to_string(), "router is shut down");
    }
}
