//! Pluggable wire formats for the overlay envelope.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use canopy_network::{decode, encode, Message, MessageTypeId};

use crate::messages::OverlayMsg;
use crate::OverlayError;

/// Name of the built-in proxy.
pub const DEFAULT_PROXY: &str = "default";

/// Maps the overlay envelope to and from one wire format.
///
/// A proxy's `packet_type` is the id the transport surfaces its frames
/// under; its `name` is how protocols opt in to it.
pub trait MessageProxy: Send + Sync {
    fn name(&self) -> &str;

    fn packet_type(&self) -> MessageTypeId;

    fn wrap(&self, msg: &OverlayMsg) -> Result<Vec<u8>, OverlayError>;

    fn unwrap(&self, payload: &[u8]) -> Result<OverlayMsg, OverlayError>;
}

/// MessagePack encoding of [`OverlayMsg`] itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultProxy;

impl MessageProxy for DefaultProxy {
    fn name(&self) -> &str {
        DEFAULT_PROXY
    }

    fn packet_type(&self) -> MessageTypeId {
        OverlayMsg::message_type()
    }

    fn wrap(&self, msg: &OverlayMsg) -> Result<Vec<u8>, OverlayError> {
        Ok(encode(msg)?)
    }

    fn unwrap(&self, payload: &[u8]) -> Result<OverlayMsg, OverlayError> {
        Ok(decode(payload)?)
    }
}

#[derive(Default)]
struct Proxies {
    by_name: HashMap<String, Arc<dyn MessageProxy>>,
    by_type: HashMap<MessageTypeId, Arc<dyn MessageProxy>>,
}

/// Every proxy known to one server, by name and by packet type.
///
/// Always holds [`DefaultProxy`]; lookups that miss fall back to it.
pub struct MessageProxyStore {
    default: Arc<dyn MessageProxy>,
    proxies: RwLock<Proxies>,
}

impl Default for MessageProxyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageProxyStore {
    pub fn new() -> Self {
        let default: Arc<dyn MessageProxy> = Arc::new(DefaultProxy);
        let mut proxies = Proxies::default();
        proxies.by_name.insert(DEFAULT_PROXY.to_string(), default.clone());
        proxies.by_type.insert(default.packet_type(), default.clone());
        Self {
            default,
            proxies: RwLock::new(proxies),
        }
    }

    /// Add a proxy. Its name and packet type must both be new.
    pub fn register(&self, proxy: Arc<dyn MessageProxy>) -> Result<(), OverlayError> {
        let mut proxies = self.proxies.write().unwrap_or_else(|e| e.into_inner());
        let name = proxy.name().to_string();
        if proxies.by_name.contains_key(&name) || proxies.by_type.contains_key(&proxy.packet_type()) {
            return Err(OverlayError::DuplicateProxy(name));
        }
        proxies.by_type.insert(proxy.packet_type(), proxy.clone());
        proxies.by_name.insert(name, proxy);
        Ok(())
    }

    pub fn default_proxy(&self) -> Arc<dyn MessageProxy> {
        self.default.clone()
    }

    /// Proxy for outbound sends of a protocol opting in by `name`.
    pub fn by_name(&self, name: &str) -> Arc<dyn MessageProxy> {
        self.proxies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_name
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    /// Proxy for inbound frames of type `packet_type`.
    pub fn by_packet_type(&self, packet_type: &MessageTypeId) -> Option<Arc<dyn MessageProxy>> {
        self.proxies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_type
            .get(packet_type)
            .cloned()
    }

    pub fn packet_types(&self) -> Vec<MessageTypeId> {
        self.proxies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_type
            .keys()
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::RosterId;

    struct Custom;

    impl MessageProxy for Custom {
        fn name(&self) -> &str {
            "custom"
        }

        fn packet_type(&self) -> MessageTypeId {
            MessageTypeId::from_name("msgtype/Custom")
        }

        fn wrap(&self, msg: &OverlayMsg) -> Result<Vec<u8>, OverlayError> {
            DefaultProxy.wrap(msg)
        }

        fn unwrap(&self, payload: &[u8]) -> Result<OverlayMsg, OverlayError> {
            DefaultProxy.unwrap(payload)
        }
    }

    #[test]
    fn default_is_always_there() {
        let store = MessageProxyStore::new();
        assert_eq!(store.by_name("nope").name(), DEFAULT_PROXY);
        assert!(store.by_packet_type(&OverlayMsg::message_type()).is_some());
        assert!(store.by_packet_type(&MessageTypeId::random()).is_none());
    }

    #[test]
    fn register_indexes_both_ways() {
        let store = MessageProxyStore::new();
        store.register(Arc::new(Custom)).unwrap();
        assert_eq!(store.by_name("custom").name(), "custom");
        let t = MessageTypeId::from_name("msgtype/Custom");
        assert_eq!(store.by_packet_type(&t).unwrap().name(), "custom");
        assert_eq!(store.packet_types().len(), 2);
        assert!(matches!(
            store.register(Arc::new(Custom)),
            Err(OverlayError::DuplicateProxy(_))
        ));
    }

    #[test]
    fn default_unwrap_rejects_garbage() {
        let bytes = DefaultProxy.wrap(&OverlayMsg::RequestRoster(RosterId::NIL)).unwrap();
        assert_eq!(
            DefaultProxy.unwrap(&bytes).unwrap(),
            OverlayMsg::RequestRoster(RosterId::NIL)
        );
        assert!(DefaultProxy.unwrap(&[0xc1, 0x00]).is_err());
    }
}
