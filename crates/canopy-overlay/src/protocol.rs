//! Protocol instances and the registry of their constructors.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::token::{ProtocolId, Token};
use crate::treenode::TreeNodeInstance;
use crate::OverlayError;

/// A protocol state machine running at one tree node.
///
/// Messages reach it through the handlers and channels it registers on its
/// [`TreeNodeInstance`]; it answers through the same instance.
#[async_trait]
pub trait ProtocolInstance: Send + Sync + 'static {
    fn tree_node_instance(&self) -> &Arc<TreeNodeInstance>;

    fn token(&self) -> Token {
        *self.tree_node_instance().token()
    }

    /// Called on the node that starts the run, after dispatch is running.
    async fn start(&self) -> Result<(), OverlayError> {
        Ok(())
    }

    /// Called once when the instance is torn down.
    async fn shutdown(&self) -> Result<(), OverlayError> {
        Ok(())
    }
}

type Factory =
    Arc<dyn Fn(Arc<TreeNodeInstance>) -> Result<Arc<dyn ProtocolInstance>, OverlayError> + Send + Sync>;

struct Registered {
    name: String,
    factory: Factory,
}

/// Protocol constructors by name.
///
/// Built once per process (or per test) and handed to every server that
/// should run these protocols.
#[derive(Default)]
pub struct ProtocolStorage {
    protocols: RwLock<HashMap<ProtocolId, Registered>>,
}

impl ProtocolStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the constructor for `name`. A name can only be taken once;
    /// the first constructor stays in place.
    pub fn register<P, F>(&self, name: &str, factory: F) -> Result<ProtocolId, OverlayError>
    where
        P: ProtocolInstance,
        F: Fn(Arc<TreeNodeInstance>) -> Result<P, OverlayError> + Send + Sync + 'static,
    {
        let id = ProtocolId::of(name);
        let mut protocols = self.protocols.write().unwrap_or_else(|e| e.into_inner());
        if protocols.contains_key(&id) {
            return Err(OverlayError::DuplicateProtocol(name.to_string()));
        }
        let factory: Factory = Arc::new(move |tni| Ok(Arc::new(factory(tni)?) as Arc<dyn ProtocolInstance>));
        protocols.insert(
            id,
            Registered {
                name: name.to_string(),
                factory,
            },
        );
        tracing::debug!("registered protocol {name}");
        Ok(id)
    }

    pub fn id_of(&self, name: &str) -> ProtocolId {
        ProtocolId::of(name)
    }

    pub fn name_of(&self, id: &ProtocolId) -> Option<String> {
        self.protocols
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|r| r.name.clone())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.protocols
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&ProtocolId::of(name))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .protocols
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|r| r.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Run the constructor registered under `id`.
    pub fn instantiate(
        &self,
        id: &ProtocolId,
        tni: Arc<TreeNodeInstance>,
    ) -> Result<Arc<dyn ProtocolInstance>, OverlayError> {
        let factory = self
            .protocols
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|r| r.factory.clone())
            .ok_or_else(|| OverlayError::UnknownProtocol(id.to_string()))?;
        factory(tni)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop(Arc<TreeNodeInstance>);

    impl ProtocolInstance for Nop {
        fn tree_node_instance(&self) -> &Arc<TreeNodeInstance> {
            &self.0
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let storage = ProtocolStorage::new();
        let id = storage.register("X", |tni| Ok(Nop(tni))).unwrap();
        assert_eq!(id, ProtocolId::of("X"));
        assert!(matches!(
            storage.register("X", |tni| Ok(Nop(tni))),
            Err(OverlayError::DuplicateProtocol(name)) if name == "X"
        ));
        assert_eq!(storage.names(), vec!["X".to_string()]);
    }

    #[test]
    fn names_and_ids_map_both_ways() {
        let storage = ProtocolStorage::new();
        storage.register("Count", |tni| Ok(Nop(tni))).unwrap();
        let id = storage.id_of("Count");
        assert_eq!(storage.name_of(&id).as_deref(), Some("Count"));
        assert!(storage.exists("Count"));
        assert!(!storage.exists("Other"));
        assert!(storage.name_of(&storage.id_of("Other")).is_none());
    }
}
