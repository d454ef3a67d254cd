use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::message::MessageTypeId;
use crate::{NetworkError, Packet};

/// Handles every inbound packet of the message types it is registered for.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, packet: Packet);
}

struct FnProcessor<F>(F);

#[async_trait]
impl<F, Fut> Processor for FnProcessor<F>
where
    F: Fn(Packet) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn process(&self, packet: Packet) {
        (self.0)(packet).await
    }
}

/// Wrap an async closure as a [`Processor`].
pub fn processor_fn<F, Fut>(f: F) -> Arc<dyn Processor>
where
    F: Fn(Packet) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnProcessor(f))
}

/// Routes packets to processors by message type. Last registration wins.
#[derive(Default)]
pub struct Dispatcher {
    processors: RwLock<HashMap<MessageTypeId, Arc<dyn Processor>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, msg_type: MessageTypeId, processor: Arc<dyn Processor>) {
        self.processors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(msg_type, processor);
    }

    pub fn unregister(&self, msg_type: &MessageTypeId) -> bool {
        self.processors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(msg_type)
            .is_some()
    }

    pub fn is_registered(&self, msg_type: &MessageTypeId) -> bool {
        self.processors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(msg_type)
    }

    /// Drop every processor.
    pub fn clear(&self) {
        self.processors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Hand `packet` to its processor and wait for it to finish.
    pub async fn dispatch(&self, packet: Packet) -> Result<(), NetworkError> {
        let processor = self
            .processors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&packet.msg_type)
            .cloned();
        match processor {
            Some(p) => {
                p.process(packet).await;
                Ok(())
            }
            None => Err(NetworkError::NoProcessor(packet.msg_type)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Address, KeyPair, ServerIdentity};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn packet(msg_type: MessageTypeId) -> Packet {
        Packet {
            server_identity: ServerIdentity::new(
                KeyPair::from_seed(0).public,
                Address::local("127.0.0.1", 2000),
            ),
            msg_type,
            payload: Vec::new(),
            size: 0,
        }
    }

    #[tokio::test]
    async fn dispatches_to_registered_processor() {
        let dispatcher = Dispatcher::new();
        let ty = MessageTypeId::from_name("test");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        dispatcher.register(
            ty,
            processor_fn(move |_| {
                let h = h.clone();
                async move {
                    h.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        dispatcher.dispatch(packet(ty)).await.unwrap();
        dispatcher.dispatch(packet(ty)).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_type_is_an_error() {
        let dispatcher = Dispatcher::new();
        let ty = MessageTypeId::from_name("nobody");
        assert!(matches!(
            dispatcher.dispatch(packet(ty)).await,
            Err(NetworkError::NoProcessor(t)) if t == ty
        ));
    }

    #[tokio::test]
    async fn unregister_removes() {
        let dispatcher = Dispatcher::new();
        let ty = MessageTypeId::from_name("gone");
        dispatcher.register(ty, processor_fn(|_| async {}));
        assert!(dispatcher.is_registered(&ty));
        assert!(dispatcher.unregister(&ty));
        assert!(!dispatcher.is_registered(&ty));
        assert!(dispatcher.dispatch(packet(ty)).await.is_err());
    }
}
