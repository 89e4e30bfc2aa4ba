//! Typed publish/subscribe between tasks.
//!
//! Each message type has its own list of subscriber channels. Publishing
//! clones the message to every live subscriber and drops the ones whose
//! receiver has gone away.

use std::any::{Any, TypeId};
use std::sync::Arc;

use ahash::AHashMap;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

type Endpoints = Vec<Box<dyn Any + Send>>;

/// Cloneable message bus. Clones share their subscribers.
#[derive(Clone, Default)]
pub struct Broker {
    subscribers: Arc<Mutex<AHashMap<TypeId, Endpoints>>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every `T` published from now on.
    pub fn subscribe<T: Clone + Send + 'static>(&self) -> Receiver<T> {
        let (tx, rx) = unbounded::<T>();
        self.subscribers
            .lock()
            .entry(TypeId::of::<T>())
            .or_default()
            .push(Box::new(tx));
        rx
    }

    /// Deliver `message` to all subscribers of `T`. Returns how many got it.
    pub fn publish<T: Clone + Send + 'static>(&self, message: T) -> usize {
        let mut subscribers = self.subscribers.lock();
        let Some(endpoints) = subscribers.get_mut(&TypeId::of::<T>()) else {
            return 0;
        };

        endpoints.retain(|endpoint| {
            endpoint
                .downcast_ref::<Sender<T>>()
                .is_some_and(|tx| tx.send(message.clone()).is_ok())
        });
        endpoints.len()
    }

    pub fn subscriber_count<T: 'static>(&self) -> usize {
        self.subscribers
            .lock()
            .get(&TypeId::of::<T>())
            .map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("types", &self.subscribers.lock().len())
            .finish()
    }
}
