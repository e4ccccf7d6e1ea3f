//! In-process implementations of the coordination primitives.
//!
//! These cover engine handles living in one host process (the common test
//! and embedded-runtime setup). OS-scoped equivalents (named pipes, file
//! locks) can implement the same traits without touching the engine.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use super::{LeaderLock, MessageBus, Subscription, Topic};

fn recover<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    // A poisoned registry only means another handle panicked mid-publish;
    // the map itself is still usable.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type SubscriberMap = HashMap<(String, Topic), Vec<Sender<Value>>>;

/// Fan-out bus for handles sharing one process.
#[derive(Clone, Default)]
pub struct LocalBus {
    subscribers: Arc<Mutex<SubscriberMap>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageBus for LocalBus {
    fn publish(&self, instance: &str, topic: Topic, message: Value) {
        let mut map = recover(&self.subscribers);
        if let Some(senders) = map.get_mut(&(instance.to_string(), topic)) {
            // Dead receivers are pruned as they are discovered.
            senders.retain(|sender| sender.send(message.clone()).is_ok());
        }
    }

    fn subscribe(&self, instance: &str, topic: Topic) -> Subscription {
        let (sender, receiver) = channel();
        recover(&self.subscribers)
            .entry((instance.to_string(), topic))
            .or_default()
            .push(sender);
        Subscription::new(receiver)
    }
}

/// FIFO named lock: the queue front holds the lock, release promotes the
/// next waiter.
#[derive(Clone, Default)]
pub struct LocalLock {
    queues: Arc<Mutex<HashMap<String, Vec<String>>>>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LeaderLock for LocalLock {
    fn request(&self, instance: &str, holder: &str) {
        let mut queues = recover(&self.queues);
        let queue = queues.entry(instance.to_string()).or_default();
        if !queue.iter().any(|waiting| waiting == holder) {
            queue.push(holder.to_string());
        }
    }

    fn is_held(&self, instance: &str, holder: &str) -> bool {
        let queues = recover(&self.queues);
        queues
            .get(instance)
            .and_then(|queue| queue.first())
            .is_some_and(|front| front == holder)
    }

    fn release(&self, instance: &str, holder: &str) {
        let mut queues = recover(&self.queues);
        if let Some(queue) = queues.get_mut(instance) {
            queue.retain(|waiting| waiting != holder);
        }
    }
}
