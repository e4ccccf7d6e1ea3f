//! Cross-process coordination: two broadcast rails and the leader lock.
//!
//! Both rails are best-effort and lossy; the durable store is the fallback
//! source of truth. Payloads arriving from the rails are untrusted and are
//! parsed defensively: anything malformed is dropped by the receiver.

pub mod local;

use std::sync::mpsc::Receiver;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::types::EventEnvelope;

/// The two logical rails shared by all processes of one instance id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Mutation forwarding and leadership announcements.
    Sync,
    /// Durable-record-key change notices.
    Rescan,
}

/// Messages carried on the sync rail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SyncMessage {
    /// A follower's locally-applied, not-yet-persisted envelope.
    Mutation {
        source: String,
        envelope: EventEnvelope,
    },
    /// Informational leadership change broadcast.
    Leader { source: String, leader: bool },
}

impl SyncMessage {
    /// Defensive parse of an untrusted rail payload.
    pub fn parse(value: Value) -> Option<Self> {
        serde_json::from_value(value).ok()
    }

    pub fn to_value(&self) -> Option<Value> {
        serde_json::to_value(self).ok()
    }
}

/// Messages carried on the rescan rail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescanNotice {
    pub key: String,
}

impl RescanNotice {
    pub fn parse(value: Value) -> Option<Self> {
        serde_json::from_value(value).ok()
    }

    pub fn to_value(&self) -> Option<Value> {
        serde_json::to_value(self).ok()
    }
}

/// Receiving end of one rail subscription.
pub struct Subscription {
    receiver: Receiver<Value>,
}

impl Subscription {
    pub fn new(receiver: Receiver<Value>) -> Self {
        Self { receiver }
    }

    /// Next queued message, if any. Never blocks.
    pub fn try_next(&self) -> Option<Value> {
        self.receiver.try_recv().ok()
    }
}

/// Pub/sub mechanism scoped to the processes of one logical client.
/// Delivery need not be guaranteed or ordered across processes.
pub trait MessageBus: Send + Sync {
    fn publish(&self, instance: &str, topic: Topic, message: Value);
    fn subscribe(&self, instance: &str, topic: Topic) -> Subscription;
}

/// Named mutual-exclusion lock. The holder of the lock for an instance id is
/// that instance's leader; release promotes the next waiter in request
/// order.
pub trait LeaderLock: Send + Sync {
    /// Joins the wait queue. Granted immediately when the lock is free.
    fn request(&self, instance: &str, holder: &str);

    fn is_held(&self, instance: &str, holder: &str) -> bool;

    /// Leaves the queue (or surrenders the lock when held).
    fn release(&self, instance: &str, holder: &str);
}
