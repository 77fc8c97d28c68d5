//! Pub/sub fabric seam.
//!
//! The fabric is the topic-matching broadcast bus the session core publishes
//! into and registers per-subscription handlers on. Sessions never match
//! topics themselves; they hand the fabric a handler bound to the subscribed
//! filter and its granted QoS, and the fabric invokes it (by pushing a
//! `Delivery` into the handler's channel) for every matching publish.
//!
//! `MemoryFabric` is the in-process reference implementation backed by a
//! topic trie. Distributed deployments supply their own `Fabric`.

use crate::protocol::Qos;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

/// Identity of a registered handler, retained by the subscription map so
/// UNSUBSCRIBE can deregister exactly the handler it registered.
pub type HandlerId = u64;

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("no handler {handler} registered for filter {filter}")]
    UnknownHandler { filter: String, handler: HandlerId },
    #[error("fabric backend failure: {0}")]
    Backend(String),
}

/// Metadata carried with a publish across the bus.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Broker-stamped monotone dedup token. Absent on deliveries that have
    /// not passed through `Server::publish` (retained replay, offline
    /// replay); the forwarder stamps those on first delivery.
    pub dedup_id: Option<u64>,
    /// Present when the delivery replays a stored offline packet; holds the
    /// packet id under which persistence currently knows it.
    pub offline: Option<u16>,
    /// QoS the message was originally published with.
    pub qos: Qos,
    /// Set when the delivery replays a retained message.
    pub retain: bool,
}

/// One invocation of a subscription handler.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub payload: Bytes,
    pub options: PublishOptions,
    /// The filter originally subscribed to.
    pub sub_topic: String,
    /// The QoS granted to that subscription.
    pub sub_qos: Qos,
}

/// A per-subscription handler: the channel into the owning session plus the
/// `(sub_topic, sub_qos)` pair bound at registration time.
#[derive(Debug, Clone)]
pub struct FabricHandler {
    pub sub_topic: String,
    pub sub_qos: Qos,
    pub sink: mpsc::Sender<Delivery>,
}

#[derive(Debug, Clone)]
pub struct FabricMessage {
    pub topic: String,
    pub payload: Bytes,
    pub options: PublishOptions,
}

#[async_trait]
pub trait Fabric: Send + Sync {
    /// Register a handler for a topic filter; the returned id deregisters it.
    async fn subscribe(&self, filter: &str, handler: FabricHandler)
        -> Result<HandlerId, FabricError>;

    async fn unsubscribe(&self, filter: &str, handler: HandlerId) -> Result<(), FabricError>;

    /// Fan a message out to every handler whose filter matches.
    async fn publish(&self, message: FabricMessage) -> Result<(), FabricError>;
}

#[derive(Debug, Clone)]
struct Registration {
    id: HandlerId,
    handler: FabricHandler,
}

/// Trie node keyed by topic segment; `+` children and `#` values get their
/// own slots so matching never scans unrelated branches.
#[derive(Debug, Default)]
struct TrieNode {
    values: Vec<Registration>,
    children: HashMap<String, TrieNode>,
    single_wildcard: Option<Box<TrieNode>>,
    multi_wildcard_values: Vec<Registration>,
}

impl TrieNode {
    fn insert(&mut self, parts: &[&str], value: Registration) {
        let Some((first, rest)) = parts.split_first() else {
            self.values.push(value);
            return;
        };

        if *first == "#" {
            self.multi_wildcard_values.push(value);
            return;
        }

        if *first == "+" {
            let child = self.single_wildcard.get_or_insert_with(Box::default);
            child.insert(rest, value);
            return;
        }

        let child = self.children.entry((*first).to_string()).or_default();
        child.insert(rest, value);
    }

    fn remove(&mut self, parts: &[&str], id: HandlerId) -> bool {
        let Some((first, rest)) = parts.split_first() else {
            let before = self.values.len();
            self.values.retain(|r| r.id != id);
            return self.values.len() < before;
        };

        if *first == "#" {
            let before = self.multi_wildcard_values.len();
            self.multi_wildcard_values.retain(|r| r.id != id);
            return self.multi_wildcard_values.len() < before;
        }

        if *first == "+" {
            return match self.single_wildcard.as_mut() {
                Some(child) => child.remove(rest, id),
                None => false,
            };
        }

        match self.children.get_mut(*first) {
            Some(child) => child.remove(rest, id),
            None => false,
        }
    }

    fn find(&self, parts: &[&str], out: &mut Vec<Registration>) {
        out.extend(self.multi_wildcard_values.iter().cloned());

        let Some((first, rest)) = parts.split_first() else {
            out.extend(self.values.iter().cloned());
            return;
        };

        if let Some(child) = self.children.get(*first) {
            child.find(rest, out);
        }
        if let Some(child) = &self.single_wildcard {
            child.find(rest, out);
        }
    }
}

/// In-process fabric backed by a topic trie behind a single lock. The lock
/// is never held across an await; matching handlers are snapshotted first
/// and the channel sends happen afterwards.
#[derive(Debug, Default)]
pub struct MemoryFabric {
    root: RwLock<TrieNode>,
    next_handler: AtomicU64,
}

impl MemoryFabric {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Fabric for MemoryFabric {
    async fn subscribe(
        &self,
        filter: &str,
        handler: FabricHandler,
    ) -> Result<HandlerId, FabricError> {
        let id = self.next_handler.fetch_add(1, Ordering::Relaxed) + 1;
        let parts: Vec<&str> = filter.split('/').collect();
        self.root.write().insert(&parts, Registration { id, handler });
        Ok(id)
    }

    async fn unsubscribe(&self, filter: &str, handler: HandlerId) -> Result<(), FabricError> {
        let parts: Vec<&str> = filter.split('/').collect();
        if self.root.write().remove(&parts, handler) {
            Ok(())
        } else {
            Err(FabricError::UnknownHandler {
                filter: filter.to_string(),
                handler,
            })
        }
    }

    async fn publish(&self, message: FabricMessage) -> Result<(), FabricError> {
        let matched = {
            let parts: Vec<&str> = message.topic.split('/').collect();
            let mut out = Vec::new();
            self.root.read().find(&parts, &mut out);
            out
        };

        for registration in matched {
            let delivery = Delivery {
                topic: message.topic.clone(),
                payload: message.payload.clone(),
                options: message.options.clone(),
                sub_topic: registration.handler.sub_topic.clone(),
                sub_qos: registration.handler.sub_qos,
            };
            // Non-blocking hand-off: a session must never be able to wedge
            // the bus (or itself, publishing into its own subscription). A
            // full channel means a consumer far enough behind that its
            // inflight gate is about to close it anyway.
            match registration.handler.sink.try_send(delivery) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        "delivery channel full, dropping filter={} topic={}",
                        registration.handler.sub_topic,
                        message.topic
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Session died mid-teardown; the close coordinator
                    // deregisters the handler right after.
                    tracing::debug!(
                        "dropping delivery for departed handler filter={} topic={}",
                        registration.handler.sub_topic,
                        message.topic
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(sink: mpsc::Sender<Delivery>, filter: &str, qos: Qos) -> FabricHandler {
        FabricHandler {
            sub_topic: filter.to_string(),
            sub_qos: qos,
            sink,
        }
    }

    fn message(topic: &str, payload: &[u8]) -> FabricMessage {
        FabricMessage {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload),
            options: PublishOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_subscribe_publish_delivers() {
        let fabric = MemoryFabric::new();
        let (tx, mut rx) = mpsc::channel(4);
        fabric
            .subscribe("sensors/+/temp", handler(tx, "sensors/+/temp", Qos::AtMostOnce))
            .await
            .unwrap();

        fabric.publish(message("sensors/kitchen/temp", b"22")).await.unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.topic, "sensors/kitchen/temp");
        assert_eq!(delivery.sub_topic, "sensors/+/temp");
        assert_eq!(&delivery.payload[..], b"22");
    }

    #[tokio::test]
    async fn test_overlapping_filters_deliver_once_each() {
        let fabric = MemoryFabric::new();
        let (tx, mut rx) = mpsc::channel(4);
        fabric
            .subscribe("a/b", handler(tx.clone(), "a/b", Qos::AtMostOnce))
            .await
            .unwrap();
        fabric
            .subscribe("a/+", handler(tx, "a/+", Qos::AtMostOnce))
            .await
            .unwrap();

        fabric.publish(message("a/b", b"m")).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let mut filters = vec![first.sub_topic, second.sub_topic];
        filters.sort();
        assert_eq!(filters, vec!["a/+".to_string(), "a/b".to_string()]);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let fabric = MemoryFabric::new();
        let (tx, mut rx) = mpsc::channel(4);
        let id = fabric
            .subscribe("x", handler(tx, "x", Qos::AtLeastOnce))
            .await
            .unwrap();

        fabric.unsubscribe("x", id).await.unwrap();
        fabric.publish(message("x", b"p")).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_handler_errors() {
        let fabric = MemoryFabric::new();
        let err = fabric.unsubscribe("x", 42).await.unwrap_err();
        assert!(matches!(err, FabricError::UnknownHandler { .. }));
    }

    #[tokio::test]
    async fn test_hash_wildcard_matches_parent_level() {
        let fabric = MemoryFabric::new();
        let (tx, mut rx) = mpsc::channel(4);
        fabric
            .subscribe("a/#", handler(tx, "a/#", Qos::AtMostOnce))
            .await
            .unwrap();

        fabric.publish(message("a", b"root")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().topic, "a");
    }
}
