//! Persistence seam for retained messages, offline queues, and session state.
//!
//! The session core consumes a narrow interface: restore a reconnecting
//! client's subscriptions, persist (or wipe) session state at close, store
//! and replay retained messages, and maintain per-client offline queues whose
//! entries are re-keyed when replayed under fresh packet ids.
//!
//! `MemoryPersistence` is the in-process reference implementation;
//! `NoopPersistence` disables durability entirely. Durable backends implement
//! the same trait.

use crate::protocol::Qos;
use crate::topic;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("offline queue for {client_id} is full")]
    CapacityExceeded { client_id: String },
    #[error("persistence backend failure: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StoredSubscription {
    pub filter: String,
    pub qos: Qos,
}

#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
}

/// A queued publish awaiting an offline client. `message_id` is the id under
/// which persistence currently tracks the packet; replay re-keys it to the
/// session's fresh id so the eventual PUBACK can delete it.
#[derive(Debug, Clone)]
pub struct OfflinePacket {
    pub message_id: u16,
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
}

#[async_trait]
pub trait Persistence: Send + Sync {
    /// Subscriptions persisted for a non-clean client, replayed on CONNECT.
    async fn restore_subscriptions(
        &self,
        client_id: &str,
    ) -> Result<Vec<StoredSubscription>, PersistenceError>;

    /// Persist a closing client's state. Clean sessions leave nothing behind:
    /// their persisted subscriptions and offline packets are wiped.
    async fn persist_client(
        &self,
        client_id: &str,
        clean: bool,
        subscriptions: &[StoredSubscription],
    ) -> Result<(), PersistenceError>;

    /// Store a retained message; an empty payload clears the slot.
    async fn store_retained(&self, message: RetainedMessage) -> Result<(), PersistenceError>;

    /// Retained messages whose topic matches the given filter.
    async fn matching_retained(
        &self,
        filter: &str,
    ) -> Result<Vec<RetainedMessage>, PersistenceError>;

    /// Clients holding a persisted QoS-1 subscription matching `topic`.
    async fn offline_targets(&self, topic: &str) -> Result<Vec<(String, Qos)>, PersistenceError>;

    async fn enqueue_offline(
        &self,
        client_id: &str,
        topic: &str,
        payload: Bytes,
        qos: Qos,
    ) -> Result<(), PersistenceError>;

    /// Snapshot of a client's offline queue for replay. Entries stay queued
    /// until PUBACK deletes them.
    async fn offline_packets(&self, client_id: &str)
        -> Result<Vec<OfflinePacket>, PersistenceError>;

    /// Re-key a stored offline packet to the id it was just delivered under.
    async fn update_offline_packet(
        &self,
        client_id: &str,
        stored_id: u16,
        new_id: u16,
    ) -> Result<(), PersistenceError>;

    async fn delete_offline_packet(
        &self,
        client_id: &str,
        message_id: u16,
    ) -> Result<(), PersistenceError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    subscriptions: HashMap<String, Vec<StoredSubscription>>,
    retained: HashMap<String, RetainedMessage>,
    offline: HashMap<String, VecDeque<OfflinePacket>>,
    offline_ids: HashMap<String, u16>,
}

/// In-process persistence backed by plain maps behind one lock.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    state: Mutex<MemoryState>,
    /// Maximum offline entries per client; 0 means unlimited.
    max_offline_per_client: usize,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_offline_limit(max_offline_per_client: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            max_offline_per_client,
        }
    }

    /// Number of offline packets currently queued for a client.
    pub fn offline_len(&self, client_id: &str) -> usize {
        self.state
            .lock()
            .offline
            .get(client_id)
            .map_or(0, VecDeque::len)
    }

    /// Persisted subscription count for a client.
    pub fn subscription_len(&self, client_id: &str) -> usize {
        self.state
            .lock()
            .subscriptions
            .get(client_id)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn restore_subscriptions(
        &self,
        client_id: &str,
    ) -> Result<Vec<StoredSubscription>, PersistenceError> {
        Ok(self
            .state
            .lock()
            .subscriptions
            .get(client_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn persist_client(
        &self,
        client_id: &str,
        clean: bool,
        subscriptions: &[StoredSubscription],
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.lock();
        if clean {
            state.subscriptions.remove(client_id);
            state.offline.remove(client_id);
            state.offline_ids.remove(client_id);
        } else {
            state
                .subscriptions
                .insert(client_id.to_string(), subscriptions.to_vec());
        }
        Ok(())
    }

    async fn store_retained(&self, message: RetainedMessage) -> Result<(), PersistenceError> {
        let mut state = self.state.lock();
        if message.payload.is_empty() {
            state.retained.remove(&message.topic);
        } else {
            state.retained.insert(message.topic.clone(), message);
        }
        Ok(())
    }

    async fn matching_retained(
        &self,
        filter: &str,
    ) -> Result<Vec<RetainedMessage>, PersistenceError> {
        Ok(self
            .state
            .lock()
            .retained
            .values()
            .filter(|m| topic::matches(filter, &m.topic))
            .cloned()
            .collect())
    }

    async fn offline_targets(&self, topic: &str) -> Result<Vec<(String, Qos)>, PersistenceError> {
        let state = self.state.lock();
        let mut targets = Vec::new();
        for (client_id, subs) in &state.subscriptions {
            let qos = subs
                .iter()
                .filter(|s| s.qos >= Qos::AtLeastOnce && topic::matches(&s.filter, topic))
                .map(|s| s.qos)
                .max();
            if let Some(qos) = qos {
                targets.push((client_id.clone(), qos));
            }
        }
        Ok(targets)
    }

    async fn enqueue_offline(
        &self,
        client_id: &str,
        topic: &str,
        payload: Bytes,
        qos: Qos,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.lock();
        let queue = state.offline.entry(client_id.to_string()).or_default();
        if self.max_offline_per_client > 0 && queue.len() >= self.max_offline_per_client {
            return Err(PersistenceError::CapacityExceeded {
                client_id: client_id.to_string(),
            });
        }
        let counter = state.offline_ids.entry(client_id.to_string()).or_insert(0);
        *counter = if *counter == u16::MAX { 1 } else { *counter + 1 };
        let message_id = *counter;
        state
            .offline
            .entry(client_id.to_string())
            .or_default()
            .push_back(OfflinePacket {
                message_id,
                topic: topic.to_string(),
                payload,
                qos,
            });
        Ok(())
    }

    async fn offline_packets(
        &self,
        client_id: &str,
    ) -> Result<Vec<OfflinePacket>, PersistenceError> {
        Ok(self
            .state
            .lock()
            .offline
            .get(client_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn update_offline_packet(
        &self,
        client_id: &str,
        stored_id: u16,
        new_id: u16,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.lock();
        if let Some(queue) = state.offline.get_mut(client_id) {
            if let Some(entry) = queue.iter_mut().find(|p| p.message_id == stored_id) {
                entry.message_id = new_id;
            }
        }
        Ok(())
    }

    async fn delete_offline_packet(
        &self,
        client_id: &str,
        message_id: u16,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.lock();
        if let Some(queue) = state.offline.get_mut(client_id) {
            queue.retain(|p| p.message_id != message_id);
            if queue.is_empty() {
                state.offline.remove(client_id);
            }
        }
        Ok(())
    }
}

/// Persistence that stores nothing: every session behaves as clean.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPersistence;

#[async_trait]
impl Persistence for NoopPersistence {
    async fn restore_subscriptions(
        &self,
        _client_id: &str,
    ) -> Result<Vec<StoredSubscription>, PersistenceError> {
        Ok(Vec::new())
    }

    async fn persist_client(
        &self,
        _client_id: &str,
        _clean: bool,
        _subscriptions: &[StoredSubscription],
    ) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn store_retained(&self, _message: RetainedMessage) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn matching_retained(
        &self,
        _filter: &str,
    ) -> Result<Vec<RetainedMessage>, PersistenceError> {
        Ok(Vec::new())
    }

    async fn offline_targets(&self, _topic: &str) -> Result<Vec<(String, Qos)>, PersistenceError> {
        Ok(Vec::new())
    }

    async fn enqueue_offline(
        &self,
        _client_id: &str,
        _topic: &str,
        _payload: Bytes,
        _qos: Qos,
    ) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn offline_packets(
        &self,
        _client_id: &str,
    ) -> Result<Vec<OfflinePacket>, PersistenceError> {
        Ok(Vec::new())
    }

    async fn update_offline_packet(
        &self,
        _client_id: &str,
        _stored_id: u16,
        _new_id: u16,
    ) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn delete_offline_packet(
        &self,
        _client_id: &str,
        _message_id: u16,
    ) -> Result<(), PersistenceError> {
        Ok(())
    }
}
