//! Broker runtime: the adapter surface sessions consume.
//!
//! `Server` owns the process-wide client table (one live session per client
//! id; a second CONNECT displaces the first), the monotone dedup id source
//! stamped onto every publish, publish fan-out across the fabric (plus
//! retained storage and offline enqueueing), and the delegation points for
//! authorization and persistence. `Broker` is the public construction and
//! transport-attachment surface.

use crate::auth::{AllowAll, AuthHandler};
use crate::core::config::BrokerConfig;
use crate::core::time::{Clock, SystemClock};
use crate::events::{BrokerEvent, EventBus};
use crate::fabric::{Delivery, Fabric, FabricError, FabricMessage, MemoryFabric, PublishOptions};
use crate::persistence::{MemoryPersistence, Persistence, RetainedMessage};
use crate::protocol::{ControlPacket, Qos};
use crate::session::{Session, SessionCommand, TransportEvent};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Entry in the client table: enough to displace the session on takeover.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub(crate) serial: u64,
    pub(crate) commands: mpsc::Sender<SessionCommand>,
}

/// Decoded-packet endpoints for one accepted transport. The codec feeds
/// `packets_in` (dropping it signals EOF) and drains `packets_out`.
#[derive(Debug)]
pub struct ClientPipe {
    pub packets_in: mpsc::Sender<TransportEvent>,
    pub packets_out: mpsc::Receiver<ControlPacket>,
}

pub struct Server<C: Clock = SystemClock> {
    config: BrokerConfig,
    clock: C,
    fabric: Arc<dyn Fabric>,
    persistence: Arc<dyn Persistence>,
    auth: Arc<dyn AuthHandler>,
    events: EventBus,
    clients: Mutex<HashMap<String, ClientHandle>>,
    dedup_source: AtomicU64,
    serials: AtomicU64,
}

impl<C: Clock> Server<C> {
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn fabric(&self) -> &Arc<dyn Fabric> {
        &self.fabric
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn auth(&self) -> &Arc<dyn AuthHandler> {
        &self.auth
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Strictly monotone, process-wide. Sessions initialize their dedup
    /// watermark to 0, below every id this hands out.
    pub fn next_dedup_id(&self) -> u64 {
        self.dedup_source.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn next_serial(&self) -> u64 {
        self.serials.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Number of sessions currently registered in the client table.
    pub fn connected_clients(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.clients.lock().contains_key(client_id)
    }

    /// Register a session under its client id, displacing any incumbent.
    /// The incumbent is fully closed (its `clientDisconnected` emitted)
    /// before this returns, so the caller's CONNACK follows the takeover.
    pub(crate) async fn register_client(&self, client_id: &str, handle: ClientHandle) {
        loop {
            let incumbent = {
                let mut clients = self.clients.lock();
                match clients.entry(client_id.to_string()) {
                    Entry::Vacant(slot) => {
                        slot.insert(handle.clone());
                        None
                    }
                    Entry::Occupied(slot) => Some(slot.remove()),
                }
            };
            let Some(incumbent) = incumbent else {
                return;
            };
            tracing::info!("taking over session client_id={}", client_id);
            let (done_tx, done_rx) = oneshot::channel();
            let command = SessionCommand::Close {
                reason: crate::session::CloseReason::Takeover,
                done: Some(done_tx),
            };
            if incumbent.commands.send(command).await.is_ok() {
                let _ = done_rx.await;
            }
        }
    }

    /// Drop the table entry, but only if this session still owns it; a
    /// takeover successor must not be evicted by its predecessor's close.
    pub(crate) fn deregister_client(&self, client_id: &str, serial: u64) {
        let mut clients = self.clients.lock();
        if clients.get(client_id).is_some_and(|h| h.serial == serial) {
            clients.remove(client_id);
        }
    }

    /// Distribute a publish: stamp a dedup id, store it if retained, fan it
    /// out across the fabric, and queue it for matching offline clients.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: Qos,
        retain: bool,
    ) -> Result<(), FabricError> {
        let options = PublishOptions {
            dedup_id: Some(self.next_dedup_id()),
            offline: None,
            qos,
            retain: false,
        };

        if retain {
            let stored = RetainedMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
                qos,
            };
            if let Err(err) = self.persistence.store_retained(stored).await {
                tracing::warn!("retained store failed topic={} err={}", topic, err);
            }
        }

        self.fabric
            .publish(FabricMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
                options,
            })
            .await?;

        if qos >= Qos::AtLeastOnce {
            self.enqueue_for_offline_targets(topic, &payload, qos).await;
        }
        Ok(())
    }

    async fn enqueue_for_offline_targets(&self, topic: &str, payload: &Bytes, qos: Qos) {
        let targets = match self.persistence.offline_targets(topic).await {
            Ok(targets) => targets,
            Err(err) => {
                tracing::warn!("offline target lookup failed topic={} err={}", topic, err);
                return;
            }
        };
        for (client_id, _sub_qos) in targets {
            if self.is_connected(&client_id) {
                continue;
            }
            if let Err(err) = self
                .persistence
                .enqueue_offline(&client_id, topic, payload.clone(), qos)
                .await
            {
                tracing::warn!(
                    "offline enqueue failed client_id={} topic={} err={}",
                    client_id,
                    topic,
                    err
                );
            }
        }
    }

    /// Replay retained messages matching a just-subscribed filter through the
    /// session's normal forwarder path. Deliveries carry no dedup stamp; the
    /// forwarder assigns one on first delivery.
    pub(crate) async fn forward_retained(
        &self,
        filter: &str,
        sub_qos: Qos,
        sink: &mpsc::Sender<Delivery>,
    ) {
        let retained = match self.persistence.matching_retained(filter).await {
            Ok(retained) => retained,
            Err(err) => {
                tracing::warn!("retained lookup failed filter={} err={}", filter, err);
                return;
            }
        };
        for message in retained {
            let delivery = Delivery {
                topic: message.topic,
                payload: message.payload,
                options: PublishOptions {
                    dedup_id: None,
                    offline: None,
                    qos: message.qos,
                    retain: true,
                },
                sub_topic: filter.to_string(),
                sub_qos,
            };
            if sink.try_send(delivery).is_err() {
                tracing::debug!("retained replay dropped filter={}", filter);
            }
        }
    }

    /// Replay queued offline packets for a freshly connected client. Each
    /// delivery carries the stored packet id so the forwarder can re-key it
    /// in persistence before writing.
    pub(crate) async fn forward_offline_packets(
        &self,
        client_id: &str,
        sink: &mpsc::Sender<Delivery>,
    ) {
        let packets = match self.persistence.offline_packets(client_id).await {
            Ok(packets) => packets,
            Err(err) => {
                tracing::warn!("offline replay failed client_id={} err={}", client_id, err);
                return;
            }
        };
        for packet in packets {
            let delivery = Delivery {
                sub_topic: packet.topic.clone(),
                sub_qos: packet.qos,
                topic: packet.topic,
                payload: packet.payload,
                options: PublishOptions {
                    dedup_id: None,
                    offline: Some(packet.message_id),
                    qos: packet.qos,
                    retain: false,
                },
            };
            if sink.try_send(delivery).is_err() {
                // Still queued in persistence; the next connect replays it.
                tracing::debug!("offline replay backlogged client_id={}", client_id);
            }
        }
    }
}

/// Broker construction surface.
pub struct BrokerBuilder {
    config: BrokerConfig,
    fabric: Arc<dyn Fabric>,
    persistence: Arc<dyn Persistence>,
    auth: Arc<dyn AuthHandler>,
}

impl Default for BrokerBuilder {
    fn default() -> Self {
        Self {
            config: BrokerConfig::default(),
            fabric: Arc::new(MemoryFabric::new()),
            persistence: Arc::new(MemoryPersistence::new()),
            auth: Arc::new(AllowAll),
        }
    }
}

impl BrokerBuilder {
    pub fn config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn fabric(mut self, fabric: Arc<dyn Fabric>) -> Self {
        self.fabric = fabric;
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn auth(mut self, auth: Arc<dyn AuthHandler>) -> Self {
        self.auth = auth;
        self
    }

    pub fn build(self) -> Broker<SystemClock> {
        self.build_with_clock(SystemClock)
    }

    pub fn build_with_clock<C: Clock>(self, clock: C) -> Broker<C> {
        let events = EventBus::new(self.config.event_buffer);
        Broker {
            server: Arc::new(Server {
                config: self.config,
                clock,
                fabric: self.fabric,
                persistence: self.persistence,
                auth: self.auth,
                events,
                clients: Mutex::new(HashMap::new()),
                dedup_source: AtomicU64::new(0),
                serials: AtomicU64::new(0),
            }),
        }
    }
}

#[derive(Clone)]
pub struct Broker<C: Clock = SystemClock> {
    server: Arc<Server<C>>,
}

impl Broker<SystemClock> {
    /// In-memory broker with allow-all authorization.
    pub fn new() -> Self {
        BrokerBuilder::default().build()
    }

    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::default()
    }
}

impl Default for Broker<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> Broker<C> {
    pub fn server(&self) -> &Arc<Server<C>> {
        &self.server
    }

    pub fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.server.events.subscribe()
    }

    /// Broker-originated publish (wills, `$SYS` announcements, tooling).
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: Qos,
        retain: bool,
    ) -> Result<(), FabricError> {
        self.server.publish(topic, payload, qos, retain).await
    }

    /// Attach a new transport: spawns the session task and returns the
    /// decoded-packet endpoints for the codec to drive.
    pub fn accept(&self) -> ClientPipe {
        let (packets_in, packets_out) = Session::spawn(Arc::clone(&self.server));
        ClientPipe {
            packets_in,
            packets_out,
        }
    }
}
