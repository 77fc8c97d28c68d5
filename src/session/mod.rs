//! Per-client session state machine.
//!
//! One task per session owns every piece of per-session state: the
//! subscription map, the inflight table, the dedup watermark, and the
//! lifecycle flags. The run loop serializes transport events, fabric
//! deliveries, server commands (takeover), and the keepalive deadline, so no
//! lock is needed on session state. States: awaiting-connect, active,
//! closing, closed.

mod close;
mod forward;

use crate::broker::{ClientHandle, Server};
use crate::core::time::Clock;
use crate::events::BrokerEvent;
use crate::fabric::{Delivery, FabricHandler, HandlerId};
use crate::protocol::{
    return_codes, ConnectPacket, ControlPacket, PublishPacket, Qos, SubscribePacket,
    UnsubscribePacket, Will,
};
use crate::topic;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Poll interval when no keepalive deadline is armed.
const IDLE_POLL: Duration = Duration::from_secs(3600);

/// Events the transport adapter feeds into a session. Dropping the sender
/// signals EOF; EOF without a prior DISCONNECT is an abnormal close.
#[derive(Debug)]
pub enum TransportEvent {
    Packet(ControlPacket),
    Error(String),
}

/// Commands the server can inject into a running session.
#[derive(Debug)]
pub enum SessionCommand {
    Close {
        reason: CloseReason,
        done: Option<oneshot::Sender<()>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    KeepaliveTimeout,
    TooManyInflight,
    Takeover,
    TransportError,
    Protocol,
    NotAuthorized,
    FabricError,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Normal => "normal",
            CloseReason::KeepaliveTimeout => "keepalive timeout",
            CloseReason::TooManyInflight => "too many inflight",
            CloseReason::Takeover => "session taken over",
            CloseReason::TransportError => "transport error",
            CloseReason::Protocol => "protocol violation",
            CloseReason::NotAuthorized => "not authorized",
            CloseReason::FabricError => "fabric error",
        }
    }
}

enum SessionAction {
    Continue,
    Stop,
}

/// A live registration: granted QoS plus the exact fabric handler it was
/// registered under, so UNSUBSCRIBE deregisters the right one.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionEntry {
    pub qos: Qos,
    pub handler: HandlerId,
}

#[derive(Debug, Default)]
pub(crate) struct SessionState {
    client_id: String,
    connected: bool,
    clean: bool,
    keep_alive: u16,
    will: Option<Will>,
    subscriptions: HashMap<String, SubscriptionEntry>,
    inflight: HashMap<u16, PublishPacket>,
    inflight_counter: usize,
    next_mid: u16,
    last_dedup_id: u64,
    closing: bool,
    closed: bool,
}

pub struct Session<C: Clock> {
    server: Arc<Server<C>>,
    serial: u64,
    outbound: mpsc::Sender<ControlPacket>,
    delivery_tx: mpsc::Sender<Delivery>,
    command_tx: mpsc::Sender<SessionCommand>,
    state: SessionState,
}

impl<C: Clock> Session<C> {
    /// Spawn a session task for a freshly accepted transport and hand back
    /// the decoded-packet endpoints.
    pub fn spawn(
        server: Arc<Server<C>>,
    ) -> (mpsc::Sender<TransportEvent>, mpsc::Receiver<ControlPacket>) {
        let transport_buffer = server.config().transport_buffer;
        let delivery_buffer = server.config().delivery_buffer;
        let (transport_tx, transport_rx) = mpsc::channel(transport_buffer);
        let (outbound_tx, outbound_rx) = mpsc::channel(transport_buffer.max(64));
        let (delivery_tx, delivery_rx) = mpsc::channel(delivery_buffer);
        let (command_tx, command_rx) = mpsc::channel(4);

        let session = Session {
            serial: server.next_serial(),
            server,
            outbound: outbound_tx,
            delivery_tx,
            command_tx,
            state: SessionState {
                next_mid: 1,
                ..SessionState::default()
            },
        };
        tokio::spawn(session.run(transport_rx, command_rx, delivery_rx));
        (transport_tx, outbound_rx)
    }

    async fn run(
        mut self,
        mut transport: mpsc::Receiver<TransportEvent>,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut deliveries: mpsc::Receiver<Delivery>,
    ) {
        let clock = self.server.clock().clone();
        let mut last_seen = clock.now();

        loop {
            if self.state.closed {
                break;
            }
            let deadline = if self.state.connected {
                clock.keepalive_deadline(last_seen, self.state.keep_alive)
            } else {
                None
            };
            let sleep_dur = deadline
                .map(|d| d.saturating_duration_since(clock.now()))
                .unwrap_or(IDLE_POLL);

            tokio::select! {
                event = transport.recv() => match event {
                    Some(TransportEvent::Packet(packet)) => {
                        last_seen = clock.now();
                        tracing::trace!(
                            "packet received client_id={} packet={}",
                            self.state.client_id,
                            packet.label()
                        );
                        match self.handle_packet(packet).await {
                            SessionAction::Continue => {}
                            SessionAction::Stop => break,
                        }
                    }
                    Some(TransportEvent::Error(err)) => {
                        tracing::warn!(
                            "transport error client_id={} err={}",
                            self.state.client_id,
                            err
                        );
                        self.schedule_will();
                        self.close(CloseReason::TransportError).await;
                        break;
                    }
                    None => {
                        // EOF. Without a prior DISCONNECT this is abnormal
                        // and the will goes out.
                        if self.state.connected && !self.state.closing {
                            self.schedule_will();
                        }
                        self.close(CloseReason::TransportError).await;
                        break;
                    }
                },
                Some(delivery) = deliveries.recv() => {
                    self.forward(delivery).await;
                }
                Some(command) = commands.recv() => match command {
                    SessionCommand::Close { reason, done } => {
                        self.close(reason).await;
                        if let Some(done) = done {
                            let _ = done.send(());
                        }
                        break;
                    }
                },
                _ = clock.sleep(sleep_dur) => {
                    if let Some(deadline) = deadline {
                        if clock.now() >= deadline {
                            tracing::warn!(
                                "keepalive timeout client_id={} keep_alive={}",
                                self.state.client_id,
                                self.state.keep_alive
                            );
                            self.schedule_will();
                            self.close(CloseReason::KeepaliveTimeout).await;
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn handle_packet(&mut self, packet: ControlPacket) -> SessionAction {
        if !self.state.connected {
            return match packet {
                ControlPacket::Connect(connect) => self.handle_connect(connect).await,
                other => {
                    tracing::warn!("{} before CONNECT", other.label());
                    self.close(CloseReason::Protocol).await;
                    SessionAction::Stop
                }
            };
        }

        match packet {
            ControlPacket::Connect(_) => {
                tracing::warn!(
                    "duplicate CONNECT client_id={}",
                    self.state.client_id
                );
                self.schedule_will();
                self.close(CloseReason::Protocol).await;
                SessionAction::Stop
            }
            ControlPacket::Publish(publish) => self.handle_publish(publish).await,
            ControlPacket::Puback { message_id } => {
                self.handle_puback(message_id).await;
                SessionAction::Continue
            }
            ControlPacket::Subscribe(subscribe) => self.handle_subscribe(subscribe).await,
            ControlPacket::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(unsubscribe).await
            }
            ControlPacket::Pingreq => {
                self.write(ControlPacket::Pingresp).await;
                SessionAction::Continue
            }
            ControlPacket::Disconnect => {
                // Normal termination: the will is discarded, not delivered.
                self.state.will = None;
                self.close(CloseReason::Normal).await;
                SessionAction::Stop
            }
            other => {
                tracing::warn!(
                    "unexpected {} from client_id={}",
                    other.label(),
                    self.state.client_id
                );
                self.schedule_will();
                self.close(CloseReason::Protocol).await;
                SessionAction::Stop
            }
        }
    }

    async fn handle_connect(&mut self, mut connect: ConnectPacket) -> SessionAction {
        if connect.client_id.is_empty() {
            if !connect.clean {
                // A persistent session needs a stable identity.
                self.write(ControlPacket::Connack {
                    session_present: false,
                    return_code: return_codes::IDENTIFIER_REJECTED,
                })
                .await;
                self.close(CloseReason::Protocol).await;
                return SessionAction::Stop;
            }
            connect.client_id = format!("auto-{}", Uuid::new_v4());
            tracing::info!("assigned client_id={}", connect.client_id);
        }

        self.state.client_id = connect.client_id;
        self.state.clean = connect.clean;
        self.state.keep_alive = connect.keep_alive;
        self.state.will = connect.will.take().map(|mut will| {
            will.topic = topic::normalize(&will.topic);
            will
        });

        match self
            .server
            .auth()
            .authenticate(
                &self.state.client_id,
                connect.username.as_deref(),
                connect.password.as_deref(),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    "authentication denied client_id={}",
                    self.state.client_id
                );
                self.write(ControlPacket::Connack {
                    session_present: false,
                    return_code: return_codes::NOT_AUTHORIZED,
                })
                .await;
                self.state.will = None;
                self.close(CloseReason::NotAuthorized).await;
                return SessionAction::Stop;
            }
            Err(err) => {
                tracing::warn!(
                    "authentication error client_id={} err={}",
                    self.state.client_id,
                    err
                );
                self.state.will = None;
                self.close(CloseReason::NotAuthorized).await;
                return SessionAction::Stop;
            }
        }

        // Takeover is a prerequisite of CONNACK: any incumbent under this id
        // is fully closed before the handshake completes.
        self.server
            .register_client(
                &self.state.client_id,
                ClientHandle {
                    serial: self.serial,
                    commands: self.command_tx.clone(),
                },
            )
            .await;

        let mut session_present = false;
        if self.state.clean {
            // A clean start discards whatever an earlier incarnation left.
            if let Err(err) = self
                .server
                .persistence()
                .persist_client(&self.state.client_id, true, &[])
                .await
            {
                tracing::warn!(
                    "session wipe failed client_id={} err={}",
                    self.state.client_id,
                    err
                );
            }
        } else {
            match self
                .server
                .persistence()
                .restore_subscriptions(&self.state.client_id)
                .await
            {
                Ok(stored) => {
                    for sub in stored {
                        let handler = FabricHandler {
                            sub_topic: sub.filter.clone(),
                            sub_qos: sub.qos,
                            sink: self.delivery_tx.clone(),
                        };
                        match self.server.fabric().subscribe(&sub.filter, handler).await {
                            Ok(handler) => {
                                session_present = true;
                                self.state.subscriptions.insert(
                                    sub.filter,
                                    SubscriptionEntry {
                                        qos: sub.qos,
                                        handler,
                                    },
                                );
                            }
                            Err(err) => {
                                tracing::warn!(
                                    "subscription restore failed client_id={} filter={} err={}",
                                    self.state.client_id,
                                    sub.filter,
                                    err
                                );
                            }
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        "subscription restore failed client_id={} err={}",
                        self.state.client_id,
                        err
                    );
                }
            }
        }

        self.write(ControlPacket::Connack {
            session_present,
            return_code: return_codes::ACCEPTED,
        })
        .await;
        self.state.connected = true;
        tracing::info!(
            "CONNECT accepted client_id={} clean={} keep_alive={}",
            self.state.client_id,
            self.state.clean,
            self.state.keep_alive
        );
        self.server.events().emit(BrokerEvent::ClientConnected {
            client_id: self.state.client_id.clone(),
        });

        self.server
            .forward_offline_packets(&self.state.client_id, &self.delivery_tx)
            .await;
        SessionAction::Continue
    }

    async fn handle_subscribe(&mut self, packet: SubscribePacket) -> SessionAction {
        let requested: Vec<(String, Qos)> = packet
            .requests
            .iter()
            .map(|r| (topic::normalize(&r.filter), r.qos.granted()))
            .collect();

        let mut granted = Vec::with_capacity(requested.len());
        let mut fresh: Vec<(String, Qos)> = Vec::new();
        for (filter, qos) in &requested {
            granted.push(*qos);
            if let Some(entry) = self.state.subscriptions.get_mut(filter) {
                // Re-subscription updates the stored grant in place.
                entry.qos = *qos;
                continue;
            }
            if !fresh.iter().any(|(f, _)| f == filter) {
                fresh.push((filter.clone(), *qos));
            }
        }

        for (filter, _) in &fresh {
            match self
                .server
                .auth()
                .authorize_subscribe(&self.state.client_id, filter)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(
                        "subscribe denied client_id={} filter={}",
                        self.state.client_id,
                        filter
                    );
                    self.close(CloseReason::NotAuthorized).await;
                    return SessionAction::Stop;
                }
                Err(err) => {
                    tracing::warn!(
                        "subscribe authorization error client_id={} filter={} err={}",
                        self.state.client_id,
                        filter,
                        err
                    );
                    self.close(CloseReason::NotAuthorized).await;
                    return SessionAction::Stop;
                }
            }
        }

        for (filter, qos) in fresh {
            let handler = FabricHandler {
                sub_topic: filter.clone(),
                sub_qos: qos,
                sink: self.delivery_tx.clone(),
            };
            match self.server.fabric().subscribe(&filter, handler).await {
                Ok(handler) => {
                    self.state
                        .subscriptions
                        .insert(filter, SubscriptionEntry { qos, handler });
                }
                Err(err) => {
                    tracing::warn!(
                        "fabric subscribe failed client_id={} filter={} err={}",
                        self.state.client_id,
                        filter,
                        err
                    );
                    self.close(CloseReason::FabricError).await;
                    return SessionAction::Stop;
                }
            }
        }

        // Retained replays and events cover every requested filter, including
        // re-subscriptions; they ride the forwarder path, so their transport
        // ordering relative to the SUBACK below is not guaranteed.
        for (filter, _) in &requested {
            let sub_qos = self
                .state
                .subscriptions
                .get(filter)
                .map_or(Qos::AtMostOnce, |e| e.qos);
            self.server
                .forward_retained(filter, sub_qos, &self.delivery_tx)
                .await;
            self.server.events().emit(BrokerEvent::Subscribed {
                client_id: self.state.client_id.clone(),
                filter: filter.clone(),
                qos: sub_qos,
            });
        }

        self.write(ControlPacket::Suback {
            message_id: packet.message_id,
            granted,
        })
        .await;
        SessionAction::Continue
    }

    async fn handle_unsubscribe(&mut self, packet: UnsubscribePacket) -> SessionAction {
        let targets: Vec<(String, Option<HandlerId>)> = packet
            .filters
            .iter()
            .map(|f| {
                let filter = topic::normalize(f);
                let handler = self.state.subscriptions.get(&filter).map(|e| e.handler);
                (filter, handler)
            })
            .collect();

        let unsubs = targets.iter().map(|(filter, handler)| {
            let fabric = Arc::clone(self.server.fabric());
            async move {
                match handler {
                    Some(handler) => fabric.unsubscribe(filter, *handler).await,
                    None => Ok(()),
                }
            }
        });
        let results = futures::future::join_all(unsubs).await;

        let mut failed = false;
        for ((filter, handler), result) in targets.iter().zip(results) {
            match result {
                Err(err) => {
                    tracing::warn!(
                        "fabric unsubscribe failed client_id={} filter={} err={}",
                        self.state.client_id,
                        filter,
                        err
                    );
                    failed = true;
                }
                Ok(()) => {
                    if handler.is_some() && !(self.state.closing && !self.state.clean) {
                        self.state.subscriptions.remove(filter);
                        self.server.events().emit(BrokerEvent::Unsubscribed {
                            client_id: self.state.client_id.clone(),
                            filter: filter.clone(),
                        });
                    }
                }
            }
        }

        if failed {
            self.close(CloseReason::FabricError).await;
        }
        // Always attempted; suppressed by the closed-write guard after a
        // failure-induced close.
        self.write(ControlPacket::Unsuback {
            message_id: packet.message_id,
        })
        .await;
        if failed {
            SessionAction::Stop
        } else {
            SessionAction::Continue
        }
    }

    async fn handle_publish(&mut self, packet: PublishPacket) -> SessionAction {
        let topic = topic::normalize(&packet.topic);
        match self
            .server
            .auth()
            .authorize_publish(&self.state.client_id, &topic, &packet.payload)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    "publish denied client_id={} topic={}",
                    self.state.client_id,
                    topic
                );
                self.close(CloseReason::NotAuthorized).await;
                return SessionAction::Stop;
            }
            Err(err) => {
                tracing::warn!(
                    "publish authorization error client_id={} topic={} err={}",
                    self.state.client_id,
                    topic,
                    err
                );
                self.close(CloseReason::NotAuthorized).await;
                return SessionAction::Stop;
            }
        }

        if let Err(err) = self
            .server
            .publish(&topic, packet.payload.clone(), packet.qos, packet.retain)
            .await
        {
            tracing::warn!(
                "publish distribution failed client_id={} topic={} err={}",
                self.state.client_id,
                topic,
                err
            );
            self.close(CloseReason::FabricError).await;
            return SessionAction::Stop;
        }

        if packet.qos == Qos::AtLeastOnce && !self.state.closing {
            if let Some(message_id) = packet.message_id {
                self.write(ControlPacket::Puback { message_id }).await;
            }
        }
        SessionAction::Continue
    }

    async fn handle_puback(&mut self, message_id: u16) {
        if self.state.inflight.remove(&message_id).is_some() {
            self.state.inflight_counter -= 1;
            debug_assert_eq!(self.state.inflight_counter, self.state.inflight.len());
            // Offline cleanup failures are logged and swallowed; the session
            // keeps running.
            if let Err(err) = self
                .server
                .persistence()
                .delete_offline_packet(&self.state.client_id, message_id)
                .await
            {
                tracing::warn!(
                    "offline cleanup failed client_id={} message_id={} err={}",
                    self.state.client_id,
                    message_id,
                    err
                );
            }
        } else {
            tracing::debug!(
                "puback for unknown message_id={} client_id={}",
                message_id,
                self.state.client_id
            );
        }
    }

    /// Write a packet to the transport unless the session is already closed.
    async fn write(&mut self, packet: ControlPacket) {
        if self.state.closed {
            return;
        }
        if self.outbound.send(packet).await.is_err() {
            tracing::debug!(
                "transport gone while writing client_id={}",
                self.state.client_id
            );
        }
    }
}
