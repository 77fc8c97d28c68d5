//! Common test harness utilities for integration tests.
//!
//! Drives sessions through the decoded-packet transport seam: a `TestClient`
//! plays the role of the codec, feeding packets in and asserting on packets
//! out. All helpers use only existing dev-dependencies.

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use bytes::Bytes;
use std::time::Duration;
use stratus::broker::{Broker, ClientPipe};
use stratus::protocol::{
    return_codes, ConnectPacket, ControlPacket, PublishPacket, Qos, SubscribePacket,
    SubscriptionRequest, UnsubscribePacket, Will,
};
use stratus::session::TransportEvent;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);
pub const SILENCE_WINDOW: Duration = Duration::from_millis(200);

pub struct TestClient {
    tx: mpsc::Sender<TransportEvent>,
    rx: mpsc::Receiver<ControlPacket>,
}

impl TestClient {
    /// Attach a raw transport without completing the MQTT handshake.
    pub fn attach(broker: &Broker) -> Self {
        let ClientPipe {
            packets_in,
            packets_out,
        } = broker.accept();
        Self {
            tx: packets_in,
            rx: packets_out,
        }
    }

    /// Attach and complete a CONNECT/CONNACK handshake.
    pub async fn connect(broker: &Broker, client_id: &str, clean: bool) -> Self {
        Self::connect_with(broker, connect_packet(client_id, clean)).await
    }

    pub async fn connect_with(broker: &Broker, connect: ConnectPacket) -> Self {
        let mut client = Self::attach(broker);
        client.send(ControlPacket::Connect(connect)).await;
        match client.recv().await {
            ControlPacket::Connack { return_code, .. } => {
                assert_eq!(return_code, return_codes::ACCEPTED);
            }
            other => panic!("expected CONNACK, got {other:?}"),
        }
        client
    }

    pub async fn send(&self, packet: ControlPacket) {
        self.tx
            .send(TransportEvent::Packet(packet))
            .await
            .expect("session gone");
    }

    /// Inject a transport error; the session treats it as an abnormal close.
    pub async fn fail(&self, reason: &str) {
        let _ = self
            .tx
            .send(TransportEvent::Error(reason.to_string()))
            .await;
    }

    pub async fn recv(&mut self) -> ControlPacket {
        timeout(RECV_TIMEOUT, self.rx.recv())
            .await
            .expect("timed out waiting for packet")
            .expect("transport closed")
    }

    pub async fn recv_publish(&mut self) -> PublishPacket {
        match self.recv().await {
            ControlPacket::Publish(publish) => publish,
            other => panic!("expected PUBLISH, got {other:?}"),
        }
    }

    /// Assert nothing arrives within a short window.
    pub async fn expect_silence(&mut self) {
        match timeout(SILENCE_WINDOW, self.rx.recv()).await {
            Err(_) | Ok(None) => {}
            Ok(Some(packet)) => panic!("unexpected packet {packet:?}"),
        }
    }

    /// Wait for the session to end the transport, returning anything that
    /// was still in flight.
    pub async fn drain_until_closed(&mut self) -> Vec<ControlPacket> {
        let mut drained = Vec::new();
        loop {
            match timeout(RECV_TIMEOUT, self.rx.recv()).await {
                Ok(None) => return drained,
                Ok(Some(packet)) => drained.push(packet),
                Err(_) => panic!("session did not close the transport"),
            }
        }
    }

    /// Wait for the session to end the transport, draining stragglers.
    pub async fn expect_closed(&mut self) {
        loop {
            match timeout(RECV_TIMEOUT, self.rx.recv()).await {
                Ok(None) => return,
                Ok(Some(_)) => {}
                Err(_) => panic!("session did not close the transport"),
            }
        }
    }

    /// SUBSCRIBE and return the granted vector from the SUBACK.
    pub async fn subscribe(&mut self, message_id: u16, filters: &[(&str, Qos)]) -> Vec<Qos> {
        self.send(ControlPacket::Subscribe(subscribe_packet(message_id, filters)))
            .await;
        loop {
            match self.recv().await {
                ControlPacket::Suback {
                    message_id: mid,
                    granted,
                } => {
                    assert_eq!(mid, message_id);
                    return granted;
                }
                // Deliveries already in flight may interleave ahead.
                ControlPacket::Publish(_) => {}
                other => panic!("expected SUBACK, got {other:?}"),
            }
        }
    }

    pub async fn unsubscribe(&mut self, message_id: u16, filters: &[&str]) {
        self.send(ControlPacket::Unsubscribe(UnsubscribePacket {
            message_id,
            filters: filters.iter().map(|f| f.to_string()).collect(),
        }))
        .await;
        match self.recv().await {
            ControlPacket::Unsuback { message_id: mid } => assert_eq!(mid, message_id),
            other => panic!("expected UNSUBACK, got {other:?}"),
        }
    }

    /// PUBLISH and, for QoS 1, wait for the broker's PUBACK.
    pub async fn publish(&mut self, topic: &str, payload: &[u8], qos: Qos, message_id: Option<u16>) {
        self.send(ControlPacket::Publish(publish_packet(
            topic, payload, qos, message_id,
        )))
        .await;
        if qos == Qos::AtLeastOnce {
            match self.recv().await {
                ControlPacket::Puback { message_id: mid } => assert_eq!(Some(mid), message_id),
                other => panic!("expected PUBACK, got {other:?}"),
            }
        }
    }

    pub async fn puback(&self, message_id: u16) {
        self.send(ControlPacket::Puback { message_id }).await;
    }

    /// Graceful DISCONNECT; the will must not fire.
    pub async fn disconnect(self) {
        self.send(ControlPacket::Disconnect).await;
    }
}

pub fn connect_packet(client_id: &str, clean: bool) -> ConnectPacket {
    ConnectPacket {
        client_id: client_id.to_string(),
        username: None,
        password: None,
        keep_alive: 0,
        clean,
        will: None,
    }
}

pub fn publish_packet(
    topic: &str,
    payload: &[u8],
    qos: Qos,
    message_id: Option<u16>,
) -> PublishPacket {
    PublishPacket {
        topic: topic.to_string(),
        payload: Bytes::copy_from_slice(payload),
        qos,
        message_id,
        retain: false,
        dup: false,
    }
}

pub fn subscribe_packet(message_id: u16, filters: &[(&str, Qos)]) -> SubscribePacket {
    SubscribePacket {
        message_id,
        requests: filters
            .iter()
            .map(|(filter, qos)| SubscriptionRequest {
                filter: filter.to_string(),
                qos: *qos,
            })
            .collect(),
    }
}

pub fn will(topic: &str, payload: &[u8], qos: Qos) -> Will {
    Will {
        topic: topic.to_string(),
        payload: Bytes::copy_from_slice(payload),
        qos,
        retain: false,
    }
}
