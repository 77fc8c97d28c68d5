//! Authentication and authorization gates at the session boundary.

mod common;

use async_trait::async_trait;
use common::{connect_packet, publish_packet, subscribe_packet, TestClient, RECV_TIMEOUT};
use std::sync::Arc;
use stratus::auth::{AuthError, AuthHandler, StaticCredentials};
use stratus::broker::Broker;
use stratus::events::BrokerEvent;
use stratus::protocol::{return_codes, ControlPacket, Qos};
use tokio::time::timeout;

/// Denies authentication outright.
struct DenyConnect;

#[async_trait]
impl AuthHandler for DenyConnect {
    async fn authenticate(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> Result<bool, AuthError> {
        Ok(false)
    }

    async fn authorize_publish(
        &self,
        _client_id: &str,
        _topic: &str,
        _payload: &[u8],
    ) -> Result<bool, AuthError> {
        Ok(true)
    }

    async fn authorize_subscribe(
        &self,
        _client_id: &str,
        _filter: &str,
    ) -> Result<bool, AuthError> {
        Ok(true)
    }
}

/// Lets everyone in but fences off a topic prefix.
struct FencedTopics;

#[async_trait]
impl AuthHandler for FencedTopics {
    async fn authenticate(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> Result<bool, AuthError> {
        Ok(true)
    }

    async fn authorize_publish(
        &self,
        _client_id: &str,
        topic: &str,
        _payload: &[u8],
    ) -> Result<bool, AuthError> {
        Ok(!topic.starts_with("secret/"))
    }

    async fn authorize_subscribe(&self, _client_id: &str, filter: &str) -> Result<bool, AuthError> {
        Ok(!filter.starts_with("secret/"))
    }
}

#[tokio::test]
async fn denied_connect_gets_connack_5() {
    let broker = Broker::builder().auth(Arc::new(DenyConnect)).build();
    let mut client = TestClient::attach(&broker);

    client
        .send(ControlPacket::Connect(connect_packet("c1", true)))
        .await;
    match client.recv().await {
        ControlPacket::Connack { return_code, .. } => {
            assert_eq!(return_code, return_codes::NOT_AUTHORIZED);
        }
        other => panic!("expected CONNACK, got {other:?}"),
    }
    client.expect_closed().await;
}

#[tokio::test]
async fn denied_subscribe_closes_without_suback() {
    let broker = Broker::builder().auth(Arc::new(FencedTopics)).build();
    let mut events = broker.events();
    let mut client = TestClient::connect(&broker, "c1", true).await;

    client
        .send(ControlPacket::Subscribe(subscribe_packet(
            1,
            &[("ok/topic", Qos::AtMostOnce), ("secret/x", Qos::AtMostOnce)],
        )))
        .await;

    let drained = client.drain_until_closed().await;
    assert!(
        !drained
            .iter()
            .any(|p| matches!(p, ControlPacket::Suback { .. })),
        "SUBACK must not be sent on a denied SUBSCRIBE"
    );

    loop {
        let event = timeout(RECV_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event bus closed");
        if let BrokerEvent::SessionClosed { reason, .. } = event {
            assert_eq!(reason, "not authorized");
            break;
        }
    }
}

#[tokio::test]
async fn denied_publish_closes_without_puback() {
    let broker = Broker::builder().auth(Arc::new(FencedTopics)).build();
    let mut client = TestClient::connect(&broker, "c1", true).await;

    client
        .send(ControlPacket::Publish(publish_packet(
            "secret/launch",
            b"now",
            Qos::AtLeastOnce,
            Some(1),
        )))
        .await;

    let drained = client.drain_until_closed().await;
    assert!(
        !drained
            .iter()
            .any(|p| matches!(p, ControlPacket::Puback { .. })),
        "PUBACK must not be sent on a denied PUBLISH"
    );
}

#[tokio::test]
async fn static_credentials_gate_connect() {
    let credentials = StaticCredentials::new();
    credentials.add_user("alice", b"secret");
    let broker = Broker::builder().auth(Arc::new(credentials)).build();

    let mut good = connect_packet("c1", true);
    good.username = Some("alice".into());
    good.password = Some(bytes::Bytes::from_static(b"secret"));
    let _client = TestClient::connect_with(&broker, good).await;

    let mut bad = connect_packet("c2", true);
    bad.username = Some("alice".into());
    bad.password = Some(bytes::Bytes::from_static(b"nope"));
    let mut rejected = TestClient::attach(&broker);
    rejected.send(ControlPacket::Connect(bad)).await;
    match rejected.recv().await {
        ControlPacket::Connack { return_code, .. } => {
            assert_eq!(return_code, return_codes::NOT_AUTHORIZED);
        }
        other => panic!("expected CONNACK, got {other:?}"),
    }
}
