//! Fabric failure handling at the session boundary.

mod common;

use async_trait::async_trait;
use common::{TestClient, RECV_TIMEOUT};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use stratus::broker::Broker;
use stratus::events::BrokerEvent;
use stratus::fabric::{Fabric, FabricError, FabricHandler, FabricMessage, HandlerId, MemoryFabric};
use stratus::protocol::{ControlPacket, Qos};
use tokio::time::timeout;

/// Wraps the in-memory fabric with switchable failure injection.
#[derive(Default)]
struct FlakyFabric {
    inner: MemoryFabric,
    fail_subscribe: AtomicBool,
    fail_unsubscribe: AtomicBool,
}

#[async_trait]
impl Fabric for FlakyFabric {
    async fn subscribe(
        &self,
        filter: &str,
        handler: FabricHandler,
    ) -> Result<HandlerId, FabricError> {
        if self.fail_subscribe.load(Ordering::Relaxed) {
            return Err(FabricError::Backend("injected subscribe failure".into()));
        }
        self.inner.subscribe(filter, handler).await
    }

    async fn unsubscribe(&self, filter: &str, handler: HandlerId) -> Result<(), FabricError> {
        if self.fail_unsubscribe.load(Ordering::Relaxed) {
            return Err(FabricError::Backend("injected unsubscribe failure".into()));
        }
        self.inner.unsubscribe(filter, handler).await
    }

    async fn publish(&self, message: FabricMessage) -> Result<(), FabricError> {
        self.inner.publish(message).await
    }
}

#[tokio::test]
async fn unsubscribe_failure_closes_before_unsuback() {
    let fabric = Arc::new(FlakyFabric::default());
    let broker = Broker::builder().fabric(fabric.clone()).build();
    let mut events = broker.events();

    let mut client = TestClient::connect(&broker, "c1", true).await;
    client.subscribe(1, &[("u", Qos::AtMostOnce)]).await;

    fabric.fail_unsubscribe.store(true, Ordering::Relaxed);
    client
        .send(ControlPacket::Unsubscribe(
            stratus::protocol::UnsubscribePacket {
                message_id: 2,
                filters: vec!["u".into()],
            },
        ))
        .await;

    let drained = client.drain_until_closed().await;
    assert!(
        !drained
            .iter()
            .any(|p| matches!(p, ControlPacket::Unsuback { .. })),
        "UNSUBACK must be suppressed once the failure closed the session"
    );

    loop {
        let event = timeout(RECV_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event bus closed");
        if let BrokerEvent::SessionClosed { reason, .. } = event {
            assert_eq!(reason, "fabric error");
            break;
        }
    }
}

#[tokio::test]
async fn subscribe_failure_closes_session() {
    let fabric = Arc::new(FlakyFabric::default());
    let broker = Broker::builder().fabric(fabric.clone()).build();

    let mut client = TestClient::connect(&broker, "c1", true).await;
    fabric.fail_subscribe.store(true, Ordering::Relaxed);

    client
        .send(ControlPacket::Subscribe(common::subscribe_packet(
            1,
            &[("t", Qos::AtMostOnce)],
        )))
        .await;

    let drained = client.drain_until_closed().await;
    assert!(
        !drained
            .iter()
            .any(|p| matches!(p, ControlPacket::Suback { .. })),
        "SUBACK must not follow a failed registration"
    );
}
