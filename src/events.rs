//! Broker lifecycle events.
//!
//! Sessions emit events through the server's `EventBus`; observers subscribe
//! to a broadcast receiver. Emission also logs a `tracing` event so the
//! lifecycle is visible without an attached observer, and a send with no
//! subscribers is not an error.

use crate::protocol::Qos;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    ClientConnected {
        client_id: String,
    },
    ClientDisconnected {
        client_id: String,
    },
    Subscribed {
        client_id: String,
        filter: String,
        qos: Qos,
    },
    Unsubscribed {
        client_id: String,
        filter: String,
    },
    SessionClosed {
        client_id: String,
        reason: String,
    },
}

impl BrokerEvent {
    pub fn label(&self) -> &'static str {
        match self {
            BrokerEvent::ClientConnected { .. } => "client_connected",
            BrokerEvent::ClientDisconnected { .. } => "client_disconnected",
            BrokerEvent::Subscribed { .. } => "subscribed",
            BrokerEvent::Unsubscribed { .. } => "unsubscribed",
            BrokerEvent::SessionClosed { .. } => "session_closed",
        }
    }

    pub fn client_id(&self) -> &str {
        match self {
            BrokerEvent::ClientConnected { client_id }
            | BrokerEvent::ClientDisconnected { client_id }
            | BrokerEvent::Subscribed { client_id, .. }
            | BrokerEvent::Unsubscribed { client_id, .. }
            | BrokerEvent::SessionClosed { client_id, .. } => client_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BrokerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: BrokerEvent) {
        tracing::debug!(
            "broker event {} client_id={}",
            event.label(),
            event.client_id()
        );
        let _ = self.tx.send(event);
    }
}
