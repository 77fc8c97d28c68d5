//! The close coordinator: idempotent two-phase teardown, and last-will
//! scheduling for abnormal terminations.

use super::{CloseReason, Session};
use crate::core::time::Clock;
use crate::events::BrokerEvent;
use crate::fabric::HandlerId;
use crate::persistence::StoredSubscription;
use futures::future::join_all;
use std::sync::Arc;

impl<C: Clock> Session<C> {
    /// Idempotent teardown. `closing` flips first so every in-flight
    /// continuation observes the transition and stops writing; `closed` is
    /// terminal. The keepalive watchdog dies with the run loop.
    pub(super) async fn close(&mut self, reason: CloseReason) {
        if self.state.closed || self.state.closing {
            return;
        }
        self.state.closing = true;
        tracing::info!(
            "closing session client_id={} reason={}",
            self.state.client_id,
            reason.as_str()
        );

        // Deregister every subscription from the fabric in parallel. Errors
        // no longer matter at this point; the handlers die with the session.
        let registrations: Vec<(String, HandlerId)> = self
            .state
            .subscriptions
            .iter()
            .map(|(filter, entry)| (filter.clone(), entry.handler))
            .collect();
        let unsubs = registrations.iter().map(|(filter, handler)| {
            let fabric = Arc::clone(self.server.fabric());
            async move { fabric.unsubscribe(filter, *handler).await }
        });
        for ((filter, _), result) in registrations.iter().zip(join_all(unsubs).await) {
            if let Err(err) = result {
                tracing::debug!(
                    "unsubscribe during close failed filter={} err={}",
                    filter,
                    err
                );
            }
        }

        if self.state.connected {
            let stored: Vec<StoredSubscription> = if self.state.clean {
                Vec::new()
            } else {
                self.state
                    .subscriptions
                    .iter()
                    .map(|(filter, entry)| StoredSubscription {
                        filter: filter.clone(),
                        qos: entry.qos,
                    })
                    .collect()
            };
            if let Err(err) = self
                .server
                .persistence()
                .persist_client(&self.state.client_id, self.state.clean, &stored)
                .await
            {
                tracing::warn!(
                    "session persist failed client_id={} err={}",
                    self.state.client_id,
                    err
                );
            }
        }

        self.state.closed = true;

        if self.state.connected {
            self.server.events().emit(BrokerEvent::SessionClosed {
                client_id: self.state.client_id.clone(),
                reason: reason.as_str().to_string(),
            });
            self.server
                .deregister_client(&self.state.client_id, self.serial);
            self.server.events().emit(BrokerEvent::ClientDisconnected {
                client_id: self.state.client_id.clone(),
            });
        }
        // The transport ends when the run loop returns and the outbound
        // sender drops.
    }

    /// Schedule last-will delivery ahead of an abnormal close. The publish
    /// is deferred one scheduler tick so it cannot race a still-registered
    /// self; the forwarder's closing gate suppresses self-delivery besides.
    pub(super) fn schedule_will(&mut self) {
        let Some(will) = self.state.will.take() else {
            return;
        };
        let server = Arc::clone(&self.server);
        let client_id = self.state.client_id.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            tracing::info!(
                "delivering will client_id={} topic={}",
                client_id,
                will.topic
            );
            if let Err(err) = server
                .publish(&will.topic, will.payload, will.qos, will.retain)
                .await
            {
                tracing::warn!("will delivery failed client_id={} err={}", client_id, err);
            }
        });
    }
}
