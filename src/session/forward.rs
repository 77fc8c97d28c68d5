//! The forwarder: the per-subscription path every fabric delivery takes
//! before reaching the transport.

use super::{CloseReason, Session};
use crate::core::time::Clock;
use crate::fabric::Delivery;
use crate::protocol::{ControlPacket, PublishPacket, Qos};
use crate::topic;

impl<C: Clock> Session<C> {
    /// Handle one delivery from the fabric. The dedup check runs on entry,
    /// but the watermark is only recorded at the write: a copy dropped by a
    /// gate must not suppress the same message arriving through another
    /// subscription (a root wildcard swallowing the `$SYS/#` copy, say).
    pub(super) async fn forward(&mut self, mut delivery: Delivery) {
        if let Some(id) = delivery.options.dedup_id {
            if id <= self.state.last_dedup_id {
                return;
            }
        }

        if self.state.closed || self.state.closing {
            return;
        }

        if self.state.inflight_counter >= self.server.config().max_inflight_messages {
            tracing::warn!(
                "too many inflight client_id={} inflight={}",
                self.state.client_id,
                self.state.inflight_counter
            );
            self.close(CloseReason::TooManyInflight).await;
            return;
        }

        if topic::sys_shielded(&delivery.sub_topic, &delivery.topic) {
            return;
        }

        // First delivery wins: an unstamped delivery is always accepted and
        // stamps itself from the server source before the watermark moves.
        let dedup_id = match delivery.options.dedup_id {
            Some(id) => id,
            None => {
                let id = self.server.next_dedup_id();
                delivery.options.dedup_id = Some(id);
                id
            }
        };
        self.state.last_dedup_id = dedup_id;

        let message_id = self.next_mid();

        if let Some(stored_id) = delivery.options.offline {
            // Re-key the stored packet before the write so the eventual
            // PUBACK can delete it.
            if let Err(err) = self
                .server
                .persistence()
                .update_offline_packet(&self.state.client_id, stored_id, message_id)
                .await
            {
                tracing::warn!(
                    "offline re-key failed client_id={} stored_id={} err={}",
                    self.state.client_id,
                    stored_id,
                    err
                );
            }
        }

        let qos = delivery.sub_qos;
        let packet = PublishPacket {
            topic: delivery.topic,
            payload: delivery.payload,
            qos,
            message_id: (qos == Qos::AtLeastOnce).then_some(message_id),
            retain: delivery.options.retain,
            dup: false,
        };

        if qos == Qos::AtLeastOnce {
            self.state.inflight.insert(message_id, packet.clone());
            self.state.inflight_counter += 1;
        }
        debug_assert_eq!(self.state.inflight_counter, self.state.inflight.len());
        self.write(ControlPacket::Publish(packet)).await;
    }

    /// Outbound packet ids are monotone 16-bit, wrapping past the top and
    /// never landing on 0.
    fn next_mid(&mut self) -> u16 {
        let mid = self.state.next_mid;
        self.state.next_mid = if mid == u16::MAX { 1 } else { mid + 1 };
        mid
    }
}
