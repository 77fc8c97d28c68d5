//! Decoded MQTT 3.1/3.1.1 control-packet types.
//!
//! The transport listener and the wire codec live outside this crate; sessions
//! consume packets that have already been decoded and emit packets for the
//! codec to serialize. Only the fields the session core reads are modeled.

use bytes::Bytes;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    /// QoS granted on subscribe: this broker supports QoS 0/1 only, so a
    /// requested QoS 2 is downgraded to 1.
    pub fn granted(self) -> Qos {
        match self {
            Qos::AtMostOnce => Qos::AtMostOnce,
            Qos::AtLeastOnce | Qos::ExactlyOnce => Qos::AtLeastOnce,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

/// CONNACK return codes used by this core.
pub mod return_codes {
    pub const ACCEPTED: u8 = 0x00;
    pub const IDENTIFIER_REJECTED: u8 = 0x02;
    pub const NOT_AUTHORIZED: u8 = 0x05;
}

/// Last-will announcement carried on CONNECT. The topic is normalized on
/// receipt, before the will is stored on the session.
#[derive(Debug, Clone)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    pub retain: bool,
}

#[derive(Debug, Clone)]
pub struct ConnectPacket {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub keep_alive: u16,
    pub clean: bool,
    pub will: Option<Will>,
}

#[derive(Debug, Clone)]
pub struct PublishPacket {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    pub message_id: Option<u16>,
    pub retain: bool,
    pub dup: bool,
}

#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub filter: String,
    pub qos: Qos,
}

#[derive(Debug, Clone)]
pub struct SubscribePacket {
    pub message_id: u16,
    pub requests: Vec<SubscriptionRequest>,
}

#[derive(Debug, Clone)]
pub struct UnsubscribePacket {
    pub message_id: u16,
    pub filters: Vec<String>,
}

/// A decoded control packet, in either direction. Sessions receive the
/// client-to-broker variants and emit the broker-to-client ones.
#[derive(Debug, Clone)]
pub enum ControlPacket {
    Connect(ConnectPacket),
    Connack {
        session_present: bool,
        return_code: u8,
    },
    Publish(PublishPacket),
    Puback {
        message_id: u16,
    },
    Subscribe(SubscribePacket),
    Suback {
        message_id: u16,
        granted: Vec<Qos>,
    },
    Unsubscribe(UnsubscribePacket),
    Unsuback {
        message_id: u16,
    },
    Pingreq,
    Pingresp,
    Disconnect,
}

impl ControlPacket {
    pub fn label(&self) -> &'static str {
        match self {
            ControlPacket::Connect(_) => "connect",
            ControlPacket::Connack { .. } => "connack",
            ControlPacket::Publish(_) => "publish",
            ControlPacket::Puback { .. } => "puback",
            ControlPacket::Subscribe(_) => "subscribe",
            ControlPacket::Suback { .. } => "suback",
            ControlPacket::Unsubscribe(_) => "unsubscribe",
            ControlPacket::Unsuback { .. } => "unsuback",
            ControlPacket::Pingreq => "pingreq",
            ControlPacket::Pingresp => "pingresp",
            ControlPacket::Disconnect => "disconnect",
        }
    }
}
