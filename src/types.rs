use crate::constants::protocol;
use crate::packet::publish::PublishPacket;
use crate::QoS;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Protocol revision negotiated by CONNECT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// MQTT 3.1 (`MQIsdp`, level 3)
    V31,
    /// MQTT 3.1.1 (`MQTT`, level 4)
    V311,
}

impl ProtocolVersion {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ProtocolVersion::V31 => protocol::NAME_V31,
            ProtocolVersion::V311 => protocol::NAME_V311,
        }
    }

    #[must_use]
    pub fn level(self) -> u8 {
        match self {
            ProtocolVersion::V31 => protocol::LEVEL_V31,
            ProtocolVersion::V311 => protocol::LEVEL_V311,
        }
    }

    /// Maps a protocol name to the revision it announces, ignoring the level byte
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            protocol::NAME_V31 => Some(ProtocolVersion::V31),
            protocol::NAME_V311 => Some(ProtocolVersion::V311),
            _ => None,
        }
    }
}

/// An application message travelling through the broker
///
/// Created from an inbound PUBLISH or a will, copied into each matching
/// subscriber's outbound queue and dropped once delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Assigned by the delivering session for `QoS` >= 1
    pub packet_id: Option<u16>,
}

impl Message {
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
            dup: false,
            packet_id: None,
        }
    }

    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

impl From<PublishPacket> for Message {
    fn from(packet: PublishPacket) -> Self {
        Self {
            topic: packet.topic_name,
            payload: packet.payload,
            qos: packet.qos,
            retain: packet.retain,
            dup: packet.dup,
            packet_id: packet.packet_id,
        }
    }
}

/// Last will carried by CONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl WillMessage {
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    #[must_use]
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    #[must_use]
    pub fn to_message(&self) -> Message {
        Message::new(self.topic.clone(), self.payload.clone(), self.qos).with_retain(self.retain)
    }
}
