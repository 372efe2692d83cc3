use crate::encoding::{decode_string, encode_string};
use crate::error::{MqttError, Result};
use crate::flags::PublishFlags;
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::types::Message;
use crate::QoS;
use bytes::{Buf, BufMut, Bytes};

/// MQTT PUBLISH packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPacket {
    /// Topic name
    pub topic_name: String,
    /// Packet identifier (required for `QoS` > 0)
    pub packet_id: Option<u16>,
    /// Message payload
    pub payload: Bytes,
    /// Quality of Service level
    pub qos: QoS,
    /// Retain flag
    pub retain: bool,
    /// Duplicate delivery flag
    pub dup: bool,
}

impl PublishPacket {
    /// Creates a new PUBLISH packet
    #[must_use]
    pub fn new(topic_name: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic_name: topic_name.into(),
            packet_id: None,
            payload: payload.into(),
            qos,
            retain: false,
            dup: false,
        }
    }

    /// Sets the packet identifier
    #[must_use]
    pub fn with_packet_id(mut self, id: u16) -> Self {
        if self.qos != QoS::AtMostOnce {
            self.packet_id = Some(id);
        }
        self
    }

    /// Sets the retain flag
    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Sets the duplicate flag
    #[must_use]
    pub fn with_dup(mut self, dup: bool) -> Self {
        self.dup = dup;
        self
    }
}

impl From<&Message> for PublishPacket {
    fn from(message: &Message) -> Self {
        Self {
            topic_name: message.topic.clone(),
            packet_id: message.packet_id,
            payload: message.payload.clone(),
            qos: message.qos,
            retain: message.retain,
            dup: message.dup,
        }
    }
}

impl MqttPacket for PublishPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Publish
    }

    fn flags(&self) -> u8 {
        let mut flags = 0u8;

        if self.dup {
            flags |= PublishFlags::Dup as u8;
        }

        flags = PublishFlags::with_qos(flags, self.qos as u8);

        if self.retain {
            flags |= PublishFlags::Retain as u8;
        }

        flags
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        encode_string(buf, &self.topic_name)?;

        if self.qos != QoS::AtMostOnce {
            let packet_id = self.packet_id.ok_or_else(|| {
                MqttError::MalformedPacket("Packet ID required for QoS > 0".to_string())
            })?;
            buf.put_u16(packet_id);
        }

        buf.put_slice(&self.payload);
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, fixed_header: &FixedHeader) -> Result<Self> {
        let flags = fixed_header.flags;
        let qos = QoS::from_wire(PublishFlags::extract_qos(flags))
            .ok_or_else(|| MqttError::MalformedPacket("PUBLISH QoS 3 is reserved".to_string()))?;
        let decomposed = PublishFlags::decompose(flags);

        let topic_name = decode_string(buf)?;

        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            if buf.remaining() < 2 {
                return Err(MqttError::MalformedPacket(
                    "Missing packet identifier".to_string(),
                ));
            }
            let id = buf.get_u16();
            if id == 0 {
                return Err(MqttError::MalformedPacket(
                    "Packet identifier must be non-zero".to_string(),
                ));
            }
            Some(id)
        };

        let payload = buf.copy_to_bytes(buf.remaining());

        Ok(Self {
            topic_name,
            packet_id,
            payload,
            qos,
            retain: decomposed.contains(&PublishFlags::Retain),
            dup: decomposed.contains(&PublishFlags::Dup),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn round_trip(packet: &PublishPacket) -> PublishPacket {
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        let header = FixedHeader::decode(&mut buf).unwrap();
        PublishPacket::decode_body(&mut buf, &header).unwrap()
    }

    #[test]
    fn test_publish_qos0() {
        let packet = PublishPacket::new("sensors/room1/temp", &b"{\"v\":21}"[..], QoS::AtMostOnce);
        let decoded = round_trip(&packet);
        assert_eq!(decoded, packet);
        assert_eq!(decoded.packet_id, None);
    }

    #[test]
    fn test_publish_qos1_with_flags() {
        let packet = PublishPacket::new("a/b", &b"x"[..], QoS::AtLeastOnce)
            .with_packet_id(7)
            .with_retain(true)
            .with_dup(true);
        assert_eq!(packet.flags(), 0x0B);
        assert_eq!(round_trip(&packet), packet);
    }

    #[test]
    fn test_publish_qos2_decodes() {
        let packet = PublishPacket::new("a/b", &b"x"[..], QoS::ExactlyOnce).with_packet_id(3);
        assert_eq!(round_trip(&packet).qos, QoS::ExactlyOnce);
    }

    #[test]
    fn test_missing_packet_id_for_qos1() {
        let packet = PublishPacket::new("a/b", &b"x"[..], QoS::AtLeastOnce);
        let mut buf = BytesMut::new();
        assert!(packet.encode(&mut buf).is_err());
    }

    #[test]
    fn test_zero_packet_id_rejected() {
        let mut body = BytesMut::new();
        encode_string(&mut body, "a").unwrap();
        body.put_u16(0);
        let header = FixedHeader::new(PacketType::Publish, 0x02, 5);
        assert!(PublishPacket::decode_body(&mut body, &header).is_err());
    }

    #[test]
    fn test_qos3_rejected() {
        let mut body = BytesMut::new();
        encode_string(&mut body, "a").unwrap();
        body.put_u16(1);
        let header = FixedHeader::new(PacketType::Publish, 0x06, 5);
        assert!(PublishPacket::decode_body(&mut body, &header).is_err());
    }
}
