use crate::constants::fixed_header::REQUIRED_FLAGS;
use crate::encoding::{decode_string, encode_string};
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use bytes::{Buf, BufMut};

/// MQTT UNSUBSCRIBE packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

impl UnsubscribePacket {
    #[must_use]
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            filters: Vec::new(),
        }
    }

    #[must_use]
    pub fn add_filter(mut self, filter: impl Into<String>) -> Self {
        self.filters.push(filter.into());
        self
    }
}

impl MqttPacket for UnsubscribePacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Unsubscribe
    }

    fn flags(&self) -> u8 {
        REQUIRED_FLAGS
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u16(self.packet_id);
        for filter in &self.filters {
            encode_string(buf, filter)?;
        }
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, _fixed_header: &FixedHeader) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(MqttError::MalformedPacket(
                "UNSUBSCRIBE missing packet identifier".to_string(),
            ));
        }
        let packet_id = buf.get_u16();

        let mut filters = Vec::new();
        while buf.has_remaining() {
            filters.push(decode_string(buf)?);
        }

        Ok(Self { packet_id, filters })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_unsubscribe_round_trip() {
        let packet = UnsubscribePacket::new(3)
            .add_filter("sensors/+/temp")
            .add_filter("alerts/#");

        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(buf[0], 0xA2);

        let header = FixedHeader::decode(&mut buf).unwrap();
        assert_eq!(
            UnsubscribePacket::decode_body(&mut buf, &header).unwrap(),
            packet
        );
    }

    #[test]
    fn test_truncated_filter() {
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x00, 0x05, b'a'][..]);
        let header = FixedHeader::new(PacketType::Unsubscribe, 0x02, 5);
        assert!(UnsubscribePacket::decode_body(&mut buf, &header).is_err());
    }
}
