//! Frame splitting on top of the per-packet decoders
//!
//! [`PacketCodec`] turns a growing byte buffer into complete control packets.
//! It only keeps configuration: the size limits and the protocol revision
//! learned from CONNECT, which decides how strictly reserved flag bits are
//! checked on every later packet.

use crate::encoding::peek_variable_int;
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, Packet, PacketType};
use crate::types::ProtocolVersion;
use bytes::{Buf, BufMut, BytesMut};

#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_packet_size: u32,
    message_size_limit: usize,
    protocol: ProtocolVersion,
}

impl PacketCodec {
    /// `message_size_limit` caps PUBLISH payloads; 0 disables the check
    #[must_use]
    pub fn new(max_packet_size: u32, message_size_limit: usize) -> Self {
        Self {
            max_packet_size,
            message_size_limit,
            protocol: ProtocolVersion::V311,
        }
    }

    #[must_use]
    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    /// Decodes one packet from the front of `buf`
    ///
    /// Returns `Ok(None)` while the buffer holds less than a full frame; the
    /// consumed bytes are removed from `buf` only once a frame is complete.
    ///
    /// # Errors
    ///
    /// Returns a decode error for malformed frames, reserved flag violations,
    /// packets above `max_packet_size` and payloads above the message limit.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>> {
        if buf.is_empty() {
            return Ok(None);
        }

        let Some((remaining_length, length_bytes)) = peek_variable_int(&buf[1..])? else {
            return Ok(None);
        };

        if remaining_length > self.max_packet_size {
            return Err(MqttError::PacketTooLarge {
                size: remaining_length as usize,
                max: self.max_packet_size as usize,
            });
        }

        let frame_len = 1 + length_bytes + remaining_length as usize;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        let mut frame = buf.split_to(frame_len).freeze();
        let fixed_header = FixedHeader::decode(&mut frame)?;

        // CONNECT carries its own protocol; its flags are checked by the decoder
        if fixed_header.packet_type != PacketType::Connect
            && !fixed_header.validate_flags(self.protocol)
        {
            return Err(MqttError::MalformedPacket(format!(
                "Invalid flags 0x{:02X} for {:?}",
                fixed_header.flags, fixed_header.packet_type
            )));
        }

        let packet = Packet::decode_from_body(&fixed_header, &mut frame)?;
        if frame.has_remaining() {
            return Err(MqttError::MalformedPacket(format!(
                "{} trailing bytes after {:?}",
                frame.remaining(),
                fixed_header.packet_type
            )));
        }

        match &packet {
            Packet::Connect(connect) => self.protocol = connect.protocol,
            Packet::Publish(publish)
                if self.message_size_limit > 0
                    && publish.payload.len() > self.message_size_limit =>
            {
                return Err(MqttError::PacketTooLarge {
                    size: publish.payload.len(),
                    max: self.message_size_limit,
                });
            }
            _ => {}
        }

        Ok(Some(packet))
    }

    /// Serializes `packet` onto `buf`
    ///
    /// # Errors
    ///
    /// Returns an error if the packet cannot be encoded
    pub fn encode<B: BufMut>(&self, packet: &Packet, buf: &mut B) -> Result<()> {
        packet.encode(buf)
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(crate::constants::limits::MAX_PACKET_SIZE, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::connect::ConnectPacket;
    use crate::packet::publish::PublishPacket;
    use crate::packet::subscribe::SubscribePacket;
    use crate::packet::MqttPacket;
    use crate::QoS;

    fn encoded<P: MqttPacket>(packet: &P) -> BytesMut {
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_partial_frames_wait_for_more() {
        let mut codec = PacketCodec::default();
        let full = encoded(&PublishPacket::new("a/b", &b"hello"[..], QoS::AtMostOnce));

        let mut buf = BytesMut::new();
        for byte in &full[..full.len() - 1] {
            buf.put_u8(*byte);
            assert!(codec.decode(&mut buf).unwrap().is_none());
        }
        buf.put_u8(full[full.len() - 1]);
        assert!(matches!(codec.decode(&mut buf).unwrap(), Some(Packet::Publish(_))));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&crate::constants::packets::PINGREQ_BYTES);
        buf.extend_from_slice(&crate::constants::packets::DISCONNECT_BYTES);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Packet::PingReq));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Packet::Disconnect));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_malformed_remaining_length() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::from(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(MqttError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_packet_too_large() {
        let mut codec = PacketCodec::new(16, 0);
        let mut buf = encoded(&PublishPacket::new("a/b", vec![0u8; 64], QoS::AtMostOnce));
        assert!(matches!(
            codec.decode(&mut buf),
            Err(MqttError::PacketTooLarge { max: 16, .. })
        ));
    }

    #[test]
    fn test_message_size_limit() {
        let mut codec = PacketCodec::new(1024, 8);
        let mut buf = encoded(&PublishPacket::new("a/b", vec![0u8; 9], QoS::AtMostOnce));
        assert!(matches!(
            codec.decode(&mut buf),
            Err(MqttError::PacketTooLarge { size: 9, max: 8 })
        ));

        let mut buf = encoded(&PublishPacket::new("a/b", vec![0u8; 8], QoS::AtMostOnce));
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_subscribe_flags_strict_after_v311_connect() {
        let mut codec = PacketCodec::default();
        let mut buf = encoded(&ConnectPacket::new("dev"));
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert_eq!(codec.protocol(), ProtocolVersion::V311);

        let mut buf = encoded(&SubscribePacket::new(1).add_filter("a", QoS::AtMostOnce));
        buf[0] = 0x80;
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_subscribe_flags_lenient_after_v31_connect() {
        let mut codec = PacketCodec::default();
        let mut buf = encoded(&ConnectPacket::new("dev").with_protocol(ProtocolVersion::V31));
        assert!(codec.decode(&mut buf).unwrap().is_some());

        let mut buf = encoded(&SubscribePacket::new(1).add_filter("a", QoS::AtMostOnce));
        buf[0] = 0x80;
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Packet::Subscribe(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut codec = PacketCodec::default();
        // PUBACK with a three-byte body
        let mut buf = BytesMut::from(&[0x40, 0x03, 0x00, 0x01, 0x00][..]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
