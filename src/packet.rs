pub mod ack;
pub mod connack;
pub mod connect;
pub mod publish;
pub mod suback;
pub mod subscribe;
pub mod unsubscribe;

use crate::constants::fixed_header::REQUIRED_FLAGS;
use crate::constants::masks;
use crate::encoding::{decode_variable_int, encode_variable_int, encoded_variable_int_len};
use crate::error::{MqttError, Result};
use crate::types::ProtocolVersion;
use bebytes::BeBytes;
use bytes::{Buf, BufMut};

/// MQTT Fixed Header Type and Flags byte using bebytes for bit field operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, BeBytes)]
pub struct MqttTypeAndFlags {
    /// Message type (bits 7-4)
    #[bits(4)]
    pub message_type: u8,
    /// DUP flag (bit 3) - for PUBLISH packets
    #[bits(1)]
    pub dup: u8,
    /// `QoS` level (bits 2-1) - for PUBLISH packets
    #[bits(2)]
    pub qos: u8,
    /// RETAIN flag (bit 0) - for PUBLISH packets
    #[bits(1)]
    pub retain: u8,
}

impl MqttTypeAndFlags {
    /// Splits the first fixed-header byte into its bit fields
    ///
    /// # Errors
    ///
    /// Returns an error if the byte cannot be decoded
    pub fn from_byte(byte: u8) -> Result<Self> {
        let (parsed, _) = Self::try_from_be_bytes(&[byte])
            .map_err(|e| MqttError::MalformedPacket(format!("Invalid fixed header: {e:?}")))?;
        Ok(parsed)
    }

    /// Returns the packet type
    #[must_use]
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_u8(self.message_type)
    }

    /// The low nibble as a plain flags value
    #[must_use]
    pub fn flags(&self) -> u8 {
        (self.dup << 3) | (self.qos << 1) | self.retain
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    /// Converts a u8 to `PacketType`; 0 and 15 are reserved in 3.1.1
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(PacketType::Connect),
            2 => Some(PacketType::ConnAck),
            3 => Some(PacketType::Publish),
            4 => Some(PacketType::PubAck),
            5 => Some(PacketType::PubRec),
            6 => Some(PacketType::PubRel),
            7 => Some(PacketType::PubComp),
            8 => Some(PacketType::Subscribe),
            9 => Some(PacketType::SubAck),
            10 => Some(PacketType::Unsubscribe),
            11 => Some(PacketType::UnsubAck),
            12 => Some(PacketType::PingReq),
            13 => Some(PacketType::PingResp),
            14 => Some(PacketType::Disconnect),
            _ => None,
        }
    }
}

impl From<PacketType> for u8 {
    fn from(packet_type: PacketType) -> Self {
        packet_type as u8
    }
}

/// MQTT packet fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub remaining_length: u32,
}

impl FixedHeader {
    /// Creates a new fixed header
    #[must_use]
    pub fn new(packet_type: PacketType, flags: u8, remaining_length: u32) -> Self {
        Self {
            packet_type,
            flags,
            remaining_length,
        }
    }

    /// Encodes the fixed header
    ///
    /// # Errors
    ///
    /// Returns an error if the remaining length is too large
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let byte1 = (u8::from(self.packet_type) << 4) | (self.flags & masks::FLAGS);
        buf.put_u8(byte1);
        encode_variable_int(buf, self.remaining_length)
    }

    /// Decodes a fixed header from the buffer
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Insufficient bytes in buffer
    /// - Invalid packet type
    /// - Invalid remaining length
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(MqttError::MalformedPacket(
                "No data for fixed header".to_string(),
            ));
        }

        let type_and_flags = MqttTypeAndFlags::from_byte(buf.get_u8())?;
        let packet_type = type_and_flags
            .packet_type()
            .ok_or(MqttError::InvalidPacketType(type_and_flags.message_type))?;
        let remaining_length = decode_variable_int(buf)?;

        Ok(Self {
            packet_type,
            flags: type_and_flags.flags(),
            remaining_length,
        })
    }

    /// Validates the reserved flag bits for the packet type
    ///
    /// 3.1.1 fixes the nibble for every type except PUBLISH. 3.1 clients are
    /// known to set bits loosely, so only PUBLISH `QoS` 3 is refused for them.
    #[must_use]
    pub fn validate_flags(&self, protocol: ProtocolVersion) -> bool {
        match (self.packet_type, protocol) {
            (PacketType::Publish, _) => {
                crate::flags::PublishFlags::extract_qos(self.flags) != 3
            }
            (_, ProtocolVersion::V31) => true,
            (PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe, _) => {
                self.flags == REQUIRED_FLAGS
            }
            _ => self.flags == 0,
        }
    }

    /// Returns the encoded length of the fixed header
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + encoded_variable_int_len(self.remaining_length)
    }
}

/// Enum representing all MQTT 3.1.1 control packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Box<connect::ConnectPacket>),
    ConnAck(connack::ConnAckPacket),
    Publish(publish::PublishPacket),
    PubAck(ack::PubAckPacket),
    PubRec(ack::PubRecPacket),
    PubRel(ack::PubRelPacket),
    PubComp(ack::PubCompPacket),
    Subscribe(subscribe::SubscribePacket),
    SubAck(suback::SubAckPacket),
    Unsubscribe(unsubscribe::UnsubscribePacket),
    UnsubAck(ack::UnsubAckPacket),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Decode a packet body based on the packet type
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails
    pub fn decode_from_body<B: Buf>(fixed_header: &FixedHeader, buf: &mut B) -> Result<Self> {
        match fixed_header.packet_type {
            PacketType::Connect => Ok(Packet::Connect(Box::new(
                connect::ConnectPacket::decode_body(buf, fixed_header)?,
            ))),
            PacketType::ConnAck => Ok(Packet::ConnAck(connack::ConnAckPacket::decode_body(
                buf,
                fixed_header,
            )?)),
            PacketType::Publish => Ok(Packet::Publish(publish::PublishPacket::decode_body(
                buf,
                fixed_header,
            )?)),
            PacketType::PubAck => Ok(Packet::PubAck(ack::PubAckPacket::decode_body(
                buf,
                fixed_header,
            )?)),
            PacketType::PubRec => Ok(Packet::PubRec(ack::PubRecPacket::decode_body(
                buf,
                fixed_header,
            )?)),
            PacketType::PubRel => Ok(Packet::PubRel(ack::PubRelPacket::decode_body(
                buf,
                fixed_header,
            )?)),
            PacketType::PubComp => Ok(Packet::PubComp(ack::PubCompPacket::decode_body(
                buf,
                fixed_header,
            )?)),
            PacketType::Subscribe => Ok(Packet::Subscribe(
                subscribe::SubscribePacket::decode_body(buf, fixed_header)?,
            )),
            PacketType::SubAck => Ok(Packet::SubAck(suback::SubAckPacket::decode_body(
                buf,
                fixed_header,
            )?)),
            PacketType::Unsubscribe => Ok(Packet::Unsubscribe(
                unsubscribe::UnsubscribePacket::decode_body(buf, fixed_header)?,
            )),
            PacketType::UnsubAck => Ok(Packet::UnsubAck(ack::UnsubAckPacket::decode_body(
                buf,
                fixed_header,
            )?)),
            PacketType::PingReq | PacketType::PingResp | PacketType::Disconnect => {
                if fixed_header.remaining_length != 0 {
                    return Err(MqttError::MalformedPacket(format!(
                        "{:?} must have zero remaining length",
                        fixed_header.packet_type
                    )));
                }
                Ok(match fixed_header.packet_type {
                    PacketType::PingReq => Packet::PingReq,
                    PacketType::PingResp => Packet::PingResp,
                    _ => Packet::Disconnect,
                })
            }
        }
    }

    /// Returns the control packet type
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// Encodes the complete packet including its fixed header
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        match self {
            Packet::Connect(p) => p.encode(buf),
            Packet::ConnAck(p) => p.encode(buf),
            Packet::Publish(p) => p.encode(buf),
            Packet::PubAck(p) => p.encode(buf),
            Packet::PubRec(p) => p.encode(buf),
            Packet::PubRel(p) => p.encode(buf),
            Packet::PubComp(p) => p.encode(buf),
            Packet::Subscribe(p) => p.encode(buf),
            Packet::SubAck(p) => p.encode(buf),
            Packet::Unsubscribe(p) => p.encode(buf),
            Packet::UnsubAck(p) => p.encode(buf),
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => {
                FixedHeader::new(self.packet_type(), 0, 0).encode(buf)
            }
        }
    }
}

/// Trait for MQTT packets
pub trait MqttPacket: Sized {
    /// Returns the packet type
    fn packet_type(&self) -> PacketType;

    /// Returns the fixed header flags
    fn flags(&self) -> u8 {
        0
    }

    /// Encodes the packet body (without fixed header)
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails
    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()>;

    /// Decodes the packet body (without fixed header)
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails
    fn decode_body<B: Buf>(buf: &mut B, fixed_header: &FixedHeader) -> Result<Self>;

    /// Encodes the complete packet (with fixed header)
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        // First encode to temporary buffer to get remaining length
        let mut body = Vec::new();
        self.encode_body(&mut body)?;

        let remaining_length = u32::try_from(body.len()).map_err(|_| {
            MqttError::PacketTooLarge {
                size: body.len(),
                max: crate::constants::limits::MAX_PACKET_SIZE as usize,
            }
        })?;
        FixedHeader::new(self.packet_type(), self.flags(), remaining_length).encode(buf)?;
        buf.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use proptest::prelude::*;

    #[test]
    fn test_packet_type_from_u8() {
        assert_eq!(PacketType::from_u8(1), Some(PacketType::Connect));
        assert_eq!(PacketType::from_u8(14), Some(PacketType::Disconnect));
        assert_eq!(PacketType::from_u8(0), None);
        assert_eq!(PacketType::from_u8(15), None);
    }

    #[test]
    fn test_fixed_header_with_flags() {
        let mut buf = BytesMut::new();
        FixedHeader::new(PacketType::Publish, 0x0B, 50)
            .encode(&mut buf)
            .unwrap();
        assert_eq!(buf[0], 0x3B);

        let decoded = FixedHeader::decode(&mut buf).unwrap();
        assert_eq!(decoded.packet_type, PacketType::Publish);
        assert_eq!(decoded.flags, 0x0B);
        assert_eq!(decoded.remaining_length, 50);
        assert_eq!(decoded.encoded_len(), 2);
    }

    #[test]
    fn test_validate_flags_v311() {
        let v = ProtocolVersion::V311;
        assert!(FixedHeader::new(PacketType::Connect, 0, 0).validate_flags(v));
        assert!(!FixedHeader::new(PacketType::Connect, 1, 0).validate_flags(v));
        assert!(FixedHeader::new(PacketType::Subscribe, 0x02, 0).validate_flags(v));
        assert!(!FixedHeader::new(PacketType::Subscribe, 0x00, 0).validate_flags(v));
        assert!(!FixedHeader::new(PacketType::Unsubscribe, 0x03, 0).validate_flags(v));
        assert!(FixedHeader::new(PacketType::Publish, 0x0B, 0).validate_flags(v));
        assert!(!FixedHeader::new(PacketType::Publish, 0x06, 0).validate_flags(v));
    }

    #[test]
    fn test_validate_flags_v31_is_lenient() {
        let v = ProtocolVersion::V31;
        assert!(FixedHeader::new(PacketType::Subscribe, 0x00, 0).validate_flags(v));
        assert!(FixedHeader::new(PacketType::PingReq, 0x01, 0).validate_flags(v));
        assert!(!FixedHeader::new(PacketType::Publish, 0x06, 0).validate_flags(v));
    }

    #[test]
    fn test_decode_invalid_packet_type() {
        let mut buf = BytesMut::from(&[0x00, 0x00][..]);
        assert!(matches!(
            FixedHeader::decode(&mut buf),
            Err(MqttError::InvalidPacketType(0))
        ));
        let mut buf = BytesMut::from(&[0xF0, 0x00][..]);
        assert!(matches!(
            FixedHeader::decode(&mut buf),
            Err(MqttError::InvalidPacketType(15))
        ));
    }

    #[test]
    fn test_disconnect_with_body_rejected() {
        let header = FixedHeader::new(PacketType::Disconnect, 0, 1);
        let mut body = BytesMut::from(&[0x00][..]);
        assert!(Packet::decode_from_body(&header, &mut body).is_err());
    }

    #[test]
    fn test_ping_encoding() {
        let mut buf = BytesMut::new();
        Packet::PingResp.encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &crate::constants::packets::PINGRESP_BYTES);
    }

    proptest! {
        #[test]
        fn prop_type_and_flags_bits(byte in any::<u8>()) {
            let parsed = MqttTypeAndFlags::from_byte(byte).unwrap();
            prop_assert_eq!(parsed.message_type, byte >> 4);
            prop_assert_eq!(parsed.flags(), byte & 0x0F);
            prop_assert_eq!(parsed.to_be_bytes(), vec![byte]);
        }
    }
}
