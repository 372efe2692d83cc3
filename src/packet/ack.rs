//! Packets whose body is only a packet identifier
//!
//! PUBACK, PUBREC, PUBREL, PUBCOMP and UNSUBACK share the same two-byte
//! variable header and no payload in 3.1.1.

use crate::constants::fixed_header::REQUIRED_FLAGS;
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use bytes::{Buf, BufMut};

fn decode_packet_id<B: Buf>(buf: &mut B, packet_type: PacketType) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(MqttError::MalformedPacket(format!(
            "{packet_type:?} requires a packet identifier"
        )));
    }
    Ok(buf.get_u16())
}

macro_rules! id_only_packet {
    ($(#[$meta:meta])* $name:ident, $packet_type:expr, $flags:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            pub packet_id: u16,
        }

        impl $name {
            #[must_use]
            pub fn new(packet_id: u16) -> Self {
                Self { packet_id }
            }
        }

        impl MqttPacket for $name {
            fn packet_type(&self) -> PacketType {
                $packet_type
            }

            fn flags(&self) -> u8 {
                $flags
            }

            fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
                buf.put_u16(self.packet_id);
                Ok(())
            }

            fn decode_body<B: Buf>(buf: &mut B, _fixed_header: &FixedHeader) -> Result<Self> {
                Ok(Self {
                    packet_id: decode_packet_id(buf, $packet_type)?,
                })
            }
        }
    };
}

id_only_packet!(
    /// Acknowledges a `QoS` 1 PUBLISH
    PubAckPacket,
    PacketType::PubAck,
    0
);
id_only_packet!(PubRecPacket, PacketType::PubRec, 0);
id_only_packet!(PubRelPacket, PacketType::PubRel, REQUIRED_FLAGS);
id_only_packet!(PubCompPacket, PacketType::PubComp, 0);
id_only_packet!(
    /// Acknowledges an UNSUBSCRIBE; carries no per-filter codes in 3.1.1
    UnsubAckPacket,
    PacketType::UnsubAck,
    0
);
