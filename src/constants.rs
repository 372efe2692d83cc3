//! MQTT 3.1/3.1.1 protocol constants
//!
//! Fixed header bytes, masks, protocol identifiers and size limits shared by
//! the codec and the session engine.

use crate::packet::PacketType;

/// Fixed header byte 1 values (packet type << 4 | flags)
pub mod fixed_header {
    use super::PacketType;

    /// CONNACK packet fixed header (0x20)
    pub const CONNACK: u8 = (PacketType::ConnAck as u8) << 4;

    /// PUBACK packet fixed header (0x40)
    pub const PUBACK: u8 = (PacketType::PubAck as u8) << 4;

    /// PUBREL packet fixed header (0x62) - has required flags
    pub const PUBREL: u8 = (PacketType::PubRel as u8) << 4 | 0x02;

    /// PUBCOMP packet fixed header (0x70)
    pub const PUBCOMP: u8 = (PacketType::PubComp as u8) << 4;

    /// SUBSCRIBE packet fixed header (0x82) - has required flags
    pub const SUBSCRIBE: u8 = (PacketType::Subscribe as u8) << 4 | 0x02;

    /// SUBACK packet fixed header (0x90)
    pub const SUBACK: u8 = (PacketType::SubAck as u8) << 4;

    /// UNSUBACK packet fixed header (0xB0)
    pub const UNSUBACK: u8 = (PacketType::UnsubAck as u8) << 4;

    /// PINGREQ packet fixed header (0xC0)
    pub const PINGREQ: u8 = (PacketType::PingReq as u8) << 4;

    /// PINGRESP packet fixed header (0xD0)
    pub const PINGRESP: u8 = (PacketType::PingResp as u8) << 4;

    /// DISCONNECT packet fixed header (0xE0)
    pub const DISCONNECT: u8 = (PacketType::Disconnect as u8) << 4;

    /// Flags nibble required on PUBREL, SUBSCRIBE and UNSUBSCRIBE
    pub const REQUIRED_FLAGS: u8 = 0x02;
}

/// Masks for extracting fields from fixed header
pub mod masks {
    /// Mask for extracting flags from fixed header byte 1 (0x0F)
    pub const FLAGS: u8 = 0x0F;

    /// Mask for checking continuation bit in variable byte integer (0x80)
    pub const CONTINUATION_BIT: u8 = 0x80;

    /// Mask for extracting value from variable byte integer (0x7F)
    pub const VARIABLE_BYTE_VALUE: u8 = 0x7F;
}

/// Common packet payloads
pub mod packets {
    /// PINGREQ packet as bytes
    pub const PINGREQ_BYTES: [u8; 2] = [super::fixed_header::PINGREQ, 0x00];

    /// PINGRESP packet as bytes
    pub const PINGRESP_BYTES: [u8; 2] = [super::fixed_header::PINGRESP, 0x00];

    /// DISCONNECT packet as bytes
    pub const DISCONNECT_BYTES: [u8; 2] = [super::fixed_header::DISCONNECT, 0x00];
}

/// Protocol name and level pairs accepted in CONNECT
pub mod protocol {
    /// MQTT 3.1 protocol name
    pub const NAME_V31: &str = "MQIsdp";
    /// MQTT 3.1 protocol level
    pub const LEVEL_V31: u8 = 3;
    /// MQTT 3.1.1 protocol name
    pub const NAME_V311: &str = "MQTT";
    /// MQTT 3.1.1 protocol level
    pub const LEVEL_V311: u8 = 4;
}

/// CONNECT flags masks
pub mod connect_flags {
    /// Mask for clearing Will `QoS` bits (bits 3-4)
    pub const WILL_QOS_CLEAR_MASK: u8 = !0x18;
    /// Mask for extracting Will `QoS` (bits 3-4 shifted)
    pub const WILL_QOS_MASK: u8 = 0x03;
    /// Shift for Will `QoS`
    pub const WILL_QOS_SHIFT: u8 = 3;
}

/// PUBLISH flags masks
pub mod publish_flags {
    /// Mask for extracting `QoS` (bits 1-2 shifted)
    pub const QOS_MASK: u8 = 0x03;
    /// Shift for `QoS`
    pub const QOS_SHIFT: u8 = 1;
    /// Mask for clearing `QoS` bits
    pub const QOS_CLEAR_MASK: u8 = !0x06;
}

/// SUBACK return codes
pub mod suback {
    /// Subscription refused
    pub const FAILURE: u8 = 0x80;
}

/// String and binary data limits
pub mod limits {
    /// Maximum string length in MQTT (65535)
    pub const MAX_STRING_LENGTH: u16 = u16::MAX;

    /// Maximum packet size (256 MB)
    pub const MAX_PACKET_SIZE: u32 = 268_435_455;

    /// Maximum bytes a remaining-length field may use
    pub const MAX_REMAINING_LENGTH_BYTES: usize = 4;

    /// Recently acknowledged inbound `QoS` 1 packet ids remembered per session
    pub const DUPLICATE_WINDOW: usize = 32;
}

/// Time-related constants
pub mod time {
    use std::time::Duration;

    /// Default time a fresh connection has to send CONNECT
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Default timeout for blocking sends into bounded inboxes
    pub const DEFAULT_INBOX_SEND_TIMEOUT: Duration = Duration::from_secs(5);

    /// Keepalive expiry is this many milliseconds per declared second
    pub const KEEP_ALIVE_GRACE_MILLIS: u64 = 1500;
}
