//! MQTT 3.1.1 flag bytes decomposed with `BeBytes` flag enums

use crate::constants::{connect_flags, publish_flags};
use bebytes::BeBytes;

/// Flags byte of the CONNECT variable header
#[derive(Debug, Clone, Copy, PartialEq, Eq, BeBytes)]
#[bebytes(flags)]
pub enum ConnectFlags {
    /// Reserved bit - must be 0 on 3.1.1
    Reserved = 0x01,
    /// Clean Session flag
    CleanSession = 0x02,
    /// Will Flag
    WillFlag = 0x04,
    /// Will `QoS` bit 0
    WillQoS0 = 0x08,
    /// Will `QoS` bit 1
    WillQoS1 = 0x10,
    /// Will Retain flag
    WillRetain = 0x20,
    /// Password flag
    PasswordFlag = 0x40,
    /// Username flag
    UsernameFlag = 0x80,
}

impl ConnectFlags {
    /// Extract Will `QoS` value from flags
    #[must_use]
    pub fn extract_will_qos(flags: u8) -> u8 {
        (flags >> connect_flags::WILL_QOS_SHIFT) & connect_flags::WILL_QOS_MASK
    }

    /// Create flags byte with Will `QoS` value
    #[must_use]
    pub fn with_will_qos(mut flags: u8, qos: u8) -> u8 {
        flags &= connect_flags::WILL_QOS_CLEAR_MASK;
        flags |= (qos & connect_flags::WILL_QOS_MASK) << connect_flags::WILL_QOS_SHIFT;
        flags
    }

    /// Whether `flag` is set in the raw byte
    #[must_use]
    pub fn is_set(flags: u8, flag: ConnectFlags) -> bool {
        flags & (flag as u8) != 0
    }
}

/// Flags nibble of the PUBLISH fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq, BeBytes)]
#[bebytes(flags)]
pub enum PublishFlags {
    /// Retain flag
    Retain = 0x01,
    /// `QoS` bit 0
    QoS0 = 0x02,
    /// `QoS` bit 1
    QoS1 = 0x04,
    /// Duplicate delivery flag
    Dup = 0x08,
}

impl PublishFlags {
    /// Extract `QoS` value from flags
    #[must_use]
    pub fn extract_qos(flags: u8) -> u8 {
        (flags >> publish_flags::QOS_SHIFT) & publish_flags::QOS_MASK
    }

    /// Create flags byte with `QoS` value
    #[must_use]
    pub fn with_qos(mut flags: u8, qos: u8) -> u8 {
        flags &= publish_flags::QOS_CLEAR_MASK;
        flags |= (qos & publish_flags::QOS_MASK) << publish_flags::QOS_SHIFT;
        flags
    }
}

/// Acknowledge flags byte of CONNACK
#[derive(Debug, Clone, Copy, PartialEq, Eq, BeBytes)]
#[bebytes(flags)]
pub enum ConnAckFlags {
    /// Session Present flag (3.1.1 only)
    SessionPresent = 0x01,
}
