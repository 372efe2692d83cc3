use crate::error::{MqttError, Result};
use crate::flags::ConnAckFlags;
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use bytes::{Buf, BufMut};

/// CONNACK return codes defined by 3.1/3.1.1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted = 0x00,
    UnacceptableProtocolVersion = 0x01,
    IdentifierRejected = 0x02,
    ServerUnavailable = 0x03,
    BadUsernameOrPassword = 0x04,
    NotAuthorized = 0x05,
}

impl ConnectReturnCode {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Accepted),
            0x01 => Some(Self::UnacceptableProtocolVersion),
            0x02 => Some(Self::IdentifierRejected),
            0x03 => Some(Self::ServerUnavailable),
            0x04 => Some(Self::BadUsernameOrPassword),
            0x05 => Some(Self::NotAuthorized),
            _ => None,
        }
    }
}

/// MQTT CONNACK packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAckPacket {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

impl ConnAckPacket {
    #[must_use]
    pub fn new(session_present: bool, return_code: ConnectReturnCode) -> Self {
        Self {
            session_present,
            return_code,
        }
    }

    /// A refusal; session present is always 0 for non-zero return codes
    #[must_use]
    pub fn refused(return_code: ConnectReturnCode) -> Self {
        Self::new(false, return_code)
    }
}

impl MqttPacket for ConnAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::ConnAck
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let flags = if self.session_present {
            ConnAckFlags::SessionPresent as u8
        } else {
            0
        };
        buf.put_u8(flags);
        buf.put_u8(self.return_code as u8);
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, _fixed_header: &FixedHeader) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(MqttError::MalformedPacket(
                "CONNACK requires 2 bytes".to_string(),
            ));
        }
        let flags = buf.get_u8();
        if flags & !(ConnAckFlags::SessionPresent as u8) != 0 {
            return Err(MqttError::MalformedPacket(
                "CONNACK reserved flags must be 0".to_string(),
            ));
        }
        let code = buf.get_u8();
        let return_code = ConnectReturnCode::from_u8(code)
            .ok_or_else(|| MqttError::MalformedPacket(format!("Invalid CONNACK code {code}")))?;

        Ok(Self {
            session_present: ConnAckFlags::decompose(flags).contains(&ConnAckFlags::SessionPresent),
            return_code,
        })
    }
}
