use crate::encoding::{decode_binary, decode_string, encode_binary, encode_string};
use crate::error::{MqttError, Result};
use crate::flags::ConnectFlags;
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::types::{ProtocolVersion, WillMessage};
use crate::QoS;
use bytes::{Buf, BufMut, Bytes};

/// MQTT CONNECT packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    /// Protocol revision announced by the name/level pair
    pub protocol: ProtocolVersion,
    /// Clean Session flag
    pub clean_session: bool,
    /// Keep alive interval in seconds
    pub keep_alive: u16,
    /// Client identifier field, possibly carrying embedded auth parameters
    pub client_id: String,
    /// Username (optional)
    pub username: Option<String>,
    /// Password (optional)
    pub password: Option<Bytes>,
    /// Will message (optional)
    pub will: Option<WillMessage>,
}

impl ConnectPacket {
    /// Creates a 3.1.1 CONNECT with a clean session and 60s keepalive
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            protocol: ProtocolVersion::V311,
            clean_session: true,
            keep_alive: 60,
            client_id: client_id.into(),
            username: None,
            password: None,
            will: None,
        }
    }

    #[must_use]
    pub fn with_protocol(mut self, protocol: ProtocolVersion) -> Self {
        self.protocol = protocol;
        self
    }

    #[must_use]
    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: u16) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<Bytes>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn with_will(mut self, will: WillMessage) -> Self {
        self.will = Some(will);
        self
    }

    /// Creates connect flags byte
    fn connect_flags(&self) -> u8 {
        let mut flags = 0u8;

        if self.clean_session {
            flags |= ConnectFlags::CleanSession as u8;
        }

        if let Some(ref will) = self.will {
            flags |= ConnectFlags::WillFlag as u8;
            flags = ConnectFlags::with_will_qos(flags, will.qos as u8);
            if will.retain {
                flags |= ConnectFlags::WillRetain as u8;
            }
        }

        if self.username.is_some() {
            flags |= ConnectFlags::UsernameFlag as u8;
        }

        if self.password.is_some() {
            flags |= ConnectFlags::PasswordFlag as u8;
        }

        flags
    }

    /// Decode and validate the protocol name/level pair
    ///
    /// An unrecognised name is not MQTT at all and gets no CONNACK; a known
    /// name with the wrong level is answered with "unacceptable protocol version".
    fn decode_protocol_header<B: Buf>(buf: &mut B) -> Result<ProtocolVersion> {
        let protocol_name = decode_string(buf)?;
        let protocol = ProtocolVersion::from_name(&protocol_name)
            .ok_or(MqttError::UnknownProtocol(protocol_name))?;

        if !buf.has_remaining() {
            return Err(MqttError::MalformedPacket(
                "Missing protocol version".to_string(),
            ));
        }
        if buf.get_u8() != protocol.level() {
            return Err(MqttError::UnsupportedProtocolVersion);
        }

        Ok(protocol)
    }

    fn decode_will<B: Buf>(buf: &mut B, flags: u8) -> Result<Option<WillMessage>> {
        if !ConnectFlags::is_set(flags, ConnectFlags::WillFlag) {
            return Ok(None);
        }

        let qos = QoS::from_wire(ConnectFlags::extract_will_qos(flags))
            .ok_or_else(|| MqttError::MalformedPacket("Will QoS must be below 3".to_string()))?;
        let topic = decode_string(buf)?;
        let payload = decode_binary(buf)?;

        Ok(Some(WillMessage {
            topic,
            payload,
            qos,
            retain: ConnectFlags::is_set(flags, ConnectFlags::WillRetain),
        }))
    }
}

impl MqttPacket for ConnectPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Connect
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        encode_string(buf, self.protocol.name())?;
        buf.put_u8(self.protocol.level());
        buf.put_u8(self.connect_flags());
        buf.put_u16(self.keep_alive);

        encode_string(buf, &self.client_id)?;

        if let Some(ref will) = self.will {
            encode_string(buf, &will.topic)?;
            encode_binary(buf, &will.payload)?;
        }

        if let Some(ref username) = self.username {
            encode_string(buf, username)?;
        }

        if let Some(ref password) = self.password {
            encode_binary(buf, password)?;
        }

        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, fixed_header: &FixedHeader) -> Result<Self> {
        let protocol = Self::decode_protocol_header(buf)?;
        let strict = protocol == ProtocolVersion::V311;

        if strict && fixed_header.flags != 0 {
            return Err(MqttError::MalformedPacket(
                "CONNECT fixed header flags must be 0".to_string(),
            ));
        }

        if buf.remaining() < 3 {
            return Err(MqttError::MalformedPacket(
                "Missing connect flags or keep alive".to_string(),
            ));
        }
        let flags = buf.get_u8();
        let keep_alive = buf.get_u16();

        if strict {
            if ConnectFlags::is_set(flags, ConnectFlags::Reserved) {
                return Err(MqttError::MalformedPacket(
                    "Reserved flag bit must be 0".to_string(),
                ));
            }
            let will_bits = ConnectFlags::WillQoS0 as u8
                | ConnectFlags::WillQoS1 as u8
                | ConnectFlags::WillRetain as u8;
            if !ConnectFlags::is_set(flags, ConnectFlags::WillFlag) && flags & will_bits != 0 {
                return Err(MqttError::MalformedPacket(
                    "Will QoS/retain set without will flag".to_string(),
                ));
            }
            if ConnectFlags::is_set(flags, ConnectFlags::PasswordFlag)
                && !ConnectFlags::is_set(flags, ConnectFlags::UsernameFlag)
            {
                return Err(MqttError::MalformedPacket(
                    "Password flag set without username flag".to_string(),
                ));
            }
        }

        let client_id = decode_string(buf)?;
        let will = Self::decode_will(buf, flags)?;

        let username = if ConnectFlags::is_set(flags, ConnectFlags::UsernameFlag) {
            Some(decode_string(buf)?)
        } else {
            None
        };
        let password = if ConnectFlags::is_set(flags, ConnectFlags::PasswordFlag) {
            Some(decode_binary(buf)?)
        } else {
            None
        };

        Ok(Self {
            protocol,
            clean_session: ConnectFlags::is_set(flags, ConnectFlags::CleanSession),
            keep_alive,
            client_id,
            username,
            password,
            will,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn decode(bytes: &mut BytesMut) -> Result<ConnectPacket> {
        let header = FixedHeader::decode(bytes)?;
        ConnectPacket::decode_body(bytes, &header)
    }

    fn raw_connect(name: &str, level: u8, flags: u8) -> BytesMut {
        let mut body = BytesMut::new();
        encode_string(&mut body, name).unwrap();
        body.put_u8(level);
        body.put_u8(flags);
        body.put_u16(30);
        encode_string(&mut body, "dev").unwrap();

        let mut buf = BytesMut::new();
        FixedHeader::new(PacketType::Connect, 0, u32::try_from(body.len()).unwrap())
            .encode(&mut buf)
            .unwrap();
        buf.extend_from_slice(&body);
        buf
    }

    #[test]
    fn test_connect_encode_decode_full() {
        let packet = ConnectPacket::new("dev1|securemode=2|")
            .with_clean_session(false)
            .with_keep_alive(30)
            .with_credentials("lamp&prod1", &b"secret"[..])
            .with_will(
                WillMessage::new("status/lamp", &b"gone"[..])
                    .with_qos(QoS::AtLeastOnce)
                    .with_retain(true),
            );

        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        let decoded = decode(&mut buf).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_connect_v31() {
        let packet = ConnectPacket::new("legacy").with_protocol(ProtocolVersion::V31);
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        let decoded = decode(&mut buf).unwrap();
        assert_eq!(decoded.protocol, ProtocolVersion::V31);
    }

    #[test]
    fn test_wrong_level_is_unsupported_version() {
        let mut buf = raw_connect("MQTT", 5, 0x02);
        assert!(matches!(
            decode(&mut buf),
            Err(MqttError::UnsupportedProtocolVersion)
        ));

        let mut buf = raw_connect("MQIsdp", 4, 0x02);
        assert!(matches!(
            decode(&mut buf),
            Err(MqttError::UnsupportedProtocolVersion)
        ));
    }

    #[test]
    fn test_unknown_protocol_name() {
        let mut buf = raw_connect("HTTP", 4, 0x02);
        assert!(matches!(decode(&mut buf), Err(MqttError::UnknownProtocol(_))));
    }

    #[test]
    fn test_reserved_bit_only_checked_on_v311() {
        let mut buf = raw_connect("MQTT", 4, 0x03);
        assert!(matches!(decode(&mut buf), Err(MqttError::MalformedPacket(_))));

        let mut buf = raw_connect("MQIsdp", 3, 0x03);
        assert!(decode(&mut buf).is_ok());
    }

    #[test]
    fn test_will_qos_three_rejected() {
        let mut body = BytesMut::new();
        encode_string(&mut body, "MQTT").unwrap();
        body.put_u8(4);
        body.put_u8(0x1C); // will flag + QoS 3
        body.put_u16(0);
        encode_string(&mut body, "dev").unwrap();
        encode_string(&mut body, "will/topic").unwrap();
        encode_binary(&mut body, b"x").unwrap();

        let header = FixedHeader::new(PacketType::Connect, 0, 0);
        assert!(ConnectPacket::decode_body(&mut body, &header).is_err());
    }

    #[test]
    fn test_password_without_username_rejected() {
        let mut buf = raw_connect("MQTT", 4, 0x40);
        assert!(decode(&mut buf).is_err());
    }
}
