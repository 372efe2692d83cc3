use crate::constants::suback::FAILURE;
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::QoS;
use bytes::{Buf, BufMut};

/// MQTT SUBACK packet: one return code per requested filter, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAckPacket {
    pub packet_id: u16,
    pub return_codes: Vec<u8>,
}

impl SubAckPacket {
    #[must_use]
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            return_codes: Vec::new(),
        }
    }

    pub fn push_granted(&mut self, qos: QoS) {
        self.return_codes.push(qos as u8);
    }

    pub fn push_failure(&mut self) {
        self.return_codes.push(FAILURE);
    }
}

impl MqttPacket for SubAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::SubAck
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u16(self.packet_id);
        buf.put_slice(&self.return_codes);
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, _fixed_header: &FixedHeader) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(MqttError::MalformedPacket(
                "SUBACK missing packet identifier".to_string(),
            ));
        }
        let packet_id = buf.get_u16();
        let return_codes = buf.copy_to_bytes(buf.remaining()).to_vec();
        if let Some(code) = return_codes
            .iter()
            .find(|code| **code > 2 && **code != FAILURE)
        {
            return Err(MqttError::MalformedPacket(format!(
                "Invalid SUBACK return code 0x{code:02X}"
            )));
        }
        Ok(Self {
            packet_id,
            return_codes,
        })
    }
}
