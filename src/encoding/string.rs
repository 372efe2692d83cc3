use crate::constants::limits::MAX_STRING_LENGTH;
use crate::error::{MqttError, Result};
use bytes::{Buf, BufMut, Bytes};

/// Encodes a UTF-8 string with a 2-byte length prefix
///
/// # Errors
///
/// Returns an error if:
/// - The string contains null characters
/// - The string length exceeds maximum string length
pub fn encode_string<B: BufMut>(buf: &mut B, string: &str) -> Result<()> {
    if string.contains('\0') {
        return Err(MqttError::MalformedPacket(
            "String contains null character".to_string(),
        ));
    }
    encode_binary(buf, string.as_bytes())
}

/// Decodes a UTF-8 string with a 2-byte length prefix
///
/// # Errors
///
/// Returns an error if:
/// - Insufficient bytes in buffer
/// - String is not valid UTF-8
/// - String contains null characters
pub fn decode_string<B: Buf>(buf: &mut B) -> Result<String> {
    let bytes = decode_binary(buf)?;

    let string = String::from_utf8(bytes.to_vec())
        .map_err(|e| MqttError::MalformedPacket(format!("Invalid UTF-8: {e}")))?;

    if string.contains('\0') {
        return Err(MqttError::MalformedPacket(
            "String contains null character".to_string(),
        ));
    }

    Ok(string)
}

/// Encodes binary data with a 2-byte length prefix
///
/// # Errors
///
/// Returns an error if the data length exceeds 65,535 bytes
pub fn encode_binary<B: BufMut>(buf: &mut B, data: &[u8]) -> Result<()> {
    let len = u16::try_from(data.len()).map_err(|_| {
        MqttError::MalformedPacket(format!(
            "Length {} exceeds maximum {MAX_STRING_LENGTH}",
            data.len()
        ))
    })?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

/// Decodes binary data with a 2-byte length prefix
///
/// # Errors
///
/// Returns an error if there are insufficient bytes in the buffer
pub fn decode_binary<B: Buf>(buf: &mut B) -> Result<Bytes> {
    if buf.remaining() < 2 {
        return Err(MqttError::MalformedPacket(
            "Insufficient bytes for length prefix".to_string(),
        ));
    }

    let len = buf.get_u16() as usize;

    if buf.remaining() < len {
        return Err(MqttError::MalformedPacket(format!(
            "Insufficient bytes for data: expected {}, got {}",
            len,
            buf.remaining()
        )));
    }

    Ok(buf.copy_to_bytes(len))
}

/// Calculates the encoded length of a string (2 bytes for length + string bytes)
#[must_use]
pub fn string_len(string: &str) -> usize {
    2 + string.len()
}

/// Calculates the encoded length of binary data
#[must_use]
pub fn binary_len(data: &[u8]) -> usize {
    2 + data.len()
}
