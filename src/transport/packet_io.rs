//! Packet I/O over any async byte stream
//!
//! Reads go through a [`PacketCodec`] so a single `read` may yield several
//! packets, or none until the rest of a frame arrives.

use crate::codec::PacketCodec;
use crate::error::{MqttError, Result};
use crate::packet::Packet;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_BUFFER_CAPACITY: usize = 4096;

/// Buffered packet reader owning the read half of a connection
#[derive(Debug)]
pub struct PacketReader<R> {
    reader: R,
    buffer: BytesMut,
    codec: PacketCodec,
    last_frame_len: usize,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    #[must_use]
    pub fn new(reader: R, codec: PacketCodec) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            codec,
            last_frame_len: 0,
        }
    }

    /// Wire size of the packet most recently returned by [`Self::read_packet`]
    #[must_use]
    pub fn last_frame_len(&self) -> usize {
        self.last_frame_len
    }

    /// Read the next complete MQTT packet
    ///
    /// # Errors
    ///
    /// Returns `MqttError::ClientClosed` on a clean end of stream between
    /// packets, a decode error for malformed input, or the underlying I/O error.
    pub async fn read_packet(&mut self) -> Result<Packet> {
        loop {
            let buffered = self.buffer.len();
            if let Some(packet) = self.codec.decode(&mut self.buffer)? {
                self.last_frame_len = buffered - self.buffer.len();
                return Ok(packet);
            }

            let n = self.reader.read_buf(&mut self.buffer).await?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Err(MqttError::ClientClosed);
                }
                return Err(MqttError::ConnectionError(
                    "Connection closed while reading packet".to_string(),
                ));
            }
        }
    }
}

/// Encode and write one packet, flushing the stream
///
/// Returns the number of bytes written.
///
/// # Errors
///
/// Returns an error if encoding or the write fails
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<usize> {
    let mut buf = BytesMut::new();
    packet.encode(&mut buf)?;
    tracing::trace!(packet_type = ?packet.packet_type(), len = buf.len(), "Writing packet");
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(buf.len())
}
