//! WebSocket listener support
//!
//! MQTT over WebSocket carries the packet byte stream in binary frames. A
//! frame need not align with packet boundaries, so the wrapper exposes the
//! frames as a plain byte stream and the usual packet reader does the rest.

use crate::broker::config::WebSocketConfig;
use crate::error::{MqttError, Result};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::debug;

const SUBPROTOCOL_HEADER: &str = "Sec-WebSocket-Protocol";

/// Byte-stream view of a server-side WebSocket connection
pub struct WebSocketStreamWrapper {
    inner: WebSocketStream<TcpStream>,
    read_buffer: Vec<u8>,
    read_pos: usize,
}

impl WebSocketStreamWrapper {
    #[must_use]
    pub fn new(stream: WebSocketStream<TcpStream>) -> Self {
        Self {
            inner: stream,
            read_buffer: Vec::new(),
            read_pos: 0,
        }
    }

    /// # Errors
    ///
    /// Returns an error if the peer address cannot be retrieved
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.inner
            .get_ref()
            .peer_addr()
            .map_err(|e| MqttError::Io(format!("Failed to get peer address: {e}")))
    }

    fn drain_buffer(&mut self, buf: &mut ReadBuf<'_>) {
        let remaining = &self.read_buffer[self.read_pos..];
        let n = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..n]);
        self.read_pos += n;
        if self.read_pos == self.read_buffer.len() {
            self.read_buffer.clear();
            self.read_pos = 0;
        }
    }
}

/// Whether a handshake request offers `subprotocol`
fn offers_subprotocol(req: &Request, subprotocol: &str) -> bool {
    req.headers()
        .get_all(SUBPROTOCOL_HEADER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|p| p.trim() == subprotocol)
}

/// Runs the WebSocket upgrade on a freshly accepted socket
///
/// Requests for any path other than the configured one are answered with
/// 404. The configured subprotocol is echoed when the client offers it.
///
/// # Errors
///
/// Returns an error if the handshake fails or the path does not match
pub async fn accept_websocket_connection(
    tcp_stream: TcpStream,
    config: &WebSocketConfig,
    peer_addr: SocketAddr,
) -> Result<WebSocketStreamWrapper> {
    let callback = |req: &Request, mut response: Response| {
        if req.uri().path() != config.path {
            debug!(addr = %peer_addr, path = req.uri().path(), "WebSocket path refused");
            let mut refusal = ErrorResponse::new(Some("Not Found".to_string()));
            *refusal.status_mut() = StatusCode::NOT_FOUND;
            return Err(refusal);
        }
        if offers_subprotocol(req, &config.subprotocol) {
            if let Ok(value) = HeaderValue::from_str(&config.subprotocol) {
                response.headers_mut().insert(SUBPROTOCOL_HEADER, value);
            }
        }
        Ok(response)
    };

    let stream = accept_hdr_async(tcp_stream, callback)
        .await
        .map_err(|e| MqttError::ConnectionError(format!("WebSocket handshake failed: {e}")))?;
    debug!(addr = %peer_addr, "WebSocket handshake completed");
    Ok(WebSocketStreamWrapper::new(stream))
}

fn ws_error(e: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::other(e.to_string())
}

impl AsyncRead for WebSocketStreamWrapper {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if self.read_pos < self.read_buffer.len() {
                self.drain_buffer(buf);
                return Poll::Ready(Ok(()));
            }

            match self.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    self.read_buffer = data;
                    self.read_pos = 0;
                }
                // A close frame or end of stream reads as EOF
                Poll::Ready(Some(Ok(Message::Close(_))) | None) => return Poll::Ready(Ok(())),
                // Control frames are answered by tungstenite; text is not MQTT
                Poll::Ready(Some(Ok(_))) => {}
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(ws_error(e))),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for WebSocketStreamWrapper {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.inner.poll_ready_unpin(cx) {
            Poll::Ready(Ok(())) => match self.inner.start_send_unpin(Message::Binary(buf.to_vec())) {
                Ok(()) => Poll::Ready(Ok(buf.len())),
                Err(e) => Poll::Ready(Err(ws_error(e))),
            },
            Poll::Ready(Err(e)) => Poll::Ready(Err(ws_error(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.inner.poll_flush_unpin(cx).map_err(ws_error)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.inner.poll_close_unpin(cx).map_err(ws_error)
    }
}
