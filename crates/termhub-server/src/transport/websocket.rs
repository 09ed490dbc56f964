//! WebSocket transport for viewers.
//!
//! Binary messages carry length-prefixed CBOR frames. A frame may be split
//! across messages and a message may pack several frames; the socket's
//! [`FrameDecoder`] reassembles them either way. Text messages are ignored.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use termhub_core::{
    encode_frame, ClientMessage, FrameDecoder, HubError, HubResult, ServerMessage,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Pause after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Bound TCP socket that viewers connect to.
///
/// Only the TCP accept happens here. The WebSocket handshake is left to
/// [`ViewerSocket::handshake`], run inside the connection's own task.
pub struct ViewerListener {
    tcp: TcpListener,
    local_addr: SocketAddr,
}

impl ViewerListener {
    pub async fn bind(addr: SocketAddr) -> HubResult<Self> {
        let tcp = TcpListener::bind(addr)
            .await
            .map_err(|e| HubError::Transport(format!("cannot listen on {addr}: {e}")))?;
        let local_addr = tcp.local_addr()?;
        info!(addr = %local_addr, "listening for viewers");
        Ok(Self { tcp, local_addr })
    }

    /// The bound address; differs from the requested one when port 0 was used.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next viewer. Accept errors are logged and retried.
    pub async fn next(&self) -> (TcpStream, SocketAddr) {
        loop {
            match self.tcp.accept().await {
                Ok(accepted) => return accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

/// One viewer's WebSocket, speaking whole protocol messages.
pub struct ViewerSocket {
    ws: WebSocketStream<TcpStream>,
    remote_addr: SocketAddr,
    decoder: FrameDecoder,
}

impl ViewerSocket {
    /// Complete the WebSocket handshake on an accepted connection.
    pub async fn handshake(stream: TcpStream, remote_addr: SocketAddr) -> HubResult<Self> {
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| HubError::Transport(format!("handshake with {remote_addr} failed: {e}")))?;
        debug!(remote = %remote_addr, "WebSocket handshake complete");
        Ok(Self {
            ws,
            remote_addr,
            decoder: FrameDecoder::new(),
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Send one message as a single binary frame.
    pub async fn send(&mut self, message: &ServerMessage) -> HubResult<()> {
        let frame = encode_frame(message)?;
        self.ws
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|e| HubError::Transport(format!("send to {} failed: {e}", self.remote_addr)))
    }

    /// Wait for at least one complete client message.
    ///
    /// `Ok(None)` once the viewer has gone. A decode failure is returned as
    /// the decoder's error ([`HubError::InvalidMessage`] or
    /// [`HubError::Codec`]); the connection cannot continue after one.
    /// Cancel-safe: partial frames stay in the decoder between calls.
    pub async fn recv(&mut self) -> HubResult<Option<Vec<ClientMessage>>> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let messages: Vec<ClientMessage> = self.decoder.feed(&data)?;
                    if !messages.is_empty() {
                        return Ok(Some(messages));
                    }
                }
                Some(Ok(Message::Text(_))) => {
                    debug!(remote = %self.remote_addr, "ignoring text message");
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                // tungstenite answers pings itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Err(HubError::Transport(format!(
                        "receive from {} failed: {e}",
                        self.remote_addr
                    )));
                }
            }
        }
    }

    /// Send a close frame. The peer may already be gone.
    pub async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            debug!(remote = %self.remote_addr, error = %e, "close failed");
        }
    }
}
