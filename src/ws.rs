//! Websocket plumbing shared by the recognition, chat and synthesis clients.

use crate::error::{Result, VoiceError};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of a service connection
pub type WsSink = SplitSink<Socket, Message>;

/// Read half of a service connection
pub type WsStream = SplitStream<Socket>;

/// Longest wait for a TCP connect plus websocket handshake
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Open a websocket and split it into its two halves.
pub async fn open(url: &str) -> Result<(WsSink, WsStream)> {
    open_within(url, CONNECT_TIMEOUT).await
}

/// Like [`open`] but gives up once `limit` has passed without a handshake.
pub async fn open_within(url: &str, limit: Duration) -> Result<(WsSink, WsStream)> {
    let (socket, resp) = tokio::time::timeout(limit, connect_async(url))
        .await
        .map_err(|_| VoiceError::Connection(format!("handshake timed out after {:?}", limit)))?
        .map_err(|e| VoiceError::Connection(e.to_string()))?;
    debug!("WebSocket handshake response: {:?}", resp.status());
    Ok(socket.split())
}

/// Serialize `msg` and send it as one text frame.
pub async fn send_json<T: Serialize>(sink: &mut WsSink, msg: &T) -> Result<()> {
    let json = serde_json::to_string(msg)?;
    sink.send(Message::Text(json.into())).await?;
    Ok(())
}

/// Payload of a text or UTF-8 binary frame. `None` for control frames.
pub fn text_payload(msg: &Message) -> Option<String> {
    match msg {
        Message::Text(text) => Some(text.to_string()),
        Message::Binary(bytes) => String::from_utf8(bytes.to_vec()).ok(),
        _ => None,
    }
}
