//! Error taxonomy shared by every stage of the turn pipeline.

use tokio_tungstenite::tungstenite::Error as WsError;

/// Errors surfaced by the voice pipeline.
///
/// The first four variants are the ones the dialogue controller branches on;
/// the rest are transport details that get folded into them by
/// [`VoiceError::is_connection`].
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Service error {code}: {message}")]
    Protocol { code: i64, message: String },

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Playback error: {0}")]
    Playback(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Channel closed")]
    ChannelClosed,
}

impl VoiceError {
    /// True for handshake and network failures, where a cold reconnect is worth trying.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            VoiceError::Connection(_) | VoiceError::WebSocket(_) | VoiceError::ConnectionClosed
        )
    }

    pub fn protocol(code: i64, message: impl Into<String>) -> Self {
        VoiceError::Protocol {
            code,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, VoiceError>;
