//! Speech synthesis client
//!
//! The whole reply goes out in one request; encoded audio comes back in
//! chunks which a reader task forwards, in order, as [`SynthesisEvent`]s.

use crate::error::{Result, VoiceError};
use crate::signing::{sign_url, Credentials};
use crate::ws::{self, WsStream};
use async_trait::async_trait;
use base64::engine::general_purpose;
use base64::Engine;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info};

#[derive(Debug)]
pub enum SynthesisEvent {
    /// Next chunk of encoded audio
    Audio(Vec<u8>),
    /// End-of-stream marker
    Done,
    Failed(VoiceError),
}

/// Turns reply text into a stream of audio chunks.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<mpsc::Receiver<SynthesisEvent>>;
}

/// Parameters of the synthesis service
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    pub url: String,
    /// Output encoding; `lame` is MP3
    pub encoding: String,
    pub sample_rate: String,
    pub voice: String,
    pub speed: u8,
    pub volume: u8,
    pub pitch: u8,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            url: "wss://tts-api.xfyun.cn/v2/tts".to_string(),
            encoding: "lame".to_string(),
            sample_rate: "audio/L16;rate=16000".to_string(),
            voice: "xiaoyan".to_string(),
            speed: 50,
            volume: 70,
            pitch: 50,
        }
    }
}

#[derive(Debug, Serialize)]
struct SynthesisRequest<'a> {
    common: Common<'a>,
    business: Business<'a>,
    data: TextData,
}

#[derive(Debug, Serialize)]
struct Common<'a> {
    app_id: &'a str,
}

#[derive(Debug, Serialize)]
struct Business<'a> {
    #[serde(rename = "aue")]
    encoding: &'a str,
    /// Streamed MP3 frames
    #[serde(skip_serializing_if = "Option::is_none")]
    sfl: Option<u8>,
    #[serde(rename = "auf")]
    sample_rate: &'a str,
    #[serde(rename = "vcn")]
    voice: &'a str,
    speed: u8,
    volume: u8,
    pitch: u8,
    bgs: u8,
    tte: &'static str,
}

#[derive(Debug, Serialize)]
struct TextData {
    text: String,
    status: u8,
}

#[derive(Debug, Deserialize)]
struct SynthesisResponse {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<AudioPayload>,
}

#[derive(Debug, Deserialize)]
struct AudioPayload {
    #[serde(default)]
    status: u8,
    #[serde(default)]
    audio: String,
}

pub struct XfyunTts {
    config: SynthesisConfig,
    credentials: Credentials,
}

impl XfyunTts {
    pub fn new(config: SynthesisConfig, credentials: Credentials) -> Self {
        Self { config, credentials }
    }

    fn request(&self, text: &str) -> SynthesisRequest<'_> {
        let cfg = &self.config;
        SynthesisRequest {
            common: Common {
                app_id: &self.credentials.app_id,
            },
            business: Business {
                encoding: &cfg.encoding,
                sfl: (cfg.encoding == "lame").then_some(1),
                sample_rate: &cfg.sample_rate,
                voice: &cfg.voice,
                speed: cfg.speed,
                volume: cfg.volume,
                pitch: cfg.pitch,
                bgs: 0,
                tte: "UTF8",
            },
            data: TextData {
                text: general_purpose::STANDARD.encode(text.as_bytes()),
                status: 2,
            },
        }
    }
}

#[async_trait]
impl Synthesizer for XfyunTts {
    async fn synthesize(&self, text: &str) -> Result<mpsc::Receiver<SynthesisEvent>> {
        let url = sign_url(&self.config.url, &self.credentials)?;
        let (mut sink, stream) = ws::open(&url).await?;
        ws::send_json(&mut sink, &self.request(text)).await?;
        info!("🔊 Synthesis requested ({} chars, voice {})", text.chars().count(), self.config.voice);

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            // Keep the write half alive until the reader is done.
            let _sink = sink;
            read_audio(stream, tx).await;
        });
        Ok(rx)
    }
}

async fn read_audio(mut stream: WsStream, tx: mpsc::Sender<SynthesisEvent>) {
    let mut chunks = 0usize;

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(Message::Close(_)) => break,
            Ok(message) => message,
            Err(e) => {
                error!("❌ Synthesis socket error: {}", e);
                let _ = tx.send(SynthesisEvent::Failed(e.into())).await;
                return;
            }
        };
        let Some(text) = ws::text_payload(&message) else {
            continue;
        };

        let response: SynthesisResponse = match serde_json::from_str(&text) {
            Ok(response) => response,
            Err(e) => {
                let _ = tx.send(SynthesisEvent::Failed(e.into())).await;
                return;
            }
        };
        if response.code != 0 {
            error!("❌ Synthesis failed: {} {}", response.code, response.message);
            let _ = tx
                .send(SynthesisEvent::Failed(VoiceError::protocol(response.code, response.message)))
                .await;
            return;
        }
        let Some(data) = response.data else {
            continue;
        };

        if !data.audio.is_empty() {
            match general_purpose::STANDARD.decode(&data.audio) {
                Ok(bytes) => {
                    chunks += 1;
                    if tx.send(SynthesisEvent::Audio(bytes)).await.is_err() {
                        debug!("Synthesis receiver dropped");
                        return;
                    }
                }
                Err(e) => error!("Failed to decode synthesized audio: {}", e),
            }
        }
        if data.status == 2 {
            debug!("Synthesis finished after {} chunks", chunks);
            let _ = tx.send(SynthesisEvent::Done).await;
            return;
        }
    }

    let _ = tx.send(SynthesisEvent::Failed(VoiceError::ConnectionClosed)).await;
}
