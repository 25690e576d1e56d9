//! Streaming speech recognition session
//!
//! One session covers one utterance. Audio goes out as `first`, `continue`
//! and `last` frames; a reader task turns server messages into
//! [`RecognitionEvent`]s on a channel so the controller can select over them
//! alongside the microphone.

use crate::audio::{AudioFrame, SAMPLE_RATE};
use crate::error::{Result, VoiceError};
use crate::signing::{sign_url, Credentials};
use crate::transcript::{Fragment, FragmentKind};
use crate::ws::{self, WsSink, WsStream};
use base64::engine::general_purpose;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Parameters of the recognition service
#[derive(Debug, Clone)]
pub struct RecognitionConfig {
    pub url: String,
    pub domain: String,
    pub language: String,
    pub accent: String,
    /// Server-side end-of-speech timeout
    pub end_of_speech_timeout_ms: u32,
    /// `wpgs` turns on replace/append partial results
    pub partial_mode: String,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            url: "wss://iat-api.xfyun.cn/v2/iat".to_string(),
            domain: "iat".to_string(),
            language: "zh_cn".to_string(),
            accent: "mandarin".to_string(),
            end_of_speech_timeout_ms: 5000,
            partial_mode: "wpgs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    First = 0,
    Continue = 1,
    Last = 2,
}

#[derive(Debug, Serialize)]
struct CommonParams {
    app_id: String,
}

#[derive(Debug, Clone, Serialize)]
struct BusinessParams {
    domain: String,
    language: String,
    accent: String,
    #[serde(rename = "vad_eos")]
    end_of_speech_timeout_ms: u32,
    #[serde(rename = "dwa")]
    partial_mode: String,
}

#[derive(Debug, Serialize)]
struct AudioData {
    status: u8,
    format: String,
    audio: String,
    encoding: &'static str,
}

#[derive(Debug, Serialize)]
struct ClientFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    common: Option<CommonParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    business: Option<BusinessParams>,
    data: AudioData,
}

#[derive(Debug, Deserialize)]
struct ServerMessage {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    sid: Option<String>,
    #[serde(default)]
    data: Option<ServerData>,
}

#[derive(Debug, Deserialize)]
struct ServerData {
    #[serde(default)]
    status: u8,
    #[serde(default)]
    result: Option<RecognitionResult>,
}

#[derive(Debug, Deserialize)]
struct RecognitionResult {
    #[serde(default)]
    ws: Vec<WordSlot>,
    #[serde(default)]
    pgs: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WordSlot {
    #[serde(default)]
    cw: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    w: String,
}

/// What the reader task reports to the controller
#[derive(Debug)]
pub enum RecognitionEvent {
    Fragment(Fragment),
    /// The server sent its last result for this utterance
    Completed,
    /// Non-zero service code or transport failure; the session is over
    Failed(VoiceError),
    Closed,
}

/// Turn one server message into at most one fragment plus a completion flag.
fn interpret(msg: ServerMessage) -> Result<(Option<Fragment>, bool)> {
    if msg.code != 0 {
        return Err(VoiceError::protocol(msg.code, msg.message));
    }
    let Some(data) = msg.data else {
        return Ok((None, false));
    };
    let is_final = data.status == FrameStatus::Last as u8;

    let fragment = data.result.and_then(|result| {
        let text: String = result
            .ws
            .iter()
            .flat_map(|slot| slot.cw.iter())
            .map(|c| c.w.as_str())
            .collect();
        if text.is_empty() {
            return None;
        }
        Some(Fragment {
            text,
            is_final,
            kind: FragmentKind::from_pgs(result.pgs.as_deref()),
        })
    });

    Ok((fragment, is_final))
}

pub struct RecognitionSession {
    app_id: String,
    business: BusinessParams,
    sink: WsSink,
    events: mpsc::Receiver<RecognitionEvent>,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    frames_sent: u64,
    finished: bool,
}

impl RecognitionSession {
    /// Sign the configured URL and connect.
    pub async fn connect(cfg: &RecognitionConfig, creds: &Credentials) -> Result<Self> {
        let url = sign_url(&cfg.url, creds)?;
        Self::connect_url(&url, cfg, &creds.app_id).await
    }

    /// Connect to an already signed URL.
    pub async fn connect_url(url: &str, cfg: &RecognitionConfig, app_id: &str) -> Result<Self> {
        let started = Instant::now();
        let (sink, stream) = ws::open(url).await?;
        info!("🔗 Recognizer connected in {:?}", started.elapsed());

        let (tx, events) = mpsc::channel(64);
        let open = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_loop(stream, tx, open.clone()));

        Ok(Self {
            app_id: app_id.to_string(),
            business: BusinessParams {
                domain: cfg.domain.clone(),
                language: cfg.language.clone(),
                accent: cfg.accent.clone(),
                end_of_speech_timeout_ms: cfg.end_of_speech_timeout_ms,
                partial_mode: cfg.partial_mode.clone(),
            },
            sink,
            events,
            open,
            reader,
            frames_sent: 0,
            finished: false,
        })
    }

    /// Still connected and no last frame sent yet.
    pub fn is_open(&self) -> bool {
        !self.finished && self.open.load(Ordering::SeqCst)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Stream one frame. The first call carries the session parameters.
    pub async fn send_audio(&mut self, frame: &AudioFrame) -> Result<()> {
        if self.finished {
            debug!("Dropping audio sent after the last frame");
            return Ok(());
        }
        let status = if self.frames_sent == 0 {
            FrameStatus::First
        } else {
            FrameStatus::Continue
        };
        let audio = general_purpose::STANDARD.encode(frame.to_le_bytes());
        self.send_frame(status, audio).await?;
        self.frames_sent += 1;
        Ok(())
    }

    /// Send the empty `last` frame. Safe to call more than once.
    pub async fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        info!("📤 Sending last frame after {} audio frames", self.frames_sent);
        self.send_frame(FrameStatus::Last, String::new()).await
    }

    async fn send_frame(&mut self, status: FrameStatus, audio: String) -> Result<()> {
        let with_params = self.frames_sent == 0;
        let frame = ClientFrame {
            common: with_params.then(|| CommonParams {
                app_id: self.app_id.clone(),
            }),
            business: with_params.then(|| self.business.clone()),
            data: AudioData {
                status: status as u8,
                format: format!("audio/L16;rate={}", SAMPLE_RATE),
                audio,
                encoding: "raw",
            },
        };
        if let Err(e) = ws::send_json(&mut self.sink, &frame).await {
            self.open.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    /// Next event from the reader task, `None` once it has exited.
    pub async fn next_event(&mut self) -> Option<RecognitionEvent> {
        self.events.recv().await
    }

    pub async fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        if let Err(e) = self.sink.send(Message::Close(None)).await {
            debug!("Close frame not delivered: {}", e);
        }
        self.reader.abort();
    }
}

impl Drop for RecognitionSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(mut stream: WsStream, tx: mpsc::Sender<RecognitionEvent>, open: Arc<AtomicBool>) {
    debug!("Recognition reader started");

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(Message::Close(frame)) => {
                debug!("Recognizer closed the socket: {:?}", frame);
                break;
            }
            Ok(message) => message,
            Err(e) => {
                error!("❌ Recognizer socket error: {}", e);
                let _ = tx.send(RecognitionEvent::Failed(e.into())).await;
                break;
            }
        };
        let Some(text) = ws::text_payload(&message) else {
            continue;
        };

        let parsed = match serde_json::from_str::<ServerMessage>(&text) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Unparseable recognizer message: {} ({})", e, text);
                continue;
            }
        };
        if let Some(sid) = &parsed.sid {
            debug!("Recognizer message for sid {}", sid);
        }

        match interpret(parsed) {
            Ok((fragment, completed)) => {
                if let Some(fragment) = fragment {
                    debug!("📝 Fragment ({:?}, final={}): {}", fragment.kind, fragment.is_final, fragment.text);
                    if tx.send(RecognitionEvent::Fragment(fragment)).await.is_err() {
                        break;
                    }
                }
                if completed {
                    let _ = tx.send(RecognitionEvent::Completed).await;
                }
            }
            Err(e) => {
                error!("❌ Recognizer rejected the session: {}", e);
                let _ = tx.send(RecognitionEvent::Failed(e)).await;
                break;
            }
        }
    }

    open.store(false, Ordering::SeqCst);
    let _ = tx.send(RecognitionEvent::Closed).await;
    debug!("Recognition reader terminated");
}
