//! Microphone capture
//!
//! Audio is 16-bit PCM, mono, 16 kHz, delivered in fixed 80 ms frames. The
//! PulseAudio simple API blocks on `read`, so capture runs on its own OS
//! thread and hands frames to async code over a bounded channel.

use crate::error::{Result, VoiceError};
use async_trait::async_trait;
use libpulse_binding as pulse;
use libpulse_simple_binding as psimple;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

pub const SAMPLE_RATE: u32 = 16000;
pub const CHANNELS: u8 = 1;
/// Samples per frame (80 ms).
pub const FRAME_SAMPLES: usize = 1280;
pub const FRAMES_PER_SECOND: f32 = SAMPLE_RATE as f32 / FRAME_SAMPLES as f32;

/// One fixed-size block of PCM16 mono audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    /// A frame where every sample has the given amplitude. Handy for tests and demos.
    pub fn constant(amplitude: i16) -> Self {
        Self::new(vec![amplitude; FRAME_SAMPLES])
    }

    /// Peak absolute amplitude of the frame.
    pub fn peak(&self) -> u16 {
        self.samples
            .iter()
            .map(|s| s.unsigned_abs())
            .max()
            .unwrap_or(0)
    }

    /// Little-endian byte view for the wire.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for &sample in &self.samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }

    pub fn duration_ms(&self) -> u64 {
        self.samples.len() as u64 * 1000 / SAMPLE_RATE as u64
    }
}

/// Anything that can produce a stream of frames for one listening phase.
///
/// Dropping the returned receiver must stop the underlying capture.
#[async_trait]
pub trait AudioInput: Send + Sync {
    async fn open(&self) -> Result<mpsc::Receiver<AudioFrame>>;
}

/// Default PulseAudio source, opened fresh for every listening phase.
#[derive(Debug, Clone)]
pub struct PulseMicrophone {
    app_name: String,
    queue_depth: usize,
}

impl PulseMicrophone {
    pub fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
            queue_depth: 64,
        }
    }
}

#[async_trait]
impl AudioInput for PulseMicrophone {
    async fn open(&self) -> Result<mpsc::Receiver<AudioFrame>> {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let (ready_tx, ready_rx) = oneshot::channel();
        let app_name = self.app_name.clone();

        std::thread::Builder::new()
            .name("mic-capture".into())
            .spawn(move || {
                let capture = match connect(&app_name) {
                    Ok(capture) => {
                        let _ = ready_tx.send(Ok(()));
                        capture
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                capture_loop(capture, tx);
            })?;

        ready_rx.await.map_err(|_| VoiceError::ChannelClosed)??;
        info!("🎤 Microphone open ({} Hz, {} ms frames)", SAMPLE_RATE, FRAME_SAMPLES as u32 * 1000 / SAMPLE_RATE);
        Ok(rx)
    }
}

fn connect(app_name: &str) -> Result<psimple::Simple> {
    let spec = pulse::sample::Spec {
        format: pulse::sample::Format::S16le,
        channels: CHANNELS,
        rate: SAMPLE_RATE,
    };

    psimple::Simple::new(
        None,
        app_name,
        pulse::stream::Direction::Record,
        None,
        "microphone",
        &spec,
        None,
        None,
    )
    .map_err(|e| VoiceError::Audio(format!("Failed to open PulseAudio source: {}", e)))
}

fn capture_loop(capture: psimple::Simple, tx: mpsc::Sender<AudioFrame>) {
    loop {
        let mut samples = vec![0i16; FRAME_SAMPLES];
        if let Err(e) = capture.read(bytemuck::cast_slice_mut(&mut samples)) {
            error!("❌ Microphone read failed: {}", e);
            break;
        }
        for sample in samples.iter_mut() {
            *sample = i16::from_le(*sample);
        }

        if tx.blocking_send(AudioFrame::new(samples)).is_err() {
            debug!("Frame receiver dropped, stopping capture");
            break;
        }
    }
    info!("Microphone capture stopped");
}
