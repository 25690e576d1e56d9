//! Turn recorder for diagnostics - saves each utterance and its outcome

use crate::audio::{AudioFrame, CHANNELS, SAMPLE_RATE};
use chrono::Local;
use hound::{SampleFormat, WavSpec, WavWriter};
use serde::Serialize;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// What ended up in `turn.json`
#[derive(Debug, Clone, Serialize)]
pub struct TurnRecord {
    pub turn: u64,
    pub outcome: String,
    pub query: Option<String>,
    pub response: Option<String>,
    pub spoken: bool,
    pub audio_ms: u64,
}

pub struct TurnRecorder {
    enabled: bool,
    base: PathBuf,           // ./recordings/20250603_153055/
    cur_dir: Option<PathBuf>,
    cur_audio: Option<WavWriter<BufWriter<File>>>,
    cur_samples: u64,
}

impl TurnRecorder {
    pub fn new(enabled: bool) -> Self {
        let ts = Local::now().format("%Y%m%d_%H%M%S").to_string();
        Self::with_base(enabled, PathBuf::from("recordings").join(ts))
    }

    pub fn with_base(enabled: bool, base: PathBuf) -> Self {
        if enabled {
            if let Err(e) = fs::create_dir_all(&base) {
                error!("Failed to create recordings directory: {}", e);
            } else {
                info!("Recording enabled, saving to: {:?}", base);
            }
        }

        Self {
            enabled,
            base,
            cur_dir: None,
            cur_audio: None,
            cur_samples: 0,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn start_turn(&mut self, turn_id: u64) {
        if !self.enabled {
            return;
        }
        self.abandon();

        // One directory per turn
        let dir = self.base.join(format!(
            "turn_{:03}_{}",
            turn_id,
            Local::now().format("%H%M%S%.3f")
        ));
        if let Err(e) = fs::create_dir_all(&dir) {
            error!("Failed to create turn directory: {}", e);
            return;
        }
        debug!("Starting recording for turn {} in {:?}", turn_id, dir);

        let spec = WavSpec {
            channels: u16::from(CHANNELS),
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        match WavWriter::create(dir.join("utterance.wav"), spec) {
            Ok(writer) => self.cur_audio = Some(writer),
            Err(e) => error!("Failed to create audio file: {}", e),
        }
        self.cur_dir = Some(dir);
        self.cur_samples = 0;
    }

    pub fn push_frame(&mut self, frame: &AudioFrame) {
        let Some(writer) = self.cur_audio.as_mut() else {
            return;
        };
        for &sample in &frame.samples {
            if let Err(e) = writer.write_sample(sample) {
                error!("Failed to write audio sample: {}", e);
                self.cur_audio = None;
                return;
            }
        }
        self.cur_samples += frame.samples.len() as u64;
    }

    /// Close the WAV file and write the turn summary next to it.
    pub fn finish_turn(&mut self, mut record: TurnRecord) {
        if let Some(writer) = self.cur_audio.take() {
            if let Err(e) = writer.finalize() {
                error!("Failed to finalize audio file: {}", e);
            }
        }
        let Some(dir) = self.cur_dir.take() else {
            return;
        };

        record.audio_ms = self.cur_samples * 1000 / u64::from(SAMPLE_RATE);
        match serde_json::to_vec_pretty(&record) {
            Ok(json) => {
                if let Err(e) = fs::write(dir.join("turn.json"), json) {
                    error!("Failed to write turn summary: {}", e);
                }
            }
            Err(e) => error!("Failed to serialize turn summary: {}", e),
        }
        debug!("Closed recording for turn {}", record.turn);
    }

    fn abandon(&mut self) {
        if let Some(writer) = self.cur_audio.take() {
            let _ = writer.finalize();
        }
        self.cur_dir = None;
    }
}
