//! Assistant configuration from the environment
//!
//! `.env` is loaded first when present. Credentials are required; every
//! other setting falls back to the defaults of its section, and a malformed
//! number is logged and replaced by its default.

use crate::controller::DialogueConfig;
use crate::endpoint::EndpointConfig;
use crate::error::{Result, VoiceError};
use crate::llm::ChatConfig;
use crate::playback::PlaybackConfig;
use crate::recognition::RecognitionConfig;
use crate::signing::Credentials;
use crate::tts::SynthesisConfig;
use crate::wake::WakeConfig;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct AssistantConfig {
    pub credentials: Credentials,
    pub recognition: RecognitionConfig,
    pub chat: ChatConfig,
    pub synthesis: SynthesisConfig,
    pub playback: PlaybackConfig,
    pub dialogue: DialogueConfig,
    pub wake: WakeConfig,
    /// Save each turn's audio and summary under `recordings/`
    pub record_turns: bool,
}

impl AssistantConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let credentials = Credentials {
            app_id: env.required("APPID")?,
            api_key: env.required("API_KEY")?,
            api_secret: env.required("API_SECRET")?,
        };

        let mut recognition = RecognitionConfig::default();
        if let Some(url) = env.var("ASR_BASE_URL") {
            recognition.url = url;
        }

        let mut chat = ChatConfig::default();
        if let Some(url) = env.var("SPARK_BASE_URL") {
            chat.url = url;
        }
        if let Some(domain) = env.var("SPARK_API_VERSION") {
            chat.domain = domain;
        }
        chat.system_prompt = env.var("SPARK_SYSTEM_PROMPT");

        let defaults = SynthesisConfig::default();
        let synthesis = SynthesisConfig {
            url: env.var("TTS_BASE_URL").unwrap_or(defaults.url),
            voice: env.var("TTS_VOICE").unwrap_or(defaults.voice),
            speed: env.parse("TTS_SPEED", defaults.speed),
            volume: env.parse("TTS_VOLUME", defaults.volume),
            pitch: env.parse("TTS_PITCH", defaults.pitch),
            ..defaults
        };

        let mut playback = PlaybackConfig::default();
        if let Some(command) = env.var("PLAYER_COMMAND") {
            let parts: Vec<String> = command.split_whitespace().map(str::to_string).collect();
            if !parts.is_empty() {
                playback.command = parts;
            }
        }

        let mut dialogue = DialogueConfig {
            endpoint: EndpointConfig::from_secs(
                env.parse("SILENCE_THRESHOLD", 500),
                env.parse("MAX_SILENCE_SECS", 2.0),
                env.parse("INITIAL_WAIT_SECS", 5.0),
                env.parse("MAX_UTTERANCE_SECS", 60.0),
            ),
            ..Default::default()
        };
        if let Some(stops) = env.list("STOP_KEYWORDS") {
            dialogue.stop_phrases = stops;
        }
        if let Some(greeting) = env.var("WAKE_GREETING") {
            dialogue.greeting = Some(greeting);
        }

        let mut wake = WakeConfig::default();
        if let Some(words) = env.list("WAKE_WORDS") {
            wake.words = words;
        }
        wake.command = env
            .var("WAKE_COMMAND")
            .map(|c| c.split_whitespace().map(str::to_string).collect());
        if let Some(path) = env.var("WAKE_MODEL_PATH") {
            wake.model_path = PathBuf::from(path);
        }

        Ok(Self {
            credentials,
            recognition,
            chat,
            synthesis,
            playback,
            dialogue,
            wake,
            record_turns: env.flag("RECORD_TURNS"),
        })
    }

    /// Wake mode runs when a spotter command is configured.
    pub fn wake_mode(&self) -> bool {
        self.wake.command.is_some()
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    /// Non-empty, trimmed value.
    fn var(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String> {
        self.var(key)
            .ok_or_else(|| VoiceError::Config(format!("{} is not set", key)))
    }

    fn parse<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr + std::fmt::Display,
    {
        match self.var(key) {
            None => default,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!("Invalid {}={:?}, using default {}", key, raw, default);
                default
            }),
        }
    }

    fn flag(&self, key: &str) -> bool {
        matches!(
            self.var(key).as_deref().map(str::to_ascii_lowercase).as_deref(),
            Some("1" | "true" | "yes" | "on")
        )
    }

    /// Comma separated list; full-width commas count too.
    fn list(&self, key: &str) -> Option<Vec<String>> {
        let items: Vec<String> = self
            .var(key)?
            .split([',', '，'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        (!items.is_empty()).then_some(items)
    }
}
