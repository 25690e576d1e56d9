//! voiceloop - spoken dialogue with a remote recognizer, chat model and voice
//!
//! With `WAKE_COMMAND` set the assistant sleeps until the keyword spotter
//! hears a wake word; otherwise it listens continuously. Ctrl-C stops it.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use voiceloop::audio::PulseMicrophone;
use voiceloop::config::AssistantConfig;
use voiceloop::controller::{Collaborators, DialogueController};
use voiceloop::llm::SparkChat;
use voiceloop::playback::PlaybackEngine;
use voiceloop::recorder::TurnRecorder;
use voiceloop::session::SessionContext;
use voiceloop::tts::XfyunTts;
use voiceloop::wake::{spawn_wake_listener, CommandWakeSource};
use voiceloop::warmup::{RecognizerConnector, WarmSlot};

/// Warm recognizer connections older than this are replaced.
const RECOGNIZER_MAX_IDLE: Duration = Duration::from_secs(8);
const CHAT_MAX_IDLE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting voiceloop");

    let cfg = AssistantConfig::from_env().context("loading configuration")?;

    let ctx = Arc::new(SessionContext::new());
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                return;
            }
            ctx.interrupt();
        });
    }

    // The spotter has to be up before anything else is started.
    let wake_source = if cfg.wake_mode() {
        Some(CommandWakeSource::spawn(&cfg.wake).context("starting the wake-word spotter")?)
    } else {
        None
    };

    let recognizer = WarmSlot::new(
        "recognizer",
        RecognizerConnector {
            config: cfg.recognition.clone(),
            credentials: cfg.credentials.clone(),
        },
        RECOGNIZER_MAX_IDLE,
    );
    let chat = Arc::new(SparkChat::new(cfg.chat.clone(), cfg.credentials.clone(), CHAT_MAX_IDLE));
    let tts = Arc::new(XfyunTts::new(cfg.synthesis.clone(), cfg.credentials.clone()));
    let playback = Arc::new(PlaybackEngine::new(tts, cfg.playback.clone()));

    let parts = Collaborators {
        audio: Arc::new(PulseMicrophone::new("voiceloop")),
        recognizer,
        chat,
        playback,
        recorder: TurnRecorder::new(cfg.record_turns),
    };
    let mut controller = DialogueController::new(cfg.dialogue.clone(), ctx.clone(), parts);

    match wake_source {
        Some(source) => {
            let wakes = spawn_wake_listener(Box::new(source), ctx.clone());
            controller.run_with_wake(wakes).await;
        }
        None => controller.run_continuous().await,
    }

    info!("👋 voiceloop stopped after {} turns", controller.turns());
    Ok(())
}
