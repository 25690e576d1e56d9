//! Wake-word source
//!
//! The keyword spotter runs as an external process that prints recognized
//! text, one line per result. A line containing a configured wake word
//! (spaces ignored, since spotters often separate CJK characters) becomes a
//! [`WakeEvent`].

use crate::error::{Result, VoiceError};
use crate::session::{SessionContext, SessionState};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeEvent {
    pub phrase: String,
}

/// Anything that yields wake events. `None` means the source is gone.
#[async_trait]
pub trait WakeSource: Send {
    async fn next_wake(&mut self) -> Option<WakeEvent>;
}

#[async_trait]
impl WakeSource for mpsc::Receiver<WakeEvent> {
    async fn next_wake(&mut self) -> Option<WakeEvent> {
        self.recv().await
    }
}

#[derive(Debug, Clone)]
pub struct WakeConfig {
    pub words: Vec<String>,
    /// Spotter program and arguments; `{model}` is replaced by the model path
    pub command: Option<Vec<String>>,
    pub model_path: PathBuf,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            words: ["一二三", "你好小知", "小智小智", "小知小知"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            command: None,
            model_path: PathBuf::from("./vosk-model-small-cn"),
        }
    }
}

/// First wake word contained in `line`, ignoring whitespace.
pub fn match_wake_word<'a>(words: &'a [String], line: &str) -> Option<&'a str> {
    let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return None;
    }
    words
        .iter()
        .find(|w| !w.is_empty() && compact.contains(w.as_str()))
        .map(String::as_str)
}

pub struct CommandWakeSource {
    words: Vec<String>,
    lines: Lines<BufReader<ChildStdout>>,
    _child: Child,
}

impl CommandWakeSource {
    /// Start the spotter. A missing model or command cannot be recovered from.
    pub fn spawn(cfg: &WakeConfig) -> Result<Self> {
        let command = cfg
            .command
            .as_ref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| VoiceError::Config("no wake-word command configured".into()))?;
        if !cfg.model_path.exists() {
            return Err(VoiceError::Config(format!(
                "wake-word model not found at {}",
                cfg.model_path.display()
            )));
        }
        if cfg.words.is_empty() {
            return Err(VoiceError::Config("wake-word list is empty".into()));
        }

        let model = cfg.model_path.to_string_lossy();
        let args: Vec<String> = command[1..]
            .iter()
            .map(|arg| arg.replace("{model}", &model))
            .collect();

        let mut child = Command::new(&command[0])
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VoiceError::Config(format!("cannot start wake-word spotter {}: {}", command[0], e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| VoiceError::Config("wake-word spotter has no stdout".into()))?;

        info!("👂 Listening for wake words: {}", cfg.words.join(", "));
        Ok(Self {
            words: cfg.words.clone(),
            lines: BufReader::new(stdout).lines(),
            _child: child,
        })
    }
}

#[async_trait]
impl WakeSource for CommandWakeSource {
    async fn next_wake(&mut self) -> Option<WakeEvent> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    warn!("Wake-word spotter exited");
                    return None;
                }
                Err(e) => {
                    warn!("Failed to read from wake-word spotter: {}", e);
                    return None;
                }
            };
            debug!("Spotter heard: {}", line);
            if let Some(word) = match_wake_word(&self.words, &line) {
                info!("✨ Wake word detected: {}", word);
                return Some(WakeEvent {
                    phrase: word.to_string(),
                });
            }
        }
    }
}

/// Forward wake events to the controller from a background task.
///
/// Wakes heard while the dialogue is busy or paused are dropped, so a stale
/// wake word can never start a new dialogue over the top of the current one.
pub fn spawn_wake_listener(
    mut source: Box<dyn WakeSource>,
    ctx: Arc<SessionContext>,
) -> mpsc::Receiver<WakeEvent> {
    let (tx, rx) = mpsc::channel(1);
    let interrupt = ctx.interrupt_token();

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = interrupt.cancelled() => break,
                event = source.next_wake() => event,
            };
            let Some(event) = event else { break };

            if ctx.is_paused() || ctx.state() != SessionState::Idle {
                debug!("Ignoring wake word '{}' while {}", event.phrase, ctx.state());
                continue;
            }
            if tx.try_send(event).is_err() && tx.is_closed() {
                break;
            }
        }
        debug!("Wake listener stopped");
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words() -> Vec<String> {
        WakeConfig::default().words
    }

    #[test]
    fn matches_ignoring_spaces() {
        assert_eq!(match_wake_word(&words(), "你 好 小 知"), Some("你好小知"));
        assert_eq!(match_wake_word(&words(), "嗯 一 二 三 四"), Some("一二三"));
        assert_eq!(match_wake_word(&words(), "今天天气"), None);
        assert_eq!(match_wake_word(&words(), "   "), None);
    }

    #[test]
    fn missing_model_is_fatal() {
        let cfg = WakeConfig {
            command: Some(vec!["cat".into()]),
            model_path: PathBuf::from("/nonexistent/model"),
            ..Default::default()
        };
        assert!(matches!(CommandWakeSource::spawn(&cfg), Err(VoiceError::Config(_))));
    }

    #[test]
    fn missing_command_is_fatal() {
        assert!(CommandWakeSource::spawn(&WakeConfig::default()).is_err());
    }

    #[tokio::test]
    async fn listener_drops_wakes_while_busy() {
        let ctx = Arc::new(SessionContext::new());
        let (src_tx, src_rx) = mpsc::channel(8);
        let mut wakes = spawn_wake_listener(Box::new(src_rx), ctx.clone());

        ctx.set_paused(true);
        ctx.set_state(SessionState::Speaking);
        src_tx.send(WakeEvent { phrase: "一二三".into() }).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(wakes.try_recv().is_err());

        ctx.set_paused(false);
        ctx.set_state(SessionState::Idle);
        src_tx.send(WakeEvent { phrase: "小知小知".into() }).await.unwrap();
        let event = tokio::time::timeout(std::time::Duration::from_secs(1), wakes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.phrase, "小知小知");
    }

    #[tokio::test]
    async fn reads_wake_events_from_spotter_output() {
        let model = tempfile::tempdir().unwrap();
        let cfg = WakeConfig {
            command: Some(vec![
                "sh".into(),
                "-c".into(),
                "echo '{model}' >/dev/null; echo '随便 说 说'; echo '小 智 小 智'".into(),
            ]),
            model_path: model.path().to_path_buf(),
            ..Default::default()
        };
        let mut source = CommandWakeSource::spawn(&cfg).unwrap();

        let event = source.next_wake().await.unwrap();
        assert_eq!(event.phrase, "小智小智");
        assert!(source.next_wake().await.is_none());
    }
}
