//! Dialogue controller - the turn state machine
//!
//! One turn runs `Listening -> Finalizing -> Thinking -> Speaking` and comes
//! back to `Idle`. The listening routine is the only writer of the transcript
//! and checks it for stop phrases after every fragment. A stop phrase or an
//! external interrupt moves the controller to `Terminated` from any phase.
//!
//! Sessions run turns back to back. In wake mode the controller waits for a
//! wake event between sessions; in continuous mode it starts the next session
//! right away.

use crate::audio::AudioInput;
use crate::endpoint::{EndReason, EndpointConfig, EndpointDetector, EndpointEvent};
use crate::error::{Result, VoiceError};
use crate::llm::{ChatMessage, ChatModel, Role};
use crate::playback::PlaybackEngine;
use crate::recognition::{RecognitionEvent, RecognitionSession};
use crate::recorder::{TurnRecord, TurnRecorder};
use crate::session::{SessionContext, SessionState};
use crate::transcript::{Fragment, StopPhrases, Transcript};
use crate::wake::WakeEvent;
use crate::warmup::{RecognizerConnector, WarmSlot};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, timeout};
use tracing::{debug, error, info, warn};

/// Behaviour of the turn loop
#[derive(Debug, Clone)]
pub struct DialogueConfig {
    pub endpoint: EndpointConfig,
    /// How long late fragments may still arrive after the last audio frame
    pub grace: Duration,
    pub reply_timeout: Duration,
    pub playback_timeout: Duration,
    pub stop_phrases: Vec<String>,
    /// Spoken instead of a reply when the chat service fails
    pub apology: String,
    /// Spoken after a wake word, before the first turn
    pub greeting: Option<String>,
    /// Leave the dialogue when a turn hears nothing
    pub end_session_on_silence: bool,
    /// Messages kept in the history, oldest dropped first
    pub history_limit: usize,
    pub warm_chat: bool,
    /// Pause after an aborted turn
    pub retry_backoff: Duration,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            grace: Duration::from_millis(200),
            reply_timeout: Duration::from_secs(30),
            playback_timeout: Duration::from_secs(60),
            stop_phrases: ["停止", "退出", "结束程序", "关闭", "拜拜", "再见"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            apology: "抱歉，星火大模型连接出现问题，无法获取回复。".to_string(),
            greeting: Some("你好，我在！".to_string()),
            end_session_on_silence: true,
            history_limit: 20,
            warm_chat: true,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// One answered query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogueTurn {
    pub query: String,
    pub response: String,
    /// Playback ran to completion
    pub spoken: bool,
}

#[derive(Debug)]
pub enum TurnOutcome {
    Spoke(DialogueTurn),
    /// Nobody spoke before the initial wait ran out
    NoSpeech,
    /// Speech was heard but nothing was recognized
    Empty,
    /// The turn failed before a query was formed
    Aborted(VoiceError),
    /// Refused to listen while a reply is still playing
    Paused,
    Terminated,
}

impl TurnOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TurnOutcome::Spoke(_) => "spoke",
            TurnOutcome::NoSpeech => "no-speech",
            TurnOutcome::Empty => "empty",
            TurnOutcome::Aborted(_) => "aborted",
            TurnOutcome::Paused => "paused",
            TurnOutcome::Terminated => "terminated",
        }
    }
}

/// What the listening routine produced
#[derive(Debug)]
enum Heard {
    Query(String),
    Nothing,
    Empty,
    Stop(String),
    Interrupted,
}

/// Why the listening loop stopped reading audio
#[derive(Debug)]
enum ListenEnd {
    Local(EndReason),
    Remote,
    NoSpeech,
    Stop(String),
    Interrupted,
}

enum Spoken {
    Done,
    Failed,
    Interrupted,
}

/// Everything the controller drives
pub struct Collaborators {
    pub audio: Arc<dyn AudioInput>,
    pub recognizer: WarmSlot<RecognizerConnector>,
    pub chat: Arc<dyn ChatModel>,
    pub playback: Arc<PlaybackEngine>,
    pub recorder: TurnRecorder,
}

pub struct DialogueController {
    cfg: DialogueConfig,
    ctx: Arc<SessionContext>,
    audio: Arc<dyn AudioInput>,
    recognizer: WarmSlot<RecognizerConnector>,
    chat: Arc<dyn ChatModel>,
    playback: Arc<PlaybackEngine>,
    recorder: TurnRecorder,
    stops: StopPhrases,
    history: Vec<ChatMessage>,
    turns: u64,
}

impl DialogueController {
    pub fn new(cfg: DialogueConfig, ctx: Arc<SessionContext>, parts: Collaborators) -> Self {
        let stops = StopPhrases::new(cfg.stop_phrases.iter().cloned());
        Self {
            cfg,
            ctx,
            audio: parts.audio,
            recognizer: parts.recognizer,
            chat: parts.chat,
            playback: parts.playback,
            recorder: parts.recorder,
            stops,
            history: Vec::new(),
            turns: 0,
        }
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn turns(&self) -> u64 {
        self.turns
    }

    /// Run one full turn and return to `Idle`, or to `Terminated`.
    pub async fn run_turn(&mut self) -> TurnOutcome {
        if self.ctx.is_interrupted() || !self.ctx.should_continue() {
            self.terminate().await;
            return TurnOutcome::Terminated;
        }
        if self.ctx.is_paused() {
            warn!("Not listening while a reply is playing");
            return TurnOutcome::Paused;
        }

        self.turns += 1;
        let turn = self.turns;
        self.recorder.start_turn(turn);
        let mut record = TurnRecord {
            turn,
            outcome: String::new(),
            query: None,
            response: None,
            spoken: false,
            audio_ms: 0,
        };

        let outcome = self.drive_turn(&mut record).await;

        record.outcome = outcome.label().to_string();
        self.recorder.finish_turn(record);
        if !matches!(outcome, TurnOutcome::Terminated) {
            self.ctx.set_state(SessionState::Idle);
        }
        debug!("Turn {} ended: {}", turn, outcome.label());
        outcome
    }

    async fn drive_turn(&mut self, record: &mut TurnRecord) -> TurnOutcome {
        if !self.recognizer.is_primed() {
            self.ctx.set_state(SessionState::WarmingUp);
            self.recognizer.prime();
        }
        if self.cfg.warm_chat {
            self.chat.warm().await;
        }

        let query = match self.listen().await {
            Ok(Heard::Query(query)) => query,
            Ok(Heard::Nothing) => {
                info!("😶 No speech detected");
                return TurnOutcome::NoSpeech;
            }
            Ok(Heard::Empty) => {
                info!("Nothing recognized");
                return TurnOutcome::Empty;
            }
            Ok(Heard::Stop(phrase)) => {
                info!("🛑 Stop phrase '{}' heard, ending the dialogue", phrase);
                self.terminate().await;
                return TurnOutcome::Terminated;
            }
            Ok(Heard::Interrupted) => {
                self.terminate().await;
                return TurnOutcome::Terminated;
            }
            Err(e) => {
                error!("❌ Listening failed: {}", e);
                return TurnOutcome::Aborted(e);
            }
        };
        record.query = Some(query.clone());

        let Some(response) = self.think(&query).await else {
            self.terminate().await;
            return TurnOutcome::Terminated;
        };
        record.response = Some(response.clone());

        let spoken = match self.speak(&response).await {
            Spoken::Done => true,
            Spoken::Failed => false,
            Spoken::Interrupted => {
                self.terminate().await;
                return TurnOutcome::Terminated;
            }
        };
        record.spoken = spoken;

        TurnOutcome::Spoke(DialogueTurn {
            query,
            response,
            spoken,
        })
    }

    /// Stream the microphone to the recognizer until the utterance ends, then
    /// collect late fragments for the grace window.
    async fn listen(&mut self) -> Result<Heard> {
        let interrupt = self.ctx.interrupt_token();
        let mut session = tokio::select! {
            _ = interrupt.cancelled() => return Ok(Heard::Interrupted),
            session = self.recognizer.take() => session?,
        };
        let opened = tokio::select! {
            _ = interrupt.cancelled() => None,
            opened = self.audio.open() => Some(opened),
        };
        let mut frames = match opened {
            Some(Ok(frames)) => frames,
            Some(Err(e)) => {
                session.close().await;
                return Err(e);
            }
            None => {
                session.close().await;
                return Ok(Heard::Interrupted);
            }
        };

        self.ctx.set_state(SessionState::Listening);
        info!("🎤 Listening...");
        let mut detector = EndpointDetector::new(self.cfg.endpoint.clone());
        let mut transcript = Transcript::new();

        let end = loop {
            tokio::select! {
                _ = interrupt.cancelled() => break ListenEnd::Interrupted,
                frame = frames.recv() => {
                    let Some(frame) = frame else {
                        session.close().await;
                        return Err(VoiceError::Audio("microphone stream ended".into()));
                    };
                    self.recorder.push_frame(&frame);
                    if let Err(e) = session.send_audio(&frame).await {
                        session.close().await;
                        return Err(e);
                    }
                    match detector.push(&frame) {
                        Some(EndpointEvent::UtteranceStarted) => {
                            info!("🗣️ Speech started");
                            self.ctx.set_state(SessionState::Recognizing);
                        }
                        Some(EndpointEvent::UtteranceEnded(reason)) => break ListenEnd::Local(reason),
                        Some(EndpointEvent::Timeout) => break ListenEnd::NoSpeech,
                        None => {}
                    }
                }
                event = session.next_event() => match event {
                    Some(RecognitionEvent::Fragment(fragment)) => {
                        if let Some(phrase) = apply_fragment(&self.stops, &mut transcript, &fragment) {
                            break ListenEnd::Stop(phrase);
                        }
                    }
                    Some(RecognitionEvent::Completed) => break ListenEnd::Remote,
                    Some(RecognitionEvent::Failed(e)) => {
                        session.close().await;
                        return Err(e);
                    }
                    Some(RecognitionEvent::Closed) | None => {
                        if transcript.is_empty() {
                            return Err(VoiceError::ConnectionClosed);
                        }
                        break ListenEnd::Remote;
                    }
                },
            }
        };
        // Dropping the receiver stops capture.
        drop(frames);

        match end {
            ListenEnd::Interrupted => {
                session.close().await;
                return Ok(Heard::Interrupted);
            }
            ListenEnd::Stop(phrase) => {
                if let Err(e) = session.finish().await {
                    debug!("Last frame not delivered: {}", e);
                }
                session.close().await;
                return Ok(Heard::Stop(phrase));
            }
            ListenEnd::NoSpeech => {
                session.close().await;
                return Ok(Heard::Nothing);
            }
            ListenEnd::Local(reason) => info!("Utterance ended ({:?})", reason),
            ListenEnd::Remote => info!("Recognizer reported end of speech"),
        }

        self.ctx.set_state(SessionState::Finalizing);
        let heard = self
            .finalize(&mut session, &mut transcript, matches!(end, ListenEnd::Remote))
            .await;
        session.close().await;
        Ok(heard)
    }

    async fn finalize(
        &self,
        session: &mut RecognitionSession,
        transcript: &mut Transcript,
        completed: bool,
    ) -> Heard {
        let interrupt = self.ctx.interrupt_token();

        if !completed {
            if let Err(e) = session.finish().await {
                debug!("Last frame not delivered: {}", e);
            }
            let deadline = tokio::time::Instant::now() + self.cfg.grace;
            loop {
                tokio::select! {
                    _ = interrupt.cancelled() => return Heard::Interrupted,
                    _ = sleep_until(deadline) => {
                        debug!("Grace window elapsed");
                        break;
                    }
                    event = session.next_event() => match event {
                        Some(RecognitionEvent::Fragment(fragment)) => {
                            if let Some(phrase) = apply_fragment(&self.stops, transcript, &fragment) {
                                return Heard::Stop(phrase);
                            }
                        }
                        Some(RecognitionEvent::Completed) => break,
                        Some(RecognitionEvent::Failed(e)) => {
                            warn!("Recognizer failed while finalizing: {}", e);
                            break;
                        }
                        Some(RecognitionEvent::Closed) | None => break,
                    },
                }
            }
        }

        transcript.seal();
        let query = transcript.combined().trim().to_string();
        if query.is_empty() {
            return Heard::Empty;
        }
        info!("📝 Heard: {}", query);
        Heard::Query(query)
    }

    /// Ask the chat model. `None` only when interrupted; failures become the apology.
    async fn think(&mut self, query: &str) -> Option<String> {
        self.ctx.set_state(SessionState::Thinking);
        info!("🤔 Thinking...");
        let interrupt = self.ctx.interrupt_token();
        let started = Instant::now();

        let result = tokio::select! {
            _ = interrupt.cancelled() => return None,
            result = timeout(self.cfg.reply_timeout, self.chat.complete(&self.history, query)) => result,
        };

        match result {
            Ok(Ok(reply)) if !reply.trim().is_empty() => {
                info!("💬 Reply ready in {:?}", started.elapsed());
                self.remember(query, &reply);
                Some(reply)
            }
            Ok(Ok(_)) => {
                warn!("Chat service returned an empty reply");
                Some(self.cfg.apology.clone())
            }
            Ok(Err(e)) => {
                error!("❌ Chat request failed: {}", e);
                Some(self.cfg.apology.clone())
            }
            Err(_) => {
                warn!("⏰ {} after {:?}", VoiceError::Timeout("chat reply"), self.cfg.reply_timeout);
                Some(self.cfg.apology.clone())
            }
        }
    }

    fn remember(&mut self, query: &str, reply: &str) {
        self.history.push(ChatMessage::new(Role::User, query));
        self.history.push(ChatMessage::new(Role::Assistant, reply));
        let excess = self.history.len().saturating_sub(self.cfg.history_limit);
        self.history.drain(..excess);
    }

    /// Play `text` with listening paused. The recognizer is warmed meanwhile.
    async fn speak(&mut self, text: &str) -> Spoken {
        self.ctx.set_state(SessionState::Speaking);
        self.ctx.set_paused(true);
        self.recognizer.prime();

        let spoken = self.play(text).await;

        self.ctx.set_paused(false);
        spoken
    }

    async fn play(&self, text: &str) -> Spoken {
        info!("🔈 Speaking: {}", text);
        let interrupt = self.ctx.interrupt_token();
        let started = tokio::select! {
            _ = interrupt.cancelled() => {
                self.playback.cancel().await;
                return Spoken::Interrupted;
            }
            started = self.playback.speak(text) => started,
        };
        if let Err(e) = started {
            error!("❌ Playback failed: {}", e);
            return Spoken::Failed;
        }

        tokio::select! {
            _ = interrupt.cancelled() => {
                debug!("Dropping {} queued chunks", self.playback.queued_chunks());
                self.playback.cancel().await;
                Spoken::Interrupted
            }
            done = self.playback.wait_complete(self.cfg.playback_timeout) => {
                if done {
                    Spoken::Done
                } else {
                    warn!("⏰ Playback did not finish within {:?}", self.cfg.playback_timeout);
                    self.playback.cancel().await;
                    Spoken::Failed
                }
            }
        }
    }

    /// Enter `Terminated`: stop the loop, silence playback, drop warm connections.
    pub async fn terminate(&mut self) {
        self.ctx.terminate();
        self.playback.cancel().await;
        self.recognizer.discard();
    }

    /// Run turns until the dialogue ends.
    pub async fn run_session(&mut self) {
        info!("💬 Dialogue started");
        loop {
            let outcome = self.run_turn().await;
            match &outcome {
                TurnOutcome::Terminated => break,
                TurnOutcome::NoSpeech if self.cfg.end_session_on_silence => {
                    info!("Nobody is talking, leaving the dialogue");
                    break;
                }
                TurnOutcome::Aborted(e) => {
                    warn!("Turn aborted ({}), retrying in {:?}", e, self.cfg.retry_backoff);
                    if e.is_connection() {
                        // Reconnect cold after a network failure.
                        self.recognizer.discard();
                    }
                    let interrupt = self.ctx.interrupt_token();
                    tokio::select! {
                        _ = interrupt.cancelled() => {}
                        _ = sleep(self.cfg.retry_backoff) => {}
                    }
                }
                TurnOutcome::Paused => {
                    sleep(Duration::from_millis(100)).await;
                }
                _ => {}
            }
            if !self.ctx.should_continue() {
                break;
            }
        }
        self.recognizer.discard();
        info!("💬 Dialogue ended after {} turns", self.turns);
    }

    /// Run dialogue sessions back to back until a stop phrase or interrupt.
    pub async fn run_continuous(&mut self) {
        info!("🔁 Continuous mode");
        while self.ctx.should_continue() && !self.ctx.is_interrupted() {
            self.run_session().await;
        }
        self.terminate().await;
    }

    /// Wait for a wake word, greet, run a dialogue session, and repeat.
    /// A stop phrase only ends the current session; an interrupt ends the loop.
    pub async fn run_with_wake(&mut self, mut wakes: mpsc::Receiver<WakeEvent>) {
        let interrupt = self.ctx.interrupt_token();
        loop {
            self.ctx.set_state(SessionState::Idle);
            info!("💤 Waiting for a wake word");

            let event = tokio::select! {
                _ = interrupt.cancelled() => break,
                event = wakes.recv() => event,
            };
            let Some(event) = event else {
                warn!("Wake source closed");
                break;
            };
            info!("👋 Woken by '{}'", event.phrase);

            if let Some(greeting) = self.cfg.greeting.clone() {
                if matches!(self.speak(&greeting).await, Spoken::Interrupted) {
                    break;
                }
                self.ctx.set_state(SessionState::Idle);
            }

            self.run_session().await;
            // Wake words heard while the session ran are stale.
            while wakes.try_recv().is_ok() {}
            if !self.ctx.resume() {
                break;
            }
        }
        self.terminate().await;
    }
}

/// Fold one fragment into the transcript and scan the result for stop phrases.
fn apply_fragment(stops: &StopPhrases, transcript: &mut Transcript, fragment: &Fragment) -> Option<String> {
    if !transcript.apply(fragment) {
        return None;
    }
    let text = transcript.combined();
    debug!("📝 {}", text);
    stops.find(&text).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFrame;
    use crate::playback::PlaybackConfig;
    use crate::recognition::RecognitionConfig;
    use crate::signing::Credentials;
    use crate::transcript::FragmentKind;
    use crate::tts::{SynthesisEvent, Synthesizer};
    use crate::ws::testing::{scripted_server, silent_server};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    const LOUD: i16 = 3000;

    struct FakeMic {
        frames: Vec<AudioFrame>,
    }

    impl FakeMic {
        fn speech(loud: usize, silent: usize) -> Arc<Self> {
            let mut frames = vec![AudioFrame::constant(LOUD); loud];
            frames.extend(vec![AudioFrame::constant(0); silent]);
            Arc::new(Self { frames })
        }
    }

    #[async_trait]
    impl AudioInput for FakeMic {
        async fn open(&self) -> Result<mpsc::Receiver<AudioFrame>> {
            let (tx, rx) = mpsc::channel(8);
            let frames = self.frames.clone();
            tokio::spawn(async move {
                for frame in frames {
                    if tx.send(frame).await.is_err() {
                        return;
                    }
                    sleep(Duration::from_millis(5)).await;
                }
                // Keep the stream open like a live microphone.
                tx.closed().await;
            });
            Ok(rx)
        }
    }

    enum Reply {
        Text(&'static str),
        Fail,
        Hang,
    }

    struct FakeChat {
        reply: Reply,
        seen: Mutex<Vec<(usize, String)>>,
    }

    impl FakeChat {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(usize, String)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatModel for FakeChat {
        async fn complete(&self, history: &[ChatMessage], query: &str) -> Result<String> {
            self.seen.lock().unwrap().push((history.len(), query.to_string()));
            match self.reply {
                Reply::Text(text) => Ok(text.to_string()),
                Reply::Fail => Err(VoiceError::protocol(10013, "quota exceeded")),
                Reply::Hang => {
                    sleep(Duration::from_secs(30)).await;
                    Ok("too late".into())
                }
            }
        }
    }

    /// How the fake voice behaves once asked to speak
    #[derive(Clone, Copy, Default)]
    enum Voice {
        #[default]
        Finish,
        /// One chunk, then the stream stays open
        Endless,
        /// The synthesis connection never opens
        Stalled,
    }

    #[derive(Default)]
    struct SpyTts {
        voice: Voice,
        texts: Mutex<Vec<String>>,
    }

    impl SpyTts {
        fn with_voice(voice: Voice) -> Arc<Self> {
            Arc::new(Self {
                voice,
                ..Default::default()
            })
        }

        fn texts(&self) -> Vec<String> {
            self.texts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Synthesizer for SpyTts {
        async fn synthesize(&self, text: &str) -> Result<mpsc::Receiver<SynthesisEvent>> {
            self.texts.lock().unwrap().push(text.to_string());
            if let Voice::Stalled = self.voice {
                sleep(Duration::from_secs(30)).await;
                return Err(VoiceError::Connection("synthesis never connected".into()));
            }
            let (tx, rx) = mpsc::channel(4);
            tx.send(SynthesisEvent::Audio(b"mp3".to_vec())).await.unwrap();
            match self.voice {
                Voice::Finish => tx.send(SynthesisEvent::Done).await.unwrap(),
                _ => {
                    tokio::spawn(async move { tx.closed().await });
                }
            }
            Ok(rx)
        }
    }

    fn result_msg(text: &str, status: u8, pgs: &str) -> String {
        json!({
            "code": 0,
            "message": "success",
            "sid": "iat000",
            "data": {"status": status, "result": {"ws": [{"cw": [{"w": text}]}], "pgs": pgs}}
        })
        .to_string()
    }

    fn dialogue_cfg() -> DialogueConfig {
        DialogueConfig {
            endpoint: EndpointConfig {
                silence_threshold: 500,
                max_silence_frames: 3,
                initial_wait_frames: 5,
                max_duration_frames: 200,
            },
            grace: Duration::from_secs(1),
            reply_timeout: Duration::from_secs(2),
            playback_timeout: Duration::from_secs(5),
            greeting: None,
            warm_chat: false,
            retry_backoff: Duration::from_millis(10),
            ..Default::default()
        }
    }

    struct Harness {
        controller: DialogueController,
        tts: Arc<SpyTts>,
        playback: Arc<PlaybackEngine>,
        ctx: Arc<SessionContext>,
    }

    fn harness(url: String, mic: Arc<FakeMic>, chat: Arc<FakeChat>, cfg: DialogueConfig) -> Harness {
        harness_with_voice(url, mic, chat, Voice::Finish, cfg)
    }

    fn harness_with_voice(
        url: String,
        mic: Arc<FakeMic>,
        chat: Arc<FakeChat>,
        voice: Voice,
        cfg: DialogueConfig,
    ) -> Harness {
        let ctx = Arc::new(SessionContext::new());
        let tts = SpyTts::with_voice(voice);
        let player = PlaybackConfig {
            command: vec!["cat".into()],
            ..Default::default()
        };
        let connector = RecognizerConnector {
            config: RecognitionConfig {
                url,
                ..Default::default()
            },
            credentials: Credentials {
                app_id: "app".into(),
                api_key: "k".into(),
                api_secret: "s".into(),
            },
        };
        let playback = Arc::new(PlaybackEngine::new(tts.clone(), player));
        let parts = Collaborators {
            audio: mic,
            recognizer: WarmSlot::new("recognizer", connector, Duration::from_secs(10)),
            chat,
            playback: playback.clone(),
            recorder: TurnRecorder::with_base(false, "unused".into()),
        };
        Harness {
            controller: DialogueController::new(cfg, ctx.clone(), parts),
            tts,
            playback,
            ctx,
        }
    }

    /// Interrupt `delay` after the controller first enters `target`.
    fn interrupt_in(ctx: &Arc<SessionContext>, target: SessionState, delay: Duration) {
        let ctx = ctx.clone();
        let mut states = ctx.subscribe();
        tokio::spawn(async move {
            loop {
                let current = *states.borrow_and_update();
                if current == target {
                    break;
                }
                if states.changed().await.is_err() {
                    return;
                }
            }
            sleep(delay).await;
            ctx.interrupt();
        });
    }

    fn spoken_turn(outcome: TurnOutcome) -> DialogueTurn {
        match outcome {
            TurnOutcome::Spoke(turn) => turn,
            other => panic!("expected a spoken turn, got {:?}", other),
        }
    }

    async fn run(h: &mut Harness) -> TurnOutcome {
        timeout(Duration::from_secs(10), h.controller.run_turn())
            .await
            .expect("turn hung")
    }

    #[tokio::test]
    async fn answered_turn_is_spoken_and_remembered() {
        // 4 speech frames + 3 silent frames + the last frame
        let replies = vec![result_msg("今天天气怎么样", 2, "apd")];
        let (url, mut seen) = scripted_server(replies, 8).await;
        let chat = FakeChat::new(Reply::Text("今天晴天。"));
        let mut h = harness(url, FakeMic::speech(4, 10), chat.clone(), dialogue_cfg());

        let turn = spoken_turn(run(&mut h).await);
        assert_eq!(turn.query, "今天天气怎么样");
        assert_eq!(turn.response, "今天晴天。");
        assert!(turn.spoken);

        assert_eq!(chat.calls(), vec![(0, "今天天气怎么样".to_string())]);
        assert_eq!(h.tts.texts(), vec!["今天晴天。".to_string()]);
        assert_eq!(h.controller.history().len(), 2);
        assert_eq!(h.controller.history()[0].role, Role::User);
        assert_eq!(h.ctx.state(), SessionState::Idle);
        assert!(!h.ctx.is_paused());

        let first: Value = serde_json::from_str(&seen.recv().await.unwrap()).unwrap();
        assert_eq!(first["data"]["status"], 0);
        assert!(first.get("business").is_some());
    }

    #[tokio::test]
    async fn silence_ends_turn_without_query() {
        let (url, _seen) = scripted_server(vec![], 1000).await;
        let chat = FakeChat::new(Reply::Text("unused"));
        let mut h = harness(url, FakeMic::speech(0, 20), chat.clone(), dialogue_cfg());

        assert!(matches!(run(&mut h).await, TurnOutcome::NoSpeech));
        assert!(chat.calls().is_empty());
        assert!(h.tts.texts().is_empty());
        assert_eq!(h.ctx.state(), SessionState::Idle);
        assert!(h.ctx.should_continue());
    }

    #[tokio::test]
    async fn stop_phrase_in_partial_terminates() {
        let replies = vec![result_msg("好的再见", 0, "apd")];
        let (url, mut seen) = scripted_server(replies, 2).await;
        let chat = FakeChat::new(Reply::Text("unused"));
        let mut h = harness(url, FakeMic::speech(40, 0), chat.clone(), dialogue_cfg());

        assert!(matches!(run(&mut h).await, TurnOutcome::Terminated));
        assert!(!h.ctx.should_continue());
        assert_eq!(h.ctx.state(), SessionState::Terminated);
        assert!(chat.calls().is_empty());

        // The recognizer still gets a proper end of audio before the close.
        let closed_cleanly = timeout(Duration::from_secs(2), async {
            while let Some(frame) = seen.recv().await {
                let frame: Value = serde_json::from_str(&frame).unwrap();
                if frame["data"]["status"] == 2 {
                    return true;
                }
            }
            false
        })
        .await;
        assert!(matches!(closed_cleanly, Ok(true)));
    }

    #[tokio::test]
    async fn chat_failure_speaks_apology() {
        let replies = vec![result_msg("讲个笑话", 2, "apd")];
        let (url, _seen) = scripted_server(replies, 8).await;
        let chat = FakeChat::new(Reply::Fail);
        let mut h = harness(url, FakeMic::speech(4, 10), chat, dialogue_cfg());

        let turn = spoken_turn(run(&mut h).await);
        let apology = DialogueConfig::default().apology;
        assert_eq!(turn.response, apology);
        assert_eq!(h.tts.texts(), vec![apology]);
        assert!(h.controller.history().is_empty());
    }

    #[tokio::test]
    async fn slow_chat_times_out_to_apology() {
        let replies = vec![result_msg("讲个笑话", 2, "apd")];
        let (url, _seen) = scripted_server(replies, 8).await;
        let cfg = DialogueConfig {
            reply_timeout: Duration::from_millis(100),
            ..dialogue_cfg()
        };
        let mut h = harness(url, FakeMic::speech(4, 10), FakeChat::new(Reply::Hang), cfg);

        let turn = spoken_turn(run(&mut h).await);
        assert_eq!(turn.response, DialogueConfig::default().apology);
    }

    #[tokio::test]
    async fn interrupt_while_listening_terminates() {
        let (url, _seen) = scripted_server(vec![], 1000).await;
        let cfg = DialogueConfig {
            endpoint: EndpointConfig {
                initial_wait_frames: 10_000,
                max_duration_frames: 10_000,
                ..dialogue_cfg().endpoint
            },
            ..dialogue_cfg()
        };
        let mut h = harness(url, FakeMic::speech(0, 1000), FakeChat::new(Reply::Text("x")), cfg);

        let ctx = h.ctx.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            ctx.interrupt();
        });

        assert!(matches!(run(&mut h).await, TurnOutcome::Terminated));
        assert_eq!(h.ctx.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn interrupt_while_connecting_terminates() {
        let url = silent_server().await;
        let mut h = harness(url, FakeMic::speech(4, 10), FakeChat::new(Reply::Text("x")), dialogue_cfg());

        let ctx = h.ctx.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(200)).await;
            ctx.interrupt();
        });

        let started = Instant::now();
        assert!(matches!(run(&mut h).await, TurnOutcome::Terminated));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(h.ctx.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn interrupt_while_thinking_skips_the_reply() {
        let replies = vec![result_msg("讲个笑话", 2, "apd")];
        let (url, _seen) = scripted_server(replies, 8).await;
        let cfg = DialogueConfig {
            reply_timeout: Duration::from_secs(30),
            ..dialogue_cfg()
        };
        let chat = FakeChat::new(Reply::Hang);
        let mut h = harness(url, FakeMic::speech(4, 10), chat.clone(), cfg);
        interrupt_in(&h.ctx, SessionState::Thinking, Duration::from_millis(50));

        let started = Instant::now();
        assert!(matches!(run(&mut h).await, TurnOutcome::Terminated));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(chat.calls().len(), 1);
        assert!(h.tts.texts().is_empty());
        assert!(h.controller.history().is_empty());
        assert_eq!(h.ctx.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn interrupt_while_speaking_stops_playback() {
        let replies = vec![result_msg("讲个故事", 2, "apd")];
        let (url, _seen) = scripted_server(replies, 8).await;
        let chat = FakeChat::new(Reply::Text("从前有座山"));
        let mut h = harness_with_voice(url, FakeMic::speech(4, 10), chat, Voice::Endless, dialogue_cfg());
        interrupt_in(&h.ctx, SessionState::Speaking, Duration::from_millis(100));

        let started = Instant::now();
        assert!(matches!(run(&mut h).await, TurnOutcome::Terminated));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(h.tts.texts(), vec!["从前有座山".to_string()]);
        assert!(h.playback.is_complete());
        assert!(!h.ctx.is_paused());
        assert_eq!(h.ctx.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn interrupt_while_synthesis_connects_terminates() {
        let replies = vec![result_msg("讲个故事", 2, "apd")];
        let (url, _seen) = scripted_server(replies, 8).await;
        let chat = FakeChat::new(Reply::Text("从前有座山"));
        let mut h = harness_with_voice(url, FakeMic::speech(4, 10), chat, Voice::Stalled, dialogue_cfg());
        interrupt_in(&h.ctx, SessionState::Speaking, Duration::from_millis(100));

        let started = Instant::now();
        assert!(matches!(run(&mut h).await, TurnOutcome::Terminated));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(h.playback.is_complete());
        assert!(!h.ctx.is_paused());
    }

    #[tokio::test]
    async fn paused_controller_does_not_listen() {
        let (url, mut seen) = scripted_server(vec![], 1000).await;
        let mut h = harness(url, FakeMic::speech(4, 10), FakeChat::new(Reply::Text("x")), dialogue_cfg());

        h.ctx.set_paused(true);
        assert!(matches!(run(&mut h).await, TurnOutcome::Paused));
        assert_eq!(h.controller.turns(), 0);
        assert!(timeout(Duration::from_millis(100), seen.recv()).await.is_err());
    }

    #[tokio::test]
    async fn recognizer_error_aborts_turn() {
        let error = json!({"code": 10165, "message": "invalid handle"}).to_string();
        let (url, _seen) = scripted_server(vec![error], 1).await;
        let mut h = harness(url, FakeMic::speech(40, 0), FakeChat::new(Reply::Text("x")), dialogue_cfg());

        let outcome = run(&mut h).await;
        assert!(matches!(outcome, TurnOutcome::Aborted(VoiceError::Protocol { code: 10165, .. })));
        assert_eq!(h.ctx.state(), SessionState::Idle);
        assert!(h.ctx.should_continue());
    }

    #[tokio::test]
    async fn session_ends_when_nobody_speaks() {
        let (url, _seen) = scripted_server(vec![], 1000).await;
        let mut h = harness(url, FakeMic::speech(0, 20), FakeChat::new(Reply::Text("x")), dialogue_cfg());

        timeout(Duration::from_secs(10), h.controller.run_session())
            .await
            .unwrap();
        assert_eq!(h.controller.turns(), 1);
        assert!(h.ctx.should_continue());
    }

    #[tokio::test]
    async fn wake_greets_then_returns_to_waiting() {
        let (url, _seen) = scripted_server(vec![], 1000).await;
        let cfg = DialogueConfig {
            greeting: Some("你好，我在！".into()),
            ..dialogue_cfg()
        };
        let mut h = harness(url, FakeMic::speech(0, 20), FakeChat::new(Reply::Text("x")), cfg);

        let (wake_tx, wake_rx) = mpsc::channel(1);
        wake_tx.send(WakeEvent { phrase: "小智小智".into() }).await.unwrap();
        let ctx = h.ctx.clone();
        tokio::spawn(async move {
            // Give the first session time to finish, then shut down.
            sleep(Duration::from_millis(1500)).await;
            ctx.interrupt();
        });

        timeout(Duration::from_secs(10), h.controller.run_with_wake(wake_rx))
            .await
            .unwrap();
        assert_eq!(h.tts.texts(), vec!["你好，我在！".to_string()]);
        assert_eq!(h.controller.turns(), 1);
        assert_eq!(h.ctx.state(), SessionState::Terminated);
        drop(wake_tx);
    }

    #[test]
    fn history_keeps_newest_messages() {
        let cfg = DialogueConfig {
            history_limit: 2,
            ..dialogue_cfg()
        };
        let mut h = harness("ws://127.0.0.1:1/v2/iat".into(), FakeMic::speech(0, 0), FakeChat::new(Reply::Fail), cfg);

        h.controller.remember("一", "1");
        h.controller.remember("二", "2");
        let history = h.controller.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "二");
        assert_eq!(history[1].content, "2");
    }

    #[test]
    fn stop_scan_sees_pending_text() {
        let stops = StopPhrases::new(["再见"]);
        let mut transcript = Transcript::new();
        let partial = Fragment::partial("好的再", FragmentKind::Append);
        assert_eq!(apply_fragment(&stops, &mut transcript, &partial), None);
        let corrected = Fragment::partial("好的再见", FragmentKind::Replace);
        assert_eq!(apply_fragment(&stops, &mut transcript, &corrected), Some("再见".to_string()));
    }
}
