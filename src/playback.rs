//! Streaming playback of synthesized speech
//!
//! `speak` opens a synthesis stream and queues its chunks. The first chunk
//! starts an external player process that is fed from the queue over stdin.
//! Every `speak` gets a fresh [`RunState`], so tasks left over from a
//! cancelled run can never touch the next one.
//!
//! The player process is owned by the render task and always torn down
//! before that task ends: stdin is closed, the process gets a grace period,
//! then it is killed.

use crate::error::{Result, VoiceError};
use crate::tts::{SynthesisEvent, Synthesizer};
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How the player process is launched and torn down
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Program and arguments; audio is written to its stdin
    pub command: Vec<String>,
    /// Time the player gets to finish after the last chunk
    pub drain_timeout: Duration,
    /// Time the player gets to exit after stdin is closed
    pub terminate_timeout: Duration,
    /// Time allowed for a killed player to be reaped
    pub kill_timeout: Duration,
    /// How often an idle renderer re-checks the queue
    pub poll_interval: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            command: ["ffplay", "-nodisp", "-autoexit", "-loglevel", "quiet", "-f", "mp3", "-i", "pipe:0"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            drain_timeout: Duration::from_secs(3),
            terminate_timeout: Duration::from_secs(1),
            kill_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Ordered chunk queue with its end and cancel flags
#[derive(Debug, Default)]
struct PlaybackBuffer {
    queue: VecDeque<Vec<u8>>,
    done: bool,
    cancelled: bool,
}

enum Next {
    Chunk(Vec<u8>),
    Wait,
    Drained,
    Cancelled,
}

/// State of one `speak` call
struct RunState {
    buffer: Mutex<PlaybackBuffer>,
    playing: AtomicBool,
    wake: Notify,
    cancel: CancellationToken,
}

impl RunState {
    fn new() -> Self {
        Self {
            buffer: Mutex::new(PlaybackBuffer::default()),
            playing: AtomicBool::new(false),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// A run with nothing to play.
    fn finished() -> Self {
        let run = Self::new();
        run.buffer().done = true;
        run
    }

    fn buffer(&self) -> MutexGuard<'_, PlaybackBuffer> {
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, chunk: Vec<u8>) {
        let mut buffer = self.buffer();
        if !buffer.cancelled {
            buffer.queue.push_back(chunk);
        }
        drop(buffer);
        self.wake.notify_one();
    }

    fn mark_done(&self) {
        self.buffer().done = true;
        self.wake.notify_one();
    }

    fn next_chunk(&self) -> Next {
        let mut buffer = self.buffer();
        if buffer.cancelled {
            return Next::Cancelled;
        }
        match buffer.queue.pop_front() {
            Some(chunk) => Next::Chunk(chunk),
            None if buffer.done => Next::Drained,
            None => Next::Wait,
        }
    }

    fn cancel(&self) {
        {
            let mut buffer = self.buffer();
            buffer.cancelled = true;
            buffer.queue.clear();
        }
        self.cancel.cancel();
        self.wake.notify_one();
    }

    fn is_complete(&self) -> bool {
        !self.playing.load(Ordering::SeqCst) && self.buffer().done
    }
}

/// Speaks replies through an external player, one at a time.
pub struct PlaybackEngine {
    synth: Arc<dyn Synthesizer>,
    cfg: PlaybackConfig,
    run: Mutex<Arc<RunState>>,
    feeder: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    changed: Arc<Notify>,
}

impl PlaybackEngine {
    pub fn new(synth: Arc<dyn Synthesizer>, cfg: PlaybackConfig) -> Self {
        Self {
            synth,
            cfg,
            run: Mutex::new(Arc::new(RunState::finished())),
            feeder: tokio::sync::Mutex::new(None),
            changed: Arc::new(Notify::new()),
        }
    }

    fn current(&self) -> Arc<RunState> {
        self.run
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn replace_run(&self, run: Arc<RunState>) {
        *self.run.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = run;
    }

    /// Not playing and the end marker has been seen.
    pub fn is_complete(&self) -> bool {
        self.current().is_complete()
    }

    /// Chunks received but not yet handed to the player.
    pub fn queued_chunks(&self) -> usize {
        self.current().buffer().queue.len()
    }

    /// Synthesize `text` and start playing it. Any playback in flight is
    /// cancelled first. Returns once the stream is open; use
    /// [`wait_complete`](Self::wait_complete) to wait for the audio.
    pub async fn speak(&self, text: &str) -> Result<()> {
        self.cancel().await;

        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        let run = Arc::new(RunState::new());
        self.replace_run(run.clone());

        let rx = match self.synth.synthesize(text).await {
            Ok(rx) => rx,
            Err(e) => {
                error!("❌ Could not start synthesis: {}", e);
                run.mark_done();
                self.changed.notify_waiters();
                return Err(e);
            }
        };

        let feeder = tokio::spawn(feed(run, rx, self.cfg.clone(), self.changed.clone()));
        *self.feeder.lock().await = Some(feeder);
        Ok(())
    }

    /// Stop whatever is playing and reset to an idle, complete state.
    pub async fn cancel(&self) {
        let run = self.current();
        let feeder = self.feeder.lock().await.take();
        let idle = feeder.as_ref().map_or(true, |f| f.is_finished());
        if idle && run.is_complete() {
            return;
        }

        info!("⏹️ Cancelling playback");
        run.cancel();

        if let Some(mut feeder) = feeder {
            let bound = self.cfg.terminate_timeout + self.cfg.kill_timeout + Duration::from_secs(1);
            if timeout(bound, &mut feeder).await.is_err() {
                warn!("Playback tasks did not stop in {:?}, aborting", bound);
                feeder.abort();
            }
        }

        self.replace_run(Arc::new(RunState::finished()));
        self.changed.notify_waiters();
    }

    /// Wait until playback completes. Returns false on timeout.
    pub async fn wait_complete(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            let changed = self.changed.notified();
            if self.is_complete() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::select! {
                _ = changed => {}
                _ = sleep(Duration::from_millis(100)) => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }
}

/// Move synthesis events into the buffer and start the renderer on the first chunk.
async fn feed(
    run: Arc<RunState>,
    mut rx: mpsc::Receiver<SynthesisEvent>,
    cfg: PlaybackConfig,
    changed: Arc<Notify>,
) {
    let mut renderer: Option<JoinHandle<()>> = None;
    let mut chunks = 0usize;

    loop {
        let event = tokio::select! {
            _ = run.cancel.cancelled() => break,
            event = rx.recv() => event,
        };
        match event {
            Some(SynthesisEvent::Audio(chunk)) => {
                chunks += 1;
                run.push(chunk);
                if renderer.is_none() {
                    run.playing.store(true, Ordering::SeqCst);
                    renderer = Some(tokio::spawn(render(run.clone(), cfg.clone(), changed.clone())));
                }
            }
            Some(SynthesisEvent::Done) => {
                debug!("End of synthesis stream after {} chunks", chunks);
                run.mark_done();
                break;
            }
            Some(SynthesisEvent::Failed(e)) => {
                error!("❌ Synthesis stream failed: {}", e);
                run.mark_done();
                break;
            }
            None => {
                warn!("Synthesis stream ended without an end marker");
                run.mark_done();
                break;
            }
        }
    }
    changed.notify_waiters();

    if let Some(renderer) = renderer {
        if let Err(e) = renderer.await {
            error!("Render task failed: {}", e);
            run.playing.store(false, Ordering::SeqCst);
        }
    }
    changed.notify_waiters();
}

async fn render(run: Arc<RunState>, cfg: PlaybackConfig, changed: Arc<Notify>) {
    if let Err(e) = drive_player(&run, &cfg).await {
        error!("❌ Playback failed: {}", e);
        // Nothing will play, so nobody should wait for it.
        let mut buffer = run.buffer();
        buffer.queue.clear();
        buffer.cancelled = true;
        buffer.done = true;
    }
    run.playing.store(false, Ordering::SeqCst);
    changed.notify_waiters();
    debug!("Render task finished");
}

fn spawn_player(cfg: &PlaybackConfig) -> Result<Child> {
    let (program, args) = cfg
        .command
        .split_first()
        .ok_or_else(|| VoiceError::Playback("empty player command".into()))?;

    Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| VoiceError::Playback(format!("cannot start {}: {}", program, e)))
}

async fn drive_player(run: &RunState, cfg: &PlaybackConfig) -> Result<()> {
    let mut child = spawn_player(cfg)?;
    let Some(mut stdin) = child.stdin.take() else {
        shutdown(child, cfg).await;
        return Err(VoiceError::Playback("player has no stdin".into()));
    };
    info!("▶️ Player started");

    let mut written = 0usize;
    let mut failure = None;
    let cancelled = loop {
        match run.next_chunk() {
            Next::Chunk(chunk) => {
                tokio::select! {
                    _ = run.cancel.cancelled() => break true,
                    result = stdin.write_all(&chunk) => {
                        if let Err(e) = result {
                            failure = Some(VoiceError::Playback(format!("player stopped reading: {}", e)));
                            break false;
                        }
                        written += chunk.len();
                    }
                }
            }
            Next::Wait => {
                tokio::select! {
                    _ = run.cancel.cancelled() => break true,
                    _ = run.wake.notified() => {}
                    _ = sleep(cfg.poll_interval) => {}
                }
            }
            Next::Drained => break false,
            Next::Cancelled => break true,
        }
    };
    debug!("Fed {} bytes to the player", written);

    // Closing stdin tells the player no more audio is coming.
    drop(stdin);

    if cancelled || failure.is_some() {
        shutdown(child, cfg).await;
    } else {
        match timeout(cfg.drain_timeout, child.wait()).await {
            Ok(Ok(status)) => debug!("Player exited with {}", status),
            Ok(Err(e)) => warn!("Could not wait for player: {}", e),
            Err(_) => {
                warn!("Player still running after {:?}, stopping it", cfg.drain_timeout);
                shutdown(child, cfg).await;
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Give the player a moment to exit on its own, then kill it.
async fn shutdown(mut child: Child, cfg: &PlaybackConfig) {
    if let Ok(Ok(status)) = timeout(cfg.terminate_timeout, child.wait()).await {
        debug!("Player exited with {}", status);
        return;
    }
    if let Err(e) = child.start_kill() {
        warn!("Could not kill player: {}", e);
    }
    match timeout(cfg.kill_timeout, child.wait()).await {
        Ok(_) => debug!("Player killed"),
        Err(_) => warn!("Player did not exit after kill"),
    }
}
