//! Shared dialogue state
//!
//! One [`SessionContext`] is created per assistant. The controller is the
//! only writer of the state; other tasks (wake listener, signal handler)
//! observe it through the accessors here.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    WarmingUp,
    Listening,
    Recognizing,
    Finalizing,
    Thinking,
    Speaking,
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::WarmingUp => "warming-up",
            SessionState::Listening => "listening",
            SessionState::Recognizing => "recognizing",
            SessionState::Finalizing => "finalizing",
            SessionState::Thinking => "thinking",
            SessionState::Speaking => "speaking",
            SessionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

pub struct SessionContext {
    state: watch::Sender<SessionState>,
    paused: AtomicBool,
    continuation: AtomicBool,
    interrupt: CancellationToken,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            state,
            paused: AtomicBool::new(false),
            continuation: AtomicBool::new(true),
            interrupt: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Move to `next`. Terminated is final and cannot be left.
    pub fn set_state(&self, next: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == next || *current == SessionState::Terminated {
                return false;
            }
            debug!("State {} -> {}", current, next);
            *current = next;
            true
        });
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// False once a stop phrase or interrupt has ended the dialogue.
    pub fn should_continue(&self) -> bool {
        self.continuation.load(Ordering::SeqCst)
    }

    /// End the dialogue loop after the current step.
    pub fn stop(&self) {
        self.continuation.store(false, Ordering::SeqCst);
    }

    /// External interrupt: stop the loop and wake every blocking wait.
    pub fn interrupt(&self) {
        info!("🛑 Interrupt requested");
        self.stop();
        self.interrupt.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    /// Token that fires on [`interrupt`](Self::interrupt).
    pub fn interrupt_token(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    /// Stop the loop and enter the final state.
    pub fn terminate(&self) {
        self.stop();
        self.set_state(SessionState::Terminated);
    }

    /// Start a new dialogue after a terminated one. Refused once interrupted.
    pub fn resume(&self) -> bool {
        if self.is_interrupted() {
            return false;
        }
        self.continuation.store(true, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        self.state.send_replace(SessionState::Idle);
        true
    }
}
