//! Endpoint detection
//!
//! Decides from amplitude alone when an utterance starts and ends. A frame is
//! silent when its peak absolute sample is below the threshold. The detector
//! is pure: feed it frames, get events back, no timers and no I/O.

use crate::audio::{AudioFrame, FRAMES_PER_SECOND};
use tracing::debug;

/// Thresholds for the endpoint detector, counted in frames.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointConfig {
    /// Peak amplitude at or above which a frame counts as speech
    pub silence_threshold: u16,

    /// Trailing silent frames that end an utterance
    pub max_silence_frames: u32,

    /// Silent frames tolerated before any speech is heard
    pub initial_wait_frames: u32,

    /// Hard cap on frames in one listening phase
    pub max_duration_frames: u32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self::from_secs(500, 2.0, 5.0, 60.0)
    }
}

impl EndpointConfig {
    /// Build a config from durations in seconds, truncating to whole frames.
    pub fn from_secs(silence_threshold: u16, max_silence: f32, initial_wait: f32, max_duration: f32) -> Self {
        let frames = |secs: f32| ((secs * FRAMES_PER_SECOND) as u32).max(1);
        Self {
            silence_threshold,
            max_silence_frames: frames(max_silence),
            initial_wait_frames: frames(initial_wait),
            max_duration_frames: frames(max_duration),
        }
    }
}

/// Why an utterance was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Trailing silence reached the limit
    Silence,

    /// The listening phase hit its frame cap
    MaxDuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointEvent {
    UtteranceStarted,
    UtteranceEnded(EndReason),
    /// Nothing was said within the initial wait
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    NoSpeechYet,
    InSpeech,
    /// An end or timeout was emitted; needs `reset` before reuse
    Closed,
}

pub struct EndpointDetector {
    cfg: EndpointConfig,
    state: EndpointState,
    initial_silence: u32,
    silence_run: u32,
    total_frames: u32,
}

impl EndpointDetector {
    pub fn new(cfg: EndpointConfig) -> Self {
        Self {
            cfg,
            state: EndpointState::NoSpeechYet,
            initial_silence: 0,
            silence_run: 0,
            total_frames: 0,
        }
    }

    pub fn reset(&mut self) {
        self.state = EndpointState::NoSpeechYet;
        self.initial_silence = 0;
        self.silence_run = 0;
        self.total_frames = 0;
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn is_silent(&self, frame: &AudioFrame) -> bool {
        frame.peak() < self.cfg.silence_threshold
    }

    /// Classify one frame.
    pub fn push(&mut self, frame: &AudioFrame) -> Option<EndpointEvent> {
        let silent = self.is_silent(frame);
        self.push_classified(silent)
    }

    /// Same as [`push`](Self::push) for callers that already know whether the frame is silent.
    pub fn push_classified(&mut self, silent: bool) -> Option<EndpointEvent> {
        if self.state == EndpointState::Closed {
            return None;
        }
        self.total_frames += 1;

        let event = match (self.state, silent) {
            (EndpointState::NoSpeechYet, true) => {
                self.initial_silence += 1;
                if self.initial_silence >= self.cfg.initial_wait_frames {
                    debug!("No speech after {} frames", self.initial_silence);
                    self.state = EndpointState::Closed;
                    return Some(EndpointEvent::Timeout);
                }
                None
            }
            (EndpointState::NoSpeechYet, false) => {
                self.state = EndpointState::InSpeech;
                self.initial_silence = 0;
                self.silence_run = 0;
                Some(EndpointEvent::UtteranceStarted)
            }
            (EndpointState::InSpeech, false) => {
                self.silence_run = 0;
                None
            }
            (EndpointState::InSpeech, true) => {
                self.silence_run += 1;
                if self.silence_run >= self.cfg.max_silence_frames {
                    debug!("Utterance ended after {} silent frames", self.silence_run);
                    self.state = EndpointState::Closed;
                    return Some(EndpointEvent::UtteranceEnded(EndReason::Silence));
                }
                None
            }
            (EndpointState::Closed, _) => None,
        };

        if self.total_frames >= self.cfg.max_duration_frames {
            debug!("Listening cap of {} frames reached", self.total_frames);
            self.state = EndpointState::Closed;
            // A start on the very last frame is swallowed by the cap.
            return Some(EndpointEvent::UtteranceEnded(EndReason::MaxDuration));
        }

        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cfg() -> EndpointConfig {
        EndpointConfig {
            silence_threshold: 500,
            max_silence_frames: 3,
            initial_wait_frames: 4,
            max_duration_frames: 20,
        }
    }

    fn run(det: &mut EndpointDetector, amplitudes: &[i16]) -> Vec<EndpointEvent> {
        amplitudes
            .iter()
            .filter_map(|&a| det.push(&AudioFrame::constant(a)))
            .collect()
    }

    #[test]
    fn default_frame_counts_match_seconds() {
        let cfg = EndpointConfig::default();
        assert_eq!(cfg.max_silence_frames, 25);
        assert_eq!(cfg.initial_wait_frames, 62);
        assert_eq!(cfg.max_duration_frames, 750);
    }

    #[test]
    fn speech_then_silence_ends_exactly_once() {
        let mut det = EndpointDetector::new(small_cfg());
        let events = run(&mut det, &[900, 1200, 800, 10, 20, 30, 0, 0, 0]);
        assert_eq!(
            events,
            vec![
                EndpointEvent::UtteranceStarted,
                EndpointEvent::UtteranceEnded(EndReason::Silence)
            ]
        );
        assert_eq!(det.state(), EndpointState::Closed);
    }

    #[test]
    fn speech_resets_silence_run() {
        let mut det = EndpointDetector::new(small_cfg());
        let events = run(&mut det, &[900, 0, 0, 900, 0, 0]);
        assert_eq!(events, vec![EndpointEvent::UtteranceStarted]);
        assert_eq!(det.state(), EndpointState::InSpeech);
    }

    #[test]
    fn threshold_is_exclusive_for_speech() {
        let det = EndpointDetector::new(small_cfg());
        assert!(det.is_silent(&AudioFrame::constant(499)));
        assert!(det.is_silent(&AudioFrame::constant(-499)));
        assert!(!det.is_silent(&AudioFrame::constant(500)));
        assert!(!det.is_silent(&AudioFrame::constant(-500)));
    }

    #[test]
    fn no_speech_times_out() {
        let mut det = EndpointDetector::new(small_cfg());
        let events = run(&mut det, &[0, 0, 0, 0, 0, 0]);
        assert_eq!(events, vec![EndpointEvent::Timeout]);
    }

    #[test]
    fn hard_cap_ends_continuous_speech() {
        let mut det = EndpointDetector::new(small_cfg());
        let events = run(&mut det, &[1000; 25]);
        assert_eq!(
            events,
            vec![
                EndpointEvent::UtteranceStarted,
                EndpointEvent::UtteranceEnded(EndReason::MaxDuration)
            ]
        );
    }

    #[test]
    fn reset_allows_reuse() {
        let mut det = EndpointDetector::new(small_cfg());
        run(&mut det, &[0, 0, 0, 0]);
        assert_eq!(det.state(), EndpointState::Closed);
        det.reset();
        assert_eq!(run(&mut det, &[700]), vec![EndpointEvent::UtteranceStarted]);
    }
}
