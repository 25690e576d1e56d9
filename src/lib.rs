//! voiceloop - a real-time voice dialogue loop
//!
//! Microphone audio is endpointed locally and streamed to a recognizer; the
//! reconciled transcript goes to a chat model and the reply is synthesized
//! and played back, turn after turn.

#![forbid(unsafe_code)]

pub mod audio;
pub mod config;
pub mod controller;
pub mod endpoint;
pub mod error;
pub mod llm;
pub mod playback;
pub mod recognition;
pub mod recorder;
pub mod session;
pub mod signing;
pub mod transcript;
pub mod tts;
pub mod wake;
pub mod warmup;
pub mod ws;
