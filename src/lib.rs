//! Duplex voice: a real-time, full-duplex voice client.
//!
//! Microphone audio streams continuously to a remote speech service while
//! the assistant's synthesized speech streams back and plays locally.
//!
//! # Architecture
//!
//! - **Audio capture**: records from the microphone via `cpal` and frames it
//! - **Noise gate**: adaptive gate applied to outbound audio
//! - **VAD**: detects the local user speaking, with a boosted mode while the
//!   assistant talks
//! - **Playback scheduler**: generation-scoped jitter buffer that schedules
//!   assistant audio gaplessly on the output clock
//! - **Session**: decides who is talking, handles barge-in and orders
//!   transcripts
//! - **Agent**: WebSocket link to the remote service with keep-alives
//! - **Coordinator**: async orchestration, reconnects and teardown

pub mod agent;
pub mod audio;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod runtime;
pub mod scheduler;
pub mod vad;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::DuplexConfig;
pub use error::{DeviceError, ErrorKind, Result, VoiceError};
pub use pipeline::coordinator::DuplexVoice;
pub use pipeline::session::{Session, SessionOutput};
pub use runtime::{Diagnostics, SessionEvent, SessionState};
