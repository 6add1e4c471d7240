//! Message types passed between pipeline stages.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// A short block of mono microphone audio.
///
/// Frames are immutable once captured. The capture stage always emits frames
/// of exactly `audio.frame_ms`, so downstream ticks have a fixed duration.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// f32 samples, mono, at `sample_rate`.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Timestamp of the first sample.
    pub captured_at: Instant,
}

impl AudioFrame {
    /// Duration covered by this frame.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// Who produced a piece of recognized text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The human caller.
    User,
    /// The remote conversational agent.
    Assistant,
}

/// Events from the remote duplex speech service, decoded from the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    /// The connection is up and settings have been sent.
    Opened,
    /// The connection closed (cleanly or not).
    Closed {
        /// Human-readable reason.
        reason: String,
    },
    /// Finalized recognized text.
    Transcript {
        /// Speaker of the text.
        role: Role,
        /// The text itself.
        text: String,
    },
    /// The assistant began a new spoken response.
    AssistantSpeechStart,
    /// A chunk of PCM16LE synthesized speech.
    AudioChunk(Bytes),
    /// The remote side finished sending audio for the current response.
    AssistantSpeechDone,
    /// The remote side reported an error.
    Error(String),
}
