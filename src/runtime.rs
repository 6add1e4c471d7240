//! Events and snapshots the session exposes to the UI layer.
//!
//! Payloads stay small so the pipeline can emit them without blocking the
//! audio path.

use crate::error::ErrorKind;
use crate::pipeline::messages::Role;
use crate::scheduler::{BackpressureLevel, Generation};
use crate::vad::VoiceGateState;
use serde::Serialize;

/// Lifecycle state of a duplex session.
///
/// ```text
/// Idle ─▶ Connecting ─▶ Connected ⇄ (UserSpeaking | AssistantSpeaking) ─▶ Idle
///                 any ─▶ Error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    UserSpeaking,
    AssistantSpeaking,
    /// Terminal unless the caller (or the retry policy) starts again.
    Error,
}

impl SessionState {
    /// Whether a duplex connection is up.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            Self::Connected | Self::UserSpeaking | Self::AssistantSpeaking
        )
    }
}

/// Events published on the session's broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Finalized text, released in audio order for the assistant.
    Transcript { role: Role, text: String },
    ConnectionStateChanged { state: SessionState },
    UserSpeakingChanged { speaking: bool },
    AssistantSpeakingChanged { speaking: bool },
    Error { kind: ErrorKind, reason: String },
    /// Buffered assistant audio crossed a watermark (instrumentation only).
    PlaybackBackpressure { high: bool },
}

impl SessionEvent {
    pub(crate) fn backpressure(level: BackpressureLevel) -> Self {
        Self::PlaybackBackpressure {
            high: level == BackpressureLevel::High,
        }
    }
}

/// Point-in-time view of the pipeline, for debugging only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Diagnostics {
    pub state: SessionState,
    /// Segments waiting to be committed to the output graph.
    pub queue_depth: usize,
    /// Committed lead ahead of the output clock.
    pub lead_ms: f64,
    pub generation: Generation,
    pub pending_generation: Option<Generation>,
    pub vad_state: VoiceGateState,
    pub vad_boosted: bool,
    pub vad_degraded: bool,
    pub playback_speed: f64,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            queue_depth: 0,
            lead_ms: 0.0,
            generation: 0,
            pending_generation: None,
            vad_state: VoiceGateState::Closed,
            vad_boosted: false,
            vad_degraded: false,
            playback_speed: 1.0,
        }
    }
}
