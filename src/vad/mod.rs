//! Voice activity detection with hysteresis.
//!
//! Turns the per-frame RMS of the raw (pre-gate) microphone signal into
//! discrete voice-start / voice-end events:
//!
//! ```text
//!            level > open              above open for min_open
//! Closed ──────────────────▶ Armed ──────────────────────────▶ Open
//!   ▲                          │ level <= open                   │
//!   └──────────────────────────┘                                 │
//!   ▲               level < close (starts cooldown)              │
//!   └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Any reading at or below the open threshold while armed resets the
//! confirmation timer to zero. After voice-end, voice-start detection is
//! suppressed for the cooldown, and also before a caller-set
//! no-interrupt deadline.

use crate::audio::dsp::{ms_to_samples, rms};
use crate::config::{VadConfig, VadThresholds};
use crate::pipeline::messages::AudioFrame;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Gate state of the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceGateState {
    /// No voice.
    Closed,
    /// Level is above the open threshold, waiting for the minimum duration.
    Armed,
    /// Voice confirmed.
    Open,
}

/// Discrete detector output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    /// Voice confirmed at the given frame time.
    VoiceStart { at: Instant },
    /// Voice ended at the given frame time.
    VoiceEnd { at: Instant },
}

/// Energy-based detector with hysteresis, cooldown and boosted mode.
pub struct VoiceActivityDetector {
    base: VadThresholds,
    boosted: VadThresholds,
    boosted_on: bool,
    state: VoiceGateState,
    /// Samples continuously above the open threshold while armed.
    above_samples: usize,
    armed_at: Option<Instant>,
    cooldown_until: Option<Instant>,
    no_interrupt_until: Option<Instant>,
    last_level: f32,
    degraded: bool,
}

impl VoiceActivityDetector {
    /// Create a detector. `config` should already be validated so that the
    /// boosted parameters are never more sensitive than the base ones.
    pub fn new(config: &VadConfig) -> Self {
        info!(
            "VAD initialized: open={} close={} min_open={}ms cooldown={}ms (boosted open={} min_open={}ms)",
            config.base.open_threshold,
            config.base.close_threshold,
            config.base.min_open_ms,
            config.base.cooldown_ms,
            config.boosted.open_threshold,
            config.boosted.min_open_ms,
        );
        Self {
            base: config.base,
            boosted: config.boosted,
            boosted_on: false,
            state: VoiceGateState::Closed,
            above_samples: 0,
            armed_at: None,
            cooldown_until: None,
            no_interrupt_until: None,
            last_level: 0.0,
            degraded: false,
        }
    }

    /// Feed one frame, returning an event if the gate changed state.
    pub fn process(&mut self, frame: &AudioFrame) -> Option<VadEvent> {
        if self.degraded {
            return None;
        }
        let level = rms(&frame.samples);
        self.last_level = level;
        let now = frame.captured_at;
        let t = *self.thresholds();

        match self.state {
            VoiceGateState::Closed | VoiceGateState::Armed => {
                if level > t.open_threshold && !self.start_suppressed(now) {
                    if self.state == VoiceGateState::Closed {
                        self.state = VoiceGateState::Armed;
                        self.armed_at = Some(now);
                        debug!("VAD: Closed → Armed (rms={level:.3})");
                    }
                    self.above_samples += frame.samples.len();
                    let needed = ms_to_samples(frame.sample_rate, t.min_open_ms);
                    if self.above_samples >= needed {
                        let held = self
                            .armed_at
                            .map(|a| now.saturating_duration_since(a))
                            .unwrap_or_default();
                        self.state = VoiceGateState::Open;
                        self.above_samples = 0;
                        self.armed_at = None;
                        info!("VAD: voice start (rms={level:.3}, armed for {held:?})");
                        return Some(VadEvent::VoiceStart { at: now });
                    }
                } else if self.state == VoiceGateState::Armed {
                    debug!("VAD: Armed → Closed (rms={level:.3})");
                    self.disarm();
                }
                None
            }
            VoiceGateState::Open => {
                if level < t.close_threshold {
                    self.state = VoiceGateState::Closed;
                    self.cooldown_until = Some(now + Duration::from_millis(t.cooldown_ms as u64));
                    info!("VAD: voice end (rms={level:.3})");
                    Some(VadEvent::VoiceEnd { at: now })
                } else {
                    None
                }
            }
        }
    }

    /// Switch between base and boosted sensitivity.
    pub fn set_boosted(&mut self, on: bool) {
        if self.boosted_on != on {
            debug!("VAD boosted mode {}", if on { "on" } else { "off" });
            self.boosted_on = on;
        }
    }

    /// Whether boosted mode is active.
    pub fn is_boosted(&self) -> bool {
        self.boosted_on
    }

    /// Suppress voice-start detection until `deadline`.
    pub fn set_no_interrupt_until(&mut self, deadline: Instant) {
        self.no_interrupt_until = Some(deadline);
        if self.state == VoiceGateState::Armed {
            self.disarm();
        }
    }

    /// Remove any pending no-interrupt deadline.
    pub fn clear_no_interrupt(&mut self) {
        self.no_interrupt_until = None;
    }

    /// Current gate state.
    pub fn state(&self) -> VoiceGateState {
        self.state
    }

    /// RMS of the last processed frame.
    pub fn last_level(&self) -> f32 {
        self.last_level
    }

    /// Stop producing detections; used when real audio analysis is unavailable.
    pub fn degrade(&mut self, reason: &str) {
        if !self.degraded {
            warn!("VAD degraded, barge-in disabled: {reason}");
        }
        self.degraded = true;
        self.state = VoiceGateState::Closed;
        self.above_samples = 0;
        self.armed_at = None;
    }

    /// Resume detections after [`degrade`](Self::degrade).
    pub fn restore(&mut self) {
        if self.degraded {
            info!("VAD restored");
        }
        self.degraded = false;
    }

    /// Whether the detector is degraded.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Return to the initial closed state, keeping sensitivity settings.
    pub fn reset(&mut self) {
        self.state = VoiceGateState::Closed;
        self.above_samples = 0;
        self.armed_at = None;
        self.cooldown_until = None;
        self.no_interrupt_until = None;
    }

    fn thresholds(&self) -> &VadThresholds {
        if self.boosted_on {
            &self.boosted
        } else {
            &self.base
        }
    }

    fn start_suppressed(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|t| now < t)
            || self.no_interrupt_until.is_some_and(|t| now < t)
    }

    fn disarm(&mut self) {
        self.state = VoiceGateState::Closed;
        self.above_samples = 0;
        self.armed_at = None;
    }
}
