//! Configuration types for the duplex voice pipeline.

use crate::error::{Result, VoiceError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// Environment variable consulted when `agent.api_key` is empty.
pub const API_KEY_ENV: &str = "DUPLEX_VOICE_API_KEY";

/// Top-level configuration for a duplex voice session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DuplexConfig {
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Noise gate applied to outbound microphone audio.
    pub noise_gate: NoiseGateConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Playback scheduler (jitter buffer) settings.
    pub playback: PlaybackConfig,
    /// Barge-in (interrupt) behaviour while the assistant is speaking.
    pub barge_in: BargeInConfig,
    /// Remote duplex speech service settings.
    pub agent: AgentConfig,
    /// Connection retry policy.
    pub reconnect: ReconnectConfig,
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture rate in Hz after downsampling. Also the rate sent upstream.
    pub input_sample_rate: u32,
    /// Output device rate in Hz.
    pub output_sample_rate: u32,
    /// Capture frame length in milliseconds.
    pub frame_ms: u32,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
    /// Seconds of all-zero capture before audio analysis is declared unavailable.
    ///
    /// Set to 0 to disable the watchdog.
    pub mic_watchdog_secs: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 48_000,
            frame_ms: 20,
            input_device: None,
            output_device: None,
            mic_watchdog_secs: 5,
        }
    }
}

impl AudioConfig {
    /// Number of samples in one capture frame.
    pub fn frame_samples(&self) -> usize {
        (self.input_sample_rate as usize * self.frame_ms as usize) / 1000
    }
}

/// Adaptive noise gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseGateConfig {
    /// When false, frames pass through with unity gain.
    pub enabled: bool,
    /// Opening threshold in dBFS. Raised to `noise floor + floor_margin_db` after calibration.
    pub threshold_db: f32,
    /// Attenuation ratio while closed: gain settles at `1 / ratio`.
    pub ratio: f32,
    /// Gain ramp time when opening (ms).
    pub attack_ms: u32,
    /// Gain ramp time when closing (ms).
    pub release_ms: u32,
    /// Time the gain is held after the level drops below threshold (ms).
    pub hold_ms: u32,
    /// Length of the startup calibration window (ms). Output is silent meanwhile.
    pub calibration_ms: u32,
    /// Minimum distance of the threshold above the measured noise floor (dB).
    pub floor_margin_db: f32,
    /// Exponential smoothing factor for the level detector (0..1, higher = faster).
    pub smoothing: f32,
}

impl Default for NoiseGateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_db: -45.0,
            ratio: 4.0,
            attack_ms: 5,
            release_ms: 120,
            hold_ms: 150,
            calibration_ms: 2_000,
            floor_margin_db: 6.0,
            smoothing: 0.3,
        }
    }
}

/// One set of VAD gate parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadThresholds {
    /// Linear RMS level that must be exceeded to start opening the gate.
    pub open_threshold: f32,
    /// Linear RMS level below which an open gate closes.
    pub close_threshold: f32,
    /// Continuous time above `open_threshold` required before voice-start (ms).
    pub min_open_ms: u32,
    /// Voice-start suppression after a voice-end (ms).
    pub cooldown_ms: u32,
}

impl Default for VadThresholds {
    fn default() -> Self {
        Self {
            open_threshold: 0.10,
            close_threshold: 0.06,
            min_open_ms: 225,
            cooldown_ms: 750,
        }
    }
}

impl VadThresholds {
    /// Defaults for boosted (less sensitive) mode.
    pub fn boosted_defaults() -> Self {
        Self {
            open_threshold: 0.25,
            close_threshold: 0.12,
            min_open_ms: 280,
            cooldown_ms: 750,
        }
    }

    /// Raise every field to at least the matching field of `base`.
    ///
    /// Returns true if anything changed.
    fn raise_to(&mut self, base: &Self) -> bool {
        let before = *self;
        self.open_threshold = self.open_threshold.max(base.open_threshold);
        self.close_threshold = self.close_threshold.max(base.close_threshold);
        self.min_open_ms = self.min_open_ms.max(base.min_open_ms);
        self.cooldown_ms = self.cooldown_ms.max(base.cooldown_ms);
        before != *self
    }
}

/// Voice activity detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Normal sensitivity.
    pub base: VadThresholds,
    /// Used while assistant audio may leak into the microphone.
    pub boosted: VadThresholds,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            base: VadThresholds::default(),
            boosted: VadThresholds::boosted_defaults(),
        }
    }
}

/// Playback scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Sample rate of the PCM16 speech the remote service sends (Hz).
    pub source_sample_rate: u32,
    /// Minimum stash duration before a segment is cut (ms).
    pub min_segment_ms: u32,
    /// Maximum segment duration (ms).
    pub max_segment_ms: u32,
    /// Offset from the output clock for a segment that starts a fresh run (ms).
    pub lead_ms: u32,
    /// Committed lead beyond which the scheduler snaps forward (ms).
    pub max_lead_ms: u32,
    /// The scheduler commits segments to the output graph only while the
    /// committed lead is below this window (ms). Excess waits in the queue.
    pub schedule_ahead_ms: u32,
    /// Buffered audio above which the rate nudge starts catching up (ms).
    pub nudge_target_ms: u32,
    /// Upper bound on the playback-rate nudge (fraction, 0.01 = 1%).
    pub max_nudge: f32,
    /// Fade applied when audio is hard-stopped (ms).
    pub fade_ms: u32,
    /// Gain of the duck stage while the user speaks.
    pub duck_gain: f32,
    /// Duck ramp time (ms).
    pub duck_ms: u32,
    /// Unduck ramp time (ms).
    pub unduck_ms: u32,
    /// Buffered audio that raises the "high" backpressure signal (ms).
    pub high_watermark_ms: u32,
    /// Buffered audio below which backpressure returns to "normal" (ms).
    pub low_watermark_ms: u32,
    /// A short stash tail is flushed after this long without new audio (ms).
    pub stash_flush_ms: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            source_sample_rate: 24_000,
            min_segment_ms: 64,
            max_segment_ms: 96,
            lead_ms: 120,
            max_lead_ms: 3_000,
            schedule_ahead_ms: 1_000,
            nudge_target_ms: 1_500,
            max_nudge: 0.01,
            fade_ms: 30,
            duck_gain: 0.25,
            duck_ms: 40,
            unduck_ms: 100,
            high_watermark_ms: 4_000,
            low_watermark_ms: 2_000,
            stash_flush_ms: 250,
        }
    }
}

/// How a new assistant utterance replaces one that is still playing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffMode {
    /// Stop the previous utterance immediately.
    #[default]
    Hard,
    /// Let the previous utterance finish before the new one plays.
    Soft,
}

/// Barge-in configuration (user interrupts assistant by speaking).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BargeInConfig {
    /// Whether voice-start may flush assistant audio.
    pub enabled: bool,
    /// Voice-start is ignored this long after assistant speech starts (ms).
    pub no_interrupt_ms: u32,
    /// Replacement policy when the assistant starts a new utterance.
    pub handoff: HandoffMode,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            no_interrupt_ms: 300,
            handoff: HandoffMode::default(),
        }
    }
}

/// Remote duplex speech service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// WebSocket endpoint.
    pub url: String,
    /// Bearer token. Falls back to `DUPLEX_VOICE_API_KEY` when empty.
    pub api_key: String,
    /// Speech recognition model.
    pub listen_model: String,
    /// Response generation model.
    pub think_model: String,
    /// Voice used for synthesized speech.
    pub voice: String,
    /// Natural-language behaviour prompt.
    pub prompt: String,
    /// First thing the assistant says once connected.
    pub greeting: String,
    /// Keep-alive interval in seconds.
    pub keepalive_secs: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8765/agent".to_owned(),
            api_key: String::new(),
            listen_model: "nova-3".to_owned(),
            think_model: "gpt-4o-mini".to_owned(),
            voice: "aura-2-thalia-en".to_owned(),
            prompt: "You are a friendly phone receptionist. Keep answers short and \
                     ask one question at a time."
                .to_owned(),
            greeting: "Hello! How can I help you today?".to_owned(),
            keepalive_secs: 5,
        }
    }
}

impl AgentConfig {
    /// API key from the config, or from the environment when unset.
    pub fn effective_api_key(&self) -> Option<String> {
        if !self.api_key.trim().is_empty() {
            return Some(self.api_key.clone());
        }
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}

/// Connection retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Retry after connection errors.
    pub enabled: bool,
    /// Countdown before each retry (seconds).
    pub delay_secs: u32,
    /// Give up after this many consecutive failures (0 = never).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_secs: 5,
            max_attempts: 0,
        }
    }
}

impl DuplexConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| VoiceError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| VoiceError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/duplex-voice/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config)
                .join("duplex-voice")
                .join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("duplex-voice")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/duplex-voice-config/config.toml")
        }
    }

    /// Reject impossible values and repair boosted VAD parameters that are
    /// more sensitive than the base set.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Config`] describing the first invalid field.
    pub fn validate(&mut self) -> Result<()> {
        let invalid = |msg: &str| Err(VoiceError::Config(msg.to_owned()));

        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return invalid("audio sample rates must be non-zero");
        }
        if self.audio.frame_samples() == 0 {
            return invalid("audio.frame_ms too small for the input rate");
        }
        if self.playback.source_sample_rate == 0 {
            return invalid("playback.source_sample_rate must be non-zero");
        }
        if self.playback.min_segment_ms == 0
            || self.playback.min_segment_ms > self.playback.max_segment_ms
        {
            return invalid("playback segment bounds must satisfy 0 < min <= max");
        }
        if self.playback.low_watermark_ms >= self.playback.high_watermark_ms {
            return invalid("playback.low_watermark_ms must be below high_watermark_ms");
        }
        if self.playback.schedule_ahead_ms > self.playback.max_lead_ms {
            return invalid("playback.schedule_ahead_ms must not exceed max_lead_ms");
        }
        if !(0.0..=0.01).contains(&self.playback.max_nudge) {
            return invalid("playback.max_nudge must be within 0..=0.01");
        }
        if !(0.0..=1.0).contains(&self.playback.duck_gain) {
            return invalid("playback.duck_gain must be within 0..=1");
        }
        if self.noise_gate.ratio < 1.0 {
            return invalid("noise_gate.ratio must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.noise_gate.smoothing) || self.noise_gate.smoothing == 0.0 {
            return invalid("noise_gate.smoothing must be within (0, 1]");
        }
        for (name, t) in [("base", &self.vad.base), ("boosted", &self.vad.boosted)] {
            if t.close_threshold > t.open_threshold {
                return Err(VoiceError::Config(format!(
                    "vad.{name}.close_threshold must not exceed open_threshold"
                )));
            }
        }
        let base = self.vad.base;
        if self.vad.boosted.raise_to(&base) {
            warn!(
                "boosted VAD parameters were below base values; raised to {:?}",
                self.vad.boosted
            );
        }
        if self.agent.keepalive_secs == 0 {
            return invalid("agent.keepalive_secs must be non-zero");
        }
        Ok(())
    }
}
