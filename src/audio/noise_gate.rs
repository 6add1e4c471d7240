//! Adaptive noise gate for outbound microphone audio.
//!
//! The gate calibrates a noise floor during the first couple of seconds,
//! then attenuates (never hard-mutes) frames whose smoothed level sits below
//! the threshold. It only shapes what goes to the network; barge-in
//! decisions are made by the VAD on the raw signal.

use crate::audio::dsp::{ms_to_samples, rms, to_db};
use crate::config::NoiseGateConfig;
use crate::pipeline::messages::AudioFrame;
use tracing::{debug, info};

/// Percentile of calibration levels taken as the noise floor.
const FLOOR_PERCENTILE: f32 = 0.75;

/// Per-frame gate with calibration, attack, hold and release.
pub struct NoiseGate {
    config: NoiseGateConfig,
    sample_rate: u32,
    /// Effective opening threshold (dBFS), possibly raised by calibration.
    threshold_db: f32,
    noise_floor_db: Option<f32>,
    /// Frame levels (dBFS) observed while calibrating; `None` once done.
    calibration: Option<Vec<f32>>,
    calibration_samples: usize,
    calibrated_samples: usize,
    /// Smoothed linear level.
    level: f32,
    gain: f32,
    target_gain: f32,
    open: bool,
    hold_remaining: usize,
}

impl NoiseGate {
    /// Create a gate for frames at `sample_rate`.
    pub fn new(config: &NoiseGateConfig, sample_rate: u32) -> Self {
        let calibration_samples = ms_to_samples(sample_rate, config.calibration_ms);
        let calibrating = config.enabled && calibration_samples > 0;
        let closed = closed_gain(config.ratio);
        Self {
            config: config.clone(),
            sample_rate,
            threshold_db: config.threshold_db,
            noise_floor_db: None,
            calibration: calibrating.then(Vec::new),
            calibration_samples,
            calibrated_samples: 0,
            level: 0.0,
            gain: if calibrating { 0.0 } else { closed },
            target_gain: closed,
            open: false,
            hold_remaining: 0,
        }
    }

    /// Whether the calibration window is still running.
    pub fn is_calibrating(&self) -> bool {
        self.calibration.is_some()
    }

    /// Noise floor measured during calibration.
    pub fn noise_floor_db(&self) -> Option<f32> {
        self.noise_floor_db
    }

    /// Current effective threshold.
    pub fn threshold_db(&self) -> f32 {
        self.threshold_db
    }

    /// Gain applied to the most recent sample.
    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Whether the gate is currently open (or holding open).
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Condition one frame, returning the gain-modulated copy.
    pub fn process(&mut self, frame: &AudioFrame) -> AudioFrame {
        if !self.config.enabled {
            return frame.clone();
        }

        let frame_rms = rms(&frame.samples);

        if let Some(levels) = self.calibration.as_mut() {
            levels.push(to_db(frame_rms));
            self.calibrated_samples += frame.samples.len();
            self.level = frame_rms;
            if self.calibrated_samples >= self.calibration_samples {
                self.finish_calibration();
            }
            return AudioFrame {
                samples: vec![0.0; frame.samples.len()],
                sample_rate: frame.sample_rate,
                captured_at: frame.captured_at,
            };
        }

        let alpha = self.config.smoothing;
        self.level = alpha * frame_rms + (1.0 - alpha) * self.level;
        self.update_target(to_db(self.level), frame.samples.len());

        let samples = self.apply_gain(&frame.samples);
        AudioFrame {
            samples,
            sample_rate: frame.sample_rate,
            captured_at: frame.captured_at,
        }
    }

    fn finish_calibration(&mut self) {
        let Some(mut levels) = self.calibration.take() else {
            return;
        };
        if levels.is_empty() {
            return;
        }
        levels.sort_by(|a, b| a.total_cmp(b));
        let idx = ((levels.len() - 1) as f32 * FLOOR_PERCENTILE).round() as usize;
        let floor = levels[idx.min(levels.len() - 1)];
        self.noise_floor_db = Some(floor);
        self.threshold_db = self
            .config
            .threshold_db
            .max(floor + self.config.floor_margin_db);
        self.gain = closed_gain(self.config.ratio);
        info!(
            "noise gate calibrated: floor={floor:.1}dB threshold={:.1}dB",
            self.threshold_db
        );
    }

    fn update_target(&mut self, level_db: f32, frame_len: usize) {
        if level_db >= self.threshold_db {
            if !self.open {
                debug!("noise gate open ({level_db:.1}dB)");
            }
            self.open = true;
            self.hold_remaining = ms_to_samples(self.sample_rate, self.config.hold_ms);
            self.target_gain = 1.0;
        } else if self.hold_remaining > 0 {
            self.hold_remaining = self.hold_remaining.saturating_sub(frame_len);
            self.target_gain = self.gain;
        } else {
            if self.open {
                debug!("noise gate releasing ({level_db:.1}dB)");
            }
            self.open = false;
            self.target_gain = closed_gain(self.config.ratio);
        }
    }

    fn apply_gain(&mut self, samples: &[f32]) -> Vec<f32> {
        let span = 1.0 - closed_gain(self.config.ratio);
        let ramp_ms = if self.target_gain > self.gain {
            self.config.attack_ms
        } else {
            self.config.release_ms
        };
        let ramp_samples = ms_to_samples(self.sample_rate, ramp_ms).max(1);
        let step = (span.max(f32::EPSILON)) / ramp_samples as f32;

        samples
            .iter()
            .map(|&s| {
                if self.gain < self.target_gain {
                    self.gain = (self.gain + step).min(self.target_gain);
                } else if self.gain > self.target_gain {
                    self.gain = (self.gain - step).max(self.target_gain);
                }
                s * self.gain
            })
            .collect()
    }
}

/// Gain a fully closed gate settles at.
fn closed_gain(ratio: f32) -> f32 {
    if ratio <= 1.0 { 1.0 } else { 1.0 / ratio }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::test_utils::{constant_frames, sine_frame};

    fn config() -> NoiseGateConfig {
        NoiseGateConfig {
            calibration_ms: 200,
            ..NoiseGateConfig::default()
        }
    }

    #[test]
    fn calibration_outputs_silence_and_raises_threshold() {
        let mut gate = NoiseGate::new(&config(), 16_000);
        assert!(gate.is_calibrating());

        // 0.01 RMS room noise is -40 dBFS, above the -45 dB default.
        for frame in constant_frames(0.01, 10, 16_000) {
            let out = gate.process(&frame);
            assert!(out.samples.iter().all(|&s| s == 0.0));
        }

        assert!(!gate.is_calibrating());
        let floor = gate.noise_floor_db().unwrap();
        assert!((floor + 40.0).abs() < 0.5, "floor={floor}");
        assert!((gate.threshold_db() - (floor + 6.0)).abs() < 1e-3);
    }

    #[test]
    fn quiet_floor_keeps_configured_threshold() {
        let mut gate = NoiseGate::new(&config(), 16_000);
        for frame in constant_frames(0.0001, 10, 16_000) {
            gate.process(&frame);
        }
        assert!((gate.threshold_db() + 45.0).abs() < 1e-3);
    }

    #[test]
    fn loud_input_opens_gate_to_unity() {
        let mut gate = NoiseGate::new(&config(), 16_000);
        for frame in constant_frames(0.0001, 10, 16_000) {
            gate.process(&frame);
        }
        let mut last = None;
        for i in 0..5 {
            last = Some(gate.process(&sine_frame(0.5, 320, 16_000, i)));
        }
        assert!(gate.is_open());
        assert!((gate.gain() - 1.0).abs() < 1e-6);
        let out = last.unwrap();
        assert!(rms(&out.samples) > 0.3);
    }

    #[test]
    fn release_attenuates_without_muting() {
        let mut gate = NoiseGate::new(&config(), 16_000);
        for frame in constant_frames(0.0001, 10, 16_000) {
            gate.process(&frame);
        }
        for i in 0..5 {
            gate.process(&sine_frame(0.5, 320, 16_000, i));
        }

        // Hold keeps the gain up for the first few quiet frames.
        let quiet = constant_frames(0.0001, 40, 16_000);
        gate.process(&quiet[0]);
        assert!((gate.gain() - 1.0).abs() < 1e-6);

        for frame in &quiet[1..] {
            gate.process(frame);
        }
        assert!(!gate.is_open());
        assert!((gate.gain() - 0.25).abs() < 1e-6, "gain={}", gate.gain());
    }

    #[test]
    fn disabled_gate_passes_through() {
        let cfg = NoiseGateConfig {
            enabled: false,
            ..NoiseGateConfig::default()
        };
        let mut gate = NoiseGate::new(&cfg, 16_000);
        let frame = sine_frame(0.2, 320, 16_000, 0);
        let out = gate.process(&frame);
        assert_eq!(out.samples, frame.samples);
    }
}
