//! Shared test utilities used across multiple test modules.
//!
//! Everything here is synthetic and deterministic: frames carry explicit
//! timestamps derived from their index, so tests never sleep.

use crate::audio::dsp::f32_to_pcm16_le;
use crate::pipeline::messages::AudioFrame;
use bytes::Bytes;
use std::time::{Duration, Instant};

/// Frame length used by the helpers.
pub const FRAME_MS: u64 = 20;

/// A 20 ms frame of constant value `level` (so its RMS equals `level`),
/// stamped `index` frames after `base`.
pub fn frame_at(level: f32, base: Instant, index: usize, sample_rate: u32) -> AudioFrame {
    let len = (sample_rate as u64 * FRAME_MS / 1000) as usize;
    AudioFrame {
        samples: vec![level; len],
        sample_rate,
        captured_at: base + Duration::from_millis(FRAME_MS * index as u64),
    }
}

/// `count` consecutive constant-level frames starting now.
pub fn constant_frames(level: f32, count: usize, sample_rate: u32) -> Vec<AudioFrame> {
    let base = Instant::now();
    (0..count)
        .map(|i| frame_at(level, base, i, sample_rate))
        .collect()
}

/// One frame of a 440 Hz sine. `index` keeps the phase continuous across frames.
pub fn sine_frame(amplitude: f32, len: usize, sample_rate: u32, index: usize) -> AudioFrame {
    let offset = index * len;
    let samples = (0..len)
        .map(|i| {
            let t = (offset + i) as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * 440.0 * t).sin() * amplitude
        })
        .collect();
    AudioFrame {
        samples,
        sample_rate,
        captured_at: Instant::now(),
    }
}

/// `ms` milliseconds of PCM16LE tone at `sample_rate`.
pub fn pcm16_tone(ms: u32, sample_rate: u32) -> Bytes {
    let len = (sample_rate as u64 * ms as u64 / 1000) as usize;
    let samples: Vec<f32> = (0..len)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * 220.0 * t).sin() * 0.3
        })
        .collect();
    Bytes::from(f32_to_pcm16_le(&samples))
}
