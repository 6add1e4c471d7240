//! Small signal helpers shared by capture, the noise gate, the VAD and the
//! playback scheduler.

/// Level reported for digital silence.
pub const SILENCE_DB: f32 = -120.0;

/// Root-mean-square level of `samples` on the linear 0..1 scale.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Convert a linear level to dBFS, clamped at [`SILENCE_DB`].
pub fn to_db(level: f32) -> f32 {
    if level <= 0.0 {
        return SILENCE_DB;
    }
    (20.0 * level.log10()).max(SILENCE_DB)
}

/// Convert dBFS to a linear level.
pub fn from_db(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Number of samples covering `ms` milliseconds at `sample_rate`.
pub fn ms_to_samples(sample_rate: u32, ms: u32) -> usize {
    ((ms as u64 * sample_rate as u64) / 1000) as usize
}

/// Duration in milliseconds of `samples` at `sample_rate`.
pub fn samples_to_ms(sample_rate: u32, samples: usize) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    samples as f64 * 1000.0 / sample_rate as f64
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
pub fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels.max(1) as usize;
    if ch == 1 {
        return data.to_vec();
    }
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation resampler.
///
/// `speed` above 1.0 shortens the output (plays faster), so the scheduler can
/// nudge playback without a second pass. Speech energy sits well below the
/// Nyquist limit of every rate used here, so no anti-alias filter is applied.
pub fn resample_linear(samples: &[f32], src_rate: u32, dst_rate: u32, speed: f64) -> Vec<f32> {
    if samples.is_empty() || src_rate == 0 || dst_rate == 0 {
        return Vec::new();
    }
    let speed = if speed > 0.0 { speed } else { 1.0 };
    if src_rate == dst_rate && (speed - 1.0).abs() < f64::EPSILON {
        return samples.to_vec();
    }

    let ratio = (src_rate as f64 / dst_rate as f64) * speed;
    let out_len = ((samples.len() as f64 / ratio).round() as usize).max(1);
    let mut output = Vec::with_capacity(out_len);
    let last = samples.len() - 1;

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx < last {
            samples[idx] as f64 * (1.0 - frac) + samples[idx + 1] as f64 * frac
        } else {
            samples[idx.min(last)] as f64
        };

        output.push(sample as f32);
    }

    output
}

/// Convert signed 16-bit PCM to f32 in \[-1, 1).
pub fn pcm16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32_768.0).collect()
}

/// Convert f32 samples to little-endian PCM16 bytes, clipping out-of-range values.
pub fn f32_to_pcm16_le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * 32_767.0).round() as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}
