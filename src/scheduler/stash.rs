//! Typed PCM16 ingestion and segment slicing.
//!
//! Network audio arrives in arbitrarily sized byte bursts, possibly split in
//! the middle of a sample. The stash decodes it once at the edge into f32
//! samples (carrying a dangling odd byte over to the next burst) and slices
//! it into segments between the minimum and maximum segment lengths.

use crate::audio::dsp::{ms_to_samples, pcm16_to_f32};
use std::time::{Duration, Instant};

/// Rolling buffer of decoded source-rate samples.
#[derive(Debug)]
pub struct SegmentStash {
    carry: Option<u8>,
    samples: Vec<f32>,
    min_len: usize,
    max_len: usize,
    last_push: Option<Instant>,
}

impl SegmentStash {
    /// Create a stash for audio at `sample_rate` cut into `min_ms..=max_ms` segments.
    pub fn new(sample_rate: u32, min_ms: u32, max_ms: u32) -> Self {
        let min_len = ms_to_samples(sample_rate, min_ms).max(1);
        Self {
            carry: None,
            samples: Vec::new(),
            min_len,
            max_len: ms_to_samples(sample_rate, max_ms).max(min_len),
            last_push: None,
        }
    }

    /// Append a PCM16LE burst and return any segments now complete.
    pub fn push(&mut self, bytes: &[u8], now: Instant) -> Vec<Vec<f32>> {
        self.last_push = Some(now);
        let decoded = self.decode(bytes);
        self.samples.extend(decoded);

        let mut out = Vec::new();
        while self.samples.len() >= self.min_len {
            let take = self.samples.len().min(self.max_len);
            out.push(self.samples.drain(..take).collect());
        }
        out
    }

    /// Take whatever is left as one final (possibly short) segment.
    ///
    /// A dangling half-sample is discarded.
    pub fn flush(&mut self) -> Option<Vec<f32>> {
        self.carry = None;
        self.last_push = None;
        if self.samples.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.samples))
        }
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.carry = None;
        self.samples.clear();
        self.last_push = None;
    }

    /// Whether no decoded samples are waiting.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of decoded samples waiting.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Time since the last push, if anything is waiting.
    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        self.last_push.map(|t| now.saturating_duration_since(t))
    }

    fn decode(&mut self, bytes: &[u8]) -> Vec<f32> {
        let mut pcm = Vec::with_capacity(bytes.len() / 2 + 1);
        let mut rest = bytes;
        if let Some(lo) = self.carry.take() {
            match rest.split_first() {
                Some((&hi, tail)) => {
                    pcm.push(i16::from_le_bytes([lo, hi]));
                    rest = tail;
                }
                None => {
                    self.carry = Some(lo);
                    return Vec::new();
                }
            }
        }
        let mut pairs = rest.chunks_exact(2);
        pcm.extend(pairs.by_ref().map(|p| i16::from_le_bytes([p[0], p[1]])));
        if let [odd] = pairs.remainder() {
            self.carry = Some(*odd);
        }
        pcm16_to_f32(&pcm)
    }
}
