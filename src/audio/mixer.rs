//! Output audio graph.
//!
//! The [`Mixer`] holds buffers scheduled at explicit output-clock times and
//! renders them through two gain stages in series (duck → fade). The output
//! clock only advances when the device callback (or a test) calls
//! [`Mixer::render`], so scheduling is sample-accurate and deterministic.
//! The clock belongs to the mixer, not the device: a rebuilt output stream
//! keeps rendering from where the previous one stopped.
//!
//! ```text
//! voices (scheduled buffers) ──▶ Σ ──▶ [duck gain] ──▶ [fade gain] ──▶ device
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// Identifier of a scheduled buffer.
pub type VoiceId = u64;

/// Independent gain stages of the output chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GainStage {
    /// Lowered while the user speaks.
    Duck,
    /// Pulled to zero when speech is hard-stopped.
    Fade,
}

impl GainStage {
    fn index(self) -> usize {
        match self {
            Self::Duck => 0,
            Self::Fade => 1,
        }
    }
}

/// Interface the playback scheduler drives.
///
/// Times are in seconds on the graph's own output clock.
pub trait AudioGraph: Send {
    /// Output sample rate.
    fn sample_rate(&self) -> u32;
    /// Current output clock.
    fn current_time(&self) -> f64;
    /// Schedule `samples` to start at `start_at`.
    fn schedule(&mut self, samples: Vec<f32>, start_at: f64) -> VoiceId;
    /// Stop a voice at output time `at` (it finishes silently from then on).
    fn stop(&mut self, id: VoiceId, at: f64);
    /// Remove a voice immediately, whether or not it started.
    fn cancel(&mut self, id: VoiceId);
    /// Linearly ramp `stage` to `target` over `duration` seconds, starting at `at`.
    ///
    /// Ramps scheduled at or after `at` are replaced.
    fn ramp_gain(&mut self, stage: GainStage, target: f32, at: f64, duration: f64);
    /// Current value of a gain stage.
    fn gain(&self, stage: GainStage) -> f32;
    /// Voices that finished (played out, stopped or cancelled) since the last call.
    fn take_finished(&mut self) -> Vec<VoiceId>;
}

#[derive(Debug)]
struct Voice {
    id: VoiceId,
    samples: Vec<f32>,
    start_frame: u64,
    stop_frame: Option<u64>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        let natural = self.start_frame + self.samples.len() as u64;
        self.stop_frame.map_or(natural, |s| s.min(natural))
    }
}

#[derive(Debug, Clone, Copy)]
struct Ramp {
    start_frame: u64,
    end_frame: u64,
    target: f32,
    /// Value when the ramp began; captured on first use.
    from: Option<f32>,
}

#[derive(Debug)]
struct GainAutomation {
    value: f32,
    ramps: VecDeque<Ramp>,
}

impl GainAutomation {
    fn new() -> Self {
        Self {
            value: 1.0,
            ramps: VecDeque::new(),
        }
    }

    /// Gain at `frame`, advancing the automation.
    fn step(&mut self, frame: u64) -> f32 {
        while let Some(ramp) = self.ramps.front_mut() {
            if frame < ramp.start_frame {
                break;
            }
            let from = *ramp.from.get_or_insert(self.value);
            if frame >= ramp.end_frame {
                self.value = ramp.target;
                self.ramps.pop_front();
                continue;
            }
            let span = (ramp.end_frame - ramp.start_frame) as f32;
            let pos = (frame - ramp.start_frame) as f32 / span;
            self.value = from + (ramp.target - from) * pos;
            break;
        }
        self.value
    }

    fn push(&mut self, ramp: Ramp) {
        self.ramps.retain(|r| r.start_frame < ramp.start_frame);
        self.ramps.push_back(ramp);
    }
}

#[derive(Debug)]
struct MixerState {
    clock: u64,
    voices: Vec<Voice>,
    next_id: VoiceId,
    finished: Vec<VoiceId>,
    stages: [GainAutomation; 2],
}

/// Shared, clonable handle to the output graph.
///
/// One clone lives in the device callback, another in the scheduler.
#[derive(Debug, Clone)]
pub struct Mixer {
    inner: Arc<Mutex<MixerState>>,
    sample_rate: u32,
}

impl Mixer {
    /// Create an empty graph running at `sample_rate`.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MixerState {
                clock: 0,
                voices: Vec::new(),
                next_id: 1,
                finished: Vec::new(),
                stages: [GainAutomation::new(), GainAutomation::new()],
            })),
            sample_rate: sample_rate.max(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, MixerState> {
        match self.inner.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        }
    }

    fn to_frame(&self, t: f64) -> u64 {
        (t.max(0.0) * self.sample_rate as f64).round() as u64
    }

    /// Render the next `out.len()` mono frames and advance the clock.
    pub fn render(&self, out: &mut [f32]) {
        let n = out.len();
        if n == 0 {
            return;
        }
        let mut state = self.state();
        let clock = state.clock;
        let block_end = clock + n as u64;

        out.fill(0.0);
        for voice in &state.voices {
            let start = voice.start_frame.max(clock);
            let end = voice.end_frame().min(block_end);
            if start >= end {
                continue;
            }
            for f in start..end {
                let src = (f - voice.start_frame) as usize;
                out[(f - clock) as usize] += voice.samples[src];
            }
        }

        for (i, sample) in out.iter_mut().enumerate() {
            let frame = clock + i as u64;
            let duck = state.stages[0].step(frame);
            let fade = state.stages[1].step(frame);
            *sample = (*sample * duck * fade).clamp(-1.0, 1.0);
        }

        let mut done = Vec::new();
        state.voices.retain(|v| {
            if v.end_frame() <= block_end {
                done.push(v.id);
                false
            } else {
                true
            }
        });
        state.finished.extend(done);
        state.clock = block_end;
    }

    /// Render interleaved output for a device with `channels` channels.
    pub fn render_interleaved(&self, data: &mut [f32], channels: u16) {
        let ch = channels.max(1) as usize;
        if ch == 1 {
            self.render(data);
            return;
        }
        let mut mono = vec![0.0; data.len() / ch];
        self.render(&mut mono);
        for (frame, &s) in data.chunks_exact_mut(ch).zip(mono.iter()) {
            frame.fill(s);
        }
    }

    /// Number of voices that have not finished yet.
    pub fn active_voices(&self) -> usize {
        self.state().voices.len()
    }
}

impl AudioGraph for Mixer {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.state().clock as f64 / self.sample_rate as f64
    }

    fn schedule(&mut self, samples: Vec<f32>, start_at: f64) -> VoiceId {
        let start_frame = self.to_frame(start_at);
        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        state.voices.push(Voice {
            id,
            samples,
            start_frame,
            stop_frame: None,
        });
        id
    }

    fn stop(&mut self, id: VoiceId, at: f64) {
        let at_frame = self.to_frame(at);
        let mut state = self.state();
        let clock = state.clock;
        if let Some(voice) = state.voices.iter_mut().find(|v| v.id == id) {
            let stop = at_frame.max(clock);
            voice.stop_frame = Some(voice.stop_frame.map_or(stop, |s| s.min(stop)));
        }
    }

    fn cancel(&mut self, id: VoiceId) {
        let mut state = self.state();
        let before = state.voices.len();
        state.voices.retain(|v| v.id != id);
        if state.voices.len() != before {
            state.finished.push(id);
        }
    }

    fn ramp_gain(&mut self, stage: GainStage, target: f32, at: f64, duration: f64) {
        let start_frame = self.to_frame(at);
        let len = self.to_frame(duration).max(1);
        let mut state = self.state();
        let start_frame = start_frame.max(state.clock);
        state.stages[stage.index()].push(Ramp {
            start_frame,
            end_frame: start_frame + len,
            target: target.clamp(0.0, 1.0),
            from: None,
        });
    }

    fn gain(&self, stage: GainStage) -> f32 {
        self.state().stages[stage.index()].value
    }

    fn take_finished(&mut self) -> Vec<VoiceId> {
        std::mem::take(&mut self.state().finished)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn render(mixer: &Mixer, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames];
        mixer.render(&mut out);
        out
    }

    #[test]
    fn voice_starts_at_scheduled_frame() {
        let mut mixer = Mixer::new(1_000);
        mixer.schedule(vec![0.5; 10], 0.005);
        let out = render(&mixer, 20);
        assert!(out[..5].iter().all(|&s| s == 0.0));
        assert!(out[5..15].iter().all(|&s| (s - 0.5).abs() < 1e-6));
        assert!(out[15..].iter().all(|&s| s == 0.0));
        assert!((mixer.current_time() - 0.02).abs() < 1e-9);
    }

    #[test]
    fn finished_voices_are_reported_once() {
        let mut mixer = Mixer::new(1_000);
        let a = mixer.schedule(vec![0.1; 10], 0.0);
        let b = mixer.schedule(vec![0.1; 10], 0.010);
        render(&mixer, 10);
        assert_eq!(mixer.take_finished(), vec![a]);
        render(&mixer, 10);
        assert_eq!(mixer.take_finished(), vec![b]);
        assert!(mixer.take_finished().is_empty());
        assert_eq!(mixer.active_voices(), 0);
    }

    #[test]
    fn stop_truncates_and_cancel_removes() {
        let mut mixer = Mixer::new(1_000);
        let a = mixer.schedule(vec![0.2; 100], 0.0);
        let b = mixer.schedule(vec![0.2; 100], 0.5);
        mixer.stop(a, 0.010);
        mixer.cancel(b);
        assert_eq!(mixer.take_finished(), vec![b]);
        let out = render(&mixer, 20);
        assert!(out[..10].iter().all(|&s| s > 0.0));
        assert!(out[10..].iter().all(|&s| s == 0.0));
        assert_eq!(mixer.take_finished(), vec![a]);
    }

    #[test]
    fn gain_stages_multiply_in_series() {
        let mut mixer = Mixer::new(1_000);
        mixer.schedule(vec![1.0; 100], 0.0);
        mixer.ramp_gain(GainStage::Duck, 0.5, 0.0, 0.010);
        mixer.ramp_gain(GainStage::Fade, 0.5, 0.0, 0.010);
        let out = render(&mixer, 40);
        assert!((out[5] - 0.75 * 0.75).abs() < 0.01, "{}", out[5]);
        assert!((out[30] - 0.25).abs() < 1e-6);
        assert!((mixer.gain(GainStage::Duck) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn queued_ramps_run_in_order() {
        let mut mixer = Mixer::new(1_000);
        mixer.schedule(vec![1.0; 100], 0.0);
        mixer.ramp_gain(GainStage::Fade, 0.0, 0.0, 0.010);
        mixer.ramp_gain(GainStage::Fade, 1.0, 0.020, 0.005);
        let out = render(&mixer, 40);
        assert!(out[12..20].iter().all(|&s| s == 0.0));
        assert!((out[30] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn interleaved_render_duplicates_channels() {
        let mut mixer = Mixer::new(1_000);
        mixer.schedule(vec![0.3; 4], 0.0);
        let mut data = vec![0.0; 8];
        mixer.render_interleaved(&mut data, 2);
        assert!(data.iter().all(|&s| (s - 0.3).abs() < 1e-6));
    }

    #[test]
    fn new_stream_handle_resumes_on_the_same_clock() {
        let mut mixer = Mixer::new(1_000);
        mixer.schedule(vec![0.4; 3_000], 0.0);
        render(&mixer, 1_500);

        // A rebuilt output stream renders through a fresh clone.
        let reopened = mixer.clone();
        let out = render(&reopened, 100);
        assert!(out.iter().all(|&s| (s - 0.4).abs() < 1e-6));
        assert!((mixer.current_time() - 1.6).abs() < 1e-9);
    }

    #[test]
    fn fade_in_flight_completes_across_stream_rebuild() {
        let mut mixer = Mixer::new(1_000);
        mixer.ramp_gain(GainStage::Fade, 0.0, 0.0, 0.030);
        mixer.ramp_gain(GainStage::Fade, 1.0, 0.030, 0.010);
        render(&mixer, 10);
        assert!(mixer.gain(GainStage::Fade) < 1.0);

        let mut reopened = mixer.clone();
        reopened.schedule(vec![0.5; 1_000], 0.100);
        // Output starts at clock 0.010, so the voice lands at index 90.
        let out = render(&reopened, 2_000);
        assert!((mixer.gain(GainStage::Fade) - 1.0).abs() < 1e-6);
        assert!(out[90..1_090].iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }
}
