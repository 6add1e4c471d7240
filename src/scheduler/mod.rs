//! Generation-scoped, jitter-buffered playback scheduler.
//!
//! Synthesized speech arrives as PCM16 bursts tagged with a *generation*
//! (one assistant utterance). The scheduler slices it into short segments
//! and commits them to the [`AudioGraph`] back to back on a rolling lead:
//!
//! ```text
//! enqueue(bytes, gen) ─▶ stash ─▶ queue ─▶ pump ─▶ graph.schedule(start)
//!                                   │        start = max(now + lead, prev_end)
//!                                   └─ waits while committed lead ≥ schedule-ahead
//! ```
//!
//! Generation control:
//!
//! - [`start_utterance`](PlaybackScheduler::start_utterance) hard-cuts:
//!   older audio fades out over `fade_ms` and is discarded.
//! - [`start_utterance_soft`](PlaybackScheduler::start_utterance_soft)
//!   declares a pending generation that is buffered separately and promoted
//!   once the active one has drained.
//! - [`flush`](PlaybackScheduler::flush) invalidates the active generation;
//!   later enqueues tagged with it are ignored.
//!
//! The tag is checked when a segment is committed, not when it is enqueued.
//! All methods are non-blocking and never fail.

pub mod stash;

use crate::audio::dsp::{resample_linear, samples_to_ms};
use crate::audio::mixer::{AudioGraph, GainStage, Mixer, VoiceId};
use crate::config::PlaybackConfig;
use serde::Serialize;
use stash::SegmentStash;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Identifier of one assistant utterance.
pub type Generation = u64;

/// Smoothing factor applied to the rate nudge on every pump.
const NUDGE_SMOOTHING: f64 = 0.05;

/// How long the backlog must stay above target before nudging.
const NUDGE_PERSISTENCE: Duration = Duration::from_millis(500);

/// Ramp used to restore the fade stage after a hard stop (seconds).
const FADE_RESTORE_SECS: f64 = 0.005;

/// Queue-depth notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureLevel {
    /// Buffered audio is below the low watermark.
    Normal,
    /// Buffered audio crossed the high watermark.
    High,
}

/// Notifications produced by the scheduler, drained by the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// The current generation started or stopped producing sound.
    Speaking(bool),
    /// The buffered backlog crossed a watermark.
    Backpressure(BackpressureLevel),
}

/// Running counters, exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SchedulerStats {
    /// PCM16 bytes accepted into a live or pending generation.
    pub bytes_enqueued: u64,
    /// PCM16 bytes (source rate) committed to the output graph.
    pub bytes_scheduled: u64,
    /// Segments committed to the output graph.
    pub segments_scheduled: u64,
    /// Chunks dropped because their generation was no longer current.
    pub ignored_chunks: u64,
    /// Segments discarded at commit time for a stale generation.
    pub stale_segments: u64,
    /// Hard stops (flush or hard cut).
    pub cuts: u64,
    /// Snap-forward recoveries.
    pub snaps: u64,
    /// Pending generations promoted after a soft handoff.
    pub promotions: u64,
}

#[derive(Debug)]
struct Segment {
    generation: Generation,
    /// Mono samples at the source rate.
    samples: Vec<f32>,
}

/// Stash plus queue for one generation.
#[derive(Debug)]
struct Lane {
    generation: Generation,
    stash: SegmentStash,
    queue: VecDeque<Segment>,
}

impl Lane {
    fn new(generation: Generation, config: &PlaybackConfig) -> Self {
        Self {
            generation,
            stash: SegmentStash::new(
                config.source_sample_rate,
                config.min_segment_ms,
                config.max_segment_ms,
            ),
            queue: VecDeque::new(),
        }
    }

    fn push(&mut self, bytes: &[u8], now: Instant) {
        let generation = self.generation;
        self.queue.extend(
            self.stash
                .push(bytes, now)
                .into_iter()
                .map(|samples| Segment {
                    generation,
                    samples,
                }),
        );
    }

    fn flush_stash(&mut self) {
        if let Some(samples) = self.stash.flush() {
            self.queue.push_back(Segment {
                generation: self.generation,
                samples,
            });
        }
    }

    fn reset(&mut self, generation: Generation) {
        self.generation = generation;
        self.stash.clear();
        self.queue.clear();
    }

    fn buffered_samples(&self) -> usize {
        self.stash.len() + self.queue.iter().map(|s| s.samples.len()).sum::<usize>()
    }
}

/// A segment committed to the graph and not yet reported finished.
#[derive(Debug)]
struct InFlight {
    id: VoiceId,
    generation: Generation,
    start: f64,
    end: f64,
    source: Vec<f32>,
}

/// Playback scheduler driving an [`AudioGraph`].
pub struct PlaybackScheduler<G: AudioGraph = Mixer> {
    config: PlaybackConfig,
    graph: G,
    /// Highest generation ever issued.
    issued: Generation,
    live: Lane,
    pending: Option<Lane>,
    in_flight: Vec<InFlight>,
    /// End of the last committed segment of the live generation.
    next_start: Option<f64>,
    speed: f64,
    ahead_since: Option<Instant>,
    backpressure: BackpressureLevel,
    speaking: bool,
    ducked: bool,
    events: Vec<SchedulerEvent>,
    stats: SchedulerStats,
}

impl<G: AudioGraph> PlaybackScheduler<G> {
    /// Create a scheduler. Generation 0 is active until the first utterance.
    pub fn new(config: &PlaybackConfig, graph: G) -> Self {
        info!(
            "playback scheduler: source={}Hz output={}Hz lead={}ms max_lead={}ms segments={}..{}ms",
            config.source_sample_rate,
            graph.sample_rate(),
            config.lead_ms,
            config.max_lead_ms,
            config.min_segment_ms,
            config.max_segment_ms,
        );
        Self {
            live: Lane::new(0, config),
            config: config.clone(),
            graph,
            issued: 0,
            pending: None,
            in_flight: Vec::new(),
            next_start: None,
            speed: 1.0,
            ahead_since: None,
            backpressure: BackpressureLevel::Normal,
            speaking: false,
            ducked: false,
            events: Vec::new(),
            stats: SchedulerStats::default(),
        }
    }

    /// Hard cut: stop everything older and make a fresh generation active.
    pub fn start_utterance(&mut self) -> Generation {
        self.issued += 1;
        let generation = self.issued;
        self.cut();
        self.live.reset(generation);
        self.pending = None;
        info!(generation, "playback: hard cut to new utterance");
        self.update_speaking();
        generation
    }

    /// Soft handoff: declare a generation that plays once the active one drains.
    ///
    /// If nothing of the active generation is left, the new one becomes
    /// active immediately.
    pub fn start_utterance_soft(&mut self) -> Generation {
        self.issued += 1;
        let generation = self.issued;
        if self.live_outstanding() == 0 {
            self.live.reset(generation);
            self.pending = None;
            self.next_start = None;
            info!(generation, "playback: soft handoff, nothing playing, active now");
        } else {
            if let Some(old) = &self.pending {
                debug!(
                    generation = old.generation,
                    "playback: replacing pending generation"
                );
            }
            self.pending = Some(Lane::new(generation, &self.config));
            info!(
                generation,
                active = self.live.generation,
                "playback: soft handoff pending"
            );
        }
        generation
    }

    /// Accept PCM16LE speech for `generation`.
    ///
    /// Bytes for a generation that is neither active nor pending are ignored.
    pub fn enqueue(&mut self, bytes: &[u8], generation: Generation, now: Instant) {
        if generation == self.live.generation {
            self.live.push(bytes, now);
        } else if let Some(pending) = self
            .pending
            .as_mut()
            .filter(|p| p.generation == generation)
        {
            pending.push(bytes, now);
        } else {
            self.stats.ignored_chunks += 1;
            debug!(
                generation,
                active = self.live.generation,
                "playback: ignoring {} bytes for stale generation",
                bytes.len()
            );
            return;
        }
        self.stats.bytes_enqueued += bytes.len() as u64;
        self.pump(now);
    }

    /// The remote side finished sending `generation`: release its stash tail.
    pub fn finish_generation(&mut self, generation: Generation, now: Instant) {
        if generation == self.live.generation {
            self.live.flush_stash();
        } else if let Some(pending) = self
            .pending
            .as_mut()
            .filter(|p| p.generation == generation)
        {
            pending.flush_stash();
        }
        self.pump(now);
    }

    /// Hard-cancel: invalidate the active generation and clear every queue.
    ///
    /// Scheduled output stops within one fade interval.
    pub fn flush(&mut self) {
        let old = self.live.generation;
        self.issued += 1;
        self.cut();
        self.live.reset(self.issued);
        self.pending = None;
        info!(generation = old, "playback: flushed");
        self.update_speaking();
    }

    /// Lower output to the duck gain.
    pub fn duck(&mut self) {
        let now = self.graph.current_time();
        self.graph.ramp_gain(
            GainStage::Duck,
            self.config.duck_gain,
            now,
            self.config.duck_ms as f64 / 1000.0,
        );
        if !self.ducked {
            debug!("playback: duck");
        }
        self.ducked = true;
    }

    /// Restore full output gain.
    pub fn unduck(&mut self) {
        let now = self.graph.current_time();
        self.graph
            .ramp_gain(GainStage::Duck, 1.0, now, self.config.unduck_ms as f64 / 1000.0);
        if self.ducked {
            debug!("playback: unduck");
        }
        self.ducked = false;
    }

    /// Periodic housekeeping: reap finished segments, promote, flush idle
    /// stash tails and commit queued audio.
    pub fn tick(&mut self, now: Instant) {
        let idle_limit = Duration::from_millis(self.config.stash_flush_ms as u64);
        if self.live.stash.idle_for(now).is_some_and(|d| d >= idle_limit) {
            debug!(generation = self.live.generation, "playback: flushing idle stash tail");
            self.live.flush_stash();
        }
        if let Some(pending) = self.pending.as_mut() {
            if pending.stash.idle_for(now).is_some_and(|d| d >= idle_limit) {
                pending.flush_stash();
            }
        }
        self.pump(now);
    }

    /// Take the notifications produced since the last call.
    pub fn drain_events(&mut self) -> Vec<SchedulerEvent> {
        std::mem::take(&mut self.events)
    }

    /// Whether the current generation has audio scheduled or queued.
    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Whether the duck stage is lowered.
    pub fn is_ducked(&self) -> bool {
        self.ducked
    }

    /// Active generation.
    pub fn generation(&self) -> Generation {
        self.live.generation
    }

    /// Generation waiting for a soft handoff, if any.
    pub fn pending_generation(&self) -> Option<Generation> {
        self.pending.as_ref().map(|p| p.generation)
    }

    /// Segments waiting to be committed (active and pending).
    pub fn queue_depth(&self) -> usize {
        self.live.queue.len() + self.pending.as_ref().map_or(0, |p| p.queue.len())
    }

    /// How far ahead of the output clock audio is committed, in milliseconds.
    pub fn lead_ms(&self) -> f64 {
        let now = self.graph.current_time();
        self.next_start
            .map_or(0.0, |end| ((end - now) * 1000.0).max(0.0))
    }

    /// Total audio buffered (queued, stashed and committed ahead), in milliseconds.
    pub fn buffered_ms(&self) -> f64 {
        let queued = self.live.buffered_samples()
            + self.pending.as_ref().map_or(0, Lane::buffered_samples);
        samples_to_ms(self.config.source_sample_rate, queued) + self.lead_ms()
    }

    /// Current playback-rate factor (1.0 = nominal).
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Current backpressure level.
    pub fn backpressure(&self) -> BackpressureLevel {
        self.backpressure
    }

    /// Running counters.
    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    /// The output graph.
    pub fn graph(&self) -> &G {
        &self.graph
    }

    /// Fade out and stop every in-flight segment; reset the lead clock.
    fn cut(&mut self) {
        let now = self.graph.current_time();
        let fade = self.config.fade_ms as f64 / 1000.0;
        let stop_at = now + fade;

        if !self.in_flight.is_empty() {
            self.graph.ramp_gain(GainStage::Fade, 0.0, now, fade);
            for seg in &self.in_flight {
                if seg.start >= stop_at {
                    self.graph.cancel(seg.id);
                } else {
                    self.graph.stop(seg.id, stop_at);
                }
            }
            self.graph
                .ramp_gain(GainStage::Fade, 1.0, stop_at, FADE_RESTORE_SECS);
            debug!(
                segments = self.in_flight.len(),
                "playback: fading out in-flight audio over {}ms", self.config.fade_ms
            );
        }

        self.stats.cuts += 1;
        self.next_start = None;
        self.speed = 1.0;
        self.ahead_since = None;
    }

    fn pump(&mut self, now: Instant) {
        self.reap();
        self.promote();

        let t_now = self.graph.current_time();
        if self
            .next_start
            .is_some_and(|end| end - t_now > self.config.max_lead_ms as f64 / 1000.0)
        {
            self.snap_forward(t_now);
        }

        self.update_speed(now);
        self.commit(t_now);
        self.update_backpressure();
        self.update_speaking();
    }

    fn reap(&mut self) {
        let finished = self.graph.take_finished();
        if finished.is_empty() {
            return;
        }
        self.in_flight.retain(|seg| !finished.contains(&seg.id));
        if !self
            .in_flight
            .iter()
            .any(|s| s.generation == self.live.generation)
        {
            self.next_start = None;
        }
    }

    fn promote(&mut self) {
        if self.pending.is_none() || self.live_outstanding() > 0 {
            return;
        }
        if let Some(next) = self.pending.take() {
            info!(
                from = self.live.generation,
                to = next.generation,
                "playback: promoting pending generation"
            );
            self.live = next;
            self.next_start = None;
            self.speed = 1.0;
            self.ahead_since = None;
            self.stats.promotions += 1;
        }
    }

    /// The committed lead is beyond the maximum (e.g. the graph clock jumped
    /// back): pull unstarted segments back into the queue and restart the run
    /// at the normal lead.
    fn snap_forward(&mut self, t_now: f64) {
        let live_gen = self.live.generation;
        let mut requeue = Vec::new();
        let mut kept = Vec::with_capacity(self.in_flight.len());
        for seg in std::mem::take(&mut self.in_flight) {
            if seg.start > t_now {
                self.graph.cancel(seg.id);
                if seg.generation == live_gen {
                    self.stats.bytes_scheduled -= seg.source.len() as u64 * 2;
                    requeue.push(seg);
                }
            } else {
                kept.push(seg);
            }
        }
        self.in_flight = kept;
        // Cancelled voices are already accounted for.
        let _ = self.graph.take_finished();

        requeue.sort_by(|a, b| a.start.total_cmp(&b.start));
        for seg in requeue.into_iter().rev() {
            self.live.queue.push_front(Segment {
                generation: seg.generation,
                samples: seg.source,
            });
        }

        self.next_start = self
            .in_flight
            .iter()
            .filter(|s| s.generation == live_gen)
            .map(|s| s.end)
            .reduce(f64::max);
        self.stats.snaps += 1;
        warn!(
            generation = live_gen,
            "playback: lead exceeded {}ms, snapped forward", self.config.max_lead_ms
        );
    }

    fn commit(&mut self, t_now: f64) {
        let lead = self.config.lead_ms as f64 / 1000.0;
        let ahead = self.config.schedule_ahead_ms as f64 / 1000.0;
        let out_rate = self.graph.sample_rate();

        while self
            .next_start
            .is_none_or(|end| end - t_now < ahead)
        {
            let Some(seg) = self.live.queue.pop_front() else {
                break;
            };
            if seg.generation != self.live.generation {
                self.stats.stale_segments += 1;
                continue;
            }

            let rendered = resample_linear(
                &seg.samples,
                self.config.source_sample_rate,
                out_rate,
                self.speed,
            );
            if rendered.is_empty() {
                continue;
            }
            let start = self
                .next_start
                .map_or(t_now + lead, |end| end.max(t_now + lead));
            let end = start + rendered.len() as f64 / out_rate as f64;
            let id = self.graph.schedule(rendered, start);

            self.stats.bytes_scheduled += seg.samples.len() as u64 * 2;
            self.stats.segments_scheduled += 1;
            self.in_flight.push(InFlight {
                id,
                generation: seg.generation,
                start,
                end,
                source: seg.samples,
            });
            self.next_start = Some(end);
        }
    }

    fn update_speed(&mut self, now: Instant) {
        let backlog = self.buffered_ms();
        let target_ms = self.config.nudge_target_ms as f64;
        let target = if backlog > target_ms && target_ms > 0.0 {
            let since = *self.ahead_since.get_or_insert(now);
            if now.saturating_duration_since(since) >= NUDGE_PERSISTENCE {
                let excess = ((backlog - target_ms) / target_ms).min(1.0);
                1.0 + self.config.max_nudge as f64 * excess
            } else {
                1.0
            }
        } else {
            self.ahead_since = None;
            1.0
        };
        self.speed += (target - self.speed) * NUDGE_SMOOTHING;
        let max = 1.0 + self.config.max_nudge as f64;
        self.speed = self.speed.clamp(1.0, max);
    }

    fn update_backpressure(&mut self) {
        let buffered = self.buffered_ms();
        let next = match self.backpressure {
            BackpressureLevel::Normal if buffered > self.config.high_watermark_ms as f64 => {
                BackpressureLevel::High
            }
            BackpressureLevel::High if buffered < self.config.low_watermark_ms as f64 => {
                BackpressureLevel::Normal
            }
            level => level,
        };
        if next != self.backpressure {
            info!("playback backpressure {next:?} ({buffered:.0}ms buffered)");
            self.backpressure = next;
            self.events.push(SchedulerEvent::Backpressure(next));
        }
    }

    fn update_speaking(&mut self) {
        let generation = self.live.generation;
        let speaking = !self.live.queue.is_empty()
            || self.in_flight.iter().any(|s| s.generation == generation);
        if speaking != self.speaking {
            debug!(generation, speaking, "playback speaking changed");
            self.speaking = speaking;
            self.events.push(SchedulerEvent::Speaking(speaking));
        }
    }

    /// Segments of the live generation not yet finished, including a stash tail.
    fn live_outstanding(&self) -> usize {
        let generation = self.live.generation;
        self.in_flight
            .iter()
            .filter(|s| s.generation == generation)
            .count()
            + self.live.queue.len()
            + usize::from(!self.live.stash.is_empty())
    }
}
