//! Turn-taking state machine.
//!
//! [`Session`] is the single writer for everything that decides who is
//! talking: it owns the noise gate, the VAD, the playback scheduler and the
//! barge-in bookkeeping. The async coordinator feeds it microphone frames,
//! remote events and periodic ticks in one serialized stream and forwards the
//! resulting [`SessionOutput`]s. Nothing here blocks or touches the network,
//! and every handler takes `now` explicitly.
//!
//! Barge-in policy:
//!
//! | Event | Action |
//! |---|---|
//! | assistant speech start | new generation (hard or soft), VAD boosted, no-interrupt window armed |
//! | local voice start, inside window | ignored |
//! | local voice start | duck; if the assistant is speaking and this utterance has not been barged yet, flush and notify the remote |
//! | local voice end | unduck |
//! | assistant speech done | window cleared, VAD base mode, barge flag reset; queued audio keeps draining |

use crate::agent::protocol::ClientMessage;
use crate::audio::dsp::f32_to_pcm16_le;
use crate::audio::mixer::{AudioGraph, Mixer};
use crate::audio::noise_gate::NoiseGate;
use crate::config::{DuplexConfig, HandoffMode};
use crate::error::ErrorKind;
use crate::pipeline::messages::{AudioFrame, RemoteEvent, Role};
use crate::pipeline::transcript::TranscriptGate;
use crate::runtime::{Diagnostics, SessionEvent, SessionState};
use crate::scheduler::{Generation, PlaybackScheduler, SchedulerEvent};
use crate::vad::{VadEvent, VoiceActivityDetector};
use bytes::Bytes;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Something the coordinator must deliver.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutput {
    /// Publish to the UI.
    Event(SessionEvent),
    /// Send a control message to the remote service.
    Send(ClientMessage),
    /// Send conditioned microphone audio (PCM16LE) to the remote service.
    Audio(Bytes),
}

/// Per-utterance barge-in bookkeeping.
#[derive(Debug, Default, Clone, Copy)]
pub struct BargeState {
    barged: bool,
    no_interrupt_until: Option<Instant>,
}

impl BargeState {
    /// Start of a new assistant utterance: one barge-in allowed after `until`.
    pub fn arm(&mut self, until: Instant) {
        self.barged = false;
        self.no_interrupt_until = Some(until);
    }

    /// End of the assistant utterance.
    pub fn reset(&mut self) {
        self.barged = false;
        self.no_interrupt_until = None;
    }

    /// Whether `at` falls inside the no-interrupt window.
    pub fn in_window(&self, at: Instant) -> bool {
        self.no_interrupt_until.is_some_and(|t| at < t)
    }

    /// Claim the single barge-in of this utterance.
    pub fn try_barge(&mut self) -> bool {
        !std::mem::replace(&mut self.barged, true)
    }

    pub fn has_barged(&self) -> bool {
        self.barged
    }
}

/// The duplex session's decision core.
pub struct Session<G: AudioGraph = Mixer> {
    config: DuplexConfig,
    gate: NoiseGate,
    vad: VoiceActivityDetector,
    scheduler: PlaybackScheduler<G>,
    barge: BargeState,
    transcripts: TranscriptGate,
    /// Generation that incoming remote audio is tagged with.
    generation: Generation,
    state: SessionState,
    remote_speaking: bool,
    user_speaking: bool,
    user_reported: bool,
    assistant_speaking: bool,
    silent_for: Duration,
    outputs: Vec<SessionOutput>,
}

impl<G: AudioGraph> Session<G> {
    /// Build a session rendering assistant speech into `graph`.
    pub fn new(config: &DuplexConfig, graph: G) -> Self {
        Self {
            gate: NoiseGate::new(&config.noise_gate, config.audio.input_sample_rate),
            vad: VoiceActivityDetector::new(&config.vad),
            scheduler: PlaybackScheduler::new(&config.playback, graph),
            config: config.clone(),
            barge: BargeState::default(),
            transcripts: TranscriptGate::new(),
            generation: 0,
            state: SessionState::Idle,
            remote_speaking: false,
            user_speaking: false,
            user_reported: false,
            assistant_speaking: false,
            silent_for: Duration::ZERO,
            outputs: Vec::new(),
        }
    }

    /// Process one microphone frame: condition it for the network and run
    /// voice detection on the raw signal.
    pub fn on_frame(&mut self, frame: &AudioFrame, now: Instant) {
        let conditioned = self.gate.process(frame);
        if self.state.is_live() {
            self.outputs
                .push(SessionOutput::Audio(Bytes::from(f32_to_pcm16_le(
                    &conditioned.samples,
                ))));
        }

        self.watch_mic(frame);

        if let Some(event) = self.vad.process(frame) {
            self.on_voice(event, now);
        }
        self.sync();
    }

    /// Apply a voice-activity event.
    pub fn on_voice(&mut self, event: VadEvent, now: Instant) {
        match event {
            VadEvent::VoiceStart { .. } => {
                // The window deadline was taken from this session's clock.
                if self.barge.in_window(now) {
                    debug!("voice start inside no-interrupt window, ignored");
                    return;
                }
                self.user_speaking = true;
                self.scheduler.duck();
                if self.config.barge_in.enabled
                    && self.is_assistant_speaking()
                    && self.barge.try_barge()
                {
                    info!(generation = self.generation, "barge-in: stopping assistant audio");
                    self.scheduler.flush();
                    self.remote_speaking = false;
                    self.outputs
                        .push(SessionOutput::Send(ClientMessage::UserStartedSpeaking));
                }
            }
            VadEvent::VoiceEnd { .. } => {
                self.user_speaking = false;
                self.scheduler.unduck();
            }
        }
        self.scheduler.tick(now);
        self.sync();
    }

    /// Apply an event from the remote service.
    pub fn on_remote(&mut self, event: RemoteEvent, now: Instant) {
        match event {
            RemoteEvent::Opened => {
                info!("duplex session connected");
                self.set_state(SessionState::Connected);
            }
            RemoteEvent::Closed { reason } => {
                self.stop_audio();
                if self.state.is_live() || self.state == SessionState::Connecting {
                    self.fail(ErrorKind::Connection, &reason);
                }
            }
            RemoteEvent::Transcript { role, text } => {
                let released = self.transcripts.on_text(role, text);
                self.publish_transcripts(released);
            }
            RemoteEvent::AssistantSpeechStart => {
                self.generation = match self.config.barge_in.handoff {
                    HandoffMode::Hard => self.scheduler.start_utterance(),
                    HandoffMode::Soft => self.scheduler.start_utterance_soft(),
                };
                self.remote_speaking = true;
                let until = now + Duration::from_millis(self.config.barge_in.no_interrupt_ms as u64);
                self.vad.set_boosted(true);
                self.vad.set_no_interrupt_until(until);
                self.barge.arm(until);
                self.transcripts.on_speech_start();
                info!(generation = self.generation, "assistant speech start");
            }
            RemoteEvent::AudioChunk(bytes) => {
                self.scheduler.enqueue(&bytes, self.generation, now);
                let released = self.transcripts.on_audio();
                self.publish_transcripts(released);
            }
            RemoteEvent::AssistantSpeechDone => {
                self.scheduler.finish_generation(self.generation, now);
                self.remote_speaking = false;
                self.vad.clear_no_interrupt();
                self.vad.set_boosted(false);
                self.barge.reset();
                let released = self.transcripts.on_speech_done();
                self.publish_transcripts(released);
                info!(generation = self.generation, "assistant speech done");
            }
            RemoteEvent::Error(reason) => {
                warn!("remote error: {reason}");
                self.fail(ErrorKind::Connection, &reason);
            }
        }
        self.sync();
    }

    /// Periodic housekeeping (playback pump, idle stash flush).
    pub fn tick(&mut self, now: Instant) {
        self.scheduler.tick(now);
        self.sync();
    }

    /// The capture stream ended mid-session. Keep the conversation going
    /// without local voice detection.
    pub fn on_capture_lost(&mut self, reason: &str) {
        if self.vad.is_degraded() {
            return;
        }
        warn!("capture lost: {reason}");
        self.vad.degrade(reason);
        self.user_speaking = false;
        self.scheduler.unduck();
        self.outputs.push(SessionOutput::Event(SessionEvent::Error {
            kind: ErrorKind::AnalysisUnavailable,
            reason: reason.to_owned(),
        }));
        self.sync();
    }

    /// Move to a lifecycle state, publishing the change.
    pub fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("session state {:?} -> {state:?}", self.state);
            self.state = state;
            self.outputs
                .push(SessionOutput::Event(SessionEvent::ConnectionStateChanged {
                    state,
                }));
        }
    }

    /// Report an error and enter the error state.
    pub fn fail(&mut self, kind: ErrorKind, reason: &str) {
        self.outputs.push(SessionOutput::Event(SessionEvent::Error {
            kind,
            reason: reason.to_owned(),
        }));
        self.stop_audio();
        self.set_state(SessionState::Error);
        self.sync();
    }

    /// Stop all audio and return to idle. Safe from any state.
    pub fn teardown(&mut self) {
        self.stop_audio();
        self.vad.reset();
        self.transcripts.clear();
        self.set_state(SessionState::Idle);
        self.sync();
    }

    /// Take everything produced since the last call.
    pub fn drain(&mut self) -> Vec<SessionOutput> {
        std::mem::take(&mut self.outputs)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the remote is sending a response or its audio is still playing.
    pub fn is_assistant_speaking(&self) -> bool {
        self.remote_speaking || self.scheduler.is_speaking()
    }

    pub fn is_user_speaking(&self) -> bool {
        self.user_speaking
    }

    pub fn barge_state(&self) -> BargeState {
        self.barge
    }

    pub fn scheduler(&self) -> &PlaybackScheduler<G> {
        &self.scheduler
    }

    pub fn vad(&self) -> &VoiceActivityDetector {
        &self.vad
    }

    /// Snapshot for instrumentation.
    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            state: self.state,
            queue_depth: self.scheduler.queue_depth(),
            lead_ms: self.scheduler.lead_ms(),
            generation: self.scheduler.generation(),
            pending_generation: self.scheduler.pending_generation(),
            vad_state: self.vad.state(),
            vad_boosted: self.vad.is_boosted(),
            vad_degraded: self.vad.is_degraded(),
            playback_speed: self.scheduler.speed(),
        }
    }

    fn stop_audio(&mut self) {
        self.scheduler.flush();
        self.scheduler.unduck();
        self.remote_speaking = false;
        self.user_speaking = false;
        self.barge.reset();
        self.vad.clear_no_interrupt();
        self.vad.set_boosted(false);
    }

    /// Degrade barge-in when the microphone delivers only digital silence.
    fn watch_mic(&mut self, frame: &AudioFrame) {
        if frame.samples.iter().all(|&s| s == 0.0) {
            self.silent_for += frame.duration();
        } else {
            self.silent_for = Duration::ZERO;
            if self.vad.is_degraded() {
                self.vad.restore();
            }
            return;
        }

        let limit = Duration::from_secs(self.config.audio.mic_watchdog_secs as u64);
        if !limit.is_zero() && self.silent_for >= limit && !self.vad.is_degraded() {
            let reason = format!(
                "microphone delivered only silence for {}s, barge-in disabled",
                limit.as_secs()
            );
            self.vad.degrade(&reason);
            self.outputs.push(SessionOutput::Event(SessionEvent::Error {
                kind: ErrorKind::AnalysisUnavailable,
                reason,
            }));
        }
    }

    fn publish_transcripts(&mut self, lines: Vec<(Role, String)>) {
        self.outputs.extend(
            lines
                .into_iter()
                .map(|(role, text)| SessionOutput::Event(SessionEvent::Transcript { role, text })),
        );
    }

    /// Fold scheduler notifications and speaking flags into UI events.
    fn sync(&mut self) {
        for event in self.scheduler.drain_events() {
            if let SchedulerEvent::Backpressure(level) = event {
                self.outputs
                    .push(SessionOutput::Event(SessionEvent::backpressure(level)));
            }
        }

        let assistant = self.is_assistant_speaking();
        if assistant != self.assistant_speaking {
            self.assistant_speaking = assistant;
            self.outputs
                .push(SessionOutput::Event(SessionEvent::AssistantSpeakingChanged {
                    speaking: assistant,
                }));
        }

        let user = self.user_speaking;
        if user != self.user_reported {
            self.user_reported = user;
            self.outputs
                .push(SessionOutput::Event(SessionEvent::UserSpeakingChanged {
                    speaking: user,
                }));
        }

        if self.state.is_live() {
            let next = if user {
                SessionState::UserSpeaking
            } else if assistant {
                SessionState::AssistantSpeaking
            } else {
                SessionState::Connected
            };
            self.set_state(next);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::test_utils::{frame_at, pcm16_tone};

    const RATE: u32 = 16_000;

    fn session() -> Session {
        let mut config = DuplexConfig::default();
        config.noise_gate.calibration_ms = 0;
        let mut session = Session::new(&config, Mixer::new(48_000));
        session.on_remote(RemoteEvent::Opened, Instant::now());
        session.drain();
        session
    }

    fn events(outputs: &[SessionOutput]) -> Vec<SessionEvent> {
        outputs
            .iter()
            .filter_map(|o| match o {
                SessionOutput::Event(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    fn sends(outputs: &[SessionOutput]) -> usize {
        outputs
            .iter()
            .filter(|o| matches!(o, SessionOutput::Send(ClientMessage::UserStartedSpeaking)))
            .count()
    }

    #[test]
    fn barge_state_is_one_shot() {
        let mut barge = BargeState::default();
        let now = Instant::now();
        barge.arm(now + Duration::from_millis(300));
        assert!(barge.in_window(now));
        assert!(!barge.in_window(now + Duration::from_millis(300)));
        assert!(barge.try_barge());
        assert!(!barge.try_barge());
        barge.reset();
        assert!(barge.try_barge());
    }

    #[test]
    fn live_session_streams_conditioned_audio() {
        let mut s = session();
        let now = Instant::now();
        s.on_frame(&frame_at(0.0, now, 0, RATE), now);
        let out = s.drain();
        let audio: Vec<_> = out
            .iter()
            .filter_map(|o| match o {
                SessionOutput::Audio(b) => Some(b.len()),
                _ => None,
            })
            .collect();
        assert_eq!(audio, vec![640]);
    }

    #[test]
    fn idle_session_sends_no_audio() {
        let mut config = DuplexConfig::default();
        config.noise_gate.calibration_ms = 0;
        let mut s = Session::new(&config, Mixer::new(48_000));
        let now = Instant::now();
        s.on_frame(&frame_at(0.2, now, 0, RATE), now);
        assert!(s.drain().iter().all(|o| !matches!(o, SessionOutput::Audio(_))));
    }

    #[test]
    fn voice_start_while_assistant_speaks_flushes_once() {
        let mut s = session();
        let t0 = Instant::now();
        s.on_remote(RemoteEvent::AssistantSpeechStart, t0);
        s.on_remote(RemoteEvent::AudioChunk(pcm16_tone(500, 24_000)), t0);
        s.drain();

        let later = t0 + Duration::from_millis(400);
        s.on_voice(VadEvent::VoiceStart { at: later }, later);
        let out = s.drain();
        assert_eq!(sends(&out), 1);
        assert!(!s.scheduler().is_speaking());
        assert!(s.scheduler().is_ducked());
        assert_eq!(s.scheduler().stats().cuts, 2);

        s.on_voice(VadEvent::VoiceEnd { at: later }, later);
        let again = later + Duration::from_millis(100);
        s.on_voice(VadEvent::VoiceStart { at: again }, again);
        assert_eq!(sends(&s.drain()), 0);
        assert_eq!(s.scheduler().stats().cuts, 2);
    }

    #[test]
    fn voice_start_inside_window_is_ignored() {
        let mut s = session();
        let t0 = Instant::now();
        s.on_remote(RemoteEvent::AssistantSpeechStart, t0);
        s.on_remote(RemoteEvent::AudioChunk(pcm16_tone(500, 24_000)), t0);
        s.drain();

        let early = t0 + Duration::from_millis(299);
        s.on_voice(VadEvent::VoiceStart { at: early }, early);
        let out = s.drain();
        assert_eq!(sends(&out), 0);
        assert!(!s.is_user_speaking());
        assert!(!s.scheduler().is_ducked());
        assert!(s.scheduler().is_speaking());
    }

    #[test]
    fn window_uses_session_clock_not_frame_clock() {
        let mut s = session();
        let t0 = Instant::now();
        s.on_remote(RemoteEvent::AssistantSpeechStart, t0);
        s.on_remote(RemoteEvent::AudioChunk(pcm16_tone(500, 24_000)), t0);
        s.drain();

        // A frame stamp that has run well ahead of wall time.
        let now = t0 + Duration::from_millis(100);
        let skewed = t0 + Duration::from_millis(700);
        s.on_voice(VadEvent::VoiceStart { at: skewed }, now);
        assert_eq!(sends(&s.drain()), 0);
        assert!(!s.is_user_speaking());
        assert!(s.scheduler().is_speaking());
    }

    #[test]
    fn voice_start_without_assistant_only_ducks() {
        let mut s = session();
        let now = Instant::now();
        s.on_voice(VadEvent::VoiceStart { at: now }, now);
        let out = s.drain();
        assert_eq!(sends(&out), 0);
        assert!(s.scheduler().is_ducked());
        assert_eq!(s.state(), SessionState::UserSpeaking);
        assert!(events(&out).contains(&SessionEvent::UserSpeakingChanged { speaking: true }));

        s.on_voice(VadEvent::VoiceEnd { at: now }, now);
        assert!(!s.scheduler().is_ducked());
        assert_eq!(s.state(), SessionState::Connected);
    }

    #[test]
    fn speech_start_arms_boost_and_done_clears_it() {
        let mut s = session();
        let now = Instant::now();
        s.on_remote(RemoteEvent::AssistantSpeechStart, now);
        assert!(s.vad().is_boosted());
        assert_eq!(s.state(), SessionState::AssistantSpeaking);

        s.on_remote(RemoteEvent::AssistantSpeechDone, now);
        assert!(!s.vad().is_boosted());
        assert!(!s.barge_state().has_barged());
    }

    #[test]
    fn assistant_transcript_released_with_first_audio() {
        let mut s = session();
        let now = Instant::now();
        s.on_remote(
            RemoteEvent::Transcript {
                role: Role::Assistant,
                text: "Hello".into(),
            },
            now,
        );
        s.on_remote(RemoteEvent::AssistantSpeechStart, now);
        assert!(!events(&s.drain())
            .iter()
            .any(|e| matches!(e, SessionEvent::Transcript { .. })));

        s.on_remote(RemoteEvent::AudioChunk(pcm16_tone(100, 24_000)), now);
        let out = events(&s.drain());
        assert!(out.contains(&SessionEvent::Transcript {
            role: Role::Assistant,
            text: "Hello".into()
        }));
    }

    #[test]
    fn remote_error_enters_error_state() {
        let mut s = session();
        s.on_remote(RemoteEvent::Error("quota".into()), Instant::now());
        let out = events(&s.drain());
        assert_eq!(s.state(), SessionState::Error);
        assert!(out.contains(&SessionEvent::Error {
            kind: ErrorKind::Connection,
            reason: "quota".into()
        }));
    }

    #[test]
    fn silent_microphone_degrades_barge_in() {
        let mut s = session();
        let base = Instant::now();
        // 5 s of digital silence = 250 frames.
        for i in 0..250 {
            s.on_frame(&frame_at(0.0, base, i, RATE), base);
        }
        let out = events(&s.drain());
        assert!(s.vad().is_degraded());
        assert_eq!(
            out.iter()
                .filter(|e| matches!(
                    e,
                    SessionEvent::Error {
                        kind: ErrorKind::AnalysisUnavailable,
                        ..
                    }
                ))
                .count(),
            1
        );

        s.on_frame(&frame_at(0.01, base, 251, RATE), base);
        assert!(!s.vad().is_degraded());
    }

    #[test]
    fn teardown_is_idempotent() {
        let mut s = session();
        let now = Instant::now();
        s.on_remote(RemoteEvent::AssistantSpeechStart, now);
        s.on_remote(RemoteEvent::AudioChunk(pcm16_tone(300, 24_000)), now);
        s.teardown();
        s.teardown();
        assert_eq!(s.state(), SessionState::Idle);
        assert!(!s.is_assistant_speaking());
        let changes = events(&s.drain())
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::ConnectionStateChanged { state: SessionState::Idle }))
            .count();
        assert_eq!(changes, 1);
    }

    #[test]
    fn capture_loss_degrades_once_and_keeps_session() {
        let mut s = session();
        s.on_capture_lost("input stream ended");
        s.on_capture_lost("input stream ended");
        let errors = events(&s.drain())
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    SessionEvent::Error {
                        kind: ErrorKind::AnalysisUnavailable,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(errors, 1);
        assert!(s.vad().is_degraded());
        assert_eq!(s.state(), SessionState::Connected);
    }
}
