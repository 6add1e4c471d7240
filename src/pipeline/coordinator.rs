//! Async orchestrator that wires capture, the remote link and playback
//! around a [`Session`].
//!
//! [`DuplexVoice`] is the upward-facing API: start and end a session,
//! subscribe to [`SessionEvent`]s and read [`Diagnostics`]. Each running
//! session is one spawned task that serializes microphone frames, remote
//! events, playback stream errors and a periodic tick into the session state
//! machine, so every decision has a single writer.

use crate::agent::AgentConnection;
use crate::audio::capture::CpalCapture;
use crate::audio::mixer::Mixer;
use crate::audio::playback::CpalPlayback;
use crate::config::DuplexConfig;
use crate::error::{ErrorKind, Result, VoiceError};
use crate::pipeline::messages::{AudioFrame, RemoteEvent};
use crate::pipeline::session::{Session, SessionOutput};
use crate::runtime::{Diagnostics, SessionEvent, SessionState};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

/// Channel buffer sizes.
const FRAME_CHANNEL_SIZE: usize = 64;
const REMOTE_CHANNEL_SIZE: usize = 256;
const EVENT_CHANNEL_SIZE: usize = 256;

/// Housekeeping period for the playback pump.
const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// A spawned session.
struct RunningSession {
    id: Uuid,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Real-time duplex voice client.
pub struct DuplexVoice {
    config: DuplexConfig,
    events: broadcast::Sender<SessionEvent>,
    diagnostics_tx: watch::Sender<Diagnostics>,
    diagnostics_rx: watch::Receiver<Diagnostics>,
    running: Option<RunningSession>,
}

impl DuplexVoice {
    /// Create a client. Nothing is opened until [`start_session`](Self::start_session).
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Config`] if the configuration is invalid.
    pub fn new(mut config: DuplexConfig) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (diagnostics_tx, diagnostics_rx) = watch::channel(Diagnostics::default());
        Ok(Self {
            config,
            events,
            diagnostics_tx,
            diagnostics_rx,
            running: None,
        })
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Latest pipeline snapshot.
    pub fn diagnostics(&self) -> Diagnostics {
        *self.diagnostics_rx.borrow()
    }

    /// Watch pipeline snapshots as they change.
    pub fn watch_diagnostics(&self) -> watch::Receiver<Diagnostics> {
        self.diagnostics_rx.clone()
    }

    pub fn config(&self) -> &DuplexConfig {
        &self.config
    }

    /// Whether a session task is currently running.
    pub fn is_running(&self) -> bool {
        self.running.as_ref().is_some_and(|r| !r.task.is_finished())
    }

    /// Open the microphone and speaker, connect to the remote service and
    /// start the session. A no-op while a session is already running.
    ///
    /// # Errors
    ///
    /// Device failures are returned as [`VoiceError::Device`] and never
    /// retried. A failed first connection is returned as
    /// [`VoiceError::Connection`]; the caller decides whether to try again.
    pub async fn start_session(&mut self) -> Result<()> {
        if self.is_running() {
            debug!("session already running");
            return Ok(());
        }
        if let Some(stale) = self.running.take() {
            stale.cancel.cancel();
            let _ = stale.task.await;
        }

        let id = Uuid::new_v4();
        let span = info_span!("session", id = %id);
        let config = self.config.clone();
        let mixer = Mixer::new(config.audio.output_sample_rate);
        let mut session = Session::new(&config, mixer.clone());
        let cancel = CancellationToken::new();

        session.set_state(SessionState::Connecting);
        self.publish(&mut session);

        // Capture first: a refused microphone must surface before anything
        // else is opened.
        let capture = match CpalCapture::new(&config.audio) {
            Ok(capture) => capture,
            Err(e) => return self.abort(session, &cancel, e),
        };
        let (frame_tx, frame_rx) = mpsc::channel::<AudioFrame>(FRAME_CHANNEL_SIZE);
        let (ready_tx, ready_rx) = oneshot::channel();
        let capture_cancel = cancel.child_token();
        tokio::spawn(
            async move {
                if let Err(e) = capture.run(frame_tx, ready_tx, capture_cancel).await {
                    error!("capture stage error: {e}");
                }
            }
            .instrument(span.clone()),
        );
        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return self.abort(session, &cancel, e),
            Err(_) => {
                let e = VoiceError::Channel("capture task ended before opening".into());
                return self.abort(session, &cancel, e);
            }
        }

        let (playback_err_tx, playback_err_rx) = mpsc::unbounded_channel();
        let playback = match CpalPlayback::start(&config.audio, mixer, playback_err_tx) {
            Ok(playback) => playback,
            Err(e) => return self.abort(session, &cancel, e),
        };

        let (remote_tx, remote_rx) = mpsc::channel(REMOTE_CHANNEL_SIZE);
        let connection = match AgentConnection::connect(&config, remote_tx, &cancel)
            .instrument(span.clone())
            .await
        {
            Ok(connection) => connection,
            Err(e) => return self.abort(session, &cancel, e),
        };

        info!(session = %id, "duplex session started");
        let task = SessionTask {
            config,
            session,
            frames: frame_rx,
            capture_open: true,
            remote: remote_rx,
            connection: Some(connection),
            playback,
            playback_errors: playback_err_rx,
            events: self.events.clone(),
            diagnostics: self.diagnostics_tx.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(task.run().instrument(span));
        self.running = Some(RunningSession { id, cancel, task });
        Ok(())
    }

    /// Stop everything and return to idle. Safe to call from any state and
    /// any number of times.
    pub async fn end_session(&mut self) {
        if let Some(run) = self.running.take() {
            info!(session = %run.id, "ending duplex session");
            run.cancel.cancel();
            if let Err(e) = run.task.await {
                warn!("session task ended abnormally: {e}");
            }
        }

        // A session that already stopped in the error state still reports
        // its way back to idle.
        let state = self.diagnostics_rx.borrow().state;
        if state != SessionState::Idle {
            let _ = self.events.send(SessionEvent::ConnectionStateChanged {
                state: SessionState::Idle,
            });
            self.diagnostics_tx.send_replace(Diagnostics::default());
        }
    }

    /// Publish a session's pending events before its task exists.
    fn publish(&self, session: &mut Session) {
        deliver(session.drain(), None, &self.events);
        self.diagnostics_tx.send_replace(session.diagnostics());
    }

    fn abort(
        &self,
        mut session: Session,
        cancel: &CancellationToken,
        err: VoiceError,
    ) -> Result<()> {
        error!("session start failed: {err}");
        cancel.cancel();
        session.fail(err.kind(), &err.to_string());
        self.publish(&mut session);
        Err(err)
    }
}

impl Drop for DuplexVoice {
    fn drop(&mut self) {
        if let Some(run) = &self.running {
            run.cancel.cancel();
        }
    }
}

/// Route session outputs to the remote link and the UI channel.
fn deliver(
    outputs: Vec<SessionOutput>,
    connection: Option<&AgentConnection>,
    events: &broadcast::Sender<SessionEvent>,
) {
    for output in outputs {
        match output {
            SessionOutput::Event(event) => {
                // No subscribers is fine.
                let _ = events.send(event);
            }
            SessionOutput::Send(msg) => {
                if let Some(conn) = connection {
                    conn.send(msg);
                }
            }
            SessionOutput::Audio(pcm) => {
                if let Some(conn) = connection {
                    conn.send_audio(pcm);
                }
            }
        }
    }
}

/// Why the event loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Cancelled,
    ConnectionLost,
    Fatal,
}

/// State owned by a running session task.
struct SessionTask {
    config: DuplexConfig,
    session: Session,
    frames: mpsc::Receiver<AudioFrame>,
    capture_open: bool,
    remote: mpsc::Receiver<RemoteEvent>,
    connection: Option<AgentConnection>,
    playback: CpalPlayback,
    playback_errors: mpsc::UnboundedReceiver<String>,
    events: broadcast::Sender<SessionEvent>,
    diagnostics: watch::Sender<Diagnostics>,
    cancel: CancellationToken,
}

impl SessionTask {
    async fn run(mut self) {
        let mut failures = 0u32;
        let exit = loop {
            if self.connection.is_some() {
                match self.event_loop().await {
                    LoopExit::Cancelled => break LoopExit::Cancelled,
                    LoopExit::Fatal => break LoopExit::Fatal,
                    LoopExit::ConnectionLost => {
                        if let Some(conn) = self.connection.take() {
                            conn.close().await;
                        }
                    }
                }
            }

            if !self.retry_allowed(failures) {
                warn!("connection lost, not retrying");
                break LoopExit::ConnectionLost;
            }
            failures += 1;
            if !self.countdown().await {
                break LoopExit::Cancelled;
            }
            if self.reconnect().await {
                failures = 0;
            }
        };

        self.finish(exit).await;
    }

    /// Serialize all inputs into the session until cancellation or failure.
    async fn event_loop(&mut self) -> LoopExit {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let mut fatal = false;
            tokio::select! {
                _ = self.cancel.cancelled() => return LoopExit::Cancelled,
                frame = self.frames.recv(), if self.capture_open => match frame {
                    Some(frame) => self.session.on_frame(&frame, Instant::now()),
                    None => {
                        self.capture_open = false;
                        self.session.on_capture_lost("microphone stream ended");
                    }
                },
                remote = self.remote.recv() => match remote {
                    Some(event) => self.session.on_remote(event, Instant::now()),
                    None => self
                        .session
                        .fail(ErrorKind::Connection, "remote event channel closed"),
                },
                Some(reason) = self.playback_errors.recv() => {
                    warn!("output stream error, restarting: {reason}");
                    if let Err(e) = self.playback.restart() {
                        error!("output stream restart failed: {e}");
                        self.session.fail(e.kind(), &e.to_string());
                        fatal = true;
                    }
                }
                _ = tick.tick() => {
                    self.session.tick(Instant::now());
                    self.diagnostics.send_replace(self.session.diagnostics());
                }
            }

            self.flush_outputs();
            if fatal {
                return LoopExit::Fatal;
            }
            if self.session.state() == SessionState::Error {
                return LoopExit::ConnectionLost;
            }
        }
    }

    fn retry_allowed(&self, failures: u32) -> bool {
        let policy = &self.config.reconnect;
        policy.enabled && (policy.max_attempts == 0 || failures < policy.max_attempts)
    }

    /// Count down before a retry. Returns `false` if cancelled meanwhile.
    async fn countdown(&self) -> bool {
        for remaining in (1..=self.config.reconnect.delay_secs).rev() {
            info!("reconnecting in {remaining}s");
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
        !self.cancel.is_cancelled()
    }

    /// One reconnect attempt. Each connection gets a fresh event channel so
    /// a late close from the previous socket cannot fail the new one.
    async fn reconnect(&mut self) -> bool {
        self.session.set_state(SessionState::Connecting);
        self.flush_outputs();

        let (remote_tx, remote_rx) = mpsc::channel(REMOTE_CHANNEL_SIZE);
        match AgentConnection::connect(&self.config, remote_tx, &self.cancel).await {
            Ok(conn) => {
                self.remote = remote_rx;
                self.connection = Some(conn);
                true
            }
            Err(e) => {
                warn!("reconnect failed: {e}");
                self.session.fail(e.kind(), &e.to_string());
                self.flush_outputs();
                false
            }
        }
    }

    fn flush_outputs(&mut self) {
        deliver(self.session.drain(), self.connection.as_ref(), &self.events);
    }

    async fn finish(mut self, exit: LoopExit) {
        // Stops capture and any connection tasks.
        self.cancel.cancel();
        if let Some(conn) = self.connection.take() {
            conn.close().await;
        }
        if exit == LoopExit::Cancelled {
            self.session.teardown();
        }
        self.flush_outputs();
        self.diagnostics.send_replace(self.session.diagnostics());
        drop(self.playback);
        info!("duplex session stopped ({exit:?})");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = DuplexConfig::default();
        config.playback.min_segment_ms = 0;
        assert!(matches!(DuplexVoice::new(config), Err(VoiceError::Config(_))));
    }

    #[tokio::test]
    async fn end_session_without_start_is_a_noop() {
        let mut voice = DuplexVoice::new(DuplexConfig::default()).unwrap();
        let mut events = voice.subscribe();
        voice.end_session().await;
        voice.end_session().await;
        assert!(!voice.is_running());
        assert_eq!(voice.diagnostics().state, SessionState::Idle);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn deliver_publishes_events_without_a_connection() {
        let (tx, mut rx) = broadcast::channel(8);
        deliver(
            vec![
                SessionOutput::Event(SessionEvent::UserSpeakingChanged { speaking: true }),
                SessionOutput::Send(crate::agent::ClientMessage::UserStartedSpeaking),
                SessionOutput::Audio(bytes::Bytes::from_static(&[0, 0])),
            ],
            None,
            &tx,
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::UserSpeakingChanged { speaking: true }
        );
        assert!(rx.try_recv().is_err());
    }
}
