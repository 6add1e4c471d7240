//! WebSocket link to the remote duplex speech service.
//!
//! [`AgentConnection::connect`] opens the socket, sends [`Settings`], then
//! runs two background tasks:
//!
//! - an I/O task that forwards outbound frames and decodes inbound ones into
//!   [`RemoteEvent`]s;
//! - a keep-alive task on its own interval, so heartbeats go out regardless
//!   of audio or event traffic.
//!
//! Both tasks stop when the connection's cancellation token fires or the
//! socket closes. Sending never blocks the caller.

use crate::agent::protocol::{ClientMessage, Settings, decode_text};
use crate::config::DuplexConfig;
use crate::error::{Result, VoiceError};
use crate::pipeline::messages::RemoteEvent;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Frames queued for the I/O task.
#[derive(Debug)]
enum Outbound {
    Audio(Bytes),
    Control(ClientMessage),
}

/// A live connection. Dropping it closes the socket.
pub struct AgentConnection {
    outbound: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
    io_task: JoinHandle<()>,
    keepalive_task: JoinHandle<()>,
}

impl AgentConnection {
    /// Connect, send settings and start the background tasks.
    ///
    /// Decoded events are delivered to `events`, starting with
    /// [`RemoteEvent::Opened`] and ending with [`RemoteEvent::Closed`].
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Connection`] if the socket cannot be opened or
    /// the settings cannot be sent.
    pub async fn connect(
        config: &DuplexConfig,
        events: mpsc::Sender<RemoteEvent>,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let agent = &config.agent;
        let mut request = agent
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| VoiceError::Connection(format!("invalid agent url: {e}")))?;
        if let Some(key) = agent.effective_api_key() {
            let value = HeaderValue::from_str(&format!("Token {key}"))
                .map_err(|e| VoiceError::Config(format!("invalid api key: {e}")))?;
            request.headers_mut().insert("Authorization", value);
        }

        info!("connecting to agent at {}", agent.url);
        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| VoiceError::Connection(format!("connect: {e}")))?;
        let (mut write, read) = ws.split();

        let settings = serde_json::to_string(&ClientMessage::Settings(Settings::from_config(
            config,
        )))
        .map_err(|e| VoiceError::Protocol(format!("encode settings: {e}")))?;
        write
            .send(Message::Text(settings))
            .await
            .map_err(|e| VoiceError::Connection(format!("send settings: {e}")))?;
        info!("agent connected, settings sent");

        let cancel = parent.child_token();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let _ = events.send(RemoteEvent::Opened).await;

        let io_task = tokio::spawn(io_loop(write, read, outbound_rx, events, cancel.clone()));
        let keepalive_task = tokio::spawn(keepalive_loop(
            outbound.clone(),
            Duration::from_secs(agent.keepalive_secs.max(1) as u64),
            cancel.child_token(),
        ));

        Ok(Self {
            outbound,
            cancel,
            io_task,
            keepalive_task,
        })
    }

    /// Queue a block of PCM16LE microphone audio.
    pub fn send_audio(&self, pcm: Bytes) {
        let _ = self.outbound.send(Outbound::Audio(pcm));
    }

    /// Queue a control message.
    pub fn send(&self, msg: ClientMessage) {
        let _ = self.outbound.send(Outbound::Control(msg));
    }

    /// Whether the I/O task is still running.
    pub fn is_open(&self) -> bool {
        !self.io_task.is_finished()
    }

    /// Close the socket and stop the background tasks. Idempotent.
    pub async fn close(mut self) {
        self.cancel.cancel();
        let _ = (&mut self.io_task).await;
        let _ = (&mut self.keepalive_task).await;
        debug!("agent connection closed");
    }
}

impl Drop for AgentConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn io_loop(
    mut write: futures_util::stream::SplitSink<WsStream, Message>,
    mut read: futures_util::stream::SplitStream<WsStream>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::Sender<RemoteEvent>,
    cancel: CancellationToken,
) {
    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break "closed locally".to_owned();
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(event) = decode_text(&text) {
                            if events.send(event).await.is_err() {
                                break "event receiver dropped".to_owned();
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if !data.is_empty()
                            && events.send(RemoteEvent::AudioChunk(Bytes::from(data))).await.is_err()
                        {
                            break "event receiver dropped".to_owned();
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| format!("closed by server: {}", f.reason))
                            .unwrap_or_else(|| "closed by server".to_owned());
                    }
                    None => break "connection closed by server".to_owned(),
                    Some(Err(e)) => break format!("read error: {e}"),
                    _ => {} // Ping/Pong frames handled by tungstenite.
                }
            }
            Some(out) = outbound_rx.recv() => {
                let frame = match out {
                    Outbound::Audio(pcm) => Message::Binary(pcm.to_vec()),
                    Outbound::Control(msg) => match serde_json::to_string(&msg) {
                        Ok(json) => Message::Text(json),
                        Err(e) => {
                            warn!("failed to encode {msg:?}: {e}");
                            continue;
                        }
                    },
                };
                if let Err(e) = write.send(frame).await {
                    break format!("send error: {e}");
                }
            }
        }
    };

    info!("agent connection ended: {reason}");
    let _ = events.send(RemoteEvent::Closed { reason }).await;
}

async fn keepalive_loop(
    outbound: mpsc::UnboundedSender<Outbound>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    // Skip the first immediate tick.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if outbound.send(Outbound::Control(ClientMessage::KeepAlive)).is_err() {
                    break;
                }
                debug!("keep-alive sent");
            }
        }
    }
}
