//! Contract tests for the remote agent link against a loopback WebSocket
//! server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use bytes::Bytes;
use duplex_voice::DuplexConfig;
use duplex_voice::agent::{AgentConnection, ClientMessage};
use duplex_voice::pipeline::messages::{RemoteEvent, Role};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

async fn listener() -> (TcpListener, DuplexConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = DuplexConfig::default();
    config.agent.url = format!("ws://{}/agent", listener.local_addr().unwrap());
    (listener, config)
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (tcp, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(tcp).await.unwrap()
}

async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> serde_json::Value {
    loop {
        match tokio::time::timeout(WAIT, ws.next()).await.unwrap() {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

async fn next_event(rx: &mut mpsc::Receiver<RemoteEvent>) -> RemoteEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for remote event")
        .expect("event channel closed")
}

#[tokio::test]
async fn settings_are_sent_first_and_server_events_decode_in_order() {
    let (listener, config) = listener().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let settings = next_text(&mut ws).await;

        for text in [
            r#"{"type":"Welcome","request_id":"r-1"}"#,
            r#"{"type":"ConversationText","role":"user","content":"table for two"}"#,
            r#"{"type":"AgentStartedSpeaking"}"#,
        ] {
            ws.send(Message::Text(text.into())).await.unwrap();
        }
        ws.send(Message::Binary(vec![1, 0, 2, 0])).await.unwrap();
        ws.send(Message::Text(r#"{"type":"AgentAudioDone"}"#.into()))
            .await
            .unwrap();

        // Wait for the client's microphone audio.
        let mic = loop {
            match tokio::time::timeout(WAIT, ws.next()).await.unwrap() {
                Some(Ok(Message::Binary(data))) => break data,
                Some(Ok(_)) => continue,
                other => panic!("expected binary audio, got {other:?}"),
            }
        };
        (settings, mic)
    });

    let (tx, mut rx) = mpsc::channel(32);
    let cancel = CancellationToken::new();
    let conn = AgentConnection::connect(&config, tx, &cancel).await.unwrap();

    assert_eq!(next_event(&mut rx).await, RemoteEvent::Opened);
    assert_eq!(
        next_event(&mut rx).await,
        RemoteEvent::Transcript {
            role: Role::User,
            text: "table for two".into()
        }
    );
    assert_eq!(next_event(&mut rx).await, RemoteEvent::AssistantSpeechStart);
    assert_eq!(
        next_event(&mut rx).await,
        RemoteEvent::AudioChunk(Bytes::from_static(&[1, 0, 2, 0]))
    );
    assert_eq!(next_event(&mut rx).await, RemoteEvent::AssistantSpeechDone);

    conn.send_audio(Bytes::from_static(&[9, 9]));
    let (settings, mic) = server.await.unwrap();

    assert_eq!(settings["type"], "Settings");
    assert_eq!(settings["audio"]["input"]["encoding"], "linear16");
    assert_eq!(settings["audio"]["input"]["sample_rate"], 16_000);
    assert_eq!(settings["audio"]["output"]["sample_rate"], 24_000);
    assert_eq!(mic, vec![9, 9]);

    conn.close().await;
}

#[tokio::test]
async fn keep_alive_runs_on_its_own_timer() {
    let (listener, mut config) = listener().await;
    config.agent.keepalive_secs = 1;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let _settings = next_text(&mut ws).await;
        // No traffic from the server at all; a heartbeat must still arrive.
        next_text(&mut ws).await
    });

    let (tx, _rx) = mpsc::channel(32);
    let cancel = CancellationToken::new();
    let conn = AgentConnection::connect(&config, tx, &cancel).await.unwrap();

    let heartbeat = server.await.unwrap();
    assert_eq!(heartbeat["type"], "KeepAlive");
    conn.close().await;
}

#[tokio::test]
async fn control_messages_reach_the_server() {
    let (listener, config) = listener().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let _settings = next_text(&mut ws).await;
        loop {
            let msg = next_text(&mut ws).await;
            if msg["type"] != "KeepAlive" {
                return msg;
            }
        }
    });

    let (tx, _rx) = mpsc::channel(32);
    let cancel = CancellationToken::new();
    let conn = AgentConnection::connect(&config, tx, &cancel).await.unwrap();
    conn.send(ClientMessage::UserStartedSpeaking);

    let msg = server.await.unwrap();
    assert_eq!(msg["type"], "UserStartedSpeaking");
    conn.close().await;
}

#[tokio::test]
async fn server_close_is_reported_once() {
    let (listener, config) = listener().await;

    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let _settings = next_text(&mut ws).await;
        ws.close(None).await.unwrap();
        // Drain until the client acknowledges.
        while let Some(Ok(_)) = ws.next().await {}
    });

    let (tx, mut rx) = mpsc::channel(32);
    let cancel = CancellationToken::new();
    let conn = AgentConnection::connect(&config, tx, &cancel).await.unwrap();

    assert_eq!(next_event(&mut rx).await, RemoteEvent::Opened);
    assert!(matches!(
        next_event(&mut rx).await,
        RemoteEvent::Closed { .. }
    ));

    conn.close().await;
    assert!(!conn_is_reported_again(&mut rx).await);
}

async fn conn_is_reported_again(rx: &mut mpsc::Receiver<RemoteEvent>) -> bool {
    matches!(
        tokio::time::timeout(Duration::from_millis(200), rx.recv()).await,
        Ok(Some(RemoteEvent::Closed { .. }))
    )
}

#[tokio::test]
async fn connect_failure_is_a_connection_error() {
    // Bind then drop, so nothing listens on the port.
    let (listener, config) = listener().await;
    drop(listener);

    let (tx, _rx) = mpsc::channel(4);
    let cancel = CancellationToken::new();
    let err = AgentConnection::connect(&config, tx, &cancel)
        .await
        .err()
        .expect("connect should fail");
    assert!(err.is_retryable());
    assert_eq!(err.kind(), duplex_voice::ErrorKind::Connection);
}
