//! Wire protocol of the remote duplex speech service.
//!
//! Text frames carry JSON objects tagged by `"type"`; binary frames carry raw
//! PCM16LE audio in both directions. Decoding happens once, here, so the rest
//! of the pipeline only ever sees typed [`RemoteEvent`]s.

use crate::config::DuplexConfig;
use crate::pipeline::messages::{RemoteEvent, Role};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Audio encoding name for signed 16-bit little-endian PCM.
pub const LINEAR16: &str = "linear16";

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Session configuration, sent once right after connecting.
    Settings(Settings),
    /// Idle-connection heartbeat.
    KeepAlive,
    /// The local caller started talking over the assistant.
    UserStartedSpeaking,
}

/// Per-connection configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub audio: AudioSettings,
    pub agent: AgentSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioSettings {
    pub input: AudioFormat,
    pub output: AudioFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioFormat {
    pub encoding: String,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentSettings {
    pub listen: ModelSelection,
    pub think: ThinkSettings,
    pub speak: ModelSelection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSelection {
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThinkSettings {
    pub model: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub prompt: String,
}

impl Settings {
    /// Build the settings message from the session configuration.
    pub fn from_config(config: &DuplexConfig) -> Self {
        let agent = &config.agent;
        Self {
            audio: AudioSettings {
                input: AudioFormat {
                    encoding: LINEAR16.into(),
                    sample_rate: config.audio.input_sample_rate,
                },
                output: AudioFormat {
                    encoding: LINEAR16.into(),
                    sample_rate: config.playback.source_sample_rate,
                },
            },
            agent: AgentSettings {
                listen: ModelSelection {
                    model: agent.listen_model.clone(),
                },
                think: ThinkSettings {
                    model: agent.think_model.clone(),
                    prompt: agent.prompt.clone(),
                },
                speak: ModelSelection {
                    model: agent.voice.clone(),
                },
                greeting: (!agent.greeting.trim().is_empty()).then(|| agent.greeting.clone()),
            },
        }
    }
}

/// Messages received from the server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum ServerMessage {
    Welcome {
        #[serde(default)]
        request_id: Option<String>,
    },
    SettingsApplied,
    ConversationText {
        role: Role,
        #[serde(default)]
        content: String,
    },
    UserStartedSpeaking,
    AgentThinking,
    AgentStartedSpeaking,
    AgentAudioDone,
    Error {
        #[serde(default)]
        description: String,
        #[serde(default)]
        code: Option<String>,
    },
    Warning {
        #[serde(default)]
        description: String,
    },
    #[serde(other)]
    Unknown,
}

/// Decode one text frame into a pipeline event.
///
/// Informational and unknown messages yield `None`; malformed JSON is
/// logged and dropped.
pub fn decode_text(text: &str) -> Option<RemoteEvent> {
    let msg: ServerMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("ignoring malformed server message: {e}");
            return None;
        }
    };

    match msg {
        ServerMessage::ConversationText { role, content } => {
            let text = content.trim();
            (!text.is_empty()).then(|| RemoteEvent::Transcript {
                role,
                text: text.to_owned(),
            })
        }
        ServerMessage::AgentStartedSpeaking => Some(RemoteEvent::AssistantSpeechStart),
        ServerMessage::AgentAudioDone => Some(RemoteEvent::AssistantSpeechDone),
        ServerMessage::Error { description, code } => Some(RemoteEvent::Error(match code {
            Some(code) => format!("{description} ({code})"),
            None => description,
        })),
        ServerMessage::Warning { description } => {
            warn!("remote warning: {description}");
            None
        }
        ServerMessage::Welcome { request_id } => {
            debug!("remote welcome (request {request_id:?})");
            None
        }
        ServerMessage::SettingsApplied => {
            debug!("remote settings applied");
            None
        }
        ServerMessage::UserStartedSpeaking | ServerMessage::AgentThinking => None,
        ServerMessage::Unknown => {
            debug!("ignoring unknown server message");
            None
        }
    }
}
