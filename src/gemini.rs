//! Gemini Live API wire types
//!
//! Client messages serialize to the externally tagged shapes the
//! BidiGenerateContent endpoint expects (`{"setup": {...}}`,
//! `{"realtimeInput": {...}}`). Server messages are decoded into
//! [`ServerEvent`]s carrying only audio and interruption signals.

use base64::engine::general_purpose;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::pcm::INPUT_MIME_TYPE;
use crate::transport::{ServerEvent, SessionConfig, TransportError};

/// Default native-audio model.
pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";

/// Endpoint for the bidirectional streaming API.
pub const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Content {
    pub parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
    pub language_code: String,
}

/// Generation configuration for setup.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

/// Session setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

impl BidiGenerateContentSetup {
    /// Audio-only setup bound to one stage's behavior script.
    pub fn for_session(model: &str, config: &SessionConfig) -> Self {
        Self {
            model: model.to_string(),
            generation_config: Some(GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice.clone(),
                        },
                    },
                    language_code: config.language.clone(),
                }),
            }),
            system_instruction: Some(Content {
                parts: vec![Part {
                    text: Some(config.behavior_script.clone()),
                }],
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub data: String,
    pub mime_type: String,
}

/// A chunk of realtime input
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
}

/// Message sent from client to server.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(BidiGenerateContentSetup),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    /// Realtime input carrying one microphone frame.
    pub fn audio(pcm: &[u8]) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            audio: Some(Blob {
                data: general_purpose::STANDARD.encode(pcm),
                mime_type: INPUT_MIME_TYPE.to_string(),
            }),
        })
    }

    pub fn to_json(&self) -> Result<String, TransportError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: Option<String>,
    pub data: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerPart {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<ServerPart>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub interrupted: Option<bool>,
    #[serde(default)]
    pub turn_complete: Option<bool>,
}

/// Server -> client messages. Exactly one field is set per message.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub tool_call: Option<serde_json::Value>,
    #[serde(default)]
    pub go_away: Option<serde_json::Value>,
    #[serde(default)]
    pub session_resumption_update: Option<serde_json::Value>,
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, TransportError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Reduce a server message to the event the conversation core consumes.
    ///
    /// Returns `Ok(None)` for messages that carry neither audio nor an
    /// interruption (tool calls, transcripts, resumption updates).
    pub fn into_event(self) -> Result<Option<ServerEvent>, TransportError> {
        if self.go_away.is_some() {
            warn!("Server announced it will disconnect soon");
        }
        let Some(content) = self.server_content else {
            return Ok(None);
        };

        let interrupted = content.interrupted.unwrap_or(false);
        let mut audio = None;
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(inline) = part.inline_data {
                    let bytes = general_purpose::STANDARD
                        .decode(inline.data.as_bytes())
                        .map_err(|e| TransportError::Decode(format!("base64: {}", e)))?;
                    audio = Some(bytes);
                    break;
                } else if let Some(text) = part.text {
                    debug!("Ignoring text part: {}", text.chars().take(80).collect::<String>());
                }
            }
        }

        if audio.is_none() && !interrupted {
            if content.turn_complete.unwrap_or(false) {
                debug!("Model turn complete");
            }
            return Ok(None);
        }
        Ok(Some(ServerEvent { audio, interrupted }))
    }
}
