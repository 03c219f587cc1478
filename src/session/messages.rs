//! Message Types für das Live-Protokoll
//!
//! Diese Strukturen bilden das bidirektionale JSON-Protokoll des Live
//! Services ab und übersetzen eingehende Nachrichten in abstrakte
//! `InboundEvent`s (Audio, Turn-Complete, Interrupted, Closed, Error).

use super::channel::SessionError;
use crate::audio::{EncodedChunk, EncodingDescriptor};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Erste Nachricht jeder Session
#[derive(Debug, Clone, Serialize)]
pub struct SetupMessage {
    pub setup: Setup,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

impl SetupMessage {
    pub fn new(model: &str, voice_name: &str, system_instruction: Option<&str>) -> Self {
        let model = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{}", model)
        };

        Self {
            setup: Setup {
                model,
                generation_config: GenerationConfig {
                    response_modalities: vec!["AUDIO".to_string()],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: voice_name.to_string(),
                            },
                        },
                    },
                },
                system_instruction: system_instruction.map(Content::text),
            },
        }
    }
}

/// Aufgenommenes Audio
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

impl RealtimeInputMessage {
    pub fn from_chunk(chunk: &EncodedChunk) -> Self {
        Self {
            realtime_input: RealtimeInput {
                media_chunks: vec![Blob {
                    mime_type: chunk.descriptor.mime_type(),
                    data: BASE64.encode(&chunk.data),
                }],
            },
        }
    }
}

// ============================================================================
// SHARED TYPES
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn text(text: &str) -> Self {
        Self {
            parts: vec![Part {
                text: Some(text.to_string()),
                inline_data: None,
            }],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

/// Base64-kodierte Binärdaten mit MIME-Type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Alle Felder sind optional, unbekannte Felder werden ignoriert
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

/// Server kündigt das baldige Ende der Verbindung an
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, SessionError> {
        serde_json::from_str(text).map_err(|e| SessionError::MalformedMessage(e.to_string()))
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Zerlegt die Nachricht in Events (Audio zuerst, dann Kontroll-Events)
    pub fn into_events(self) -> Result<Vec<InboundEvent>, SessionError> {
        let mut events = Vec::new();

        if let Some(go_away) = &self.go_away {
            tracing::warn!("Server announced disconnect (time left: {:?})", go_away.time_left);
        }

        let Some(content) = self.server_content else {
            return Ok(events);
        };

        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                let Some(blob) = part.inline_data else {
                    continue;
                };
                let Some(descriptor) = EncodingDescriptor::from_mime_type(&blob.mime_type) else {
                    tracing::debug!("Ignoring non-PCM inline data ({})", blob.mime_type);
                    continue;
                };
                let data = BASE64
                    .decode(blob.data.as_bytes())
                    .map_err(|e| SessionError::MalformedMessage(format!("audio payload: {}", e)))?;
                events.push(InboundEvent::Audio(EncodedChunk::new(data, descriptor)));
            }
        }

        if content.interrupted {
            events.push(InboundEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(InboundEvent::TurnComplete);
        }

        Ok(events)
    }
}

// ============================================================================
// INBOUND EVENTS
// ============================================================================

/// Klassifizierte eingehende Nachricht
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Synthetisiertes Audio (pcm16-rate24000-mono)
    Audio(EncodedChunk),
    /// Server hat seinen Turn beendet
    TurnComplete,
    /// Barge-in: noch nicht gespieltes Audio verwerfen
    Interrupted,
    /// Verbindung regulär geschlossen
    Closed { reason: Option<String> },
    /// Transport- oder Protokollfehler
    Error(SessionError),
}

impl InboundEvent {
    /// Name wie im externen Event-Format (`turnComplete`, `interrupted`, ...)
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::Audio(_) => "audio",
            InboundEvent::TurnComplete => "turnComplete",
            InboundEvent::Interrupted => "interrupted",
            InboundEvent::Closed { .. } => "closed",
            InboundEvent::Error(_) => "error",
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::encode;

    #[test]
    fn test_setup_message_shape() {
        let msg = SetupMessage::new("gemini-live", "Kore", Some("Be brief."));
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["setup"]["model"], "models/gemini-live");
        assert_eq!(
            json["setup"]["generationConfig"]["responseModalities"][0],
            "AUDIO"
        );
        assert_eq!(
            json["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]
                ["prebuiltVoiceConfig"]["voiceName"],
            "Kore"
        );
        assert_eq!(
            json["setup"]["systemInstruction"]["parts"][0]["text"],
            "Be brief."
        );
    }

    #[test]
    fn test_setup_without_instruction() {
        let msg = SetupMessage::new("models/x", "Puck", None);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["setup"]["model"], "models/x");
        assert!(json["setup"].get("systemInstruction").is_none());
    }

    #[test]
    fn test_realtime_input_from_chunk() {
        let chunk = encode(&[0.5, -0.5]);
        let msg = RealtimeInputMessage::from_chunk(&chunk);
        let json = serde_json::to_value(&msg).unwrap();
        let blob = &json["realtimeInput"]["mediaChunks"][0];

        assert_eq!(blob["mimeType"], "audio/pcm;rate=16000");
        let data = BASE64.decode(blob["data"].as_str().unwrap()).unwrap();
        assert_eq!(data, chunk.data);
    }

    #[test]
    fn test_setup_complete_detection() {
        let msg = ServerMessage::parse(r#"{"setupComplete":{}}"#).unwrap();
        assert!(msg.is_setup_complete());
        assert!(msg.into_events().unwrap().is_empty());

        let msg = ServerMessage::parse(r#"{"serverContent":{"turnComplete":true}}"#).unwrap();
        assert!(!msg.is_setup_complete());
    }

    #[test]
    fn test_audio_parts_are_classified_in_order() {
        let first = BASE64.encode([0x00, 0x40]);
        let second = BASE64.encode([0x00, 0xC0]);
        let text = format!(
            r#"{{"serverContent":{{"modelTurn":{{"parts":[
                {{"inlineData":{{"mimeType":"audio/pcm;rate=24000","data":"{}"}}}},
                {{"text":"hello"}},
                {{"inlineData":{{"mimeType":"audio/pcm;rate=24000","data":"{}"}}}}
            ]}},"turnComplete":true}}}}"#,
            first, second
        );

        let events = ServerMessage::parse(&text).unwrap().into_events().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0],
            InboundEvent::Audio(EncodedChunk::new(vec![0x00, 0x40], EncodingDescriptor::OUTPUT))
        );
        assert_eq!(
            events[1],
            InboundEvent::Audio(EncodedChunk::new(vec![0x00, 0xC0], EncodingDescriptor::OUTPUT))
        );
        assert_eq!(events[2], InboundEvent::TurnComplete);
    }

    #[test]
    fn test_interrupted_event() {
        let msg = ServerMessage::parse(r#"{"serverContent":{"interrupted":true}}"#).unwrap();
        let events = msg.into_events().unwrap();
        assert_eq!(events, vec![InboundEvent::Interrupted]);
        assert_eq!(events[0].name(), "interrupted");
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let msg = ServerMessage::parse(r#"{"usageMetadata":{"totalTokenCount":5}}"#).unwrap();
        assert!(msg.into_events().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(
            ServerMessage::parse("not json"),
            Err(SessionError::MalformedMessage(_))
        ));

        let msg = ServerMessage::parse(
            r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm","data":"%%%"}}]}}}"#,
        )
        .unwrap();
        assert!(matches!(
            msg.into_events(),
            Err(SessionError::MalformedMessage(_))
        ));
    }
}
