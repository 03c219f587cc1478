//! Status und Events für die Benutzeroberfläche

use crate::error::{ErrorKind, LiveError};
use crate::session::SessionState;
use serde::Serialize;

/// Sichtbarer Zustand der Live-Session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: SessionState,
    /// Assistent spielt gerade Audio ab
    pub speaking: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl SessionStatus {
    pub fn disconnected() -> Self {
        Self {
            state: SessionState::Disconnected,
            speaking: false,
            error_message: None,
            error_kind: None,
        }
    }

    pub fn connecting() -> Self {
        Self {
            state: SessionState::Connecting,
            ..Self::disconnected()
        }
    }

    pub fn connected() -> Self {
        Self {
            state: SessionState::Connected,
            ..Self::disconnected()
        }
    }

    pub fn failed(error: &LiveError) -> Self {
        Self {
            state: SessionState::Error,
            speaking: false,
            error_message: Some(error.user_message().to_string()),
            error_kind: Some(error.kind()),
        }
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::disconnected()
    }
}

/// Events die von der LiveVoiceEngine ausgelöst werden
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Status hat sich geändert
    StatusChanged(SessionStatus),
    /// Server hat seinen Turn beendet
    TurnComplete,
    /// Wiedergabe wurde durch Barge-in verworfen
    Interrupted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioError;

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(SessionStatus::connected()).unwrap();
        assert_eq!(json["state"], "connected");
        assert_eq!(json["speaking"], false);
        assert!(json.get("errorMessage").is_none());

        let failed = SessionStatus::failed(&LiveError::from(AudioError::NoInputDevice));
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["state"], "error");
        assert_eq!(
            json["errorMessage"],
            "No microphone found. Please connect an audio input device."
        );
        assert_eq!(json["errorKind"], "deviceUnavailable");
    }
}
