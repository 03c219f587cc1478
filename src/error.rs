//! Fehlertypen der Live-Voice Engine

use crate::audio::{AudioError, PcmError};
use crate::config::ConfigError;
use crate::session::SessionError;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// ERROR KIND
// ============================================================================

/// Klassifizierung für Aufrufer und Status-Anzeige
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    DeviceUnavailable,
    PermissionDenied,
    TransportError,
    ProtocolError,
    FormatError,
    ConfigError,
    Cancelled,
}

// ============================================================================
// LIVE ERROR
// ============================================================================

/// Haupt-Fehlertyp der Crate
#[derive(Error, Debug, Clone)]
pub enum LiveError {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Format error: {0}")]
    Format(#[from] PcmError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connect attempt cancelled")]
    Cancelled,
}

impl LiveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LiveError::Audio(AudioError::PermissionDenied(_)) => ErrorKind::PermissionDenied,
            LiveError::Audio(_) => ErrorKind::DeviceUnavailable,
            LiveError::Session(e) => e.kind(),
            LiveError::Format(_) => ErrorKind::FormatError,
            LiveError::Config(_) => ErrorKind::ConfigError,
            LiveError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Text für die Benutzeroberfläche, ohne interne Details
    pub fn user_message(&self) -> &'static str {
        match self {
            LiveError::Audio(AudioError::PermissionDenied(_)) => {
                "Microphone permission denied. Please allow access in your system settings."
            }
            LiveError::Audio(AudioError::NoOutputDevice) => {
                "No speaker found. Please connect an audio output device."
            }
            LiveError::Audio(AudioError::NoInputDevice) => {
                "No microphone found. Please connect an audio input device."
            }
            LiveError::Audio(AudioError::DeviceUnavailable(_)) => {
                "The audio device is not available. Please check your audio devices."
            }
            LiveError::Audio(_) => "The audio device could not be started.",
            LiveError::Session(e) if e.kind() == ErrorKind::TransportError => {
                "Connection to the live service failed."
            }
            LiveError::Session(_) | LiveError::Format(_) => {
                "The live service sent an unexpected response."
            }
            LiveError::Config(ConfigError::MissingApiKey) => "The API key is missing.",
            LiveError::Config(_) => "The live voice configuration is invalid.",
            LiveError::Cancelled => "The connection attempt was cancelled.",
        }
    }
}

/// Result-Alias der Crate
pub type Result<T> = std::result::Result<T, LiveError>;

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(
            LiveError::from(AudioError::NoInputDevice).kind(),
            ErrorKind::DeviceUnavailable
        );
        assert_eq!(
            LiveError::from(AudioError::PermissionDenied("x".into())).kind(),
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            LiveError::from(SessionError::ConnectionFailed("x".into())).kind(),
            ErrorKind::TransportError
        );
        assert_eq!(
            LiveError::from(SessionError::MalformedMessage("x".into())).kind(),
            ErrorKind::ProtocolError
        );
        assert_eq!(
            LiveError::from(PcmError::ZeroChannels).kind(),
            ErrorKind::FormatError
        );
        assert_eq!(LiveError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_user_messages_distinguish_causes() {
        let no_mic = LiveError::from(AudioError::NoInputDevice).user_message();
        let denied = LiveError::from(AudioError::PermissionDenied("os".into())).user_message();
        let failed = LiveError::from(SessionError::ConnectionLost("reset".into())).user_message();

        assert!(no_mic.starts_with("No microphone found"));
        assert!(denied.starts_with("Microphone permission denied"));
        assert_eq!(failed, "Connection to the live service failed.");
        assert_ne!(no_mic, denied);
    }

    #[test]
    fn test_stream_failures_are_not_reported_as_missing_microphone() {
        for err in [
            AudioError::StreamBuildError("alsa: device busy".into()),
            AudioError::UnsupportedConfig("sample format".into()),
            AudioError::StreamPlayError("backend".into()),
        ] {
            let err = LiveError::from(err);
            assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);
            assert_eq!(err.user_message(), "The audio device could not be started.");
        }
        assert_eq!(
            LiveError::from(AudioError::NoOutputDevice).user_message(),
            "No speaker found. Please connect an audio output device."
        );
        assert!(!LiveError::from(AudioError::DeviceUnavailable("gone".into()))
            .user_message()
            .contains("microphone"));
    }

    #[test]
    fn test_user_message_hides_internals() {
        let err = LiveError::from(SessionError::ConnectionFailed(
            "tls handshake eof at 10.0.0.1".into(),
        ));
        assert!(!err.user_message().contains("10.0.0.1"));
        assert!(err.to_string().contains("10.0.0.1"));
    }

    #[test]
    fn test_missing_key_message() {
        assert_eq!(
            LiveError::from(ConfigError::MissingApiKey).user_message(),
            "The API key is missing."
        );
    }
}
