//! Konfiguration der Live-Voice Engine
//!
//! Reihenfolge: eingebaute Defaults → optionale TOML-Datei im
//! Konfigurationsverzeichnis (`live-voice.toml`) → Umgebungsvariablen.

use crate::audio::{DEFAULT_BLOCK_SIZE, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use crate::session::{SetupMessage, DEFAULT_OUTBOUND_QUEUE};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Kore";
pub const DEFAULT_SYSTEM_INSTRUCTION: &str =
    "You are a friendly and helpful tutor named Scholar. Keep responses concise and conversational.";

const CONFIG_FILE: &str = "live-voice.toml";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("API key is missing (set GEMINI_API_KEY)")]
    MissingApiKey,

    #[error("Invalid endpoint URL: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Failed to read config file: {0}")]
    Io(String),

    #[error("Failed to parse config file: {0}")]
    Parse(String),
}

// ============================================================================
// LIVE CONFIG
// ============================================================================

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// WebSocket Endpoint des Live Service
    pub endpoint: String,
    /// Wird als `key` Query-Parameter angehängt
    pub api_key: Option<String>,
    pub model: String,
    pub voice: String,
    pub system_instruction: Option<String>,
    pub handshake_timeout_ms: u64,
    /// Samples pro Capture-Block
    pub block_size: usize,
    /// Rate des gesendeten Audios, wird auch vom Mikrofon angefordert
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    /// Tiefe der ausgehenden Queue in Blöcken
    pub outbound_queue_blocks: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            system_instruction: Some(DEFAULT_SYSTEM_INSTRUCTION.to_string()),
            handshake_timeout_ms: 10_000,
            block_size: DEFAULT_BLOCK_SIZE,
            input_sample_rate: INPUT_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            outbound_queue_blocks: DEFAULT_OUTBOUND_QUEUE,
        }
    }
}

impl LiveConfig {
    /// Lädt Defaults, Konfigurationsdatei und Umgebungsvariablen
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading config from {}", path.display());
                Self::from_file(&path)?
            }
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Pfad zur Konfigurationsdatei im Plattform-Verzeichnis
    pub fn config_path() -> Option<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("com", "live-voice", "live-voice")?;
        Some(proj_dirs.config_dir().join(CONFIG_FILE))
    }

    /// Überschreibt Felder aus einer Variablen-Quelle (z.B. `std::env::var`)
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("GEMINI_API_KEY").or_else(|| non_empty("API_KEY")) {
            self.api_key = Some(key);
        }
        if let Some(endpoint) = non_empty("LIVE_VOICE_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Some(model) = non_empty("LIVE_VOICE_MODEL") {
            self.model = model;
        }
        if let Some(voice) = non_empty("LIVE_VOICE_VOICE") {
            self.voice = voice;
        }
    }

    /// Prüft alle Werte, bevor Ressourcen belegt werden
    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.api_key {
            Some(key) if !key.trim().is_empty() => {}
            _ => return Err(ConfigError::MissingApiKey),
        }
        self.websocket_url()?;

        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "model",
                reason: "must not be empty".to_string(),
            });
        }
        if self.block_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "block_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.input_sample_rate == 0 || self.output_sample_rate == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sample_rate",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.outbound_queue_blocks == 0 {
            return Err(ConfigError::InvalidValue {
                field: "outbound_queue_blocks",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Endpoint inklusive API-Key
    pub fn websocket_url(&self) -> Result<Url, ConfigError> {
        let mut url =
            Url::parse(&self.endpoint).map_err(|e| ConfigError::InvalidEndpoint(e.to_string()))?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidEndpoint(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }

        if let Some(key) = &self.api_key {
            url.query_pairs_mut().append_pair("key", key);
        }
        Ok(url)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn setup_message(&self) -> SetupMessage {
        SetupMessage::new(&self.model, &self.voice, self.system_instruction.as_deref())
    }
}

impl std::fmt::Debug for LiveConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("handshake_timeout_ms", &self.handshake_timeout_ms)
            .field("block_size", &self.block_size)
            .field("input_sample_rate", &self.input_sample_rate)
            .field("output_sample_rate", &self.output_sample_rate)
            .field("outbound_queue_blocks", &self.outbound_queue_blocks)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn with_key() -> LiveConfig {
        LiveConfig {
            api_key: Some("secret".to_string()),
            ..LiveConfig::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = LiveConfig::default();
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.voice, "Kore");
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.input_sample_rate, 16000);
        assert_eq!(config.output_sample_rate, 24000);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_missing_key_fails_validation() {
        assert_eq!(
            LiveConfig::default().validate(),
            Err(ConfigError::MissingApiKey)
        );
        let blank = LiveConfig {
            api_key: Some("  ".to_string()),
            ..LiveConfig::default()
        };
        assert_eq!(blank.validate(), Err(ConfigError::MissingApiKey));
        assert!(with_key().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = LiveConfig::from_toml(
            r#"
            voice = "Puck"
            block_size = 2048
            "#,
        )
        .unwrap();
        assert_eq!(config.voice, "Puck");
        assert_eq!(config.block_size, 2048);
        assert_eq!(config.model, DEFAULT_MODEL);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            LiveConfig::from_toml("block_size = \"big\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("API_KEY", "fallback"),
            ("LIVE_VOICE_MODEL", "other-model"),
            ("LIVE_VOICE_VOICE", ""),
        ]
        .into_iter()
        .collect();

        let mut config = LiveConfig::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.api_key.as_deref(), Some("fallback"));
        assert_eq!(config.model, "other-model");
        assert_eq!(config.voice, "Kore");

        config.apply_overrides(|k| (k == "GEMINI_API_KEY").then(|| "primary".to_string()));
        assert_eq!(config.api_key.as_deref(), Some("primary"));
    }

    #[test]
    fn test_websocket_url_carries_key() {
        let url = with_key().websocket_url().unwrap();
        assert_eq!(url.scheme(), "wss");
        assert!(url
            .query_pairs()
            .any(|(k, v)| k == "key" && v == "secret"));
    }

    #[test]
    fn test_rejects_http_endpoint() {
        let config = LiveConfig {
            endpoint: "https://example.com".to_string(),
            ..with_key()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_debug_redacts_key() {
        let debug = format!("{:?}", with_key());
        assert!(!debug.contains("secret"));
    }

    #[test]
    fn test_setup_message_from_config() {
        let json = serde_json::to_value(with_key().setup_message()).unwrap();
        assert_eq!(json["setup"]["model"], format!("models/{}", DEFAULT_MODEL));
        assert_eq!(
            json["setup"]["systemInstruction"]["parts"][0]["text"],
            DEFAULT_SYSTEM_INSTRUCTION
        );
    }
}
