//! Live Voice - Echtzeit-Sprachsession mit einem Live Service
//!
//! Duplex-Audio-Pipeline mit:
//! - Mikrofon-Capture als PCM16 @ 16kHz über WebSocket
//! - Gapless Playback der Antworten @ 24kHz
//! - Sofortiger Unterbrechung (Barge-in)
//! - Lifecycle mit garantierter Freigabe aller Geräte
//!
//! ```no_run
//! use live_voice::{LiveConfig, LiveVoiceEngine};
//!
//! # async fn run() -> live_voice::Result<()> {
//! live_voice::init_tracing();
//! let engine = LiveVoiceEngine::new(LiveConfig::load()?);
//! let mut events = engine.subscribe();
//! engine.connect().await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! engine.disconnect();
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod session;

pub use audio::{list_devices, AudioDeviceInfo, AudioError, PcmError};
pub use config::{ConfigError, LiveConfig};
pub use engine::{EngineEvent, LiveVoiceEngine, SessionStatus};
pub use error::{ErrorKind, LiveError, Result};
pub use session::{SessionError, SessionState};

/// Initialisiert das Logging für die einbettende Anwendung
///
/// `RUST_LOG` hat Vorrang vor den Standard-Direktiven. Mehrfache Aufrufe
/// sind harmlos.
pub fn init_tracing() {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in ["live_voice=debug", "tungstenite=warn", "tokio_tungstenite=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
