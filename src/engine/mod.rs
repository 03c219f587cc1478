//! Engine Module - Lifecycle der Live-Session
//!
//! Dieses Modul verwaltet:
//! - Verbindungsaufbau und Abbau
//! - Verdrahtung von Capture, Session und Playback
//! - Status-Events für die Oberfläche

mod lifecycle;
mod status;

pub use lifecycle::LiveVoiceEngine;
pub use status::{EngineEvent, SessionStatus};
