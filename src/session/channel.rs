//! Session Channel - WebSocket-Verbindung zum Live Service
//!
//! Verwaltet genau einen Verbindungsversuch:
//! - Setup-Handshake mit Timeout
//! - Reader-Task klassifiziert eingehende Nachrichten
//! - Writer-Task überträgt aufgenommene Blöcke in Capture-Reihenfolge
//!
//! Für jeden neuen Versuch wird eine neue Instanz erzeugt.

use super::messages::*;
use crate::audio::EncodedChunk;
use crate::error::ErrorKind;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;
use uuid::Uuid;

/// Standard-Timeout für `setupComplete`
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Standard-Tiefe der ausgehenden Queue (in Blöcken)
pub const DEFAULT_OUTBOUND_QUEUE: usize = 32;

const INBOUND_QUEUE: usize = 256;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Setup handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Setup handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Malformed server message: {0}")]
    MalformedMessage(String),

    #[error("Invalid session state: {0}")]
    InvalidState(SessionState),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::ConnectionFailed(_)
            | SessionError::ConnectionLost(_)
            | SessionError::SendFailed(_) => ErrorKind::TransportError,
            SessionError::HandshakeFailed(_)
            | SessionError::HandshakeTimeout(_)
            | SessionError::MalformedMessage(_)
            | SessionError::InvalidState(_) => ErrorKind::ProtocolError,
        }
    }
}

// ============================================================================
// SESSION STATE
// ============================================================================

/// Zustand einer Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Keine Verbindung (Start- und Endzustand)
    Disconnected,
    /// Handshake läuft
    Connecting,
    /// Handshake bestätigt, Audio fließt
    Connected,
    /// Versuch gescheitert, Ressourcen sind freigegeben
    Error,
}

impl SessionState {
    /// Erlaubte Übergänge der Zustandsmaschine
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (_, Disconnected) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected) => true,
            (Connecting | Connected, Error) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Führt einen Übergang aus, falls erlaubt
fn transition(state: &RwLock<SessionState>, next: SessionState) -> bool {
    let mut current = state.write();
    if *current == next || !current.can_transition_to(next) {
        return false;
    }
    *current = next;
    true
}

// ============================================================================
// SESSION CHANNEL
// ============================================================================

pub struct SessionChannel {
    session_id: Uuid,
    url: Url,
    setup: SetupMessage,
    handshake_timeout: Duration,
    outbound_capacity: usize,
    state: Arc<RwLock<SessionState>>,
    attempted: bool,
    outbound_tx: Option<mpsc::Sender<EncodedChunk>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionChannel {
    /// Erstellt einen Channel für einen einzelnen Verbindungsversuch
    pub fn new(url: Url, setup: SetupMessage) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            session_id: Uuid::new_v4(),
            url,
            setup,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            outbound_capacity: DEFAULT_OUTBOUND_QUEUE,
            state: Arc::new(RwLock::new(SessionState::Disconnected)),
            attempted: false,
            outbound_tx: None,
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Verbindet, führt den Setup-Handshake aus und startet Reader/Writer
    ///
    /// Gibt den Receiver der klassifizierten eingehenden Events zurück.
    pub async fn connect(&mut self) -> Result<mpsc::Receiver<InboundEvent>, SessionError> {
        if self.attempted {
            return Err(SessionError::InvalidState(self.state()));
        }
        self.attempted = true;
        transition(&self.state, SessionState::Connecting);

        match self.establish().await {
            Ok(events) => Ok(events),
            Err(e) => {
                tracing::error!("Session {} failed: {}", self.session_id, e);
                transition(&self.state, SessionState::Error);
                Err(e)
            }
        }
    }

    async fn establish(&mut self) -> Result<mpsc::Receiver<InboundEvent>, SessionError> {
        tracing::info!(
            "Connecting to live service: {} (session {})",
            redact_url(&self.url),
            self.session_id
        );

        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| SessionError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        // Setup senden
        let setup = serde_json::to_string(&self.setup)
            .map_err(|e| SessionError::SendFailed(e.to_string()))?;
        write
            .send(Message::Text(setup))
            .await
            .map_err(|e| SessionError::SendFailed(e.to_string()))?;

        // Auf setupComplete warten
        let handshake = async {
            while let Some(msg_result) = read.next().await {
                let text = match msg_result {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => String::from_utf8(data).map_err(|_| {
                        SessionError::HandshakeFailed("non UTF-8 setup response".to_string())
                    })?,
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| format!("{} {}", f.code, f.reason))
                            .unwrap_or_else(|| "no reason".to_string());
                        return Err(SessionError::HandshakeFailed(format!(
                            "server closed during setup ({})",
                            reason
                        )));
                    }
                    Ok(_) => continue,
                    Err(e) => return Err(SessionError::ConnectionLost(e.to_string())),
                };

                let msg = ServerMessage::parse(&text)
                    .map_err(|e| SessionError::HandshakeFailed(e.to_string()))?;
                return if msg.is_setup_complete() {
                    Ok(())
                } else {
                    Err(SessionError::HandshakeFailed(
                        "expected setupComplete as first message".to_string(),
                    ))
                };
            }
            Err::<(), _>(SessionError::ConnectionLost(
                "stream ended during setup".to_string(),
            ))
        };

        tokio::select! {
            result = handshake => result?,
            _ = tokio::time::sleep(self.handshake_timeout) => {
                return Err(SessionError::HandshakeTimeout(self.handshake_timeout));
            }
        }

        transition(&self.state, SessionState::Connected);
        tracing::info!("Session {} connected", self.session_id);

        let (event_tx, event_rx) = mpsc::channel::<InboundEvent>(INBOUND_QUEUE);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<EncodedChunk>(self.outbound_capacity);
        self.outbound_tx = Some(outbound_tx);

        // Read-Task starten
        let state = Arc::clone(&self.state);
        let reader_events = event_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let session_id = self.session_id;

        let reader = tokio::spawn(async move {
            loop {
                let msg_result = tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    msg = read.next() => msg,
                };

                let text = match msg_result {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            fail(
                                &state,
                                &reader_events,
                                SessionError::MalformedMessage("non UTF-8 frame".to_string()),
                            )
                            .await;
                            break;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                        tracing::info!("Live service closed session {} ({:?})", session_id, reason);
                        if transition(&state, SessionState::Disconnected) {
                            let _ = reader_events.send(InboundEvent::Closed { reason }).await;
                        }
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        fail(&state, &reader_events, SessionError::ConnectionLost(e.to_string()))
                            .await;
                        break;
                    }
                    None => {
                        fail(
                            &state,
                            &reader_events,
                            SessionError::ConnectionLost("stream ended".to_string()),
                        )
                        .await;
                        break;
                    }
                };

                let events = ServerMessage::parse(&text).and_then(ServerMessage::into_events);
                match events {
                    Ok(events) => {
                        for event in events {
                            tracing::debug!("Inbound {} on session {}", event.name(), session_id);
                            if reader_events.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        fail(&state, &reader_events, e).await;
                        break;
                    }
                }
            }
        });

        // Write-Task starten
        let state = Arc::clone(&self.state);
        let writer_events = event_tx;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let writer = tokio::spawn(async move {
            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    chunk = outbound_rx.recv() => match chunk {
                        Some(chunk) => chunk,
                        None => break,
                    },
                };

                let payload = match serde_json::to_string(&RealtimeInputMessage::from_chunk(&chunk)) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::error!("Failed to serialize audio chunk: {}", e);
                        continue;
                    }
                };

                if let Err(e) = write.send(Message::Text(payload)).await {
                    fail(&state, &writer_events, SessionError::SendFailed(e.to_string())).await;
                    return;
                }
            }

            // Close-Frame senden
            if let Err(e) = write.close().await {
                tracing::debug!("WebSocket close failed: {}", e);
            }
        });

        self.tasks.push(reader);
        self.tasks.push(writer);

        Ok(event_rx)
    }

    /// Sender für aufgenommene Blöcke (nur im Zustand Connected)
    pub fn audio_sender(&self) -> Option<mpsc::Sender<EncodedChunk>> {
        self.outbound_tx.clone()
    }

    /// Reiht einen Block ein ohne zu blockieren
    pub fn try_send_audio(&self, chunk: EncodedChunk) -> Result<(), SessionError> {
        let tx = self
            .outbound_tx
            .as_ref()
            .ok_or(SessionError::InvalidState(self.state()))?;
        tx.try_send(chunk)
            .map_err(|e| SessionError::SendFailed(e.to_string()))
    }

    /// Schließt die Verbindung (idempotent)
    pub fn close(&mut self) {
        self.outbound_tx.take();
        self.shutdown_tx.send_replace(true);

        if transition(&self.state, SessionState::Disconnected) {
            tracing::info!("Session {} closed", self.session_id);
        }
    }

    /// Wartet, bis Reader und Writer beendet sind
    pub async fn join(&mut self) {
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for SessionChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SessionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionChannel")
            .field("session_id", &self.session_id)
            .field("url", &redact_url(&self.url))
            .field("state", &*self.state.read())
            .finish()
    }
}

/// Meldet einen terminalen Fehler genau einmal
async fn fail(
    state: &RwLock<SessionState>,
    events: &mpsc::Sender<InboundEvent>,
    error: SessionError,
) {
    if transition(state, SessionState::Error) {
        tracing::error!("Session error: {}", error);
        let _ = events.send(InboundEvent::Error(error)).await;
    }
}

/// URL ohne API-Key für Logs
fn redact_url(url: &Url) -> String {
    let mut redacted = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == "key" { "***".to_string() } else { v.into_owned() };
            (k.into_owned(), v)
        })
        .collect();
    if pairs.is_empty() {
        return redacted.to_string();
    }
    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    redacted.to_string()
}

// ============================================================================
// TESTS
// ============================================================================
