//! Live Voice Engine - Lifecycle Controller
//!
//! Besitzt Eingabegerät, Ausgabe, Scheduler und Session eines
//! Verbindungsversuchs und garantiert deren Freigabe bei `disconnect`,
//! bei Fehlern und beim Droppen der Engine.

use super::status::{EngineEvent, SessionStatus};
use crate::audio::{
    AudioBackend, AudioError, AudioOutput, CapturePipeline, CaptureStats, CpalBackend, HandleId,
    InputDevice, PlaybackEvent, PlaybackScheduler, PlaybackSnapshot,
};
use crate::config::LiveConfig;
use crate::error::{LiveError, Result};
use crate::session::{InboundEvent, SessionChannel, SessionError, SessionState};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use url::Url;
use uuid::Uuid;

type Devices = (Box<dyn InputDevice>, Arc<dyn AudioOutput>);

// ============================================================================
// SESSION RESOURCES
// ============================================================================

/// Ressourcen einer verbundenen Session
struct ActiveSession {
    attempt: u64,
    channel: SessionChannel,
    input: Box<dyn InputDevice>,
    output: Arc<dyn AudioOutput>,
    scheduler: Arc<Mutex<PlaybackScheduler>>,
    capture_stats: Arc<CaptureStats>,
    dispatch: JoinHandle<()>,
}

impl ActiveSession {
    /// Baut die Session ab: Capture stoppen, Scheduler leeren, Gerät
    /// freigeben, Channel schließen
    fn teardown(mut self, abort_dispatch: bool) {
        self.input.stop();
        let discarded = self.scheduler.lock().flush();
        self.output.close();
        self.channel.close();
        if abort_dispatch {
            self.dispatch.abort();
        }

        tracing::info!(
            "Session {} torn down ({} scheduled frame(s) discarded, {} block(s) sent, {} dropped)",
            self.channel.session_id(),
            discarded,
            self.capture_stats.blocks_sent(),
            self.capture_stats.blocks_dropped()
        );
    }
}

enum AttemptSlot {
    Idle,
    Pending {
        attempt: u64,
        cancel: watch::Sender<bool>,
    },
    Active(ActiveSession),
}

impl AttemptSlot {
    fn is_pending(&self, id: u64) -> bool {
        matches!(self, AttemptSlot::Pending { attempt, .. } if *attempt == id)
    }

    fn is_active(&self, id: u64) -> bool {
        matches!(self, AttemptSlot::Active(session) if session.attempt == id)
    }
}

// ============================================================================
// SHARED STATE
// ============================================================================

struct Inner {
    status: SessionStatus,
    slot: AttemptSlot,
    next_attempt: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    event_tx: broadcast::Sender<EngineEvent>,
}

impl Shared {
    /// Setzt den Status und meldet ihn nur bei Änderung
    fn publish(&self, inner: &mut Inner, status: SessionStatus) {
        if inner.status == status {
            return;
        }
        if inner.status.state != status.state {
            tracing::info!("Session state: {} -> {}", inner.status.state, status.state);
        }
        inner.status = status.clone();
        let _ = self.event_tx.send(EngineEvent::StatusChanged(status));
    }

    /// Reserviert den Slot für einen neuen Versuch
    fn begin_attempt(&self) -> Option<(u64, watch::Receiver<bool>)> {
        let mut inner = self.inner.lock();
        if !matches!(inner.slot, AttemptSlot::Idle) {
            return None;
        }

        inner.next_attempt += 1;
        let attempt = inner.next_attempt;
        let (cancel, cancel_rx) = watch::channel(false);
        inner.slot = AttemptSlot::Pending { attempt, cancel };
        self.publish(&mut inner, SessionStatus::connecting());
        Some((attempt, cancel_rx))
    }

    /// Versuch wurde vom Aufrufer fallen gelassen
    fn abandon_attempt(&self, attempt: u64) {
        let mut inner = self.inner.lock();
        if inner.slot.is_pending(attempt) {
            inner.slot = AttemptSlot::Idle;
            self.publish(&mut inner, SessionStatus::disconnected());
            tracing::info!("Connect attempt {} abandoned", attempt);
        }
    }

    fn fail_attempt(&self, attempt: u64, error: &LiveError) {
        let mut inner = self.inner.lock();
        if inner.slot.is_pending(attempt) {
            inner.slot = AttemptSlot::Idle;
            self.publish(&mut inner, SessionStatus::failed(error));
        }
    }

    /// Ändert den Status, solange `attempt` die aktive Session ist
    fn update_active<F>(&self, attempt: u64, update: F)
    where
        F: FnOnce(&mut SessionStatus),
    {
        let mut inner = self.inner.lock();
        if !inner.slot.is_active(attempt) {
            return;
        }
        let mut status = inner.status.clone();
        update(&mut status);
        self.publish(&mut inner, status);
    }

    /// Beendet die Session aus dem Dispatch-Loop heraus
    ///
    /// Der Status wird erst nach der Freigabe aller Ressourcen gemeldet.
    fn end_session(&self, attempt: u64, error: Option<LiveError>) {
        let mut inner = self.inner.lock();
        if !inner.slot.is_active(attempt) {
            return;
        }
        let AttemptSlot::Active(session) = std::mem::replace(&mut inner.slot, AttemptSlot::Idle)
        else {
            return;
        };
        session.teardown(false);

        let status = match &error {
            Some(e) => SessionStatus::failed(e),
            None => SessionStatus::disconnected(),
        };
        self.publish(&mut inner, status);
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Setzt den Slot zurück, falls `connect()` mittendrin gedroppt wird
struct AttemptGuard<'a> {
    shared: &'a Shared,
    attempt: u64,
    armed: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.abandon_attempt(self.attempt);
        }
    }
}

// ============================================================================
// LIVE VOICE ENGINE
// ============================================================================

/// Echtzeit-Sprachsession mit dem Live Service
pub struct LiveVoiceEngine {
    config: LiveConfig,
    backend: Arc<dyn AudioBackend>,
    shared: Arc<Shared>,
}

impl LiveVoiceEngine {
    /// Erstellt eine Engine auf den Standard-Audiogeräten
    pub fn new(config: LiveConfig) -> Self {
        Self::with_backend(config, Arc::new(CpalBackend::new()))
    }

    pub fn with_backend(config: LiveConfig, backend: Arc<dyn AudioBackend>) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            config,
            backend,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    status: SessionStatus::disconnected(),
                    slot: AttemptSlot::Idle,
                    next_attempt: 0,
                }),
                event_tx,
            }),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.event_tx.subscribe()
    }

    pub fn config(&self) -> &LiveConfig {
        &self.config
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.inner.lock().status.clone()
    }

    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().status.state
    }

    pub fn session_id(&self) -> Option<Uuid> {
        match &self.shared.inner.lock().slot {
            AttemptSlot::Active(session) => Some(session.channel.session_id()),
            _ => None,
        }
    }

    /// Zustand der Wiedergabe (nur mit aktiver Session)
    pub fn playback(&self) -> Option<PlaybackSnapshot> {
        match &self.shared.inner.lock().slot {
            AttemptSlot::Active(session) => Some(session.scheduler.lock().snapshot()),
            _ => None,
        }
    }

    pub fn capture_stats(&self) -> Option<Arc<CaptureStats>> {
        match &self.shared.inner.lock().slot {
            AttemptSlot::Active(session) => Some(Arc::clone(&session.capture_stats)),
            _ => None,
        }
    }

    /// Startet eine Session
    ///
    /// Kein-op, wenn bereits ein Versuch läuft oder eine Session aktiv ist.
    /// Geräte werden parallel zum Handshake geöffnet; Capture startet erst
    /// nach bestätigtem Handshake.
    pub async fn connect(&self) -> Result<()> {
        self.config.validate()?;
        let url = self.config.websocket_url()?;

        let Some((attempt, cancel_rx)) = self.shared.begin_attempt() else {
            tracing::debug!("connect() ignored, session already connecting or connected");
            return Ok(());
        };
        let mut guard = AttemptGuard {
            shared: &self.shared,
            attempt,
            armed: true,
        };

        let result = self.run_attempt(attempt, url, cancel_rx).await;
        guard.armed = false;

        match result {
            Ok(()) => Ok(()),
            Err(LiveError::Cancelled) => {
                tracing::info!("Connect attempt {} cancelled", attempt);
                Err(LiveError::Cancelled)
            }
            Err(e) => {
                tracing::error!("Connect attempt {} failed: {}", attempt, e);
                self.shared.fail_attempt(attempt, &e);
                Err(e)
            }
        }
    }

    async fn run_attempt(
        &self,
        attempt: u64,
        url: Url,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut channel = SessionChannel::new(url, self.config.setup_message())
            .with_handshake_timeout(self.config.handshake_timeout())
            .with_outbound_capacity(self.config.outbound_queue_blocks);

        let backend = Arc::clone(&self.backend);
        let input_rate = self.config.input_sample_rate;
        let output_rate = self.config.output_sample_rate;
        let devices = tokio::task::spawn_blocking(move || {
            open_devices(backend.as_ref(), input_rate, output_rate)
        });

        let acquired = tokio::select! {
            biased;
            _ = cancel_rx.changed() => Err(LiveError::Cancelled),
            acquired = acquire(&mut channel, devices) => acquired,
        };
        let (events, (mut input, output)) = acquired?;

        let outbound = channel
            .audio_sender()
            .ok_or(SessionError::InvalidState(channel.state()))?;
        let pipeline = CapturePipeline::new(
            self.config.block_size,
            input.sample_rate(),
            input_rate,
            outbound,
        );
        let capture_stats = pipeline.stats();
        let scheduler = Arc::new(Mutex::new(PlaybackScheduler::new(Arc::clone(&output))));
        let completions = output
            .take_completions()
            .unwrap_or_else(|| mpsc::unbounded_channel().1);

        let mut inner = self.shared.inner.lock();
        if !inner.slot.is_pending(attempt) {
            // disconnect() kam dem Handshake zuvor
            drop(inner);
            input.stop();
            output.close();
            return Err(LiveError::Cancelled);
        }

        if let Err(e) = input.start(pipeline.into_sink()) {
            drop(inner);
            input.stop();
            output.close();
            return Err(e.into());
        }

        let dispatch = tokio::spawn(dispatch_loop(
            Arc::clone(&self.shared),
            attempt,
            events,
            completions,
            Arc::clone(&scheduler),
        ));

        tracing::info!(
            "Session {} live (capture {} Hz, playback {} Hz)",
            channel.session_id(),
            input.sample_rate(),
            output.sample_rate()
        );

        inner.slot = AttemptSlot::Active(ActiveSession {
            attempt,
            channel,
            input,
            output,
            scheduler,
            capture_stats,
            dispatch,
        });
        self.shared.publish(&mut inner, SessionStatus::connected());
        Ok(())
    }

    /// Beendet die Session bzw. bricht einen laufenden Versuch ab
    ///
    /// Idempotent und jederzeit aufrufbar.
    pub fn disconnect(&self) {
        let previous = {
            let mut inner = self.shared.inner.lock();
            let previous = std::mem::replace(&mut inner.slot, AttemptSlot::Idle);
            self.shared.publish(&mut inner, SessionStatus::disconnected());
            previous
        };

        match previous {
            AttemptSlot::Idle => {}
            AttemptSlot::Pending { attempt, cancel } => {
                let _ = cancel.send(true);
                tracing::info!("Cancelling connect attempt {}", attempt);
            }
            AttemptSlot::Active(session) => session.teardown(true),
        }
    }
}

impl Drop for LiveVoiceEngine {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for LiveVoiceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveVoiceEngine")
            .field("config", &self.config)
            .field("status", &self.status())
            .finish()
    }
}

fn open_devices(
    backend: &dyn AudioBackend,
    input_rate: u32,
    output_rate: u32,
) -> std::result::Result<Devices, AudioError> {
    let input = backend.open_input(input_rate)?;
    let output = backend.open_output(output_rate)?;
    Ok((input, output))
}

/// Wartet auf Handshake und Geräte
///
/// Ein Gerätefehler beendet den Versuch sofort, ohne auf den Handshake zu
/// warten. Schlagen beide fehl, hat der Gerätefehler Vorrang.
async fn acquire(
    channel: &mut SessionChannel,
    devices: JoinHandle<std::result::Result<Devices, AudioError>>,
) -> Result<(mpsc::Receiver<InboundEvent>, Devices)> {
    let devices = async move {
        devices
            .await
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))
            .and_then(|opened| opened)
    };
    tokio::pin!(devices);
    let handshake = channel.connect();
    tokio::pin!(handshake);

    tokio::select! {
        opened = &mut devices => {
            let opened = opened?;
            let events = handshake.await?;
            Ok((events, opened))
        }
        connected = &mut handshake => {
            let opened = devices.await?;
            Ok((connected?, opened))
        }
    }
}

// ============================================================================
// DISPATCH
// ============================================================================

/// Verarbeitet eingehende Events und Playback-Completions einer Session
async fn dispatch_loop(
    shared: Arc<Shared>,
    attempt: u64,
    mut events: mpsc::Receiver<InboundEvent>,
    mut completions: mpsc::UnboundedReceiver<HandleId>,
    scheduler: Arc<Mutex<PlaybackScheduler>>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                match event {
                    InboundEvent::Audio(chunk) => match chunk.decode() {
                        Ok(frame) => {
                            let handle = scheduler.lock().enqueue(&frame);
                            tracing::debug!(
                                "Received {:?} of audio, scheduled as {}",
                                frame.duration(),
                                handle.id
                            );
                            shared.update_active(attempt, |status| status.speaking = true);
                        }
                        Err(e) => {
                            tracing::error!("Failed to decode inbound audio: {}", e);
                            shared.end_session(attempt, Some(e.into()));
                            break;
                        }
                    },
                    InboundEvent::TurnComplete => {
                        tracing::debug!("Turn complete");
                        shared.emit(EngineEvent::TurnComplete);
                    }
                    InboundEvent::Interrupted => {
                        let discarded = scheduler.lock().flush();
                        tracing::info!("Interrupted, discarded {} scheduled frame(s)", discarded);
                        shared.update_active(attempt, |status| status.speaking = false);
                        shared.emit(EngineEvent::Interrupted);
                    }
                    InboundEvent::Closed { reason } => {
                        tracing::info!("Session closed by server ({:?})", reason);
                        shared.end_session(attempt, None);
                        break;
                    }
                    InboundEvent::Error(e) => {
                        shared.end_session(attempt, Some(e.into()));
                        break;
                    }
                }
            }
            Some(id) = completions.recv() => {
                let completed = scheduler.lock().complete(id);
                if let PlaybackEvent::Idle(_) = completed {
                    tracing::debug!("Playback idle");
                    shared.update_active(attempt, |status| status.speaking = false);
                }
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
