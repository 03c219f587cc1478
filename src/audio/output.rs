//! Audio Output - Ziel für geplante Wiedergabe
//!
//! Ein `AudioOutput` besitzt eine monotone Ausgabe-Uhr (gerenderte Frames)
//! und spielt Quellen ab einem festen Start-Frame ab. Die eigentliche
//! Mischung erledigt der `Mixer`, der sowohl vom cpal-Ausgang als auch vom
//! `OfflineOutput` verwendet wird.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

// ============================================================================
// HANDLE ID
// ============================================================================

/// Identität einer geplanten Quelle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub(crate) u64);

impl HandleId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ============================================================================
// OUTPUT TRAIT
// ============================================================================

/// Ausgabeziel mit eigener Uhr
///
/// Fertig abgespielte Quellen werden über den Receiver aus
/// `take_completions` gemeldet. Gestoppte Quellen werden nie gemeldet.
pub trait AudioOutput: Send + Sync {
    /// Sample Rate der Ausgabe-Uhr
    fn sample_rate(&self) -> u32;

    /// Anzahl bereits gerenderter Frames ("jetzt")
    fn current_frame(&self) -> u64;

    /// Plant eine Mono-Quelle ab `start_frame`
    fn start_source(&self, id: HandleId, samples: Arc<[f32]>, start_frame: u64);

    /// Entfernt eine Quelle sofort
    fn stop_source(&self, id: HandleId);

    /// Gibt den Completion-Receiver genau einmal heraus
    fn take_completions(&self) -> Option<mpsc::UnboundedReceiver<HandleId>>;

    /// Gibt das Gerät frei, weitere Aufrufe sind No-ops
    fn close(&self);
}

// ============================================================================
// MIXER
// ============================================================================

#[derive(Debug)]
struct ScheduledSource {
    id: HandleId,
    start: u64,
    samples: Arc<[f32]>,
}

impl ScheduledSource {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

/// Software-Mixer mit Frame-genauer Uhr
pub struct Mixer {
    sample_rate: u32,
    position: u64,
    sources: Vec<ScheduledSource>,
    completed_tx: mpsc::UnboundedSender<HandleId>,
}

impl Mixer {
    pub fn new(sample_rate: u32) -> (Self, mpsc::UnboundedReceiver<HandleId>) {
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        let mixer = Self {
            sample_rate,
            position: 0,
            sources: Vec::new(),
            completed_tx,
        };
        (mixer, completed_rx)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn add(&mut self, id: HandleId, samples: Arc<[f32]>, start: u64) {
        self.sources.push(ScheduledSource { id, start, samples });
    }

    /// Entfernt eine Quelle ohne Completion-Meldung
    pub fn remove(&mut self, id: HandleId) -> bool {
        let before = self.sources.len();
        self.sources.retain(|s| s.id != id);
        self.sources.len() != before
    }

    pub fn clear(&mut self) {
        self.sources.clear();
    }

    /// Rendert `out.len()` Mono-Frames ab der aktuellen Position
    pub fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);

        let begin = self.position;
        let end = begin + out.len() as u64;

        for source in &self.sources {
            let from = source.start.max(begin);
            let to = source.end().min(end);
            if from >= to {
                continue;
            }
            let src = &source.samples[(from - source.start) as usize..(to - source.start) as usize];
            let dst = &mut out[(from - begin) as usize..(to - begin) as usize];
            for (d, s) in dst.iter_mut().zip(src) {
                *d += *s;
            }
        }

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        self.position = end;

        let completed_tx = &self.completed_tx;
        self.sources.retain(|source| {
            let finished = source.end() <= end;
            if finished {
                let _ = completed_tx.send(source.id);
            }
            !finished
        });
    }
}

impl fmt::Debug for Mixer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mixer")
            .field("sample_rate", &self.sample_rate)
            .field("position", &self.position)
            .field("sources", &self.sources.len())
            .finish()
    }
}

// ============================================================================
// OFFLINE OUTPUT
// ============================================================================

/// Manuell getakteter Ausgang (Headless-Rendering, Tests)
///
/// Die Uhr bewegt sich nur durch `render` bzw. `advance`.
pub struct OfflineOutput {
    mixer: Mutex<Mixer>,
    completions: Mutex<Option<mpsc::UnboundedReceiver<HandleId>>>,
}

impl OfflineOutput {
    pub fn new(sample_rate: u32) -> Self {
        let (mixer, completions) = Mixer::new(sample_rate);
        Self {
            mixer: Mutex::new(mixer),
            completions: Mutex::new(Some(completions)),
        }
    }

    /// Rendert die nächsten `frames` Frames und gibt sie zurück
    pub fn render(&self, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames];
        self.mixer.lock().render(&mut out);
        out
    }

    /// Bewegt die Uhr vorwärts und verwirft das Ergebnis
    pub fn advance(&self, frames: usize) {
        let _ = self.render(frames);
    }

    /// Anzahl der Quellen, die der Mixer noch hält
    pub fn pending_sources(&self) -> usize {
        self.mixer.lock().source_count()
    }
}

impl AudioOutput for OfflineOutput {
    fn sample_rate(&self) -> u32 {
        self.mixer.lock().sample_rate()
    }

    fn current_frame(&self) -> u64 {
        self.mixer.lock().position()
    }

    fn start_source(&self, id: HandleId, samples: Arc<[f32]>, start_frame: u64) {
        self.mixer.lock().add(id, samples, start_frame);
    }

    fn stop_source(&self, id: HandleId) {
        self.mixer.lock().remove(id);
    }

    fn take_completions(&self) -> Option<mpsc::UnboundedReceiver<HandleId>> {
        self.completions.lock().take()
    }

    fn close(&self) {
        self.mixer.lock().clear();
    }
}

impl fmt::Debug for OfflineOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineOutput")
            .field("mixer", &*self.mixer.lock())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
