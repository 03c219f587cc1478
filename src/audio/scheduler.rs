//! Playback Scheduler
//!
//! Plant empfangene Frames lückenlos hintereinander auf einem `AudioOutput`.
//! Der Scheduler ist der einzige Schreiber seiner aktiven Handle-Menge;
//! Completion-Events der Ausgabe laufen über `complete`.

use super::output::{AudioOutput, HandleId};
use super::pcm::AudioFrame;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// TYPES
// ============================================================================

/// Ein geplanter, noch nicht beendeter Frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackHandle {
    pub id: HandleId,
    /// Start in Ausgabe-Frames
    pub start_frame: u64,
    /// Länge in Ausgabe-Frames
    pub len_frames: u64,
    sample_rate: u32,
}

impl PlaybackHandle {
    pub fn end_frame(&self) -> u64 {
        self.start_frame + self.len_frames
    }

    pub fn start(&self) -> Duration {
        frames_to_duration(self.start_frame, self.sample_rate)
    }

    pub fn duration(&self) -> Duration {
        frames_to_duration(self.len_frames, self.sample_rate)
    }
}

/// Ergebnis einer Completion-Meldung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// Handle war nicht (mehr) aktiv, z.B. nach `flush`
    Ignored,
    /// Handle beendet, weitere Frames laufen noch
    Finished(HandleId),
    /// Letztes aktives Handle beendet
    Idle(HandleId),
}

/// Momentaufnahme für Diagnose und Backpressure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackSnapshot {
    pub active: usize,
    pub output_time: Duration,
    pub schedule_clock: Duration,
    pub buffered: Duration,
}

// ============================================================================
// SCHEDULER
// ============================================================================

pub struct PlaybackScheduler {
    output: Arc<dyn AudioOutput>,
    /// ScheduleClock: nächster freier Start-Frame
    next_start: u64,
    active: BTreeMap<HandleId, PlaybackHandle>,
    next_id: u64,
}

impl PlaybackScheduler {
    /// Erstellt einen Scheduler, die Uhr startet bei "jetzt"
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        let next_start = output.current_frame();
        Self {
            output,
            next_start,
            active: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.output.sample_rate()
    }

    /// Plant einen Frame direkt hinter den vorherigen
    pub fn enqueue(&mut self, frame: &AudioFrame) -> PlaybackHandle {
        let rate = self.output.sample_rate();
        let frame = if frame.sample_rate() == rate {
            frame.clone()
        } else {
            frame.resample(rate)
        };

        let now = self.output.current_frame();
        let start_frame = self.next_start.max(now);
        let id = HandleId(self.next_id);
        self.next_id += 1;

        let handle = PlaybackHandle {
            id,
            start_frame,
            len_frames: frame.len() as u64,
            sample_rate: rate,
        };

        self.output.start_source(id, frame.shared_samples(), start_frame);
        self.active.insert(id, handle);
        self.next_start = handle.end_frame();

        tracing::debug!(
            "Scheduled {} at frame {} ({} frames, {} active)",
            id,
            start_frame,
            handle.len_frames,
            self.active.len()
        );

        handle
    }

    /// Stoppt und verwirft alle aktiven Handles
    ///
    /// Gibt die Anzahl der verworfenen Handles zurück.
    pub fn flush(&mut self) -> usize {
        let discarded = self.active.len();
        for id in self.active.keys() {
            self.output.stop_source(*id);
        }
        self.active.clear();
        self.next_start = self.output.current_frame();

        if discarded > 0 {
            tracing::debug!("Flushed {} scheduled frame(s)", discarded);
        }
        discarded
    }

    /// Verarbeitet die Completion-Meldung der Ausgabe
    pub fn complete(&mut self, id: HandleId) -> PlaybackEvent {
        if self.active.remove(&id).is_none() {
            return PlaybackEvent::Ignored;
        }
        if self.active.is_empty() {
            PlaybackEvent::Idle(id)
        } else {
            PlaybackEvent::Finished(id)
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    pub fn is_active(&self, id: HandleId) -> bool {
        self.active.contains_key(&id)
    }

    /// ScheduleClock in Ausgabe-Frames
    pub fn schedule_clock(&self) -> u64 {
        self.next_start
    }

    /// Gepuffertes, noch nicht gespieltes Audio
    pub fn buffered(&self) -> Duration {
        let now = self.output.current_frame();
        frames_to_duration(self.next_start.saturating_sub(now), self.sample_rate())
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        let rate = self.sample_rate();
        let now = self.output.current_frame();
        PlaybackSnapshot {
            active: self.active.len(),
            output_time: frames_to_duration(now, rate),
            schedule_clock: frames_to_duration(self.next_start, rate),
            buffered: frames_to_duration(self.next_start.saturating_sub(now), rate),
        }
    }
}

impl std::fmt::Debug for PlaybackScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackScheduler")
            .field("next_start", &self.next_start)
            .field("active", &self.active.len())
            .finish()
    }
}

fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let rate = sample_rate as u64;
    let secs = frames / rate;
    let nanos = (frames % rate) * 1_000_000_000 / rate;
    Duration::new(secs, nanos as u32)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::output::OfflineOutput;
    use crate::audio::pcm::OUTPUT_SAMPLE_RATE;

    fn setup() -> (Arc<OfflineOutput>, PlaybackScheduler) {
        let output = Arc::new(OfflineOutput::new(OUTPUT_SAMPLE_RATE));
        let scheduler = PlaybackScheduler::new(Arc::clone(&output) as Arc<dyn AudioOutput>);
        (output, scheduler)
    }

    fn frame(len: usize, value: f32) -> AudioFrame {
        AudioFrame::new(vec![value; len], OUTPUT_SAMPLE_RATE)
    }

    #[test]
    fn test_sequential_frames_are_gapless() {
        let (_output, mut scheduler) = setup();
        let lengths = [2400usize, 4800, 1200, 24000];

        let handles: Vec<_> = lengths
            .iter()
            .map(|len| scheduler.enqueue(&frame(*len, 0.1)))
            .collect();

        let first = handles[0].start_frame;
        let mut offset = 0u64;
        for (handle, len) in handles.iter().zip(lengths) {
            assert_eq!(handle.start_frame, first + offset);
            offset += len as u64;
        }
        assert_eq!(scheduler.schedule_clock(), first + offset);
    }

    #[test]
    fn test_two_one_second_frames_back_to_back() {
        let (_output, mut scheduler) = setup();
        let a = scheduler.enqueue(&frame(24000, 0.2));
        let b = scheduler.enqueue(&frame(24000, 0.2));

        assert_eq!(b.start(), a.start() + Duration::from_secs(1));
        assert_eq!(scheduler.buffered(), Duration::from_secs(2));
        assert_eq!(scheduler.active_count(), 2);
    }

    #[test]
    fn test_enqueue_after_underrun_starts_now() {
        let (output, mut scheduler) = setup();
        scheduler.enqueue(&frame(100, 0.1));
        output.advance(500);

        let handle = scheduler.enqueue(&frame(100, 0.1));
        assert_eq!(handle.start_frame, 500);
    }

    #[test]
    fn test_completion_reports_idle() {
        let (output, mut scheduler) = setup();
        let mut completions = output.take_completions().unwrap();
        let a = scheduler.enqueue(&frame(100, 0.1));
        let b = scheduler.enqueue(&frame(100, 0.1));

        output.advance(150);
        let id = completions.try_recv().unwrap();
        assert_eq!(scheduler.complete(id), PlaybackEvent::Finished(a.id));

        output.advance(100);
        let id = completions.try_recv().unwrap();
        assert_eq!(scheduler.complete(id), PlaybackEvent::Idle(b.id));
        assert!(scheduler.is_idle());
    }

    #[test]
    fn test_flush_discards_everything() {
        let (output, mut scheduler) = setup();
        let mut completions = output.take_completions().unwrap();
        for _ in 0..3 {
            scheduler.enqueue(&frame(24000, 0.5));
        }
        output.advance(12000);

        assert_eq!(scheduler.flush(), 3);
        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(scheduler.schedule_clock(), output.current_frame());
        assert_eq!(scheduler.buffered(), Duration::ZERO);

        // Kein Rest-Audio und keine Completion für verworfene Handles
        assert!(output.render(48000).iter().all(|s| *s == 0.0));
        assert!(completions.try_recv().is_err());
    }

    #[test]
    fn test_stale_completion_is_ignored() {
        let (output, mut scheduler) = setup();
        let mut completions = output.take_completions().unwrap();
        let handle = scheduler.enqueue(&frame(10, 0.1));

        // Completion liegt bereits in der Queue, bevor geflusht wird
        output.advance(10);
        scheduler.flush();

        let id = completions.try_recv().unwrap();
        assert_eq!(id, handle.id);
        assert_eq!(scheduler.complete(id), PlaybackEvent::Ignored);
    }

    #[test]
    fn test_foreign_rate_is_resampled() {
        let (_output, mut scheduler) = setup();
        let handle = scheduler.enqueue(&AudioFrame::silence(16000, 16000));
        assert_eq!(handle.len_frames, 24000);
        assert_eq!(handle.duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_frames_to_duration() {
        assert_eq!(frames_to_duration(36000, 24000), Duration::from_millis(1500));
        assert_eq!(frames_to_duration(0, 24000), Duration::ZERO);
    }
}
