//! Capture Pipeline
//!
//! Formt aus den Samples des Eingabegeräts Blöcke fester Größe, kodiert
//! jeden Block als PCM16 (standardmäßig 16kHz) und reicht ihn
//! nicht-blockierend an die ausgehende Queue der Session weiter.

use super::device::SampleSink;
use super::pcm::{encode_at, EncodedChunk, StreamResampler};
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Blockgröße in Samples (256ms @ 16kHz)
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

// ============================================================================
// STATS
// ============================================================================

/// Zähler der Pipeline (lock-free, aus dem Audio-Callback beschrieben)
#[derive(Debug, Default)]
pub struct CaptureStats {
    blocks_sent: AtomicU64,
    blocks_dropped: AtomicU64,
    closed: AtomicBool,
}

impl CaptureStats {
    pub fn blocks_sent(&self) -> u64 {
        self.blocks_sent.load(Ordering::Relaxed)
    }

    pub fn blocks_dropped(&self) -> u64 {
        self.blocks_dropped.load(Ordering::Relaxed)
    }

    /// Die Session nimmt keine Blöcke mehr an
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

// ============================================================================
// CAPTURE PIPELINE
// ============================================================================

pub struct CapturePipeline {
    block_size: usize,
    source_rate: u32,
    target_rate: u32,
    resampler: StreamResampler,
    /// Wiederverwendet, damit der Geräte-Callback nicht alloziert
    scratch: Vec<f32>,
    /// Hält höchstens einen unvollständigen Block
    buffer: HeapRb<f32>,
    block: Vec<f32>,
    outbound: mpsc::Sender<EncodedChunk>,
    stats: Arc<CaptureStats>,
}

impl CapturePipeline {
    /// `source_rate` ist die native Rate des Geräts, `target_rate` die
    /// Rate auf dem Wire
    pub fn new(
        block_size: usize,
        source_rate: u32,
        target_rate: u32,
        outbound: mpsc::Sender<EncodedChunk>,
    ) -> Self {
        let block_size = block_size.max(1);
        Self {
            block_size,
            source_rate,
            target_rate,
            resampler: StreamResampler::new(source_rate, target_rate),
            scratch: Vec::new(),
            buffer: HeapRb::new(block_size * 2),
            block: vec![0.0; block_size],
            outbound,
            stats: Arc::new(CaptureStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        Arc::clone(&self.stats)
    }

    /// Verarbeitet Samples aus dem Geräte-Callback
    pub fn push(&mut self, data: &[f32]) {
        if self.stats.is_closed() || data.is_empty() {
            return;
        }

        if self.resampler.is_passthrough() {
            self.accumulate(data);
            return;
        }

        let mut samples = std::mem::take(&mut self.scratch);
        samples.clear();
        self.resampler.process(data, &mut samples);
        self.accumulate(&samples);
        self.scratch = samples;
    }

    fn accumulate(&mut self, samples: &[f32]) {
        let mut rest = samples;
        while !rest.is_empty() {
            let pushed = self.buffer.push_slice(rest);
            rest = &rest[pushed..];

            while self.buffer.occupied_len() >= self.block_size {
                self.buffer.pop_slice(&mut self.block);
                let chunk = encode_at(&self.block, self.target_rate);
                self.forward(chunk);
            }

            if pushed == 0 {
                break;
            }
        }
    }

    /// Wandelt die Pipeline in einen Sink für `InputDevice::start`
    pub fn into_sink(mut self) -> SampleSink {
        Box::new(move |data: &[f32]| self.push(data))
    }

    fn forward(&mut self, chunk: EncodedChunk) {
        match self.outbound.try_send(chunk) {
            Ok(()) => {
                self.stats.blocks_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                let dropped = self.stats.blocks_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!("Outbound queue full, dropped capture block ({} total)", dropped);
            }
            Err(TrySendError::Closed(_)) => {
                if !self.stats.closed.swap(true, Ordering::Relaxed) {
                    tracing::info!("Outbound queue closed, capture stops forwarding");
                }
            }
        }
    }
}

impl std::fmt::Debug for CapturePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturePipeline")
            .field("block_size", &self.block_size)
            .field("source_rate", &self.source_rate)
            .field("target_rate", &self.target_rate)
            .field("buffered", &self.buffer.occupied_len())
            .field("stats", &self.stats)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm::{EncodingDescriptor, INPUT_SAMPLE_RATE};

    /// Gerät liefert bereits 16kHz
    fn native(block_size: usize, tx: mpsc::Sender<EncodedChunk>) -> CapturePipeline {
        CapturePipeline::new(block_size, INPUT_SAMPLE_RATE, INPUT_SAMPLE_RATE, tx)
    }

    #[test]
    fn test_blocks_are_forwarded_in_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut pipeline = native(DEFAULT_BLOCK_SIZE, tx);

        for k in 1..=3 {
            pipeline.push(&vec![k as f32 * 0.1; DEFAULT_BLOCK_SIZE]);
        }

        for k in 1..=3 {
            let chunk = rx.try_recv().unwrap();
            assert_eq!(chunk.descriptor, EncodingDescriptor::INPUT);
            assert_eq!(chunk.data.len(), DEFAULT_BLOCK_SIZE * 2);
            let frame = chunk.decode().unwrap();
            assert!((frame.samples()[0] - k as f32 * 0.1).abs() < 1e-4);
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(pipeline.stats().blocks_sent(), 3);
    }

    #[test]
    fn test_partial_callbacks_form_whole_blocks() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut pipeline = native(1000, tx);

        pipeline.push(&[0.1; 700]);
        assert!(rx.try_recv().is_err());

        pipeline.push(&[0.1; 700]);
        assert_eq!(rx.try_recv().unwrap().data.len(), 2000);
        assert!(rx.try_recv().is_err());

        // Ein großer Callback erzeugt mehrere Blöcke
        pipeline.push(&[0.1; 2600]);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_queue_drops_blocks() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut pipeline = native(10, tx);
        let stats = pipeline.stats();

        pipeline.push(&[0.0; 30]);
        assert_eq!(stats.blocks_sent(), 1);
        assert_eq!(stats.blocks_dropped(), 2);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_closed_queue_stops_forwarding() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let pipeline = native(10, tx);
        let stats = pipeline.stats();
        let mut sink = pipeline.into_sink();

        sink(&[0.0; 10]);
        assert!(stats.is_closed());
        sink(&[0.0; 10]);
        assert_eq!(stats.blocks_sent(), 0);
        assert_eq!(stats.blocks_dropped(), 0);
    }

    #[test]
    fn test_native_rate_is_resampled() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut pipeline = CapturePipeline::new(DEFAULT_BLOCK_SIZE, 48000, INPUT_SAMPLE_RATE, tx);

        // 3 * 4096 Samples @ 48kHz ergeben genau einen Block @ 16kHz
        pipeline.push(&vec![0.2; DEFAULT_BLOCK_SIZE * 3]);
        let chunk = rx.try_recv().unwrap();
        assert_eq!(chunk.data.len(), DEFAULT_BLOCK_SIZE * 2);
    }

    #[test]
    fn test_resampled_stream_keeps_wire_rate() {
        // 10s @ 48kHz in 512-Frame-Callbacks ergeben exakt 160000 Samples
        let (tx, mut rx) = mpsc::channel(256);
        let mut pipeline = CapturePipeline::new(1600, 48000, INPUT_SAMPLE_RATE, tx);

        let callback = [0.1f32; 512];
        let mut fed = 0;
        while fed < 480_000 {
            let len = (480_000 - fed).min(callback.len());
            pipeline.push(&callback[..len]);
            fed += len;
        }

        let mut blocks = 0;
        while let Ok(chunk) = rx.try_recv() {
            assert_eq!(chunk.descriptor, EncodingDescriptor::INPUT);
            blocks += 1;
        }
        assert_eq!(blocks, 100);
        assert_eq!(pipeline.buffer.occupied_len(), 0);
    }

    #[test]
    fn test_configured_wire_rate() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut pipeline = CapturePipeline::new(800, 48000, 8000, tx);

        pipeline.push(&vec![0.0; 4801]);
        let chunk = rx.try_recv().unwrap();
        assert_eq!(chunk.descriptor.mime_type(), "audio/pcm;rate=8000");
        assert_eq!(chunk.data.len(), 1600);
    }
}
