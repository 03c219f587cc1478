//! PCM Transcoder
//!
//! Zustandslose Umwandlung zwischen Float-Samples und dem PCM16-Wire-Format
//! (little-endian, signed 16 bit).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate für aufgenommenes Audio (Mikrofon → Server)
pub const INPUT_SAMPLE_RATE: u32 = 16000;

/// Sample Rate für empfangenes Audio (Server → Lautsprecher)
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;

/// Skalierungsfaktor zwischen f32 und i16
const PCM_SCALE: f32 = 32768.0;

/// Bytes pro Sample im Wire-Format
const BYTES_PER_SAMPLE: usize = 2;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PcmError {
    #[error("PCM payload of {len} bytes is not a multiple of {frame_bytes} ({channels} channel(s))")]
    InvalidLength {
        len: usize,
        channels: u16,
        frame_bytes: usize,
    },

    #[error("PCM payload declares zero channels")]
    ZeroChannels,
}

// ============================================================================
// ENCODING DESCRIPTOR
// ============================================================================

/// Beschreibt das Format eines EncodedChunk (immer PCM16)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncodingDescriptor {
    pub sample_rate: u32,
    pub channels: u16,
}

impl EncodingDescriptor {
    /// Format des Mikrofon-Streams: pcm16-rate16000-mono
    pub const INPUT: Self = Self {
        sample_rate: INPUT_SAMPLE_RATE,
        channels: 1,
    };

    /// Format der Server-Antworten: pcm16-rate24000-mono
    pub const OUTPUT: Self = Self {
        sample_rate: OUTPUT_SAMPLE_RATE,
        channels: 1,
    };

    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// MIME-Type wie er im Live-Protokoll verwendet wird
    pub fn mime_type(&self) -> String {
        if self.channels == 1 {
            format!("audio/pcm;rate={}", self.sample_rate)
        } else {
            format!("audio/pcm;rate={};channels={}", self.sample_rate, self.channels)
        }
    }

    /// Parst einen MIME-Type wie `audio/pcm;rate=24000`
    ///
    /// Fehlt der `rate` Parameter, wird die Ausgabe-Rate angenommen.
    /// Gibt `None` zurück wenn es sich nicht um PCM handelt.
    pub fn from_mime_type(mime: &str) -> Option<Self> {
        let mut params = mime.split(';').map(str::trim);
        let essence = params.next()?;
        if !essence.eq_ignore_ascii_case("audio/pcm") && !essence.eq_ignore_ascii_case("audio/l16")
        {
            return None;
        }

        let mut descriptor = Self::OUTPUT;
        for param in params {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            match key.trim().to_ascii_lowercase().as_str() {
                "rate" => descriptor.sample_rate = value.trim().parse().ok()?,
                "channels" => descriptor.channels = value.trim().parse().ok()?,
                _ => {}
            }
        }

        if descriptor.sample_rate == 0 || descriptor.channels == 0 {
            return None;
        }
        Some(descriptor)
    }
}

impl fmt::Display for EncodingDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.channels {
            1 => write!(f, "pcm16-rate{}-mono", self.sample_rate),
            2 => write!(f, "pcm16-rate{}-stereo", self.sample_rate),
            n => write!(f, "pcm16-rate{}-{}ch", self.sample_rate, n),
        }
    }
}

// ============================================================================
// AUDIO FRAME
// ============================================================================

/// Unveränderliche Folge von Mono-Samples mit fester Sample Rate
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    /// Stille der angegebenen Länge
    pub fn silence(len: usize, sample_rate: u32) -> Self {
        Self::new(vec![0.0; len], sample_rate)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Geteilter Zugriff auf die Samples ohne Kopie
    pub fn shared_samples(&self) -> Arc<[f32]> {
        Arc::clone(&self.samples)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    /// Lineares Resampling auf eine andere Rate (Dauer bleibt erhalten)
    pub fn resample(&self, target_rate: u32) -> AudioFrame {
        if target_rate == self.sample_rate || self.sample_rate == 0 || target_rate == 0 {
            return self.clone();
        }
        let samples = resample_linear(&self.samples, self.sample_rate, target_rate);
        AudioFrame::new(samples, target_rate)
    }
}

// ============================================================================
// ENCODED CHUNK
// ============================================================================

/// Wire-Form eines AudioFrame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    pub data: Vec<u8>,
    pub descriptor: EncodingDescriptor,
}

impl EncodedChunk {
    pub fn new(data: Vec<u8>, descriptor: EncodingDescriptor) -> Self {
        Self { data, descriptor }
    }

    /// Dekodiert den Chunk anhand seines eigenen Descriptors
    pub fn decode(&self) -> Result<AudioFrame, PcmError> {
        decode(
            &self.data,
            self.descriptor.sample_rate,
            self.descriptor.channels,
        )
    }
}

// ============================================================================
// TRANSCODING
// ============================================================================

/// Kodiert Float-Samples in [-1, 1] als PCM16 @ 16kHz mono
pub fn encode(samples: &[f32]) -> EncodedChunk {
    encode_at(samples, INPUT_SAMPLE_RATE)
}

/// Kodiert Mono-Samples der angegebenen Rate als PCM16
pub fn encode_at(samples: &[f32], sample_rate: u32) -> EncodedChunk {
    let mut data = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        // `as` saturiert, 1.0 * 32768 landet also bei i16::MAX
        let value = (sample * PCM_SCALE) as i16;
        data.extend_from_slice(&value.to_le_bytes());
    }
    EncodedChunk::new(data, EncodingDescriptor::new(sample_rate, 1))
}

/// Dekodiert PCM16-Bytes zu einem Mono-AudioFrame
///
/// Mehrkanaliges Material wird durch Mittelung auf Mono gemischt.
pub fn decode(data: &[u8], sample_rate: u32, channels: u16) -> Result<AudioFrame, PcmError> {
    if channels == 0 {
        return Err(PcmError::ZeroChannels);
    }

    let frame_bytes = BYTES_PER_SAMPLE * channels as usize;
    if data.len() % frame_bytes != 0 {
        return Err(PcmError::InvalidLength {
            len: data.len(),
            channels,
            frame_bytes,
        });
    }

    let samples: Vec<f32> = data
        .chunks_exact(frame_bytes)
        .map(|frame| {
            let sum: f32 = frame
                .chunks_exact(BYTES_PER_SAMPLE)
                .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / PCM_SCALE)
                .sum();
            sum / channels as f32
        })
        .collect();

    Ok(AudioFrame::new(samples, sample_rate))
}

/// Einfaches lineares Resampling
pub(crate) fn resample_linear(data: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if data.is_empty() || source_rate == target_rate {
        return data.to_vec();
    }
    let ratio = target_rate as f64 / source_rate as f64;
    let new_len = (data.len() as f64 * ratio).round() as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f64 / ratio;
            let idx = src_idx as usize;
            let frac = (src_idx - idx as f64) as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

// ============================================================================
// STREAM RESAMPLER
// ============================================================================

/// Lineares Resampling über aufeinanderfolgende Callbacks hinweg
///
/// Die Position des nächsten Ausgabe-Samples wird exakt als Bruch
/// `produced * source / target` geführt und das letzte Eingabe-Sample
/// bleibt für die Interpolation über die Callback-Grenze erhalten. Nach
/// N Eingabe-Samples sind so immer `N * target / source` (±1) Samples
/// erzeugt, unabhängig von der Callback-Größe.
#[derive(Debug, Clone)]
pub struct StreamResampler {
    source_rate: u64,
    target_rate: u64,
    /// Eingabe-Samples vor dem aktuellen Callback
    consumed: u64,
    produced: u64,
    last: f32,
}

impl StreamResampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Self {
        Self {
            source_rate: source_rate.max(1) as u64,
            target_rate: target_rate.max(1) as u64,
            consumed: 0,
            produced: 0,
            last: 0.0,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.source_rate == self.target_rate
    }

    /// Hängt alle aus `input` berechenbaren Samples an `output` an
    pub fn process(&mut self, input: &[f32], output: &mut Vec<f32>) {
        if self.is_passthrough() {
            output.extend_from_slice(input);
            return;
        }

        let end = self.consumed + input.len() as u64;
        loop {
            let position = self.produced * self.source_rate;
            let idx = position / self.target_rate;
            if idx + 1 >= end {
                break;
            }
            let frac = (position % self.target_rate) as f32 / self.target_rate as f32;
            let s1 = self.sample_at(input, idx);
            let s2 = self.sample_at(input, idx + 1);
            output.push(s1 + (s2 - s1) * frac);
            self.produced += 1;
        }

        if let Some(&last) = input.last() {
            self.last = last;
        }
        self.consumed = end;
    }

    /// Eingabe-Samples, die für `frames` weitere Ausgabe-Samples reichen
    pub fn input_for(&self, frames: usize) -> usize {
        let needed = (frames as u64 * self.source_rate).div_ceil(self.target_rate);
        needed.max(1) as usize
    }

    /// `idx` liegt nie vor dem letzten Sample des vorigen Callbacks
    fn sample_at(&self, input: &[f32], idx: u64) -> f32 {
        if idx < self.consumed {
            return self.last;
        }
        input
            .get((idx - self.consumed) as usize)
            .copied()
            .unwrap_or(self.last)
    }
}

// ============================================================================
// TESTS
// ============================================================================
