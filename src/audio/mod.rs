//! Audio Module - Transcoding, Capture und Playback
//!
//! Dieses Modul verwaltet:
//! - PCM16 Encoding/Decoding
//! - Audio Capture (Mikrofon → Blöcke → Session)
//! - Gapless Playback-Scheduling mit Unterbrechung (Barge-in)
//! - cpal Geräte als austauschbares Backend

mod capture;
mod device;
mod output;
mod pcm;
mod scheduler;

pub use capture::{CapturePipeline, CaptureStats, DEFAULT_BLOCK_SIZE};
pub use device::{
    list_devices, AudioBackend, AudioDeviceInfo, AudioError, CpalBackend, InputDevice, SampleSink,
};
pub use output::{AudioOutput, HandleId, Mixer, OfflineOutput};
pub use pcm::{
    decode, encode, encode_at, AudioFrame, EncodedChunk, EncodingDescriptor, PcmError,
    StreamResampler, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE,
};
pub use scheduler::{PlaybackEvent, PlaybackHandle, PlaybackScheduler, PlaybackSnapshot};
