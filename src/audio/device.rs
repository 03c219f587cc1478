//! Audio Devices - cpal Backend
//!
//! Verwendet cpal für Cross-Platform Audio I/O. Jeder cpal-Stream lebt auf
//! einem eigenen Thread, der ihn besitzt; so bleiben die Handles `Send`
//! und das Gerät wird beim Stoppen bzw. Droppen garantiert freigegeben.

use super::output::{AudioOutput, HandleId, Mixer};
use super::pcm::StreamResampler;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BuildStreamError, Device, FromSample, Sample, SampleFormat, SizedSample, StreamConfig,
    SupportedStreamConfigRange,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}

impl AudioError {
    fn from_build(err: BuildStreamError) -> Self {
        match err {
            BuildStreamError::DeviceNotAvailable => {
                AudioError::DeviceUnavailable("device is no longer available".to_string())
            }
            BuildStreamError::StreamConfigNotSupported => {
                AudioError::UnsupportedConfig("stream configuration not supported".to_string())
            }
            other => {
                let message = other.to_string();
                if looks_like_permission_error(&message) {
                    AudioError::PermissionDenied(message)
                } else {
                    AudioError::StreamBuildError(message)
                }
            }
        }
    }
}

/// Backends melden verweigerten Zugriff nur als Freitext
fn looks_like_permission_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    [
        "permission",
        "access denied",
        "access is denied",
        "access was denied",
        "not authorized",
        "unauthorized",
        "not permitted",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

// ============================================================================
// BACKEND TRAITS
// ============================================================================

/// Callback der Mono-Samples vom Eingabegerät erhält
pub type SampleSink = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Exklusiv belegtes Eingabegerät
///
/// Das Gerät ist ab dem Öffnen belegt, liefert aber erst nach `start`
/// Samples an den Sink. `stop` (und `Drop`) geben es wieder frei.
pub trait InputDevice: Send {
    /// Native Sample Rate des Geräts
    fn sample_rate(&self) -> u32;

    /// Verbindet den Sink mit dem laufenden Gerät
    fn start(&mut self, sink: SampleSink) -> Result<(), AudioError>;

    /// Trennt den Sink und gibt das Gerät frei
    fn stop(&mut self);
}

/// Quelle für Ein- und Ausgabegeräte
pub trait AudioBackend: Send + Sync {
    /// `preferred_rate` wird bevorzugt; sonst liefert das Gerät seine
    /// native Rate (siehe `InputDevice::sample_rate`)
    fn open_input(&self, preferred_rate: u32) -> Result<Box<dyn InputDevice>, AudioError>;

    fn open_output(&self, sample_rate: u32) -> Result<Arc<dyn AudioOutput>, AudioError>;
}

// ============================================================================
// DEVICE ENUMERATION
// ============================================================================

/// Repräsentiert ein Audio-Gerät
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_default: bool,
}

/// Gibt alle verfügbaren Audio-Geräte zurück (input, output)
pub fn list_devices() -> Result<(Vec<AudioDeviceInfo>, Vec<AudioDeviceInfo>), AudioError> {
    let host = cpal::default_host();

    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    let input_devices = host
        .input_devices()
        .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?
        .filter_map(|d| {
            d.name().ok().map(|name| AudioDeviceInfo {
                is_default: Some(&name) == default_input.as_ref(),
                name,
            })
        })
        .collect();

    let output_devices = host
        .output_devices()
        .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?
        .filter_map(|d| {
            d.name().ok().map(|name| AudioDeviceInfo {
                is_default: Some(&name) == default_output.as_ref(),
                name,
            })
        })
        .collect();

    Ok((input_devices, output_devices))
}

// ============================================================================
// CPAL BACKEND
// ============================================================================

/// Standard-Backend auf den Default-Geräten des Hosts
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl AudioBackend for CpalBackend {
    fn open_input(&self, preferred_rate: u32) -> Result<Box<dyn InputDevice>, AudioError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(AudioError::NoInputDevice)?;
        Ok(Box::new(CpalInput::open(device, preferred_rate)?))
    }

    fn open_output(&self, sample_rate: u32) -> Result<Arc<dyn AudioOutput>, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(AudioError::NoOutputDevice)?;
        Ok(Arc::new(CpalOutput::open(device, sample_rate)?))
    }
}

/// Thread, der einen cpal-Stream besitzt
struct StreamWorker {
    stop_tx: std_mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl StreamWorker {
    /// Startet den Thread und wartet, bis der Stream läuft
    fn spawn<F>(name: &str, build: F) -> Result<Self, AudioError>
    where
        F: FnOnce() -> Result<cpal::Stream, AudioError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), AudioError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamPlayError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Blockiert bis stop() oder bis der Sender gedroppt wird
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { stop_tx, handle }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(AudioError::StreamBuildError(
                    "audio thread exited unexpectedly".to_string(),
                ))
            }
        }
    }

    fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            tracing::warn!("Audio stream thread panicked during shutdown");
        }
    }
}

// ============================================================================
// CPAL INPUT
// ============================================================================

type SinkSlot = Arc<Mutex<Option<SampleSink>>>;

/// Mikrofon über cpal
pub struct CpalInput {
    sample_rate: u32,
    sink: SinkSlot,
    worker: Option<StreamWorker>,
}

impl CpalInput {
    /// Öffnet das Gerät; bis `start` werden Samples verworfen
    pub fn open(device: Device, preferred_rate: u32) -> Result<Self, AudioError> {
        let configs: Vec<SupportedStreamConfigRange> = device
            .supported_input_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?
            .collect();
        let (config, sample_format) = select_best_config(configs, preferred_rate)?;

        tracing::info!(
            "Opening audio capture: {} Hz, {} channel(s), {:?}",
            config.sample_rate.0,
            config.channels,
            sample_format
        );

        let sink: SinkSlot = Arc::new(Mutex::new(None));
        let sample_rate = config.sample_rate.0;
        let stream_sink = Arc::clone(&sink);

        let worker = StreamWorker::spawn("live-voice-capture", move || match sample_format {
            SampleFormat::F32 => build_input_stream::<f32>(&device, &config, stream_sink),
            SampleFormat::I16 => build_input_stream::<i16>(&device, &config, stream_sink),
            SampleFormat::U16 => build_input_stream::<u16>(&device, &config, stream_sink),
            other => Err(AudioError::UnsupportedConfig(format!(
                "sample format {:?}",
                other
            ))),
        })?;

        Ok(Self {
            sample_rate,
            sink,
            worker: Some(worker),
        })
    }
}

impl InputDevice for CpalInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self, sink: SampleSink) -> Result<(), AudioError> {
        if self.worker.is_none() {
            return Err(AudioError::DeviceUnavailable(
                "capture device already released".to_string(),
            ));
        }
        *self.sink.lock() = Some(sink);
        tracing::info!("Audio capture wired ({} Hz)", self.sample_rate);
        Ok(())
    }

    fn stop(&mut self) {
        self.sink.lock().take();
        if let Some(worker) = self.worker.take() {
            worker.stop();
            tracing::info!("Audio capture stopped");
        }
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_input_stream<T>(
    device: &Device,
    config: &StreamConfig,
    sink: SinkSlot,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let mut mono: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mut slot = sink.lock();
                let Some(callback) = slot.as_mut() else {
                    return;
                };
                // Erster Kanal genügt für Sprache
                mono.clear();
                mono.extend(data.chunks(channels).map(|frame| f32::from_sample(frame[0])));
                callback(&mono);
            },
            |err| {
                tracing::error!("Audio capture error: {}", err);
            },
            None,
        )
        .map_err(AudioError::from_build)
}

// ============================================================================
// CPAL OUTPUT
// ============================================================================

/// Lautsprecher über cpal, gespeist aus einem `Mixer`
///
/// Läuft das Gerät nicht mit der Mixer-Rate, wird im Callback linear
/// umgerechnet.
pub struct CpalOutput {
    mixer: Arc<Mutex<Mixer>>,
    completions: Mutex<Option<mpsc::UnboundedReceiver<HandleId>>>,
    worker: Mutex<Option<StreamWorker>>,
}

impl CpalOutput {
    pub fn open(device: Device, sample_rate: u32) -> Result<Self, AudioError> {
        let configs: Vec<SupportedStreamConfigRange> = device
            .supported_output_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?
            .collect();
        let (config, sample_format) = select_best_config(configs, sample_rate)?;

        tracing::info!(
            "Opening audio playback: {} Hz device, {} Hz mixer, {} channel(s)",
            config.sample_rate.0,
            sample_rate,
            config.channels
        );

        let (mixer, completions) = Mixer::new(sample_rate);
        let mixer = Arc::new(Mutex::new(mixer));
        let stream_mixer = Arc::clone(&mixer);

        let worker = StreamWorker::spawn("live-voice-playback", move || match sample_format {
            SampleFormat::F32 => build_output_stream::<f32>(&device, &config, stream_mixer),
            SampleFormat::I16 => build_output_stream::<i16>(&device, &config, stream_mixer),
            SampleFormat::U16 => build_output_stream::<u16>(&device, &config, stream_mixer),
            other => Err(AudioError::UnsupportedConfig(format!(
                "sample format {:?}",
                other
            ))),
        })?;

        Ok(Self {
            mixer,
            completions: Mutex::new(Some(completions)),
            worker: Mutex::new(Some(worker)),
        })
    }
}

impl AudioOutput for CpalOutput {
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
        if let Some(worker) = self.worker.lock().take() {
            worker.stop();
            tracing::info!("Audio playback stopped");
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_output_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mixer: Arc<Mutex<Mixer>>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let mixer_rate = mixer.lock().sample_rate();
    let mut resampler = StreamResampler::new(mixer_rate, config.sample_rate.0);
    let mut scratch: Vec<f32> = Vec::new();
    let mut pending: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                fill_from_mixer(&mixer, &mut resampler, &mut scratch, &mut pending, frames);

                for (frame, &sample) in data.chunks_mut(channels).zip(pending.iter()) {
                    let value = T::from_sample(sample);
                    for out in frame.iter_mut() {
                        *out = value;
                    }
                }
                pending.drain(..frames.min(pending.len()));
            },
            |err| {
                tracing::error!("Audio playback error: {}", err);
            },
            None,
        )
        .map_err(AudioError::from_build)
}

/// Rendert so viele Mixer-Frames, dass `pending` mindestens `frames`
/// Samples in Geräte-Rate enthält
///
/// Resampling-Überhang bleibt in `pending` für den nächsten Callback.
fn fill_from_mixer(
    mixer: &Mutex<Mixer>,
    resampler: &mut StreamResampler,
    scratch: &mut Vec<f32>,
    pending: &mut Vec<f32>,
    frames: usize,
) {
    while pending.len() < frames {
        let needed = resampler.input_for(frames - pending.len());
        scratch.resize(needed, 0.0);
        mixer.lock().render(scratch);
        resampler.process(scratch, pending);
    }
}

// ============================================================================
// CONFIG SELECTION
// ============================================================================

/// Wählt die beste Konfiguration aus einer Liste
///
/// Priorität: exakte Ziel-Rate vor Geräte-Maximum, F32 > I16 > U16.
fn select_best_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
) -> Result<(StreamConfig, SampleFormat), AudioError> {
    let target = cpal::SampleRate(target_rate);
    let supports_target =
        |c: &SupportedStreamConfigRange| c.min_sample_rate() <= target && c.max_sample_rate() >= target;

    for format in [SampleFormat::F32, SampleFormat::I16, SampleFormat::U16] {
        if let Some(config) = configs
            .iter()
            .find(|c| c.sample_format() == format && supports_target(c))
        {
            return Ok((config.clone().with_sample_rate(target).into(), format));
        }
    }

    // Fallback: Ziel-Rate nicht verfügbar, im Stream umrechnen
    for format in [SampleFormat::F32, SampleFormat::I16, SampleFormat::U16] {
        if let Some(config) = configs.iter().find(|c| c.sample_format() == format) {
            return Ok((config.clone().with_max_sample_rate().into(), format));
        }
    }

    Err(AudioError::UnsupportedConfig(
        "No suitable audio configuration found".to_string(),
    ))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_errors_are_recognised() {
        assert!(looks_like_permission_error(
            "Microphone access was denied by the user"
        ));
        assert!(looks_like_permission_error("Permission denied (os error 13)"));
        assert!(!looks_like_permission_error("Device busy"));
        assert!(!looks_like_permission_error("could not access device"));
        assert!(looks_like_permission_error("Operation not permitted"));
    }

    #[test]
    fn test_output_resampling_tracks_device_clock() {
        // 24kHz Mixer auf 44.1kHz Gerät, 512-Frame-Callbacks über 10s
        let (mixer, _completions) = Mixer::new(24000);
        let mixer = Mutex::new(mixer);
        let mut resampler = StreamResampler::new(24000, 44100);
        let mut scratch = Vec::new();
        let mut pending = Vec::new();

        let mut delivered = 0;
        while delivered < 441_000 {
            let frames = 512.min(441_000 - delivered);
            fill_from_mixer(&mixer, &mut resampler, &mut scratch, &mut pending, frames);
            assert!(pending.len() >= frames);
            pending.drain(..frames);
            delivered += frames;
        }

        // Mixer-Uhr läuft höchstens einen Callback voraus
        let position = mixer.lock().position();
        assert!(position >= 240_000, "mixer at {}", position);
        assert!(position <= 240_000 + 512, "mixer at {}", position);
    }

    #[test]
    fn test_build_error_classification() {
        assert!(matches!(
            AudioError::from_build(BuildStreamError::DeviceNotAvailable),
            AudioError::DeviceUnavailable(_)
        ));
        assert!(matches!(
            AudioError::from_build(BuildStreamError::StreamConfigNotSupported),
            AudioError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn test_select_best_config_empty() {
        assert!(select_best_config(Vec::new(), 16000).is_err());
    }

    #[test]
    fn test_select_prefers_target_rate() {
        let configs = vec![
            SupportedStreamConfigRange::new(
                2,
                cpal::SampleRate(44100),
                cpal::SampleRate(48000),
                cpal::SupportedBufferSize::Unknown,
                SampleFormat::F32,
            ),
            SupportedStreamConfigRange::new(
                1,
                cpal::SampleRate(8000),
                cpal::SampleRate(48000),
                cpal::SupportedBufferSize::Unknown,
                SampleFormat::I16,
            ),
        ];

        let (config, format) = select_best_config(configs.clone(), 16000).unwrap();
        assert_eq!(config.sample_rate.0, 16000);
        assert_eq!(format, SampleFormat::I16);

        let (config, format) = select_best_config(configs, 48000).unwrap();
        assert_eq!(config.sample_rate.0, 48000);
        assert_eq!(format, SampleFormat::F32);
    }
}
