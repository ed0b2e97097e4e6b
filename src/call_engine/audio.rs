//! Audio Geräte - Mikrofon und Ton-Ausgabe
//!
//! Verwendet cpal für Cross-Platform Audio I/O:
//! - [`MicrophoneCapture`]: lokales Mikrofon für die Dauer eines Anrufs
//! - [`CpalCueOutput`]: ein wiederverwendeter Output-Stream pro Endpunkt
//!   für Freizeichen und Klingelton

use super::tones::{CueOutput, CuePattern};
use super::transport::{AudioConstraints, AudioSourceInfo, LocalAudio};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für beste Qualität)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Startgröße des Ton-Buffers (2s @ 48kHz), wächst bei höheren Geräteraten
const CUE_BUFFER_SIZE: usize = SAMPLE_RATE as usize * 2;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}

// ============================================================================
// MICROPHONE CAPTURE
// ============================================================================

/// Offenes Mikrofon
///
/// Note: Stream ist weder Send noch Sync. Der Handle gehört dem Controller,
/// `&self`-Methoden greifen nur auf die Mutex-Felder zu.
pub struct MicrophoneCapture {
    stream: Option<Stream>,
    constraints: AudioConstraints,
    is_muted: Arc<Mutex<bool>>,
    input_level: Arc<Mutex<f32>>,
}

unsafe impl Send for MicrophoneCapture {}
unsafe impl Sync for MicrophoneCapture {}

impl MicrophoneCapture {
    /// Öffnet das Standard-Mikrofon und startet die Aufnahme
    pub fn start(constraints: AudioConstraints) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(AudioError::NoInputDevice)?;

        let config = find_best_input_config(&device)?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels (echo cancellation: {}, noise suppression: {}, auto gain: {})",
            config.sample_rate.0,
            config.channels,
            constraints.echo_cancellation,
            constraints.noise_suppression,
            constraints.auto_gain_control
        );

        let is_muted = Arc::new(Mutex::new(false));
        let input_level = Arc::new(Mutex::new(0.0f32));
        let channels = config.channels.max(1) as usize;

        let muted_clone = Arc::clone(&is_muted);
        let level_clone = Arc::clone(&input_level);

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if *muted_clone.lock() {
                        *level_clone.lock() = 0.0;
                        return;
                    }

                    // Mono-Downmix, dann Pegel berechnen (RMS)
                    let frames = data.len() / channels;
                    if frames == 0 {
                        return;
                    }
                    let sum_sq: f32 = data
                        .chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                        .map(|s| s * s)
                        .sum();
                    *level_clone.lock() = (sum_sq / frames as f32).sqrt().min(1.0);
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        Ok(Self {
            stream: Some(stream),
            constraints,
            is_muted,
            input_level,
        })
    }
}

impl LocalAudio for MicrophoneCapture {
    fn info(&self) -> AudioSourceInfo {
        AudioSourceInfo {
            sample_rate: SAMPLE_RATE,
            channels: self.constraints.channels.max(CHANNELS),
        }
    }

    fn set_muted(&self, muted: bool) {
        *self.is_muted.lock() = muted;
        tracing::debug!("Audio muted: {}", muted);
    }

    fn is_muted(&self) -> bool {
        *self.is_muted.lock()
    }

    fn level(&self) -> f32 {
        *self.input_level.lock()
    }

    fn stop(&mut self) {
        if self.stream.take().is_some() {
            *self.input_level.lock() = 0.0;
            tracing::info!("Audio capture stopped");
        }
    }

    fn is_active(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for MicrophoneCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// CUE OUTPUT
// ============================================================================

/// Lautsprecher-Ausgabe für Ton-Signale
///
/// Der Stream wird beim ersten Signal geöffnet und danach weiterverwendet,
/// neue Streams pro Signal führen auf manchen Geräten zu Knacksern.
pub struct CpalCueOutput {
    device: Option<Device>,
    stream: Mutex<Option<(Stream, u32)>>,
    /// Ring-Buffer für zu spielendes Audio (PCM @ 48kHz, mono)
    playback_buffer: Arc<Mutex<HeapRb<f32>>>,
}

// Stream ist nicht Send/Sync, Zugriff läuft ausschließlich über den Mutex
unsafe impl Send for CpalCueOutput {}
unsafe impl Sync for CpalCueOutput {}

impl CpalCueOutput {
    pub fn new() -> Self {
        let device = cpal::default_host().default_output_device();
        if device.is_none() {
            tracing::warn!("No audio output device found, tone cues stay silent");
        }

        Self {
            device,
            stream: Mutex::new(None),
            playback_buffer: Arc::new(Mutex::new(HeapRb::new(CUE_BUFFER_SIZE))),
        }
    }

    /// Öffnet den Output-Stream falls noch nicht geschehen, gibt die Sample Rate zurück
    fn ensure_stream(&self) -> Result<u32, AudioError> {
        let mut slot = self.stream.lock();
        if let Some((_, rate)) = slot.as_ref() {
            return Ok(*rate);
        }

        let device = self.device.as_ref().ok_or(AudioError::NoOutputDevice)?;
        let config = find_best_output_config(device)?;

        tracing::info!(
            "Opening cue output: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let playback_buffer = Arc::clone(&self.playback_buffer);
        let channels = config.channels.max(1) as usize;

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut buffer = playback_buffer.lock();
                    // Mono auf alle Kanäle verteilen
                    for frame in data.chunks_mut(channels) {
                        let sample = buffer.try_pop().unwrap_or(0.0);
                        for s in frame.iter_mut() {
                            *s = sample;
                        }
                    }
                },
                |err| {
                    tracing::error!("Audio playback error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        let rate = config.sample_rate.0;
        *slot = Some((stream, rate));
        Ok(rate)
    }
}

impl Default for CpalCueOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl CueOutput for CpalCueOutput {
    fn play(&self, pattern: &CuePattern) -> Result<(), AudioError> {
        let rate = self.ensure_stream()?;
        let samples = pattern.render(rate);

        let mut buffer = self.playback_buffer.lock();
        let queued = queue_cue(&mut buffer, &samples);
        if queued < samples.len() {
            tracing::warn!(
                "Tone cue truncated: {} of {} samples queued",
                queued,
                samples.len()
            );
        }
        Ok(())
    }

    fn silence(&self) {
        self.playback_buffer.lock().clear();
    }
}

/// Ersetzt den Buffer-Inhalt durch ein komplettes Signal
///
/// Passt das Signal nicht hinein (Gerät läuft z.B. mit 96kHz), wird der
/// Buffer vorher vergrößert. Gibt die Anzahl eingereihter Samples zurück.
fn queue_cue(buffer: &mut HeapRb<f32>, samples: &[f32]) -> usize {
    if buffer.capacity().get() < samples.len() {
        tracing::debug!("Growing cue buffer to {} samples", samples.len());
        *buffer = HeapRb::new(samples.len());
    } else {
        buffer.clear();
    }
    buffer.push_slice(samples)
}

// ============================================================================
// DEVICE CONFIG
// ============================================================================

/// Findet die beste Input-Konfiguration
fn find_best_input_config(device: &Device) -> Result<StreamConfig, AudioError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

    select_best_config(configs.collect())
}

/// Findet die beste Output-Konfiguration
fn find_best_output_config(device: &Device) -> Result<StreamConfig, AudioError> {
    let configs = device
        .supported_output_configs()
        .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

    select_best_config(configs.collect())
}

/// Wählt die beste F32-Konfiguration aus einer Liste
///
/// Die Callbacks arbeiten mit `f32`, andere Sample-Formate werden abgelehnt.
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, AudioError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    let f32_configs: Vec<SupportedStreamConfigRange> = configs
        .into_iter()
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .collect();

    // Versuche exakt 48kHz zu finden
    if let Some(config) = f32_configs
        .iter()
        .find(|c| c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate)
        .cloned()
    {
        return Ok(config.with_sample_rate(target_rate).into());
    }

    // Sonst die höchste verfügbare Rate
    if let Some(config) = f32_configs.into_iter().next() {
        return Ok(config.with_max_sample_rate().into());
    }

    Err(AudioError::UnsupportedConfig(
        "No f32 audio configuration found".to_string(),
    ))
}

// ============================================================================
// TESTS
// ============================================================================
