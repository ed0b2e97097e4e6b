//! Tone Cue Generator - Freizeichen und Klingelton
//!
//! Ein Signal wird sofort gespielt und danach im festen Takt wiederholt,
//! bis `stop()` aufgerufen wird. Ein zweites `start_*` während ein Signal
//! läuft, wird ignoriert.

use super::audio::AudioError;
use parking_lot::Mutex;
use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Ausblendzeit am Ende eines Tons
const RELEASE_SECS: f32 = 0.05;

// ============================================================================
// CUE PATTERN
// ============================================================================

/// Welches Signal läuft
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CueKind {
    /// Anrufer hört: Gegenseite klingelt
    Ringback,
    /// Angerufener hört: Anruf kommt rein
    IncomingRing,
}

impl CueKind {
    pub fn pattern(&self) -> CuePattern {
        match self {
            // Ein langer Ton (1s)
            CueKind::Ringback => CuePattern {
                frequency_hz: 425.0,
                gain: 0.12,
                segments: vec![(0.0, 1.0)],
            },
            // "Tru-Tru": zwei kurze Töne mit Pause
            CueKind::IncomingRing => CuePattern {
                frequency_hz: 440.0,
                gain: 0.15,
                segments: vec![(0.0, 0.4), (0.65, 1.05)],
            },
        }
    }
}

/// Sinus-Ton mit An/Aus-Segmenten (Sekunden relativ zum Start)
#[derive(Debug, Clone, PartialEq)]
pub struct CuePattern {
    pub frequency_hz: f32,
    pub gain: f32,
    pub segments: Vec<(f32, f32)>,
}

impl CuePattern {
    /// Gesamtlänge inklusive Ausblenden
    pub fn duration_secs(&self) -> f32 {
        self.segments
            .iter()
            .map(|(_, end)| end + RELEASE_SECS)
            .fold(0.0, f32::max)
    }

    /// Lautstärke-Hüllkurve zum Zeitpunkt `t`
    pub fn amplitude_at(&self, t: f32) -> f32 {
        self.segments
            .iter()
            .map(|&(start, end)| {
                if t >= start && t < end {
                    self.gain
                } else if t >= end && t < end + RELEASE_SECS {
                    self.gain * (1.0 - (t - end) / RELEASE_SECS)
                } else {
                    0.0
                }
            })
            .fold(0.0, f32::max)
    }

    /// Rendert das komplette Signal als Mono-PCM
    pub fn render(&self, sample_rate: u32) -> Vec<f32> {
        let rate = sample_rate as f32;
        let len = (self.duration_secs() * rate).ceil() as usize;
        (0..len)
            .map(|i| {
                let t = i as f32 / rate;
                (TAU * self.frequency_hz * t).sin() * self.amplitude_at(t)
            })
            .collect()
    }
}

// ============================================================================
// CUE OUTPUT
// ============================================================================

/// Ausgabe für Ton-Signale (ein Audio-Kontext pro Endpunkt)
pub trait CueOutput: Send + Sync {
    /// Spielt ein Signal einmal ab
    fn play(&self, pattern: &CuePattern) -> Result<(), AudioError>;

    /// Bricht ein laufendes Signal ab
    fn silence(&self);
}

// ============================================================================
// TONE CUE GENERATOR
// ============================================================================

struct RunningCue {
    kind: CueKind,
    task: JoinHandle<()>,
}

/// Wiederholt Ton-Signale im festen Takt
pub struct ToneCueGenerator {
    output: Arc<dyn CueOutput>,
    cadence: Duration,
    running: Mutex<Option<RunningCue>>,
}

impl ToneCueGenerator {
    pub fn new(output: Arc<dyn CueOutput>, cadence: Duration) -> Self {
        Self {
            output,
            cadence,
            running: Mutex::new(None),
        }
    }

    pub fn start_ringback(&self) {
        self.start(CueKind::Ringback);
    }

    pub fn start_incoming_ring(&self) {
        self.start(CueKind::IncomingRing);
    }

    /// Gerade laufendes Signal
    pub fn current(&self) -> Option<CueKind> {
        self.running.lock().as_ref().map(|r| r.kind)
    }

    fn start(&self, kind: CueKind) {
        let mut running = self.running.lock();
        if let Some(current) = running.as_ref() {
            tracing::debug!("Tone {:?} requested while {:?} plays, ignoring", kind, current.kind);
            return;
        }

        let output = Arc::clone(&self.output);
        let cadence = self.cadence;
        let pattern = kind.pattern();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cadence);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = output.play(&pattern) {
                    tracing::warn!("Failed to play tone cue: {}", e);
                }
            }
        });

        tracing::debug!("Tone {:?} started", kind);
        *running = Some(RunningCue { kind, task });
    }

    /// Stoppt das laufende Signal, ohne laufendes Signal ein No-op
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            running.task.abort();
            self.output.silence();
            tracing::debug!("Tone {:?} stopped", running.kind);
        }
    }
}

impl Drop for ToneCueGenerator {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.task.abort();
        }
    }
}

impl std::fmt::Debug for ToneCueGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToneCueGenerator")
            .field("cadence", &self.cadence)
            .field("current", &self.current())
            .finish()
    }
}
