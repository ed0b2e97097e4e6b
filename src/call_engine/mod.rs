//! Call Engine Module - Anrufsteuerung, WebRTC und Audio
//!
//! Dieses Modul verwaltet:
//! - Die Zustandsmaschine eines Endpunkts (Call Session Controller)
//! - WebRTC Peer Sessions mit Vanilla ICE
//! - Audio Capture (Mikrofon)
//! - Freizeichen und Klingelton
//! - Wähl- und Klingel-Timeouts

mod audio;
mod engine;
mod peer;
mod timers;
mod tones;
mod transport;

pub use audio::{AudioError, CpalCueOutput, MicrophoneCapture, CHANNELS, SAMPLE_RATE};
pub use engine::{
    CallController, CallError, CallEvent, CallHandle, CallRole, CallSnapshot, CallState,
    EndReason, LINE_CONNECTED, LINE_MISSED_DIAL, LINE_MISSED_RING,
};
pub use peer::{WebRtcSession, WebRtcTransport};
pub use timers::{ExpiryHandler, TimeoutSupervisor, TimerExpired, TimerKind};
pub use tones::{CueKind, CueOutput, CuePattern, ToneCueGenerator};
pub use transport::{
    AudioConstraints, AudioSourceInfo, LocalAudio, MediaConnectionState, MediaSession,
    MediaTransport, RemoteTrackHandler, RemoteTrackInfo, StateChangeHandler, TransportError,
};
