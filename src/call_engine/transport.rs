//! Media Transport Adapter
//!
//! Abstrahiert die Peer-Media-Fähigkeit (Mikrofon, SDP-Aushandlung,
//! Candidate Gathering, Remote Tracks). Der Controller kennt nur diese
//! Traits, die WebRTC-Implementierung liegt in `peer.rs`.

use super::audio::AudioError;
use crate::config::IceServerConfig;
use crate::signaling::SessionDescription;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Audio capture failed: {0}")]
    Capture(#[from] AudioError),

    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("No local description after negotiation")]
    NoLocalDescription,
}

// ============================================================================
// TYPES
// ============================================================================

/// Gewünschte Verarbeitung für das Mikrofon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub channels: u16,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            channels: 1,
        }
    }
}

/// Format einer lokalen Audioquelle, wird beim Anhängen an die Session gebraucht
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSourceInfo {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Verbindungszustand der Media Session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Infos zu einem eingehenden Remote Track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackInfo {
    pub track_id: String,
    pub codec: String,
}

pub type StateChangeHandler = Arc<dyn Fn(MediaConnectionState) + Send + Sync>;
pub type RemoteTrackHandler = Arc<dyn Fn(RemoteTrackInfo) + Send + Sync>;

// ============================================================================
// TRAITS
// ============================================================================

/// Lokal aufgenommenes Audio
pub trait LocalAudio: Send + Sync {
    fn info(&self) -> AudioSourceInfo;

    fn set_muted(&self, muted: bool);

    fn is_muted(&self) -> bool;

    /// Aktueller Pegel (0.0 - 1.0)
    fn level(&self) -> f32;

    /// Gibt das Gerät frei, mehrfacher Aufruf ist erlaubt
    fn stop(&mut self);

    fn is_active(&self) -> bool;
}

/// Einstiegspunkt in die Media-Fähigkeit eines Endpunkts
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Öffnet das Mikrofon
    async fn capture_local_audio(
        &self,
        constraints: AudioConstraints,
    ) -> Result<Box<dyn LocalAudio>, TransportError>;

    /// Erstellt eine neue Peer Session mit den gegebenen STUN/TURN Servern
    async fn open_session(
        &self,
        ice_servers: &[IceServerConfig],
    ) -> Result<Box<dyn MediaSession>, TransportError>;
}

/// Eine Peer Session (ein Anruf)
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn attach_track(&self, source: AudioSourceInfo) -> Result<(), TransportError>;

    /// Erstellt das Offer und setzt es als Local Description
    async fn negotiate_offer(&self) -> Result<(), TransportError>;

    /// Setzt das Remote Offer, erstellt das Answer und setzt es lokal
    async fn negotiate_answer(&self, remote_offer: &SessionDescription)
        -> Result<(), TransportError>;

    async fn set_remote_answer(&self, answer: &SessionDescription) -> Result<(), TransportError>;

    /// Wartet bis alle Candidates gesammelt sind oder `timeout` abläuft
    ///
    /// Gibt `true` zurück wenn das Gathering vollständig war.
    async fn gather_candidates_blocking(&self, timeout: Duration) -> bool;

    /// Local Description inklusive der bisher gesammelten Candidates
    async fn local_description(&self) -> Option<SessionDescription>;

    fn on_state_change(&self, handler: StateChangeHandler);

    fn on_remote_track(&self, handler: RemoteTrackHandler);

    async fn close(&self);
}
