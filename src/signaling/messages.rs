//! Message Types für das Signaling über den Call Record Store
//!
//! Das Signaling besteht aus genau zwei Beschreibungen pro Anruf
//! (`offer` und `answer`), die als JSON-Blob in der `calls`-Tabelle
//! landen. Die ICE Candidates sind bereits im SDP enthalten.

use crate::database::CallRecord;
use serde::{Deserialize, Serialize};

// ============================================================================
// SESSION DESCRIPTION
// ============================================================================

/// Art einer Session Description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session Description wie sie im Store abgelegt wird: `{"type": "...", "sdp": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Anzahl der eingebetteten ICE Candidates (Vanilla ICE)
    pub fn candidate_count(&self) -> usize {
        self.sdp
            .lines()
            .filter(|line| line.starts_with("a=candidate:"))
            .count()
    }

    /// Serialisiert die Beschreibung für die Datenbank
    pub fn to_blob(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Liest eine Beschreibung aus der Datenbank
    pub fn from_blob(blob: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(blob)
    }
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Über welchen Kanal ein Event gekommen ist (nur für Logging)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalSource {
    Push,
    Poll,
}

/// Events die vom SignalingListener ausgelöst werden
#[derive(Debug, Clone)]
pub enum SignalEvent {
    /// Ein Call Record wurde eingefügt oder geändert
    Changed {
        source: SignalSource,
        record: CallRecord,
    },

    /// Ein beobachteter Call Record existiert nicht mehr
    Missing { record_id: String },
}
