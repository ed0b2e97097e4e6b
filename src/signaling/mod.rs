//! Signaling Module - Offer/Answer über den Call Record Store
//!
//! Dieses Modul verwaltet:
//! - Session Descriptions und ihr Format in der Datenbank
//! - Den Listener, der Push-Notifications und Polling zusammenführt
//! - Den Poll-Takt abhängig vom Anrufzustand

mod listener;
mod messages;

pub use listener::{PollControl, PollMode, SignalingListener};
pub use messages::{SdpKind, SessionDescription, SignalEvent, SignalSource};
