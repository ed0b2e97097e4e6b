//! Change Notifications für die `calls`-Tabelle
//!
//! Jede Mutation im Store wird als [`ChangeEvent`] über einen
//! Broadcast-Channel verteilt. Eine [`Subscription`] filtert die Events
//! nach Empfänger, Absender oder Kontext und meldet sich beim Drop ab.

use super::calls::CallRecord;
use tokio::sync::broadcast;

/// Kapazität des Broadcast-Channels für Change Events
pub const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Art der Änderung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
}

/// Eine Änderung an einem Call Record (`{eventType, row}`)
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub record: CallRecord,
}

/// Filter für Subscriptions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeFilter {
    /// Alle Änderungen
    All,
    /// `to_user = id`
    Recipient(String),
    /// `from_user = id`
    Sender(String),
    /// `to_user = id OR from_user = id`
    Participant(String),
    /// `context_id = id`
    Context(String),
}

impl ChangeFilter {
    pub fn matches(&self, record: &CallRecord) -> bool {
        match self {
            ChangeFilter::All => true,
            ChangeFilter::Recipient(id) => record.to_user == *id,
            ChangeFilter::Sender(id) => record.from_user == *id,
            ChangeFilter::Participant(id) => record.to_user == *id || record.from_user == *id,
            ChangeFilter::Context(id) => record.context_id == *id,
        }
    }
}

/// Gefilterter Empfänger für Change Events
///
/// Verpasste Events (Lagged) werden nur geloggt: der Poll-Pfad des
/// Listeners holt den aktuellen Stand ohnehin nach.
pub struct Subscription {
    rx: Option<broadcast::Receiver<ChangeEvent>>,
    filter: ChangeFilter,
}

impl Subscription {
    pub fn new(rx: broadcast::Receiver<ChangeEvent>, filter: ChangeFilter) -> Self {
        Self {
            rx: Some(rx),
            filter,
        }
    }

    /// Subscription ohne Quelle, liefert nie ein Event
    ///
    /// Für Stores ohne Push-Kanal, dort bleibt nur das Polling.
    pub fn inert(filter: ChangeFilter) -> Self {
        Self { rx: None, filter }
    }

    pub fn filter(&self) -> &ChangeFilter {
        &self.filter
    }

    /// Wartet auf das nächste passende Event
    ///
    /// Gibt `None` zurück sobald der Store geschlossen wurde.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        let filter = &self.filter;
        let Some(rx) = self.rx.as_mut() else {
            return futures::future::pending().await;
        };

        loop {
            match rx.recv().await {
                Ok(event) if filter.matches(&event.record) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Change subscription lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("filter", &self.filter)
            .field("live", &self.rx.is_some())
            .finish()
    }
}
