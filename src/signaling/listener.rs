//! Signaling Listener
//!
//! Führt die beiden Signaling-Kanäle zu einem Event-Stream zusammen:
//! - Push: Live-Subscription auf den Call Record Store
//! - Poll: periodische Abfragen, deren Takt vom Controller über
//!   [`PollControl`] gesetzt wird
//!
//! Beide Kanäle liefern dieselben [`SignalEvent`]s. Exakte Wiederholungen
//! werden verworfen, alles andere entscheidet der Controller anhand des
//! Status (level-triggered).

use super::messages::{SignalEvent, SignalSource};
use crate::config::EndpointConfig;
use crate::database::{CallStatus, CallStore, ChangeFilter, Subscription};
use chrono::Utc;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Obergrenze für den Dedup-Speicher
const DEDUP_CAPACITY: usize = 64;

/// Records pro Inbox-Scan, neueste zuerst
///
/// Mehr als einer, damit ein hängengebliebener Record (schon abgelehnt,
/// Schreiben fehlgeschlagen) ältere Anrufe nicht verdeckt.
const INBOX_SCAN_LIMIT: usize = 5;

// ============================================================================
// POLL MODE
// ============================================================================

/// Was der Poll-Pfad gerade abfragt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollMode {
    /// Kein Polling
    Paused,
    /// Langsamer Scan nach eingehenden Anrufen (`to_user = self`, `calling`)
    Inbox,
    /// Schneller Point Read des aktiven Records
    Watch { record_id: String },
}

/// Steuerung des Poll-Takts
///
/// Jeder Aufruf von [`PollControl::set`] startet den Timer neu, auch wenn
/// sich der Modus nicht ändert.
#[derive(Debug, Clone)]
pub struct PollControl {
    tx: Arc<watch::Sender<PollMode>>,
}

impl PollControl {
    pub fn new(initial: PollMode) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self, mode: PollMode) {
        tracing::trace!("Poll mode -> {:?}", mode);
        self.tx.send_replace(mode);
    }

    pub fn current(&self) -> PollMode {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PollMode> {
        self.tx.subscribe()
    }
}

impl Default for PollControl {
    fn default() -> Self {
        Self::new(PollMode::Inbox)
    }
}

// ============================================================================
// SIGNALING LISTENER
// ============================================================================

/// Läuft als eigener Task und schreibt in den Event-Channel des Controllers
///
/// Beim Drop werden Task und Subscription beendet.
pub struct SignalingListener {
    task: JoinHandle<()>,
}

impl SignalingListener {
    /// Startet Push- und Poll-Pfad für `config.identity.self_id`
    pub fn spawn(
        store: Arc<dyn CallStore>,
        config: &EndpointConfig,
        control: &PollControl,
        out: mpsc::Sender<SignalEvent>,
    ) -> Self {
        let self_id = config.identity.self_id.clone();
        let subscription = store.subscribe(ChangeFilter::Participant(self_id.clone()));

        let poller = Poller {
            store,
            self_id: self_id.clone(),
            idle_interval: config.idle_poll_interval,
            active_interval: config.active_poll_interval,
            lookback: config.incoming_lookback,
            mode: control.subscribe(),
        };

        let transitions = control.subscribe();

        tracing::info!(
            "Signaling listener started for '{}' (idle scan {:?}, active poll {:?})",
            self_id,
            config.idle_poll_interval,
            config.active_poll_interval
        );

        let task = tokio::spawn(run_listener(
            push_stream(subscription),
            poll_stream(poller),
            transitions,
            out,
        ));

        Self { task }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Beendet den Listener und meldet die Subscription ab
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for SignalingListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for SignalingListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingListener")
            .field("running", &self.is_running())
            .finish()
    }
}

async fn run_listener(
    push: impl Stream<Item = SignalEvent> + Send,
    poll: impl Stream<Item = SignalEvent> + Send,
    mut transitions: watch::Receiver<PollMode>,
    out: mpsc::Sender<SignalEvent>,
) {
    let mut merged = std::pin::pin!(futures::stream::select(push, poll));
    let mut dedup = Dedup::default();

    while let Some(event) = merged.next().await {
        // Nach jedem Zustandswechsel darf alles wieder einmal durch
        if transitions.has_changed().unwrap_or(false) {
            transitions.borrow_and_update();
            dedup.clear();
        }

        if !dedup.admit(&event) {
            continue;
        }

        if let SignalEvent::Changed { source, record } = &event {
            tracing::debug!(
                "Signal via {:?}: call {} is {}",
                source,
                record.id,
                record.status
            );
        }

        if out.send(event).await.is_err() {
            tracing::debug!("Signal receiver dropped, stopping listener");
            break;
        }
    }
}

// ============================================================================
// PUSH PATH
// ============================================================================

fn push_stream(subscription: Subscription) -> impl Stream<Item = SignalEvent> + Send {
    futures::stream::unfold(subscription, |mut subscription| async move {
        let change = subscription.next().await?;
        let event = SignalEvent::Changed {
            source: SignalSource::Push,
            record: change.record,
        };
        Some((event, subscription))
    })
}

// ============================================================================
// POLL PATH
// ============================================================================

struct Poller {
    store: Arc<dyn CallStore>,
    self_id: String,
    idle_interval: Duration,
    active_interval: Duration,
    lookback: Duration,
    mode: watch::Receiver<PollMode>,
}

impl Poller {
    /// Wartet bis eine Abfrage Ergebnisse liefert
    ///
    /// Ein Moduswechsel bricht das Warten ab und startet den Timer neu.
    async fn next_batch(&mut self) -> Option<Vec<SignalEvent>> {
        loop {
            let mode = self.mode.borrow_and_update().clone();

            let interval = match mode {
                PollMode::Paused => None,
                PollMode::Inbox => Some(self.idle_interval),
                PollMode::Watch { .. } => Some(self.active_interval),
            };

            let Some(interval) = interval else {
                self.mode.changed().await.ok()?;
                continue;
            };

            tokio::select! {
                changed = self.mode.changed() => {
                    changed.ok()?;
                }
                _ = tokio::time::sleep(interval) => {
                    let batch = self.poll_once(&mode).await;
                    if !batch.is_empty() {
                        return Some(batch);
                    }
                }
            }
        }
    }

    async fn poll_once(&self, mode: &PollMode) -> Vec<SignalEvent> {
        match mode {
            PollMode::Paused => Vec::new(),
            PollMode::Inbox => {
                let lookback = chrono::Duration::from_std(self.lookback)
                    .unwrap_or_else(|_| chrono::Duration::seconds(45));
                let since = Utc::now() - lookback;

                match self
                    .store
                    .find_recent(&self.self_id, CallStatus::Calling, since, INBOX_SCAN_LIMIT)
                    .await
                {
                    Ok(records) => records
                        .into_iter()
                        .map(|record| SignalEvent::Changed {
                            source: SignalSource::Poll,
                            record,
                        })
                        .collect(),
                    Err(e) => {
                        tracing::warn!("Inbox poll failed: {}", e);
                        Vec::new()
                    }
                }
            }
            PollMode::Watch { record_id } => match self.store.get(record_id).await {
                Ok(Some(record)) => vec![SignalEvent::Changed {
                    source: SignalSource::Poll,
                    record,
                }],
                Ok(None) => {
                    tracing::warn!("Polling: call {} not found", record_id);
                    vec![SignalEvent::Missing {
                        record_id: record_id.clone(),
                    }]
                }
                Err(e) => {
                    tracing::warn!("Polling call {} failed: {}", record_id, e);
                    Vec::new()
                }
            },
        }
    }
}

fn poll_stream(poller: Poller) -> impl Stream<Item = SignalEvent> + Send {
    futures::stream::unfold(poller, |mut poller| async move {
        let batch = poller.next_batch().await?;
        Some((futures::stream::iter(batch), poller))
    })
    .flatten()
}

// ============================================================================
// DEDUP
// ============================================================================

/// Merkt sich den zuletzt weitergereichten Stand pro Record
#[derive(Debug, Default)]
struct Dedup {
    seen: HashMap<String, (CallStatus, bool)>,
}

impl Dedup {
    fn admit(&mut self, event: &SignalEvent) -> bool {
        match event {
            SignalEvent::Changed { record, .. } => {
                let key = (record.status, record.answer.is_some());
                if self.seen.get(&record.id) == Some(&key) {
                    return false;
                }
                if self.seen.len() >= DEDUP_CAPACITY {
                    self.seen.clear();
                }
                self.seen.insert(record.id.clone(), key);
                true
            }
            SignalEvent::Missing { record_id } => {
                self.seen.remove(record_id);
                true
            }
        }
    }

    fn clear(&mut self) {
        self.seen.clear();
    }
}

// ============================================================================
// TESTS
// ============================================================================
