//! Test-Hilfen: Fakes für Store, Media Transport und Ton-Ausgabe

use crate::call_engine::{
    AudioConstraints, AudioError, AudioSourceInfo, CueOutput, CuePattern, LocalAudio,
    MediaConnectionState, MediaSession, MediaTransport, RemoteTrackHandler, RemoteTrackInfo,
    StateChangeHandler, TransportError,
};
use crate::config::IceServerConfig;
use crate::database::{
    CallRecord, CallStatus, CallStore, CallUpdate, ChangeFilter, NewCallRecord, StoreError,
    Subscription,
};
use crate::signaling::SessionDescription;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const FAKE_OFFER: &str =
    "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=candidate:1 1 udp 2130706431 192.0.2.10 50000 typ host\r\n";
pub const FAKE_ANSWER: &str =
    "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=candidate:1 1 udp 2130706431 192.0.2.20 50002 typ host\r\n";

/// Frischer `calling` Record von `drv-7` an die Zentrale
pub fn record(id: &str, status: CallStatus) -> CallRecord {
    CallRecord {
        id: id.to_string(),
        context_id: "route-1".to_string(),
        from_user: "drv-7".to_string(),
        to_user: "base".to_string(),
        status,
        offer: Some(SessionDescription::offer(FAKE_OFFER)),
        answer: None,
        created_at: Utc::now(),
    }
}

// ============================================================================
// STORES
// ============================================================================

/// Store ohne Push-Kanal, Änderungen kommen nur über Polling an
pub struct SilentStore {
    inner: Arc<dyn CallStore>,
}

impl SilentStore {
    pub fn new(inner: Arc<dyn CallStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl CallStore for SilentStore {
    async fn insert(&self, record: NewCallRecord) -> Result<CallRecord, StoreError> {
        self.inner.insert(record).await
    }

    async fn update(&self, id: &str, update: CallUpdate) -> Result<CallRecord, StoreError> {
        self.inner.update(id, update).await
    }

    async fn get(&self, id: &str) -> Result<Option<CallRecord>, StoreError> {
        self.inner.get(id).await
    }

    async fn find_recent(
        &self,
        to_user: &str,
        status: CallStatus,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CallRecord>, StoreError> {
        self.inner.find_recent(to_user, status, since, limit).await
    }

    fn subscribe(&self, filter: ChangeFilter) -> Subscription {
        Subscription::inert(filter)
    }
}

/// Store, der jeden Schreibzugriff ablehnt
pub struct FailingWrites {
    inner: Arc<dyn CallStore>,
}

impl FailingWrites {
    pub fn new(inner: Arc<dyn CallStore>) -> Self {
        Self { inner }
    }

    fn read_only() -> StoreError {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_READONLY),
            Some("attempt to write a readonly database".to_string()),
        ))
    }
}

#[async_trait]
impl CallStore for FailingWrites {
    async fn insert(&self, _record: NewCallRecord) -> Result<CallRecord, StoreError> {
        Err(Self::read_only())
    }

    async fn update(&self, _id: &str, _update: CallUpdate) -> Result<CallRecord, StoreError> {
        Err(Self::read_only())
    }

    async fn get(&self, id: &str) -> Result<Option<CallRecord>, StoreError> {
        self.inner.get(id).await
    }

    async fn find_recent(
        &self,
        to_user: &str,
        status: CallStatus,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CallRecord>, StoreError> {
        self.inner.find_recent(to_user, status, since, limit).await
    }

    fn subscribe(&self, filter: ChangeFilter) -> Subscription {
        self.inner.subscribe(filter)
    }
}

// ============================================================================
// MEDIA
// ============================================================================

/// Zählt, was der Controller mit dem Fake-Transport gemacht hat
#[derive(Default)]
pub struct MediaProbe {
    captures_started: AtomicUsize,
    captures_stopped: AtomicUsize,
    sessions_opened: AtomicUsize,
    sessions_closed: AtomicUsize,
    remote_answers: AtomicUsize,
    muted: AtomicBool,
    state_handler: Mutex<Option<StateChangeHandler>>,
    track_handler: Mutex<Option<RemoteTrackHandler>>,
}

impl MediaProbe {
    pub fn active_captures(&self) -> usize {
        self.captures_started.load(Ordering::SeqCst) - self.captures_stopped.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> usize {
        self.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions_opened() - self.sessions_closed.load(Ordering::SeqCst)
    }

    pub fn remote_answers(&self) -> usize {
        self.remote_answers.load(Ordering::SeqCst)
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Meldet einen Verbindungszustand der zuletzt geöffneten Session
    pub fn fire_state(&self, state: MediaConnectionState) {
        let handler = self.state_handler.lock().clone();
        if let Some(handler) = handler {
            handler(state);
        }
    }

    pub fn fire_track(&self, info: RemoteTrackInfo) {
        let handler = self.track_handler.lock().clone();
        if let Some(handler) = handler {
            handler(info);
        }
    }
}

pub struct FakeTransport {
    probe: Arc<MediaProbe>,
    deny_capture: AtomicBool,
    fail_negotiation: AtomicBool,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            probe: Arc::new(MediaProbe::default()),
            deny_capture: AtomicBool::new(false),
            fail_negotiation: AtomicBool::new(false),
        }
    }

    pub fn probe(&self) -> Arc<MediaProbe> {
        Arc::clone(&self.probe)
    }

    pub fn deny_capture(&self) {
        self.deny_capture.store(true, Ordering::SeqCst);
    }

    pub fn fail_negotiation(&self) {
        self.fail_negotiation.store(true, Ordering::SeqCst);
    }
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    async fn capture_local_audio(
        &self,
        _constraints: AudioConstraints,
    ) -> Result<Box<dyn LocalAudio>, TransportError> {
        if self.deny_capture.load(Ordering::SeqCst) {
            return Err(TransportError::Capture(AudioError::NoInputDevice));
        }
        self.probe.captures_started.fetch_add(1, Ordering::SeqCst);
        self.probe.muted.store(false, Ordering::SeqCst);
        Ok(Box::new(FakeAudio {
            probe: Arc::clone(&self.probe),
            active: true,
        }))
    }

    async fn open_session(
        &self,
        _ice_servers: &[IceServerConfig],
    ) -> Result<Box<dyn MediaSession>, TransportError> {
        self.probe.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            probe: Arc::clone(&self.probe),
            fail_negotiation: self.fail_negotiation.load(Ordering::SeqCst),
            local: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }
}

struct FakeAudio {
    probe: Arc<MediaProbe>,
    active: bool,
}

impl LocalAudio for FakeAudio {
    fn info(&self) -> AudioSourceInfo {
        AudioSourceInfo {
            sample_rate: 48000,
            channels: 1,
        }
    }

    fn set_muted(&self, muted: bool) {
        self.probe.muted.store(muted, Ordering::SeqCst);
    }

    fn is_muted(&self) -> bool {
        self.probe.is_muted()
    }

    fn level(&self) -> f32 {
        0.0
    }

    fn stop(&mut self) {
        if self.active {
            self.active = false;
            self.probe.captures_stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

struct FakeSession {
    probe: Arc<MediaProbe>,
    fail_negotiation: bool,
    local: Mutex<Option<SessionDescription>>,
    closed: AtomicBool,
}

impl FakeSession {
    fn check(&self) -> Result<(), TransportError> {
        if self.fail_negotiation {
            return Err(TransportError::WebRTC("negotiation failed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaSession for FakeSession {
    async fn attach_track(&self, _source: AudioSourceInfo) -> Result<(), TransportError> {
        Ok(())
    }

    async fn negotiate_offer(&self) -> Result<(), TransportError> {
        self.check()?;
        *self.local.lock() = Some(SessionDescription::offer(FAKE_OFFER));
        Ok(())
    }

    async fn negotiate_answer(
        &self,
        remote_offer: &SessionDescription,
    ) -> Result<(), TransportError> {
        self.check()?;
        if remote_offer.candidate_count() == 0 {
            return Err(TransportError::InvalidSdp("offer without candidates".to_string()));
        }
        *self.local.lock() = Some(SessionDescription::answer(FAKE_ANSWER));
        Ok(())
    }

    async fn set_remote_answer(&self, _answer: &SessionDescription) -> Result<(), TransportError> {
        self.probe.remote_answers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn gather_candidates_blocking(&self, _timeout: Duration) -> bool {
        true
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    fn on_state_change(&self, handler: StateChangeHandler) {
        *self.probe.state_handler.lock() = Some(handler);
    }

    fn on_remote_track(&self, handler: RemoteTrackHandler) {
        *self.probe.track_handler.lock() = Some(handler);
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.probe.sessions_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ============================================================================
// TONES
// ============================================================================

#[derive(Default)]
pub struct CountingCueOutput {
    plays: AtomicUsize,
    silences: AtomicUsize,
}

impl CountingCueOutput {
    pub fn plays(&self) -> usize {
        self.plays.load(Ordering::SeqCst)
    }

    pub fn silences(&self) -> usize {
        self.silences.load(Ordering::SeqCst)
    }
}

impl CueOutput for CountingCueOutput {
    fn play(&self, _pattern: &CuePattern) -> Result<(), AudioError> {
        self.plays.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn silence(&self) {
        self.silences.fetch_add(1, Ordering::SeqCst);
    }
}
