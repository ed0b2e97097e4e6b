//! Call Session Controller
//!
//! Zustandsmaschine eines Endpunkts (Zentrale oder Fahrer):
//!
//! ```text
//! Idle -> Dialing  -> Connected -> Idle
//! Idle -> Incoming -> Connected -> Idle
//! Dialing | Incoming -> Idle        (Ablehnung, Timeout, Fehler)
//! ```
//!
//! Der Controller läuft als eigener Task. Benutzeraktionen kommen über den
//! [`CallHandle`], Signaling-Events vom Listener, Timer- und Media-Events
//! über einen internen Channel. Alles wird nacheinander abgearbeitet.
//!
//! Remote-Events sind level-triggered: entscheidend ist nur, ob sich der
//! `status` des Records gegenüber dem zuletzt bekannten Stand geändert hat.

use super::timers::{TimeoutSupervisor, TimerExpired, TimerKind};
use super::tones::{CueOutput, ToneCueGenerator};
use super::transport::{
    AudioConstraints, AudioSourceInfo, LocalAudio, MediaConnectionState, MediaSession,
    MediaTransport, RemoteTrackInfo, TransportError,
};
use crate::config::EndpointConfig;
use crate::database::{
    CallRecord, CallStatus, CallStore, CallUpdate, ChatLog, ChatMessage, NewCallRecord,
    StoreError,
};
use crate::signaling::{PollControl, PollMode, SessionDescription, SignalEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

// ============================================================================
// CONSTANTS
// ============================================================================

const EVENT_CHANNEL_CAPACITY: usize = 100;
const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// Anzahl beendeter Records, die nicht erneut klingeln dürfen
const FINISHED_MEMORY: usize = 16;

/// Chat-Zeilen
pub const LINE_CONNECTED: &str = "Call connected";
pub const LINE_MISSED_DIAL: &str = "Missed call (not answered)";
pub const LINE_MISSED_RING: &str = "Missed call (timeout)";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Microphone not available: {0}")]
    PermissionDenied(String),

    #[error("Failed to write call record: {0}")]
    SignalingWriteFailure(String),

    #[error("Media transport failed: {0}")]
    TransportFailure(String),

    #[error("Call record not found: {0}")]
    NotFound(String),

    #[error("Call was not answered in time")]
    Timeout,

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No incoming call")]
    NoIncomingCall,

    #[error("No active call")]
    NoActiveCall,

    #[error("Call endpoint is shut down")]
    EndpointClosed,
}

impl From<StoreError> for CallError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => CallError::NotFound(id),
            other => CallError::SignalingWriteFailure(other.to_string()),
        }
    }
}

impl From<TransportError> for CallError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Capture(audio) => CallError::PermissionDenied(audio.to_string()),
            other => CallError::TransportFailure(other.to_string()),
        }
    }
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Aktueller Status eines Endpunkts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// Kein Anruf
    Idle,
    /// Ausgehender Anruf, Gegenseite klingelt
    Dialing,
    /// Eingehender Anruf klingelt
    Incoming,
    /// Anruf aktiv
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Caller,
    Callee,
}

/// Warum ein Anruf beendet wurde
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    LocalHangup,
    LocalReject,
    RemoteEnded,
    RemoteRejected,
    /// Ein anderer Endpunkt mit derselben Identität hat angenommen
    AnsweredElsewhere,
    DialTimeout,
    RingTimeout,
    TransportFailure,
    SetupFailed,
    /// Der Record ist aus dem Store verschwunden
    RecordVanished,
}

impl EndReason {
    /// Fehler, der dem Benutzer angezeigt werden sollte
    pub fn error(&self) -> Option<CallError> {
        match self {
            EndReason::DialTimeout | EndReason::RingTimeout => Some(CallError::Timeout),
            EndReason::TransportFailure => Some(CallError::TransportFailure(
                "connection to peer lost".to_string(),
            )),
            EndReason::RecordVanished => Some(CallError::NotFound("active call".to_string())),
            _ => None,
        }
    }
}

/// Events die vom Controller ausgelöst werden
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallState),
    Incoming {
        record_id: String,
        context_id: String,
        from_user: String,
    },
    Connected {
        record_id: String,
    },
    Ended {
        record_id: Option<String>,
        reason: EndReason,
    },
    Warning(String),
    RemoteTrack(RemoteTrackInfo),
    MediaState(MediaConnectionState),
}

/// Beobachtbarer Zustand eines Endpunkts
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSnapshot {
    pub state: CallState,
    pub role: Option<CallRole>,
    pub record_id: Option<String>,
    pub context_id: Option<String>,
    pub peer_id: Option<String>,
    pub muted: bool,
    pub connected_at: Option<DateTime<Utc>>,
}

impl CallSnapshot {
    fn idle() -> Self {
        Self {
            state: CallState::Idle,
            role: None,
            record_id: None,
            context_id: None,
            peer_id: None,
            muted: false,
            connected_at: None,
        }
    }
}

// ============================================================================
// LOCAL SESSION
// ============================================================================

/// Alles was zu genau einem Anruf gehört
struct LocalSession {
    /// Zuordnung der Media-Events zur aktuellen Session
    seq: u64,
    role: CallRole,
    record_id: String,
    context_id: String,
    peer_id: String,
    known_status: CallStatus,
    remote_offer: Option<SessionDescription>,
    audio: Option<Box<dyn LocalAudio>>,
    media: Option<Box<dyn MediaSession>>,
    connected_at: Option<DateTime<Utc>>,
}

/// Mikrofon und Peer Session nach erfolgreicher Aushandlung
struct PreparedMedia {
    seq: u64,
    audio: Box<dyn LocalAudio>,
    media: Box<dyn MediaSession>,
    local: SessionDescription,
}

impl PreparedMedia {
    async fn release(self) {
        let PreparedMedia {
            mut audio, media, ..
        } = self;
        audio.stop();
        media.close().await;
    }
}

// ============================================================================
// CHANNEL MESSAGES
// ============================================================================

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

enum Command {
    Place {
        context_id: String,
        peer_id: String,
        reply: Reply<String>,
    },
    Accept {
        reply: Reply<()>,
    },
    Reject {
        reply: Reply<()>,
    },
    HangUp {
        reply: Reply<()>,
    },
    SetMuted {
        muted: bool,
        reply: Reply<()>,
    },
}

enum Internal {
    Timer(TimerExpired),
    MediaState {
        seq: u64,
        state: MediaConnectionState,
    },
    RemoteTrack {
        seq: u64,
        info: RemoteTrackInfo,
    },
}

// ============================================================================
// CALL CONTROLLER
// ============================================================================

pub struct CallController {
    config: EndpointConfig,
    store: Arc<dyn CallStore>,
    chat: Arc<dyn ChatLog>,
    transport: Arc<dyn MediaTransport>,
    tones: ToneCueGenerator,
    timers: TimeoutSupervisor,
    poll: PollControl,
    state: CallState,
    session: Option<LocalSession>,
    muted: bool,
    next_seq: u64,
    finished: VecDeque<String>,
    events: broadcast::Sender<CallEvent>,
    snapshot: watch::Sender<CallSnapshot>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
}

impl CallController {
    pub fn new(
        config: EndpointConfig,
        store: Arc<dyn CallStore>,
        chat: Arc<dyn ChatLog>,
        transport: Arc<dyn MediaTransport>,
        cue_output: Arc<dyn CueOutput>,
        poll: PollControl,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (snapshot, _) = watch::channel(CallSnapshot::idle());
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let timer_tx = internal_tx.clone();
        let timers = TimeoutSupervisor::new(Arc::new(move |expired| {
            let _ = timer_tx.send(Internal::Timer(expired));
        }));

        poll.set(PollMode::Inbox);

        Self {
            tones: ToneCueGenerator::new(cue_output, config.tone_cadence),
            config,
            store,
            chat,
            transport,
            timers,
            poll,
            state: CallState::Idle,
            session: None,
            muted: false,
            next_seq: 0,
            finished: VecDeque::with_capacity(FINISHED_MEMORY),
            events,
            snapshot,
            internal_tx,
            internal_rx,
        }
    }

    /// Startet den Controller-Task
    pub fn spawn(self, signals: mpsc::Receiver<SignalEvent>) -> CallHandle {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        let handle = CallHandle {
            commands: commands_tx,
            events: self.events.clone(),
            snapshot: self.snapshot.subscribe(),
        };

        tokio::spawn(self.run(commands_rx, signals));
        handle
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut signals: mpsc::Receiver<SignalEvent>,
    ) {
        tracing::info!(
            "Call controller started for '{}' ({:?})",
            self.config.identity.self_id,
            self.config.identity.role
        );

        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal).await,
                Some(signal) = signals.recv() => self.handle_signal(signal).await,
            }
        }

        if self.state != CallState::Idle {
            tracing::info!("Endpoint shutting down with an active call, hanging up");
            self.end_local(EndReason::LocalHangup).await;
        }
        tracing::info!("Call controller stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Place {
                context_id,
                peer_id,
                reply,
            } => {
                let _ = reply.send(self.place_call(context_id, peer_id).await);
            }
            Command::Accept { reply } => {
                let _ = reply.send(self.accept_call().await);
            }
            Command::Reject { reply } => {
                let _ = reply.send(self.reject_call(false).await);
            }
            Command::HangUp { reply } => {
                let _ = reply.send(self.hang_up().await);
            }
            Command::SetMuted { muted, reply } => {
                let _ = reply.send(self.set_muted(muted));
            }
        }
    }

    async fn handle_signal(&mut self, signal: SignalEvent) {
        match signal {
            SignalEvent::Changed { record, .. } => self.handle_remote_event(record).await,
            SignalEvent::Missing { record_id } => self.handle_missing(&record_id).await,
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Timer(expired) => self.handle_timer(expired).await,
            Internal::MediaState { seq, state } => self.handle_media_state(seq, state).await,
            Internal::RemoteTrack { seq, info } => {
                if self.is_current_media(seq) {
                    tracing::info!("Remote track {} ({})", info.track_id, info.codec);
                    self.emit(CallEvent::RemoteTrack(info));
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // USER INTENTS
    // ------------------------------------------------------------------------

    /// Startet einen ausgehenden Anruf, gibt die ID des neuen Records zurück
    pub async fn place_call(
        &mut self,
        context_id: String,
        peer_id: String,
    ) -> Result<String, CallError> {
        if self.state != CallState::Idle {
            tracing::warn!("Cannot place call to '{}' while {:?}", peer_id, self.state);
            return Err(CallError::AlreadyInCall);
        }

        tracing::info!("Placing call to '{}' (context {})", peer_id, context_id);

        let prepared = self.prepare_media(None).await?;

        let new_record = NewCallRecord {
            context_id: context_id.clone(),
            from_user: self.config.identity.self_id.clone(),
            to_user: peer_id.clone(),
            offer: prepared.local.clone(),
        };

        let record = match self.store.insert(new_record).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!("Failed to write call record: {}", e);
                prepared.release().await;
                return Err(CallError::SignalingWriteFailure(e.to_string()));
            }
        };

        self.session = Some(LocalSession {
            seq: prepared.seq,
            role: CallRole::Caller,
            record_id: record.id.clone(),
            context_id,
            peer_id,
            known_status: CallStatus::Calling,
            remote_offer: None,
            audio: Some(prepared.audio),
            media: Some(prepared.media),
            connected_at: None,
        });

        self.poll.set(PollMode::Watch {
            record_id: record.id.clone(),
        });
        self.timers.arm(TimerKind::Dial, self.config.dial_timeout);
        self.tones.start_ringback();
        self.set_state(CallState::Dialing);

        Ok(record.id)
    }

    /// Neuer `calling` Record an diesen Endpunkt
    ///
    /// Außerhalb von `Idle` wird der Anruf ignoriert (besetzt).
    pub fn handle_incoming_notification(&mut self, record: CallRecord) {
        if self.state != CallState::Idle {
            tracing::info!(
                "Busy ({:?}), ignoring incoming call {} from '{}'",
                self.state,
                record.id,
                record.from_user
            );
            return;
        }

        if self.finished.contains(&record.id) {
            tracing::debug!("Call {} already handled, not ringing again", record.id);
            return;
        }

        if record.is_stale(self.config.incoming_lookback, Utc::now()) {
            tracing::info!(
                "Ignoring stale call {} from '{}' (created {})",
                record.id,
                record.from_user,
                record.created_at
            );
            return;
        }

        let Some(offer) = record.offer.clone() else {
            tracing::warn!("Incoming call {} has no offer, ignoring", record.id);
            return;
        };

        tracing::info!(
            "Incoming call {} from '{}' (context {}, {} candidates)",
            record.id,
            record.from_user,
            record.context_id,
            offer.candidate_count()
        );

        self.session = Some(LocalSession {
            seq: 0,
            role: CallRole::Callee,
            record_id: record.id.clone(),
            context_id: record.context_id.clone(),
            peer_id: record.from_user.clone(),
            known_status: CallStatus::Calling,
            remote_offer: Some(offer),
            audio: None,
            media: None,
            connected_at: None,
        });

        self.poll.set(PollMode::Watch {
            record_id: record.id.clone(),
        });
        self.timers.arm(TimerKind::Ring, self.config.ring_timeout);
        self.tones.start_incoming_ring();
        self.set_state(CallState::Incoming);

        self.emit(CallEvent::Incoming {
            record_id: record.id,
            context_id: record.context_id,
            from_user: record.from_user,
        });
    }

    /// Nimmt den klingelnden Anruf an
    pub async fn accept_call(&mut self) -> Result<(), CallError> {
        let pending = match (&self.state, &self.session) {
            (CallState::Incoming, Some(session)) => session
                .remote_offer
                .clone()
                .map(|offer| (session.record_id.clone(), offer)),
            _ => None,
        };
        let Some((record_id, offer)) = pending else {
            return Err(CallError::NoIncomingCall);
        };

        tracing::info!("Accepting call {}", record_id);
        self.timers.disarm();
        self.tones.stop();

        let prepared = match self.prepare_media(Some(offer)).await {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::error!("Call setup failed: {}", e);
                // Anrufer soll nicht bis zum Timeout weiterklingeln
                write_status(&self.store, &record_id, CallStatus::Rejected).await;
                self.finish(EndReason::SetupFailed).await;
                return Err(e);
            }
        };

        let update = CallUpdate::answered(prepared.local.clone());
        match self.store.update(&record_id, update).await {
            Ok(_) => {}
            // Anrufer hat aufgelegt oder ein anderer Endpunkt war schneller
            Err(StoreError::StatusConflict { current, .. }) => {
                tracing::info!("Call {} is already {}, not answering", record_id, current);
                let reason = match current {
                    CallStatus::Answered => EndReason::AnsweredElsewhere,
                    CallStatus::Rejected => EndReason::RemoteRejected,
                    _ => EndReason::RemoteEnded,
                };
                prepared.release().await;
                self.finish(reason).await;
                return Err(CallError::NoIncomingCall);
            }
            Err(e) => {
                tracing::error!("Failed to write answer for call {}: {}", record_id, e);
                let reason = match e {
                    StoreError::NotFound(_) => EndReason::RecordVanished,
                    _ => EndReason::SetupFailed,
                };
                prepared.release().await;
                self.finish(reason).await;
                return Err(e.into());
            }
        }

        let Some(session) = self.session.as_mut() else {
            prepared.release().await;
            return Err(CallError::NoIncomingCall);
        };
        session.seq = prepared.seq;
        session.audio = Some(prepared.audio);
        session.media = Some(prepared.media);
        session.known_status = CallStatus::Answered;
        session.remote_offer = None;
        session.connected_at = Some(Utc::now());
        let context_id = session.context_id.clone();

        self.set_state(CallState::Connected);
        self.log_chat(&context_id, LINE_CONNECTED);
        self.emit(CallEvent::Connected { record_id });
        Ok(())
    }

    /// Lehnt den klingelnden Anruf ab
    ///
    /// `auto` kennzeichnet den Ring-Timeout, dann landet zusätzlich eine
    /// "verpasst"-Zeile im Chat.
    pub async fn reject_call(&mut self, auto: bool) -> Result<(), CallError> {
        let pending = match (&self.state, &self.session) {
            (CallState::Incoming, Some(session)) => {
                Some((session.record_id.clone(), session.context_id.clone()))
            }
            _ => None,
        };
        let Some((record_id, context_id)) = pending else {
            return Err(CallError::NoIncomingCall);
        };

        tracing::info!(
            "Rejecting call {}{}",
            record_id,
            if auto { " (ring timeout)" } else { "" }
        );

        write_status(&self.store, &record_id, CallStatus::Rejected).await;

        if auto {
            self.log_chat(&context_id, LINE_MISSED_RING);
            self.finish(EndReason::RingTimeout).await;
        } else {
            self.finish(EndReason::LocalReject).await;
        }
        Ok(())
    }

    /// Legt auf, im Leerlauf ein No-op
    pub async fn hang_up(&mut self) -> Result<(), CallError> {
        self.end_local(EndReason::LocalHangup).await;
        Ok(())
    }

    pub fn set_muted(&mut self, muted: bool) -> Result<(), CallError> {
        let audio = self
            .session
            .as_ref()
            .and_then(|session| session.audio.as_ref())
            .ok_or(CallError::NoActiveCall)?;
        audio.set_muted(muted);

        self.muted = muted;
        self.publish_snapshot();
        Ok(())
    }

    // ------------------------------------------------------------------------
    // REMOTE EVENTS
    // ------------------------------------------------------------------------

    /// Verarbeitet einen geänderten Record (Push oder Poll)
    pub async fn handle_remote_event(&mut self, record: CallRecord) {
        let known = self
            .session
            .as_ref()
            .filter(|session| session.record_id == record.id)
            .map(|session| session.known_status);

        let Some(known) = known else {
            if record.to_user == self.config.identity.self_id
                && record.status == CallStatus::Calling
            {
                self.handle_incoming_notification(record);
            } else {
                tracing::trace!("Ignoring update for unrelated call {}", record.id);
            }
            return;
        };

        if known == record.status {
            tracing::trace!("Call {} still {}, nothing to do", record.id, known);
            return;
        }

        tracing::info!(
            "Call {} changed remotely: {} -> {}",
            record.id,
            known,
            record.status
        );

        match (self.state, record.status) {
            (CallState::Dialing, CallStatus::Answered) => self.complete_outgoing(record).await,
            (CallState::Incoming, CallStatus::Answered) => {
                tracing::info!("Call {} was answered on another endpoint", record.id);
                self.finish(EndReason::AnsweredElsewhere).await;
            }
            (_, CallStatus::Rejected) => self.finish(EndReason::RemoteRejected).await,
            (_, CallStatus::Ended) => self.finish(EndReason::RemoteEnded).await,
            (_, status) => {
                if let Some(session) = self.session.as_mut() {
                    session.known_status = status;
                }
            }
        }
    }

    /// Der beobachtete Record existiert nicht mehr, wie `ended` behandeln
    pub async fn handle_missing(&mut self, record_id: &str) {
        let owned = self
            .session
            .as_ref()
            .is_some_and(|session| session.record_id == record_id);

        if owned {
            tracing::warn!("Call {} vanished from the store, ending", record_id);
            self.finish(EndReason::RecordVanished).await;
        }
    }

    async fn complete_outgoing(&mut self, record: CallRecord) {
        let Some(answer) = record.answer else {
            tracing::warn!("Call {} answered without an answer description", record.id);
            return;
        };

        if let Some(session) = self.session.as_mut() {
            session.known_status = CallStatus::Answered;
        }
        self.timers.disarm();
        self.tones.stop();

        let media = self.session.as_ref().and_then(|session| session.media.as_ref());
        let result = match media {
            Some(media) => media.set_remote_answer(&answer).await,
            None => Err(TransportError::WebRTC("no media session".to_string())),
        };

        if let Err(e) = result {
            tracing::error!("Failed to apply answer for call {}: {}", record.id, e);
            self.emit(CallEvent::Warning(format!("Call could not be connected: {}", e)));
            write_status(&self.store, &record.id, CallStatus::Ended).await;
            self.finish(EndReason::TransportFailure).await;
            return;
        }

        tracing::info!(
            "Call {} answered ({} remote candidates)",
            record.id,
            answer.candidate_count()
        );

        if let Some(session) = self.session.as_mut() {
            session.connected_at = Some(Utc::now());
        }
        self.set_state(CallState::Connected);
        self.emit(CallEvent::Connected {
            record_id: record.id,
        });
    }

    // ------------------------------------------------------------------------
    // TIMERS AND MEDIA
    // ------------------------------------------------------------------------

    async fn handle_timer(&mut self, expired: TimerExpired) {
        if !self.timers.accept(&expired) {
            tracing::trace!("Ignoring stale {:?} timer", expired.kind);
            return;
        }

        match (expired.kind, self.state) {
            (TimerKind::Dial, CallState::Dialing) => {
                tracing::info!("Call not answered within {:?}", self.config.dial_timeout);
                if let Some(context_id) = self.session.as_ref().map(|s| s.context_id.clone()) {
                    self.log_chat(&context_id, LINE_MISSED_DIAL);
                }
                self.end_local(EndReason::DialTimeout).await;
            }
            (TimerKind::Ring, CallState::Incoming) => {
                tracing::info!("Incoming call not accepted within {:?}", self.config.ring_timeout);
                if let Err(e) = self.reject_call(true).await {
                    tracing::debug!("Ring timeout without incoming call: {}", e);
                }
            }
            (kind, state) => {
                tracing::debug!("{:?} timer expired in state {:?}, ignoring", kind, state);
            }
        }
    }

    async fn handle_media_state(&mut self, seq: u64, state: MediaConnectionState) {
        if !self.is_current_media(seq) {
            return;
        }

        self.emit(CallEvent::MediaState(state));

        if state == MediaConnectionState::Failed && self.state == CallState::Connected {
            tracing::warn!("Media connection failed during call");
            self.emit(CallEvent::Warning(
                "Connection to the other party was lost".to_string(),
            ));
            if let Some(record_id) = self.session.as_ref().map(|s| s.record_id.clone()) {
                write_status(&self.store, &record_id, CallStatus::Ended).await;
            }
            self.finish(EndReason::TransportFailure).await;
        }
    }

    fn is_current_media(&self, seq: u64) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.seq == seq && session.media.is_some())
    }

    // ------------------------------------------------------------------------
    // MEDIA SETUP
    // ------------------------------------------------------------------------

    /// Mikrofon öffnen, Session aufbauen und die lokale Beschreibung erzeugen
    ///
    /// Bei einem Fehler ist alles bereits wieder freigegeben.
    async fn prepare_media(
        &mut self,
        remote_offer: Option<SessionDescription>,
    ) -> Result<PreparedMedia, CallError> {
        self.next_seq += 1;
        let seq = self.next_seq;

        let mut audio = self
            .transport
            .capture_local_audio(AudioConstraints::default())
            .await
            .map_err(|e| {
                tracing::warn!("Microphone capture failed: {}", e);
                CallError::PermissionDenied(e.to_string())
            })?;

        let media = match self.transport.open_session(&self.config.ice_servers).await {
            Ok(media) => media,
            Err(e) => {
                tracing::error!("Failed to open media session: {}", e);
                audio.stop();
                return Err(e.into());
            }
        };

        self.install_media_handlers(media.as_ref(), seq);

        let negotiated = negotiate(
            media.as_ref(),
            audio.info(),
            remote_offer.as_ref(),
            self.config.gather_timeout,
        )
        .await;

        match negotiated {
            Ok(local) => Ok(PreparedMedia {
                seq,
                audio,
                media,
                local,
            }),
            Err(e) => {
                tracing::error!("Negotiation failed: {}", e);
                audio.stop();
                media.close().await;
                Err(CallError::TransportFailure(e.to_string()))
            }
        }
    }

    fn install_media_handlers(&self, media: &dyn MediaSession, seq: u64) {
        let tx = self.internal_tx.clone();
        media.on_state_change(Arc::new(move |state| {
            let _ = tx.send(Internal::MediaState { seq, state });
        }));

        let tx = self.internal_tx.clone();
        media.on_remote_track(Arc::new(move |info| {
            let _ = tx.send(Internal::RemoteTrack { seq, info });
        }));
    }

    // ------------------------------------------------------------------------
    // CLEANUP
    // ------------------------------------------------------------------------

    /// Lokal ausgelöstes Ende: `ended` schreiben (best-effort), dann aufräumen
    async fn end_local(&mut self, reason: EndReason) {
        let Some(record_id) = self.session.as_ref().map(|s| s.record_id.clone()) else {
            tracing::debug!("Hang up while idle, nothing to do");
            return;
        };

        write_status(&self.store, &record_id, CallStatus::Ended).await;
        self.finish(reason).await;
    }

    /// Einziger Aufräumpfad für jedes Ende eines Anrufs
    async fn finish(&mut self, reason: EndReason) {
        self.timers.disarm();
        self.tones.stop();
        self.poll.set(PollMode::Inbox);

        let record_id = match self.session.take() {
            Some(mut session) => {
                if let Some(mut audio) = session.audio.take() {
                    audio.stop();
                }
                if let Some(media) = session.media.take() {
                    media.close().await;
                }
                self.remember_finished(&session.record_id);
                Some(session.record_id)
            }
            None => None,
        };

        self.muted = false;
        tracing::info!("Call {:?} ended: {:?}", record_id, reason);

        self.set_state(CallState::Idle);
        self.emit(CallEvent::Ended { record_id, reason });
    }

    fn remember_finished(&mut self, record_id: &str) {
        if self.finished.len() >= FINISHED_MEMORY {
            self.finished.pop_front();
        }
        self.finished.push_back(record_id.to_string());
    }

    // ------------------------------------------------------------------------
    // OUTPUT
    // ------------------------------------------------------------------------

    fn set_state(&mut self, state: CallState) {
        if self.state != state {
            tracing::info!("Call state: {:?} -> {:?}", self.state, state);
            self.state = state;
            self.emit(CallEvent::StateChanged(state));
        }
        self.publish_snapshot();
    }

    fn emit(&self, event: CallEvent) {
        // Ohne Subscriber schlägt send fehl, das ist kein Fehler
        let _ = self.events.send(event);
    }

    fn publish_snapshot(&self) {
        let session = self.session.as_ref();
        self.snapshot.send_replace(CallSnapshot {
            state: self.state,
            role: session.map(|s| s.role),
            record_id: session.map(|s| s.record_id.clone()),
            context_id: session.map(|s| s.context_id.clone()),
            peer_id: session.map(|s| s.peer_id.clone()),
            muted: self.muted,
            connected_at: session.and_then(|s| s.connected_at),
        });
    }

    /// Schreibt eine Zeile in den Chat der Route, ohne darauf zu warten
    fn log_chat(&self, context_id: &str, text: &str) {
        let chat = Arc::clone(&self.chat);
        let message = ChatMessage {
            context_id: context_id.to_string(),
            sender_tag: self.config.identity.role.sender_tag().to_string(),
            text: text.to_string(),
        };

        tokio::spawn(async move {
            if let Err(e) = chat.append(message).await {
                tracing::warn!("Failed to write chat line: {}", e);
            }
        });
    }
}

impl std::fmt::Debug for CallController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallController")
            .field("self_id", &self.config.identity.self_id)
            .field("state", &self.state)
            .field("record_id", &self.session.as_ref().map(|s| &s.record_id))
            .field("timers", &self.timers)
            .field("tones", &self.tones)
            .finish()
    }
}

async fn negotiate(
    media: &dyn MediaSession,
    source: AudioSourceInfo,
    remote_offer: Option<&SessionDescription>,
    gather_timeout: Duration,
) -> Result<SessionDescription, TransportError> {
    media.attach_track(source).await?;

    match remote_offer {
        Some(offer) => media.negotiate_answer(offer).await?,
        None => media.negotiate_offer().await?,
    }

    let complete = media.gather_candidates_blocking(gather_timeout).await;
    let local = media
        .local_description()
        .await
        .ok_or(TransportError::NoLocalDescription)?;

    tracing::debug!(
        "Local {:?} ready with {} candidates (gathering complete: {})",
        local.kind,
        local.candidate_count(),
        complete
    );
    Ok(local)
}

/// Best-effort Statusänderung, Fehler werden nur geloggt
async fn write_status(store: &Arc<dyn CallStore>, record_id: &str, status: CallStatus) {
    if let Err(e) = store.update(record_id, CallUpdate::status(status)).await {
        tracing::warn!("Failed to mark call {} as {}: {}", record_id, status, e);
    }
}

// ============================================================================
// CALL HANDLE
// ============================================================================

/// Zugriff auf einen laufenden Controller
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<CallEvent>,
    snapshot: watch::Receiver<CallSnapshot>,
}

impl CallHandle {
    pub async fn place_call(
        &self,
        context_id: impl Into<String>,
        peer_id: impl Into<String>,
    ) -> Result<String, CallError> {
        let context_id = context_id.into();
        let peer_id = peer_id.into();
        self.request(|reply| Command::Place {
            context_id,
            peer_id,
            reply,
        })
        .await
    }

    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Accept { reply }).await
    }

    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Reject { reply }).await
    }

    pub async fn hang_up(&self) -> Result<(), CallError> {
        self.request(|reply| Command::HangUp { reply }).await
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        self.request(|reply| Command::SetMuted { muted, reply }).await
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> CallState {
        self.snapshot.borrow().state
    }

    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// Wartet bis der Endpunkt `state` erreicht
    pub async fn wait_for_state(&self, state: CallState) -> Result<CallSnapshot, CallError> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|snapshot| snapshot.state == state)
            .await
            .map_err(|_| CallError::EndpointClosed)?;
        Ok(snapshot.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| CallError::EndpointClosed)?;
        rx.await.map_err(|_| CallError::EndpointClosed)?
    }
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("snapshot", &*self.snapshot.borrow())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{SqliteCallStore, SqliteChatLog};
    use crate::signaling::SignalingListener;
    use crate::testing::{
        record, CountingCueOutput, FailingWrites, FakeTransport, FAKE_ANSWER, FAKE_OFFER,
    };
    use chrono::Duration as ChronoDuration;

    struct Endpoint {
        handle: CallHandle,
        transport: Arc<FakeTransport>,
        _listener: SignalingListener,
    }

    fn start(config: EndpointConfig, store: Arc<dyn CallStore>, chat: Arc<dyn ChatLog>) -> Endpoint {
        start_with(config, store, chat, Arc::new(FakeTransport::new()))
    }

    fn start_with(
        config: EndpointConfig,
        store: Arc<dyn CallStore>,
        chat: Arc<dyn ChatLog>,
        transport: Arc<FakeTransport>,
    ) -> Endpoint {
        let poll = PollControl::default();
        let (tx, rx) = mpsc::channel(64);
        let listener = SignalingListener::spawn(Arc::clone(&store), &config, &poll, tx);
        let controller = CallController::new(
            config,
            store,
            chat,
            transport.clone(),
            Arc::new(CountingCueOutput::default()),
            poll,
        );
        Endpoint {
            handle: controller.spawn(rx),
            transport,
            _listener: listener,
        }
    }

    fn controller(store: Arc<dyn CallStore>) -> (CallController, Arc<FakeTransport>) {
        controller_with_chat(store, Arc::new(SqliteChatLog::open_in_memory().unwrap()))
    }

    fn controller_with_chat(
        store: Arc<dyn CallStore>,
        chat: Arc<dyn ChatLog>,
    ) -> (CallController, Arc<FakeTransport>) {
        let transport = Arc::new(FakeTransport::new());
        let controller = CallController::new(
            EndpointConfig::console(),
            store,
            chat,
            transport.clone(),
            Arc::new(CountingCueOutput::default()),
            PollControl::default(),
        );
        (controller, transport)
    }

    fn memory_store() -> Arc<SqliteCallStore> {
        Arc::new(SqliteCallStore::open_in_memory().unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_microphone_stays_idle() {
        let store = memory_store();
        let transport = Arc::new(FakeTransport::new());
        transport.deny_capture();
        let chat = Arc::new(SqliteChatLog::open_in_memory().unwrap());
        let console = start_with(EndpointConfig::console(), store.clone(), chat, transport);

        let result = console.handle.place_call("route-1", "drv-7").await;
        assert!(matches!(result, Err(CallError::PermissionDenied(_))));
        assert_eq!(console.handle.state(), CallState::Idle);
        assert_eq!(console.transport.probe().sessions_opened(), 0);

        let since = Utc::now() - ChronoDuration::seconds(60);
        let records = store
            .find_recent("drv-7", CallStatus::Calling, since, 5)
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_releases_media() {
        let store: Arc<dyn CallStore> = Arc::new(FailingWrites::new(memory_store()));
        let chat = Arc::new(SqliteChatLog::open_in_memory().unwrap());
        let console = start(EndpointConfig::console(), store, chat);

        let result = console.handle.place_call("route-1", "drv-7").await;
        assert!(matches!(result, Err(CallError::SignalingWriteFailure(_))));
        assert_eq!(console.handle.state(), CallState::Idle);

        let probe = console.transport.probe();
        assert_eq!(probe.active_captures(), 0);
        assert_eq!(probe.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_timeout_returns_to_idle() {
        let store = memory_store();
        let chat = Arc::new(SqliteChatLog::open_in_memory().unwrap());
        let console = start(EndpointConfig::console(), store.clone(), chat.clone());
        let mut events = console.handle.subscribe();

        let record_id = console.handle.place_call("route-1", "drv-7").await.unwrap();
        assert_eq!(console.handle.state(), CallState::Dialing);

        tokio::time::sleep(Duration::from_secs(44)).await;
        assert_eq!(console.handle.state(), CallState::Dialing);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(console.handle.state(), CallState::Idle);

        let stored = store.get(&record_id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Ended);
        assert_eq!(console.transport.probe().active_captures(), 0);

        let lines = chat.messages_for("route-1").unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, LINE_MISSED_DIAL);
        assert_eq!(lines[0].sender_tag, "base");

        let mut reasons = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let CallEvent::Ended { reason, .. } = event {
                reasons.push(reason);
            }
        }
        assert_eq!(reasons, vec![EndReason::DialTimeout]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_up_from_every_state() {
        let store = memory_store();
        let chat = Arc::new(SqliteChatLog::open_in_memory().unwrap());
        let console = start(EndpointConfig::console(), store.clone(), chat.clone());
        let driver = start(EndpointConfig::driver("drv-7"), store.clone(), chat);

        // Idle
        console.handle.hang_up().await.unwrap();
        assert_eq!(console.handle.state(), CallState::Idle);

        // Dialing / Incoming
        let first = console.handle.place_call("route-1", "drv-7").await.unwrap();
        driver.handle.wait_for_state(CallState::Incoming).await.unwrap();
        driver.handle.hang_up().await.unwrap();
        assert_eq!(driver.handle.state(), CallState::Idle);
        console.handle.wait_for_state(CallState::Idle).await.unwrap();
        assert_eq!(
            store.get(&first).await.unwrap().unwrap().status,
            CallStatus::Ended
        );

        // Connected
        console.handle.place_call("route-1", "drv-7").await.unwrap();
        driver.handle.wait_for_state(CallState::Incoming).await.unwrap();
        driver.handle.accept_call().await.unwrap();
        console.handle.wait_for_state(CallState::Connected).await.unwrap();
        console.handle.hang_up().await.unwrap();
        driver.handle.wait_for_state(CallState::Idle).await.unwrap();

        for endpoint in [&console, &driver] {
            let probe = endpoint.transport.probe();
            assert_eq!(endpoint.handle.state(), CallState::Idle);
            assert_eq!(probe.active_captures(), 0);
            assert_eq!(probe.open_sessions(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_answers_connect_once() {
        let store = memory_store();
        let chat = Arc::new(SqliteChatLog::open_in_memory().unwrap());
        let console = start(EndpointConfig::console(), store.clone(), chat.clone());
        let driver = start(EndpointConfig::driver("drv-7"), store.clone(), chat.clone());
        let mut events = console.handle.subscribe();

        console.handle.place_call("route-1", "drv-7").await.unwrap();
        driver.handle.wait_for_state(CallState::Incoming).await.unwrap();
        driver.handle.accept_call().await.unwrap();

        // Push liefert sofort, der Watch-Poll alle 1.5s denselben Stand
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(console.handle.state(), CallState::Connected);
        assert_eq!(console.transport.probe().remote_answers(), 1);

        let mut connected = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, CallEvent::Connected { .. }) {
                connected += 1;
            }
        }
        assert_eq!(connected, 1);

        let lines = chat.messages_for("route-1").unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, LINE_CONNECTED);
        assert_eq!(lines[0].sender_tag, "driver");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ring_timeout_rejects_and_logs() {
        let store = memory_store();
        let chat = Arc::new(SqliteChatLog::open_in_memory().unwrap());
        let console = start(EndpointConfig::console(), store.clone(), chat.clone());
        let mut driver_config = EndpointConfig::driver("drv-7");
        driver_config.ring_timeout = Duration::from_secs(30);
        let driver = start(driver_config, store.clone(), chat.clone());
        let mut console_events = console.handle.subscribe();

        let record_id = console.handle.place_call("route-1", "drv-7").await.unwrap();
        driver.handle.wait_for_state(CallState::Incoming).await.unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(driver.handle.state(), CallState::Idle);
        assert_eq!(console.handle.state(), CallState::Idle);
        assert_eq!(
            store.get(&record_id).await.unwrap().unwrap().status,
            CallStatus::Rejected
        );

        let lines = chat.messages_for("route-1").unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, LINE_MISSED_RING);
        assert_eq!(lines[0].sender_tag, "driver");

        let mut reasons = Vec::new();
        while let Ok(event) = console_events.try_recv() {
            if let CallEvent::Ended { reason, .. } = event {
                reasons.push(reason);
            }
        }
        assert_eq!(reasons, vec![EndReason::RemoteRejected]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_failure_rejects_record() {
        let store = memory_store();
        let chat = Arc::new(SqliteChatLog::open_in_memory().unwrap());
        let console = start(EndpointConfig::console(), store.clone(), chat.clone());
        let transport = Arc::new(FakeTransport::new());
        transport.fail_negotiation();
        let driver = start_with(EndpointConfig::driver("drv-7"), store.clone(), chat, transport);

        let record_id = console.handle.place_call("route-1", "drv-7").await.unwrap();
        driver.handle.wait_for_state(CallState::Incoming).await.unwrap();

        let result = driver.handle.accept_call().await;
        assert!(matches!(result, Err(CallError::TransportFailure(_))));
        assert_eq!(driver.handle.state(), CallState::Idle);
        assert_eq!(driver.transport.probe().active_captures(), 0);
        assert_eq!(driver.transport.probe().open_sessions(), 0);

        console.handle.wait_for_state(CallState::Idle).await.unwrap();
        assert_eq!(
            store.get(&record_id).await.unwrap().unwrap().status,
            CallStatus::Rejected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_while_connected() {
        let store = memory_store();
        let chat = Arc::new(SqliteChatLog::open_in_memory().unwrap());
        let console = start(EndpointConfig::console(), store.clone(), chat.clone());
        let driver = start(EndpointConfig::driver("drv-7"), store.clone(), chat);
        let mut events = console.handle.subscribe();

        let record_id = console.handle.place_call("route-1", "drv-7").await.unwrap();
        driver.handle.wait_for_state(CallState::Incoming).await.unwrap();
        driver.handle.accept_call().await.unwrap();
        console.handle.wait_for_state(CallState::Connected).await.unwrap();

        console.transport.probe().fire_state(MediaConnectionState::Failed);
        console.handle.wait_for_state(CallState::Idle).await.unwrap();
        driver.handle.wait_for_state(CallState::Idle).await.unwrap();

        assert_eq!(
            store.get(&record_id).await.unwrap().unwrap().status,
            CallStatus::Ended
        );

        let mut warned = false;
        let mut reason = None;
        while let Ok(event) = events.try_recv() {
            match event {
                CallEvent::Warning(_) => warned = true,
                CallEvent::Ended { reason: r, .. } => reason = Some(r),
                _ => {}
            }
        }
        assert!(warned);
        assert_eq!(reason, Some(EndReason::TransportFailure));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_track_is_reported() {
        let store = memory_store();
        let chat = Arc::new(SqliteChatLog::open_in_memory().unwrap());
        let console = start(EndpointConfig::console(), store, chat);
        let mut events = console.handle.subscribe();

        console.handle.place_call("route-1", "drv-7").await.unwrap();
        console.transport.probe().fire_track(RemoteTrackInfo {
            track_id: "audio".to_string(),
            codec: "audio/opus".to_string(),
        });

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        let mut reported = None;
        while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
            if let CallEvent::RemoteTrack(info) = event {
                reported = Some(info);
                break;
            }
        }
        assert_eq!(reported.map(|info| info.codec), Some("audio/opus".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mute_follows_capture_and_resets() {
        let store = memory_store();
        let chat = Arc::new(SqliteChatLog::open_in_memory().unwrap());
        let console = start(EndpointConfig::console(), store, chat);

        assert_eq!(
            console.handle.set_muted(true).await,
            Err(CallError::NoActiveCall)
        );

        console.handle.place_call("route-1", "drv-7").await.unwrap();
        console.handle.set_muted(true).await.unwrap();
        assert!(console.handle.snapshot().muted);
        assert!(console.transport.probe().is_muted());

        console.handle.hang_up().await.unwrap();
        assert!(!console.handle.snapshot().muted);
    }

    #[tokio::test]
    async fn test_stale_notification_is_ignored() {
        let (mut controller, _) = controller(memory_store());

        let mut old = record("c1", CallStatus::Calling);
        old.created_at = Utc::now() - ChronoDuration::seconds(90);
        controller.handle_incoming_notification(old);
        assert_eq!(controller.state(), CallState::Idle);

        controller.handle_incoming_notification(record("c2", CallStatus::Calling));
        assert_eq!(controller.state(), CallState::Incoming);
        assert_eq!(controller.snapshot().peer_id.as_deref(), Some("drv-7"));
    }

    #[tokio::test]
    async fn test_busy_notification_is_ignored() {
        let (mut controller, _) = controller(memory_store());

        controller.handle_incoming_notification(record("c1", CallStatus::Calling));
        let before = controller.snapshot();

        controller.handle_incoming_notification(record("c2", CallStatus::Calling));
        assert_eq!(controller.snapshot(), before);
        assert_eq!(controller.snapshot().record_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_missing_record_ends_call() {
        let (mut controller, transport) = controller(memory_store());

        let record_id = controller
            .place_call("route-1".to_string(), "drv-7".to_string())
            .await
            .unwrap();
        assert_eq!(controller.state(), CallState::Dialing);

        controller.handle_missing("unrelated").await;
        assert_eq!(controller.state(), CallState::Dialing);

        controller.handle_missing(&record_id).await;
        assert_eq!(controller.state(), CallState::Idle);
        assert_eq!(transport.probe().active_captures(), 0);
        assert_eq!(transport.probe().open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_repeated_answer_event_connects_once() {
        let store = memory_store();
        let (mut controller, transport) = controller(store.clone());
        let mut events = controller.subscribe();

        let record_id = controller
            .place_call("route-1".to_string(), "drv-7".to_string())
            .await
            .unwrap();
        let answered = store
            .update(&record_id, CallUpdate::answered(SessionDescription::answer(FAKE_ANSWER)))
            .await
            .unwrap();

        // Push und Poll liefern denselben Stand
        controller.handle_remote_event(answered.clone()).await;
        controller.handle_remote_event(answered).await;

        assert_eq!(controller.state(), CallState::Connected);
        assert_eq!(transport.probe().remote_answers(), 1);

        let mut connected = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, CallEvent::Connected { .. }) {
                connected += 1;
            }
        }
        assert_eq!(connected, 1);
    }

    #[tokio::test]
    async fn test_accept_after_caller_hung_up_keeps_call_ended() {
        let store = memory_store();
        let chat = Arc::new(SqliteChatLog::open_in_memory().unwrap());
        let (mut controller, transport) = controller_with_chat(store.clone(), chat.clone());
        let mut events = controller.subscribe();

        let incoming = store
            .insert(NewCallRecord {
                context_id: "route-1".to_string(),
                from_user: "drv-7".to_string(),
                to_user: "base".to_string(),
                offer: SessionDescription::offer(FAKE_OFFER),
            })
            .await
            .unwrap();
        controller.handle_incoming_notification(incoming.clone());
        assert_eq!(controller.state(), CallState::Incoming);

        // Anrufer legt auf, bevor die Annahme geschrieben ist
        store
            .update(&incoming.id, CallUpdate::status(CallStatus::Ended))
            .await
            .unwrap();

        let result = controller.accept_call().await;
        assert_eq!(result, Err(CallError::NoIncomingCall));
        assert_eq!(controller.state(), CallState::Idle);
        assert_eq!(transport.probe().active_captures(), 0);
        assert_eq!(transport.probe().open_sessions(), 0);

        let stored = store.get(&incoming.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Ended);
        assert!(stored.answer.is_none());
        assert!(chat.messages_for("route-1").unwrap().is_empty());

        let mut reasons = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                CallEvent::Connected { .. } => panic!("ended call must not connect"),
                CallEvent::Ended { reason, .. } => reasons.push(reason),
                _ => {}
            }
        }
        assert_eq!(reasons, vec![EndReason::RemoteEnded]);
    }

    #[tokio::test]
    async fn test_finished_call_does_not_ring_again() {
        let (mut controller, _) = controller(memory_store());

        let incoming = record("c1", CallStatus::Calling);
        controller.handle_incoming_notification(incoming.clone());
        controller.reject_call(false).await.unwrap();
        assert_eq!(controller.state(), CallState::Idle);

        // Schreiben des Status ist fehlgeschlagen (Record existiert nicht),
        // der Inbox-Scan liefert ihn weiter als `calling`
        controller.handle_remote_event(incoming).await;
        assert_eq!(controller.state(), CallState::Idle);

        // Ein älterer Anruf aus demselben Scan klingelt trotzdem
        let mut older = record("c0", CallStatus::Calling);
        older.created_at = Utc::now() - ChronoDuration::seconds(10);
        controller.handle_remote_event(older).await;
        assert_eq!(controller.state(), CallState::Incoming);
        assert_eq!(controller.snapshot().record_id.as_deref(), Some("c0"));
    }

    #[tokio::test]
    async fn test_errors_map_to_taxonomy() {
        assert_eq!(
            CallError::from(StoreError::NotFound("c1".to_string())),
            CallError::NotFound("c1".to_string())
        );
        assert!(matches!(
            CallError::from(TransportError::Capture(
                crate::call_engine::AudioError::NoInputDevice
            )),
            CallError::PermissionDenied(_)
        ));
        assert_eq!(EndReason::DialTimeout.error(), Some(CallError::Timeout));
        assert_eq!(EndReason::LocalHangup.error(), None);
    }
}
