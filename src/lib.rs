//! Fleet Call - Sprachanrufe zwischen Zentrale und Fahrern
//!
//! Signaling-Kern für Anrufe zwischen einer Dispositions-Zentrale ("base")
//! und Fahrern im Feld:
//! - Call Records in einer gemeinsamen SQLite-Datenbank als Signaling-Kanal
//! - Push-Notifications mit Polling als Fallback
//! - WebRTC für P2P Audio, Vanilla ICE
//! - Zustandsmaschine mit Wähl- und Klingel-Timeouts

pub mod call_engine;
pub mod config;
pub mod database;
pub mod signaling;

#[cfg(test)]
mod testing;

use call_engine::{CallController, CallHandle, CueOutput, MediaTransport};
use config::EndpointConfig;
use database::{CallStore, ChatLog};
use signaling::{PollControl, PollMode, SignalingListener};
use std::sync::Arc;
use tokio::sync::mpsc;

pub use call_engine::{CallError, CallEvent, CallSnapshot, CallState};

/// Puffer zwischen Listener und Controller
const SIGNAL_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// LOGGING
// ============================================================================

/// Installiert den globalen tracing Subscriber
///
/// `RUST_LOG` wird berücksichtigt, zusätzlich gelten die Standard-Direktiven
/// für dieses Crate und webrtc.
pub fn init_logging() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("fleet_call_lib=debug".parse()?)
        .add_directive("fleet_call=debug".parse()?)
        .add_directive("webrtc=warn".parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install logger: {}", e))?;

    Ok(())
}

// ============================================================================
// ENDPOINT
// ============================================================================

/// Ein laufender Endpunkt: Controller und Signaling Listener
pub struct Endpoint {
    config: EndpointConfig,
    handle: CallHandle,
    poll: PollControl,
    listener: SignalingListener,
}

impl Endpoint {
    /// Startet Listener und Controller, muss innerhalb einer Tokio Runtime laufen
    pub fn start(
        config: EndpointConfig,
        store: Arc<dyn CallStore>,
        chat: Arc<dyn ChatLog>,
        transport: Arc<dyn MediaTransport>,
        cue_output: Arc<dyn CueOutput>,
    ) -> Self {
        tracing::info!(
            "Starting endpoint '{}' as {:?}",
            config.identity.self_id,
            config.identity.role
        );

        let poll = PollControl::new(PollMode::Inbox);
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
        let listener = SignalingListener::spawn(Arc::clone(&store), &config, &poll, signal_tx);

        let controller = CallController::new(
            config.clone(),
            store,
            chat,
            transport,
            cue_output,
            poll.clone(),
        );
        let handle = controller.spawn(signal_rx);

        Self {
            config,
            handle,
            poll,
            listener,
        }
    }

    pub fn handle(&self) -> &CallHandle {
        &self.handle
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Was der Poll-Pfad gerade abfragt
    pub fn poll_mode(&self) -> PollMode {
        self.poll.current()
    }

    /// Legt einen laufenden Anruf auf und beendet den Listener
    pub async fn shutdown(self) {
        if let Err(e) = self.handle.hang_up().await {
            tracing::warn!("Hang up during shutdown failed: {}", e);
        }
        self.listener.stop();
        tracing::info!("Endpoint '{}' stopped", self.config.identity.self_id);
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("self_id", &self.config.identity.self_id)
            .field("handle", &self.handle)
            .field("listener", &self.listener)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
