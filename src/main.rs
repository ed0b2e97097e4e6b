//! Headless Endpoint
//!
//! Startet einen Endpunkt (Zentrale oder Fahrer) gegen eine gemeinsame
//! SQLite-Datei und liest Befehle von stdin. Laufen zwei Endpunkte in
//! verschiedenen Prozessen, kommen Änderungen nur über Polling an.
//!
//! Konfiguration über `FLEETCALL_*` Umgebungsvariablen, Datenbank über
//! `FLEETCALL_DB`.

use anyhow::Context;
use fleet_call_lib::call_engine::{CallEvent, CpalCueOutput, WebRtcTransport};
use fleet_call_lib::config::EndpointConfig;
use fleet_call_lib::database::{SqliteCallStore, SqliteChatLog};
use fleet_call_lib::Endpoint;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

const HELP: &str = "Commands: call <context> <peer> | accept | reject | hangup | mute | unmute | state | quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fleet_call_lib::init_logging()?;

    let config = EndpointConfig::from_env().context("Invalid endpoint configuration")?;

    let db_path = match std::env::var("FLEETCALL_DB") {
        Ok(path) => PathBuf::from(path),
        Err(_) => SqliteCallStore::default_path()?,
    };

    let store = Arc::new(SqliteCallStore::open(&db_path).context("Failed to open call store")?);
    let chat = Arc::new(SqliteChatLog::open(&db_path).context("Failed to open chat log")?);

    let endpoint = Endpoint::start(
        config,
        store,
        chat,
        Arc::new(WebRtcTransport::new()),
        Arc::new(CpalCueOutput::new()),
    );

    let mut events = endpoint.handle().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    println!(
        "Endpoint '{}' ready. {}",
        endpoint.config().identity.self_id,
        HELP
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let words: Vec<&str> = line.split_whitespace().collect();
        let handle = endpoint.handle();

        let result = match words.as_slice() {
            [] => continue,
            ["call", context_id, peer_id] => handle
                .place_call(*context_id, *peer_id)
                .await
                .map(|id| println!("Calling {} (record {})", peer_id, id)),
            ["accept"] => handle.accept_call().await,
            ["reject"] => handle.reject_call().await,
            ["hangup"] => handle.hang_up().await,
            ["mute"] => handle.set_muted(true).await,
            ["unmute"] => handle.set_muted(false).await,
            ["state"] => {
                println!("{}", serde_json::to_string_pretty(&handle.snapshot())?);
                Ok(())
            }
            ["quit"] | ["exit"] => break,
            _ => {
                println!("{}", HELP);
                Ok(())
            }
        };

        if let Err(e) = result {
            println!("Error: {}", e);
        }
    }

    endpoint.shutdown().await;
    Ok(())
}

fn print_event(event: &CallEvent) {
    match event {
        CallEvent::StateChanged(state) => println!("State: {:?}", state),
        CallEvent::Incoming {
            context_id,
            from_user,
            ..
        } => println!("Incoming call from {} (context {}), type 'accept'", from_user, context_id),
        CallEvent::Connected { .. } => println!("Connected"),
        CallEvent::Ended { reason, .. } => match reason.error() {
            Some(e) => println!("Call ended: {:?} ({})", reason, e),
            None => println!("Call ended: {:?}", reason),
        },
        CallEvent::Warning(message) => println!("Warning: {}", message),
        CallEvent::RemoteTrack(info) => println!("Remote audio track: {}", info.codec),
        CallEvent::MediaState(_) => {}
    }
}
