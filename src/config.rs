//! Endpoint-Konfiguration
//!
//! Zentrale und Fahrer verwenden denselben Controller, nur mit
//! unterschiedlichen Voreinstellungen. Werte können per Umgebungsvariable
//! oder JSON überschrieben werden.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Feste Identität der Zentrale
pub const CONSOLE_ID: &str = "base";

/// Standard-Timeout für Wählen und Klingeln
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(45);

/// Obergrenze für das Sammeln der ICE Candidates
pub const DEFAULT_GATHER_TIMEOUT: Duration = Duration::from_millis(2000);

/// Abstand zwischen zwei Ton-Signalen
pub const DEFAULT_TONE_CADENCE: Duration = Duration::from_secs(3);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid role '{0}', expected 'console' or 'driver'")]
    InvalidRole(String),

    #[error("Invalid value for {var}: '{value}'")]
    InvalidValue { var: &'static str, value: String },

    #[error("Driver endpoints need FLEETCALL_SELF_ID")]
    MissingSelfId,

    #[error("Invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// IDENTITY
// ============================================================================

/// Rolle eines Endpunkts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Console,
    Driver,
}

impl Role {
    /// Absender-Kennung für Chat-Zeilen
    pub fn sender_tag(&self) -> &'static str {
        match self {
            Role::Console => "base",
            Role::Driver => "driver",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "console" | "base" => Ok(Role::Console),
            "driver" => Ok(Role::Driver),
            _ => Err(ConfigError::InvalidRole(s.to_string())),
        }
    }
}

/// Wer ruft an / wer wird angerufen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub self_id: String,
    pub role: Role,
}

// ============================================================================
// ICE SERVER
// ============================================================================

/// STUN/TURN Server Eintrag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServerConfig {
    pub fn stun(urls: &[&str]) -> Self {
        Self {
            urls: urls.iter().map(|u| u.to_string()).collect(),
            username: String::new(),
            credential: String::new(),
        }
    }

    /// Enthält der Eintrag einen Relay (TURN) Server?
    pub fn is_relay(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

/// Standard STUN Server Konfiguration (kein Relay)
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig::stun(&[
        "stun:stun.l.google.com:19302",
        "stun:stun1.l.google.com:19302",
    ])]
}

// ============================================================================
// ENDPOINT CONFIG
// ============================================================================

/// Konfiguration eines Endpunkts (Zentrale oder Fahrer)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub identity: Identity,
    #[serde(with = "duration_ms")]
    pub dial_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub ring_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub gather_timeout: Duration,
    pub ice_servers: Vec<IceServerConfig>,
    /// Scan nach verpassten eingehenden Anrufen im Leerlauf
    #[serde(with = "duration_ms")]
    pub idle_poll_interval: Duration,
    /// Point Read des aktiven Records während eines Anrufs
    #[serde(with = "duration_ms")]
    pub active_poll_interval: Duration,
    /// Wie weit der Scan in die Vergangenheit schaut
    #[serde(with = "duration_ms")]
    pub incoming_lookback: Duration,
    #[serde(with = "duration_ms")]
    pub tone_cadence: Duration,
}

impl EndpointConfig {
    /// Voreinstellung für die Zentrale
    pub fn console() -> Self {
        Self::for_identity(
            Identity {
                self_id: CONSOLE_ID.to_string(),
                role: Role::Console,
            },
            Duration::from_secs(15),
        )
    }

    /// Voreinstellung für einen Fahrer
    pub fn driver(self_id: impl Into<String>) -> Self {
        Self::for_identity(
            Identity {
                self_id: self_id.into(),
                role: Role::Driver,
            },
            Duration::from_secs(2),
        )
    }

    fn for_identity(identity: Identity, idle_poll_interval: Duration) -> Self {
        Self {
            identity,
            dial_timeout: DEFAULT_CALL_TIMEOUT,
            ring_timeout: DEFAULT_CALL_TIMEOUT,
            gather_timeout: DEFAULT_GATHER_TIMEOUT,
            ice_servers: default_ice_servers(),
            idle_poll_interval,
            active_poll_interval: Duration::from_millis(1500),
            incoming_lookback: DEFAULT_CALL_TIMEOUT,
            tone_cadence: DEFAULT_TONE_CADENCE,
        }
    }

    /// Lädt die Konfiguration aus JSON
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Baut die Konfiguration aus Umgebungsvariablen
    ///
    /// `FLEETCALL_ROLE` wählt die Voreinstellung, alle weiteren Variablen
    /// überschreiben einzelne Werte.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let role = match lookup("FLEETCALL_ROLE") {
            Some(value) => value.parse::<Role>()?,
            None => Role::Console,
        };

        let mut config = match role {
            Role::Console => Self::console(),
            Role::Driver => {
                let self_id = lookup("FLEETCALL_SELF_ID").ok_or(ConfigError::MissingSelfId)?;
                Self::driver(self_id)
            }
        };

        if let (Role::Console, Some(self_id)) = (role, lookup("FLEETCALL_SELF_ID")) {
            config.identity.self_id = self_id;
        }

        if let Some(secs) = lookup("FLEETCALL_DIAL_TIMEOUT_SECS") {
            config.dial_timeout = parse_secs("FLEETCALL_DIAL_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = lookup("FLEETCALL_RING_TIMEOUT_SECS") {
            config.ring_timeout = parse_secs("FLEETCALL_RING_TIMEOUT_SECS", &secs)?;
        }

        if let Some(urls) = lookup("FLEETCALL_STUN_URLS") {
            let urls: Vec<&str> = urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .collect();
            config.ice_servers = vec![IceServerConfig::stun(&urls)];
        }

        if let Some(url) = lookup("FLEETCALL_TURN_URL") {
            config.ice_servers.push(IceServerConfig {
                urls: vec![url],
                username: lookup("FLEETCALL_TURN_USERNAME").unwrap_or_default(),
                credential: lookup("FLEETCALL_TURN_CREDENTIAL").unwrap_or_default(),
            });
        }

        Ok(config)
    }

    /// Ist ein Relay konfiguriert? Ohne Relay scheitern Anrufe zwischen
    /// zwei Endpunkten hinter symmetrischem NAT.
    pub fn has_relay(&self) -> bool {
        self.ice_servers.iter().any(IceServerConfig::is_relay)
    }
}

fn parse_secs(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| ConfigError::InvalidValue {
            var,
            value: value.to_string(),
        })
}

/// Serde-Helfer: Durations als Millisekunden
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
