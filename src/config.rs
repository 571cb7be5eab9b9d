//! Konfiguration - Signaling, ICE-Server und Recovery
//!
//! Alle Strukturen sind per serde ladbar; fehlende Felder fallen auf Defaults zurück.

use crate::error_handler::{millis, RecoveryPolicy, DEFAULT_HISTORY_CAPACITY};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Google STUN-Server
const GOOGLE_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

const ADDITIONAL_STUN_SERVERS: &[&str] = &[
    "stun:stun.stunprotocol.org:3478",
    "stun:stun.voiparound.com",
    "stun:stun.voipbuster.com",
];

const DEFAULT_SIGNALING_URL: &str = "http://localhost:3001";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("ICE configuration has no servers")]
    NoIceServers,

    #[error("Invalid ICE server url: {0}")]
    InvalidIceUrl(String),
}

// ============================================================================
// SIGNALING
// ============================================================================

/// Reconnect-Verhalten: begrenzte Versuche mit gedeckeltem exponentiellem Backoff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Wartezeit vor Versuch `attempt` (ab 1)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Relay-Adresse; http(s) wird auf ws(s) abgebildet
    pub server_url: String,
    pub user_id: String,
    pub user_name: Option<String>,
    /// Dokument-Raum, der beim Verbinden betreten wird
    pub document_id: Option<String>,
    pub reconnect: ReconnectPolicy,
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SIGNALING_URL.to_string(),
            user_id: String::new(),
            user_name: None,
            document_id: None,
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: Duration::from_secs(25),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Untergrenze für das Heartbeat-Intervall
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

impl SignalingConfig {
    /// Heartbeat-Intervall, nach unten auf [`MIN_HEARTBEAT_INTERVAL`] begrenzt
    pub fn heartbeat_period(&self) -> Duration {
        self.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL)
    }
}

// ============================================================================
// ICE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(urls: &[&str]) -> Self {
        Self {
            urls: urls.iter().map(|u| u.to_string()).collect(),
            username: None,
            credential: None,
        }
    }

    pub fn with_credentials(mut self, username: String, credential: String) -> Self {
        self.username = Some(username);
        self.credential = Some(credential);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportPolicy {
    #[default]
    All,
    /// Nur TURN-Relay
    Relay,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub servers: Vec<IceServer>,
    pub transport_policy: TransportPolicy,
    pub candidate_pool_size: u8,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self::development()
    }
}

/// Ergebnis von [`IceConfig::validate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IceValidation {
    pub has_stun: bool,
    pub has_turn: bool,
}

impl IceConfig {
    /// Nur STUN, kein Relay
    pub fn development() -> Self {
        Self {
            servers: vec![
                IceServer::new(GOOGLE_STUN_SERVERS),
                IceServer::new(ADDITIONAL_STUN_SERVERS),
            ],
            transport_policy: TransportPolicy::All,
            candidate_pool_size: 10,
        }
    }

    /// STUN plus optionaler TURN-Server
    pub fn production(turn: Option<IceServer>) -> Self {
        let mut servers = vec![IceServer::new(GOOGLE_STUN_SERVERS)];
        servers.extend(turn);
        Self {
            servers,
            transport_policy: TransportPolicy::All,
            candidate_pool_size: 10,
        }
    }

    /// Erzwingt TURN-Relay (zum Testen des Relays)
    pub fn turn_only(turn: Option<IceServer>) -> Self {
        Self {
            servers: turn.into_iter().collect(),
            transport_policy: TransportPolicy::Relay,
            candidate_pool_size: 10,
        }
    }

    /// Prüft die STUN/TURN-Abdeckung und warnt bei Lücken
    pub fn validate(&self) -> Result<IceValidation, ConfigError> {
        if self.servers.is_empty() {
            tracing::warn!("ICE configuration has no servers");
            return Err(ConfigError::NoIceServers);
        }

        let mut result = IceValidation {
            has_stun: false,
            has_turn: false,
        };

        for server in &self.servers {
            for url in &server.urls {
                if url.starts_with("stun:") || url.starts_with("stuns:") {
                    result.has_stun = true;
                } else if url.starts_with("turn:") || url.starts_with("turns:") {
                    result.has_turn = true;
                    if server.username.is_none() || server.credential.is_none() {
                        tracing::warn!("TURN server {} configured without credentials", url);
                    }
                } else {
                    return Err(ConfigError::InvalidIceUrl(url.clone()));
                }
            }
        }

        if !result.has_stun {
            tracing::warn!("No STUN servers configured, NAT traversal may fail");
        }
        if !result.has_turn {
            tracing::info!(
                "No TURN servers configured, connections may fail behind restrictive firewalls"
            );
        }

        Ok(result)
    }
}

// ============================================================================
// CALL CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub signaling: SignalingConfig,
    pub ice: IceConfig,
    pub recovery: RecoveryPolicy,
    pub error_history_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            ice: IceConfig::default(),
            recovery: RecoveryPolicy::default(),
            error_history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl CallConfig {
    /// Lokaler Benutzer (identisch mit der Signaling-Identität)
    pub fn local_user_id(&self) -> &str {
        &self.signaling.user_id
    }

    /// Liest `SIGNALING_URL`, `APP_ENV`, `TURN_URL`, `TURN_USERNAME`, `TURN_PASSWORD`
    pub fn from_env(user_id: impl Into<String>, document_id: Option<String>) -> Self {
        Self::from_lookup(user_id, document_id, |key| std::env::var(key).ok())
    }

    fn from_lookup<F>(user_id: impl Into<String>, document_id: Option<String>, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let turn = lookup("TURN_URL").map(|url| {
            let server = IceServer {
                urls: vec![url],
                username: None,
                credential: None,
            };
            match (lookup("TURN_USERNAME"), lookup("TURN_PASSWORD")) {
                (Some(user), Some(pass)) => server.with_credentials(user, pass),
                _ => server,
            }
        });

        let environment = lookup("APP_ENV").unwrap_or_else(|| "development".to_string());
        let ice = match environment.as_str() {
            "production" => IceConfig::production(turn),
            "test" => IceConfig::turn_only(turn),
            _ => {
                let mut ice = IceConfig::development();
                ice.servers.extend(turn);
                ice
            }
        };
        tracing::debug!("Using {} ICE configuration", environment);

        Self {
            signaling: SignalingConfig {
                server_url: lookup("SIGNALING_URL")
                    .unwrap_or_else(|| DEFAULT_SIGNALING_URL.to_string()),
                user_id: user_id.into(),
                document_id,
                ..SignalingConfig::default()
            },
            ice,
            ..Self::default()
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_reconnect_backoff_is_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn test_presets_validate() {
        let dev = IceConfig::development().validate().unwrap();
        assert!(dev.has_stun);
        assert!(!dev.has_turn);

        assert_eq!(
            IceConfig::turn_only(None).validate(),
            Err(ConfigError::NoIceServers)
        );

        let turn = IceServer::new(&["turn:turn.example.com:3478"])
            .with_credentials("u".into(), "p".into());
        let prod = IceConfig::production(Some(turn)).validate().unwrap();
        assert!(prod.has_stun && prod.has_turn);

        let bad = IceConfig {
            servers: vec![IceServer::new(&["http://nope"])],
            ..IceConfig::default()
        };
        assert!(matches!(bad.validate(), Err(ConfigError::InvalidIceUrl(_))));
    }

    #[test]
    fn test_from_env_selects_preset() {
        let config = CallConfig::from_lookup(
            "alice",
            Some("doc-1".into()),
            env(&[
                ("APP_ENV", "test"),
                ("SIGNALING_URL", "https://relay.example.com"),
                ("TURN_URL", "turn:turn.example.com:3478"),
                ("TURN_USERNAME", "u"),
                ("TURN_PASSWORD", "p"),
            ]),
        );

        assert_eq!(config.local_user_id(), "alice");
        assert_eq!(config.signaling.server_url, "https://relay.example.com");
        assert_eq!(config.ice.transport_policy, TransportPolicy::Relay);
        assert_eq!(config.ice.servers.len(), 1);
        assert_eq!(config.ice.servers[0].credential.as_deref(), Some("p"));

        let config = CallConfig::from_lookup("bob", None, env(&[]));
        assert_eq!(config.signaling.server_url, DEFAULT_SIGNALING_URL);
        assert_eq!(config.ice, IceConfig::development());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: CallConfig = serde_json::from_str(
            r#"{ "signaling": { "user_id": "alice", "heartbeat_interval": 1000 } }"#,
        )
        .unwrap();

        assert_eq!(config.signaling.user_id, "alice");
        assert_eq!(config.signaling.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.signaling.reconnect.max_attempts, 5);
        assert_eq!(config.recovery.device_delay, Duration::from_secs(2));
        assert_eq!(config.error_history_capacity, DEFAULT_HISTORY_CAPACITY);
    }

    #[test]
    fn test_zero_heartbeat_is_clamped() {
        let config: SignalingConfig =
            serde_json::from_str(r#"{ "heartbeat_interval": 0 }"#).unwrap();
        assert_eq!(config.heartbeat_interval, Duration::ZERO);
        assert_eq!(config.heartbeat_period(), MIN_HEARTBEAT_INTERVAL);

        let config = SignalingConfig::default();
        assert_eq!(config.heartbeat_period(), Duration::from_secs(25));
    }
}
