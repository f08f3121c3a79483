//! Replay configuration
//!
//! Plain typed settings with defaults matching the recording rig. The CLI
//! fills these from arguments and environment variables; the library only
//! validates them.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ReplayError, TransportError};
use crate::grouper::IgnoreSet;
use crate::scheduler::Routing;
use crate::types::UserId;

/// Default source files, relative to the data folder
pub const DEFAULT_SOURCES: [&str; 3] = ["user1.json", "05ago2025.json", "07ago2025.json"];

/// Slowest accepted playback speed
pub const MIN_SPEED: f64 = 1e-6;

/// Broker connection settings
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    /// `mqtt://host`, `tcp://host`, or a bare host name. May carry a port.
    pub url: String,
    /// Port used when the URL does not name one
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// MQTT QoS level (0, 1 or 2)
    pub qos: u8,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    /// Pause between reconnect attempts after the connection drops
    pub reconnect_backoff: Duration,
    /// Fixed client id; a random one is generated when unset
    pub client_id: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "mqtt://broker.hivemq.com".to_string(),
            port: 1883,
            username: None,
            password: None,
            qos: 2,
            keep_alive: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(15),
            reconnect_backoff: Duration::from_secs(1),
            client_id: None,
        }
    }
}

impl BrokerConfig {
    /// Resolve the host and port to connect to
    pub fn endpoint(&self) -> Result<(String, u16), TransportError> {
        let url = self.url.trim();
        let rest = match url.split_once("://") {
            Some((scheme, rest)) => match scheme.to_ascii_lowercase().as_str() {
                "mqtt" | "tcp" => rest,
                other => {
                    return Err(TransportError::InvalidBrokerUrl(format!(
                        "unsupported scheme '{}' in '{}'",
                        other, url
                    )))
                }
            },
            None => url,
        };

        let authority = rest.split('/').next().unwrap_or_default();
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    TransportError::InvalidBrokerUrl(format!("invalid port in '{}'", url))
                })?;
                (host, port)
            }
            None => (authority, self.port),
        };

        if host.is_empty() {
            return Err(TransportError::InvalidBrokerUrl(format!(
                "missing host in '{}'",
                url
            )));
        }

        Ok((host.to_string(), port))
    }

    /// Username/password pair, only when a non-blank username is set.
    ///
    /// An MQTT 3.1.1 login always carries a password field, so a missing or
    /// blank password is sent as an empty one.
    pub fn credentials(&self) -> Option<(String, String)> {
        let username = self.username.as_deref().map(str::trim).filter(|u| !u.is_empty())?;
        let password = self
            .password
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_default();
        Some((username.to_string(), password.to_string()))
    }
}

/// Multi-user synthesis settings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SynthesisConfig {
    /// Simulated users per source; 0 or 1 disables synthesis
    pub users: usize,
    /// Explicit ids for every simulated user
    pub custom_user_ids: Option<Vec<UserId>>,
    /// Keep only the phone GPS kinds
    pub gps_only: bool,
    /// Seed for reproducible jitter
    pub seed: Option<u64>,
}

impl SynthesisConfig {
    pub fn is_enabled(&self) -> bool {
        self.users > 1
    }
}

/// Everything a replay run needs
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub data_folder: PathBuf,
    /// Source file names, relative to `data_folder`
    pub sources: Vec<String>,
    pub routing: Routing,
    pub ignore: IgnoreSet,
    /// Playback speed multiplier
    pub speed: f64,
    pub synthesis: SynthesisConfig,
    pub broker: BrokerConfig,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            data_folder: PathBuf::from("data"),
            sources: DEFAULT_SOURCES.iter().map(|s| s.to_string()).collect(),
            routing: Routing::default(),
            ignore: IgnoreSet::default(),
            speed: 1.0,
            synthesis: SynthesisConfig::default(),
            broker: BrokerConfig::default(),
        }
    }
}

impl ReplayConfig {
    /// Check settings that would otherwise fail mid-replay
    pub fn validate(&self) -> Result<(), ReplayError> {
        if self.sources.is_empty() {
            return Err(ReplayError::Config("no sources configured".to_string()));
        }
        if !self.speed.is_finite() || self.speed < MIN_SPEED {
            return Err(ReplayError::Config(format!(
                "speed must be a finite number of at least {}, got {}",
                MIN_SPEED, self.speed
            )));
        }

        let topic = self.routing.topic.as_str();
        if topic.trim().is_empty() {
            return Err(ReplayError::Config("topic must not be empty".to_string()));
        }
        if topic.contains(['+', '#']) {
            return Err(ReplayError::Config(format!(
                "topic '{}' contains a wildcard",
                topic
            )));
        }

        if self.broker.qos > 2 {
            return Err(TransportError::InvalidQos(self.broker.qos).into());
        }
        if self.broker.keep_alive < Duration::from_secs(1) {
            return Err(ReplayError::Config(
                "keep-alive must be at least one second".to_string(),
            ));
        }
        self.broker.endpoint()?;

        if let Some(ids) = &self.synthesis.custom_user_ids {
            if ids.len() != self.synthesis.users {
                return Err(ReplayError::Config(format!(
                    "{} custom user ids given for {} users",
                    ids.len(),
                    self.synthesis.users
                )));
            }
        }

        Ok(())
    }

    pub fn source_path(&self, source: &str) -> PathBuf {
        self.data_folder.join(source)
    }
}
