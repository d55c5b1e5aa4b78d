//! Server Configuration
//!
//! Read from environment variables at startup. Unset variables fall back
//! to defaults; set-but-malformed variables are an error. Zero is
//! malformed for timer periods, timeouts and queue sizes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroU64;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::network::auth::AuthConfig;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Variable is set but cannot be parsed.
    #[error("invalid value for {var}: {value:?}")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },

    /// `PRIVATE_ROOMS` entry without a room name.
    #[error("invalid PRIVATE_ROOMS entry: {0:?}")]
    PrivateRoom(String),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket bind address.
    pub bind_addr: SocketAddr,
    /// HTTP (room validation) bind address.
    pub http_bind_addr: SocketAddr,
    /// Path clients upgrade on.
    pub ws_path: String,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Outbound queue length per connection.
    pub outbound_queue: usize,
    /// How long a send may wait on a full peer queue.
    pub send_timeout: Duration,
    /// WebSocket ping interval.
    pub heartbeat_interval: Duration,
    /// Close connections silent for this long.
    pub idle_timeout: Duration,
    /// Failed `auth` messages tolerated before the connection is closed.
    pub max_auth_attempts: u32,
    /// Empty rooms older than this are reaped.
    pub room_idle_ttl: Duration,
    /// How often the reaper runs.
    pub reap_interval: Duration,
    /// Comma separated CORS origins, or `*`.
    pub cors_origins: String,
    /// Private rooms created at startup: room id -> allowed emails.
    pub private_rooms: HashMap<String, Vec<String>>,
    /// JWT verification settings.
    pub auth: AuthConfig,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            http_bind_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            ws_path: "/ws".to_string(),
            max_connections: 1000,
            outbound_queue: 64,
            send_timeout: Duration::from_millis(2000),
            heartbeat_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(60),
            max_auth_attempts: 3,
            room_idle_ttl: Duration::from_secs(300),
            reap_interval: Duration::from_secs(60),
            cors_origins: "*".to_string(),
            private_rooms: HashMap::new(),
            auth: AuthConfig::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::from_lookup(|var| std::env::var(var).ok())?;
        config.auth = AuthConfig::from_env();
        Ok(config)
    }

    /// Create config from any variable source. `auth` keeps its default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let defaults = Self::default();
        let private_rooms = match env.get("PRIVATE_ROOMS") {
            Some(raw) => parse_private_rooms(&raw)?,
            None => defaults.private_rooms,
        };

        Ok(Self {
            bind_addr: env.parse("BIND_ADDR", defaults.bind_addr)?,
            http_bind_addr: env.parse("HTTP_BIND_ADDR", defaults.http_bind_addr)?,
            ws_path: env.get("WS_PATH").unwrap_or(defaults.ws_path),
            max_connections: env.parse("MAX_CONNECTIONS", defaults.max_connections)?,
            outbound_queue: env.nonzero("OUTBOUND_QUEUE", defaults.outbound_queue as u64)? as usize,
            send_timeout: Duration::from_millis(env.nonzero("SEND_TIMEOUT_MS", defaults.send_timeout.as_millis() as u64)?),
            heartbeat_interval: env.nonzero_secs("HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval)?,
            idle_timeout: env.nonzero_secs("IDLE_TIMEOUT_SECS", defaults.idle_timeout)?,
            max_auth_attempts: env.parse("MAX_AUTH_ATTEMPTS", defaults.max_auth_attempts)?,
            room_idle_ttl: Duration::from_secs(env.parse("ROOM_IDLE_TTL_SECS", defaults.room_idle_ttl.as_secs())?),
            reap_interval: env.nonzero_secs("REAP_INTERVAL_SECS", defaults.reap_interval)?,
            cors_origins: env.get("CORS_ORIGINS").unwrap_or(defaults.cors_origins),
            private_rooms,
            auth: defaults.auth,
            version: defaults.version,
        })
    }
}

/// Parse `room=a@x.io,b@x.io;other=c@x.io`.
pub fn parse_private_rooms(raw: &str) -> Result<HashMap<String, Vec<String>>, ConfigError> {
    let mut rooms = HashMap::new();
    for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let (room, emails) = entry.split_once('=')
            .ok_or_else(|| ConfigError::PrivateRoom(entry.to_string()))?;
        let room = room.trim();
        if room.is_empty() {
            return Err(ConfigError::PrivateRoom(entry.to_string()));
        }
        let emails = emails.split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(String::from)
            .collect();
        rooms.insert(room.to_string(), emails);
    }
    Ok(rooms)
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var)
    }

    fn parse<T: FromStr>(&self, var: &'static str, default: T) -> Result<T, ConfigError> {
        match self.get(var) {
            Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { var, value }),
            None => Ok(default),
        }
    }

    /// Timers and queue sizes: tokio panics on zero.
    fn nonzero(&self, var: &'static str, default: u64) -> Result<u64, ConfigError> {
        match self.get(var) {
            Some(value) => match value.trim().parse::<NonZeroU64>() {
                Ok(n) => Ok(n.get()),
                Err(_) => Err(ConfigError::Invalid { var, value }),
            },
            None => Ok(default),
        }
    }

    fn nonzero_secs(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.nonzero(var, default.as_secs()).map(Duration::from_secs)
    }
}
