use std::time::Duration;

use thiserror::Error;

const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("room name must not be empty")]
    EmptyRoom,
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("peer timeout ({timeout:?}) must exceed the heartbeat interval ({heartbeat:?})")]
    PeerTimeoutTooShort {
        timeout: Duration,
        heartbeat: Duration,
    },
    #[error("remote mic timeout ({timeout:?}) must exceed its heartbeat interval ({heartbeat:?})")]
    RemoteMicTimeoutTooShort {
        timeout: Duration,
        heartbeat: Duration,
    },
    #[error("dedup capacity must be greater than zero")]
    ZeroDedupCapacity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshConfig {
    pub room: String,
    pub topic_prefix: String,
    pub heartbeat_interval: Duration,
    pub peer_timeout: Duration,
    pub negotiation_timeout: Duration,
    pub remote_mic_heartbeat_interval: Duration,
    pub remote_mic_timeout: Duration,
    pub dedup_capacity: usize,
    pub dedup_ttl: Duration,
    pub shutdown_grace: Duration,
    pub ice_servers: Vec<String>,
    pub log_filter: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            room: "lobby".into(),
            topic_prefix: "huddle/rooms".into(),
            heartbeat_interval: Duration::from_millis(5_000),
            peer_timeout: Duration::from_millis(20_000),
            negotiation_timeout: Duration::from_millis(30_000),
            remote_mic_heartbeat_interval: Duration::from_millis(2_000),
            remote_mic_timeout: Duration::from_millis(8_000),
            dedup_capacity: 2_048,
            dedup_ttl: Duration::from_millis(120_000),
            shutdown_grace: Duration::from_millis(2_000),
            ice_servers: vec![DEFAULT_STUN.into()],
            log_filter: "info,huddle_core=debug".into(),
        }
    }
}

impl MeshConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup; unparsable values fall
    /// back to the default for that field.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |key: &str, fallback: Duration| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };

        let room = lookup("HUDDLE_ROOM").unwrap_or(defaults.room);
        let topic_prefix = lookup("HUDDLE_TOPIC_PREFIX").unwrap_or(defaults.topic_prefix);
        let heartbeat_interval = millis("HUDDLE_HEARTBEAT_MS", defaults.heartbeat_interval);
        let peer_timeout = millis("HUDDLE_PEER_TIMEOUT_MS", defaults.peer_timeout);
        let negotiation_timeout =
            millis("HUDDLE_NEGOTIATION_TIMEOUT_MS", defaults.negotiation_timeout);
        let remote_mic_heartbeat_interval = millis(
            "HUDDLE_RM_HEARTBEAT_MS",
            defaults.remote_mic_heartbeat_interval,
        );
        let remote_mic_timeout = millis("HUDDLE_RM_TIMEOUT_MS", defaults.remote_mic_timeout);
        let dedup_capacity = lookup("HUDDLE_DEDUP_CAPACITY")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(defaults.dedup_capacity);
        let dedup_ttl = millis("HUDDLE_DEDUP_TTL_MS", defaults.dedup_ttl);
        let shutdown_grace = millis("HUDDLE_SHUTDOWN_GRACE_MS", defaults.shutdown_grace);

        let stun_disabled = lookup("HUDDLE_DISABLE_STUN")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
            .unwrap_or(false);
        let ice_servers = if stun_disabled {
            Vec::new()
        } else {
            lookup("HUDDLE_ICE_SERVERS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|url| !url.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or(defaults.ice_servers)
        };
        let log_filter = lookup("RUST_LOG").unwrap_or(defaults.log_filter);

        Self {
            room,
            topic_prefix,
            heartbeat_interval,
            peer_timeout,
            negotiation_timeout,
            remote_mic_heartbeat_interval,
            remote_mic_timeout,
            dedup_capacity,
            dedup_ttl,
            shutdown_grace,
            ice_servers,
            log_filter,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.room.trim().is_empty() {
            return Err(ConfigError::EmptyRoom);
        }
        for (name, value) in [
            ("heartbeat interval", self.heartbeat_interval),
            ("peer timeout", self.peer_timeout),
            ("negotiation timeout", self.negotiation_timeout),
            ("remote mic heartbeat interval", self.remote_mic_heartbeat_interval),
            ("remote mic timeout", self.remote_mic_timeout),
            ("dedup ttl", self.dedup_ttl),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if self.peer_timeout <= self.heartbeat_interval {
            return Err(ConfigError::PeerTimeoutTooShort {
                timeout: self.peer_timeout,
                heartbeat: self.heartbeat_interval,
            });
        }
        if self.remote_mic_timeout <= self.remote_mic_heartbeat_interval {
            return Err(ConfigError::RemoteMicTimeoutTooShort {
                timeout: self.remote_mic_timeout,
                heartbeat: self.remote_mic_heartbeat_interval,
            });
        }
        if self.dedup_capacity == 0 {
            return Err(ConfigError::ZeroDedupCapacity);
        }
        Ok(())
    }

    /// Broker topic every peer in the room publishes and subscribes on.
    pub fn topic(&self) -> String {
        format!("{}/{}", self.topic_prefix.trim_end_matches('/'), self.room)
    }
}
