use serde::{Deserialize, Serialize};
use sessionlink_core::models::ConnectionId;
use std::time::Duration;
use url::Url;

use crate::Result;

/// STUN/TURN server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Media link and liveness settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtcConfig {
    pub ice_servers: Vec<IceServerConfig>,
    /// Silence after which an active peer is marked stale
    pub stale_threshold_ms: u64,
    /// Silence after which a peer is closed
    pub dead_threshold_ms: u64,
    pub health_check_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServerConfig::stun("stun:stun.stunprotocol.org:3478"),
                IceServerConfig::stun("stun:stun.l.google.com:19302"),
            ],
            stale_threshold_ms: 5_000,
            dead_threshold_ms: 15_000,
            health_check_interval_ms: 1_000,
            heartbeat_interval_ms: 2_000,
        }
    }
}

impl RtcConfig {
    #[must_use]
    pub const fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    #[must_use]
    pub const fn dead_threshold(&self) -> Duration {
        Duration::from_millis(self.dead_threshold_ms)
    }

    #[must_use]
    pub const fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Signaling socket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Base endpoint, e.g. `ws://localhost:8080/api/ws`
    pub url: String,
    /// Identity kept across reconnects
    pub connection_id: ConnectionId,
    pub auth_token: Option<String>,
    pub reconnect_delay_ms: u64,
    pub request_timeout_ms: u64,
    pub ping_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/api/ws".to_string(),
            connection_id: ConnectionId::new(),
            auth_token: None,
            reconnect_delay_ms: 3_000,
            request_timeout_ms: 30_000,
            ping_interval_ms: 25_000,
        }
    }
}

impl TransportConfig {
    pub fn new(url: impl Into<String>, connection_id: ConnectionId) -> Self {
        Self {
            url: url.into(),
            connection_id,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub const fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Endpoint with `connectionId` (and `token`) query parameters
    pub fn endpoint(&self) -> Result<Url> {
        let mut url = Url::parse(&self.url)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("connectionId", self.connection_id.as_str());
            if let Some(token) = &self.auth_token {
                query.append_pair("token", token);
            }
        }
        Ok(url)
    }
}
