//! Configuration for a relay client

use std::time::Duration;

use nametag_core::{NametagError, Result};
use nametag_harness::ReconnectConfig;
use serde::{Deserialize, Serialize};
use url::Url;

/// Relays commonly refuse frames above roughly this size
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Payloads above this many bytes are compressed before encryption
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

// ----------------------------------------------------------------------------
// Relay Configuration
// ----------------------------------------------------------------------------

/// Configuration for one relay connection and the operations issued over it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay WebSocket endpoint
    pub relay_url: String,
    /// Bound on the initial handshake and each reconnect handshake
    pub connection_timeout: Duration,
    /// Time to wait for an OK after publishing
    pub publish_timeout: Duration,
    /// Time to wait for EOSE (or the first match) after a REQ
    pub query_timeout: Duration,
    /// EVENT frames longer than this are rejected locally
    pub max_frame_size: usize,
    /// Whether to reconnect after the transport drops
    pub auto_reconnect: bool,
    /// Backoff used while reconnecting
    pub reconnect: ReconnectConfig,
    /// Drop inbound events whose id or signature does not verify
    pub verify_inbound_events: bool,
    /// Message payloads longer than this are gzip-compressed
    pub compression_threshold: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            relay_url: "wss://nostr-relay.testnet.unicity.network".to_string(),
            connection_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(30),
            query_timeout: Duration::from_secs(10),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            auto_reconnect: true,
            reconnect: ReconnectConfig::default(),
            verify_inbound_events: true,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
        }
    }
}

impl RelayConfig {
    /// Create a configuration for local development with a local relay
    pub fn local_development() -> Self {
        Self {
            relay_url: "ws://localhost:7777".to_string(),
            connection_timeout: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(5),
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(2),
                ..ReconnectConfig::default()
            },
            ..Self::default()
        }
    }

    /// Create a configuration with a single relay (for testing)
    pub fn default_with_relay(relay_url: &str) -> Self {
        Self {
            relay_url: relay_url.to_string(),
            connection_timeout: Duration::from_secs(2),
            publish_timeout: Duration::from_secs(2),
            query_timeout: Duration::from_secs(2),
            reconnect: ReconnectConfig::immediate(5),
            ..Self::default()
        }
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| NametagError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parsed and scheme-checked relay URL
    pub fn url(&self) -> Result<Url> {
        let url = Url::parse(&self.relay_url).map_err(|e| {
            NametagError::Configuration(format!("relay URL {:?}: {e}", self.relay_url))
        })?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(NametagError::Configuration(format!(
                "relay URL scheme must be ws or wss, got {other}"
            ))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.url()?;
        for (name, value) in [
            ("connection_timeout", self.connection_timeout),
            ("publish_timeout", self.publish_timeout),
            ("query_timeout", self.query_timeout),
        ] {
            if value.is_zero() {
                return Err(NametagError::Configuration(format!("{name} must be non-zero")));
            }
        }
        if self.max_frame_size == 0 {
            return Err(NametagError::Configuration(
                "max_frame_size must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
