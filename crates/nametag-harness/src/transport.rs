//! Transport harness utilities
//!
//! The seam between a relay connection and whatever carries its text frames,
//! plus the reconnection backoff shared by every connector.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, Stream};
use nametag_core::TransportError;
use serde::{Deserialize, Serialize};
use url::Url;

// ----------------------------------------------------------------------------
// Relay Link
// ----------------------------------------------------------------------------

/// Outbound half of a relay link
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Inbound half of a relay link; the stream ends when the peer closes
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// An established duplex text-frame channel to one relay
pub struct RelayLink {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl RelayLink {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

impl core::fmt::Debug for RelayLink {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RelayLink").finish_non_exhaustive()
    }
}

/// Opens relay links
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Perform the handshake and hand back the link
    async fn connect(&self, url: &Url) -> Result<RelayLink, TransportError>;
}

// ----------------------------------------------------------------------------
// Reconnection Utilities
// ----------------------------------------------------------------------------

/// Reconnection strategy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Initial delay before first reconnect attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Delay multiplier for exponential backoff
    pub backoff_multiplier: f32,
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_attempts: Some(10),
        }
    }
}

impl ReconnectConfig {
    /// Tight retry loop for tests against an in-memory relay
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            backoff_multiplier: 1.5,
            max_attempts: Some(max_attempts),
        }
    }
}

/// Exponential backoff state for one connection
#[derive(Debug)]
pub struct ReconnectManager {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        let current_delay = config.initial_delay;
        Self {
            config,
            current_delay,
            attempt_count: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt_count >= max_attempts {
                return None;
            }
        }

        let delay = self.current_delay;

        self.attempt_count += 1;
        let next_delay_millis =
            (self.current_delay.as_millis() as f32 * self.config.backoff_multiplier) as u64;
        self.current_delay =
            Duration::from_millis(next_delay_millis.min(self.config.max_delay.as_millis() as u64));

        Some(delay)
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    /// Attempts handed out since the last reset, numbered from 1
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }
}
