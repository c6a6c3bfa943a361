//! Nametag Harness
//!
//! Shared transport plumbing for the relay client:
//!
//! - **Connector seam**: [`Connector`] opens a [`RelayLink`], a boxed
//!   text-frame sink and stream. Production code plugs in a WebSocket
//!   connector; tests plug in [`MockConnector`].
//! - **Reconnection**: [`ReconnectConfig`] and [`ReconnectManager`] provide
//!   capped exponential backoff.
//! - **Mock relay** (feature `testing`): [`MockRelay`] keeps an in-memory
//!   event store with relay retention rules and scriptable failure modes.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // Requires the "testing" feature
//! use nametag_harness::{Connector, MockRelay};
//!
//! #[tokio::test]
//! async fn test_roundtrip() {
//!     let relay = MockRelay::new();
//!     let url = url::Url::parse("ws://mock").unwrap();
//!     let link = relay.connector().connect(&url).await.unwrap();
//!     // drive link.sink / link.stream ...
//! }
//! ```

pub mod transport;

#[cfg(feature = "testing")]
pub mod mock_relay;

pub use transport::{Connector, FrameSink, FrameStream, ReconnectConfig, ReconnectManager, RelayLink};

#[cfg(feature = "testing")]
pub use mock_relay::{MockConnector, MockRelay, MockRelayConfig};

/// Install a test-friendly tracing subscriber; later calls are no-ops
#[cfg(feature = "testing")]
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
