//! Nametag Relay
//!
//! Async client for a publish/subscribe event relay:
//!
//! - [`RelayConnection`]: one link per relay URL, driven by a single task
//!   that owns the [`ConnectionState`] and reconnects with backoff
//! - [`SubscriptionCoordinator`]: correlates `OK`, `EVENT`, `EOSE` and
//!   `CLOSED` frames with the publishes, queries and subscriptions waiting
//!   on them
//! - [`RelayClient`]: keys plus a connection, with name binding lookups and
//!   encrypted messages to a recipient
//!
//! ```rust,ignore
//! use nametag_core::Keys;
//! use nametag_relay::{RelayClient, RelayConfig};
//!
//! let client = RelayClient::builder(Keys::generate())
//!     .config(RelayConfig::default())
//!     .connect()
//!     .await?;
//! client.publish_name_binding("alice", "DIRECT://0000abcd").await?;
//! let key = client.query_key_by_name("alice").await?;
//! ```

pub mod cipher;
pub mod client;
pub mod config;
pub mod connection;
pub mod coordinator;
mod nametag;
pub mod state;
pub mod subscription;
pub mod websocket;

pub use cipher::{ContentCipher, HexCodec, Nip04Cipher};
pub use client::{MessageInbox, PublishReceipt, ReceivedMessage, RelayClient, RelayClientBuilder};
pub use config::{RelayConfig, DEFAULT_COMPRESSION_THRESHOLD, DEFAULT_MAX_FRAME_SIZE};
pub use connection::RelayConnection;
pub use coordinator::{
    PublishOutcome, QueryMode, QueryOutcome, Rejection, RejectionKind, SubscriptionCoordinator,
};
pub use state::{ConnectionListener, ConnectionNotice, ConnectionState};
pub use subscription::{Subscription, SubscriptionItem, SubscriptionState};
pub use websocket::WebSocketConnector;
