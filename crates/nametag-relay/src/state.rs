//! Connection lifecycle state and notifications
//!
//! The connection driver is the only writer of [`ConnectionState`]. Everyone
//! else reads it through an atomic load or listens for [`ConnectionNotice`]s.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const NOTICE_CAPACITY: usize = 64;

// ----------------------------------------------------------------------------
// Connection State
// ----------------------------------------------------------------------------

/// Lifecycle of one relay connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            _ => Self::Disconnected,
        }
    }

    /// Whether the state machine allows moving to `next`
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Reconnecting)
                | (Connected, Disconnected)
                | (Reconnecting, Connected)
                | (Reconnecting, Disconnected)
        )
    }
}

impl core::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Notices
// ----------------------------------------------------------------------------

/// Signal emitted on connection lifecycle changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionNotice {
    Connected { url: String },
    Disconnected { url: String, reason: String },
    Reconnecting { url: String, attempt: u32 },
    Reconnected { url: String },
}

/// Observer for connection lifecycle changes
///
/// Callbacks run on a dedicated forwarding task, never on the frame reader.
pub trait ConnectionListener: Send + Sync + 'static {
    fn on_connect(&self, _url: &str) {}
    fn on_disconnect(&self, _url: &str, _reason: &str) {}
    fn on_reconnecting(&self, _url: &str, _attempt: u32) {}
    fn on_reconnected(&self, _url: &str) {}
}

/// Forward notices from `receiver` to `listener` until the channel closes
pub fn spawn_listener(
    mut receiver: broadcast::Receiver<ConnectionNotice>,
    listener: Arc<dyn ConnectionListener>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(ConnectionNotice::Connected { url }) => listener.on_connect(&url),
                Ok(ConnectionNotice::Disconnected { url, reason }) => {
                    listener.on_disconnect(&url, &reason)
                }
                Ok(ConnectionNotice::Reconnecting { url, attempt }) => {
                    listener.on_reconnecting(&url, attempt)
                }
                Ok(ConnectionNotice::Reconnected { url }) => listener.on_reconnected(&url),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Connection listener lagged, skipped {} notices", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

// ----------------------------------------------------------------------------
// Shared State
// ----------------------------------------------------------------------------

/// Authoritative connection state plus its notice channel
///
/// The state shares one atomic with a link generation that advances every
/// time a `Connected` link is lost, so a caller can tell whether the link it
/// registered against is still the live one.
#[derive(Debug)]
pub struct SharedState {
    url: String,
    /// State in the low byte, link generation above it
    state: AtomicU64,
    notices: broadcast::Sender<ConnectionNotice>,
}

impl SharedState {
    pub fn new(url: impl Into<String>) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            url: url.into(),
            state: AtomicU64::new(ConnectionState::Disconnected as u64),
            notices,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn get(&self) -> ConnectionState {
        self.snapshot().0
    }

    /// Current link generation
    pub(crate) fn link(&self) -> u64 {
        self.snapshot().1
    }

    /// State and link generation read together
    pub(crate) fn snapshot(&self) -> (ConnectionState, u64) {
        let raw = self.state.load(Ordering::SeqCst);
        (ConnectionState::from_u8((raw & 0xff) as u8), raw >> 8)
    }

    /// Move to `next` if the state machine allows it
    pub(crate) fn transition(&self, next: ConnectionState) -> bool {
        let (current, mut link) = self.snapshot();
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            warn!(
                url = %self.url,
                "Ignoring invalid connection transition {} -> {}", current, next
            );
            return false;
        }
        if current == ConnectionState::Connected {
            link += 1;
        }
        self.state
            .store((link << 8) | next as u64, Ordering::SeqCst);
        debug!(url = %self.url, link, "Connection state {} -> {}", current, next);
        true
    }

    pub(crate) fn notify(&self, notice: ConnectionNotice) {
        // No subscribers is fine
        let _ = self.notices.send(notice);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionNotice> {
        self.notices.subscribe()
    }
}
