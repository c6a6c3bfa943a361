//! Relay Connection
//!
//! One connection per relay URL, owned by a single driver task. The driver
//! multiplexes outbound frames from callers with inbound frames from the relay,
//! hands every inbound frame to the [`SubscriptionCoordinator`] and owns the
//! [`ConnectionState`]. When the link drops it fails every waiter, then
//! reconnects with backoff if configured to. Subscriptions are not re-issued;
//! callers watch for [`ConnectionNotice::Reconnected`] and subscribe again.
//!
//! Frames written for a lost link are discarded, never replayed on the next
//! one: their waiters have already been failed and retrying is up to the caller.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use nametag_core::{Event, Filter, RelayMessage, Result, TransportError};
use nametag_harness::{Connector, ReconnectManager, RelayLink};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::RelayConfig;
use crate::coordinator::{
    CoordinatorSettings, PublishOutcome, QueryMode, QueryOutcome, SubscriptionCoordinator,
};
use crate::state::{
    spawn_listener, ConnectionListener, ConnectionNotice, ConnectionState, SharedState,
};
use crate::subscription::Subscription;

/// Work handed to the driver task
#[derive(Debug)]
pub(crate) enum Command {
    /// Serialized client frame, bound to the link generation it was written for
    Frame { link: u64, text: String },
    /// Close the link and stop; acknowledged once the state is `Disconnected`
    Shutdown(Option<oneshot::Sender<()>>),
}

// ----------------------------------------------------------------------------
// Relay Connection
// ----------------------------------------------------------------------------

/// A live connection to one relay
///
/// Single-use: after [`RelayConnection::disconnect`] or after reconnection
/// gives up, open a new connection.
pub struct RelayConnection {
    config: RelayConfig,
    shared: Arc<SharedState>,
    coordinator: Arc<SubscriptionCoordinator>,
    commands: mpsc::UnboundedSender<Command>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl RelayConnection {
    /// Connect to `config.relay_url` through `connector`
    pub async fn connect(config: RelayConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        Self::connect_with_listeners(config, connector, Vec::new()).await
    }

    /// Connect with listeners attached before the first notice is emitted
    pub async fn connect_with_listeners(
        config: RelayConfig,
        connector: Arc<dyn Connector>,
        listeners: Vec<Arc<dyn ConnectionListener>>,
    ) -> Result<Self> {
        config.validate()?;
        let url = config.url()?;
        let shared = Arc::new(SharedState::new(config.relay_url.clone()));
        for listener in listeners {
            spawn_listener(shared.subscribe(), listener);
        }

        shared.transition(ConnectionState::Connecting);
        info!(url = %config.relay_url, "Connecting to relay");
        let link = match handshake(connector.as_ref(), &url, config.connection_timeout).await {
            Ok(link) => link,
            Err(e) => {
                shared.transition(ConnectionState::Disconnected);
                warn!(url = %config.relay_url, "Relay handshake failed: {}", e);
                return Err(e.into());
            }
        };
        shared.transition(ConnectionState::Connected);
        shared.notify(ConnectionNotice::Connected {
            url: config.relay_url.clone(),
        });
        info!(url = %config.relay_url, "Connected to relay");

        let (commands, inbox) = mpsc::unbounded_channel();
        let coordinator = Arc::new(SubscriptionCoordinator::new(
            Arc::clone(&shared),
            commands.clone(),
            CoordinatorSettings {
                max_frame_size: config.max_frame_size,
                verify_inbound_events: config.verify_inbound_events,
            },
        ));

        let driver = Driver {
            url,
            shared: Arc::clone(&shared),
            coordinator: Arc::clone(&coordinator),
            connector,
            commands: inbox,
            auto_reconnect: config.auto_reconnect,
            backoff: ReconnectManager::new(config.reconnect.clone()),
            connection_timeout: config.connection_timeout,
        };
        let handle = tokio::spawn(driver.run(link));

        Ok(Self {
            config,
            shared,
            coordinator,
            commands,
            driver: Mutex::new(Some(handle)),
        })
    }

    pub fn url(&self) -> &str {
        self.shared.url()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Receiver for lifecycle notices emitted from now on
    pub fn notices(&self) -> broadcast::Receiver<ConnectionNotice> {
        self.shared.subscribe()
    }

    /// Attach an observer; it sees notices emitted from now on
    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) -> JoinHandle<()> {
        spawn_listener(self.shared.subscribe(), listener)
    }

    pub fn coordinator(&self) -> &Arc<SubscriptionCoordinator> {
        &self.coordinator
    }

    /// Publish with the configured timeout
    pub async fn publish(&self, event: &Event) -> Result<PublishOutcome> {
        self.coordinator
            .publish(event, self.config.publish_timeout)
            .await
    }

    /// Query with the configured timeout
    pub async fn query(&self, filters: Vec<Filter>, mode: QueryMode) -> Result<QueryOutcome> {
        self.coordinator
            .query(filters, self.config.query_timeout, mode)
            .await
    }

    pub fn subscribe(&self, filters: Vec<Filter>) -> Result<Subscription> {
        self.coordinator.subscribe(filters)
    }

    /// Close the link, fail outstanding waiters and wait for the driver to stop
    pub async fn disconnect(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown(Some(ack))).is_ok() {
            let _ = done.await;
        }
        if let Some(handle) = self.driver.lock().await.take() {
            if let Err(e) = handle.await {
                error!(url = %self.url(), "Connection driver panicked: {}", e);
            }
        }
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown(None));
    }
}

impl core::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("url", &self.url())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

async fn handshake(
    connector: &dyn Connector,
    url: &Url,
    timeout: Duration,
) -> std::result::Result<RelayLink, TransportError> {
    match tokio::time::timeout(timeout, connector.connect(url)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::HandshakeTimeout {
            url: url.to_string(),
            duration_ms: timeout.as_millis() as u64,
        }),
    }
}

// ----------------------------------------------------------------------------
// Driver
// ----------------------------------------------------------------------------

enum Exit {
    Shutdown(Option<oneshot::Sender<()>>),
    Lost(String),
}

enum Recovery {
    Linked(RelayLink),
    Shutdown(Option<oneshot::Sender<()>>),
    GaveUp,
}

struct Driver {
    url: Url,
    shared: Arc<SharedState>,
    coordinator: Arc<SubscriptionCoordinator>,
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<Command>,
    auto_reconnect: bool,
    backoff: ReconnectManager,
    connection_timeout: Duration,
}

impl Driver {
    async fn run(mut self, mut link: RelayLink) {
        loop {
            let reason = match self.pump(&mut link).await {
                Exit::Shutdown(ack) => return self.finish(Some(link), ack).await,
                Exit::Lost(reason) => reason,
            };
            match self.recover(reason).await {
                Recovery::Linked(next) => link = next,
                Recovery::Shutdown(ack) => return self.finish(None, ack).await,
                Recovery::GaveUp => return,
            }
        }
    }

    /// Shuttle frames until the link drops or shutdown is requested
    async fn pump(&mut self, link: &mut RelayLink) -> Exit {
        let generation = self.shared.link();
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Frame { link: written_for, text }) if written_for != generation => {
                        self.discard(written_for, &text);
                    }
                    Some(Command::Frame { text, .. }) => {
                        if let Err(e) = link.sink.send(text).await {
                            return Exit::Lost(e.to_string());
                        }
                    }
                    Some(Command::Shutdown(ack)) => return Exit::Shutdown(ack),
                    None => return Exit::Shutdown(None),
                },
                inbound = link.stream.next() => match inbound {
                    Some(Ok(text)) => self.handle_frame(&text),
                    Some(Err(e)) => return Exit::Lost(e.to_string()),
                    None => return Exit::Lost("relay closed the connection".to_string()),
                },
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        match RelayMessage::from_json(text) {
            Ok(message) => self.coordinator.dispatch(message),
            Err(e) => warn!(url = %self.shared.url(), "Dropping unparsable frame: {}", e),
        }
    }

    /// Fail waiters, then retry the handshake with backoff
    async fn recover(&mut self, reason: String) -> Recovery {
        let url = self.shared.url().to_string();
        warn!(url = %url, "Relay connection lost: {}", reason);
        let next_state = if self.auto_reconnect {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Disconnected
        };
        self.shared.transition(next_state);
        self.coordinator.fail_all(&reason);
        self.shared.notify(ConnectionNotice::Disconnected {
            url: url.clone(),
            reason,
        });
        if !self.auto_reconnect {
            return Recovery::GaveUp;
        }

        loop {
            let Some(delay) = self.backoff.next_delay() else {
                let reason = format!(
                    "gave up after {} reconnect attempts",
                    self.backoff.attempt_count()
                );
                error!(url = %url, "{}", reason);
                self.shared.transition(ConnectionState::Disconnected);
                self.coordinator.fail_all(&reason);
                self.shared
                    .notify(ConnectionNotice::Disconnected { url, reason });
                return Recovery::GaveUp;
            };
            let attempt = self.backoff.attempt_count();
            self.shared.notify(ConnectionNotice::Reconnecting {
                url: url.clone(),
                attempt,
            });
            debug!(url = %url, "Reconnect attempt {} in {:?}", attempt, delay);

            if let Some(ack) = self.wait(delay).await {
                return Recovery::Shutdown(ack);
            }

            match handshake(self.connector.as_ref(), &self.url, self.connection_timeout).await {
                Ok(link) => {
                    self.backoff.reset();
                    self.shared.transition(ConnectionState::Connected);
                    self.shared
                        .notify(ConnectionNotice::Reconnected { url: url.clone() });
                    info!(url = %url, "Reconnected after {} attempts", attempt);
                    return Recovery::Linked(link);
                }
                Err(e) => warn!(url = %url, "Reconnect attempt {} failed: {}", attempt, e),
            }
        }
    }

    /// Sleep out a backoff delay; drops frames and returns early on shutdown
    async fn wait(&mut self, delay: Duration) -> Option<Option<oneshot::Sender<()>>> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return None,
                command = self.commands.recv() => match command {
                    Some(Command::Frame { link, text }) => self.discard(link, &text),
                    Some(Command::Shutdown(ack)) => return Some(ack),
                    None => return Some(None),
                },
            }
        }
    }

    fn discard(&self, written_for: u64, text: &str) {
        debug!(
            url = %self.shared.url(),
            link = written_for,
            "Discarding {} byte frame written for a lost link",
            text.len()
        );
    }

    async fn finish(self, link: Option<RelayLink>, ack: Option<oneshot::Sender<()>>) {
        if let Some(mut link) = link {
            if let Err(e) = link.sink.close().await {
                debug!(url = %self.shared.url(), "Error closing link: {}", e);
            }
        }
        self.coordinator
            .fail_all("connection closed by client");
        self.shared.transition(ConnectionState::Disconnected);
        self.shared.notify(ConnectionNotice::Disconnected {
            url: self.shared.url().to_string(),
            reason: "connection closed by client".to_string(),
        });
        info!(url = %self.shared.url(), "Disconnected from relay");
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }
}
