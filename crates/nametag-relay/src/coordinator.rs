//! Subscription Coordinator
//!
//! Correlates relay responses with the callers waiting for them. Publishes
//! wait on `OK` frames keyed by event id; queries and streaming subscriptions
//! wait on frames keyed by a fresh subscription id.
//!
//! The connection driver is the only caller of [`SubscriptionCoordinator::dispatch`].
//! Dispatch never awaits: it looks up a waiter, hands the frame over and
//! returns, so a slow caller can never stall the reader.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nametag_core::{
    ClientMessage, Event, Filter, NametagError, RelayMessage, Result, TransportError,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::connection::Command;
use crate::state::{ConnectionState, SharedState};
use crate::subscription::{Subscription, SubscriptionItem};

// ----------------------------------------------------------------------------
// Outcomes
// ----------------------------------------------------------------------------

/// Why a relay declined an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectionKind {
    /// Frame exceeded a size ceiling, locally or at the relay
    TooLarge,
    Duplicate,
    Blocked,
    RateLimited,
    Invalid,
    Pow,
    Restricted,
    AuthRequired,
    Error,
    Other,
}

/// A declined publish with the relay's reason text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub message: String,
}

impl Rejection {
    /// Classify a relay `OK false` message by its machine-readable prefix
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        let kind = if ["too large", "too big", "exceeds"]
            .iter()
            .any(|marker| lower.contains(marker))
        {
            RejectionKind::TooLarge
        } else {
            match lower.split(':').next().map(str::trim) {
                Some("duplicate") => RejectionKind::Duplicate,
                Some("blocked") => RejectionKind::Blocked,
                Some("rate-limited") => RejectionKind::RateLimited,
                Some("invalid") => RejectionKind::Invalid,
                Some("pow") => RejectionKind::Pow,
                Some("restricted") => RejectionKind::Restricted,
                Some("auth-required") => RejectionKind::AuthRequired,
                Some("error") => RejectionKind::Error,
                _ => RejectionKind::Other,
            }
        };
        Self { kind, message }
    }

    pub(crate) fn too_large(frame_len: usize, limit: usize) -> Self {
        Self {
            kind: RejectionKind::TooLarge,
            message: format!("event frame is {frame_len} bytes, limit is {limit}"),
        }
    }
}

/// Result of a publish that got an answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Accepted,
    Rejected(Rejection),
}

impl PublishOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// How a query resolves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    /// Resolve on the first matching event, `None` if EOSE comes first
    FirstMatch,
    /// Collect every event up to EOSE
    Collect,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    First(Option<Event>),
    All(Vec<Event>),
}

impl QueryOutcome {
    pub fn into_first(self) -> Option<Event> {
        match self {
            Self::First(event) => event,
            Self::All(events) => events.into_iter().next(),
        }
    }

    pub fn into_all(self) -> Vec<Event> {
        match self {
            Self::First(event) => event.into_iter().collect(),
            Self::All(events) => events,
        }
    }
}

// ----------------------------------------------------------------------------
// Waiters
// ----------------------------------------------------------------------------

type PublishReply = oneshot::Sender<Result<PublishOutcome>>;

enum Waiter {
    Query {
        mode: QueryMode,
        collected: Vec<Event>,
        reply: oneshot::Sender<Result<QueryOutcome>>,
    },
    Stream {
        sender: mpsc::UnboundedSender<SubscriptionItem>,
    },
}

/// Coordinator settings taken from the relay configuration
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub max_frame_size: usize,
    pub verify_inbound_events: bool,
}

/// Waiter tables for one relay connection
pub struct SubscriptionCoordinator {
    shared: Arc<SharedState>,
    commands: mpsc::UnboundedSender<Command>,
    settings: CoordinatorSettings,
    publishes: DashMap<String, VecDeque<(u64, PublishReply)>>,
    subscriptions: DashMap<String, Waiter>,
    next_ticket: AtomicU64,
}

impl SubscriptionCoordinator {
    pub(crate) fn new(
        shared: Arc<SharedState>,
        commands: mpsc::UnboundedSender<Command>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            shared,
            commands,
            settings,
            publishes: DashMap::new(),
            subscriptions: DashMap::new(),
            next_ticket: AtomicU64::new(0),
        }
    }

    // ------------------------------------------------------------------------
    // Publish
    // ------------------------------------------------------------------------

    /// Send an event and wait for the relay's `OK`
    pub async fn publish(&self, event: &Event, timeout: Duration) -> Result<PublishOutcome> {
        let frame = ClientMessage::event(event.clone()).as_json()?;
        if frame.len() > self.settings.max_frame_size {
            warn!(
                event_id = %event.id,
                "Refusing to send {} byte event frame (limit {})",
                frame.len(),
                self.settings.max_frame_size
            );
            return Ok(PublishOutcome::Rejected(Rejection::too_large(
                frame.len(),
                self.settings.max_frame_size,
            )));
        }
        let link = self.ensure_connected()?;

        let (reply, response) = oneshot::channel();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.publishes
            .entry(event.id.clone())
            .or_default()
            .push_back((ticket, reply));
        let _guard = PublishGuard {
            coordinator: self,
            event_id: &event.id,
            ticket,
        };

        self.confirm_link(link)?;
        self.send(link, frame)?;
        debug!(event_id = %event.id, "Published event, waiting for OK");

        let waited = tokio::time::timeout(timeout, response).await;
        match waited {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(self.lost("publish waiter dropped")),
            Err(_) => Err(NametagError::Timeout {
                operation: "publish",
                correlation_id: event.id.clone(),
                duration: timeout,
            }),
        }
    }

    fn remove_publish_waiter(&self, event_id: &str, ticket: u64) {
        if let Some(mut queue) = self.publishes.get_mut(event_id) {
            queue.retain(|(t, _)| *t != ticket);
        }
        self.publishes.remove_if(event_id, |_, queue| queue.is_empty());
    }

    fn resolve_publish(&self, event_id: &str, accepted: bool, message: String) {
        let mut outcome = Some(if accepted {
            Ok(PublishOutcome::Accepted)
        } else {
            Ok(PublishOutcome::Rejected(Rejection::from_message(message)))
        });
        if let Some(mut queue) = self.publishes.get_mut(event_id) {
            while let Some(next) = outcome.take() {
                let Some((_, reply)) = queue.pop_front() else {
                    outcome = Some(next);
                    break;
                };
                // Caller already gave up; hand the answer to the next one
                if let Err(unsent) = reply.send(next) {
                    outcome = Some(unsent);
                }
            }
        }
        self.publishes.remove_if(event_id, |_, queue| queue.is_empty());
        if outcome.is_some() {
            debug!(event_id = %event_id, "Dropping OK with no waiting publisher");
        }
    }

    // ------------------------------------------------------------------------
    // Query
    // ------------------------------------------------------------------------

    /// Send a `REQ` and wait for the first match or for EOSE
    ///
    /// "Nothing found" is `First(None)` or an empty `All`, never an error.
    pub async fn query(
        &self,
        filters: Vec<Filter>,
        timeout: Duration,
        mode: QueryMode,
    ) -> Result<QueryOutcome> {
        let link = self.ensure_connected()?;
        let (reply, response) = oneshot::channel();
        let subscription_id = self.register(Waiter::Query {
            mode,
            collected: Vec::new(),
            reply,
        });
        if let Err(e) = self.confirm_link(link) {
            self.subscriptions.remove(&subscription_id);
            return Err(e);
        }
        let _guard = QueryGuard {
            coordinator: self,
            subscription_id: &subscription_id,
        };

        self.send(link, ClientMessage::req(subscription_id.clone(), filters).as_json()?)?;
        trace!(subscription_id = %subscription_id, ?mode, "Query sent");

        let waited = tokio::time::timeout(timeout, response).await;
        match waited {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(self.lost("query waiter dropped")),
            Err(_) => Err(NametagError::Timeout {
                operation: "query",
                correlation_id: subscription_id.clone(),
                duration: timeout,
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Streaming Subscriptions
    // ------------------------------------------------------------------------

    /// Open a long-lived subscription
    pub fn subscribe(self: &Arc<Self>, filters: Vec<Filter>) -> Result<Subscription> {
        let link = self.ensure_connected()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let subscription_id = self.register(Waiter::Stream { sender });
        if let Err(e) = self.confirm_link(link) {
            self.subscriptions.remove(&subscription_id);
            return Err(e);
        }
        let subscription = Subscription::new(subscription_id.clone(), receiver, Arc::clone(self));

        // On failure the handle drops and removes its waiter
        self.send(link, ClientMessage::req(subscription_id.clone(), filters).as_json()?)?;
        info!(subscription_id = %subscription_id, "Subscription opened");
        Ok(subscription)
    }

    /// Forget a subscription and tell the relay; a no-op for unknown ids
    pub fn close_subscription(&self, subscription_id: &str) {
        if self.subscriptions.remove(subscription_id).is_some() {
            self.send_close(subscription_id);
        }
    }

    fn register(&self, waiter: Waiter) -> String {
        let mut waiter = Some(waiter);
        loop {
            let subscription_id = Uuid::new_v4().simple().to_string();
            if let Entry::Vacant(slot) = self.subscriptions.entry(subscription_id.clone()) {
                if let Some(waiter) = waiter.take() {
                    slot.insert(waiter);
                }
                return subscription_id;
            }
            warn!("Subscription id {} collided, drawing another", subscription_id);
        }
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Route one inbound frame to its waiter
    pub(crate) fn dispatch(&self, message: RelayMessage) {
        match message {
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => self.resolve_publish(&event_id, accepted, message),
            RelayMessage::Event {
                subscription_id,
                event,
            } => self.deliver_event(subscription_id, *event),
            RelayMessage::EndOfStoredEvents(subscription_id) => {
                self.end_of_stored_events(subscription_id)
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => self.relay_closed(subscription_id, message),
            RelayMessage::Notice(message) => {
                info!(url = %self.shared.url(), "Relay notice: {}", message);
            }
            RelayMessage::Auth(challenge) => {
                debug!(url = %self.shared.url(), "Ignoring AUTH challenge {}", challenge);
            }
        }
    }

    fn deliver_event(&self, subscription_id: String, event: Event) {
        if self.settings.verify_inbound_events {
            if let Err(e) = event.verify() {
                warn!(
                    subscription_id = %subscription_id,
                    event_id = %event.id,
                    "Dropping event that failed verification: {}",
                    e
                );
                return;
            }
        }

        let Entry::Occupied(mut slot) = self.subscriptions.entry(subscription_id.clone()) else {
            debug!(subscription_id = %subscription_id, "Dropping EVENT for unknown subscription");
            return;
        };
        match slot.get_mut() {
            Waiter::Query {
                mode: QueryMode::Collect,
                collected,
                ..
            } => collected.push(event),
            Waiter::Query {
                mode: QueryMode::FirstMatch,
                ..
            } => {
                if let Waiter::Query { reply, .. } = slot.remove() {
                    let _ = reply.send(Ok(QueryOutcome::First(Some(event))));
                }
                self.send_close(&subscription_id);
            }
            Waiter::Stream { sender } => {
                if sender.send(SubscriptionItem::Event(Box::new(event))).is_err() {
                    slot.remove();
                    self.send_close(&subscription_id);
                }
            }
        }
    }

    fn end_of_stored_events(&self, subscription_id: String) {
        let Entry::Occupied(slot) = self.subscriptions.entry(subscription_id.clone()) else {
            debug!(subscription_id = %subscription_id, "Dropping EOSE for unknown subscription");
            return;
        };
        if let Waiter::Stream { sender } = slot.get() {
            let _ = sender.send(SubscriptionItem::EndOfStoredEvents);
            return;
        }
        if let Waiter::Query {
            mode,
            collected,
            reply,
        } = slot.remove()
        {
            let outcome = match mode {
                QueryMode::FirstMatch => QueryOutcome::First(None),
                QueryMode::Collect => QueryOutcome::All(collected),
            };
            let _ = reply.send(Ok(outcome));
        }
        self.send_close(&subscription_id);
    }

    fn relay_closed(&self, subscription_id: String, message: String) {
        let Some((_, waiter)) = self.subscriptions.remove(&subscription_id) else {
            debug!(subscription_id = %subscription_id, "Dropping CLOSED for unknown subscription");
            return;
        };
        warn!(subscription_id = %subscription_id, "Relay closed subscription: {}", message);
        match waiter {
            Waiter::Query { reply, .. } => {
                let _ = reply.send(Err(NametagError::SubscriptionClosed {
                    subscription_id,
                    message,
                }));
            }
            Waiter::Stream { sender } => {
                let _ = sender.send(SubscriptionItem::Closed { message });
            }
        }
    }

    /// Fail every outstanding waiter with `ConnectionLost`
    pub(crate) fn fail_all(&self, reason: &str) {
        let url = self.shared.url().to_string();
        let mut failed = 0usize;

        let event_ids: Vec<String> = self.publishes.iter().map(|e| e.key().clone()).collect();
        for event_id in event_ids {
            let Some((_, queue)) = self.publishes.remove(&event_id) else {
                continue;
            };
            for (_, reply) in queue {
                failed += 1;
                let _ = reply.send(Err(NametagError::connection_lost(&url, reason)));
            }
        }

        let subscription_ids: Vec<String> =
            self.subscriptions.iter().map(|e| e.key().clone()).collect();
        for subscription_id in subscription_ids {
            let Some((_, waiter)) = self.subscriptions.remove(&subscription_id) else {
                continue;
            };
            failed += 1;
            match waiter {
                Waiter::Query { reply, .. } => {
                    let _ = reply.send(Err(NametagError::connection_lost(&url, reason)));
                }
                Waiter::Stream { sender } => {
                    let _ = sender.send(SubscriptionItem::ConnectionLost {
                        reason: reason.to_string(),
                    });
                }
            }
        }

        if failed > 0 {
            info!(url = %url, "Failed {} outstanding waiters: {}", failed, reason);
        }
    }

    /// Outstanding publishes plus open subscriptions
    pub fn pending_count(&self) -> usize {
        let publishes: usize = self.publishes.iter().map(|queue| queue.len()).sum();
        publishes + self.subscriptions.len()
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    /// Generation of the live link, or `NotConnected`
    fn ensure_connected(&self) -> Result<u64> {
        match self.shared.snapshot() {
            (ConnectionState::Connected, link) => Ok(link),
            _ => Err(TransportError::NotConnected {
                url: self.shared.url().to_string(),
            }
            .into()),
        }
    }

    /// Called after registering a waiter. A link lost between
    /// `ensure_connected` and the registration failed its waiters without
    /// seeing this one.
    fn confirm_link(&self, link: u64) -> Result<()> {
        if self.shared.snapshot() == (ConnectionState::Connected, link) {
            Ok(())
        } else {
            Err(self.lost("connection dropped before the frame was sent"))
        }
    }

    fn send(&self, link: u64, text: String) -> Result<()> {
        self.commands.send(Command::Frame { link, text }).map_err(|_| {
            NametagError::from(TransportError::NotConnected {
                url: self.shared.url().to_string(),
            })
        })
    }

    fn send_close(&self, subscription_id: &str) {
        match ClientMessage::close(subscription_id).as_json() {
            Ok(frame) => {
                // Advisory; the driver may already be gone
                let _ = self.commands.send(Command::Frame {
                    link: self.shared.link(),
                    text: frame,
                });
            }
            Err(e) => warn!("Could not encode CLOSE for {}: {}", subscription_id, e),
        }
    }

    fn lost(&self, reason: &str) -> NametagError {
        NametagError::connection_lost(self.shared.url(), reason)
    }
}

impl core::fmt::Debug for SubscriptionCoordinator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SubscriptionCoordinator")
            .field("url", &self.shared.url())
            .field("publishes", &self.publishes.len())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Guards
// ----------------------------------------------------------------------------

struct PublishGuard<'a> {
    coordinator: &'a SubscriptionCoordinator,
    event_id: &'a str,
    ticket: u64,
}

impl Drop for PublishGuard<'_> {
    fn drop(&mut self) {
        self.coordinator
            .remove_publish_waiter(self.event_id, self.ticket);
    }
}

/// Closes the query's subscription unless dispatch already did
struct QueryGuard<'a> {
    coordinator: &'a SubscriptionCoordinator,
    subscription_id: &'a str,
}

impl Drop for QueryGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.close_subscription(self.subscription_id);
    }
}
