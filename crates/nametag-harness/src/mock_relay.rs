//! Mock Relay for Testing
//!
//! An in-memory relay that speaks the wire protocol over channel-backed links.
//! It keeps a real event store with replaceable-event retention, answers
//! `REQ` from that store, fans new events out to open subscriptions and can be
//! told to drop sessions, refuse connections, stay silent or interleave its
//! responses.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use nametag_core::{kind, ClientMessage, Event, Filter, RelayMessage, TransportError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::transport::{Connector, RelayLink};

// ----------------------------------------------------------------------------
// Mock Relay Configuration
// ----------------------------------------------------------------------------

/// Configuration for mock relay behavior
#[derive(Debug, Clone)]
pub struct MockRelayConfig {
    /// Largest accepted EVENT frame in bytes (None = unlimited)
    pub max_frame_size: Option<usize>,
    /// Reject events whose id or signature does not verify
    pub verify_events: bool,
}

impl Default for MockRelayConfig {
    fn default() -> Self {
        Self {
            max_frame_size: Some(1024 * 1024),
            verify_events: true,
        }
    }
}

impl MockRelayConfig {
    /// No size ceiling and no verification
    pub fn permissive() -> Self {
        Self {
            max_frame_size: None,
            verify_events: false,
        }
    }
}

// ----------------------------------------------------------------------------
// Relay State
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct Session {
    outbound: mpsc::UnboundedSender<String>,
    subscriptions: HashMap<String, Vec<Filter>>,
    held: Vec<VecDeque<String>>,
}

impl Session {
    fn send(&self, frame: &RelayMessage) {
        match frame.as_json() {
            Ok(text) => {
                let _ = self.outbound.unbounded_send(text);
            }
            Err(e) => warn!("Mock relay could not encode frame: {}", e),
        }
    }

    fn flush_held(&mut self) {
        let mut queues = std::mem::take(&mut self.held);
        loop {
            let mut sent = false;
            for queue in queues.iter_mut() {
                if let Some(frame) = queue.pop_front() {
                    let _ = self.outbound.unbounded_send(frame);
                    sent = true;
                }
            }
            if !sent {
                break;
            }
        }
    }
}

#[derive(Debug, Default)]
struct RelayState {
    events: Vec<Event>,
    sessions: HashMap<u64, Session>,
    next_session_id: u64,
    connections_opened: u64,
    refuse_connections: bool,
    silent: bool,
    hold_responses: Option<usize>,
    received: Vec<String>,
}

/// Newest first; ties keep the lexically lowest id first
fn newest_first(a: &Event, b: &Event) -> std::cmp::Ordering {
    b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id))
}

fn replaces(existing: &Event, incoming: &Event) -> bool {
    if existing.pubkey != incoming.pubkey || existing.kind != incoming.kind {
        return false;
    }
    if kind::is_replaceable(incoming.kind) {
        return true;
    }
    kind::is_parameterized_replaceable(incoming.kind)
        && existing.identifier() == incoming.identifier()
}

impl RelayState {
    /// Apply retention rules; returns the OK frame and whether to fan out
    fn store(&mut self, event: &Event) -> (RelayMessage, bool) {
        if self.events.iter().any(|e| e.id == event.id) {
            return (
                RelayMessage::ok(&event.id, true, "duplicate: already have this event"),
                false,
            );
        }
        if kind::is_ephemeral(event.kind) {
            return (RelayMessage::ok(&event.id, true, ""), true);
        }
        if let Some(pos) = self.events.iter().position(|e| replaces(e, event)) {
            if newest_first(&self.events[pos], event).is_le() {
                return (
                    RelayMessage::ok(&event.id, true, "duplicate: have a newer event"),
                    false,
                );
            }
            let old = self.events.remove(pos);
            debug!("Mock relay replaced {} with {}", old.id, event.id);
        }
        self.events.push(event.clone());
        (RelayMessage::ok(&event.id, true, ""), true)
    }

    fn query(&self, filters: &[Filter]) -> Vec<Event> {
        let mut seen = HashSet::new();
        let mut results = Vec::new();
        for filter in filters {
            let mut matched: Vec<&Event> = self.events.iter().filter(|e| filter.matches(e)).collect();
            matched.sort_by(|a, b| newest_first(a, b));
            let limit = filter.limit.unwrap_or(usize::MAX);
            for event in matched.into_iter().take(limit) {
                if seen.insert(event.id.clone()) {
                    results.push(event.clone());
                }
            }
        }
        results.sort_by(newest_first);
        results
    }

    fn fan_out(&self, event: &Event) {
        for session in self.sessions.values() {
            for (subscription_id, filters) in &session.subscriptions {
                if filters.iter().any(|f| f.matches(event)) {
                    session.send(&RelayMessage::event(subscription_id, event.clone()));
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Mock Relay
// ----------------------------------------------------------------------------

/// Shared handle to an in-memory relay
#[derive(Debug, Clone)]
pub struct MockRelay {
    state: Arc<Mutex<RelayState>>,
    config: MockRelayConfig,
}

impl Default for MockRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRelay {
    pub fn new() -> Self {
        Self::with_config(MockRelayConfig::default())
    }

    pub fn with_config(config: MockRelayConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState::default())),
            config,
        }
    }

    /// Connector that opens sessions on this relay
    pub fn connector(&self) -> MockConnector {
        MockConnector {
            relay: self.clone(),
        }
    }

    async fn open_session(&self, url: &Url) -> Result<RelayLink, TransportError> {
        let mut state = self.state.lock().await;
        if state.refuse_connections {
            return Err(TransportError::ConnectFailed {
                url: url.to_string(),
                reason: "mock relay is refusing connections".into(),
            });
        }

        let (client_tx, mut relay_rx) = mpsc::unbounded::<String>();
        let (relay_tx, client_rx) = mpsc::unbounded::<String>();

        let session_id = state.next_session_id;
        state.next_session_id += 1;
        state.connections_opened += 1;
        state.sessions.insert(
            session_id,
            Session {
                outbound: relay_tx,
                subscriptions: HashMap::new(),
                held: Vec::new(),
            },
        );
        drop(state);
        info!("Mock relay opened session {} for {}", session_id, url);

        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = relay_rx.next().await {
                relay.handle_frame(session_id, frame).await;
            }
            relay.state.lock().await.sessions.remove(&session_id);
            debug!("Mock relay session {} ended", session_id);
        });

        let sink = client_tx.sink_map_err(|e| TransportError::SendFailed {
            reason: e.to_string(),
        });
        let stream = client_rx.map(Ok::<String, TransportError>);
        Ok(RelayLink::new(Box::pin(sink), Box::pin(stream)))
    }

    async fn handle_frame(&self, session_id: u64, text: String) {
        let mut state = self.state.lock().await;
        // A dropped session's socket is gone; nothing it writes arrives
        if !state.sessions.contains_key(&session_id) {
            debug!("Mock relay ignoring frame on closed session {}", session_id);
            return;
        }
        state.received.push(text.clone());
        if state.silent {
            return;
        }

        let message = match ClientMessage::from_json(&text) {
            Ok(message) => message,
            Err(e) => {
                if let Some(session) = state.sessions.get(&session_id) {
                    session.send(&RelayMessage::Notice(format!("error: {e}")));
                }
                return;
            }
        };

        match message {
            ClientMessage::Event(event) => {
                let reply = self.admit(&mut state, &text, &event);
                if let Some(session) = state.sessions.get(&session_id) {
                    session.send(&reply);
                }
            }
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut frames: VecDeque<String> = state
                    .query(&filters)
                    .into_iter()
                    .filter_map(|e| RelayMessage::event(&subscription_id, e).as_json().ok())
                    .collect();
                frames.extend(
                    RelayMessage::EndOfStoredEvents(subscription_id.clone())
                        .as_json()
                        .ok(),
                );
                let hold = state.hold_responses;
                let Some(session) = state.sessions.get_mut(&session_id) else {
                    return;
                };
                session.subscriptions.insert(subscription_id, filters);
                match hold {
                    Some(threshold) => {
                        session.held.push(frames);
                        if session.held.len() >= threshold {
                            session.flush_held();
                        }
                    }
                    None => {
                        for frame in frames {
                            let _ = session.outbound.unbounded_send(frame);
                        }
                    }
                }
            }
            ClientMessage::Close(subscription_id) => {
                if let Some(session) = state.sessions.get_mut(&session_id) {
                    session.subscriptions.remove(&subscription_id);
                }
            }
        }
    }

    fn admit(&self, state: &mut RelayState, frame: &str, event: &Event) -> RelayMessage {
        if let Some(max) = self.config.max_frame_size {
            if frame.len() > max {
                return RelayMessage::ok(
                    &event.id,
                    false,
                    format!("invalid: event too large ({} bytes, limit {})", frame.len(), max),
                );
            }
        }
        if self.config.verify_events {
            if let Err(e) = event.verify() {
                return RelayMessage::ok(&event.id, false, format!("invalid: {e}"));
            }
        }
        let (reply, fan_out) = state.store(event);
        if fan_out {
            state.fan_out(event);
        }
        reply
    }

    // ------------------------------------------------------------------------
    // Controls
    // ------------------------------------------------------------------------

    /// Store an event directly, bypassing any session
    pub async fn seed(&self, event: Event) -> RelayMessage {
        let mut state = self.state.lock().await;
        let (reply, fan_out) = state.store(&event);
        if fan_out {
            state.fan_out(&event);
        }
        reply
    }

    /// Close every open session, as a relay restart would
    pub async fn disconnect_all(&self) {
        let mut state = self.state.lock().await;
        for (_, session) in state.sessions.drain() {
            session.outbound.close_channel();
        }
        info!("Mock relay dropped all sessions");
    }

    /// Refuse (`false`) or accept (`true`) new connections
    pub async fn set_accepting(&self, accepting: bool) {
        self.state.lock().await.refuse_connections = !accepting;
    }

    /// Swallow every client frame without answering
    pub async fn set_silent(&self, silent: bool) {
        self.state.lock().await.silent = silent;
    }

    /// Buffer REQ responses per session until `threshold` are pending, then
    /// emit them round-robin
    pub async fn hold_responses(&self, threshold: Option<usize>) {
        self.state.lock().await.hold_responses = threshold;
    }

    /// Push a NOTICE to every session
    pub async fn send_notice(&self, message: &str) {
        let state = self.state.lock().await;
        for session in state.sessions.values() {
            session.send(&RelayMessage::Notice(message.to_string()));
        }
    }

    /// Push an arbitrary text frame to every session
    pub async fn send_raw(&self, text: &str) {
        let state = self.state.lock().await;
        for session in state.sessions.values() {
            let _ = session.outbound.unbounded_send(text.to_string());
        }
    }

    pub async fn received_frames(&self) -> Vec<String> {
        self.state.lock().await.received.clone()
    }

    pub async fn stored_events(&self) -> Vec<Event> {
        self.state.lock().await.events.clone()
    }

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    pub async fn connections_opened(&self) -> u64 {
        self.state.lock().await.connections_opened
    }

    /// Open subscriptions across all sessions
    pub async fn subscription_count(&self) -> usize {
        self.state
            .lock()
            .await
            .sessions
            .values()
            .map(|s| s.subscriptions.len())
            .sum()
    }
}

// ----------------------------------------------------------------------------
// Mock Connector
// ----------------------------------------------------------------------------

/// Connector backed by a [`MockRelay`]
#[derive(Debug, Clone)]
pub struct MockConnector {
    relay: MockRelay,
}

impl MockConnector {
    pub fn relay(&self) -> &MockRelay {
        &self.relay
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &Url) -> Result<RelayLink, TransportError> {
        self.relay.open_session(url).await
    }
}
