//! Relay client facade
//!
//! [`RelayClient`] pairs a set of keys with one [`RelayConnection`] and a
//! [`ContentCipher`]. It is explicitly constructed and owned; share it by
//! reference or wrap it in an `Arc`.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use nametag_core::{
    build_message_event, inbox_filter, Event, Filter, Keys, NametagError, Result,
};
use nametag_harness::Connector;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cipher::{ContentCipher, Nip04Cipher};
use crate::config::RelayConfig;
use crate::connection::RelayConnection;
use crate::coordinator::{PublishOutcome, QueryMode};
use crate::state::{ConnectionListener, ConnectionNotice, ConnectionState};
use crate::subscription::{Subscription, SubscriptionItem};
use crate::websocket::WebSocketConnector;

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

/// Builder for [`RelayClient`]
pub struct RelayClientBuilder {
    keys: Keys,
    config: RelayConfig,
    connector: Option<Arc<dyn Connector>>,
    cipher: Option<Arc<dyn ContentCipher>>,
    listeners: Vec<Arc<dyn ConnectionListener>>,
}

impl RelayClientBuilder {
    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    /// Transport used for the handshake and every reconnect
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    pub fn cipher(mut self, cipher: impl ContentCipher) -> Self {
        self.cipher = Some(Arc::new(cipher));
        self
    }

    /// Listener attached before connecting, so it also sees the first notice
    pub fn listener(mut self, listener: impl ConnectionListener) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    pub async fn connect(self) -> Result<RelayClient> {
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WebSocketConnector::new()));
        let cipher = self
            .cipher
            .unwrap_or_else(|| Arc::new(Nip04Cipher::new(self.config.compression_threshold)));
        let connection =
            RelayConnection::connect_with_listeners(self.config, connector, self.listeners)
                .await?;
        info!(
            pubkey = %self.keys.public_key_hex(),
            url = %connection.url(),
            "Relay client ready"
        );
        Ok(RelayClient {
            keys: self.keys,
            connection,
            cipher,
        })
    }
}

// ----------------------------------------------------------------------------
// Relay Client
// ----------------------------------------------------------------------------

/// Publish acknowledgement for an event built by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub event_id: String,
    pub outcome: PublishOutcome,
}

/// One decrypted message addressed to this client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub event_id: String,
    pub sender: String,
    pub payload: String,
    pub created_at: u64,
}

/// Signing identity plus a live relay connection
pub struct RelayClient {
    keys: Keys,
    connection: RelayConnection,
    cipher: Arc<dyn ContentCipher>,
}

impl RelayClient {
    pub fn builder(keys: Keys) -> RelayClientBuilder {
        RelayClientBuilder {
            keys,
            config: RelayConfig::default(),
            connector: None,
            cipher: None,
            listeners: Vec::new(),
        }
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    /// Hex x-only public key of this client
    pub fn public_key(&self) -> String {
        self.keys.public_key_hex()
    }

    pub fn connection(&self) -> &RelayConnection {
        &self.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn notices(&self) -> broadcast::Receiver<ConnectionNotice> {
        self.connection.notices()
    }

    pub fn add_listener(&self, listener: impl ConnectionListener) -> JoinHandle<()> {
        self.connection.add_listener(Arc::new(listener))
    }

    pub async fn publish(&self, event: &Event) -> Result<PublishOutcome> {
        self.connection.publish(event).await
    }

    pub(crate) async fn publish_receipt(&self, event: Event) -> Result<PublishReceipt> {
        let outcome = self.connection.publish(&event).await?;
        Ok(PublishReceipt {
            event_id: event.id,
            outcome,
        })
    }

    /// First event matching `filter`, `None` once the relay reports no match
    pub async fn query_first(&self, filter: Filter) -> Result<Option<Event>> {
        Ok(self
            .connection
            .query(vec![filter], QueryMode::FirstMatch)
            .await?
            .into_first())
    }

    /// Every stored event matching any of `filters`
    pub async fn query_all(&self, filters: Vec<Filter>) -> Result<Vec<Event>> {
        Ok(self
            .connection
            .query(filters, QueryMode::Collect)
            .await?
            .into_all())
    }

    pub fn subscribe(&self, filters: Vec<Filter>) -> Result<Subscription> {
        self.connection.subscribe(filters)
    }

    // ------------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------------

    /// Encrypt `payload` for `recipient` and publish it
    pub async fn publish_message(&self, recipient: &str, payload: &str) -> Result<PublishReceipt> {
        let ciphertext = self.cipher.encrypt(payload, recipient, &self.keys)?;
        let event = build_message_event(&self.keys, recipient, ciphertext)?;
        debug!(event_id = %event.id, recipient = %recipient, "Publishing message");
        self.publish_receipt(event).await
    }

    /// Stream of messages addressed to this client, optionally since a time
    pub fn subscribe_messages(&self, since: Option<u64>) -> Result<MessageInbox> {
        let subscription = self.subscribe(vec![inbox_filter(&self.public_key(), since)])?;
        Ok(MessageInbox {
            subscription,
            keys: self.keys.clone(),
            cipher: Arc::clone(&self.cipher),
            url: self.connection.url().to_string(),
        })
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await
    }
}

impl core::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RelayClient")
            .field("pubkey", &self.public_key())
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Message Inbox
// ----------------------------------------------------------------------------

/// Decrypting view over a message subscription
///
/// Messages that fail to decrypt surface as `Err` items and the stream goes
/// on. A relay close or connection loss is the final item.
pub struct MessageInbox {
    subscription: Subscription,
    keys: Keys,
    cipher: Arc<dyn ContentCipher>,
    url: String,
}

impl MessageInbox {
    pub fn subscription_id(&self) -> &str {
        self.subscription.id()
    }

    pub fn close(&mut self) {
        self.subscription.close()
    }

    fn open(&self, event: Event) -> Option<Result<ReceivedMessage>> {
        let own_key = self.keys.public_key_hex();
        if event.tag_value("p") != Some(own_key.as_str()) {
            warn!(event_id = %event.id, "Skipping message not addressed to this key");
            return None;
        }
        let opened = self
            .cipher
            .decrypt(&event.content, &event.pubkey, &self.keys)
            .map(|payload| ReceivedMessage {
                event_id: event.id.clone(),
                sender: event.pubkey.clone(),
                payload,
                created_at: event.created_at,
            });
        if let Err(e) = &opened {
            warn!(event_id = %event.id, "Could not decrypt message: {}", e);
        }
        Some(opened)
    }
}

impl Stream for MessageInbox {
    type Item = Result<ReceivedMessage>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let item = match self.subscription.poll_next_unpin(cx) {
                Poll::Ready(Some(item)) => item,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            };
            match item {
                SubscriptionItem::Event(event) => {
                    if let Some(message) = self.open(*event) {
                        return Poll::Ready(Some(message));
                    }
                }
                SubscriptionItem::EndOfStoredEvents => {}
                SubscriptionItem::Closed { message } => {
                    return Poll::Ready(Some(Err(NametagError::SubscriptionClosed {
                        subscription_id: self.subscription.id().to_string(),
                        message,
                    })))
                }
                SubscriptionItem::ConnectionLost { reason } => {
                    return Poll::Ready(Some(Err(NametagError::connection_lost(
                        &self.url, reason,
                    ))))
                }
            }
        }
    }
}

impl core::fmt::Debug for MessageInbox {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MessageInbox")
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}
