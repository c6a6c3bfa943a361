//! Long-lived subscription handles

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use nametag_core::Event;
use tokio::sync::mpsc;

use crate::coordinator::SubscriptionCoordinator;

/// One item delivered to a streaming subscription
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionItem {
    /// A stored or live event matching the filters
    Event(Box<Event>),
    /// The relay has sent every stored match; live events follow
    EndOfStoredEvents,
    /// The relay ended the subscription
    Closed { message: String },
    /// The connection dropped; the subscription is gone and will not resume
    ConnectionLost { reason: String },
}

impl SubscriptionItem {
    /// Whether nothing can follow this item
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed { .. } | Self::ConnectionLost { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Open,
    Closed,
}

/// Handle to an open `REQ`
///
/// Yields [`SubscriptionItem`]s until the relay closes it, the connection
/// drops, or [`Subscription::close`] is called. Dropping the handle closes it.
pub struct Subscription {
    id: String,
    receiver: mpsc::UnboundedReceiver<SubscriptionItem>,
    coordinator: Arc<SubscriptionCoordinator>,
    state: SubscriptionState,
}

impl Subscription {
    pub(crate) fn new(
        id: String,
        receiver: mpsc::UnboundedReceiver<SubscriptionItem>,
        coordinator: Arc<SubscriptionCoordinator>,
    ) -> Self {
        Self {
            id,
            receiver,
            coordinator,
            state: SubscriptionState::Open,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Send `CLOSE` and stop delivery; a no-op once closed
    pub fn close(&mut self) {
        if self.state == SubscriptionState::Closed {
            return;
        }
        self.state = SubscriptionState::Closed;
        self.receiver.close();
        self.coordinator.close_subscription(&self.id);
    }
}

impl Stream for Subscription {
    type Item = SubscriptionItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.state == SubscriptionState::Closed {
            return Poll::Ready(None);
        }
        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(item)) => {
                if item.is_terminal() {
                    self.state = SubscriptionState::Closed;
                }
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => {
                self.state = SubscriptionState::Closed;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl core::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}
