use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::ids::ConversationId;
use super::types::MessageRecord;

/// Default per-subscriber backlog before a slow subscriber starts lagging.
pub const DEFAULT_FEED_CAPACITY: usize = 256;

/// One item delivered by a live insert subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    Inserted(MessageRecord),
    /// The subscriber fell behind and `skipped` inserts were dropped from its backlog.
    Lagged { skipped: u64 },
}

/// Process-local fan-out of message inserts, filtered per conversation on the receiving side.
#[derive(Debug)]
pub struct MessageHub {
    sender: ArcSwap<broadcast::Sender<MessageRecord>>,
    capacity: usize,
}

impl Default for MessageHub {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl MessageHub {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: ArcSwap::from_pointee(sender),
            capacity,
        }
    }

    pub fn publish(&self, record: MessageRecord) {
        // No receivers is the common idle case, not a failure.
        let receivers = self.sender.load().send(record).unwrap_or(0);
        tracing::trace!(receivers, "published message insert");
    }

    pub fn subscribe(&self, conversation_id: ConversationId) -> MessageSubscription {
        MessageSubscription::new(conversation_id, self.sender.load().subscribe())
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.load().receiver_count()
    }

    /// Closes every open subscription by swapping in a fresh channel.
    pub fn disconnect_all(&self) {
        let (sender, _) = broadcast::channel(self.capacity);
        self.sender.store(Arc::new(sender));
    }
}

/// Live feed of inserts for one conversation. Dropping it releases the feed.
#[derive(Debug)]
pub struct MessageSubscription {
    conversation_id: ConversationId,
    events: Option<broadcast::Receiver<MessageRecord>>,
}

impl MessageSubscription {
    pub(crate) fn new(
        conversation_id: ConversationId,
        events: broadcast::Receiver<MessageRecord>,
    ) -> Self {
        Self {
            conversation_id,
            events: Some(events),
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn is_active(&self) -> bool {
        self.events.is_some()
    }

    /// Waits for the next insert in this conversation. `None` once cancelled or closed upstream.
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        loop {
            let events = self.events.as_mut()?;
            match events.recv().await {
                Ok(record) if record.conversation_id == self.conversation_id => {
                    return Some(FeedEvent::Inserted(record));
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => return Some(FeedEvent::Lagged { skipped }),
                Err(RecvError::Closed) => {
                    self.events = None;
                    return None;
                }
            }
        }
    }

    /// Releases the feed. Safe to call more than once.
    pub fn cancel(&mut self) {
        if self.events.take().is_some() {
            tracing::debug!(conversation_id = %self.conversation_id, "message subscription cancelled");
        }
    }
}
