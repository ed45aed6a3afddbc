use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod feed;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use feed::{DEFAULT_FEED_CAPACITY, FeedEvent, MessageHub, MessageSubscription};
pub use ids::{ConversationId, Id, IdKind, MessageId, UserId};
pub use memory::{CallGate, MemoryStorage};
pub use sqlite::SqliteStorage;
pub use types::{
    ConversationRecord, MessageKind, MessagePatch, MessageRecord, NewMessage, NewProfile,
    ProfileRecord,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait ProfileStore: Send + Sync {
    fn list_profiles(&self, ids: Vec<UserId>) -> BoxFuture<'_, StorageResult<Vec<ProfileRecord>>>;
}

pub trait ConversationStore: Send + Sync {
    /// Conversations where `participant` is either side. No ordering is promised.
    fn list_conversations(
        &self,
        participant: UserId,
    ) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>>;
}

pub trait MessageStore: Send + Sync {
    fn insert_message(&self, input: NewMessage) -> BoxFuture<'_, StorageResult<MessageRecord>>;
    /// The most recent `limit` messages, returned ascending by `(created_at, id)`.
    fn list_recent_messages(
        &self,
        conversation_id: ConversationId,
        limit: usize,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>>;
    fn update_message(
        &self,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>>;
}

pub trait MessageFeed: Send + Sync {
    fn subscribe_inserts(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<MessageSubscription>>;
}

pub trait Backend: ProfileStore + ConversationStore + MessageStore + MessageFeed {}

impl<T> Backend for T where T: ProfileStore + ConversationStore + MessageStore + MessageFeed {}

pub(crate) fn unix_timestamp_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}
