use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use snafu::OptionExt;
use tokio::sync::{Mutex, watch};

use super::error::{ConflictSnafu, NotFoundSnafu, StorageResult, UnavailableSnafu};
use super::feed::{MessageHub, MessageSubscription};
use super::ids::{ConversationId, MessageId, UserId};
use super::types::{
    ConversationRecord, MessagePatch, MessageRecord, NewMessage, NewProfile, ProfileRecord,
};
use super::{
    BoxFuture, ConversationStore, MessageFeed, MessageStore, ProfileStore, unix_timestamp_millis,
};

#[derive(Debug, Default)]
struct MemoryState {
    profiles: HashMap<UserId, ProfileRecord>,
    conversations: HashMap<ConversationId, ConversationRecord>,
    messages: Vec<MessageRecord>,
}

impl MemoryState {
    fn record_message(&mut self, record: MessageRecord) {
        if let Some(conversation) = self.conversations.get_mut(&record.conversation_id) {
            let is_newest = conversation
                .last_message_at_unix_ms
                .is_none_or(|last| record.created_at_unix_ms >= last);
            if is_newest {
                conversation.last_message_at_unix_ms = Some(record.created_at_unix_ms);
                conversation.last_message_id = Some(record.id);
            }
        }
        self.messages.push(record);
    }
}

/// In-process backend with fault injection, used by tests and the QA runner.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
    hub: MessageHub,
    fail_history: AtomicBool,
    fail_inserts: AtomicBool,
    failing_inserts: AtomicUsize,
    fail_subscribe: AtomicBool,
    fail_conversations: AtomicBool,
    fixed_clock_ms: AtomicU64,
    history_gate: GateSlot,
    insert_gate: GateSlot,
    history_calls: AtomicUsize,
    insert_calls: AtomicUsize,
}

type GateSlot = std::sync::Mutex<Option<watch::Receiver<bool>>>;

/// Holds every gated call started while the gate is alive. Dropping it releases them.
#[derive(Debug)]
pub struct CallGate {
    release_tx: watch::Sender<bool>,
}

impl CallGate {
    fn install(slot: &GateSlot) -> Self {
        let (release_tx, release_rx) = watch::channel(false);
        if let Ok(mut gate) = slot.lock() {
            *gate = Some(release_rx);
        }
        Self { release_tx }
    }

    async fn pass(slot: &GateSlot) {
        let current = slot.lock().ok().and_then(|gate| gate.as_ref().cloned());
        if let Some(mut gate) = current {
            let _ = gate.wait_for(|released| *released).await;
        }
    }

    pub fn release(self) {}
}

impl Drop for CallGate {
    fn drop(&mut self) {
        let _ = self.release_tx.send(true);
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose feed keeps only `capacity` undelivered rows per subscriber.
    pub fn with_feed_capacity(capacity: usize) -> Self {
        Self {
            hub: MessageHub::new(capacity),
            ..Self::default()
        }
    }

    pub fn hub(&self) -> &MessageHub {
        &self.hub
    }

    pub async fn upsert_profile(&self, input: NewProfile) -> ProfileRecord {
        let record = ProfileRecord {
            id: input.id,
            display_name: input.display_name,
            avatar_url: input.avatar_url,
            is_online: input.is_online,
        };
        self.state
            .lock()
            .await
            .profiles
            .insert(record.id, record.clone());
        record
    }

    pub async fn create_conversation(
        &self,
        participant_1_id: UserId,
        participant_2_id: UserId,
    ) -> StorageResult<ConversationRecord> {
        if participant_1_id == participant_2_id {
            return ConflictSnafu {
                stage: "memory-conversation-create-same-participant",
                entity: "conversation",
                details: "a conversation needs two distinct participants".to_string(),
            }
            .fail();
        }

        let record = ConversationRecord {
            id: ConversationId::new_v7(),
            participant_1_id,
            participant_2_id,
            last_message_at_unix_ms: None,
            last_message_id: None,
        };
        self.state
            .lock()
            .await
            .conversations
            .insert(record.id, record.clone());
        Ok(record)
    }

    /// Stores a message as history without notifying subscribers.
    pub async fn seed_message(&self, record: MessageRecord) {
        self.state.lock().await.record_message(record);
    }

    /// Stores a message written elsewhere (another device or participant) and notifies subscribers.
    pub async fn deliver(&self, record: MessageRecord) {
        self.state.lock().await.record_message(record.clone());
        self.hub.publish(record);
    }

    /// Notifies subscribers without storing, as a duplicate or out-of-band delivery would.
    pub fn publish_only(&self, record: MessageRecord) {
        self.hub.publish(record);
    }

    pub async fn message(&self, message_id: MessageId) -> Option<MessageRecord> {
        self.state
            .lock()
            .await
            .messages
            .iter()
            .find(|message| message.id == message_id)
            .cloned()
    }

    pub fn set_fail_history(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    /// Fails the next `count` inserts, then lets inserts succeed again.
    pub fn fail_next_inserts(&self, count: usize) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_conversations(&self, fail: bool) {
        self.fail_conversations.store(fail, Ordering::SeqCst);
    }

    /// Pins insert timestamps to `unix_ms`; `None` returns to the wall clock.
    pub fn set_clock_millis(&self, unix_ms: Option<u64>) {
        self.fixed_clock_ms
            .store(unix_ms.unwrap_or(0), Ordering::SeqCst);
    }

    pub fn hold_history(&self) -> CallGate {
        CallGate::install(&self.history_gate)
    }

    /// Inserts park after deciding whether they fail, until the gate is released.
    pub fn hold_inserts(&self) -> CallGate {
        CallGate::install(&self.insert_gate)
    }

    pub fn drop_subscriptions(&self) {
        self.hub.disconnect_all();
    }

    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    fn now_millis(&self) -> u64 {
        match self.fixed_clock_ms.load(Ordering::SeqCst) {
            0 => unix_timestamp_millis(),
            fixed => fixed,
        }
    }

    fn take_injected_insert_failure(&self) -> bool {
        self.failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

impl ProfileStore for MemoryStorage {
    fn list_profiles(&self, ids: Vec<UserId>) -> BoxFuture<'_, StorageResult<Vec<ProfileRecord>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(ids
                .iter()
                .filter_map(|id| state.profiles.get(id).cloned())
                .collect())
        })
    }
}

impl ConversationStore for MemoryStorage {
    fn list_conversations(
        &self,
        participant: UserId,
    ) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            if self.fail_conversations.load(Ordering::SeqCst) {
                return UnavailableSnafu {
                    stage: "memory-conversation-list",
                    details: "injected conversation query failure".to_string(),
                }
                .fail();
            }

            let state = self.state.lock().await;
            Ok(state
                .conversations
                .values()
                .filter(|conversation| conversation.has_participant(participant))
                .cloned()
                .collect())
        })
    }
}

impl MessageStore for MemoryStorage {
    fn insert_message(&self, input: NewMessage) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async move {
            self.insert_calls.fetch_add(1, Ordering::SeqCst);
            let fail =
                self.fail_inserts.load(Ordering::SeqCst) || self.take_injected_insert_failure();
            CallGate::pass(&self.insert_gate).await;
            if fail {
                return UnavailableSnafu {
                    stage: "memory-message-insert",
                    details: "injected insert failure".to_string(),
                }
                .fail();
            }

            let record = {
                let mut state = self.state.lock().await;
                state
                    .conversations
                    .get(&input.conversation_id)
                    .context(NotFoundSnafu {
                        stage: "memory-message-insert-conversation",
                        entity: "conversation",
                        id: input.conversation_id.to_string(),
                    })?;

                let record = MessageRecord {
                    id: MessageId::new_v7(),
                    conversation_id: input.conversation_id,
                    sender_id: input.sender_id,
                    content: input.content,
                    kind: input.kind,
                    media_url: input.media_url,
                    is_read: false,
                    is_edited: false,
                    is_deleted: false,
                    created_at_unix_ms: self.now_millis(),
                };
                state.record_message(record.clone());
                record
            };

            self.hub.publish(record.clone());
            Ok(record)
        })
    }

    fn list_recent_messages(
        &self,
        conversation_id: ConversationId,
        limit: usize,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            self.history_calls.fetch_add(1, Ordering::SeqCst);
            CallGate::pass(&self.history_gate).await;

            if self.fail_history.load(Ordering::SeqCst) {
                return UnavailableSnafu {
                    stage: "memory-message-history",
                    details: "injected history failure".to_string(),
                }
                .fail();
            }

            let state = self.state.lock().await;
            let mut messages = state
                .messages
                .iter()
                .filter(|message| message.conversation_id == conversation_id)
                .cloned()
                .collect::<Vec<_>>();
            messages.sort_by(MessageRecord::cmp_order);
            let skip = messages.len().saturating_sub(limit);
            Ok(messages.split_off(skip))
        })
    }

    fn update_message(
        &self,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let record = state
                .messages
                .iter_mut()
                .find(|message| message.id == message_id)
                .context(NotFoundSnafu {
                    stage: "memory-message-update",
                    entity: "message",
                    id: message_id.to_string(),
                })?;
            patch.apply(record);
            Ok(record.clone())
        })
    }
}

impl MessageFeed for MemoryStorage {
    fn subscribe_inserts(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<MessageSubscription>> {
        Box::pin(async move {
            if self.fail_subscribe.load(Ordering::SeqCst) {
                return UnavailableSnafu {
                    stage: "memory-message-subscribe",
                    details: "injected subscribe failure".to_string(),
                }
                .fail();
            }

            Ok(self.hub.subscribe(conversation_id))
        })
    }
}
