use std::sync::Arc;

use amora_storage::{
    Backend, ConversationId, FeedEvent, MessageId, MessagePatch, MessageRecord, NewMessage,
    StorageError, StorageResult,
};
use snafu::{OptionExt, ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::auth::{AuthProvider, require_user};
use super::error::{
    BackendUnavailableSnafu, ChatError, ChatResult, EmptyMessageSnafu, MessageTooLongSnafu,
    NoOpenConversationSnafu, PendingEntryMissingSnafu, PendingEntryNotFailedSnafu,
};
use super::settings::ChatSettings;
use super::timeline::{DeliveryState, MergeOutcome, PendingKey, Timeline, TimelineEntry};

/// Everything a stream controller needs from the outside world.
#[derive(Clone)]
pub struct ChatServices {
    pub backend: Arc<dyn Backend>,
    pub auth: Arc<dyn AuthProvider>,
    pub settings: ChatSettings,
}

impl ChatServices {
    pub fn new(
        backend: Arc<dyn Backend>,
        auth: Arc<dyn AuthProvider>,
        settings: ChatSettings,
    ) -> Self {
        Self {
            backend,
            auth,
            settings: settings.normalized(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStatus {
    Idle,
    Loading,
    Live,
    Error { reason: String },
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected { reason: String },
}

/// A change applied to the controller by [`MessageStreamController::next_update`].
#[derive(Debug)]
pub enum Update {
    HistoryLoaded { count: usize },
    HistoryFailed { error: ChatError },
    MessageArrived { id: MessageId },
    /// A row already on screen was delivered again and refreshed in place.
    MessageRefreshed { id: MessageId },
    MessageReconciled { key: PendingKey, id: MessageId },
    SendConfirmed { key: PendingKey, id: MessageId },
    SendFailed { key: PendingKey, error: ChatError },
    FeedLagged { skipped: u64 },
    ConnectionChanged(ConnectionState),
}

enum SessionEvent {
    History {
        attempt: u64,
        result: StorageResult<Vec<MessageRecord>>,
    },
    FeedConnected {
        attempt: u64,
    },
    Feed {
        attempt: u64,
        event: FeedEvent,
    },
    FeedFailed {
        attempt: u64,
        error: StorageError,
    },
    FeedClosed {
        attempt: u64,
    },
    InsertFinished {
        key: PendingKey,
        result: StorageResult<MessageRecord>,
    },
}

struct FeedWorker {
    attempt: u64,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl Drop for FeedWorker {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// Resources owned by one open conversation. Dropping it cancels the history fetch and the feed,
/// and closes the channel every background task reports into.
struct ActiveConversation {
    conversation_id: ConversationId,
    timeline: Timeline,
    buffered: Vec<MessageRecord>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    history_task: Option<JoinHandle<()>>,
    history_attempt: u64,
    feed: Option<FeedWorker>,
    feed_attempts: u64,
}

impl ActiveConversation {
    fn new(conversation_id: ConversationId, reconcile_window_ms: u64) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            conversation_id,
            timeline: Timeline::new(conversation_id, reconcile_window_ms),
            buffered: Vec::new(),
            events_tx,
            events_rx,
            history_task: None,
            history_attempt: 0,
            feed: None,
            feed_attempts: 0,
        }
    }

    fn start_history(&mut self, backend: Arc<dyn Backend>, limit: usize) {
        if let Some(task) = self.history_task.take() {
            task.abort();
        }
        self.history_attempt += 1;

        let attempt = self.history_attempt;
        let conversation_id = self.conversation_id;
        let events_tx = self.events_tx.clone();
        self.history_task = Some(tokio::spawn(async move {
            let result = backend.list_recent_messages(conversation_id, limit).await;
            let _ = events_tx.send(SessionEvent::History { attempt, result });
        }));
    }

    fn start_feed(&mut self, backend: Arc<dyn Backend>) {
        self.feed_attempts += 1;
        let attempt = self.feed_attempts;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        tokio::spawn(run_feed_worker(
            backend,
            self.conversation_id,
            attempt,
            self.events_tx.clone(),
            cancel_rx,
        ));
        // Replacing the previous worker cancels it.
        self.feed = Some(FeedWorker {
            attempt,
            cancel_tx: Some(cancel_tx),
        });
    }

    fn feed_is_current(&self, attempt: u64) -> bool {
        self.feed
            .as_ref()
            .is_some_and(|feed| feed.attempt == attempt)
    }
}

impl Drop for ActiveConversation {
    fn drop(&mut self) {
        if let Some(task) = self.history_task.take() {
            task.abort();
        }
    }
}

async fn run_feed_worker(
    backend: Arc<dyn Backend>,
    conversation_id: ConversationId,
    attempt: u64,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let subscribed = tokio::select! {
        _ = &mut cancel_rx => return,
        result = backend.subscribe_inserts(conversation_id) => result,
    };
    let mut subscription = match subscribed {
        Ok(subscription) => subscription,
        Err(error) => {
            tracing::warn!(
                conversation_id = %conversation_id,
                error = %error,
                "failed to subscribe to message inserts"
            );
            let _ = events_tx.send(SessionEvent::FeedFailed { attempt, error });
            return;
        }
    };

    if events_tx
        .send(SessionEvent::FeedConnected { attempt })
        .is_err()
    {
        subscription.cancel();
        return;
    }

    loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(conversation_id = %conversation_id, "message feed cancelled");
                subscription.cancel();
                return;
            }
            next_event = subscription.recv() => {
                match next_event {
                    Some(event) => {
                        if events_tx.send(SessionEvent::Feed { attempt, event }).is_err() {
                            subscription.cancel();
                            return;
                        }
                    }
                    None => {
                        tracing::info!(conversation_id = %conversation_id, "message feed closed upstream");
                        let _ = events_tx.send(SessionEvent::FeedClosed { attempt });
                        return;
                    }
                }
            }
        }
    }
}

fn spawn_insert(
    backend: Arc<dyn Backend>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    key: PendingKey,
    input: NewMessage,
) {
    tokio::spawn(async move {
        let result = backend.insert_message(input).await;
        let _ = events_tx.send(SessionEvent::InsertFinished { key, result });
    });
}

fn unix_timestamp_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}

/// Drives one conversation at a time: history, live feed, optimistic sends.
///
/// Background work reports through an internal channel; callers apply it with
/// [`next_update`](Self::next_update) or [`drain`](Self::drain). Opening another conversation,
/// closing, or dropping the controller discards everything still in flight for the previous one.
/// Must be used inside a Tokio runtime.
pub struct MessageStreamController {
    services: ChatServices,
    status: StreamStatus,
    connection: Option<ConnectionState>,
    active: Option<ActiveConversation>,
    next_pending_key: u64,
}

impl MessageStreamController {
    pub fn new(services: ChatServices) -> Self {
        Self {
            services,
            status: StreamStatus::Idle,
            connection: None,
            active: None,
            next_pending_key: 0,
        }
    }

    pub fn status(&self) -> &StreamStatus {
        &self.status
    }

    pub fn connection_state(&self) -> Option<&ConnectionState> {
        self.connection.as_ref()
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.active.as_ref().map(|active| active.conversation_id)
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        match &self.active {
            Some(active) => active.timeline.entries(),
            None => &[],
        }
    }

    /// Persisted rows only, in display order.
    pub fn messages(&self) -> Vec<&MessageRecord> {
        self.active
            .as_ref()
            .map(|active| active.timeline.messages().collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn open(&mut self, conversation_id: ConversationId) {
        if let Some(previous) = self.active.take() {
            tracing::debug!(
                conversation_id = %previous.conversation_id,
                "closing conversation stream before switching"
            );
        }

        let backend = self.services.backend.clone();
        let mut active =
            ActiveConversation::new(conversation_id, self.services.settings.reconcile_window_ms);
        active.start_feed(backend.clone());
        active.start_history(backend, self.services.settings.history_page_size);

        self.active = Some(active);
        self.status = StreamStatus::Loading;
        self.connection = Some(ConnectionState::Connecting);
        tracing::info!(conversation_id = %conversation_id, "opened conversation stream");
    }

    /// Safe to call in any state and more than once.
    pub fn close(&mut self) {
        if let Some(active) = self.active.take() {
            tracing::info!(conversation_id = %active.conversation_id, "closed conversation stream");
        }
        self.status = StreamStatus::Closed;
        self.connection = None;
    }

    /// Restarts loading after a history failure or a lost feed. Returns false when there is
    /// nothing to recover from.
    pub fn retry(&mut self) -> ChatResult<bool> {
        let active = self.active.as_mut().context(NoOpenConversationSnafu {
            stage: "stream-retry",
        })?;
        let feed_lost = active.feed.is_none();
        let retryable = match self.status {
            StreamStatus::Error { .. } => true,
            StreamStatus::Live => feed_lost,
            StreamStatus::Idle | StreamStatus::Loading | StreamStatus::Closed => false,
        };
        if !retryable {
            return Ok(false);
        }

        let backend = self.services.backend.clone();
        active.start_history(backend.clone(), self.services.settings.history_page_size);
        if feed_lost {
            active.start_feed(backend);
            self.connection = Some(ConnectionState::Connecting);
        }
        self.status = StreamStatus::Loading;
        tracing::info!(
            conversation_id = %active.conversation_id,
            resubscribe = feed_lost,
            "retrying conversation stream"
        );
        Ok(true)
    }

    /// Appends an optimistic entry and starts the insert. The returned key identifies the entry
    /// until the backend confirms it.
    pub async fn send(&mut self, content: &str) -> ChatResult<PendingKey> {
        let content = content.trim();
        ensure!(
            !content.is_empty(),
            EmptyMessageSnafu {
                stage: "stream-send-validate",
            }
        );
        let limit = self.services.settings.max_message_chars;
        let length = content.chars().count();
        ensure!(
            length <= limit,
            MessageTooLongSnafu {
                stage: "stream-send-length",
                length,
                limit,
            }
        );
        ensure!(
            self.active.is_some(),
            NoOpenConversationSnafu {
                stage: "stream-send",
            }
        );

        let user = require_user(self.services.auth.as_ref(), "stream-send-auth").await?;
        let active = self.active.as_mut().context(NoOpenConversationSnafu {
            stage: "stream-send",
        })?;

        self.next_pending_key += 1;
        let key = PendingKey::new(self.next_pending_key);
        active
            .timeline
            .push_pending(key, user.id, content.to_string(), unix_timestamp_millis());
        spawn_insert(
            self.services.backend.clone(),
            active.events_tx.clone(),
            key,
            NewMessage::text(active.conversation_id, user.id, content),
        );

        tracing::debug!(conversation_id = %active.conversation_id, key = %key, "message queued");
        Ok(key)
    }

    pub fn retry_send(&mut self, key: PendingKey) -> ChatResult<()> {
        let stage = "stream-retry-send";
        let active = self
            .active
            .as_mut()
            .context(NoOpenConversationSnafu { stage })?;
        let entry = active
            .timeline
            .entry(key)
            .context(PendingEntryMissingSnafu { stage, key })?;
        ensure!(
            matches!(entry.delivery, DeliveryState::Failed { .. }),
            PendingEntryNotFailedSnafu { stage, key }
        );

        let input = NewMessage::text(
            active.conversation_id,
            entry.sender_id,
            entry.content.clone().unwrap_or_default(),
        );
        active.timeline.mark_pending(key);
        spawn_insert(
            self.services.backend.clone(),
            active.events_tx.clone(),
            key,
            input,
        );

        tracing::debug!(conversation_id = %active.conversation_id, key = %key, "message resent");
        Ok(())
    }

    pub fn discard(&mut self, key: PendingKey) -> ChatResult<()> {
        let stage = "stream-discard";
        let active = self
            .active
            .as_mut()
            .context(NoOpenConversationSnafu { stage })?;
        let entry = active
            .timeline
            .entry(key)
            .context(PendingEntryMissingSnafu { stage, key })?;
        ensure!(
            matches!(entry.delivery, DeliveryState::Failed { .. }),
            PendingEntryNotFailedSnafu { stage, key }
        );

        active.timeline.remove_pending(key);
        Ok(())
    }

    pub async fn mark_read(&mut self, message_id: MessageId) -> ChatResult<()> {
        ensure!(
            self.active.is_some(),
            NoOpenConversationSnafu {
                stage: "stream-mark-read",
            }
        );

        let record = self
            .services
            .backend
            .update_message(message_id, MessagePatch::mark_read())
            .await
            .context(BackendUnavailableSnafu {
                stage: "stream-mark-read",
            })?;
        if let Some(active) = self.active.as_mut() {
            active.timeline.apply_persisted(record);
        }
        Ok(())
    }

    /// Waits for the next background result and applies it. `None` once nothing is open.
    pub async fn next_update(&mut self) -> Option<Update> {
        loop {
            let event = self.active.as_mut()?.events_rx.recv().await?;
            if let Some(update) = self.apply_event(event) {
                return Some(update);
            }
        }
    }

    /// Applies every result that is already queued without waiting.
    pub fn drain(&mut self) -> Vec<Update> {
        let mut updates = Vec::new();
        while let Some(event) = self
            .active
            .as_mut()
            .and_then(|active| active.events_rx.try_recv().ok())
        {
            if let Some(update) = self.apply_event(event) {
                updates.push(update);
            }
        }
        updates
    }

    fn apply_event(&mut self, event: SessionEvent) -> Option<Update> {
        let active = self.active.as_mut()?;
        let conversation_id = active.conversation_id;

        match event {
            SessionEvent::History { attempt, result } => {
                if attempt != active.history_attempt {
                    tracing::trace!(conversation_id = %conversation_id, attempt, "stale history result");
                    return None;
                }
                active.history_task = None;

                match result {
                    Ok(records) => {
                        let count = records.len();
                        active.timeline.apply_history(records);
                        for record in std::mem::take(&mut active.buffered) {
                            active.timeline.apply_persisted(record);
                        }
                        self.status = StreamStatus::Live;
                        tracing::info!(conversation_id = %conversation_id, count, "history loaded");
                        Some(Update::HistoryLoaded { count })
                    }
                    Err(source) => {
                        tracing::warn!(
                            conversation_id = %conversation_id,
                            error = %source,
                            "history fetch failed"
                        );
                        self.status = StreamStatus::Error {
                            reason: source.to_string(),
                        };
                        // `retry` refetches history, which covers every buffered row.
                        active.buffered.clear();
                        Some(Update::HistoryFailed {
                            error: ChatError::BackendUnavailable {
                                stage: "stream-history",
                                source,
                            },
                        })
                    }
                }
            }
            SessionEvent::FeedConnected { attempt } => {
                if !active.feed_is_current(attempt) {
                    return None;
                }
                self.connection = Some(ConnectionState::Connected);
                Some(Update::ConnectionChanged(ConnectionState::Connected))
            }
            SessionEvent::Feed { attempt, event } => {
                if !active.feed_is_current(attempt) {
                    return None;
                }

                match event {
                    FeedEvent::Inserted(record) => {
                        match self.status {
                            StreamStatus::Live => {}
                            StreamStatus::Loading => {
                                active.buffered.push(record);
                                return None;
                            }
                            _ => {
                                tracing::trace!(
                                    conversation_id = %conversation_id,
                                    message_id = %record.id,
                                    "live row dropped until history is retried"
                                );
                                return None;
                            }
                        }

                        let id = record.id;
                        match active.timeline.apply_persisted(record) {
                            MergeOutcome::Inserted => Some(Update::MessageArrived { id }),
                            MergeOutcome::Refreshed => Some(Update::MessageRefreshed { id }),
                            MergeOutcome::Reconciled(key) => {
                                Some(Update::MessageReconciled { key, id })
                            }
                            MergeOutcome::Ignored => None,
                        }
                    }
                    FeedEvent::Lagged { skipped } => {
                        tracing::warn!(
                            conversation_id = %conversation_id,
                            skipped,
                            "message feed lagged, refetching history"
                        );
                        if !matches!(self.status, StreamStatus::Error { .. }) {
                            active.start_history(
                                self.services.backend.clone(),
                                self.services.settings.history_page_size,
                            );
                        }
                        Some(Update::FeedLagged { skipped })
                    }
                }
            }
            SessionEvent::FeedFailed { attempt, error } => {
                if !active.feed_is_current(attempt) {
                    return None;
                }
                active.feed = None;
                let state = ConnectionState::Disconnected {
                    reason: error.to_string(),
                };
                self.connection = Some(state.clone());
                Some(Update::ConnectionChanged(state))
            }
            SessionEvent::FeedClosed { attempt } => {
                if !active.feed_is_current(attempt) {
                    return None;
                }
                active.feed = None;
                let state = ConnectionState::Disconnected {
                    reason: "realtime feed closed".to_string(),
                };
                self.connection = Some(state.clone());
                Some(Update::ConnectionChanged(state))
            }
            SessionEvent::InsertFinished { key, result } => match result {
                Ok(record) => {
                    let id = record.id;
                    active.timeline.confirm(key, record);
                    tracing::debug!(conversation_id = %conversation_id, key = %key, message_id = %id, "message confirmed");
                    Some(Update::SendConfirmed { key, id })
                }
                Err(source) => {
                    tracing::warn!(
                        conversation_id = %conversation_id,
                        key = %key,
                        error = %source,
                        "message insert failed"
                    );
                    if !active.timeline.fail(key, source.to_string()) {
                        return None;
                    }
                    Some(Update::SendFailed {
                        key,
                        error: ChatError::SendFailed {
                            stage: "stream-send-insert",
                            key,
                            source,
                        },
                    })
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use amora_storage::{ConversationRecord, MemoryStorage, MessageKind, UserId};
    use tokio::time::timeout;

    use super::*;
    use crate::auth::StaticSession;
    use crate::timeline::EntryKey;

    struct Fixture {
        storage: Arc<MemoryStorage>,
        session: Arc<StaticSession>,
        me: UserId,
        peer: UserId,
        conversation: ConversationRecord,
    }

    impl Fixture {
        async fn new() -> Self {
            Self::with_storage(MemoryStorage::new()).await
        }

        async fn with_storage(storage: MemoryStorage) -> Self {
            let storage = Arc::new(storage);
            let me = UserId::new_v7();
            let peer = UserId::new_v7();
            let conversation = storage
                .create_conversation(me, peer)
                .await
                .expect("conversation");
            Self {
                storage,
                session: Arc::new(StaticSession::signed_in(me)),
                me,
                peer,
                conversation,
            }
        }

        fn controller(&self) -> MessageStreamController {
            self.controller_with(ChatSettings::default())
        }

        fn controller_with(&self, settings: ChatSettings) -> MessageStreamController {
            MessageStreamController::new(ChatServices::new(
                self.storage.clone(),
                self.session.clone(),
                settings,
            ))
        }

        fn peer_row(&self, created_at_unix_ms: u64, content: &str) -> MessageRecord {
            MessageRecord {
                id: MessageId::new_v7(),
                conversation_id: self.conversation.id,
                sender_id: self.peer,
                content: Some(content.to_string()),
                kind: MessageKind::Text,
                media_url: None,
                is_read: false,
                is_edited: false,
                is_deleted: false,
                created_at_unix_ms,
            }
        }
    }

    async fn next(controller: &mut MessageStreamController) -> Update {
        timeout(Duration::from_secs(2), controller.next_update())
            .await
            .expect("update should arrive in time")
            .expect("stream should be open")
    }

    async fn drive_until(
        controller: &mut MessageStreamController,
        mut done: impl FnMut(&MessageStreamController) -> bool,
    ) {
        while !done(&*controller) {
            next(controller).await;
        }
    }

    async fn open_live(controller: &mut MessageStreamController, conversation_id: ConversationId) {
        controller.open(conversation_id);
        drive_until(controller, |controller| {
            controller.status() == &StreamStatus::Live
                && controller.connection_state() == Some(&ConnectionState::Connected)
        })
        .await;
    }

    async fn wait_for_subscribers(storage: &MemoryStorage, expected: usize) {
        for _ in 0..200 {
            if storage.hub().subscriber_count() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(storage.hub().subscriber_count(), expected);
    }

    #[tokio::test]
    async fn optimistic_send_is_replaced_not_duplicated() {
        let fixture = Fixture::new().await;
        let hello = fixture.peer_row(100, "hello");
        fixture.storage.seed_message(hello.clone()).await;
        let mut controller = fixture.controller();
        open_live(&mut controller, fixture.conversation.id).await;
        assert_eq!(controller.entries().len(), 1);

        let key = controller.send("hi").await.expect("send");
        assert_eq!(controller.entries().len(), 2);
        assert_eq!(controller.entries()[1].delivery, DeliveryState::Pending);
        assert!(controller.entries()[1].is_optimistic());

        // The insert acknowledgement and the live echo both arrive, in either order.
        let mut confirmed = None;
        for _ in 0..2 {
            match next(&mut controller).await {
                Update::SendConfirmed { key: acked, id } => {
                    assert_eq!(acked, key);
                    confirmed = Some(id);
                }
                Update::MessageRefreshed { .. } | Update::MessageReconciled { .. } => {}
                other => panic!("unexpected update {other:?}"),
            }
        }

        let confirmed = confirmed.expect("insert acknowledged");
        let ids = controller
            .messages()
            .iter()
            .map(|message| message.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![hello.id, confirmed]);
        assert_eq!(controller.entries().len(), 2);
        assert_eq!(controller.entries()[1].delivery, DeliveryState::Confirmed);
        assert_eq!(controller.entries()[1].local_key, Some(key));
        assert_eq!(fixture.storage.insert_calls(), 1);
    }

    #[tokio::test]
    async fn blank_message_is_rejected_without_network_call() {
        let fixture = Fixture::new().await;
        let mut controller = fixture.controller();
        open_live(&mut controller, fixture.conversation.id).await;

        let error = controller.send(" \n\t ").await.expect_err("blank content");

        assert!(matches!(error, ChatError::EmptyMessage { .. }));
        assert_eq!(fixture.storage.insert_calls(), 0);
        assert!(controller.is_empty());
    }

    #[tokio::test]
    async fn oversized_and_unauthenticated_sends_are_rejected() {
        let fixture = Fixture::new().await;
        let mut controller = fixture.controller_with(ChatSettings {
            max_message_chars: 4,
            ..ChatSettings::default()
        });
        open_live(&mut controller, fixture.conversation.id).await;

        let error = controller.send("too long").await.expect_err("oversized");
        assert!(matches!(
            error,
            ChatError::MessageTooLong {
                length: 8,
                limit: 4,
                ..
            }
        ));

        fixture.session.sign_out().await;
        let error = controller.send("hey").await.expect_err("signed out");
        assert!(matches!(error, ChatError::NotAuthenticated { .. }));
        assert_eq!(fixture.storage.insert_calls(), 0);
        assert!(controller.is_empty());
    }

    #[tokio::test]
    async fn close_discards_late_history_and_releases_feed() {
        let fixture = Fixture::new().await;
        fixture.storage.seed_message(fixture.peer_row(100, "late")).await;
        let gate = fixture.storage.hold_history();
        let mut controller = fixture.controller();

        controller.open(fixture.conversation.id);
        let update = next(&mut controller).await;
        assert!(matches!(
            update,
            Update::ConnectionChanged(ConnectionState::Connected)
        ));

        controller.close();
        controller.close();
        gate.release();
        fixture.storage.deliver(fixture.peer_row(200, "after close")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(controller.next_update().await.is_none());
        assert!(controller.drain().is_empty());
        assert_eq!(controller.status(), &StreamStatus::Closed);
        assert!(controller.is_empty());
        wait_for_subscribers(&fixture.storage, 0).await;

        let error = controller.send("anyone?").await.expect_err("closed");
        assert!(matches!(error, ChatError::NoOpenConversation { .. }));
    }

    #[tokio::test]
    async fn opening_another_conversation_drops_the_previous_one() {
        let fixture = Fixture::new().await;
        let other = fixture
            .storage
            .create_conversation(fixture.me, UserId::new_v7())
            .await
            .expect("second conversation");
        fixture.storage.seed_message(fixture.peer_row(100, "first")).await;
        let gate = fixture.storage.hold_history();
        let mut controller = fixture.controller();

        controller.open(fixture.conversation.id);
        controller.open(other.id);
        gate.release();
        drive_until(&mut controller, |controller| {
            controller.status() == &StreamStatus::Live
        })
        .await;

        assert_eq!(controller.conversation_id(), Some(other.id));
        assert!(controller.is_empty());
        wait_for_subscribers(&fixture.storage, 1).await;
    }

    #[tokio::test]
    async fn live_rows_during_loading_are_merged_in_order() {
        let fixture = Fixture::new().await;
        let stored = fixture.peer_row(100, "stored");
        fixture.storage.seed_message(stored.clone()).await;
        let gate = fixture.storage.hold_history();
        let mut controller = fixture.controller();

        controller.open(fixture.conversation.id);
        let update = next(&mut controller).await;
        assert!(matches!(
            update,
            Update::ConnectionChanged(ConnectionState::Connected)
        ));

        let early = fixture.peer_row(50, "out of band");
        fixture.storage.publish_only(early.clone());
        fixture.storage.publish_only(stored.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.release();

        drive_until(&mut controller, |controller| {
            controller.status() == &StreamStatus::Live && controller.entries().len() == 2
        })
        .await;
        assert!(controller.drain().is_empty());

        let ids = controller
            .messages()
            .iter()
            .map(|message| message.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![early.id, stored.id]);
    }

    #[tokio::test]
    async fn history_failure_surfaces_error_and_retry_recovers() {
        let fixture = Fixture::new().await;
        fixture.storage.seed_message(fixture.peer_row(100, "hello")).await;
        fixture.storage.set_fail_history(true);
        let mut controller = fixture.controller();

        controller.open(fixture.conversation.id);
        let failure = loop {
            if let Update::HistoryFailed { error } = next(&mut controller).await {
                break error;
            }
        };
        assert!(matches!(failure, ChatError::BackendUnavailable { .. }));
        assert!(matches!(controller.status(), StreamStatus::Error { .. }));
        assert!(controller.is_empty(), "failure is never an empty history");

        fixture.storage.set_fail_history(false);
        assert!(controller.retry().expect("retry"));
        assert_eq!(controller.status(), &StreamStatus::Loading);
        drive_until(&mut controller, |controller| {
            controller.status() == &StreamStatus::Live
        })
        .await;
        assert_eq!(controller.entries().len(), 1);
        assert_eq!(fixture.storage.history_calls(), 2);
    }

    #[tokio::test]
    async fn lost_feed_is_reported_and_resubscribed_on_retry() {
        let fixture = Fixture::new().await;
        let mut controller = fixture.controller();
        open_live(&mut controller, fixture.conversation.id).await;
        assert!(!controller.retry().expect("healthy retry"));

        fixture.storage.drop_subscriptions();
        drive_until(&mut controller, |controller| {
            matches!(
                controller.connection_state(),
                Some(ConnectionState::Disconnected { .. })
            )
        })
        .await;
        assert_eq!(controller.status(), &StreamStatus::Live);

        assert!(controller.retry().expect("retry"));
        drive_until(&mut controller, |controller| {
            controller.status() == &StreamStatus::Live
                && controller.connection_state() == Some(&ConnectionState::Connected)
        })
        .await;

        let delivered = fixture.peer_row(500, "back online");
        fixture.storage.deliver(delivered.clone()).await;
        let update = next(&mut controller).await;
        assert!(matches!(update, Update::MessageArrived { id } if id == delivered.id));
    }

    #[tokio::test]
    async fn subscribe_failure_keeps_history_and_reports_disconnect() {
        let fixture = Fixture::new().await;
        fixture.storage.seed_message(fixture.peer_row(100, "hello")).await;
        fixture.storage.set_fail_subscribe(true);
        let mut controller = fixture.controller();

        controller.open(fixture.conversation.id);
        drive_until(&mut controller, |controller| {
            controller.status() == &StreamStatus::Live
                && matches!(
                    controller.connection_state(),
                    Some(ConnectionState::Disconnected { .. })
                )
        })
        .await;
        assert_eq!(controller.entries().len(), 1);

        fixture.storage.set_fail_subscribe(false);
        assert!(controller.retry().expect("retry"));
        drive_until(&mut controller, |controller| {
            controller.status() == &StreamStatus::Live
                && controller.connection_state() == Some(&ConnectionState::Connected)
        })
        .await;
        assert_eq!(controller.entries().len(), 1, "refetch does not duplicate history");
    }

    #[tokio::test]
    async fn failed_send_can_be_retried_or_discarded() {
        let fixture = Fixture::new().await;
        let mut controller = fixture.controller();
        open_live(&mut controller, fixture.conversation.id).await;

        fixture.storage.set_fail_inserts(true);
        let key = controller.send("first try").await.expect("queued");
        let update = next(&mut controller).await;
        assert!(matches!(update, Update::SendFailed { key: failed, error: ChatError::SendFailed { .. } } if failed == key));
        assert!(matches!(
            controller.entries()[0].delivery,
            DeliveryState::Failed { .. }
        ));

        fixture.storage.set_fail_inserts(false);
        controller.retry_send(key).expect("retry send");
        let error = controller.discard(key).expect_err("entry is pending again");
        assert!(matches!(error, ChatError::PendingEntryNotFailed { .. }));
        drive_until(&mut controller, |controller| {
            controller.entries().first().map(|entry| &entry.delivery)
                == Some(&DeliveryState::Confirmed)
        })
        .await;

        fixture.storage.set_fail_inserts(true);
        let doomed = controller.send("drop me").await.expect("queued");
        drive_until(&mut controller, |controller| {
            controller
                .entries()
                .iter()
                .any(|entry| matches!(entry.delivery, DeliveryState::Failed { .. }))
        })
        .await;
        controller.discard(doomed).expect("discard failed entry");
        let error = controller.discard(doomed).expect_err("already discarded");
        assert!(matches!(error, ChatError::PendingEntryMissing { .. }));
        assert_eq!(controller.entries().len(), 1);
    }

    #[tokio::test]
    async fn failed_send_stays_visible_when_its_twin_echo_arrives_first() {
        let fixture = Fixture::new().await;
        let mut controller = fixture.controller();
        open_live(&mut controller, fixture.conversation.id).await;

        let gate = fixture.storage.hold_inserts();
        fixture.storage.fail_next_inserts(1);
        let first = controller.send("ok").await.expect("first queued");
        let second = controller.send("ok").await.expect("second queued");

        // A matching row shows up on the feed before either insert reports back.
        let echo = MessageRecord {
            sender_id: fixture.me,
            ..fixture.peer_row(unix_timestamp_millis(), "ok")
        };
        fixture.storage.publish_only(echo.clone());
        let update = next(&mut controller).await;
        assert!(matches!(update, Update::MessageReconciled { key, id } if key == first && id == echo.id));

        gate.release();
        let mut failed = None;
        let mut confirmed = None;
        while failed.is_none() || confirmed.is_none() {
            match next(&mut controller).await {
                Update::SendFailed { key, .. } => failed = Some(key),
                Update::SendConfirmed { key, .. } => confirmed = Some(key),
                _ => {}
            }
        }
        assert_eq!(failed, Some(first));
        assert_eq!(confirmed, Some(second));

        let failed_entries = controller
            .entries()
            .iter()
            .filter(|entry| matches!(entry.delivery, DeliveryState::Failed { .. }))
            .map(|entry| entry.key)
            .collect::<Vec<_>>();
        assert_eq!(failed_entries, vec![EntryKey::Pending(first)]);
        assert_eq!(controller.entries().len(), 3);

        controller.discard(first).expect("failed send can be discarded");
        assert_eq!(controller.entries().len(), 2);
    }

    #[tokio::test]
    async fn lagged_feed_refetches_history_without_duplicates() {
        let fixture = Fixture::with_storage(MemoryStorage::with_feed_capacity(2)).await;
        let mut controller = fixture.controller();
        open_live(&mut controller, fixture.conversation.id).await;

        let burst = (1..=5u64)
            .map(|index| fixture.peer_row(index * 100, "burst"))
            .collect::<Vec<_>>();
        for row in &burst {
            fixture.storage.deliver(row.clone()).await;
        }

        let skipped = loop {
            if let Update::FeedLagged { skipped } = next(&mut controller).await {
                break skipped;
            }
        };
        assert_eq!(skipped, 3);
        drive_until(&mut controller, |controller| {
            controller.status() == &StreamStatus::Live
                && controller.entries().len() == burst.len()
        })
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.drain();

        let ids = controller
            .messages()
            .iter()
            .map(|message| message.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, burst.iter().map(|row| row.id).collect::<Vec<_>>());
        assert_eq!(fixture.storage.history_calls(), 2);
    }

    #[tokio::test]
    async fn live_rows_while_history_is_down_are_not_buffered() {
        let fixture = Fixture::new().await;
        fixture.storage.set_fail_history(true);
        let mut controller = fixture.controller();

        controller.open(fixture.conversation.id);
        drive_until(&mut controller, |controller| {
            matches!(controller.status(), StreamStatus::Error { .. })
                && controller.connection_state() == Some(&ConnectionState::Connected)
        })
        .await;

        let missed = fixture.peer_row(100, "while down");
        fixture.storage.deliver(missed.clone()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(controller.drain().is_empty());
        assert!(
            controller
                .active
                .as_ref()
                .is_some_and(|active| active.buffered.is_empty())
        );

        fixture.storage.set_fail_history(false);
        assert!(controller.retry().expect("retry"));
        drive_until(&mut controller, |controller| {
            controller.status() == &StreamStatus::Live
        })
        .await;
        let ids = controller
            .messages()
            .iter()
            .map(|message| message.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![missed.id]);
    }

    #[tokio::test]
    async fn mark_read_updates_the_entry_in_place() {
        let fixture = Fixture::new().await;
        let unread = fixture.peer_row(100, "read me");
        fixture.storage.seed_message(unread.clone()).await;
        let mut controller = fixture.controller();
        open_live(&mut controller, fixture.conversation.id).await;

        controller.mark_read(unread.id).await.expect("mark read");

        assert_eq!(controller.entries().len(), 1);
        assert!(controller.messages()[0].is_read);
    }

    #[tokio::test]
    async fn dropping_the_controller_releases_the_feed() {
        let fixture = Fixture::new().await;
        let mut controller = fixture.controller();
        open_live(&mut controller, fixture.conversation.id).await;
        assert_eq!(fixture.storage.hub().subscriber_count(), 1);

        drop(controller);

        wait_for_subscribers(&fixture.storage, 0).await;
    }
}
