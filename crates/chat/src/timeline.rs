use std::fmt;

use amora_storage::{ConversationId, MessageId, MessageKind, MessageRecord, UserId};

/// Temporary identity of an optimistic entry until the backend assigns a message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PendingKey(u64);

impl PendingKey {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PendingKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "pending-{}", self.0)
    }
}

/// Persisted keys sort before pending keys on equal timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryKey {
    Persisted(MessageId),
    Pending(PendingKey),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Confirmed,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEntry {
    pub key: EntryKey,
    /// Local key this entry was sent under, kept after confirmation.
    pub local_key: Option<PendingKey>,
    /// Local send time of the optimistic entry behind `local_key`.
    pub sent_at_unix_ms: Option<u64>,
    pub sender_id: UserId,
    pub content: Option<String>,
    pub kind: MessageKind,
    pub created_at_unix_ms: u64,
    pub delivery: DeliveryState,
    pub record: Option<MessageRecord>,
}

impl TimelineEntry {
    fn persisted(record: MessageRecord) -> Self {
        Self {
            key: EntryKey::Persisted(record.id),
            local_key: None,
            sent_at_unix_ms: None,
            sender_id: record.sender_id,
            content: record.content.clone(),
            kind: record.kind,
            created_at_unix_ms: record.created_at_unix_ms,
            delivery: DeliveryState::Confirmed,
            record: Some(record),
        }
    }

    fn pending(key: PendingKey, sender_id: UserId, content: String, sent_at_unix_ms: u64) -> Self {
        Self {
            key: EntryKey::Pending(key),
            local_key: Some(key),
            sent_at_unix_ms: Some(sent_at_unix_ms),
            sender_id,
            content: Some(content),
            kind: MessageKind::Text,
            created_at_unix_ms: sent_at_unix_ms,
            delivery: DeliveryState::Pending,
            record: None,
        }
    }

    pub fn order_key(&self) -> (u64, EntryKey) {
        (self.created_at_unix_ms, self.key)
    }

    pub fn message_id(&self) -> Option<MessageId> {
        match self.key {
            EntryKey::Persisted(id) => Some(id),
            EntryKey::Pending(_) => None,
        }
    }

    pub fn is_optimistic(&self) -> bool {
        matches!(self.key, EntryKey::Pending(_))
    }

    fn confirm_with(&mut self, record: MessageRecord) {
        self.key = EntryKey::Persisted(record.id);
        self.sender_id = record.sender_id;
        self.content = record.content.clone();
        self.kind = record.kind;
        self.created_at_unix_ms = record.created_at_unix_ms;
        self.delivery = DeliveryState::Confirmed;
        self.record = Some(record);
    }

    fn matches_row(&self, record: &MessageRecord, window_ms: u64) -> bool {
        if !self.is_optimistic() || self.sender_id != record.sender_id {
            return false;
        }
        if matches!(self.delivery, DeliveryState::Confirmed) {
            return false;
        }

        let local = self.content.as_deref().map(str::trim);
        let remote = record.content.as_deref().map(str::trim);
        local == remote && self.created_at_unix_ms.abs_diff(record.created_at_unix_ms) <= window_ms
    }
}

/// Result of folding one persisted row into the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Refreshed,
    Reconciled(PendingKey),
    /// The row belongs to another conversation.
    Ignored,
}

/// Ordered, deduplicated message sequence for one conversation.
#[derive(Debug, Clone)]
pub struct Timeline {
    conversation_id: ConversationId,
    reconcile_window_ms: u64,
    entries: Vec<TimelineEntry>,
}

impl Timeline {
    pub fn new(conversation_id: ConversationId, reconcile_window_ms: u64) -> Self {
        Self {
            conversation_id,
            reconcile_window_ms,
            entries: Vec::new(),
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persisted rows in display order.
    pub fn messages(&self) -> impl Iterator<Item = &MessageRecord> {
        self.entries.iter().filter_map(|entry| entry.record.as_ref())
    }

    pub fn entry(&self, key: PendingKey) -> Option<&TimelineEntry> {
        self.entries
            .iter()
            .find(|entry| entry.key == EntryKey::Pending(key))
    }

    pub fn push_pending(
        &mut self,
        key: PendingKey,
        sender_id: UserId,
        content: String,
        sent_at_unix_ms: u64,
    ) {
        self.insert_ordered(TimelineEntry::pending(
            key,
            sender_id,
            content,
            sent_at_unix_ms,
        ));
    }

    pub fn apply_history(&mut self, records: Vec<MessageRecord>) -> usize {
        let mut applied = 0;
        for record in records {
            if self.apply_persisted(record) != MergeOutcome::Ignored {
                applied += 1;
            }
        }
        applied
    }

    pub fn apply_persisted(&mut self, record: MessageRecord) -> MergeOutcome {
        if record.conversation_id != self.conversation_id {
            return MergeOutcome::Ignored;
        }

        if let Some(index) = self.position_of(EntryKey::Persisted(record.id)) {
            self.entries[index].confirm_with(record);
            self.restore_order(index);
            return MergeOutcome::Refreshed;
        }

        // Entries are ordered, so the first candidate is the earliest optimistic send.
        let candidate = self
            .entries
            .iter()
            .position(|entry| entry.matches_row(&record, self.reconcile_window_ms));
        if let Some(index) = candidate {
            let local_key = self.entries[index].local_key;
            self.entries[index].confirm_with(record);
            self.restore_order(index);
            if let Some(local_key) = local_key {
                return MergeOutcome::Reconciled(local_key);
            }
            return MergeOutcome::Refreshed;
        }

        self.insert_ordered(TimelineEntry::persisted(record));
        MergeOutcome::Inserted
    }

    /// Applies the backend acknowledgement for `key`, falling back to a regular merge when the
    /// optimistic entry is already gone.
    pub fn confirm(&mut self, key: PendingKey, record: MessageRecord) -> MergeOutcome {
        let Some(index) = self
            .entries
            .iter()
            .position(|entry| entry.local_key == Some(key))
        else {
            return self.apply_persisted(record);
        };

        if self.entries[index].key == EntryKey::Persisted(record.id) {
            self.entries[index].confirm_with(record);
            self.restore_order(index);
            return MergeOutcome::Refreshed;
        }

        // A content match credited `key` with a row that belongs to a different send.
        if !self.entries[index].is_optimistic() {
            self.release_claim(key);
            return self.attach(key, record);
        }

        // The live feed already delivered this row as a separate entry.
        if let Some(existing) = self.position_of(EntryKey::Persisted(record.id)) {
            match self.entries[existing].local_key.filter(|claimed| *claimed != key) {
                Some(claimed) => {
                    // The row was matched to `claimed` by content. `claimed` is still in flight
                    // and takes over this optimistic entry.
                    let claimed_sent_at = self.entries[existing].sent_at_unix_ms;
                    let entry = &mut self.entries[index];
                    let sent_at = entry.sent_at_unix_ms;
                    entry.key = EntryKey::Pending(claimed);
                    entry.local_key = Some(claimed);
                    entry.sent_at_unix_ms = claimed_sent_at;
                    if let Some(at) = claimed_sent_at {
                        entry.created_at_unix_ms = at;
                    }

                    let existing_entry = &mut self.entries[existing];
                    existing_entry.local_key = Some(key);
                    existing_entry.sent_at_unix_ms = sent_at;
                    existing_entry.confirm_with(record);
                    self.entries.sort_by_key(TimelineEntry::order_key);
                }
                None => {
                    let sent_at = self.entries.remove(index).sent_at_unix_ms;
                    let existing = if index < existing {
                        existing - 1
                    } else {
                        existing
                    };
                    self.entries[existing].local_key = Some(key);
                    self.entries[existing].sent_at_unix_ms = sent_at;
                    self.entries[existing].confirm_with(record);
                    self.restore_order(existing);
                }
            }
            return MergeOutcome::Reconciled(key);
        }

        self.entries[index].confirm_with(record);
        self.restore_order(index);
        MergeOutcome::Reconciled(key)
    }

    /// Marks the send behind `key` failed. A row already credited to `key` by a content match is
    /// handed back and the send reappears as a failed entry. Returns false when `key` is unknown.
    pub fn fail(&mut self, key: PendingKey, reason: String) -> bool {
        if let Some(entry) = self.pending_entry_mut(key) {
            entry.delivery = DeliveryState::Failed { reason };
            return true;
        }

        let Some((sender_id, content, sent_at)) = self.release_claim(key) else {
            return false;
        };
        let mut restored = TimelineEntry::pending(key, sender_id, content, sent_at);
        restored.delivery = DeliveryState::Failed { reason };
        self.insert_ordered(restored);
        true
    }

    pub fn mark_pending(&mut self, key: PendingKey) -> bool {
        match self.pending_entry_mut(key) {
            Some(entry) => {
                entry.delivery = DeliveryState::Pending;
                true
            }
            None => false,
        }
    }

    pub fn remove_pending(&mut self, key: PendingKey) -> Option<TimelineEntry> {
        let index = self.position_of(EntryKey::Pending(key))?;
        Some(self.entries.remove(index))
    }

    /// Withdraws `key` from a persisted row it only matched by content. Another waiting send with
    /// the same content inherits the row. Returns the sender, content and send time of `key`.
    fn release_claim(&mut self, key: PendingKey) -> Option<(UserId, String, u64)> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.local_key == Some(key) && !entry.is_optimistic())?;
        let claimed = &self.entries[index];
        let released = (
            claimed.sender_id,
            claimed.content.as_deref().unwrap_or_default().trim().to_string(),
            claimed
                .sent_at_unix_ms
                .unwrap_or(claimed.created_at_unix_ms),
        );
        let heir = claimed.record.as_ref().and_then(|record| {
            self.entries.iter().position(|entry| {
                entry.delivery == DeliveryState::Pending
                    && entry.matches_row(record, self.reconcile_window_ms)
            })
        });

        let (heir_key, heir_sent_at) = match heir {
            Some(heir) => {
                let entry = self.entries.remove(heir);
                (entry.local_key, entry.sent_at_unix_ms)
            }
            None => (None, None),
        };
        let index = match heir {
            Some(heir) if heir < index => index - 1,
            _ => index,
        };
        self.entries[index].local_key = heir_key;
        self.entries[index].sent_at_unix_ms = heir_sent_at;

        tracing::debug!(
            pending_key = %key,
            inherited_by = ?heir_key,
            "released content-matched row"
        );
        Some(released)
    }

    /// Binds `record` to `key`, merging with an entry the feed already delivered.
    fn attach(&mut self, key: PendingKey, record: MessageRecord) -> MergeOutcome {
        match self.position_of(EntryKey::Persisted(record.id)) {
            Some(existing) => {
                self.entries[existing].local_key = Some(key);
                self.entries[existing].confirm_with(record);
                self.restore_order(existing);
            }
            None => {
                let mut entry = TimelineEntry::persisted(record);
                entry.local_key = Some(key);
                self.insert_ordered(entry);
            }
        }
        MergeOutcome::Reconciled(key)
    }

    fn pending_entry_mut(&mut self, key: PendingKey) -> Option<&mut TimelineEntry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.key == EntryKey::Pending(key))
    }

    fn position_of(&self, key: EntryKey) -> Option<usize> {
        self.entries.iter().position(|entry| entry.key == key)
    }

    fn insert_ordered(&mut self, entry: TimelineEntry) {
        let order_key = entry.order_key();
        let index = self
            .entries
            .partition_point(|existing| existing.order_key() <= order_key);
        self.entries.insert(index, entry);
    }

    fn restore_order(&mut self, index: usize) {
        let order_key = self.entries[index].order_key();
        let before_ok = index == 0 || self.entries[index - 1].order_key() <= order_key;
        let after_ok = index + 1 >= self.entries.len() || order_key <= self.entries[index + 1].order_key();
        if before_ok && after_ok {
            return;
        }

        let entry = self.entries.remove(index);
        self.insert_ordered(entry);
    }
}
