use std::cmp::Ordering;

use super::ids::{ConversationId, MessageId, UserId};

/// Kind of payload carried by one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Video,
    Voice,
    Location,
    Event,
    Booking,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Voice => "voice",
            Self::Location => "location",
            Self::Event => "event",
            Self::Booking => "booking",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "voice" => Some(Self::Voice),
            "location" => Some(Self::Location),
            "event" => Some(Self::Event),
            "booking" => Some(Self::Booking),
            _ => None,
        }
    }
}

/// Read-only participant projection shown next to a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRecord {
    pub id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub is_online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub participant_1_id: UserId,
    pub participant_2_id: UserId,
    pub last_message_at_unix_ms: Option<u64>,
    pub last_message_id: Option<MessageId>,
}

impl ConversationRecord {
    pub fn has_participant(&self, user_id: UserId) -> bool {
        self.participant_1_id == user_id || self.participant_2_id == user_id
    }

    /// Returns the participant that is not `self_id`, or `None` when `self_id` is not a member.
    pub fn other_participant(&self, self_id: UserId) -> Option<UserId> {
        if self.participant_1_id == self_id {
            Some(self.participant_2_id)
        } else if self.participant_2_id == self_id {
            Some(self.participant_1_id)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: Option<String>,
    pub kind: MessageKind,
    pub media_url: Option<String>,
    pub is_read: bool,
    pub is_edited: bool,
    pub is_deleted: bool,
    pub created_at_unix_ms: u64,
}

impl MessageRecord {
    /// Total order within a conversation: creation time first, id breaks ties.
    pub fn order_key(&self) -> (u64, MessageId) {
        (self.created_at_unix_ms, self.id)
    }

    pub fn cmp_order(&self, other: &Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: Option<String>,
    pub kind: MessageKind,
    pub media_url: Option<String>,
}

impl NewMessage {
    pub fn text(
        conversation_id: ConversationId,
        sender_id: UserId,
        content: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id,
            sender_id,
            content: Some(content.into()),
            kind: MessageKind::Text,
            media_url: None,
        }
    }
}

/// Flag mutations allowed on a persisted message. Content changes mark the row edited.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub is_read: Option<bool>,
    pub is_deleted: Option<bool>,
}

impl MessagePatch {
    pub fn mark_read() -> Self {
        Self {
            is_read: Some(true),
            ..Self::default()
        }
    }

    pub fn soft_delete() -> Self {
        Self {
            is_deleted: Some(true),
            ..Self::default()
        }
    }

    pub(crate) fn apply(&self, record: &mut MessageRecord) {
        if let Some(content) = &self.content {
            record.content = Some(content.clone());
            record.is_edited = true;
        }
        if let Some(is_read) = self.is_read {
            record.is_read = is_read;
        }
        if let Some(is_deleted) = self.is_deleted {
            record.is_deleted = is_deleted;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProfile {
    pub id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub is_online: bool,
}

impl NewProfile {
    pub fn named(id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            avatar_url: None,
            is_online: false,
        }
    }
}
