use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::str::FromStr;

use snafu::ResultExt;
use uuid::Uuid;

use super::error::{InvalidIdSnafu, StorageError, StorageResult};

/// Entity an [`Id`] points at.
pub trait IdKind {
    /// Shows up in parse errors and `Debug` output.
    const LABEL: &'static str;
}

pub mod kind {
    use super::IdKind;

    pub enum User {}
    pub enum Conversation {}
    pub enum Message {}

    impl IdKind for User {
        const LABEL: &'static str = "user-id";
    }

    impl IdKind for Conversation {
        const LABEL: &'static str = "conversation-id";
    }

    impl IdKind for Message {
        const LABEL: &'static str = "message-id";
    }
}

pub type UserId = Id<kind::User>;
pub type ConversationId = Id<kind::Conversation>;
pub type MessageId = Id<kind::Message>;

/// UUID tagged with the entity it identifies. Stored and bound as its hyphenated text form.
pub struct Id<K> {
    raw: Uuid,
    kind: PhantomData<fn() -> K>,
}

impl<K> Id<K> {
    pub fn new(raw: Uuid) -> Self {
        Self {
            raw,
            kind: PhantomData,
        }
    }

    /// Time-ordered id, so freshly created rows sort after older ones.
    pub fn new_v7() -> Self {
        Self::new(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.raw
    }
}

impl<K: IdKind> Id<K> {
    pub fn parse(raw: &str) -> StorageResult<Self> {
        Uuid::parse_str(raw)
            .map(Self::new)
            .context(InvalidIdSnafu {
                stage: "parse-storage-id",
                id_type: K::LABEL,
                raw: raw.to_string(),
            })
    }
}

impl<K> Clone for Id<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Id<K> {}

impl<K> PartialEq for Id<K> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<K> Eq for Id<K> {}

impl<K> PartialOrd for Id<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Id<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl<K> Hash for Id<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<K: IdKind> fmt::Debug for Id<K> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}({})", K::LABEL, self.raw)
    }
}

impl<K> fmt::Display for Id<K> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.raw, formatter)
    }
}

impl<K> From<Uuid> for Id<K> {
    fn from(raw: Uuid) -> Self {
        Self::new(raw)
    }
}

impl<K> From<Id<K>> for Uuid {
    fn from(id: Id<K>) -> Self {
        id.raw
    }
}

impl<K: IdKind> FromStr for Id<K> {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        Self::parse(raw)
    }
}
