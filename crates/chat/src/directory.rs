use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use amora_storage::{Backend, ConversationId, ConversationRecord, ProfileRecord, UserId};
use snafu::{ResultExt, ensure};

use super::auth::{AuthProvider, require_user};
use super::error::{BackendUnavailableSnafu, ChatResult, NotAuthenticatedSnafu};

/// One row of the conversation list: the conversation plus the other participant's profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub conversation: ConversationRecord,
    pub peer_id: UserId,
    /// `None` when the peer has no visible profile.
    pub peer: Option<ProfileRecord>,
}

impl ConversationSummary {
    pub fn id(&self) -> ConversationId {
        self.conversation.id
    }

    pub fn last_message_at_unix_ms(&self) -> Option<u64> {
        self.conversation.last_message_at_unix_ms
    }

    pub fn peer_name(&self) -> Option<&str> {
        self.peer.as_ref().map(|profile| profile.display_name.as_str())
    }
}

#[derive(Clone)]
pub struct ConversationDirectory {
    backend: Arc<dyn Backend>,
    auth: Arc<dyn AuthProvider>,
}

impl ConversationDirectory {
    pub fn new(backend: Arc<dyn Backend>, auth: Arc<dyn AuthProvider>) -> Self {
        Self { backend, auth }
    }

    pub async fn list_for_current_user(&self) -> ChatResult<Vec<ConversationSummary>> {
        let user = require_user(self.auth.as_ref(), "directory-current-user").await?;
        self.list_conversations(user.id).await
    }

    pub async fn list_conversations(&self, user_id: UserId) -> ChatResult<Vec<ConversationSummary>> {
        let session_user = require_user(self.auth.as_ref(), "directory-list-auth").await?;
        ensure!(
            session_user.id == user_id,
            NotAuthenticatedSnafu {
                stage: "directory-list-foreign-user",
            }
        );

        let conversations = self
            .backend
            .list_conversations(user_id)
            .await
            .inspect_err(|error| {
                tracing::warn!(user_id = %user_id, error = %error, "conversation query failed");
            })
            .context(BackendUnavailableSnafu {
                stage: "directory-list-conversations",
            })?;
        if conversations.is_empty() {
            return Ok(Vec::new());
        }

        let mut peer_ids = conversations
            .iter()
            .filter_map(|conversation| conversation.other_participant(user_id))
            .collect::<Vec<_>>();
        peer_ids.sort();
        peer_ids.dedup();

        let profiles = self
            .backend
            .list_profiles(peer_ids)
            .await
            .context(BackendUnavailableSnafu {
                stage: "directory-list-profiles",
            })?
            .into_iter()
            .map(|profile| (profile.id, profile))
            .collect::<HashMap<_, _>>();

        let mut summaries = conversations
            .into_iter()
            .filter_map(|conversation| {
                let peer_id = conversation.other_participant(user_id)?;
                Some(ConversationSummary {
                    peer: profiles.get(&peer_id).cloned(),
                    peer_id,
                    conversation,
                })
            })
            .collect::<Vec<_>>();
        sort_by_recent_activity(&mut summaries);

        tracing::debug!(
            user_id = %user_id,
            conversation_count = summaries.len(),
            "listed conversations"
        );
        Ok(summaries)
    }
}

/// Newest activity first, silent conversations last, conversation id breaks ties.
pub fn sort_by_recent_activity(summaries: &mut [ConversationSummary]) {
    summaries.sort_by(|left, right| {
        let by_activity = match (left.last_message_at_unix_ms(), right.last_message_at_unix_ms()) {
            (Some(left_at), Some(right_at)) => right_at.cmp(&left_at),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_activity.then_with(|| left.id().cmp(&right.id()))
    });
}

/// Which conversation the list has selected. Only the first non-empty refresh auto-selects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationSelection {
    selected: Option<ConversationId>,
    auto_selected: bool,
}

impl ConversationSelection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn selected(&self) -> Option<ConversationId> {
        self.selected
    }

    pub fn select(&mut self, conversation_id: ConversationId) {
        self.selected = Some(conversation_id);
        self.auto_selected = true;
    }

    pub fn clear(&mut self) {
        self.selected = None;
    }

    pub fn apply_refresh(&mut self, summaries: &[ConversationSummary]) -> Option<ConversationId> {
        if let Some(selected) = self.selected
            && !summaries.iter().any(|summary| summary.id() == selected)
        {
            tracing::debug!(conversation_id = %selected, "selected conversation disappeared");
            self.selected = None;
        }

        if self.selected.is_none() && !self.auto_selected {
            if let Some(first) = summaries.first() {
                self.selected = Some(first.id());
                self.auto_selected = true;
            }
        }

        self.selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticSession;
    use crate::error::ChatError;
    use amora_storage::{MemoryStorage, MessageKind, MessageRecord, NewProfile, MessageId};

    async fn seed_message(storage: &MemoryStorage, conversation: &ConversationRecord, at: u64) {
        storage
            .seed_message(MessageRecord {
                id: MessageId::new_v7(),
                conversation_id: conversation.id,
                sender_id: conversation.participant_1_id,
                content: Some("ping".to_string()),
                kind: MessageKind::Text,
                media_url: None,
                is_read: false,
                is_edited: false,
                is_deleted: false,
                created_at_unix_ms: at,
            })
            .await;
    }

    fn directory(storage: Arc<MemoryStorage>, user_id: UserId) -> ConversationDirectory {
        ConversationDirectory::new(storage, Arc::new(StaticSession::signed_in(user_id)))
    }

    #[tokio::test]
    async fn newest_activity_first_and_silent_conversations_last() {
        let storage = Arc::new(MemoryStorage::new());
        let me = UserId::new_v7();
        let peer_a = UserId::new_v7();
        let peer_b = UserId::new_v7();
        let peer_c = UserId::new_v7();
        storage.upsert_profile(NewProfile::named(peer_a, "Ada")).await;
        storage.upsert_profile(NewProfile::named(peer_b, "Bea")).await;

        let a = storage.create_conversation(me, peer_a).await.expect("a");
        let b = storage.create_conversation(peer_b, me).await.expect("b");
        let c = storage.create_conversation(me, peer_c).await.expect("c");
        seed_message(&storage, &a, 2_000).await;
        seed_message(&storage, &b, 1_000).await;

        let listed = directory(storage, me)
            .list_conversations(me)
            .await
            .expect("list");

        assert_eq!(
            listed.iter().map(ConversationSummary::id).collect::<Vec<_>>(),
            vec![a.id, b.id, c.id]
        );
        assert_eq!(listed[0].peer_name(), Some("Ada"));
        assert_eq!(listed[1].peer_id, peer_b);
        assert_eq!(listed[2].peer, None, "missing profile is not an error");
    }

    #[tokio::test]
    async fn listing_another_user_is_not_authenticated() {
        let storage = Arc::new(MemoryStorage::new());
        let me = UserId::new_v7();
        let error = directory(storage, me)
            .list_conversations(UserId::new_v7())
            .await
            .expect_err("foreign user");
        assert!(matches!(error, ChatError::NotAuthenticated { .. }));

        let signed_out = ConversationDirectory::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(StaticSession::new()),
        );
        let error = signed_out
            .list_for_current_user()
            .await
            .expect_err("signed out");
        assert!(matches!(error, ChatError::NotAuthenticated { .. }));
    }

    #[tokio::test]
    async fn backend_failure_is_unavailable_and_empty_is_ok() {
        let storage = Arc::new(MemoryStorage::new());
        let me = UserId::new_v7();
        let directory = directory(storage.clone(), me);

        assert!(directory.list_for_current_user().await.expect("empty").is_empty());

        storage.set_fail_conversations(true);
        let error = directory
            .list_conversations(me)
            .await
            .expect_err("backend down");
        assert!(matches!(error, ChatError::BackendUnavailable { .. }));
    }

    #[test]
    fn equal_timestamps_order_by_conversation_id() {
        let me = UserId::new_v7();
        let summary = |at: Option<u64>| ConversationSummary {
            conversation: ConversationRecord {
                id: ConversationId::new_v7(),
                participant_1_id: me,
                participant_2_id: UserId::new_v7(),
                last_message_at_unix_ms: at,
                last_message_id: None,
            },
            peer_id: me,
            peer: None,
        };
        let mut summaries = vec![summary(Some(5)), summary(Some(5)), summary(None), summary(None)];
        summaries.reverse();

        sort_by_recent_activity(&mut summaries);

        assert!(summaries[0].id() < summaries[1].id());
        assert!(summaries[2].id() < summaries[3].id());
        assert_eq!(summaries[0].last_message_at_unix_ms(), Some(5));
        assert_eq!(summaries[3].last_message_at_unix_ms(), None);
    }

    #[test]
    fn selection_auto_selects_once_and_clears_vanished_entries() {
        let me = UserId::new_v7();
        let summary = || ConversationSummary {
            conversation: ConversationRecord {
                id: ConversationId::new_v7(),
                participant_1_id: me,
                participant_2_id: UserId::new_v7(),
                last_message_at_unix_ms: None,
                last_message_id: None,
            },
            peer_id: me,
            peer: None,
        };
        let first = summary();
        let second = summary();
        let mut selection = ConversationSelection::new();

        assert_eq!(selection.apply_refresh(&[]), None);
        assert_eq!(
            selection.apply_refresh(&[first.clone(), second.clone()]),
            Some(first.id())
        );

        selection.select(second.id());
        assert_eq!(
            selection.apply_refresh(&[first.clone(), second.clone()]),
            Some(second.id())
        );

        // The selected conversation vanished; nothing is re-selected automatically.
        assert_eq!(selection.apply_refresh(&[first.clone()]), None);
        assert_eq!(selection.apply_refresh(&[first]), None);
    }
}
