use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};

use super::error::{
    ConflictSnafu, CreateSqliteDirectorySnafu, InvariantViolationSnafu, NotFoundSnafu,
    SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu,
    SqliteQuerySnafu, StorageResult,
};
use super::feed::{DEFAULT_FEED_CAPACITY, MessageHub, MessageSubscription};
use super::ids::{ConversationId, MessageId, UserId};
use super::types::{
    ConversationRecord, MessageKind, MessagePatch, MessageRecord, NewMessage, NewProfile,
    ProfileRecord,
};
use super::{
    BoxFuture, ConversationStore, MessageFeed, MessageStore, ProfileStore, unix_timestamp_millis,
};

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, content, message_type, media_url, is_read, is_edited, is_deleted, created_at";

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
    hub: Arc<MessageHub>,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        Self::open_with_feed_capacity(database_location, DEFAULT_FEED_CAPACITY).await
    }

    pub async fn open_with_feed_capacity(
        database_location: &str,
        feed_capacity: usize,
    ) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let in_memory = database_url.contains(":memory:");
        let journal_mode = if in_memory {
            SqliteJournalMode::Memory
        } else {
            SqliteJournalMode::Wal
        };
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(journal_mode)
            .busy_timeout(Duration::from_millis(5_000));

        let mut pool_options = SqlitePoolOptions::new().max_connections(1);
        if in_memory {
            // An in-memory database lives exactly as long as its single connection.
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;
        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::info!(database_url = %database_url, "opened sqlite chat storage");

        Ok(Self {
            pool,
            database_url,
            hub: Arc::new(MessageHub::new(feed_capacity)),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn hub(&self) -> &MessageHub {
        &self.hub
    }

    pub async fn upsert_profile(&self, input: NewProfile) -> StorageResult<ProfileRecord> {
        sqlx::query(
            "INSERT INTO profiles (id, display_name, avatar_url, is_online) VALUES (?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name, avatar_url = excluded.avatar_url, is_online = excluded.is_online",
        )
        .bind(input.id.to_string())
        .bind(input.display_name.clone())
        .bind(input.avatar_url.clone())
        .bind(input.is_online)
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "profile-upsert",
        })?;

        Ok(ProfileRecord {
            id: input.id,
            display_name: input.display_name,
            avatar_url: input.avatar_url,
            is_online: input.is_online,
        })
    }

    pub async fn create_conversation(
        &self,
        participant_1_id: UserId,
        participant_2_id: UserId,
    ) -> StorageResult<ConversationRecord> {
        if participant_1_id == participant_2_id {
            return ConflictSnafu {
                stage: "conversation-create-same-participant",
                entity: "conversation",
                details: "a conversation needs two distinct participants".to_string(),
            }
            .fail();
        }

        let conversation_id = ConversationId::new_v7();
        let now = u64_to_i64(unix_timestamp_millis(), "conversation-create-created-at")?;
        sqlx::query(
            "INSERT INTO conversations (id, participant_1_id, participant_2_id, is_group, group_name, last_message_at, last_message_id, created_at) VALUES (?, ?, ?, 0, NULL, NULL, NULL, ?)",
        )
        .bind(conversation_id.to_string())
        .bind(participant_1_id.to_string())
        .bind(participant_2_id.to_string())
        .bind(now)
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "conversation-create-insert",
        })?;

        Ok(ConversationRecord {
            id: conversation_id,
            participant_1_id,
            participant_2_id,
            last_message_at_unix_ms: None,
            last_message_id: None,
        })
    }
}

impl ProfileStore for SqliteStorage {
    fn list_profiles(&self, ids: Vec<UserId>) -> BoxFuture<'_, StorageResult<Vec<ProfileRecord>>> {
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(Vec::new());
            }

            let mut builder = QueryBuilder::<Sqlite>::new(
                "SELECT id, display_name, avatar_url, is_online FROM profiles WHERE id IN (",
            );
            let mut separated = builder.separated(", ");
            for id in &ids {
                separated.push_bind(id.to_string());
            }
            separated.push_unseparated(")");

            let rows = builder
                .build_query_as::<ProfileRow>()
                .fetch_all(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "profile-list-query",
                })?;

            rows.into_iter().map(profile_row_to_record).collect()
        })
    }
}

impl ConversationStore for SqliteStorage {
    fn list_conversations(
        &self,
        participant: UserId,
    ) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, ConversationRow>(
                "SELECT id, participant_1_id, participant_2_id, last_message_at, last_message_id FROM conversations WHERE participant_1_id = ? OR participant_2_id = ?",
            )
            .bind(participant.to_string())
            .bind(participant.to_string())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-list-query",
            })?;

            rows.into_iter().map(conversation_row_to_record).collect()
        })
    }
}

impl MessageStore for SqliteStorage {
    fn insert_message(&self, input: NewMessage) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "message-insert-begin",
            })?;

            let conversation_exists =
                sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM conversations WHERE id = ?")
                    .bind(input.conversation_id.to_string())
                    .fetch_one(&mut *tx)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "message-insert-load-conversation",
                    })?
                    > 0;
            if !conversation_exists {
                return NotFoundSnafu {
                    stage: "message-insert-missing-conversation",
                    entity: "conversation",
                    id: input.conversation_id.to_string(),
                }
                .fail();
            }

            let message_id = MessageId::new_v7();
            let created_at_unix_ms = unix_timestamp_millis();
            let created_at = u64_to_i64(created_at_unix_ms, "message-insert-created-at")?;

            sqlx::query(
                "INSERT INTO messages (id, conversation_id, sender_id, content, message_type, media_url, is_read, is_edited, is_deleted, created_at) VALUES (?, ?, ?, ?, ?, ?, 0, 0, 0, ?)",
            )
            .bind(message_id.to_string())
            .bind(input.conversation_id.to_string())
            .bind(input.sender_id.to_string())
            .bind(input.content.clone())
            .bind(input.kind.as_str())
            .bind(input.media_url.clone())
            .bind(created_at)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-insert-row",
            })?;

            // Last-message fields only move forward so a late writer never rewinds the preview.
            sqlx::query(
                "UPDATE conversations SET last_message_at = ?, last_message_id = ? WHERE id = ? AND (last_message_at IS NULL OR last_message_at <= ?)",
            )
            .bind(created_at)
            .bind(message_id.to_string())
            .bind(input.conversation_id.to_string())
            .bind(created_at)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-insert-touch-conversation",
            })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-insert-commit",
            })?;

            let record = MessageRecord {
                id: message_id,
                conversation_id: input.conversation_id,
                sender_id: input.sender_id,
                content: input.content,
                kind: input.kind,
                media_url: input.media_url,
                is_read: false,
                is_edited: false,
                is_deleted: false,
                created_at_unix_ms,
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
            let limit = u64_to_i64(limit as u64, "message-history-limit")?;
            let rows = sqlx::query_as::<_, MessageRow>(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ? ORDER BY created_at DESC, id DESC LIMIT ?"
            ))
            .bind(conversation_id.to_string())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-history-query",
            })?;

            let mut messages = rows
                .into_iter()
                .map(message_row_to_record)
                .collect::<StorageResult<Vec<_>>>()?;
            messages.reverse();
            Ok(messages)
        })
    }

    fn update_message(
        &self,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let update_result = sqlx::query(
                "UPDATE messages SET content = COALESCE(?, content), is_edited = CASE WHEN ? IS NULL THEN is_edited ELSE 1 END, is_read = COALESCE(?, is_read), is_deleted = COALESCE(?, is_deleted) WHERE id = ?",
            )
            .bind(patch.content.clone())
            .bind(patch.content)
            .bind(patch.is_read)
            .bind(patch.is_deleted)
            .bind(message_id.to_string())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-update-apply",
            })?;

            if update_result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "message-update-missing",
                    entity: "message",
                    id: message_id.to_string(),
                }
                .fail();
            }

            let row = sqlx::query_as::<_, MessageRow>(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
            ))
            .bind(message_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-update-load",
            })?
            .context(NotFoundSnafu {
                stage: "message-update-load-missing",
                entity: "message",
                id: message_id.to_string(),
            })?;

            message_row_to_record(row)
        })
    }
}

impl MessageFeed for SqliteStorage {
    fn subscribe_inserts(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<MessageSubscription>> {
        Box::pin(async move { Ok(self.hub.subscribe(conversation_id)) })
    }
}

#[derive(Debug, FromRow)]
struct ProfileRow {
    id: String,
    display_name: String,
    avatar_url: Option<String>,
    is_online: bool,
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    participant_1_id: String,
    participant_2_id: String,
    last_message_at: Option<i64>,
    last_message_id: Option<String>,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    sender_id: String,
    content: Option<String>,
    message_type: String,
    media_url: Option<String>,
    is_read: bool,
    is_edited: bool,
    is_deleted: bool,
    created_at: i64,
}

fn profile_row_to_record(row: ProfileRow) -> StorageResult<ProfileRecord> {
    Ok(ProfileRecord {
        id: UserId::parse(&row.id)?,
        display_name: row.display_name,
        avatar_url: row.avatar_url,
        is_online: row.is_online,
    })
}

fn conversation_row_to_record(row: ConversationRow) -> StorageResult<ConversationRecord> {
    Ok(ConversationRecord {
        id: ConversationId::parse(&row.id)?,
        participant_1_id: UserId::parse(&row.participant_1_id)?,
        participant_2_id: UserId::parse(&row.participant_2_id)?,
        last_message_at_unix_ms: row
            .last_message_at
            .map(|value| i64_to_u64(value, "conversation-row-last-message-at"))
            .transpose()?,
        last_message_id: row
            .last_message_id
            .as_deref()
            .map(MessageId::parse)
            .transpose()?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    let kind = MessageKind::parse(&row.message_type).context(InvariantViolationSnafu {
        stage: "message-row-kind",
        details: format!("unknown message type '{}'", row.message_type),
    })?;

    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        conversation_id: ConversationId::parse(&row.conversation_id)?,
        sender_id: UserId::parse(&row.sender_id)?,
        content: row.content,
        kind,
        media_url: row.media_url,
        is_read: row.is_read,
        is_edited: row.is_edited,
        is_deleted: row.is_deleted,
        created_at_unix_ms: i64_to_u64(row.created_at, "message-row-created-at")?,
    })
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    u64::try_from(value)
        .ok()
        .context(InvariantViolationSnafu {
            stage,
            details: format!("sqlite i64 '{value}' cannot map to u64"),
        })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    i64::try_from(value)
        .ok()
        .context(InvariantViolationSnafu {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
                stage: "sqlite-open-create-directory",
                path: parent.display().to_string(),
            })?;
        }
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
