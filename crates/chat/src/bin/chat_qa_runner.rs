use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use amora_chat::{
    ChatError, ChatServices, ChatSettings, ConnectionState, ConversationDirectory,
    MessageStreamController, SettingsStore, StaticSession, StreamStatus, Update,
};
use amora_storage::{
    MemoryStorage, MessageId, MessageKind, MessageRecord, MessageStore, NewMessage, NewProfile,
    SqliteStorage, StorageError, UserId,
};
use snafu::{OptionExt, ResultExt, Snafu, ensure};

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    db_path: Option<String>,
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    SchemaInit,
    DirectoryOrder,
    EndToEnd,
    EmptyMessage,
    StaleClose,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "schema_init" => Some(Self::SchemaInit),
            "directory_order" => Some(Self::DirectoryOrder),
            "end_to_end" => Some(Self::EndToEnd),
            "empty_message" => Some(Self::EmptyMessage),
            "stale_close" => Some(Self::StaleClose),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::SchemaInit => "schema_init",
            Self::DirectoryOrder => "directory_order",
            Self::EndToEnd => "end_to_end",
            Self::EmptyMessage => "empty_message",
            Self::StaleClose => "stale_close",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("storage setup failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("chat operation failed on `{stage}`: {source}"))]
    Chat {
        stage: &'static str,
        source: ChatError,
    },
    #[snafu(display("sqlite query failed: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("timed out waiting for a stream update on `{stage}`"))]
    UpdateTimeout { stage: &'static str },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    let store = match args.config_path.clone() {
        Some(path) => SettingsStore::new(path),
        None => SettingsStore::load(),
    };
    let settings = store.settings().as_ref().clone();
    let db_location = settings.database_location_for(args.db_path.as_deref());

    println!("scenario={}", args.scenario.name());
    println!("db_path={db_location}");
    println!("history_page_size={}", settings.history_page_size);

    match args.scenario {
        Scenario::SchemaInit => run_schema_init(&db_location).await,
        Scenario::DirectoryOrder => run_directory_order(&db_location, &settings).await,
        Scenario::EndToEnd => run_end_to_end(&db_location, &settings).await,
        Scenario::EmptyMessage => run_empty_message(&db_location, &settings).await,
        Scenario::StaleClose => run_stale_close(&settings).await,
        Scenario::All => run_all(&db_location, &settings).await,
    }?;

    println!("runner_ok=true");
    Ok(())
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut db_path = None;
    let mut config_path = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;
                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--db" => {
                db_path = Some(pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?);
            }
            "--config" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-config-value",
                    arg: "--config",
                })?;
                config_path = Some(PathBuf::from(value));
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        db_path,
        config_path,
    })
}

async fn run_all(db_location: &str, settings: &ChatSettings) -> RunnerResult<()> {
    // Every scenario opens its own storage handle.
    run_schema_init(db_location).await?;
    run_directory_order(db_location, settings).await?;
    run_end_to_end(db_location, settings).await?;
    run_empty_message(db_location, settings).await?;
    run_stale_close(settings).await?;
    println!("all_passed=true");
    Ok(())
}

async fn open_storage(db_location: &str) -> RunnerResult<Arc<SqliteStorage>> {
    let storage = SqliteStorage::open(db_location)
        .await
        .context(StorageSnafu {
            stage: "open-sqlite-storage",
        })?;
    Ok(Arc::new(storage))
}

async fn run_schema_init(db_location: &str) -> RunnerResult<()> {
    let storage = open_storage(db_location).await?;
    let journal_mode = sqlx::query_scalar::<_, String>("PRAGMA journal_mode;")
        .fetch_one(storage.pool())
        .await
        .context(SqliteQuerySnafu {
            stage: "schema-init-journal-mode",
        })?;
    let foreign_keys = sqlx::query_scalar::<_, i64>("PRAGMA foreign_keys;")
        .fetch_one(storage.pool())
        .await
        .context(SqliteQuerySnafu {
            stage: "schema-init-foreign-keys",
        })?;

    println!("schema_ok=true");
    println!("journal_mode={journal_mode}");
    println!("foreign_keys={foreign_keys}");
    Ok(())
}

async fn run_directory_order(db_location: &str, settings: &ChatSettings) -> RunnerResult<()> {
    let scenario = "directory_order";
    let storage = open_storage(db_location).await?;
    let me = UserId::new_v7();
    let peer_a = UserId::new_v7();
    let peer_b = UserId::new_v7();
    for (id, name) in [(me, "Runner"), (peer_a, "Ada"), (peer_b, "Bea")] {
        storage
            .upsert_profile(NewProfile::named(id, name))
            .await
            .context(StorageSnafu {
                stage: "directory-seed-profile",
            })?;
    }

    let conversation_b = storage
        .create_conversation(me, peer_b)
        .await
        .context(StorageSnafu {
            stage: "directory-seed-conversation-b",
        })?;
    let conversation_a = storage
        .create_conversation(peer_a, me)
        .await
        .context(StorageSnafu {
            stage: "directory-seed-conversation-a",
        })?;
    let silent = storage
        .create_conversation(me, UserId::new_v7())
        .await
        .context(StorageSnafu {
            stage: "directory-seed-conversation-silent",
        })?;

    // B first, then A, so A carries the newer last message.
    for (conversation_id, sender) in [(conversation_b.id, peer_b), (conversation_a.id, peer_a)] {
        storage
            .insert_message(NewMessage::text(conversation_id, sender, "hey"))
            .await
            .context(StorageSnafu {
                stage: "directory-seed-message",
            })?;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let directory = ConversationDirectory::new(
        storage.clone(),
        Arc::new(StaticSession::signed_in(me)),
    );
    let listed = directory
        .list_conversations(me)
        .await
        .context(ChatSnafu {
            stage: "directory-list",
        })?;
    let order = listed.iter().map(|summary| summary.id()).collect::<Vec<_>>();
    let order_ok = order == vec![conversation_a.id, conversation_b.id, silent.id];
    let peers_ok = listed.first().and_then(|summary| summary.peer_name()) == Some("Ada")
        && listed.get(2).is_some_and(|summary| summary.peer.is_none());

    println!("conversation_count={}", listed.len());
    println!("directory_order_ok={order_ok}");
    println!("peer_join_ok={peers_ok}");
    println!("page_size={}", settings.history_page_size);
    ensure!(
        order_ok && peers_ok,
        ScenarioFailedSnafu {
            stage: "directory-order-check",
            scenario,
            reason: format!("unexpected directory order {order:?}"),
        }
    );
    Ok(())
}

async fn run_end_to_end(db_location: &str, settings: &ChatSettings) -> RunnerResult<()> {
    let scenario = "end_to_end";
    let storage = open_storage(db_location).await?;
    let me = UserId::new_v7();
    let peer = UserId::new_v7();
    let conversation = storage
        .create_conversation(me, peer)
        .await
        .context(StorageSnafu {
            stage: "end-to-end-seed-conversation",
        })?;
    let hello = storage
        .insert_message(NewMessage::text(conversation.id, peer, "hello"))
        .await
        .context(StorageSnafu {
            stage: "end-to-end-seed-message",
        })?;

    let mut controller = MessageStreamController::new(ChatServices::new(
        storage.clone(),
        Arc::new(StaticSession::signed_in(me)),
        settings.clone(),
    ));
    controller.open(conversation.id);
    while controller.status() != &StreamStatus::Live
        || controller.connection_state() != Some(&ConnectionState::Connected)
    {
        next_update(&mut controller, "end-to-end-open").await?;
    }

    let key = controller.send("hi").await.context(ChatSnafu {
        stage: "end-to-end-send",
    })?;
    let optimistic_count = controller.entries().len();
    println!("optimistic_count={optimistic_count}");

    let mut confirmed = None;
    let mut echoed = false;
    while confirmed.is_none() || !echoed {
        match next_update(&mut controller, "end-to-end-confirm").await? {
            Update::SendConfirmed { key: acked, id } if acked == key => confirmed = Some(id),
            Update::MessageRefreshed { .. } | Update::MessageReconciled { .. } => echoed = true,
            Update::SendFailed { error, .. } => {
                return Err(error).context(ChatSnafu {
                    stage: "end-to-end-insert",
                });
            }
            _ => {}
        }
    }

    let ids = controller
        .messages()
        .iter()
        .map(|message| message.id)
        .collect::<Vec<_>>();
    let expected = [Some(hello.id), confirmed]
        .into_iter()
        .flatten()
        .collect::<Vec<MessageId>>();
    let no_duplicate = ids == expected && controller.entries().len() == optimistic_count;
    println!("final_count={}", controller.entries().len());
    println!("no_duplicate={no_duplicate}");
    controller.close();

    ensure!(
        optimistic_count == 2 && no_duplicate,
        ScenarioFailedSnafu {
            stage: "end-to-end-check",
            scenario,
            reason: format!("unexpected timeline {ids:?}"),
        }
    );
    Ok(())
}

async fn run_empty_message(db_location: &str, settings: &ChatSettings) -> RunnerResult<()> {
    let scenario = "empty_message";
    let storage = open_storage(db_location).await?;
    let me = UserId::new_v7();
    let conversation = storage
        .create_conversation(me, UserId::new_v7())
        .await
        .context(StorageSnafu {
            stage: "empty-message-seed-conversation",
        })?;

    let mut controller = MessageStreamController::new(ChatServices::new(
        storage.clone(),
        Arc::new(StaticSession::signed_in(me)),
        settings.clone(),
    ));
    controller.open(conversation.id);
    let rejected = matches!(
        controller.send("   ").await,
        Err(ChatError::EmptyMessage { .. })
    );
    controller.close();

    let stored = storage
        .list_recent_messages(conversation.id, 10)
        .await
        .context(StorageSnafu {
            stage: "empty-message-list",
        })?;
    println!("empty_rejected={rejected}");
    println!("stored_count={}", stored.len());
    ensure!(
        rejected && stored.is_empty(),
        ScenarioFailedSnafu {
            stage: "empty-message-check",
            scenario,
            reason: "blank content reached the backend".to_string(),
        }
    );
    Ok(())
}

async fn run_stale_close(settings: &ChatSettings) -> RunnerResult<()> {
    let scenario = "stale_close";
    let storage = Arc::new(MemoryStorage::new());
    let me = UserId::new_v7();
    let peer = UserId::new_v7();
    let conversation = storage
        .create_conversation(me, peer)
        .await
        .context(StorageSnafu {
            stage: "stale-close-seed-conversation",
        })?;
    storage
        .seed_message(MessageRecord {
            id: MessageId::new_v7(),
            conversation_id: conversation.id,
            sender_id: peer,
            content: Some("too late".to_string()),
            kind: MessageKind::Text,
            media_url: None,
            is_read: false,
            is_edited: false,
            is_deleted: false,
            created_at_unix_ms: 100,
        })
        .await;

    let gate = storage.hold_history();
    let mut controller = MessageStreamController::new(ChatServices::new(
        storage.clone(),
        Arc::new(StaticSession::signed_in(me)),
        settings.clone(),
    ));
    controller.open(conversation.id);
    next_update(&mut controller, "stale-close-connect").await?;
    controller.close();
    gate.release();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let leaked = controller.next_update().await.is_some() || !controller.is_empty();
    let subscribers = storage.hub().subscriber_count();
    println!("late_update_leaked={leaked}");
    println!("subscribers_after_close={subscribers}");
    ensure!(
        !leaked && subscribers == 0,
        ScenarioFailedSnafu {
            stage: "stale-close-check",
            scenario,
            reason: "closed stream still received updates".to_string(),
        }
    );
    Ok(())
}

async fn next_update(
    controller: &mut MessageStreamController,
    stage: &'static str,
) -> RunnerResult<Update> {
    let update = tokio::time::timeout(Duration::from_secs(5), controller.next_update())
        .await
        .ok()
        .flatten()
        .context(UpdateTimeoutSnafu { stage })?;
    tracing::debug!(stage, update = ?update, "stream update");
    Ok(update)
}
