use amora_storage::StorageError;
use snafu::Snafu;

use super::timeline::PendingKey;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("no authenticated user on `{stage}`"))]
    NotAuthenticated { stage: &'static str },
    #[snafu(display("chat backend unavailable on `{stage}`: {source}"))]
    BackendUnavailable {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("message content is empty"))]
    EmptyMessage { stage: &'static str },
    #[snafu(display("message is {length} characters long, the limit is {limit}"))]
    MessageTooLong {
        stage: &'static str,
        length: usize,
        limit: usize,
    },
    #[snafu(display("sending {key} failed: {source}"))]
    SendFailed {
        stage: &'static str,
        key: PendingKey,
        source: StorageError,
    },
    #[snafu(display("no optimistic entry for {key}"))]
    PendingEntryMissing {
        stage: &'static str,
        key: PendingKey,
    },
    #[snafu(display("{key} has not failed and cannot be retried or discarded"))]
    PendingEntryNotFailed {
        stage: &'static str,
        key: PendingKey,
    },
    #[snafu(display("no conversation is open on `{stage}`"))]
    NoOpenConversation { stage: &'static str },
}

impl ChatError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::NotAuthenticated { stage }
            | Self::BackendUnavailable { stage, .. }
            | Self::EmptyMessage { stage }
            | Self::MessageTooLong { stage, .. }
            | Self::SendFailed { stage, .. }
            | Self::PendingEntryMissing { stage, .. }
            | Self::PendingEntryNotFailed { stage, .. }
            | Self::NoOpenConversation { stage } => stage,
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
