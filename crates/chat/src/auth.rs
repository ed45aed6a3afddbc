use std::sync::Arc;

use amora_storage::{BoxFuture, UserId};
use arc_swap::ArcSwapOption;
use snafu::OptionExt;

use super::error::{ChatResult, NotAuthenticatedSnafu};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionUser {
    pub id: UserId,
}

/// Source of the signed-in user. Chat components never cache the answer.
pub trait AuthProvider: Send + Sync {
    fn current_user(&self) -> BoxFuture<'_, Option<SessionUser>>;
    fn sign_out(&self) -> BoxFuture<'_, ()>;
}

/// Session held in process memory, swapped atomically on sign in and out.
#[derive(Debug, Default)]
pub struct StaticSession {
    user: ArcSwapOption<SessionUser>,
}

impl StaticSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_in(user_id: UserId) -> Self {
        let session = Self::new();
        session.sign_in(user_id);
        session
    }

    pub fn sign_in(&self, user_id: UserId) {
        tracing::info!(user_id = %user_id, "session signed in");
        self.user.store(Some(Arc::new(SessionUser { id: user_id })));
    }
}

impl AuthProvider for StaticSession {
    fn current_user(&self) -> BoxFuture<'_, Option<SessionUser>> {
        Box::pin(async move { self.user.load_full().map(|user| *user) })
    }

    fn sign_out(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(user) = self.user.swap(None) {
                tracing::info!(user_id = %user.id, "session signed out");
            }
        })
    }
}

pub async fn require_user(auth: &dyn AuthProvider, stage: &'static str) -> ChatResult<SessionUser> {
    auth.current_user()
        .await
        .context(NotAuthenticatedSnafu { stage })
}
