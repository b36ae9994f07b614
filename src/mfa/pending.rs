//! Logins that passed the password check and still owe a second factor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLogin {
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

/// Username-keyed pending logins. A second `insert` replaces the first.
#[async_trait]
pub trait PendingLoginStore: Send + Sync {
    async fn insert(&self, username: &str, user_id: &str, now: DateTime<Utc>) -> Result<()>;

    async fn get(&self, username: &str) -> Result<Option<PendingLogin>>;

    async fn remove(&self, username: &str) -> Result<bool>;

    /// Remove entries created before `cutoff`.
    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn clear(&self) -> Result<()>;
}

#[derive(Clone, Default)]
pub struct InMemoryPendingLoginStore {
    logins: Arc<DashMap<String, PendingLogin>>,
}

impl InMemoryPendingLoginStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.logins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logins.is_empty()
    }
}

#[async_trait]
impl PendingLoginStore for InMemoryPendingLoginStore {
    async fn insert(&self, username: &str, user_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.logins.insert(
            username.to_string(),
            PendingLogin {
                user_id: user_id.to_string(),
                created_at: now,
            },
        );
        Ok(())
    }

    async fn get(&self, username: &str) -> Result<Option<PendingLogin>> {
        Ok(self.logins.get(username).map(|p| p.clone()))
    }

    async fn remove(&self, username: &str) -> Result<bool> {
        Ok(self.logins.remove(username).is_some())
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let before = self.logins.len();
        self.logins.retain(|_, p| p.created_at >= cutoff);
        Ok(before.saturating_sub(self.logins.len()) as u64)
    }

    async fn clear(&self) -> Result<()> {
        self.logins.clear();
        Ok(())
    }
}
