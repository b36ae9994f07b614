use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{RotatedRefreshToken, Session, SessionUpdate};
use crate::error::Result;

/// Rows removed by a family invalidation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FamilyPurge {
    pub sessions: u64,
    pub rotated_tokens: u64,
}

/// Persistence for sessions and their rotated-token tombstones.
///
/// Both tables live behind one trait because rotation and family
/// invalidation touch them together. Each method must be atomic: a backend
/// built on a database runs multi-row methods in one transaction, with a
/// unique constraint on `hashed_token` and on `token_family_id`.
///
/// # Example
///
/// ```rust,ignore
/// use pacekeeper::session::{SessionStore, FamilyPurge};
///
/// #[async_trait]
/// impl SessionStore for PgSessionStore {
///     async fn delete_family(&self, family_id: &str) -> Result<FamilyPurge> {
///         let mut tx = self.pool.begin().await?;
///         let rotated_tokens = delete_rotated(&mut tx, family_id).await?;
///         let sessions = delete_sessions(&mut tx, family_id).await?;
///         tx.commit().await?;
///         Ok(FamilyPurge { sessions, rotated_tokens })
///     }
///
///     // ... implement other methods
/// }
/// ```
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session.
    ///
    /// Fails with `Conflict` if the id or family id is already taken.
    async fn create_session(&self, session: &Session) -> Result<()>;

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>>;

    /// Look up the session whose current refresh token has this hash.
    async fn find_session_by_token_hash(&self, refresh_token_hash: &str)
    -> Result<Option<Session>>;

    async fn find_session_by_family(&self, family_id: &str) -> Result<Option<Session>>;

    async fn list_sessions(&self, user_id: &str) -> Result<Vec<Session>>;

    /// Apply a partial update. Returns `false` if the session does not exist.
    async fn update_session(&self, session_id: &str, update: &SessionUpdate) -> Result<bool>;

    /// Set `tokens_exchanged` and apply `update` as one unit, only if the
    /// flag is still unset.
    ///
    /// Returns `true` only for the call that performed the transition. On
    /// `false` or an error nothing is written.
    async fn exchange_tokens(&self, session_id: &str, update: &SessionUpdate) -> Result<bool>;

    /// Write the tombstone for the superseded token and apply `update` as one
    /// unit.
    ///
    /// Only succeeds while the stored `rotation_count` still equals
    /// `expected_rotation_count`; returns `false` when another rotation won
    /// the race or the session is gone, leaving nothing written.
    async fn rotate_session(
        &self,
        session_id: &str,
        expected_rotation_count: u32,
        superseded: &RotatedRefreshToken,
        update: &SessionUpdate,
    ) -> Result<bool>;

    /// Delete a user's session together with its family's tombstones.
    ///
    /// Returns the removed session.
    async fn delete_session(&self, session_id: &str, user_id: &str) -> Result<Option<Session>>;

    /// Delete sessions whose last activity is before `cutoff`, with their
    /// tombstones. Returns the number of sessions removed.
    async fn delete_idle_sessions(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn find_rotated_token(&self, hashed_token: &str) -> Result<Option<RotatedRefreshToken>>;

    /// Insert a tombstone. Fails with `Conflict` on a duplicate hash.
    async fn insert_rotated_token(&self, token: &RotatedRefreshToken) -> Result<()>;

    async fn list_rotated_tokens(&self, family_id: &str) -> Result<Vec<RotatedRefreshToken>>;

    /// Delete every session and tombstone of a family as one unit.
    async fn delete_family(&self, family_id: &str) -> Result<FamilyPurge>;

    /// Delete tombstones whose `expires_at` is before `now`.
    async fn delete_expired_rotated_tokens(&self, now: DateTime<Utc>) -> Result<u64>;
}
