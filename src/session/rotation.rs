//! Refresh-token reuse detection.
//!
//! This module emits tracing events for security monitoring:
//! - `pacekeeper.token.tombstoned` - Superseded token recorded
//! - `pacekeeper.token.reuse_detected` - Superseded token replayed within the grace window
//! - `pacekeeper.token.theft` - Superseded token replayed after the grace window (critical)
//! - `pacekeeper.token.family_invalidated` - Token family deleted
//! - `pacekeeper.token.cleanup` - Expired tombstones swept

use chrono::Duration;

use super::{FamilyPurge, RotatedRefreshToken, SessionStore};
use crate::clock::{SharedClock, system_clock};
use crate::crypto::TokenHasher;
use crate::error::Result;

/// Default grace window after a rotation, in seconds.
pub const DEFAULT_REUSE_GRACE_SECONDS: i64 = 60;

/// Outcome of looking a presented refresh token up among the tombstones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReuseCheck {
    /// Never superseded.
    Fresh,
    /// Superseded less than the grace period ago. Possibly a client retry race.
    WithinGrace(RotatedRefreshToken),
    /// Superseded and the grace period has passed. The chain has moved on and
    /// a stale copy is being replayed.
    Theft(RotatedRefreshToken),
}

impl ReuseCheck {
    pub fn is_reused(&self) -> bool {
        !matches!(self, Self::Fresh)
    }

    pub fn in_grace_period(&self) -> bool {
        matches!(self, Self::WithinGrace(_))
    }

    /// `(is_reused, in_grace_period)`
    pub fn as_flags(&self) -> (bool, bool) {
        (self.is_reused(), self.in_grace_period())
    }

    pub fn tombstone(&self) -> Option<&RotatedRefreshToken> {
        match self {
            Self::Fresh => None,
            Self::WithinGrace(t) | Self::Theft(t) => Some(t),
        }
    }
}

/// Classifies presented refresh tokens and invalidates compromised families.
///
/// Superseded tokens are looked up by their keyed hash. A hit inside the grace
/// window is tolerated; a hit after it means two parties hold the same
/// lineage, so the whole family (every session and tombstone) is deleted and
/// everyone holding it has to log in again.
///
/// # Example
///
/// ```rust,ignore
/// use pacekeeper::session::{ReuseDetector, ReuseCheck};
///
/// let detector = ReuseDetector::new(store, TokenHasher::from_config(&config.security)?);
///
/// match detector.check_token_reuse(&presented).await? {
///     ReuseCheck::Fresh => { /* rotate normally */ }
///     ReuseCheck::WithinGrace(_) => { /* benign retry */ }
///     ReuseCheck::Theft(t) => {
///         detector.invalidate_token_family(&t.token_family_id).await?;
///     }
/// }
/// ```
pub struct ReuseDetector<S: SessionStore> {
    store: S,
    hasher: TokenHasher,
    grace_period: Duration,
    clock: SharedClock,
}

impl<S: SessionStore> ReuseDetector<S> {
    #[must_use]
    pub fn new(store: S, hasher: TokenHasher) -> Self {
        Self {
            store,
            hasher,
            grace_period: Duration::seconds(DEFAULT_REUSE_GRACE_SECONDS),
            clock: system_clock(),
        }
    }

    #[must_use]
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn hasher(&self) -> &TokenHasher {
        &self.hasher
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Classify a raw refresh token.
    pub async fn check_token_reuse(&self, raw_token: &str) -> Result<ReuseCheck> {
        let hashed = self.hasher.hash(raw_token)?;
        self.check_hashed(&hashed).await
    }

    /// Classify an already-hashed refresh token.
    pub async fn check_hashed(&self, hashed_token: &str) -> Result<ReuseCheck> {
        let Some(tombstone) = self.store.find_rotated_token(hashed_token).await? else {
            return Ok(ReuseCheck::Fresh);
        };

        let now = self.clock.now();
        if tombstone.in_grace_period(now) {
            tracing::warn!(
                target: "pacekeeper.token.reuse_detected",
                family_id = %tombstone.token_family_id,
                rotation_count = tombstone.rotation_count,
                seconds_since_rotation = (now - tombstone.rotated_at).num_seconds(),
                "Refresh token reused within grace period"
            );
            Ok(ReuseCheck::WithinGrace(tombstone))
        } else {
            tracing::error!(
                target: "pacekeeper.token.theft",
                family_id = %tombstone.token_family_id,
                rotation_count = tombstone.rotation_count,
                rotated_at = %tombstone.rotated_at,
                "SECURITY: Refresh token reused after grace period, possible token theft"
            );
            Ok(ReuseCheck::Theft(tombstone))
        }
    }

    /// Build the tombstone for a superseded token hash, stamped now.
    pub fn tombstone_for(
        &self,
        hashed_token: impl Into<String>,
        family_id: impl Into<String>,
        rotation_count: u32,
    ) -> RotatedRefreshToken {
        RotatedRefreshToken::new(
            hashed_token,
            family_id,
            rotation_count,
            self.clock.now(),
            self.grace_period,
        )
    }

    /// Tombstone a superseded raw token.
    pub async fn store_rotated_token(
        &self,
        raw_token: &str,
        family_id: &str,
        rotation_count: u32,
    ) -> Result<RotatedRefreshToken> {
        let hashed = self.hasher.hash(raw_token)?;
        let tombstone = self.tombstone_for(hashed, family_id, rotation_count);
        self.store.insert_rotated_token(&tombstone).await?;

        tracing::debug!(
            target: "pacekeeper.token.tombstoned",
            family_id = %family_id,
            rotation_count = rotation_count,
            "Stored rotated refresh token"
        );
        Ok(tombstone)
    }

    /// Delete every session and tombstone of a family.
    ///
    /// Returns the number of sessions invalidated. Calling it again for the
    /// same family deletes nothing and returns 0.
    pub async fn invalidate_token_family(&self, family_id: &str) -> Result<u64> {
        let FamilyPurge {
            sessions,
            rotated_tokens,
        } = self.store.delete_family(family_id).await?;

        tracing::error!(
            target: "pacekeeper.token.family_invalidated",
            family_id = %family_id,
            sessions_deleted = sessions,
            rotated_tokens_deleted = rotated_tokens,
            "SECURITY: Token family invalidated"
        );
        Ok(sessions)
    }

    /// Sweep tombstones past their grace marker.
    ///
    /// Failures are logged and reported as zero deletions.
    pub async fn cleanup_expired_rotated_tokens(&self) -> u64 {
        let now = self.clock.now();
        match self.store.delete_expired_rotated_tokens(now).await {
            Ok(deleted) => {
                if deleted > 0 {
                    tracing::info!(
                        target: "pacekeeper.token.cleanup",
                        deleted = deleted,
                        "Cleaned up expired rotated refresh tokens"
                    );
                }
                deleted
            }
            Err(e) => {
                tracing::error!(
                    target: "pacekeeper.token.cleanup",
                    error = %e,
                    "Failed to clean up expired rotated refresh tokens"
                );
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::session::{ClientType, Session};
    use crate::store::InMemorySessionStore;
    use chrono::Utc;
    use secrecy::SecretString;

    fn detector(clock: &ManualClock) -> ReuseDetector<InMemorySessionStore> {
        let hasher = TokenHasher::new(SecretString::from("test-secret".to_string())).unwrap();
        ReuseDetector::new(InMemorySessionStore::new(), hasher).with_clock(clock.shared())
    }

    fn session(id: &str, family: &str, clock: &ManualClock) -> Session {
        let now = clock.now();
        Session {
            id: id.to_string(),
            user_id: "user-1".to_string(),
            token_family_id: family.to_string(),
            refresh_token_hash: format!("current-{}", id),
            csrf_token_hash: None,
            rotation_count: 0,
            client_type: ClientType::Web,
            ip_address: None,
            user_agent: None,
            created_at: now,
            last_rotation_at: None,
            last_activity_at: now,
            expires_at: now + Duration::days(7),
            oauth_state_id: None,
            tokens_exchanged: false,
        }
    }

    #[tokio::test]
    async fn test_unknown_token_is_fresh() {
        let clock = ManualClock::new(Utc::now());
        let detector = detector(&clock);

        let check = detector.check_token_reuse("never-seen").await.unwrap();
        assert_eq!(check, ReuseCheck::Fresh);
        assert_eq!(check.as_flags(), (false, false));
    }

    #[tokio::test]
    async fn test_reuse_within_grace() {
        let clock = ManualClock::new(Utc::now());
        let detector = detector(&clock);

        detector.store_rotated_token("old-token", "fam-1", 0).await.unwrap();
        clock.advance(Duration::seconds(10));

        let check = detector.check_token_reuse("old-token").await.unwrap();
        assert_eq!(check.as_flags(), (true, true));
        assert_eq!(check.tombstone().unwrap().token_family_id, "fam-1");
    }

    #[tokio::test]
    async fn test_reuse_after_grace_is_theft() {
        let clock = ManualClock::new(Utc::now());
        let detector = detector(&clock);

        detector.store_rotated_token("old-token", "fam-1", 0).await.unwrap();

        clock.advance(Duration::seconds(10));
        assert_eq!(
            detector.check_token_reuse("old-token").await.unwrap().as_flags(),
            (true, true)
        );

        clock.advance(Duration::seconds(51));
        assert_eq!(
            detector.check_token_reuse("old-token").await.unwrap().as_flags(),
            (true, false)
        );
    }

    #[tokio::test]
    async fn test_custom_grace_period() {
        let clock = ManualClock::new(Utc::now());
        let detector = detector(&clock).with_grace_period(Duration::seconds(5));

        detector.store_rotated_token("old-token", "fam-1", 0).await.unwrap();
        clock.advance(Duration::seconds(6));

        assert!(matches!(
            detector.check_token_reuse("old-token").await.unwrap(),
            ReuseCheck::Theft(_)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_tombstone_conflicts() {
        let clock = ManualClock::new(Utc::now());
        let detector = detector(&clock);

        detector.store_rotated_token("old-token", "fam-1", 0).await.unwrap();
        let err = detector
            .store_rotated_token("old-token", "fam-1", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::PacekeeperError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_invalidate_family_is_idempotent() {
        let clock = ManualClock::new(Utc::now());
        let detector = detector(&clock);

        detector
            .store()
            .create_session(&session("s1", "fam-1", &clock))
            .await
            .unwrap();
        detector
            .store()
            .create_session(&session("s2", "fam-2", &clock))
            .await
            .unwrap();
        detector.store_rotated_token("t1", "fam-1", 0).await.unwrap();
        detector.store_rotated_token("t2", "fam-1", 1).await.unwrap();
        detector.store_rotated_token("t3", "fam-2", 0).await.unwrap();

        assert_eq!(detector.invalidate_token_family("fam-1").await.unwrap(), 1);
        assert!(detector.store().get_session("s1").await.unwrap().is_none());
        assert!(detector.store().list_rotated_tokens("fam-1").await.unwrap().is_empty());

        // Other families untouched
        assert!(detector.store().get_session("s2").await.unwrap().is_some());
        assert_eq!(detector.store().list_rotated_tokens("fam-2").await.unwrap().len(), 1);

        assert_eq!(detector.invalidate_token_family("fam-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_expired_rotated_tokens() {
        let clock = ManualClock::new(Utc::now());
        let detector = detector(&clock);

        detector.store_rotated_token("t1", "fam-1", 0).await.unwrap();
        clock.advance(Duration::seconds(30));
        detector.store_rotated_token("t2", "fam-1", 1).await.unwrap();

        clock.advance(Duration::seconds(31));
        assert_eq!(detector.cleanup_expired_rotated_tokens().await, 1);
        assert_eq!(detector.check_token_reuse("t1").await.unwrap(), ReuseCheck::Fresh);
        assert!(detector.check_token_reuse("t2").await.unwrap().is_reused());

        assert_eq!(detector.cleanup_expired_rotated_tokens().await, 0);
    }
}
