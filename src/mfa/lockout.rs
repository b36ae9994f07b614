//! Progressive lockout for failed second-factor attempts.
//!
//! Counts failures per username and locks the name out on a ladder:
//! 5 failures for 5 minutes, 10 for 30 minutes, 15 for 2 hours. Failures
//! submitted while locked are not counted, so hammering the endpoint cannot
//! push the lockout further out.
//!
//! Tracing targets:
//! - `pacekeeper.mfa.lockout` - A lockout was armed
//! - `pacekeeper.mfa.cleanup` - Stale attempt records and pending logins swept

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use super::pending::{InMemoryPendingLoginStore, PendingLoginStore};
use crate::clock::{SharedClock, system_clock};
use crate::config::SecurityConfig;
use crate::error::Result;

/// Failure-count thresholds and the lockout each one arms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockoutLadder {
    steps: Vec<(u32, Duration)>,
}

impl Default for LockoutLadder {
    fn default() -> Self {
        Self {
            steps: vec![
                (5, Duration::minutes(5)),
                (10, Duration::minutes(30)),
                (15, Duration::hours(2)),
            ],
        }
    }
}

impl LockoutLadder {
    /// Build a ladder from `(threshold, lockout)` pairs in any order.
    pub fn new(mut steps: Vec<(u32, Duration)>) -> Self {
        steps.sort_by_key(|(threshold, _)| *threshold);
        Self { steps }
    }

    /// Lockout for the highest threshold `failed_count` has reached.
    pub fn lockout_for(&self, failed_count: u32) -> Option<Duration> {
        self.steps
            .iter()
            .rev()
            .find(|(threshold, _)| failed_count >= *threshold)
            .map(|(_, duration)| *duration)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub failed_count: u32,
    pub lockout_until: Option<DateTime<Utc>>,
    pub last_failure_at: DateTime<Utc>,
}

impl AttemptRecord {
    fn empty(now: DateTime<Utc>) -> Self {
        Self {
            failed_count: 0,
            lockout_until: None,
            last_failure_at: now,
        }
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lockout_until.is_some_and(|until| now <= until)
    }

    /// Lockout armed and already elapsed.
    pub fn lockout_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.lockout_until.is_some_and(|until| now > until)
    }

    /// Count one failure unless currently locked.
    pub fn register_failure(&mut self, now: DateTime<Utc>, ladder: &LockoutLadder) {
        if self.is_locked(now) {
            return;
        }
        self.failed_count = self.failed_count.saturating_add(1);
        self.last_failure_at = now;
        self.lockout_until = ladder.lockout_for(self.failed_count).map(|d| now + d);
    }
}

/// Per-username failure counters.
///
/// `increment_with_policy` must read, apply the ladder and write as one step.
#[async_trait]
pub trait MfaAttemptStore: Send + Sync {
    async fn get(&self, username: &str) -> Result<Option<AttemptRecord>>;

    async fn increment_with_policy(
        &self,
        username: &str,
        now: DateTime<Utc>,
        ladder: &LockoutLadder,
    ) -> Result<AttemptRecord>;

    async fn reset(&self, username: &str) -> Result<bool>;

    /// Remove the record only if its lockout has elapsed at `now`.
    async fn clear_if_elapsed(&self, username: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Remove unlocked records whose last failure is before `idle_before`.
    async fn prune(&self, idle_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64>;

    async fn clear(&self) -> Result<()>;
}

/// Process-local [`MfaAttemptStore`]. Not shared between instances.
#[derive(Clone, Default)]
pub struct InMemoryAttemptStore {
    records: Arc<DashMap<String, AttemptRecord>>,
}

impl InMemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl MfaAttemptStore for InMemoryAttemptStore {
    async fn get(&self, username: &str) -> Result<Option<AttemptRecord>> {
        Ok(self.records.get(username).map(|r| r.clone()))
    }

    async fn increment_with_policy(
        &self,
        username: &str,
        now: DateTime<Utc>,
        ladder: &LockoutLadder,
    ) -> Result<AttemptRecord> {
        // The entry guard holds the shard lock across read-modify-write
        let mut entry = self
            .records
            .entry(username.to_string())
            .or_insert_with(|| AttemptRecord::empty(now));
        entry.register_failure(now, ladder);
        Ok(entry.clone())
    }

    async fn reset(&self, username: &str) -> Result<bool> {
        Ok(self.records.remove(username).is_some())
    }

    async fn clear_if_elapsed(&self, username: &str, now: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .records
            .remove_if(username, |_, record| record.lockout_elapsed(now))
            .is_some())
    }

    async fn prune(&self, idle_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        let before = self.records.len();
        self.records
            .retain(|_, record| record.is_locked(now) || record.last_failure_at >= idle_before);
        Ok(before.saturating_sub(self.records.len()) as u64)
    }

    async fn clear(&self) -> Result<()> {
        self.records.clear();
        Ok(())
    }
}

/// What [`MfaLockoutGuard::sweep_stale`] removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaleSweep {
    pub attempt_records: u64,
    pub pending_logins: u64,
}

impl StaleSweep {
    pub fn total(&self) -> u64 {
        self.attempt_records + self.pending_logins
    }
}

/// Lockout bookkeeping and the pending-login map for two-step logins.
pub struct MfaLockoutGuard<A = InMemoryAttemptStore, P = InMemoryPendingLoginStore>
where
    A: MfaAttemptStore,
    P: PendingLoginStore,
{
    attempts: A,
    pending: P,
    ladder: LockoutLadder,
    max_age: Duration,
    clock: SharedClock,
}

impl MfaLockoutGuard {
    /// Guard backed by process-local maps.
    pub fn in_memory() -> Self {
        Self::new(InMemoryAttemptStore::new(), InMemoryPendingLoginStore::new())
    }
}

impl<A: MfaAttemptStore, P: PendingLoginStore> MfaLockoutGuard<A, P> {
    #[must_use]
    pub fn new(attempts: A, pending: P) -> Self {
        Self {
            attempts,
            pending,
            ladder: LockoutLadder::default(),
            max_age: SecurityConfig::default().pending_login_max_age(),
            clock: system_clock(),
        }
    }

    #[must_use]
    pub fn from_config(attempts: A, pending: P, config: &SecurityConfig) -> Self {
        Self::new(attempts, pending).with_max_age(config.pending_login_max_age())
    }

    #[must_use]
    pub fn with_ladder(mut self, ladder: LockoutLadder) -> Self {
        self.ladder = ladder;
        self
    }

    /// Age after which idle entries are swept.
    #[must_use]
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn attempts(&self) -> &A {
        &self.attempts
    }

    pub fn pending(&self) -> &P {
        &self.pending
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Count a failed attempt and return the failure count.
    ///
    /// While locked the existing count comes back unchanged.
    pub async fn record_failed_attempt(&self, username: &str) -> Result<u32> {
        let now = self.clock.now();
        let was_locked = self.get_lockout_time(username).await?.is_some();
        let record = self
            .attempts
            .increment_with_policy(username, now, &self.ladder)
            .await?;

        if !was_locked {
            if let Some(until) = record.lockout_until {
                tracing::warn!(
                    target: "pacekeeper.mfa.lockout",
                    username = %username,
                    failed_attempts = record.failed_count,
                    lockout_minutes = (until - now).num_minutes(),
                    "MFA lockout applied"
                );
            }
        }
        Ok(record.failed_count)
    }

    /// Whether `username` is locked right now.
    ///
    /// Reading an elapsed lockout removes the record, which also resets the
    /// failure count.
    pub async fn is_locked_out(&self, username: &str) -> Result<bool> {
        let now = self.clock.now();
        match self.attempts.get(username).await? {
            Some(record) if record.is_locked(now) => Ok(true),
            Some(record) if record.lockout_elapsed(now) => {
                self.attempts.clear_if_elapsed(username, now).await?;
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    /// When the active lockout ends, if there is one. Never clears.
    pub async fn get_lockout_time(&self, username: &str) -> Result<Option<DateTime<Utc>>> {
        let now = self.clock.now();
        Ok(self
            .attempts
            .get(username)
            .await?
            .filter(|r| r.is_locked(now))
            .and_then(|r| r.lockout_until))
    }

    pub async fn reset_failed_attempts(&self, username: &str) -> Result<()> {
        self.attempts.reset(username).await?;
        Ok(())
    }

    pub async fn add_pending_login(&self, username: &str, user_id: &str) -> Result<()> {
        self.pending
            .insert(username, user_id, self.clock.now())
            .await
    }

    pub async fn get_pending_login(&self, username: &str) -> Result<Option<String>> {
        Ok(self.pending.get(username).await?.map(|p| p.user_id))
    }

    pub async fn delete_pending_login(&self, username: &str) -> Result<bool> {
        self.pending.remove(username).await
    }

    pub async fn has_pending_login(&self, username: &str) -> Result<bool> {
        Ok(self.pending.get(username).await?.is_some())
    }

    /// Drop pending logins and unlocked attempt records older than the
    /// configured max age.
    pub async fn sweep_stale(&self, now: DateTime<Utc>) -> Result<StaleSweep> {
        let cutoff = now - self.max_age;
        let swept = StaleSweep {
            attempt_records: self.attempts.prune(cutoff, now).await?,
            pending_logins: self.pending.prune(cutoff).await?,
        };
        if swept.total() > 0 {
            tracing::info!(
                target: "pacekeeper.mfa.cleanup",
                attempt_records = swept.attempt_records,
                pending_logins = swept.pending_logins,
                "Swept stale MFA entries"
            );
        }
        Ok(swept)
    }

    /// Forget every pending login and attempt record.
    pub async fn clear_all(&self) -> Result<()> {
        self.pending.clear().await?;
        self.attempts.clear().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn guard(clock: &ManualClock) -> MfaLockoutGuard {
        MfaLockoutGuard::in_memory().with_clock(clock.shared())
    }

    #[test]
    fn test_ladder_thresholds() {
        let ladder = LockoutLadder::default();
        assert_eq!(ladder.lockout_for(4), None);
        assert_eq!(ladder.lockout_for(5), Some(Duration::minutes(5)));
        assert_eq!(ladder.lockout_for(9), Some(Duration::minutes(5)));
        assert_eq!(ladder.lockout_for(10), Some(Duration::minutes(30)));
        assert_eq!(ladder.lockout_for(15), Some(Duration::hours(2)));
        assert_eq!(ladder.lockout_for(40), Some(Duration::hours(2)));
    }

    #[tokio::test]
    async fn test_fifth_failure_locks() {
        let clock = ManualClock::starting_now();
        let guard = guard(&clock);

        for expected in 1..=4 {
            assert_eq!(guard.record_failed_attempt("alice").await.unwrap(), expected);
            assert!(!guard.is_locked_out("alice").await.unwrap());
        }
        assert_eq!(guard.record_failed_attempt("alice").await.unwrap(), 5);
        assert!(guard.is_locked_out("alice").await.unwrap());
        assert_eq!(
            guard.get_lockout_time("alice").await.unwrap(),
            Some(clock.now() + Duration::minutes(5))
        );
    }

    #[tokio::test]
    async fn test_failures_while_locked_not_counted() {
        let clock = ManualClock::starting_now();
        let guard = guard(&clock);
        for _ in 0..5 {
            guard.record_failed_attempt("alice").await.unwrap();
        }
        let until = guard.get_lockout_time("alice").await.unwrap();

        clock.advance(Duration::minutes(2));
        for _ in 0..10 {
            assert_eq!(guard.record_failed_attempt("alice").await.unwrap(), 5);
        }
        assert_eq!(guard.get_lockout_time("alice").await.unwrap(), until);
    }

    #[tokio::test]
    async fn test_ladder_escalates_without_reads() {
        let clock = ManualClock::starting_now();
        let guard = guard(&clock);

        for _ in 0..5 {
            guard.record_failed_attempt("bob").await.unwrap();
        }
        for _ in 0..5 {
            clock.advance(Duration::minutes(6));
            guard.record_failed_attempt("bob").await.unwrap();
        }
        assert_eq!(
            guard.get_lockout_time("bob").await.unwrap(),
            Some(clock.now() + Duration::minutes(30))
        );
    }

    #[tokio::test]
    async fn test_elapsed_lockout_cleared_on_read() {
        let clock = ManualClock::starting_now();
        let guard = guard(&clock);
        for _ in 0..5 {
            guard.record_failed_attempt("carol").await.unwrap();
        }

        clock.advance(Duration::minutes(6));
        assert!(guard.get_lockout_time("carol").await.unwrap().is_none());
        assert!(!guard.is_locked_out("carol").await.unwrap());
        assert!(guard.attempts().is_empty());
        assert_eq!(guard.record_failed_attempt("carol").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reset_and_pending_logins() {
        let clock = ManualClock::starting_now();
        let guard = guard(&clock);

        guard.record_failed_attempt("dave").await.unwrap();
        guard.reset_failed_attempts("dave").await.unwrap();
        assert!(guard.attempts().get("dave").await.unwrap().is_none());

        guard.add_pending_login("dave", "user-4").await.unwrap();
        assert!(guard.has_pending_login("dave").await.unwrap());
        assert_eq!(
            guard.get_pending_login("dave").await.unwrap().as_deref(),
            Some("user-4")
        );
        assert!(guard.delete_pending_login("dave").await.unwrap());
        assert!(!guard.has_pending_login("dave").await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_stale_entries() {
        let clock = ManualClock::starting_now();
        let guard = guard(&clock)
            .with_max_age(Duration::minutes(15))
            .with_ladder(LockoutLadder::new(vec![(3, Duration::hours(2))]));

        guard.add_pending_login("abandoned", "user-1").await.unwrap();
        guard.record_failed_attempt("abandoned").await.unwrap();
        for _ in 0..3 {
            guard.record_failed_attempt("locked").await.unwrap();
        }

        clock.advance(Duration::minutes(20));
        guard.add_pending_login("fresh", "user-2").await.unwrap();

        let swept = guard.sweep_stale(clock.now()).await.unwrap();
        assert_eq!(swept.pending_logins, 1);
        // Two-hour lockout is still running
        assert_eq!(swept.attempt_records, 1);
        assert!(guard.is_locked_out("locked").await.unwrap());
        assert!(guard.has_pending_login("fresh").await.unwrap());

        guard.clear_all().await.unwrap();
        assert!(guard.attempts().is_empty());
        assert!(!guard.has_pending_login("fresh").await.unwrap());
    }
}
