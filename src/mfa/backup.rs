//! One-time backup codes for account recovery.
//!
//! Codes are shown to the user once and only Argon2id hashes are kept. Every
//! regeneration replaces the whole set.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::{SharedClock, system_clock};
use crate::config::SecurityConfig;
use crate::crypto::PasswordHasher;
use crate::error::{PacekeeperError, Result};

// No 0, O, 1, I to avoid confusion
const CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LENGTH: usize = 8;
const GROUP_LENGTH: usize = 4;

pub const DEFAULT_BACKUP_CODE_COUNT: usize = 10;
pub const MAX_BACKUP_CODE_COUNT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MfaBackupCode {
    pub id: Uuid,
    pub user_id: String,
    pub code_hash: String,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl MfaBackupCode {
    pub fn new(user_id: impl Into<String>, code_hash: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            code_hash: code_hash.into(),
            used: false,
            used_at: None,
            created_at: now,
        }
    }
}

#[async_trait]
pub trait BackupCodeStore: Send + Sync {
    /// Swap the user's whole set in one step. Returns how many codes were
    /// replaced.
    async fn replace_codes(&self, user_id: &str, codes: Vec<MfaBackupCode>) -> Result<u64>;

    async fn list_codes(&self, user_id: &str) -> Result<Vec<MfaBackupCode>>;

    /// Compare-and-set on `used`; `true` only for the call that flipped it.
    async fn mark_used(&self, user_id: &str, code_id: Uuid, used_at: DateTime<Utc>) -> Result<bool>;

    async fn delete_all(&self, user_id: &str) -> Result<u64>;
}

/// Summary of a user's backup codes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupCodeStatus {
    pub has_codes: bool,
    pub total: usize,
    pub used: usize,
    pub unused: usize,
    pub created_at: Option<DateTime<Utc>>,
}

/// Generate one code in display form, e.g. `A3K9-7BDF`.
pub fn generate_code() -> String {
    let mut rng = rand::rngs::OsRng;
    let raw: String = (0..CODE_LENGTH)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    format!("{}-{}", &raw[..GROUP_LENGTH], &raw[GROUP_LENGTH..])
}

/// Canonical form of user input: trimmed, upper-cased, dash optional.
///
/// Returns `None` for input that cannot be a code.
pub fn normalize_code(input: &str) -> Option<String> {
    let compact: String = input
        .trim()
        .chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if compact.len() != CODE_LENGTH || !compact.bytes().all(|b| CHARSET.contains(&b)) {
        return None;
    }
    Some(format!("{}-{}", &compact[..GROUP_LENGTH], &compact[GROUP_LENGTH..]))
}

pub struct BackupCodeVault<S: BackupCodeStore> {
    store: S,
    hasher: PasswordHasher,
    count: usize,
    clock: SharedClock,
}

impl<S: BackupCodeStore> BackupCodeVault<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self {
            store,
            hasher: PasswordHasher::default(),
            count: DEFAULT_BACKUP_CODE_COUNT,
            clock: system_clock(),
        }
    }

    #[must_use]
    pub fn from_config(store: S, config: &SecurityConfig) -> Self {
        Self::new(store).with_count(config.backup_code_count)
    }

    #[must_use]
    pub fn with_hasher(mut self, hasher: PasswordHasher) -> Self {
        self.hasher = hasher;
        self
    }

    #[must_use]
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
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

    /// Replace the user's codes with a fresh set of the configured size.
    ///
    /// The returned plaintext is never retrievable again.
    pub async fn generate(&self, user_id: &str) -> Result<Vec<String>> {
        self.generate_with_count(user_id, self.count).await
    }

    pub async fn generate_with_count(&self, user_id: &str, count: usize) -> Result<Vec<String>> {
        if !(1..=MAX_BACKUP_CODE_COUNT).contains(&count) {
            return Err(PacekeeperError::bad_request(format!(
                "backup code count must be 1-{}",
                MAX_BACKUP_CODE_COUNT
            )));
        }

        let now = self.clock.now();
        let mut plaintext = Vec::with_capacity(count);
        let mut rows = Vec::with_capacity(count);
        for _ in 0..count {
            let code = generate_code();
            rows.push(MfaBackupCode::new(user_id, self.hasher.hash(&code)?, now));
            plaintext.push(code);
        }

        let replaced = self.store.replace_codes(user_id, rows).await?;
        tracing::info!(
            target: "pacekeeper.backup_codes.generated",
            user_id = %user_id,
            count = count,
            replaced = replaced,
            "Backup codes generated"
        );
        Ok(plaintext)
    }

    /// Check a code and burn it on success.
    ///
    /// Every unused hash is checked so the time taken does not reveal which
    /// code matched.
    pub async fn verify_and_consume(&self, user_id: &str, candidate: &str) -> Result<bool> {
        let Some(code) = normalize_code(candidate) else {
            return Ok(false);
        };

        let codes = self.store.list_codes(user_id).await?;
        let mut matched = None;
        for row in codes.iter().filter(|c| !c.used) {
            if self.hasher.verify(&code, &row.code_hash)? && matched.is_none() {
                matched = Some(row.id);
            }
        }

        let Some(code_id) = matched else {
            return Ok(false);
        };
        let consumed = self
            .store
            .mark_used(user_id, code_id, self.clock.now())
            .await?;
        if consumed {
            tracing::info!(
                target: "pacekeeper.backup_codes.used",
                user_id = %user_id,
                "Backup code used"
            );
        } else {
            tracing::warn!(
                target: "pacekeeper.backup_codes.replayed",
                user_id = %user_id,
                "Backup code consumed concurrently"
            );
        }
        Ok(consumed)
    }

    pub async fn status(&self, user_id: &str) -> Result<BackupCodeStatus> {
        let codes = self.store.list_codes(user_id).await?;
        let used = codes.iter().filter(|c| c.used).count();
        Ok(BackupCodeStatus {
            has_codes: !codes.is_empty(),
            total: codes.len(),
            used,
            unused: codes.len() - used,
            created_at: codes.iter().map(|c| c.created_at).min(),
        })
    }

    /// Remove all of the user's codes, e.g. when MFA is disabled.
    pub async fn revoke_all(&self, user_id: &str) -> Result<u64> {
        self.store.delete_all(user_id).await
    }
}
