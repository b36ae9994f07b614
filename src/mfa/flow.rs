//! Second step of a two-step login.
//!
//! `begin` runs after the password check succeeds and parks the login.
//! `verify` accepts a TOTP code or a backup code and, on success, hands back
//! the user id so the caller can create the session. No tokens exist before
//! that point.

use std::sync::Arc;

use super::backup::{BackupCodeStore, BackupCodeVault};
use super::lockout::{MfaAttemptStore, MfaLockoutGuard};
use super::pending::PendingLoginStore;
use super::totp::{TotpManager, TotpSecretStore};
use crate::error::{PacekeeperError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MfaMethod {
    Totp,
    BackupCode,
}

impl MfaMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Totp => "totp",
            Self::BackupCode => "backup_code",
        }
    }
}

/// A completed second factor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedMfa {
    pub user_id: String,
    pub method: MfaMethod,
}

fn looks_like_totp(code: &str) -> bool {
    let digits: Vec<char> = code.chars().filter(|c| !matches!(c, ' ' | '-')).collect();
    digits.len() == 6 && digits.iter().all(char::is_ascii_digit)
}

pub struct MfaLoginFlow<A, P, B, T>
where
    A: MfaAttemptStore,
    P: PendingLoginStore,
    B: BackupCodeStore,
    T: TotpSecretStore,
{
    guard: Arc<MfaLockoutGuard<A, P>>,
    backup_codes: Arc<BackupCodeVault<B>>,
    totp: TotpManager,
    secrets: T,
}

impl<A, P, B, T> MfaLoginFlow<A, P, B, T>
where
    A: MfaAttemptStore,
    P: PendingLoginStore,
    B: BackupCodeStore,
    T: TotpSecretStore,
{
    pub fn new(
        guard: Arc<MfaLockoutGuard<A, P>>,
        backup_codes: Arc<BackupCodeVault<B>>,
        totp: TotpManager,
        secrets: T,
    ) -> Self {
        Self {
            guard,
            backup_codes,
            totp,
            secrets,
        }
    }

    pub fn guard(&self) -> &Arc<MfaLockoutGuard<A, P>> {
        &self.guard
    }

    /// Park a password-verified login until the second factor arrives.
    pub async fn begin(&self, username: &str, user_id: &str) -> Result<()> {
        self.guard.add_pending_login(username, user_id).await?;
        tracing::debug!(
            target: "pacekeeper.mfa.pending",
            username = %username,
            "MFA login pending"
        );
        Ok(())
    }

    /// Check a second factor for a pending login.
    ///
    /// # Errors
    ///
    /// - `LockedOut` while the username is locked, whatever the code.
    /// - `BadRequest` when no login is pending for the username.
    /// - `InvalidCredential` for a wrong code; the failure is counted.
    pub async fn verify(&self, username: &str, code: &str) -> Result<VerifiedMfa> {
        if let Some(until) = self.guard.get_lockout_time(username).await? {
            tracing::warn!(
                target: "pacekeeper.mfa.locked",
                username = %username,
                until = %until,
                "MFA attempt while locked out"
            );
            return Err(PacekeeperError::LockedOut { until });
        }

        let Some(user_id) = self.guard.get_pending_login(username).await? else {
            return Err(PacekeeperError::bad_request("No pending MFA login"));
        };

        match self.check_code(&user_id, code).await? {
            Some(method) => {
                self.guard.reset_failed_attempts(username).await?;
                self.guard.delete_pending_login(username).await?;
                tracing::info!(
                    target: "pacekeeper.mfa.verified",
                    user_id = %user_id,
                    method = method.as_str(),
                    "MFA verified"
                );
                Ok(VerifiedMfa { user_id, method })
            }
            None => {
                let failed = self.guard.record_failed_attempt(username).await?;
                tracing::warn!(
                    target: "pacekeeper.mfa.failed",
                    username = %username,
                    failed_attempts = failed,
                    "Invalid MFA code"
                );
                Err(PacekeeperError::InvalidCredential)
            }
        }
    }

    async fn check_code(&self, user_id: &str, code: &str) -> Result<Option<MfaMethod>> {
        if looks_like_totp(code) {
            let Some(secret) = self.secrets.get_totp_secret(user_id).await? else {
                return Ok(None);
            };
            let ok = self.totp.verify(&secret, code)?;
            return Ok(ok.then_some(MfaMethod::Totp));
        }
        let ok = self.backup_codes.verify_and_consume(user_id, code).await?;
        Ok(ok.then_some(MfaMethod::BackupCode))
    }

    /// Abandon a pending login.
    pub async fn cancel(&self, username: &str) -> Result<bool> {
        self.guard.delete_pending_login(username).await
    }
}
