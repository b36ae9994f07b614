//! Multi-factor authentication.
//!
//! Lockout bookkeeping, pending two-step logins, TOTP, and one-time backup
//! codes, tied together by [`MfaLoginFlow`].
//!
//! # Example
//!
//! ```rust,ignore
//! use pacekeeper::mfa::{MfaLoginFlow, MfaLockoutGuard, BackupCodeVault, TotpManager, TotpConfig};
//!
//! let flow = MfaLoginFlow::new(
//!     Arc::new(MfaLockoutGuard::in_memory()),
//!     Arc::new(BackupCodeVault::new(backup_store)),
//!     TotpManager::new(TotpConfig::new("MyApp")),
//!     totp_secrets,
//! );
//!
//! // after the password check
//! flow.begin(&username, &user_id).await?;
//!
//! // second request
//! let verified = flow.verify(&username, &code).await?;
//! let issued = sessions.create_session(NewSession::new(verified.user_id, client_type)).await?;
//! ```

mod backup;
mod flow;
mod lockout;
mod pending;
mod totp;

pub use backup::{
    BackupCodeStatus, BackupCodeStore, BackupCodeVault, DEFAULT_BACKUP_CODE_COUNT,
    MAX_BACKUP_CODE_COUNT, MfaBackupCode, generate_code, normalize_code,
};
pub use flow::{MfaLoginFlow, MfaMethod, VerifiedMfa};
pub use lockout::{
    AttemptRecord, InMemoryAttemptStore, LockoutLadder, MfaAttemptStore, MfaLockoutGuard,
    StaleSweep,
};
pub use pending::{InMemoryPendingLoginStore, PendingLogin, PendingLoginStore};
pub use totp::{TotpConfig, TotpManager, TotpSecretStore, TotpSetup};
