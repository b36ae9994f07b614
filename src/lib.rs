//! Pacekeeper - session and token security for Rust services
//!
//! Pacekeeper holds the security-critical state behind a login system and
//! leaves persistence to the host through async store traits.
//!
//! # Features
//!
//! - **Refresh rotation**: every refresh mints a new token; replaying an old
//!   one after the grace window revokes the whole token family
//! - **OAuth/OIDC state**: single-use, expiring states with PKCE (S256) and
//!   a one-shot token exchange for mobile SSO
//! - **MFA**: progressive lockout, pending two-step logins, TOTP, and
//!   Argon2id-hashed backup codes
//! - **Link tokens**: 60-second tokens for attaching another identity provider
//! - **Maintenance**: sweep jobs for everything that expires
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pacekeeper::{ConfigBuilder, NewSession, ReuseDetector, SessionManager, TokenHasher};
//! use pacekeeper::session::ClientType;
//! use pacekeeper::store::InMemorySessionStore;
//!
//! # async fn run() -> pacekeeper::Result<()> {
//! let config = ConfigBuilder::new().from_env().build()?;
//! pacekeeper::init_tracing_with_config(&config);
//!
//! let hasher = TokenHasher::from_config(&config.security)?;
//! let detector = ReuseDetector::new(InMemorySessionStore::new(), hasher)
//!     .with_grace_period(config.security.reuse_grace());
//! let sessions = SessionManager::from_config(Arc::new(detector), &config.security);
//!
//! let issued = sessions.create_session(NewSession::new("user-1", ClientType::Web)).await?;
//! let rotated = sessions.refresh(&issued.refresh_token, None, None).await?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
mod config;
pub mod crypto;
mod error;
pub mod link;
pub mod maintenance;
pub mod mfa;
pub mod oauth;
pub mod session;
pub mod store;
mod utils;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    Config, ConfigBuilder, LoggingConfig, MAX_DURATION_SECONDS, MIN_SECRET_KEY_LENGTH, SecurityConfig,
};
pub use crypto::{PasswordHasher, TokenHasher};
pub use error::{PacekeeperError, RejectionReason, Result};
pub use link::{IdpLinkToken, LinkTokenIssuer, LinkTokenStore};
pub use maintenance::{MaintenanceRunner, SweepJob};
pub use mfa::{BackupCodeVault, MfaLockoutGuard, MfaLoginFlow};
pub use oauth::{NewOAuthState, OAuthState, OAuthStateManager, OAuthStateStore, TokenExchange};
pub use session::{
    ClientType, GraceReusePolicy, IssuedSession, NewSession, ReuseCheck, ReuseDetector, Session,
    SessionManager, SessionStore,
};

#[cfg(feature = "http")]
pub use error::ErrorResponse;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing with sensible defaults
///
/// Honours `RUST_LOG`; set `PACEKEEPER_LOG_JSON=true` for JSON output.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = utils::get_env_with_prefix("LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialize tracing from a loaded [`Config`]
pub fn init_tracing_with_config(config: &Config) {
    let env_filter = EnvFilter::new(&config.logging.level);

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
