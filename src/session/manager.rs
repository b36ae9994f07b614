//! Session lifecycle: login, refresh with rotation, logout and idle sweep.
//!
//! This module emits tracing events for security monitoring:
//! - `pacekeeper.session.created` - Session and token family created
//! - `pacekeeper.token.rotated` - Refresh token rotated
//! - `pacekeeper.token.invalid` - Unknown or expired refresh token presented
//! - `pacekeeper.token.grace_rejected` - Grace-window replay refused without penalty
//! - `pacekeeper.session.logout` - Session deleted by its owner
//! - `pacekeeper.session.idle_sweep` - Idle sessions swept

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::{ClientType, GraceReusePolicy, ReuseCheck, ReuseDetector, Session, SessionStore, SessionUpdate};
use crate::config::SecurityConfig;
use crate::crypto::generate_secure_token;
use crate::error::{PacekeeperError, Result};
use crate::utils::{MAX_USER_AGENT_LENGTH, expires_after, truncate_chars, truncate_ip};

/// Parameters for a new login session.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub user_id: String,
    pub client_type: ClientType,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub oauth_state_id: Option<String>,
}

impl NewSession {
    pub fn new(user_id: impl Into<String>, client_type: ClientType) -> Self {
        Self {
            user_id: user_id.into(),
            client_type,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn ip_address(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Bind the session to the OAuth state that produced it (mobile SSO).
    #[must_use]
    pub fn oauth_state_id(mut self, state_id: impl Into<String>) -> Self {
        self.oauth_state_id = Some(state_id.into());
        self
    }
}

/// A session together with the plaintext tokens minted for it.
///
/// The plaintext values are never stored; this is the only place they exist.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub session: Session,
    pub refresh_token: String,
    pub csrf_token: String,
}

/// Creates, refreshes and ends sessions.
///
/// Refresh order: reuse check first, then the current-token lookup, then
/// expiry and timeout checks, then the atomic tombstone-and-rotate write.
pub struct SessionManager<S: SessionStore> {
    detector: Arc<ReuseDetector<S>>,
    refresh_token_ttl: Duration,
    idle_timeout: Option<Duration>,
    absolute_timeout: Option<Duration>,
    grace_policy: GraceReusePolicy,
}

impl<S: SessionStore> SessionManager<S> {
    #[must_use]
    pub fn new(detector: Arc<ReuseDetector<S>>) -> Self {
        let defaults = SecurityConfig::default();
        Self {
            detector,
            refresh_token_ttl: defaults.refresh_token_ttl(),
            idle_timeout: None,
            absolute_timeout: None,
            grace_policy: GraceReusePolicy::default(),
        }
    }

    /// Take TTLs, timeouts and the grace policy from config.
    #[must_use]
    pub fn from_config(detector: Arc<ReuseDetector<S>>, config: &SecurityConfig) -> Self {
        Self {
            detector,
            refresh_token_ttl: config.refresh_token_ttl(),
            idle_timeout: config.session_idle_timeout(),
            absolute_timeout: config.session_absolute_timeout(),
            grace_policy: config.grace_policy,
        }
    }

    #[must_use]
    pub fn with_refresh_token_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_token_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_absolute_timeout(mut self, timeout: Duration) -> Self {
        self.absolute_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_grace_policy(mut self, policy: GraceReusePolicy) -> Self {
        self.grace_policy = policy;
        self
    }

    pub fn detector(&self) -> &Arc<ReuseDetector<S>> {
        &self.detector
    }

    pub fn store(&self) -> &S {
        self.detector.store()
    }

    pub fn grace_policy(&self) -> GraceReusePolicy {
        self.grace_policy
    }

    fn now(&self) -> DateTime<Utc> {
        self.detector.clock().now()
    }

    /// Start a new login lineage.
    ///
    /// The session id is also the token family id; `rotation_count` starts at 0.
    pub async fn create_session(&self, new: NewSession) -> Result<IssuedSession> {
        let now = self.now();
        let hasher = self.detector.hasher();
        let id = Uuid::new_v4().to_string();
        let refresh_token = generate_secure_token();
        let csrf_token = generate_secure_token();

        let session = Session {
            id: id.clone(),
            user_id: new.user_id,
            token_family_id: id,
            refresh_token_hash: hasher.hash(&refresh_token)?,
            csrf_token_hash: Some(hasher.hash(&csrf_token)?),
            rotation_count: 0,
            client_type: new.client_type,
            ip_address: new.ip_address.as_deref().map(truncate_ip),
            user_agent: new
                .user_agent
                .as_deref()
                .map(|ua| truncate_chars(ua, MAX_USER_AGENT_LENGTH)),
            created_at: now,
            last_rotation_at: None,
            last_activity_at: now,
            expires_at: expires_after(now, self.refresh_token_ttl)?,
            oauth_state_id: new.oauth_state_id,
            tokens_exchanged: false,
        };

        self.store().create_session(&session).await?;

        tracing::info!(
            target: "pacekeeper.session.created",
            session_id = %session.id,
            user_id = %session.user_id,
            client_type = %session.client_type,
            "Session created"
        );

        Ok(IssuedSession {
            session,
            refresh_token,
            csrf_token,
        })
    }

    /// Exchange a refresh token for a new one.
    ///
    /// # Errors
    ///
    /// - `TokenTheft` when a superseded token is replayed after the grace
    ///   window. The whole family has been deleted by the time this returns.
    /// - `ReuseInGrace` when a superseded token is replayed inside the window
    ///   under [`GraceReusePolicy::Reject`], or a concurrent refresh won.
    /// - `InvalidCredential` for unknown tokens and for sessions that are
    ///   expired, idle or past their absolute lifetime.
    pub async fn refresh(
        &self,
        raw_token: &str,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<IssuedSession> {
        let hashed = self.detector.hasher().hash(raw_token)?;

        let session = match self.detector.check_hashed(&hashed).await? {
            ReuseCheck::Theft(tombstone) => {
                let family_id = tombstone.token_family_id;
                let sessions_invalidated = self.detector.invalidate_token_family(&family_id).await?;
                return Err(PacekeeperError::TokenTheft {
                    family_id,
                    sessions_invalidated,
                });
            }
            ReuseCheck::WithinGrace(tombstone) => match self.grace_policy {
                GraceReusePolicy::Reject => {
                    tracing::warn!(
                        target: "pacekeeper.token.grace_rejected",
                        family_id = %tombstone.token_family_id,
                        "Superseded refresh token refused without penalty"
                    );
                    return Err(PacekeeperError::ReuseInGrace {
                        family_id: tombstone.token_family_id,
                    });
                }
                GraceReusePolicy::Reissue => self
                    .store()
                    .find_session_by_family(&tombstone.token_family_id)
                    .await?
                    .ok_or(PacekeeperError::InvalidCredential)?,
            },
            ReuseCheck::Fresh => match self.store().find_session_by_token_hash(&hashed).await? {
                Some(session) => session,
                None => {
                    tracing::debug!(
                        target: "pacekeeper.token.invalid",
                        "Unknown refresh token presented"
                    );
                    return Err(PacekeeperError::InvalidCredential);
                }
            },
        };

        self.ensure_usable(&session)?;
        self.rotate(session, ip_address, user_agent).await
    }

    fn ensure_usable(&self, session: &Session) -> Result<()> {
        let now = self.now();
        let reason = if session.is_expired(now) {
            Some("expired")
        } else if self
            .idle_timeout
            .is_some_and(|limit| session.idle_for(now) > limit)
        {
            Some("idle_timeout")
        } else if self
            .absolute_timeout
            .is_some_and(|limit| session.age(now) > limit)
        {
            Some("absolute_timeout")
        } else {
            None
        };

        match reason {
            Some(reason) => {
                tracing::info!(
                    target: "pacekeeper.token.invalid",
                    session_id = %session.id,
                    reason = reason,
                    "Refresh refused for unusable session"
                );
                Err(PacekeeperError::InvalidCredential)
            }
            None => Ok(()),
        }
    }

    async fn rotate(
        &self,
        session: Session,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<IssuedSession> {
        let now = self.now();
        let hasher = self.detector.hasher();
        let refresh_token = generate_secure_token();
        let csrf_token = generate_secure_token();
        let next_count = session.rotation_count.saturating_add(1);

        let superseded = self.detector.tombstone_for(
            session.refresh_token_hash.clone(),
            session.token_family_id.clone(),
            session.rotation_count,
        );
        let update = SessionUpdate::new()
            .refresh_token_hash(hasher.hash(&refresh_token)?)
            .csrf_token_hash(hasher.hash(&csrf_token)?)
            .rotation_count(next_count)
            .last_rotation_at(now)
            .last_activity_at(now)
            .expires_at(expires_after(now, self.refresh_token_ttl)?)
            .ip_address(ip_address.map(truncate_ip))
            .user_agent(user_agent.map(|ua| truncate_chars(ua, MAX_USER_AGENT_LENGTH)));

        let rotated = self
            .store()
            .rotate_session(&session.id, session.rotation_count, &superseded, &update)
            .await?;
        if !rotated {
            tracing::warn!(
                target: "pacekeeper.token.grace_rejected",
                session_id = %session.id,
                family_id = %session.token_family_id,
                "Concurrent refresh lost the rotation race"
            );
            return Err(PacekeeperError::ReuseInGrace {
                family_id: session.token_family_id,
            });
        }

        let mut session = session;
        update.apply_to(&mut session);

        tracing::info!(
            target: "pacekeeper.token.rotated",
            session_id = %session.id,
            user_id = %session.user_id,
            family_id = %session.token_family_id,
            rotation_count = session.rotation_count,
            "Refresh token rotated"
        );

        Ok(IssuedSession {
            session,
            refresh_token,
            csrf_token,
        })
    }

    /// Check a CSRF token against the session's current hash.
    pub fn verify_csrf(&self, session: &Session, csrf_token: &str) -> Result<bool> {
        match &session.csrf_token_hash {
            Some(hash) => self.detector.hasher().verify(csrf_token, hash),
            None => Ok(false),
        }
    }

    /// End a session. Its family's tombstones go with it.
    ///
    /// Returns the removed session so a bound OAuth state can be released
    /// with [`OAuthStateManager::release_session`](crate::oauth::OAuthStateManager::release_session).
    pub async fn logout(&self, session_id: &str, user_id: &str) -> Result<Option<Session>> {
        let removed = self.store().delete_session(session_id, user_id).await?;
        if removed.is_some() {
            tracing::info!(
                target: "pacekeeper.session.logout",
                session_id = %session_id,
                user_id = %user_id,
                "Session deleted"
            );
        }
        Ok(removed)
    }

    pub async fn list_sessions(&self, user_id: &str) -> Result<Vec<Session>> {
        self.store().list_sessions(user_id).await
    }

    /// Delete sessions with no activity since `cutoff`.
    pub async fn sweep_idle_sessions(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let deleted = self.store().delete_idle_sessions(cutoff).await?;
        if deleted > 0 {
            tracing::info!(
                target: "pacekeeper.session.idle_sweep",
                deleted = deleted,
                cutoff = %cutoff,
                "Idle sessions deleted"
            );
        }
        Ok(deleted)
    }

    /// Sweep using the configured idle timeout. Does nothing without one.
    pub async fn sweep_idle(&self) -> Result<u64> {
        match self.idle_timeout {
            Some(limit) => self.sweep_idle_sessions(self.now() - limit).await,
            None => Ok(0),
        }
    }
}
