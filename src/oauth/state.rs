//! Server-side OAuth/OIDC flow state.
//!
//! The state value sent to the identity provider is itself the primary key,
//! so it carries 256 bits of entropy. A row is good for one callback: the
//! `used` flag and the expiry are independent replay defenses.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::pkce::{self, PKCE_METHOD_S256};
use crate::clock::{SharedClock, system_clock};
use crate::config::SecurityConfig;
use crate::crypto::generate_secure_token;
use crate::error::{PacekeeperError, RejectionReason, Result};
use crate::session::{ClientType, Session, SessionStore};
use crate::utils::{expires_after, log_prefix, truncate_ip};

/// Default lifetime of an OAuth state, in seconds.
pub const DEFAULT_STATE_TTL_SECONDS: i64 = 600;

const MAX_NONCE_LENGTH: usize = 255;
const MAX_REDIRECT_PATH_LENGTH: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthState {
    pub id: String,
    pub idp_id: i64,
    /// Set when the flow links a provider to an already signed-in user.
    pub user_id: Option<String>,
    pub nonce: String,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub client_type: ClientType,
    pub redirect_path: Option<String>,
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

impl OAuthState {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_link_mode(&self) -> bool {
        self.user_id.is_some()
    }

    /// Why this state cannot be used at `now`, if it cannot.
    pub fn rejection(&self, now: DateTime<Utc>) -> Option<RejectionReason> {
        if self.is_expired(now) {
            Some(RejectionReason::Expired)
        } else if self.used {
            Some(RejectionReason::AlreadyUsed)
        } else {
            None
        }
    }
}

/// Parameters for [`OAuthStateManager::create`].
#[derive(Debug, Clone)]
pub struct NewOAuthState {
    pub idp_id: i64,
    pub nonce: String,
    pub client_type: ClientType,
    pub code_challenge: Option<String>,
    pub code_challenge_method: String,
    pub redirect_path: Option<String>,
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
}

impl NewOAuthState {
    pub fn new(idp_id: i64, nonce: impl Into<String>, client_type: ClientType) -> Self {
        Self {
            idp_id,
            nonce: nonce.into(),
            client_type,
            code_challenge: None,
            code_challenge_method: PKCE_METHOD_S256.to_string(),
            redirect_path: None,
            user_id: None,
            ip_address: None,
        }
    }

    #[must_use]
    pub fn code_challenge(mut self, challenge: impl Into<String>) -> Self {
        self.code_challenge = Some(challenge.into());
        self
    }

    #[must_use]
    pub fn code_challenge_method(mut self, method: impl Into<String>) -> Self {
        self.code_challenge_method = method.into();
        self
    }

    #[must_use]
    pub fn redirect_path(mut self, path: impl Into<String>) -> Self {
        self.redirect_path = Some(path.into());
        self
    }

    /// Link mode: the callback attaches the provider to this user.
    #[must_use]
    pub fn link_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn ip_address(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.nonce.is_empty() || self.nonce.len() > MAX_NONCE_LENGTH {
            return Err(PacekeeperError::bad_request(format!(
                "nonce must be 1-{} characters",
                MAX_NONCE_LENGTH
            )));
        }
        if let Some(challenge) = &self.code_challenge {
            pkce::validate_code_challenge(challenge, &self.code_challenge_method)?;
        }
        if let Some(path) = &self.redirect_path {
            // Relative paths only; "//host" would be an open redirect
            if !path.starts_with('/')
                || path.starts_with("//")
                || path.contains('\\')
                || path.len() > MAX_REDIRECT_PATH_LENGTH
            {
                return Err(PacekeeperError::bad_request(
                    "redirect_path must be a relative path",
                ));
            }
        }
        Ok(())
    }
}

/// Persistence for OAuth states.
#[async_trait]
pub trait OAuthStateStore: Send + Sync {
    /// Insert a new state. Fails with `Conflict` on a duplicate id.
    async fn insert(&self, state: &OAuthState) -> Result<()>;

    async fn get(&self, state_id: &str) -> Result<Option<OAuthState>>;

    /// Set `used` if it is still unset. Returns `true` only for the call that
    /// performed the transition.
    async fn mark_used(&self, state_id: &str) -> Result<bool>;

    async fn delete(&self, state_id: &str) -> Result<bool>;

    /// Delete states whose `expires_at` is before `now`.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Creates, validates and retires OAuth states.
///
/// # Example
///
/// ```rust,ignore
/// let state_id = states
///     .create(NewOAuthState::new(idp_id, nonce, ClientType::Web).code_challenge(challenge))
///     .await?;
/// // redirect to the provider with `state=state_id`
///
/// // at the callback
/// let Some(state) = states.consume(&returned_state).await? else {
///     return Err(PacekeeperError::InvalidCredential);
/// };
/// ```
pub struct OAuthStateManager<S: OAuthStateStore> {
    store: S,
    ttl: Duration,
    clock: SharedClock,
}

impl<S: OAuthStateStore> OAuthStateManager<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self {
            store,
            ttl: Duration::seconds(DEFAULT_STATE_TTL_SECONDS),
            clock: system_clock(),
        }
    }

    #[must_use]
    pub fn from_config(store: S, config: &SecurityConfig) -> Self {
        Self::new(store).with_ttl(config.oauth_state_ttl())
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
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

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Store a new state and return its id.
    pub async fn create(&self, new: NewOAuthState) -> Result<String> {
        new.validate()?;

        let now = self.clock.now();
        let has_pkce = new.code_challenge.is_some();
        let state = OAuthState {
            id: generate_secure_token(),
            idp_id: new.idp_id,
            user_id: new.user_id,
            nonce: new.nonce,
            code_challenge_method: new.code_challenge.as_ref().map(|_| new.code_challenge_method),
            code_challenge: new.code_challenge,
            client_type: new.client_type,
            redirect_path: new.redirect_path,
            ip_address: new.ip_address.as_deref().map(truncate_ip),
            created_at: now,
            expires_at: expires_after(now, self.ttl)?,
            used: false,
        };

        self.store.insert(&state).await?;

        tracing::info!(
            target: "pacekeeper.oauth_state.created",
            state = %log_prefix(&state.id),
            idp_id = state.idp_id,
            client_type = %state.client_type,
            pkce = has_pkce,
            link_mode = state.is_link_mode(),
            "OAuth state created"
        );
        Ok(state.id)
    }

    /// The state, if it exists, has not expired and has not been used.
    pub async fn get_valid(&self, state_id: &str) -> Result<Option<OAuthState>> {
        let state = self.store.get(state_id).await?;
        let reason = match &state {
            None => Some(RejectionReason::NotFound),
            Some(s) => s.rejection(self.clock.now()),
        };

        match reason {
            Some(reason) => {
                tracing::warn!(
                    target: "pacekeeper.oauth_state.rejected",
                    state = %log_prefix(state_id),
                    reason = reason.as_str(),
                    "OAuth state rejected"
                );
                Ok(None)
            }
            None => Ok(state),
        }
    }

    /// Mark a state used. Calling it again is a no-op.
    pub async fn mark_used(&self, state_id: &str) -> Result<()> {
        if self.store.mark_used(state_id).await? {
            tracing::debug!(
                target: "pacekeeper.oauth_state.used",
                state = %log_prefix(state_id),
                "OAuth state marked used"
            );
        }
        Ok(())
    }

    /// Validate and mark used in one step.
    ///
    /// Of two concurrent callbacks with the same state, exactly one gets the
    /// row back.
    pub async fn consume(&self, state_id: &str) -> Result<Option<OAuthState>> {
        let Some(mut state) = self.get_valid(state_id).await? else {
            return Ok(None);
        };
        if !self.store.mark_used(state_id).await? {
            tracing::warn!(
                target: "pacekeeper.oauth_state.rejected",
                state = %log_prefix(state_id),
                reason = RejectionReason::AlreadyUsed.as_str(),
                "OAuth state consumed concurrently"
            );
            return Ok(None);
        }
        state.used = true;
        Ok(Some(state))
    }

    pub async fn delete(&self, state_id: &str) -> Result<bool> {
        self.store.delete(state_id).await
    }

    /// Delete states past their expiry.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let deleted = self.store.delete_expired(now).await?;
        if deleted > 0 {
            tracing::info!(
                target: "pacekeeper.oauth_state.cleanup",
                deleted = deleted,
                "Deleted expired OAuth states"
            );
        }
        Ok(deleted)
    }

    /// The unexpired state bound to a session.
    ///
    /// The state has normally been consumed by the callback already, so
    /// `used` is not checked here.
    pub async fn get_by_session<SS: SessionStore>(
        &self,
        sessions: &SS,
        session_id: &str,
    ) -> Result<Option<OAuthState>> {
        let Some(session) = sessions.get_session(session_id).await? else {
            return Ok(None);
        };
        let Some(state_id) = session.oauth_state_id else {
            return Ok(None);
        };
        let Some(state) = self.store.get(&state_id).await? else {
            return Ok(None);
        };
        if state.is_expired(self.clock.now()) {
            tracing::warn!(
                target: "pacekeeper.oauth_state.rejected",
                state = %log_prefix(&state_id),
                reason = RejectionReason::Expired.as_str(),
                "Session-bound OAuth state expired"
            );
            return Ok(None);
        }
        Ok(Some(state))
    }

    /// Delete the state bound to a session that is going away.
    pub async fn release_session(&self, session: &Session) -> Result<bool> {
        match &session.oauth_state_id {
            Some(state_id) => self.store.delete(state_id).await,
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::store::{InMemoryOAuthStateStore, InMemorySessionStore};

    const CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

    fn manager(clock: &ManualClock) -> OAuthStateManager<InMemoryOAuthStateStore> {
        OAuthStateManager::new(InMemoryOAuthStateStore::new()).with_clock(clock.shared())
    }

    #[tokio::test]
    async fn test_create_and_get_valid() {
        let clock = ManualClock::starting_now();
        let states = manager(&clock);

        let id = states
            .create(
                NewOAuthState::new(7, "nonce-1", ClientType::Mobile)
                    .code_challenge(CHALLENGE)
                    .redirect_path("/settings")
                    .ip_address("198.51.100.4"),
            )
            .await
            .unwrap();
        assert_eq!(id.len(), 43);

        let state = states.get_valid(&id).await.unwrap().unwrap();
        assert_eq!(state.idp_id, 7);
        assert_eq!(state.nonce, "nonce-1");
        assert_eq!(state.code_challenge_method.as_deref(), Some("S256"));
        assert_eq!(state.expires_at - state.created_at, Duration::minutes(10));
        assert!(!state.used);
        assert!(!state.is_link_mode());
    }

    #[tokio::test]
    async fn test_mark_used_is_idempotent() {
        let clock = ManualClock::starting_now();
        let states = manager(&clock);
        let id = states
            .create(NewOAuthState::new(1, "n", ClientType::Web))
            .await
            .unwrap();

        states.mark_used(&id).await.unwrap();
        assert!(states.get_valid(&id).await.unwrap().is_none());
        states.mark_used(&id).await.unwrap();
        assert!(states.get_valid(&id).await.unwrap().is_none());

        // Unknown ids are fine too
        states.mark_used("missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_state_is_invalid() {
        let clock = ManualClock::starting_now();
        let states = manager(&clock);
        let id = states
            .create(NewOAuthState::new(1, "n", ClientType::Web))
            .await
            .unwrap();

        clock.advance(Duration::minutes(9));
        assert!(states.get_valid(&id).await.unwrap().is_some());
        clock.advance(Duration::minutes(2));
        assert!(states.get_valid(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_consume_exactly_once() {
        let clock = ManualClock::starting_now();
        let states = manager(&clock);
        let id = states
            .create(NewOAuthState::new(1, "n", ClientType::Web).link_user("user-9"))
            .await
            .unwrap();

        let consumed = states.consume(&id).await.unwrap().unwrap();
        assert!(consumed.used);
        assert_eq!(consumed.user_id.as_deref(), Some("user-9"));
        assert!(states.consume(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_validation() {
        let clock = ManualClock::starting_now();
        let states = manager(&clock);

        assert!(
            states
                .create(NewOAuthState::new(1, "", ClientType::Web))
                .await
                .is_err()
        );
        assert!(
            states
                .create(
                    NewOAuthState::new(1, "n", ClientType::Web)
                        .code_challenge(CHALLENGE)
                        .code_challenge_method("plain")
                )
                .await
                .is_err()
        );
        assert!(
            states
                .create(NewOAuthState::new(1, "n", ClientType::Web).redirect_path("//evil.example"))
                .await
                .is_err()
        );
        assert!(
            states
                .create(NewOAuthState::new(1, "n", ClientType::Web).redirect_path("https://evil.example"))
                .await
                .is_err()
        );
        assert!(states.store().is_empty().await);
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let clock = ManualClock::starting_now();
        let states = manager(&clock);
        states
            .create(NewOAuthState::new(1, "old", ClientType::Web))
            .await
            .unwrap();
        clock.advance(Duration::minutes(8));
        let fresh = states
            .create(NewOAuthState::new(1, "new", ClientType::Web))
            .await
            .unwrap();

        clock.advance(Duration::minutes(3));
        assert_eq!(states.sweep_expired(clock.now()).await.unwrap(), 1);
        assert!(states.get_valid(&fresh).await.unwrap().is_some());
        assert_eq!(states.sweep_expired(clock.now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_get_by_session_and_release() {
        use crate::crypto::TokenHasher;
        use crate::session::{NewSession, ReuseDetector, SessionManager};
        use secrecy::SecretString;
        use std::sync::Arc;

        let clock = ManualClock::starting_now();
        let states = manager(&clock);
        let hasher = TokenHasher::new(SecretString::from("k".to_string())).unwrap();
        let sessions = SessionManager::new(Arc::new(
            ReuseDetector::new(InMemorySessionStore::new(), hasher).with_clock(clock.shared()),
        ));

        let state_id = states
            .create(NewOAuthState::new(3, "n", ClientType::Mobile).code_challenge(CHALLENGE))
            .await
            .unwrap();
        states.consume(&state_id).await.unwrap().unwrap();

        let issued = sessions
            .create_session(NewSession::new("user-1", ClientType::Mobile).oauth_state_id(&state_id))
            .await
            .unwrap();

        let bound = states
            .get_by_session(sessions.store(), &issued.session.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bound.id, state_id);
        assert!(states.get_by_session(sessions.store(), "nope").await.unwrap().is_none());

        let removed = sessions
            .logout(&issued.session.id, "user-1")
            .await
            .unwrap()
            .unwrap();
        assert!(states.release_session(&removed).await.unwrap());
        assert!(states.store().is_empty().await);
    }
}
