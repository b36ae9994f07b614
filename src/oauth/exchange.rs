//! PKCE-protected token exchange for sessions created by an OAuth callback.
//!
//! Mobile SSO cannot receive tokens on the redirect itself. The callback
//! creates the session bound to its OAuth state, hands the app the session
//! id, and the app trades it here together with its PKCE verifier. Works
//! exactly once per session.

use std::sync::Arc;

use super::pkce::{self, PKCE_METHOD_S256};
use super::state::{OAuthStateManager, OAuthStateStore};
use crate::crypto::generate_secure_token;
use crate::error::{PacekeeperError, Result};
use crate::session::{IssuedSession, SessionManager, SessionStore, SessionUpdate};
use crate::utils::log_prefix;

pub struct TokenExchange<SS: SessionStore, OS: OAuthStateStore> {
    sessions: Arc<SessionManager<SS>>,
    states: Arc<OAuthStateManager<OS>>,
}

impl<SS: SessionStore, OS: OAuthStateStore> TokenExchange<SS, OS> {
    pub fn new(sessions: Arc<SessionManager<SS>>, states: Arc<OAuthStateManager<OS>>) -> Self {
        Self { sessions, states }
    }

    /// Trade a session id and PKCE verifier for fresh tokens.
    ///
    /// # Errors
    ///
    /// - `InvalidCredential` if the session or its state is missing or
    ///   expired, or the verifier does not match.
    /// - `Conflict` if tokens were already exchanged for this session.
    /// - `BadRequest` if the state carries no PKCE challenge or the verifier
    ///   is malformed.
    pub async fn exchange(&self, session_id: &str, code_verifier: &str) -> Result<IssuedSession> {
        let store = self.sessions.store();
        let now = self.states.clock().now();

        let session = match store.get_session(session_id).await? {
            Some(s) if !s.is_expired(now) => s,
            _ => return Err(PacekeeperError::InvalidCredential),
        };

        if session.tokens_exchanged {
            tracing::warn!(
                target: "pacekeeper.exchange.replayed",
                session = %log_prefix(session_id),
                "Token exchange replayed"
            );
            return Err(PacekeeperError::conflict("Tokens already exchanged"));
        }

        let state = self
            .states
            .get_by_session(store, session_id)
            .await?
            .ok_or(PacekeeperError::InvalidCredential)?;

        let Some(challenge) = state.code_challenge.as_deref() else {
            return Err(PacekeeperError::bad_request(
                "PKCE is required for token exchange",
            ));
        };
        let method = state
            .code_challenge_method
            .as_deref()
            .unwrap_or(PKCE_METHOD_S256);

        if !pkce::verify_code_verifier(code_verifier, challenge, method)? {
            tracing::warn!(
                target: "pacekeeper.exchange.pkce_mismatch",
                session = %log_prefix(session_id),
                "PKCE verifier mismatch"
            );
            return Err(PacekeeperError::InvalidCredential);
        }

        let hasher = self.sessions.detector().hasher();
        let refresh_token = generate_secure_token();
        let csrf_token = generate_secure_token();
        let update = SessionUpdate::new()
            .refresh_token_hash(hasher.hash(&refresh_token)?)
            .csrf_token_hash(hasher.hash(&csrf_token)?)
            .last_activity_at(now)
            .oauth_state_id(None);

        // Exactly one concurrent caller gets past this point
        if !store.exchange_tokens(session_id, &update).await? {
            return Err(PacekeeperError::conflict("Tokens already exchanged"));
        }

        // The session no longer points at the state; a leftover row expires
        if let Err(e) = self.states.delete(&state.id).await {
            tracing::warn!(
                target: "pacekeeper.exchange.state_delete_failed",
                state = %log_prefix(&state.id),
                error = %e,
                "Failed to delete OAuth state after exchange"
            );
        }

        let mut session = session;
        update.apply_to(&mut session);
        session.tokens_exchanged = true;

        tracing::info!(
            target: "pacekeeper.exchange.completed",
            session_id = %session.id,
            user_id = %session.user_id,
            client_type = %session.client_type,
            "Tokens exchanged"
        );

        Ok(IssuedSession {
            session,
            refresh_token,
            csrf_token,
        })
    }
}
