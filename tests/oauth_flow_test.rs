//! OAuth state, mobile token exchange and provider linking end to end.

use pacekeeper::Clock;
use chrono::Duration;
use pacekeeper::oauth::compute_code_challenge;
use pacekeeper::session::{ClientType, NewSession};
use pacekeeper::store::{InMemoryLinkTokenStore, InMemoryOAuthStateStore, InMemorySessionStore};
use pacekeeper::{
    LinkTokenIssuer, ManualClock, NewOAuthState, OAuthStateManager, PacekeeperError,
    ReuseDetector, SessionManager, TokenExchange, TokenHasher,
};
use std::sync::Arc;

struct Harness {
    clock: ManualClock,
    sessions: Arc<SessionManager<InMemorySessionStore>>,
    states: Arc<OAuthStateManager<InMemoryOAuthStateStore>>,
    links: LinkTokenIssuer<InMemoryLinkTokenStore>,
}

fn harness() -> Harness {
    let clock = ManualClock::starting_now();
    let hasher = TokenHasher::new("oauth-flow-secret".to_string().into()).unwrap();
    let detector =
        ReuseDetector::new(InMemorySessionStore::new(), hasher).with_clock(clock.shared());
    Harness {
        sessions: Arc::new(SessionManager::new(Arc::new(detector))),
        states: Arc::new(
            OAuthStateManager::new(InMemoryOAuthStateStore::new()).with_clock(clock.shared()),
        ),
        links: LinkTokenIssuer::new(InMemoryLinkTokenStore::new()).with_clock(clock.shared()),
        clock,
    }
}

#[tokio::test]
async fn state_is_valid_until_used_or_expired() {
    let h = harness();

    let used = h
        .states
        .create(NewOAuthState::new(1, "nonce-a", ClientType::Web).redirect_path("/dashboard"))
        .await
        .unwrap();
    assert!(h.states.get_valid(&used).await.unwrap().is_some());
    h.states.mark_used(&used).await.unwrap();
    h.states.mark_used(&used).await.unwrap();
    assert!(h.states.get_valid(&used).await.unwrap().is_none());

    let expiring = h
        .states
        .create(NewOAuthState::new(1, "nonce-b", ClientType::Web))
        .await
        .unwrap();
    h.clock.advance(Duration::seconds(601));
    assert!(h.states.get_valid(&expiring).await.unwrap().is_none());

    // Unknown, used and expired all look the same
    assert!(h.states.get_valid("never-issued").await.unwrap().is_none());
}

#[tokio::test]
async fn mobile_sso_exchanges_tokens_once() {
    let h = harness();
    let exchange = TokenExchange::new(h.sessions.clone(), h.states.clone());

    let verifier = "mobile-app-verifier-0123456789-abcdefghijklmnop";
    let state_id = h
        .states
        .create(
            NewOAuthState::new(2, "nonce", ClientType::Mobile)
                .code_challenge(compute_code_challenge(verifier)),
        )
        .await
        .unwrap();

    // Provider redirects back
    let state = h.states.consume(&state_id).await.unwrap().expect("valid state");
    assert_eq!(state.nonce, "nonce");
    assert!(h.states.consume(&state_id).await.unwrap().is_none());

    let pending = h
        .sessions
        .create_session(NewSession::new("user-7", ClientType::Mobile).oauth_state_id(&state_id))
        .await
        .unwrap();

    let issued = exchange.exchange(&pending.session.id, verifier).await.unwrap();
    assert_eq!(issued.session.user_id, "user-7");
    assert!(h.states.get_valid(&state_id).await.unwrap().is_none());

    let replay = exchange
        .exchange(&pending.session.id, verifier)
        .await
        .unwrap_err();
    assert!(matches!(replay, PacekeeperError::Conflict(_)));
    assert_eq!(replay.http_status(), 409);

    // The callback's own tokens were replaced by the exchange
    assert!(h.sessions.refresh(&pending.refresh_token, None, None).await.is_err());
    assert!(h.sessions.refresh(&issued.refresh_token, None, None).await.is_ok());
}

#[tokio::test]
async fn logout_releases_bound_state() {
    let h = harness();
    let state_id = h
        .states
        .create(NewOAuthState::new(3, "n", ClientType::Mobile))
        .await
        .unwrap();
    let issued = h
        .sessions
        .create_session(NewSession::new("user-1", ClientType::Mobile).oauth_state_id(&state_id))
        .await
        .unwrap();

    let removed = h
        .sessions
        .logout(&issued.session.id, "user-1")
        .await
        .unwrap()
        .expect("session removed");
    assert!(h.states.release_session(&removed).await.unwrap());
    assert!(h.states.store().is_empty().await);
}

#[tokio::test]
async fn link_token_starts_link_mode_flow() {
    let h = harness();

    let (token, expires_at) = h.links.issue("user-5", 9, Some("192.0.2.10")).await.unwrap();
    assert_eq!(expires_at - h.clock.now(), Duration::seconds(60));

    let redeemed = h.links.redeem(&token, 9).await.unwrap();
    let state_id = h
        .states
        .create(NewOAuthState::new(redeemed.idp_id, "n", ClientType::Web).link_user(&redeemed.user_id))
        .await
        .unwrap();

    let state = h.states.consume(&state_id).await.unwrap().unwrap();
    assert!(state.is_link_mode());
    assert_eq!(state.user_id.as_deref(), Some("user-5"));

    // Single use
    assert!(h.links.redeem(&token, 9).await.is_err());
}

#[tokio::test]
async fn link_token_expires() {
    let h = harness();
    let (token, _) = h.links.issue("user-5", 9, None).await.unwrap();

    h.clock.advance(Duration::seconds(61));
    let err = h.links.redeem(&token, 9).await.unwrap_err();
    assert!(matches!(err, PacekeeperError::InvalidCredential));
    assert_eq!(h.links.sweep_expired(h.clock.now()).await.unwrap(), 1);
}
