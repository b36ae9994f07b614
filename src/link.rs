//! Identity-provider link tokens.
//!
//! A signed-in user who wants to attach another IdP has to leave the app for
//! the provider. The link token carries their identity across that redirect:
//! 256 bits, one use, gone after a minute.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{SharedClock, system_clock};
use crate::config::SecurityConfig;
use crate::crypto::generate_secure_token;
use crate::error::{PacekeeperError, RejectionReason, Result};
use crate::utils::{expires_after, log_prefix, truncate_ip};

pub const DEFAULT_LINK_TOKEN_TTL_SECONDS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdpLinkToken {
    pub id: String,
    pub user_id: String,
    pub idp_id: i64,
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

impl IdpLinkToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[async_trait]
pub trait LinkTokenStore: Send + Sync {
    async fn insert(&self, token: &IdpLinkToken) -> Result<()>;

    async fn get(&self, token_id: &str) -> Result<Option<IdpLinkToken>>;

    /// Compare-and-set on `used`; `true` only for the call that flipped it.
    async fn mark_used(&self, token_id: &str) -> Result<bool>;

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

pub struct LinkTokenIssuer<S: LinkTokenStore> {
    store: S,
    ttl: Duration,
    clock: SharedClock,
}

impl<S: LinkTokenStore> LinkTokenIssuer<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self {
            store,
            ttl: Duration::seconds(DEFAULT_LINK_TOKEN_TTL_SECONDS),
            clock: system_clock(),
        }
    }

    #[must_use]
    pub fn from_config(store: S, config: &SecurityConfig) -> Self {
        Self::new(store).with_ttl(config.link_token_ttl())
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

    /// Mint a link token for an authenticated user.
    pub async fn issue(
        &self,
        user_id: &str,
        idp_id: i64,
        ip_address: Option<&str>,
    ) -> Result<(String, DateTime<Utc>)> {
        let now = self.clock.now();
        let token = IdpLinkToken {
            id: generate_secure_token(),
            user_id: user_id.to_string(),
            idp_id,
            ip_address: ip_address.map(truncate_ip),
            created_at: now,
            expires_at: expires_after(now, self.ttl)?,
            used: false,
        };
        self.store.insert(&token).await?;

        tracing::info!(
            target: "pacekeeper.link_token.issued",
            token = %log_prefix(&token.id),
            user_id = %user_id,
            idp_id = idp_id,
            "Link token issued"
        );
        Ok((token.id, token.expires_at))
    }

    /// The token if it exists, has not expired and has not been used.
    pub async fn validate(&self, token_id: &str) -> Result<Option<IdpLinkToken>> {
        let token = self.store.get(token_id).await?;
        let now = self.clock.now();
        let reason = match &token {
            None => Some(RejectionReason::NotFound),
            Some(t) if t.is_expired(now) => Some(RejectionReason::Expired),
            Some(t) if t.used => Some(RejectionReason::AlreadyUsed),
            Some(_) => None,
        };

        if let Some(reason) = reason {
            tracing::warn!(
                target: "pacekeeper.link_token.rejected",
                token = %log_prefix(token_id),
                reason = reason.as_str(),
                "Link token rejected"
            );
            return Ok(None);
        }
        Ok(token)
    }

    /// Mark the token used. Returns `false` if it was already used or is unknown.
    pub async fn consume(&self, token_id: &str) -> Result<bool> {
        let consumed = self.store.mark_used(token_id).await?;
        if consumed {
            tracing::debug!(
                target: "pacekeeper.link_token.used",
                token = %log_prefix(token_id),
                "Link token marked used"
            );
        }
        Ok(consumed)
    }

    /// Validate, check the provider matches, and consume.
    ///
    /// The caller then starts a link-mode OAuth flow for the returned
    /// token's `user_id`.
    pub async fn redeem(&self, token_id: &str, idp_id: i64) -> Result<IdpLinkToken> {
        let Some(mut token) = self.validate(token_id).await? else {
            return Err(PacekeeperError::InvalidCredential);
        };
        if token.idp_id != idp_id {
            tracing::warn!(
                target: "pacekeeper.link_token.rejected",
                token = %log_prefix(token_id),
                reason = "idp_mismatch",
                "Link token presented for a different provider"
            );
            return Err(PacekeeperError::InvalidCredential);
        }
        if !self.consume(token_id).await? {
            return Err(PacekeeperError::InvalidCredential);
        }
        token.used = true;
        Ok(token)
    }

    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let deleted = self.store.delete_expired(now).await?;
        if deleted > 0 {
            tracing::info!(
                target: "pacekeeper.link_token.cleanup",
                deleted = deleted,
                "Deleted expired link tokens"
            );
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::store::InMemoryLinkTokenStore;

    fn issuer(clock: &ManualClock) -> LinkTokenIssuer<InMemoryLinkTokenStore> {
        LinkTokenIssuer::new(InMemoryLinkTokenStore::new()).with_clock(clock.shared())
    }

    #[tokio::test]
    async fn test_issue_and_validate() {
        let clock = ManualClock::starting_now();
        let issuer = issuer(&clock);

        let (token, expires_at) = issuer.issue("user-1", 4, Some("10.1.2.3")).await.unwrap();
        assert_eq!(expires_at, clock.now() + Duration::seconds(60));

        let found = issuer.validate(&token).await.unwrap().unwrap();
        assert_eq!(found.user_id, "user-1");
        assert_eq!(found.idp_id, 4);
        assert_eq!(found.ip_address.as_deref(), Some("10.1.2.3"));
    }

    #[tokio::test]
    async fn test_token_expires_after_a_minute() {
        let clock = ManualClock::starting_now();
        let issuer = issuer(&clock);
        let (token, _) = issuer.issue("user-1", 4, None).await.unwrap();

        clock.advance(Duration::seconds(61));
        assert!(issuer.validate(&token).await.unwrap().is_none());
        assert!(issuer.redeem(&token, 4).await.is_err());
    }

    #[tokio::test]
    async fn test_redeem_once() {
        let clock = ManualClock::starting_now();
        let issuer = issuer(&clock);
        let (token, _) = issuer.issue("user-1", 4, None).await.unwrap();

        let redeemed = issuer.redeem(&token, 4).await.unwrap();
        assert!(redeemed.used);
        assert_eq!(redeemed.user_id, "user-1");

        let err = issuer.redeem(&token, 4).await.unwrap_err();
        assert!(matches!(err, PacekeeperError::InvalidCredential));
    }

    #[tokio::test]
    async fn test_redeem_wrong_provider_does_not_consume() {
        let clock = ManualClock::starting_now();
        let issuer = issuer(&clock);
        let (token, _) = issuer.issue("user-1", 4, None).await.unwrap();

        assert!(issuer.redeem(&token, 5).await.is_err());
        assert!(issuer.validate(&token).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_consume_and_sweep() {
        let clock = ManualClock::starting_now();
        let issuer = issuer(&clock);
        let (token, _) = issuer.issue("user-1", 4, None).await.unwrap();

        assert!(issuer.consume(&token).await.unwrap());
        assert!(!issuer.consume(&token).await.unwrap());
        assert!(!issuer.consume("unknown").await.unwrap());

        clock.advance(Duration::minutes(2));
        assert_eq!(issuer.sweep_expired(clock.now()).await.unwrap(), 1);
        assert!(issuer.store().is_empty().await);
    }
}
