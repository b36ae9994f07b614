//! Sessions, token families and refresh-token rotation.
//!
//! A login creates a [`Session`] whose id doubles as its token family id.
//! Every refresh supersedes the current refresh token, writes a
//! [`RotatedRefreshToken`] tombstone for it and bumps `rotation_count`.
//! Presenting a tombstoned token again is reuse: tolerated inside the grace
//! window, treated as theft after it.

#[cfg(feature = "http")]
mod cookie;
mod manager;
mod rotation;
mod store;

#[cfg(feature = "http")]
pub use cookie::RefreshCookie;
pub use manager::{IssuedSession, NewSession, SessionManager};
pub use rotation::{ReuseCheck, ReuseDetector};
pub use store::{FamilyPurge, SessionStore};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PacekeeperError;

/// Which kind of client a session or OAuth flow belongs to.
///
/// Web clients keep the refresh token in an httpOnly cookie. Mobile clients
/// receive tokens in the body of a one-time PKCE-protected exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    #[default]
    Web,
    Mobile,
}

impl ClientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Mobile => "mobile",
        }
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientType {
    type Err = PacekeeperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "web" => Ok(Self::Web),
            "mobile" => Ok(Self::Mobile),
            other => Err(PacekeeperError::bad_request(format!(
                "Invalid client type: {}",
                other
            ))),
        }
    }
}

/// What to do when a superseded refresh token comes back inside the grace
/// window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GraceReusePolicy {
    /// Reject the request without touching the family. The client is expected
    /// to use the pair it received from the winning request.
    #[default]
    Reject,
    /// Rotate the family's current session again and hand out a fresh pair.
    Reissue,
}

impl FromStr for GraceReusePolicy {
    type Err = PacekeeperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "reissue" => Ok(Self::Reissue),
            other => Err(PacekeeperError::config(format!(
                "Invalid grace policy: {} (expected reject or reissue)",
                other
            ))),
        }
    }
}

/// A login lineage's server-side record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    /// Constant across every rotation of this login.
    pub token_family_id: String,
    /// Keyed hash of the current refresh token.
    pub refresh_token_hash: String,
    pub csrf_token_hash: Option<String>,
    pub rotation_count: u32,
    pub client_type: ClientType,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_rotation_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub oauth_state_id: Option<String>,
    pub tokens_exchanged: bool,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Time since the last request that used this session.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_activity_at
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }
}

/// Partial update of a [`Session`].
///
/// Only fields set to `Some` are written. `oauth_state_id` is doubly optional
/// so a binding can be cleared explicitly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionUpdate {
    pub refresh_token_hash: Option<String>,
    pub csrf_token_hash: Option<String>,
    pub rotation_count: Option<u32>,
    pub last_rotation_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub oauth_state_id: Option<Option<String>>,
    pub tokens_exchanged: Option<bool>,
}

impl SessionUpdate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn refresh_token_hash(mut self, hash: impl Into<String>) -> Self {
        self.refresh_token_hash = Some(hash.into());
        self
    }

    #[must_use]
    pub fn csrf_token_hash(mut self, hash: impl Into<String>) -> Self {
        self.csrf_token_hash = Some(hash.into());
        self
    }

    #[must_use]
    pub fn rotation_count(mut self, count: u32) -> Self {
        self.rotation_count = Some(count);
        self
    }

    #[must_use]
    pub fn last_rotation_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_rotation_at = Some(at);
        self
    }

    #[must_use]
    pub fn last_activity_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_activity_at = Some(at);
        self
    }

    #[must_use]
    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    #[must_use]
    pub fn ip_address(mut self, ip: Option<String>) -> Self {
        self.ip_address = ip;
        self
    }

    #[must_use]
    pub fn user_agent(mut self, user_agent: Option<String>) -> Self {
        self.user_agent = user_agent;
        self
    }

    #[must_use]
    pub fn oauth_state_id(mut self, state_id: Option<String>) -> Self {
        self.oauth_state_id = Some(state_id);
        self
    }

    #[must_use]
    pub fn tokens_exchanged(mut self, exchanged: bool) -> Self {
        self.tokens_exchanged = Some(exchanged);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Write the present fields onto `session`.
    pub fn apply_to(&self, session: &mut Session) {
        if let Some(hash) = &self.refresh_token_hash {
            session.refresh_token_hash = hash.clone();
        }
        if let Some(hash) = &self.csrf_token_hash {
            session.csrf_token_hash = Some(hash.clone());
        }
        if let Some(count) = self.rotation_count {
            session.rotation_count = count;
        }
        if let Some(at) = self.last_rotation_at {
            session.last_rotation_at = Some(at);
        }
        if let Some(at) = self.last_activity_at {
            session.last_activity_at = at;
        }
        if let Some(at) = self.expires_at {
            session.expires_at = at;
        }
        if let Some(ip) = &self.ip_address {
            session.ip_address = Some(ip.clone());
        }
        if let Some(user_agent) = &self.user_agent {
            session.user_agent = Some(user_agent.clone());
        }
        if let Some(state_id) = &self.oauth_state_id {
            session.oauth_state_id = state_id.clone();
        }
        if let Some(exchanged) = self.tokens_exchanged {
            session.tokens_exchanged = exchanged;
        }
    }
}

/// Tombstone of a superseded refresh token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotatedRefreshToken {
    pub token_family_id: String,
    /// Keyed HMAC-SHA256 of the raw token. Unique.
    pub hashed_token: String,
    /// Rotation count of the session when this token was superseded.
    pub rotation_count: u32,
    pub rotated_at: DateTime<Utc>,
    /// End of the grace window.
    pub expires_at: DateTime<Utc>,
}

impl RotatedRefreshToken {
    pub fn new(
        hashed_token: impl Into<String>,
        token_family_id: impl Into<String>,
        rotation_count: u32,
        rotated_at: DateTime<Utc>,
        grace: Duration,
    ) -> Self {
        Self {
            token_family_id: token_family_id.into(),
            hashed_token: hashed_token.into(),
            rotation_count,
            rotated_at,
            expires_at: rotated_at + grace,
        }
    }

    /// Whether a replay at `now` falls inside the grace window.
    pub fn in_grace_period(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at
    }
}
