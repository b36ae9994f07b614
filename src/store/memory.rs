//! In-memory store implementations.
//!
//! Suitable for tests and single-process deployments. Data is lost on restart
//! and not shared across instances. Every method takes the write lock for its
//! whole body, which gives the per-call atomicity the store traits require.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{PacekeeperError, Result};
use crate::link::{IdpLinkToken, LinkTokenStore};
use crate::mfa::{BackupCodeStore, MfaBackupCode, TotpSecretStore};
use crate::oauth::{OAuthState, OAuthStateStore};
use crate::session::{FamilyPurge, RotatedRefreshToken, Session, SessionStore, SessionUpdate};

#[derive(Default)]
struct SessionTables {
    sessions: HashMap<String, Session>,
    /// Keyed by `hashed_token`.
    rotated: HashMap<String, RotatedRefreshToken>,
}

impl SessionTables {
    fn remove_family_tombstones(&mut self, family_id: &str) -> u64 {
        let before = self.rotated.len();
        self.rotated.retain(|_, t| t.token_family_id != family_id);
        (before - self.rotated.len()) as u64
    }
}

/// In-memory [`SessionStore`].
#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    tables: Arc<RwLock<SessionTables>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions.
    pub async fn session_count(&self) -> usize {
        self.tables.read().await.sessions.len()
    }

    /// Number of stored tombstones.
    pub async fn rotated_token_count(&self) -> usize {
        self.tables.read().await.rotated.len()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(&self, session: &Session) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.sessions.contains_key(&session.id) {
            return Err(PacekeeperError::conflict("Session id already exists"));
        }
        if tables
            .sessions
            .values()
            .any(|s| s.token_family_id == session.token_family_id)
        {
            return Err(PacekeeperError::conflict("Token family already exists"));
        }
        tables.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self.tables.read().await.sessions.get(session_id).cloned())
    }

    async fn find_session_by_token_hash(
        &self,
        refresh_token_hash: &str,
    ) -> Result<Option<Session>> {
        let tables = self.tables.read().await;
        Ok(tables
            .sessions
            .values()
            .find(|s| s.refresh_token_hash == refresh_token_hash)
            .cloned())
    }

    async fn find_session_by_family(&self, family_id: &str) -> Result<Option<Session>> {
        let tables = self.tables.read().await;
        Ok(tables
            .sessions
            .values()
            .find(|s| s.token_family_id == family_id)
            .cloned())
    }

    async fn list_sessions(&self, user_id: &str) -> Result<Vec<Session>> {
        let tables = self.tables.read().await;
        let mut sessions: Vec<Session> = tables
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(sessions)
    }

    async fn update_session(&self, session_id: &str, update: &SessionUpdate) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.sessions.get_mut(session_id) {
            Some(session) => {
                update.apply_to(session);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn exchange_tokens(&self, session_id: &str, update: &SessionUpdate) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.sessions.get_mut(session_id) {
            Some(session) if !session.tokens_exchanged => {
                update.apply_to(session);
                session.tokens_exchanged = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn rotate_session(
        &self,
        session_id: &str,
        expected_rotation_count: u32,
        superseded: &RotatedRefreshToken,
        update: &SessionUpdate,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;

        let current = match tables.sessions.get(session_id) {
            Some(s) => s.rotation_count,
            None => return Ok(false),
        };
        if current != expected_rotation_count {
            return Ok(false);
        }
        if tables.rotated.contains_key(&superseded.hashed_token) {
            return Err(PacekeeperError::conflict("Rotated token hash already exists"));
        }

        tables
            .rotated
            .insert(superseded.hashed_token.clone(), superseded.clone());
        if let Some(session) = tables.sessions.get_mut(session_id) {
            update.apply_to(session);
        }
        Ok(true)
    }

    async fn delete_session(&self, session_id: &str, user_id: &str) -> Result<Option<Session>> {
        let mut tables = self.tables.write().await;
        let owned = tables
            .sessions
            .get(session_id)
            .is_some_and(|s| s.user_id == user_id);
        if !owned {
            return Ok(None);
        }
        let removed = tables.sessions.remove(session_id);
        if let Some(session) = &removed {
            tables.remove_family_tombstones(&session.token_family_id);
        }
        Ok(removed)
    }

    async fn delete_idle_sessions(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let idle_families: Vec<String> = tables
            .sessions
            .values()
            .filter(|s| s.last_activity_at < cutoff)
            .map(|s| s.token_family_id.clone())
            .collect();

        tables.sessions.retain(|_, s| s.last_activity_at >= cutoff);
        for family in &idle_families {
            tables.remove_family_tombstones(family);
        }
        Ok(idle_families.len() as u64)
    }

    async fn find_rotated_token(&self, hashed_token: &str) -> Result<Option<RotatedRefreshToken>> {
        Ok(self.tables.read().await.rotated.get(hashed_token).cloned())
    }

    async fn insert_rotated_token(&self, token: &RotatedRefreshToken) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.rotated.contains_key(&token.hashed_token) {
            return Err(PacekeeperError::conflict("Rotated token hash already exists"));
        }
        tables
            .rotated
            .insert(token.hashed_token.clone(), token.clone());
        Ok(())
    }

    async fn list_rotated_tokens(&self, family_id: &str) -> Result<Vec<RotatedRefreshToken>> {
        let tables = self.tables.read().await;
        let mut tokens: Vec<RotatedRefreshToken> = tables
            .rotated
            .values()
            .filter(|t| t.token_family_id == family_id)
            .cloned()
            .collect();
        tokens.sort_by_key(|t| t.rotation_count);
        Ok(tokens)
    }

    async fn delete_family(&self, family_id: &str) -> Result<FamilyPurge> {
        let mut tables = self.tables.write().await;
        let before = tables.sessions.len();
        tables.sessions.retain(|_, s| s.token_family_id != family_id);
        let sessions = (before - tables.sessions.len()) as u64;
        let rotated_tokens = tables.remove_family_tombstones(family_id);
        Ok(FamilyPurge {
            sessions,
            rotated_tokens,
        })
    }

    async fn delete_expired_rotated_tokens(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let before = tables.rotated.len();
        tables.rotated.retain(|_, t| t.expires_at >= now);
        Ok((before - tables.rotated.len()) as u64)
    }
}

/// In-memory [`OAuthStateStore`].
#[derive(Clone, Default)]
pub struct InMemoryOAuthStateStore {
    states: Arc<RwLock<HashMap<String, OAuthState>>>,
}

impl InMemoryOAuthStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.states.read().await.is_empty()
    }
}

#[async_trait]
impl OAuthStateStore for InMemoryOAuthStateStore {
    async fn insert(&self, state: &OAuthState) -> Result<()> {
        let mut states = self.states.write().await;
        if states.contains_key(&state.id) {
            return Err(PacekeeperError::conflict("OAuth state already exists"));
        }
        states.insert(state.id.clone(), state.clone());
        Ok(())
    }

    async fn get(&self, state_id: &str) -> Result<Option<OAuthState>> {
        Ok(self.states.read().await.get(state_id).cloned())
    }

    async fn mark_used(&self, state_id: &str) -> Result<bool> {
        let mut states = self.states.write().await;
        match states.get_mut(state_id) {
            Some(state) if !state.used => {
                state.used = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, state_id: &str) -> Result<bool> {
        Ok(self.states.write().await.remove(state_id).is_some())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut states = self.states.write().await;
        let before = states.len();
        states.retain(|_, s| s.expires_at >= now);
        Ok((before - states.len()) as u64)
    }
}

/// In-memory [`LinkTokenStore`].
#[derive(Clone, Default)]
pub struct InMemoryLinkTokenStore {
    tokens: Arc<RwLock<HashMap<String, IdpLinkToken>>>,
}

impl InMemoryLinkTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tokens.read().await.is_empty()
    }
}

#[async_trait]
impl LinkTokenStore for InMemoryLinkTokenStore {
    async fn insert(&self, token: &IdpLinkToken) -> Result<()> {
        let mut tokens = self.tokens.write().await;
        if tokens.contains_key(&token.id) {
            return Err(PacekeeperError::conflict("Link token already exists"));
        }
        tokens.insert(token.id.clone(), token.clone());
        Ok(())
    }

    async fn get(&self, token_id: &str) -> Result<Option<IdpLinkToken>> {
        Ok(self.tokens.read().await.get(token_id).cloned())
    }

    async fn mark_used(&self, token_id: &str) -> Result<bool> {
        let mut tokens = self.tokens.write().await;
        match tokens.get_mut(token_id) {
            Some(token) if !token.used => {
                token.used = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, t| t.expires_at >= now);
        Ok((before - tokens.len()) as u64)
    }
}

/// In-memory [`BackupCodeStore`].
#[derive(Clone, Default)]
pub struct InMemoryBackupCodeStore {
    codes: Arc<RwLock<HashMap<String, Vec<MfaBackupCode>>>>,
}

impl InMemoryBackupCodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BackupCodeStore for InMemoryBackupCodeStore {
    async fn replace_codes(&self, user_id: &str, codes: Vec<MfaBackupCode>) -> Result<u64> {
        let mut all = self.codes.write().await;
        let previous = all.insert(user_id.to_string(), codes);
        Ok(previous.map_or(0, |p| p.len() as u64))
    }

    async fn list_codes(&self, user_id: &str) -> Result<Vec<MfaBackupCode>> {
        Ok(self
            .codes
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_used(&self, user_id: &str, code_id: Uuid, used_at: DateTime<Utc>) -> Result<bool> {
        let mut all = self.codes.write().await;
        let Some(codes) = all.get_mut(user_id) else {
            return Ok(false);
        };
        match codes.iter_mut().find(|c| c.id == code_id && !c.used) {
            Some(code) => {
                code.used = true;
                code.used_at = Some(used_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_all(&self, user_id: &str) -> Result<u64> {
        let removed = self.codes.write().await.remove(user_id);
        Ok(removed.map_or(0, |c| c.len() as u64))
    }
}

/// In-memory [`TotpSecretStore`].
#[derive(Clone, Default)]
pub struct InMemoryTotpSecretStore {
    secrets: Arc<RwLock<HashMap<String, String>>>,
}

impl InMemoryTotpSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_secret(&self, user_id: &str, secret: impl Into<String>) {
        self.secrets
            .write()
            .await
            .insert(user_id.to_string(), secret.into());
    }
}

#[async_trait]
impl TotpSecretStore for InMemoryTotpSecretStore {
    async fn get_totp_secret(&self, user_id: &str) -> Result<Option<String>> {
        Ok(self.secrets.read().await.get(user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ClientType;
    use chrono::Duration;

    fn session(id: &str, user: &str, now: DateTime<Utc>) -> Session {
        Session {
            id: id.to_string(),
            user_id: user.to_string(),
            token_family_id: id.to_string(),
            refresh_token_hash: format!("hash-{}", id),
            csrf_token_hash: None,
            rotation_count: 0,
            client_type: ClientType::Web,
            ip_address: None,
            user_agent: None,
            created_at: now,
            last_rotation_at: None,
            last_activity_at: now,
            expires_at: now + Duration::days(7),
            oauth_state_id: None,
            tokens_exchanged: false,
        }
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates() {
        let store = InMemorySessionStore::new();
        let now = Utc::now();
        store.create_session(&session("s1", "u1", now)).await.unwrap();

        let err = store.create_session(&session("s1", "u1", now)).await.unwrap_err();
        assert!(matches!(err, PacekeeperError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_rotate_session_requires_expected_count() {
        let store = InMemorySessionStore::new();
        let now = Utc::now();
        store.create_session(&session("s1", "u1", now)).await.unwrap();

        let tombstone = RotatedRefreshToken::new("hash-s1", "s1", 0, now, Duration::seconds(60));
        let update = SessionUpdate::new().rotation_count(1).refresh_token_hash("next");

        assert!(store.rotate_session("s1", 0, &tombstone, &update).await.unwrap());
        // Loser of a race sees the count already moved and writes nothing
        let second = RotatedRefreshToken::new("other", "s1", 0, now, Duration::seconds(60));
        assert!(!store.rotate_session("s1", 0, &second, &update).await.unwrap());
        assert!(store.find_rotated_token("other").await.unwrap().is_none());

        let s = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(s.rotation_count, 1);
        assert_eq!(s.refresh_token_hash, "next");
    }

    #[tokio::test]
    async fn test_delete_session_checks_owner_and_drops_tombstones() {
        let store = InMemorySessionStore::new();
        let now = Utc::now();
        store.create_session(&session("s1", "u1", now)).await.unwrap();
        store
            .insert_rotated_token(&RotatedRefreshToken::new("old", "s1", 0, now, Duration::seconds(60)))
            .await
            .unwrap();

        assert!(store.delete_session("s1", "someone-else").await.unwrap().is_none());
        assert!(store.delete_session("s1", "u1").await.unwrap().is_some());
        assert_eq!(store.rotated_token_count().await, 0);
    }

    #[tokio::test]
    async fn test_delete_idle_sessions() {
        let store = InMemorySessionStore::new();
        let now = Utc::now();
        let mut stale = session("s1", "u1", now);
        stale.last_activity_at = now - Duration::hours(2);
        store.create_session(&stale).await.unwrap();
        store.create_session(&session("s2", "u1", now)).await.unwrap();

        let removed = store
            .delete_idle_sessions(now - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_exchange_tokens_once() {
        let store = InMemorySessionStore::new();
        store.create_session(&session("s1", "u1", Utc::now())).await.unwrap();

        let first = SessionUpdate::new().refresh_token_hash("first");
        let second = SessionUpdate::new().refresh_token_hash("second");
        assert!(store.exchange_tokens("s1", &first).await.unwrap());
        assert!(!store.exchange_tokens("s1", &second).await.unwrap());
        assert!(!store.exchange_tokens("missing", &first).await.unwrap());

        let stored = store.get_session("s1").await.unwrap().unwrap();
        assert!(stored.tokens_exchanged);
        assert_eq!(stored.refresh_token_hash, "first");
    }

    #[tokio::test]
    async fn test_backup_code_mark_used_once() {
        let store = InMemoryBackupCodeStore::new();
        let now = Utc::now();
        let code = MfaBackupCode::new("u1", "hash", now);
        let id = code.id;
        store.replace_codes("u1", vec![code]).await.unwrap();

        assert!(store.mark_used("u1", id, now).await.unwrap());
        assert!(!store.mark_used("u1", id, now).await.unwrap());
        assert!(!store.mark_used("u2", id, now).await.unwrap());
    }
}
