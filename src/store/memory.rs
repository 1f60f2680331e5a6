//! In-process store backed by `DashMap`.
//!
//! Each conditional operation runs under the shard lock of the record it
//! touches, which gives the same single-record atomicity the Postgres backend
//! gets from guarded `UPDATE` statements.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::store::{
    CredentialStore, LoginHistoryRecord, LoginHistoryStore, PasswordHistoryRecord,
    PasswordHistoryStore, RefreshTokenRecord, RefreshTokenStore, SessionClose, SessionRecord,
    SessionStatus, SessionStore, StoreError, StoreResult, UserRecord, VerificationKind,
};

#[derive(Default)]
pub struct MemoryStore {
    users: DashMap<Uuid, UserRecord>,
    logins: DashMap<String, Uuid>,
    emails: DashMap<String, Uuid>,
    refresh_tokens: DashMap<Uuid, RefreshTokenRecord>,
    sessions: DashMap<Uuid, SessionRecord>,
    login_history: Mutex<Vec<LoginHistoryRecord>>,
    password_history: Mutex<Vec<PasswordHistoryRecord>>,
    history_offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes password history appends fail, for exercising partial-write paths.
    pub fn fail_password_history(&self, failing: bool) {
        self.history_offline.store(failing, Ordering::SeqCst);
    }

    fn user_by_index(&self, index: &DashMap<String, Uuid>, key: &str) -> Option<UserRecord> {
        let id = index.get(&key.to_lowercase()).map(|entry| *entry.value())?;
        self.users.get(&id).map(|entry| entry.value().clone())
    }
}

#[rocket::async_trait]
impl CredentialStore for MemoryStore {
    async fn insert_user(&self, user: &UserRecord) -> StoreResult<()> {
        let login = user.login.to_lowercase();
        let email = user.email.to_lowercase();

        match self.logins.entry(login.clone()) {
            Entry::Occupied(_) => return Err(StoreError::Duplicate("login")),
            Entry::Vacant(slot) => {
                slot.insert(user.id);
            }
        }

        match self.emails.entry(email) {
            Entry::Occupied(_) => {
                self.logins.remove(&login);
                return Err(StoreError::Duplicate("email"));
            }
            Entry::Vacant(slot) => {
                slot.insert(user.id);
            }
        }

        self.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn find_user(&self, id: Uuid) -> StoreResult<Option<UserRecord>> {
        Ok(self.users.get(&id).map(|entry| entry.value().clone()))
    }

    async fn find_user_by_login(&self, login: &str) -> StoreResult<Option<UserRecord>> {
        Ok(self.user_by_index(&self.logins, login))
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<UserRecord>> {
        Ok(self.user_by_index(&self.emails, email))
    }

    async fn find_user_by_login_or_email(
        &self,
        identifier: &str,
    ) -> StoreResult<Option<UserRecord>> {
        Ok(self
            .user_by_index(&self.logins, identifier)
            .or_else(|| self.user_by_index(&self.emails, identifier)))
    }

    async fn find_user_by_verification_token(
        &self,
        kind: VerificationKind,
        token: &str,
    ) -> StoreResult<Option<UserRecord>> {
        Ok(self
            .users
            .iter()
            .find(|entry| entry.value().verification_slot(kind).0 == Some(token))
            .map(|entry| entry.value().clone()))
    }

    async fn update_user_if_version(&self, user: &UserRecord) -> StoreResult<Option<UserRecord>> {
        let Some(mut stored) = self.users.get_mut(&user.id) else {
            return Ok(None);
        };
        if stored.version != user.version {
            return Ok(None);
        }

        let mut next = user.clone();
        next.login = stored.login.clone();
        next.email = stored.email.clone();
        next.version = stored.version + 1;
        *stored = next.clone();
        Ok(Some(next))
    }
}

#[rocket::async_trait]
impl RefreshTokenStore for MemoryStore {
    async fn insert_refresh_token(&self, token: &RefreshTokenRecord) -> StoreResult<()> {
        match self.refresh_tokens.entry(token.id) {
            Entry::Occupied(_) => Err(StoreError::Duplicate("refresh token")),
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
                Ok(())
            }
        }
    }

    async fn find_refresh_token(&self, id: Uuid) -> StoreResult<Option<RefreshTokenRecord>> {
        Ok(self.refresh_tokens.get(&id).map(|entry| entry.value().clone()))
    }

    async fn mark_refresh_token_used(
        &self,
        id: Uuid,
        replaced_by: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let Some(mut token) = self.refresh_tokens.get_mut(&id) else {
            return Ok(false);
        };
        if token.used_at.is_some() || token.revoked {
            return Ok(false);
        }
        token.used_at = Some(now);
        token.replaced_by = Some(replaced_by);
        Ok(true)
    }

    async fn revoke_refresh_token(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let Some(mut token) = self.refresh_tokens.get_mut(&id) else {
            return Ok(false);
        };
        if token.revoked {
            return Ok(false);
        }
        revoke(&mut token, reason, now);
        Ok(true)
    }

    async fn revoke_refresh_family(
        &self,
        family_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut revoked = 0;
        for mut token in self.refresh_tokens.iter_mut() {
            if token.family_id == family_id && !token.revoked {
                revoke(&mut token, reason, now);
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn revoke_refresh_tokens_for_user(
        &self,
        user_id: Uuid,
        except_family: Option<Uuid>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut revoked = 0;
        for mut token in self.refresh_tokens.iter_mut() {
            if token.user_id == user_id
                && !token.revoked
                && Some(token.family_id) != except_family
            {
                revoke(&mut token, reason, now);
                revoked += 1;
            }
        }
        Ok(revoked)
    }
}

fn revoke(token: &mut RefreshTokenRecord, reason: &str, now: DateTime<Utc>) {
    token.revoked = true;
    token.revoked_at = Some(now);
    token.revoked_reason = Some(reason.to_string());
}

#[rocket::async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, session: &SessionRecord) -> StoreResult<()> {
        match self.sessions.entry(session.id) {
            Entry::Occupied(_) => Err(StoreError::Duplicate("session")),
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
                Ok(())
            }
        }
    }

    async fn find_session(&self, id: Uuid) -> StoreResult<Option<SessionRecord>> {
        Ok(self.sessions.get(&id).map(|entry| entry.value().clone()))
    }

    async fn find_session_by_refresh_family(
        &self,
        family_id: Uuid,
    ) -> StoreResult<Option<SessionRecord>> {
        Ok(self
            .sessions
            .iter()
            .find(|entry| entry.value().refresh_family_id == family_id)
            .map(|entry| entry.value().clone()))
    }

    async fn list_sessions_for_user(
        &self,
        user_id: Uuid,
        status: Option<SessionStatus>,
    ) -> StoreResult<Vec<SessionRecord>> {
        let mut sessions: Vec<SessionRecord> = self
            .sessions
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .filter(|entry| status.is_none_or(|wanted| entry.status == wanted))
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by(|a, b| b.login_at.cmp(&a.login_at));
        Ok(sessions)
    }

    async fn touch_session(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let Some(mut session) = self.sessions.get_mut(&id) else {
            return Ok(false);
        };
        if session.status != SessionStatus::Active {
            return Ok(false);
        }
        session.last_activity_at = now;
        Ok(true)
    }

    async fn rotate_session_tokens(
        &self,
        id: Uuid,
        access_token_id: Uuid,
        refresh_token_id: Uuid,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let Some(mut session) = self.sessions.get_mut(&id) else {
            return Ok(false);
        };
        if session.status != SessionStatus::Active {
            return Ok(false);
        }
        session.access_token_id = access_token_id;
        session.refresh_token_id = refresh_token_id;
        session.expires_at = expires_at;
        session.last_activity_at = now;
        Ok(true)
    }

    async fn close_session(
        &self,
        id: Uuid,
        close: &SessionClose,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let Some(mut session) = self.sessions.get_mut(&id) else {
            return Ok(false);
        };
        if session.status != SessionStatus::Active {
            return Ok(false);
        }
        close.apply(&mut session, now);
        Ok(true)
    }

    async fn purge_sessions(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| {
            session.status == SessionStatus::Active || session.expires_at > cutoff
        });
        Ok((before - self.sessions.len()) as u64)
    }
}

#[rocket::async_trait]
impl LoginHistoryStore for MemoryStore {
    async fn append_login_event(&self, event: &LoginHistoryRecord) -> StoreResult<()> {
        self.login_history.lock().push(event.clone());
        Ok(())
    }

    async fn recent_login_events(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> StoreResult<Vec<LoginHistoryRecord>> {
        let history = self.login_history.lock();
        Ok(history
            .iter()
            .rev()
            .filter(|event| event.user_id == Some(user_id))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[rocket::async_trait]
impl PasswordHistoryStore for MemoryStore {
    async fn append_password_history(&self, entry: &PasswordHistoryRecord) -> StoreResult<()> {
        if self.history_offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("password history"));
        }
        self.password_history.lock().push(entry.clone());
        Ok(())
    }

    async fn recent_password_hashes(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> StoreResult<Vec<String>> {
        let history = self.password_history.lock();
        Ok(history
            .iter()
            .rev()
            .filter(|entry| entry.user_id == user_id)
            .take(limit)
            .map(|entry| entry.password_hash.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn user(login: &str, email: &str) -> UserRecord {
        UserRecord::pending(login, email, "hash".into(), "en", Utc::now())
    }

    #[tokio::test]
    async fn rejects_duplicate_login_and_email_case_insensitively() {
        let store = MemoryStore::new();
        store.insert_user(&user("alice", "alice@x.com")).await.expect("insert");

        let err = store
            .insert_user(&user("ALICE", "other@x.com"))
            .await
            .expect_err("duplicate login");
        assert!(matches!(err, StoreError::Duplicate("login")));

        let err = store
            .insert_user(&user("bob", "Alice@X.com"))
            .await
            .expect_err("duplicate email");
        assert!(matches!(err, StoreError::Duplicate("email")));

        // The failed insert must not leave its login reserved.
        store.insert_user(&user("bob", "bob@x.com")).await.expect("bob fits");
    }

    #[tokio::test]
    async fn conditional_update_rejects_stale_versions() {
        let store = MemoryStore::new();
        let original = user("carol", "carol@x.com");
        store.insert_user(&original).await.expect("insert");

        let mut first = original.clone();
        first.failed_login_attempts = 1;
        let stored = store
            .update_user_if_version(&first)
            .await
            .expect("update")
            .expect("first writer wins");
        assert_eq!(stored.version, 1);

        let mut stale = original.clone();
        stale.failed_login_attempts = 4;
        assert!(store.update_user_if_version(&stale).await.expect("update").is_none());

        let current = store.find_user(original.id).await.expect("find").expect("exists");
        assert_eq!(current.failed_login_attempts, 1);
    }

    #[tokio::test]
    async fn refresh_token_can_only_be_consumed_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let id = Uuid::new_v4();
        store
            .insert_refresh_token(&RefreshTokenRecord {
                id,
                family_id: id,
                user_id: Uuid::new_v4(),
                token_hash: "h".into(),
                created_at: now,
                expires_at: now + Duration::days(1),
                used_at: None,
                revoked: false,
                revoked_at: None,
                revoked_reason: None,
                replaced_by: None,
                device_id: None,
                ip_address: None,
                user_agent: None,
            })
            .await
            .expect("insert");

        assert!(store.mark_refresh_token_used(id, Uuid::new_v4(), now).await.expect("mark"));
        assert!(!store.mark_refresh_token_used(id, Uuid::new_v4(), now).await.expect("mark"));
    }
}
