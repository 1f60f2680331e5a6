//! Per-device session registry.
//!
//! Sessions move from `Active` to exactly one terminal status. Expiry is
//! applied lazily: an active session found past its deadline is written as
//! `Expired` by whichever read notices it first.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::auth::{AuthResult, with_deadline};
use crate::store::{SessionClose, SessionRecord, SessionStatus, SessionStore};

pub const REASON_SUPERSEDED: &str = "superseded";

pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    deadline: StdDuration,
    single_session_per_device: bool,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn SessionStore>,
        deadline: StdDuration,
        single_session_per_device: bool,
    ) -> Self {
        Self {
            store,
            deadline,
            single_session_per_device,
        }
    }

    /// Persists `session` and returns the sessions it superseded on the same device.
    pub async fn create_session(
        &self,
        session: SessionRecord,
        now: DateTime<Utc>,
    ) -> AuthResult<(SessionRecord, Vec<SessionRecord>)> {
        let mut superseded = Vec::new();
        if let Some(device_id) = session
            .device
            .device_id
            .as_deref()
            .filter(|_| self.single_session_per_device)
        {
            let close = SessionClose::Revoked(REASON_SUPERSEDED.to_string());
            for existing in self.list_active(session.user_id, now).await? {
                if existing.device.device_id.as_deref() != Some(device_id) {
                    continue;
                }
                if self.close(existing.id, &close, now).await? {
                    superseded.push(existing);
                }
            }
        }

        with_deadline(self.deadline, self.store.insert_session(&session)).await?;
        Ok((session, superseded))
    }

    pub async fn find(&self, id: Uuid) -> AuthResult<Option<SessionRecord>> {
        with_deadline(self.deadline, self.store.find_session(id)).await
    }

    pub async fn find_by_refresh_family(
        &self,
        family_id: Uuid,
    ) -> AuthResult<Option<SessionRecord>> {
        with_deadline(
            self.deadline,
            self.store.find_session_by_refresh_family(family_id),
        )
        .await
    }

    /// The session if it is still active at `now`.
    pub async fn get_active(&self, id: Uuid, now: DateTime<Utc>) -> AuthResult<Option<SessionRecord>> {
        let Some(session) = self.find(id).await? else {
            return Ok(None);
        };
        self.expire_if_due(session, now).await
    }

    pub async fn touch(&self, id: Uuid, now: DateTime<Utc>) -> AuthResult<bool> {
        with_deadline(self.deadline, self.store.touch_session(id, now)).await
    }

    pub async fn rotate_tokens(
        &self,
        id: Uuid,
        access_token_id: Uuid,
        refresh_token_id: Uuid,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AuthResult<bool> {
        with_deadline(
            self.deadline,
            self.store
                .rotate_session_tokens(id, access_token_id, refresh_token_id, expires_at, now),
        )
        .await
    }

    pub async fn logout(&self, id: Uuid, now: DateTime<Utc>) -> AuthResult<bool> {
        self.close(id, &SessionClose::LoggedOut, now).await
    }

    pub async fn revoke(&self, id: Uuid, reason: &str, now: DateTime<Utc>) -> AuthResult<bool> {
        self.close(id, &SessionClose::Revoked(reason.to_string()), now)
            .await
    }

    /// Revokes every active session of `user_id` except `except`. Returns the
    /// sessions that were revoked.
    pub async fn revoke_all(
        &self,
        user_id: Uuid,
        reason: &str,
        except: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> AuthResult<Vec<SessionRecord>> {
        let close = SessionClose::Revoked(reason.to_string());
        let mut revoked = Vec::new();
        for session in self.list_active(user_id, now).await? {
            if Some(session.id) == except {
                continue;
            }
            if self.close(session.id, &close, now).await? {
                revoked.push(session);
            }
        }
        Ok(revoked)
    }

    pub async fn list_active(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> AuthResult<Vec<SessionRecord>> {
        let sessions = with_deadline(
            self.deadline,
            self.store
                .list_sessions_for_user(user_id, Some(SessionStatus::Active)),
        )
        .await?;

        let mut active = Vec::with_capacity(sessions.len());
        for session in sessions {
            if let Some(session) = self.expire_if_due(session, now).await? {
                active.push(session);
            }
        }
        Ok(active)
    }

    pub async fn purge(&self, cutoff: DateTime<Utc>) -> AuthResult<u64> {
        with_deadline(self.deadline, self.store.purge_sessions(cutoff)).await
    }

    async fn close(&self, id: Uuid, close: &SessionClose, now: DateTime<Utc>) -> AuthResult<bool> {
        with_deadline(self.deadline, self.store.close_session(id, close, now)).await
    }

    async fn expire_if_due(
        &self,
        session: SessionRecord,
        now: DateTime<Utc>,
    ) -> AuthResult<Option<SessionRecord>> {
        if session.status != SessionStatus::Active {
            return Ok(None);
        }
        if now >= session.expires_at {
            self.close(session.id, &SessionClose::Expired, now).await?;
            return Ok(None);
        }
        Ok(Some(session))
    }
}
