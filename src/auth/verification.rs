//! Single-use, time-boxed tokens stored on the user record.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use uuid::Uuid;

use crate::auth::{AuthError, AuthResult, MAX_CAS_RETRIES, with_deadline};
use crate::store::{CredentialStore, UserRecord, VerificationKind};

const TOKEN_LEN: usize = 32;

#[derive(Debug)]
pub enum VerificationOutcome {
    /// The token was valid and has been cleared; carries the updated user.
    Consumed(UserRecord),
    /// The token was past its expiry and has been cleared.
    Expired,
    NotFound,
}

pub struct VerificationManager {
    store: Arc<dyn CredentialStore>,
    deadline: StdDuration,
}

impl VerificationManager {
    pub fn new(store: Arc<dyn CredentialStore>, deadline: StdDuration) -> Self {
        Self { store, deadline }
    }

    pub fn generate_token() -> String {
        let mut bytes = [0u8; TOKEN_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Writes a fresh token into `user`'s slot for `kind`, replacing any prior one.
    pub fn stamp(
        user: &mut UserRecord,
        kind: VerificationKind,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> String {
        let token = Self::generate_token();
        user.set_verification_slot(kind, Some(token.clone()), Some(now + ttl));
        user.last_modified_at = now;
        token
    }

    /// Issues a token for a stored user. Returns the token and the updated record.
    pub async fn issue(
        &self,
        user_id: Uuid,
        kind: VerificationKind,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> AuthResult<(String, UserRecord)> {
        for _ in 0..=MAX_CAS_RETRIES {
            let Some(mut user) = with_deadline(self.deadline, self.store.find_user(user_id)).await?
            else {
                return Err(AuthError::NotFound);
            };
            let token = Self::stamp(&mut user, kind, ttl, now);
            if let Some(stored) =
                with_deadline(self.deadline, self.store.update_user_if_version(&user)).await?
            {
                return Ok((token, stored));
            }
        }
        Err(AuthError::Conflict)
    }

    pub async fn lookup(
        &self,
        token: &str,
        kind: VerificationKind,
    ) -> AuthResult<Option<UserRecord>> {
        if token.is_empty() {
            return Ok(None);
        }
        with_deadline(
            self.deadline,
            self.store.find_user_by_verification_token(kind, token),
        )
        .await
    }

    pub async fn consume(
        &self,
        token: &str,
        kind: VerificationKind,
        now: DateTime<Utc>,
    ) -> AuthResult<VerificationOutcome> {
        self.consume_with(token, kind, now, |_| {}).await
    }

    /// Consumes `token` and applies `apply` to the owning user in the same
    /// conditional update. A concurrent consumer that loses the race sees
    /// `NotFound` on its retry.
    pub async fn consume_with<F>(
        &self,
        token: &str,
        kind: VerificationKind,
        now: DateTime<Utc>,
        apply: F,
    ) -> AuthResult<VerificationOutcome>
    where
        F: Fn(&mut UserRecord) + Send + Sync,
    {
        for _ in 0..=MAX_CAS_RETRIES {
            let Some(mut user) = self.lookup(token, kind).await? else {
                return Ok(VerificationOutcome::NotFound);
            };

            let (_, expires_at) = user.verification_slot(kind);
            let expired = expires_at.is_none_or(|expires_at| now >= expires_at);
            user.set_verification_slot(kind, None, None);
            user.last_modified_at = now;
            if !expired {
                apply(&mut user);
            }

            match with_deadline(self.deadline, self.store.update_user_if_version(&user)).await? {
                Some(_) if expired => return Ok(VerificationOutcome::Expired),
                Some(stored) => return Ok(VerificationOutcome::Consumed(stored)),
                None => continue,
            }
        }
        Err(AuthError::Conflict)
    }
}
