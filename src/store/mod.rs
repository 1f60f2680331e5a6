//! Persistence seams for the credential and session subsystem.
//!
//! Every mutation is a single-record atomic operation: user rows are guarded by
//! an optimistic `version` column, refresh tokens by a `used_at IS NULL` guard,
//! sessions by an `ACTIVE` status guard. Bulk revocations (a refresh-token family
//! or every session of a user) are plain set updates that need no transaction.
//!
//! Two backends are provided: [`MemoryStore`] for tests and single-node
//! development, and [`PgStore`] for Postgres.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;
pub mod records;

pub use memory::MemoryStore;
pub use postgres::{PgStore, run_migrations};
pub use records::{
    ADMIN_AUTHORITY, AccountStatus, DEFAULT_AUTHORITY, DeviceInfo, DeviceType, LoginHistoryRecord, LoginMethod,
    PasswordChangeReason, PasswordHistoryRecord, RefreshTokenRecord, SessionClose,
    SessionRecord, SessionStatus, UserRecord, VerificationKind,
};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate {0}")]
    Duplicate(&'static str),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("{0} unavailable")]
    Unavailable(&'static str),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Persistence backend selected through `AUTH_STORE_BACKEND`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl StoreBackend {
    pub fn from_env() -> Result<Self, String> {
        match std::env::var("AUTH_STORE_BACKEND") {
            Ok(value) => Self::parse(&value),
            Err(_) => Ok(Self::Postgres),
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "postgres" | "pg" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown store backend '{other}'")),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Memory => "memory",
        }
    }
}

#[rocket::async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fails with [`StoreError::Duplicate`] when the login or email is taken.
    async fn insert_user(&self, user: &UserRecord) -> StoreResult<()>;

    async fn find_user(&self, id: Uuid) -> StoreResult<Option<UserRecord>>;

    async fn find_user_by_login(&self, login: &str) -> StoreResult<Option<UserRecord>>;

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<UserRecord>>;

    /// Case-insensitive match against either the login or the email column.
    async fn find_user_by_login_or_email(
        &self,
        identifier: &str,
    ) -> StoreResult<Option<UserRecord>>;

    async fn find_user_by_verification_token(
        &self,
        kind: VerificationKind,
        token: &str,
    ) -> StoreResult<Option<UserRecord>>;

    /// Writes `user` only if the stored row still carries `user.version`.
    ///
    /// Returns the stored record (with its bumped version) on success and
    /// `None` when another writer got there first. Login and email are
    /// immutable and ignored by this update.
    async fn update_user_if_version(&self, user: &UserRecord) -> StoreResult<Option<UserRecord>>;
}

#[rocket::async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn insert_refresh_token(&self, token: &RefreshTokenRecord) -> StoreResult<()>;

    async fn find_refresh_token(&self, id: Uuid) -> StoreResult<Option<RefreshTokenRecord>>;

    /// Consumes the token: sets `used_at` and `replaced_by` iff it is neither
    /// used nor revoked. Exactly one concurrent caller observes `true`.
    async fn mark_refresh_token_used(
        &self,
        id: Uuid,
        replaced_by: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn revoke_refresh_token(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn revoke_refresh_family(
        &self,
        family_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<u64>;

    async fn revoke_refresh_tokens_for_user(
        &self,
        user_id: Uuid,
        except_family: Option<Uuid>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<u64>;
}

#[rocket::async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, session: &SessionRecord) -> StoreResult<()>;

    async fn find_session(&self, id: Uuid) -> StoreResult<Option<SessionRecord>>;

    async fn find_session_by_refresh_family(
        &self,
        family_id: Uuid,
    ) -> StoreResult<Option<SessionRecord>>;

    async fn list_sessions_for_user(
        &self,
        user_id: Uuid,
        status: Option<SessionStatus>,
    ) -> StoreResult<Vec<SessionRecord>>;

    /// Updates `last_activity_at` of an active session.
    async fn touch_session(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Points an active session at a freshly rotated token pair.
    async fn rotate_session_tokens(
        &self,
        id: Uuid,
        access_token_id: Uuid,
        refresh_token_id: Uuid,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Moves an active session to a terminal status. `false` if it was not active.
    async fn close_session(
        &self,
        id: Uuid,
        close: &SessionClose,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Deletes non-active sessions that ended before `cutoff`.
    async fn purge_sessions(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
}

#[rocket::async_trait]
pub trait LoginHistoryStore: Send + Sync {
    async fn append_login_event(&self, event: &LoginHistoryRecord) -> StoreResult<()>;

    async fn recent_login_events(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> StoreResult<Vec<LoginHistoryRecord>>;
}

#[rocket::async_trait]
pub trait PasswordHistoryStore: Send + Sync {
    async fn append_password_history(&self, entry: &PasswordHistoryRecord) -> StoreResult<()>;

    /// Most recent hashes first.
    async fn recent_password_hashes(&self, user_id: Uuid, limit: usize)
    -> StoreResult<Vec<String>>;
}

/// Everything the auth service needs from a backend.
pub trait AuthStore:
    CredentialStore + RefreshTokenStore + SessionStore + LoginHistoryStore + PasswordHistoryStore
{
}

impl<T> AuthStore for T where
    T: CredentialStore
        + RefreshTokenStore
        + SessionStore
        + LoginHistoryStore
        + PasswordHistoryStore
{
}
