use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx::postgres::PgRow;
use rocket_db_pools::sqlx::{self, PgPool, Row};
use uuid::Uuid;

use crate::store::{
    AccountStatus, CredentialStore, DeviceInfo, DeviceType, LoginHistoryRecord,
    LoginHistoryStore, LoginMethod, PasswordHistoryRecord, PasswordHistoryStore,
    RefreshTokenRecord, RefreshTokenStore, SessionClose, SessionRecord, SessionStatus,
    SessionStore, StoreError, StoreResult, UserRecord, VerificationKind,
};

const USER_COLUMNS: &str = "id, login, email, password_hash, activated, account_status, \
    email_verified, failed_login_attempts, account_locked_until, email_verification_token, \
    email_verification_expires_at, password_reset_token, password_reset_expires_at, \
    authorities, language, created_at, last_modified_at, last_login_at, last_login_ip, \
    last_password_change_at, version";

const REFRESH_COLUMNS: &str = "id, family_id, user_id, token_hash, created_at, expires_at, \
    used_at, revoked, revoked_at, revoked_reason, replaced_by, device_id, ip_address, user_agent";

const SESSION_COLUMNS: &str = "id, user_id, access_token_id, refresh_token_id, \
    refresh_family_id, device_id, device_name, device_type, os_name, os_version, browser_name, \
    browser_version, ip_address, user_agent, remember_me, trusted_device, login_at, expires_at, \
    last_activity_at, status, logout_at, revoked_at, revoked_reason";

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Applies the schema migrations bundled with the crate.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    MIGRATOR.run(pool).await
}

/// Postgres backend. Tables are created by the migrations under `migrations/`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_user(&self, clause: &str, value: &str) -> StoreResult<Option<UserRecord>> {
        let query = format!("SELECT {USER_COLUMNS} FROM auth_users WHERE {clause}");
        let row = sqlx::query(&query)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }
}

fn user_from_row(row: &PgRow) -> StoreResult<UserRecord> {
    let status: String = row.try_get("account_status")?;
    Ok(UserRecord {
        id: row.try_get("id")?,
        login: row.try_get("login")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        activated: row.try_get("activated")?,
        account_status: AccountStatus::parse(&status)?,
        email_verified: row.try_get("email_verified")?,
        failed_login_attempts: row.try_get("failed_login_attempts")?,
        account_locked_until: row.try_get("account_locked_until")?,
        email_verification_token: row.try_get("email_verification_token")?,
        email_verification_expires_at: row.try_get("email_verification_expires_at")?,
        password_reset_token: row.try_get("password_reset_token")?,
        password_reset_expires_at: row.try_get("password_reset_expires_at")?,
        authorities: row.try_get("authorities")?,
        language: row.try_get("language")?,
        created_at: row.try_get("created_at")?,
        last_modified_at: row.try_get("last_modified_at")?,
        last_login_at: row.try_get("last_login_at")?,
        last_login_ip: row.try_get("last_login_ip")?,
        last_password_change_at: row.try_get("last_password_change_at")?,
        version: row.try_get("version")?,
    })
}

fn refresh_from_row(row: &PgRow) -> StoreResult<RefreshTokenRecord> {
    Ok(RefreshTokenRecord {
        id: row.try_get("id")?,
        family_id: row.try_get("family_id")?,
        user_id: row.try_get("user_id")?,
        token_hash: row.try_get("token_hash")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        used_at: row.try_get("used_at")?,
        revoked: row.try_get("revoked")?,
        revoked_at: row.try_get("revoked_at")?,
        revoked_reason: row.try_get("revoked_reason")?,
        replaced_by: row.try_get("replaced_by")?,
        device_id: row.try_get("device_id")?,
        ip_address: row.try_get("ip_address")?,
        user_agent: row.try_get("user_agent")?,
    })
}

fn session_from_row(row: &PgRow) -> StoreResult<SessionRecord> {
    let status: String = row.try_get("status")?;
    let device_type: Option<String> = row.try_get("device_type")?;
    Ok(SessionRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        access_token_id: row.try_get("access_token_id")?,
        refresh_token_id: row.try_get("refresh_token_id")?,
        refresh_family_id: row.try_get("refresh_family_id")?,
        device: DeviceInfo {
            device_id: row.try_get("device_id")?,
            device_name: row.try_get("device_name")?,
            device_type: device_type.as_deref().map(DeviceType::parse).transpose()?,
            os_name: row.try_get("os_name")?,
            os_version: row.try_get("os_version")?,
            browser_name: row.try_get("browser_name")?,
            browser_version: row.try_get("browser_version")?,
            ip_address: row.try_get("ip_address")?,
            user_agent: row.try_get("user_agent")?,
        },
        remember_me: row.try_get("remember_me")?,
        trusted_device: row.try_get("trusted_device")?,
        login_at: row.try_get("login_at")?,
        expires_at: row.try_get("expires_at")?,
        last_activity_at: row.try_get("last_activity_at")?,
        status: SessionStatus::parse(&status)?,
        logout_at: row.try_get("logout_at")?,
        revoked_at: row.try_get("revoked_at")?,
        revoked_reason: row.try_get("revoked_reason")?,
    })
}

fn duplicate_user(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        match db_err.constraint() {
            Some("auth_users_login_key") => return StoreError::Duplicate("login"),
            Some("auth_users_email_key") => return StoreError::Duplicate("email"),
            _ => {}
        }
    }
    StoreError::Sqlx(err)
}

#[rocket::async_trait]
impl CredentialStore for PgStore {
    async fn insert_user(&self, user: &UserRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO auth_users (id, login, email, password_hash, activated, account_status,
                email_verified, failed_login_attempts, account_locked_until,
                email_verification_token, email_verification_expires_at, password_reset_token,
                password_reset_expires_at, authorities, language, created_at, last_modified_at,
                last_login_at, last_login_ip, last_password_change_at, version)
            VALUES ($1, lower($2), lower($3), $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19, $20, $21)
            "#,
        )
        .bind(user.id)
        .bind(&user.login)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.activated)
        .bind(user.account_status.as_str())
        .bind(user.email_verified)
        .bind(user.failed_login_attempts)
        .bind(user.account_locked_until)
        .bind(&user.email_verification_token)
        .bind(user.email_verification_expires_at)
        .bind(&user.password_reset_token)
        .bind(user.password_reset_expires_at)
        .bind(&user.authorities)
        .bind(&user.language)
        .bind(user.created_at)
        .bind(user.last_modified_at)
        .bind(user.last_login_at)
        .bind(&user.last_login_ip)
        .bind(user.last_password_change_at)
        .bind(user.version)
        .execute(&self.pool)
        .await
        .map_err(duplicate_user)?;

        Ok(())
    }

    async fn find_user(&self, id: Uuid) -> StoreResult<Option<UserRecord>> {
        let query = format!("SELECT {USER_COLUMNS} FROM auth_users WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_user_by_login(&self, login: &str) -> StoreResult<Option<UserRecord>> {
        self.fetch_user("login = lower($1)", login).await
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<UserRecord>> {
        self.fetch_user("email = lower($1)", email).await
    }

    async fn find_user_by_login_or_email(
        &self,
        identifier: &str,
    ) -> StoreResult<Option<UserRecord>> {
        self.fetch_user(
            "login = lower($1) OR email = lower($1) ORDER BY (login = lower($1)) DESC LIMIT 1",
            identifier,
        )
        .await
    }

    async fn find_user_by_verification_token(
        &self,
        kind: VerificationKind,
        token: &str,
    ) -> StoreResult<Option<UserRecord>> {
        let clause = match kind {
            VerificationKind::EmailVerify => "email_verification_token = $1",
            VerificationKind::PasswordReset => "password_reset_token = $1",
        };
        self.fetch_user(clause, token).await
    }

    async fn update_user_if_version(&self, user: &UserRecord) -> StoreResult<Option<UserRecord>> {
        let query = format!(
            r#"
            UPDATE auth_users SET
                password_hash = $3, activated = $4, account_status = $5, email_verified = $6,
                failed_login_attempts = $7, account_locked_until = $8,
                email_verification_token = $9, email_verification_expires_at = $10,
                password_reset_token = $11, password_reset_expires_at = $12, authorities = $13,
                language = $14, last_modified_at = $15, last_login_at = $16, last_login_ip = $17,
                last_password_change_at = $18, version = version + 1
            WHERE id = $1 AND version = $2
            RETURNING {USER_COLUMNS}
            "#
        );
        let row = sqlx::query(&query)
            .bind(user.id)
            .bind(user.version)
            .bind(&user.password_hash)
            .bind(user.activated)
            .bind(user.account_status.as_str())
            .bind(user.email_verified)
            .bind(user.failed_login_attempts)
            .bind(user.account_locked_until)
            .bind(&user.email_verification_token)
            .bind(user.email_verification_expires_at)
            .bind(&user.password_reset_token)
            .bind(user.password_reset_expires_at)
            .bind(&user.authorities)
            .bind(&user.language)
            .bind(user.last_modified_at)
            .bind(user.last_login_at)
            .bind(&user.last_login_ip)
            .bind(user.last_password_change_at)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }
}

#[rocket::async_trait]
impl RefreshTokenStore for PgStore {
    async fn insert_refresh_token(&self, token: &RefreshTokenRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO auth_refresh_tokens (id, family_id, user_id, token_hash, created_at,
                expires_at, used_at, revoked, revoked_at, revoked_reason, replaced_by, device_id,
                ip_address, user_agent)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(token.id)
        .bind(token.family_id)
        .bind(token.user_id)
        .bind(&token.token_hash)
        .bind(token.created_at)
        .bind(token.expires_at)
        .bind(token.used_at)
        .bind(token.revoked)
        .bind(token.revoked_at)
        .bind(&token.revoked_reason)
        .bind(token.replaced_by)
        .bind(&token.device_id)
        .bind(&token.ip_address)
        .bind(&token.user_agent)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_refresh_token(&self, id: Uuid) -> StoreResult<Option<RefreshTokenRecord>> {
        let query = format!("SELECT {REFRESH_COLUMNS} FROM auth_refresh_tokens WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(refresh_from_row).transpose()
    }

    async fn mark_refresh_token_used(
        &self,
        id: Uuid,
        replaced_by: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE auth_refresh_tokens SET used_at = $2, replaced_by = $3 WHERE id = $1 AND used_at IS NULL AND revoked = false",
        )
        .bind(id)
        .bind(now)
        .bind(replaced_by)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn revoke_refresh_token(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE auth_refresh_tokens SET revoked = true, revoked_at = $2, revoked_reason = $3 WHERE id = $1 AND revoked = false",
        )
        .bind(id)
        .bind(now)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn revoke_refresh_family(
        &self,
        family_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE auth_refresh_tokens SET revoked = true, revoked_at = $2, revoked_reason = $3 WHERE family_id = $1 AND revoked = false",
        )
        .bind(family_id)
        .bind(now)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn revoke_refresh_tokens_for_user(
        &self,
        user_id: Uuid,
        except_family: Option<Uuid>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE auth_refresh_tokens SET revoked = true, revoked_at = $2, revoked_reason = $3
            WHERE user_id = $1 AND revoked = false
              AND ($4::uuid IS NULL OR family_id <> $4)
            "#,
        )
        .bind(user_id)
        .bind(now)
        .bind(reason)
        .bind(except_family)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[rocket::async_trait]
impl SessionStore for PgStore {
    async fn insert_session(&self, session: &SessionRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO auth_sessions (id, user_id, access_token_id, refresh_token_id,
                refresh_family_id, device_id, device_name, device_type, os_name, os_version,
                browser_name, browser_version, ip_address, user_agent, remember_me,
                trusted_device, login_at, expires_at, last_activity_at, status, logout_at,
                revoked_at, revoked_reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                $18, $19, $20, $21, $22, $23)
            "#,
        )
        .bind(session.id)
        .bind(session.user_id)
        .bind(session.access_token_id)
        .bind(session.refresh_token_id)
        .bind(session.refresh_family_id)
        .bind(&session.device.device_id)
        .bind(&session.device.device_name)
        .bind(session.device.device_type.map(|t| t.as_str()))
        .bind(&session.device.os_name)
        .bind(&session.device.os_version)
        .bind(&session.device.browser_name)
        .bind(&session.device.browser_version)
        .bind(&session.device.ip_address)
        .bind(&session.device.user_agent)
        .bind(session.remember_me)
        .bind(session.trusted_device)
        .bind(session.login_at)
        .bind(session.expires_at)
        .bind(session.last_activity_at)
        .bind(session.status.as_str())
        .bind(session.logout_at)
        .bind(session.revoked_at)
        .bind(&session.revoked_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_session(&self, id: Uuid) -> StoreResult<Option<SessionRecord>> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM auth_sessions WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn find_session_by_refresh_family(
        &self,
        family_id: Uuid,
    ) -> StoreResult<Option<SessionRecord>> {
        let query =
            format!("SELECT {SESSION_COLUMNS} FROM auth_sessions WHERE refresh_family_id = $1");
        let row = sqlx::query(&query)
            .bind(family_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn list_sessions_for_user(
        &self,
        user_id: Uuid,
        status: Option<SessionStatus>,
    ) -> StoreResult<Vec<SessionRecord>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM auth_sessions WHERE user_id = $1 AND ($2::text IS NULL OR status = $2) ORDER BY login_at DESC"
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .bind(status.map(|s| s.as_str()))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn touch_session(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE auth_sessions SET last_activity_at = $2 WHERE id = $1 AND status = 'ACTIVE'",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn rotate_session_tokens(
        &self,
        id: Uuid,
        access_token_id: Uuid,
        refresh_token_id: Uuid,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE auth_sessions
            SET access_token_id = $2, refresh_token_id = $3, expires_at = $4, last_activity_at = $5
            WHERE id = $1 AND status = 'ACTIVE'
            "#,
        )
        .bind(id)
        .bind(access_token_id)
        .bind(refresh_token_id)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn close_session(
        &self,
        id: Uuid,
        close: &SessionClose,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let (logout_at, revoked_at, reason) = match close {
            SessionClose::Expired => (None, None, None),
            SessionClose::LoggedOut => (Some(now), None, None),
            SessionClose::Revoked(reason) => (None, Some(now), Some(reason.as_str())),
        };
        let result = sqlx::query(
            r#"
            UPDATE auth_sessions
            SET status = $2, logout_at = COALESCE($3, logout_at),
                revoked_at = COALESCE($4, revoked_at), revoked_reason = COALESCE($5, revoked_reason)
            WHERE id = $1 AND status = 'ACTIVE'
            "#,
        )
        .bind(id)
        .bind(close.status().as_str())
        .bind(logout_at)
        .bind(revoked_at)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn purge_sessions(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result =
            sqlx::query("DELETE FROM auth_sessions WHERE status <> 'ACTIVE' AND expires_at <= $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

#[rocket::async_trait]
impl LoginHistoryStore for PgStore {
    async fn append_login_event(&self, event: &LoginHistoryRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO auth_login_history (id, user_id, identifier, login_at, method, ip_address,
                user_agent, device_type, successful, failure_reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(event.id)
        .bind(event.user_id)
        .bind(&event.identifier)
        .bind(event.login_at)
        .bind(event.method.as_str())
        .bind(&event.ip_address)
        .bind(&event.user_agent)
        .bind(event.device_type.map(|t| t.as_str()))
        .bind(event.successful)
        .bind(&event.failure_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_login_events(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> StoreResult<Vec<LoginHistoryRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, identifier, login_at, method, ip_address, user_agent, device_type,
                   successful, failure_reason
            FROM auth_login_history WHERE user_id = $1 ORDER BY login_at DESC LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let method: String = row.try_get("method")?;
                let device_type: Option<String> = row.try_get("device_type")?;
                Ok(LoginHistoryRecord {
                    id: row.try_get("id")?,
                    user_id: row.try_get("user_id")?,
                    identifier: row.try_get("identifier")?,
                    login_at: row.try_get("login_at")?,
                    method: LoginMethod::parse(&method)?,
                    ip_address: row.try_get("ip_address")?,
                    user_agent: row.try_get("user_agent")?,
                    device_type: device_type.as_deref().map(DeviceType::parse).transpose()?,
                    successful: row.try_get("successful")?,
                    failure_reason: row.try_get("failure_reason")?,
                })
            })
            .collect()
    }
}

#[rocket::async_trait]
impl PasswordHistoryStore for PgStore {
    async fn append_password_history(&self, entry: &PasswordHistoryRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO auth_password_history (id, user_id, password_hash, changed_at, change_reason) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(entry.id)
        .bind(entry.user_id)
        .bind(&entry.password_hash)
        .bind(entry.changed_at)
        .bind(entry.reason.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_password_hashes(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> StoreResult<Vec<String>> {
        let hashes: Vec<String> = sqlx::query_scalar(
            "SELECT password_hash FROM auth_password_history WHERE user_id = $1 ORDER BY changed_at DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(hashes)
    }
}
