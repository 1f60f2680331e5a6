//! Credential and session flows.
//!
//! `AuthService` composes the lockout policy, password hasher, token issuer,
//! refresh-token ledger, session registry and verification tokens on top of
//! the store traits. Every store call is bounded by the configured deadline and
//! every read-modify-write of a user row is a compare-and-swap on its version.

use std::sync::{Arc, OnceLock};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use uuid::Uuid;

use crate::auth::clock::Clock;
use crate::auth::jwt::SignedAccessToken;
use crate::auth::lockout::{Decision, LockoutPolicy, PasswordCheck};
use crate::auth::mailer::{MailKind, MailMessage, Mailer};
use crate::auth::refresh_store::{
    REASON_LOGOUT, REASON_REUSE, RedeemOutcome, RefreshTokenIssued, RefreshTokenLedger,
};
use crate::auth::sessions::{REASON_SUPERSEDED, SessionRegistry};
use crate::auth::verification::{VerificationManager, VerificationOutcome};
use crate::auth::{
    AuthConfig, AuthError, AuthResult, JwtService, MAX_CAS_RETRIES, PasswordService,
    with_deadline,
};
use crate::store::{
    ADMIN_AUTHORITY, AccountStatus, AuthStore, CredentialStore, DeviceInfo, LoginHistoryRecord,
    LoginHistoryStore, LoginMethod, PasswordChangeReason, PasswordHistoryRecord,
    PasswordHistoryStore, SessionRecord, SessionStatus, StoreError, UserRecord,
    VerificationKind,
};

const REASON_PASSWORD_RESET: &str = "password_reset";
const REASON_PASSWORD_CHANGE: &str = "password_change";
const REASON_DEACTIVATED: &str = "deactivated";
const REASON_ADMIN: &str = "admin";
const REASON_USER_REVOKED: &str = "user_revoked";
const REASON_ACCOUNT_UNAVAILABLE: &str = "account_unavailable";

// Logins never contain '@', so an identifier can only ever match one of login or email.
static LOGIN_REGEX: OnceLock<Regex> = OnceLock::new();

fn login_regex() -> &'static Regex {
    LOGIN_REGEX.get_or_init(|| Regex::new(r"^[_.A-Za-z0-9-]{1,50}$").expect("Invalid login regex"))
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub login: String,
    pub email: String,
    pub password: String,
    pub language: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoginCommand {
    pub identifier: String,
    pub password: String,
    pub remember_me: bool,
    pub device: DeviceInfo,
}

#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access: SignedAccessToken,
    pub refresh: RefreshTokenIssued,
    pub session_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct LoginResult {
    pub user: UserRecord,
    pub tokens: TokenPair,
}

#[derive(Debug, Clone)]
pub enum ActivationOutcome {
    Activated(UserRecord),
    AlreadyActive(UserRecord),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub sessions: u64,
}

/// Identity established from a bearer access token whose session is still active.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub token_id: Uuid,
    pub login: String,
    pub authorities: Vec<String>,
}

impl AuthContext {
    pub fn is_admin(&self) -> bool {
        self.authorities.iter().any(|a| a == ADMIN_AUTHORITY)
    }
}

pub struct AuthService {
    config: AuthConfig,
    clock: Arc<dyn Clock>,
    users: Arc<dyn CredentialStore>,
    login_history: Arc<dyn LoginHistoryStore>,
    password_history: Arc<dyn PasswordHistoryStore>,
    passwords: PasswordService,
    jwt: JwtService,
    refresh_tokens: RefreshTokenLedger,
    sessions: SessionRegistry,
    verification: VerificationManager,
    lockout: LockoutPolicy,
    mailer: Arc<dyn Mailer>,
    deadline: StdDuration,
}

impl AuthService {
    pub fn new<S>(
        config: AuthConfig,
        store: Arc<S>,
        mailer: Arc<dyn Mailer>,
        clock: Arc<dyn Clock>,
    ) -> AuthResult<Self>
    where
        S: AuthStore + 'static,
    {
        let deadline = StdDuration::from_millis(config.store_timeout_ms);
        let passwords = PasswordService::from_config(&config)?;
        let jwt = JwtService::from_config(&config)?;
        let refresh_tokens = RefreshTokenLedger::new(
            store.clone(),
            Duration::seconds(config.refresh_token_ttl_secs),
            deadline,
        );
        let sessions =
            SessionRegistry::new(store.clone(), deadline, config.single_session_per_device);
        let verification = VerificationManager::new(store.clone(), deadline);
        let lockout = LockoutPolicy::new(
            config.lockout_threshold,
            Duration::seconds(config.lockout_duration_secs),
        );

        Ok(Self {
            users: store.clone(),
            login_history: store.clone(),
            password_history: store,
            config,
            clock,
            passwords,
            jwt,
            refresh_tokens,
            sessions,
            verification,
            lockout,
            mailer,
            deadline,
        })
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn passwords(&self) -> &PasswordService {
        &self.passwords
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn register(&self, account: NewAccount) -> AuthResult<UserRecord> {
        let login = account.login.trim().to_lowercase();
        let email = account.email.trim().to_lowercase();
        validate_login(&login)?;
        validate_email(&email)?;
        self.passwords.validate_strength(&account.password)?;

        if with_deadline(self.deadline, self.users.find_user_by_login(&login))
            .await?
            .is_some()
        {
            return Err(AuthError::LoginTaken);
        }
        if with_deadline(self.deadline, self.users.find_user_by_email(&email))
            .await?
            .is_some()
        {
            return Err(AuthError::EmailTaken);
        }

        let password_hash = self.passwords.hash_off_thread(&account.password).await?;
        let now = self.clock.now();
        let language = account
            .language
            .filter(|language| !language.trim().is_empty())
            .unwrap_or_else(|| "en".to_string());
        let mut user = UserRecord::pending(&login, &email, password_hash, &language, now);
        let token = VerificationManager::stamp(
            &mut user,
            VerificationKind::EmailVerify,
            Duration::seconds(self.config.email_verification_ttl_secs),
            now,
        );

        match with_deadline(self.deadline, self.users.insert_user(&user)).await {
            Ok(()) => {}
            Err(AuthError::Store(StoreError::Duplicate("login"))) => {
                return Err(AuthError::LoginTaken);
            }
            Err(AuthError::Store(StoreError::Duplicate(_))) => return Err(AuthError::EmailTaken),
            Err(err) => return Err(err),
        }

        self.record_password(&user, PasswordChangeReason::Registration, now)
            .await;
        log::info!("registered user {} ({})", user.login, user.id);

        self.send_mail(MailKind::Activation, &user, token).await;
        Ok(user)
    }

    pub async fn login(&self, command: LoginCommand) -> AuthResult<LoginResult> {
        let identifier = command.identifier.trim().to_lowercase();
        let Some(user) = with_deadline(
            self.deadline,
            self.users.find_user_by_login_or_email(&identifier),
        )
        .await?
        else {
            return Err(AuthError::InvalidCredentials);
        };

        let now = self.clock.now();
        if self.lockout.is_locked(user.account_locked_until, now) {
            self.record_login(&user, &identifier, &command.device, Some("account_locked"), now)
                .await;
            return Err(AuthError::AccountLocked);
        }
        if !user.activated {
            self.record_login(&user, &identifier, &command.device, Some("not_activated"), now)
                .await;
            return Err(AuthError::NotActivated);
        }

        let check = if self
            .passwords
            .verify_off_thread(&command.password, &user.password_hash)
            .await?
        {
            PasswordCheck::Matched
        } else {
            PasswordCheck::Mismatched
        };

        let ip_address = command.device.ip_address.clone();
        let (user, decision) = self
            .update_user(user.id, |record| {
                let decision = self.lockout.evaluate(
                    record.failed_login_attempts,
                    record.account_locked_until,
                    now,
                    check,
                );
                decision.apply(record);
                if decision == Decision::Reset {
                    record.last_login_at = Some(now);
                    record.last_login_ip = ip_address.clone();
                }
                record.last_modified_at = now;
                Ok(decision)
            })
            .await?;

        match decision {
            Decision::RejectLocked { .. } => {
                self.record_login(&user, &identifier, &command.device, Some("account_locked"), now)
                    .await;
                return Err(AuthError::AccountLocked);
            }
            Decision::Increment { .. } => {
                self.record_login(&user, &identifier, &command.device, Some("bad_credentials"), now)
                    .await;
                return Err(AuthError::InvalidCredentials);
            }
            Decision::Lock { failures, until } => {
                log::warn!(
                    "account {} locked until {} after {} failed logins",
                    user.id,
                    until,
                    failures
                );
                self.record_login(&user, &identifier, &command.device, Some("bad_credentials"), now)
                    .await;
                return Err(AuthError::InvalidCredentials);
            }
            Decision::Reset => {}
        }

        let session_id = Uuid::new_v4();
        let access = self.jwt.issue_access_token(
            &user.login,
            user.id,
            session_id,
            &user.authorities,
            command.remember_me,
            now,
        )?;
        let refresh = self
            .refresh_tokens
            .issue(user.id, None, &command.device, now)
            .await?;

        let session = SessionRecord {
            id: session_id,
            user_id: user.id,
            access_token_id: access.token_id,
            refresh_token_id: refresh.token_id,
            refresh_family_id: refresh.family_id,
            device: command.device.clone(),
            remember_me: command.remember_me,
            trusted_device: false,
            login_at: now,
            expires_at: refresh.expires_at,
            last_activity_at: now,
            status: SessionStatus::Active,
            logout_at: None,
            revoked_at: None,
            revoked_reason: None,
        };
        let (_, superseded) = self.sessions.create_session(session, now).await?;
        for previous in superseded {
            self.refresh_tokens
                .revoke_family(previous.refresh_family_id, REASON_SUPERSEDED, now)
                .await?;
        }

        self.record_login(&user, &identifier, &command.device, None, now)
            .await;
        log::info!("user {} logged in, session {}", user.id, session_id);

        Ok(LoginResult {
            user,
            tokens: TokenPair {
                access,
                refresh,
                session_id,
            },
        })
    }

    pub async fn refresh(&self, refresh_token: &str, device: &DeviceInfo) -> AuthResult<TokenPair> {
        let now = self.clock.now();
        let (previous, issued) = match self.refresh_tokens.redeem(refresh_token, device, now).await?
        {
            RedeemOutcome::Rotated { previous, issued } => (previous, issued),
            RedeemOutcome::Expired => return Err(AuthError::TokenExpired),
            RedeemOutcome::Invalid => return Err(AuthError::TokenInvalid),
            RedeemOutcome::ReuseDetected { user_id, .. } => {
                let sessions = self
                    .sessions
                    .revoke_all(user_id, REASON_REUSE, None, now)
                    .await?;
                let tokens = self
                    .refresh_tokens
                    .revoke_all_for_user(user_id, None, REASON_REUSE, now)
                    .await?;
                log::warn!(
                    "refresh token reuse for user {}: revoked {} sessions and {} tokens",
                    user_id,
                    sessions.len(),
                    tokens
                );
                return Err(AuthError::TokenReuseDetected { user_id });
            }
        };

        let session = match self.sessions.find_by_refresh_family(previous.family_id).await? {
            Some(session) => self.sessions.get_active(session.id, now).await?,
            None => None,
        };
        let Some(session) = session else {
            self.refresh_tokens
                .revoke_family(previous.family_id, REASON_ACCOUNT_UNAVAILABLE, now)
                .await?;
            return Err(AuthError::TokenInvalid);
        };

        let user = with_deadline(self.deadline, self.users.find_user(previous.user_id)).await?;
        let Some(user) = user.filter(|user| {
            user.activated
                && user.account_status != AccountStatus::Inactive
                && !self.lockout.is_locked(user.account_locked_until, now)
        }) else {
            self.sessions
                .revoke(session.id, REASON_ACCOUNT_UNAVAILABLE, now)
                .await?;
            self.refresh_tokens
                .revoke_family(previous.family_id, REASON_ACCOUNT_UNAVAILABLE, now)
                .await?;
            return Err(AuthError::TokenInvalid);
        };

        let access = self.jwt.issue_access_token(
            &user.login,
            user.id,
            session.id,
            &user.authorities,
            session.remember_me,
            now,
        )?;
        let rotated = self
            .sessions
            .rotate_tokens(
                session.id,
                access.token_id,
                issued.token_id,
                issued.expires_at,
                now,
            )
            .await?;
        if !rotated {
            self.refresh_tokens
                .revoke(issued.token_id, REASON_ACCOUNT_UNAVAILABLE, now)
                .await?;
            return Err(AuthError::TokenInvalid);
        }

        self.append_login_event(LoginHistoryRecord {
            id: Uuid::new_v4(),
            user_id: Some(user.id),
            identifier: user.login.clone(),
            login_at: now,
            method: LoginMethod::RefreshToken,
            ip_address: device.ip_address.clone(),
            user_agent: device.user_agent.clone(),
            device_type: session.device.device_type,
            successful: true,
            failure_reason: None,
        })
        .await;

        Ok(TokenPair {
            access,
            refresh: issued,
            session_id: session.id,
        })
    }

    /// Resolves a bearer token to the identity behind an active session.
    pub async fn authenticate(&self, bearer: &str) -> AuthResult<AuthContext> {
        let now = self.clock.now();
        let claims = self.jwt.decode_access_token(bearer, now)?;
        let Some(session) = self.sessions.get_active(claims.sid, now).await? else {
            return Err(AuthError::TokenInvalid);
        };
        if session.user_id != claims.uid || session.access_token_id != claims.jti {
            return Err(AuthError::TokenInvalid);
        }
        self.sessions.touch(session.id, now).await?;

        Ok(AuthContext {
            user_id: claims.uid,
            session_id: session.id,
            token_id: claims.jti,
            login: claims.sub,
            authorities: claims.auth,
        })
    }

    pub async fn logout(&self, ctx: &AuthContext) -> AuthResult<()> {
        let now = self.clock.now();
        let Some(session) = self.sessions.find(ctx.session_id).await? else {
            return Ok(());
        };
        if self.sessions.logout(session.id, now).await? {
            self.refresh_tokens
                .revoke(session.refresh_token_id, REASON_LOGOUT, now)
                .await?;
            log::info!("user {} logged out of session {}", ctx.user_id, session.id);
        }
        Ok(())
    }

    pub async fn activate(&self, key: &str) -> AuthResult<ActivationOutcome> {
        let now = self.clock.now();
        let Some(user) = self
            .verification
            .lookup(key, VerificationKind::EmailVerify)
            .await?
        else {
            return Err(AuthError::InvalidActivationKey);
        };

        if user.activated {
            self.verification
                .consume(key, VerificationKind::EmailVerify, now)
                .await?;
            return Ok(ActivationOutcome::AlreadyActive(user));
        }

        let outcome = self
            .verification
            .consume_with(key, VerificationKind::EmailVerify, now, |user| {
                user.activated = true;
                user.email_verified = true;
                if user.account_status == AccountStatus::PendingVerification {
                    user.account_status = AccountStatus::Active;
                }
            })
            .await?;

        match outcome {
            VerificationOutcome::Consumed(user) => {
                log::info!("activated user {}", user.id);
                Ok(ActivationOutcome::Activated(user))
            }
            VerificationOutcome::Expired => Err(AuthError::ActivationKeyExpired),
            VerificationOutcome::NotFound => Err(AuthError::InvalidActivationKey),
        }
    }

    /// Issues a fresh activation key for a pending account. Silent for unknown
    /// or already active addresses.
    pub async fn resend_activation(&self, email: &str) {
        if let Err(err) = self.try_resend_activation(email).await {
            log::error!("resend activation failed: {err}");
        }
    }

    async fn try_resend_activation(&self, email: &str) -> AuthResult<()> {
        let email = email.trim().to_lowercase();
        let Some(user) = with_deadline(self.deadline, self.users.find_user_by_email(&email)).await?
        else {
            log::debug!("activation resend requested for unknown address");
            return Ok(());
        };
        if user.activated || user.account_status != AccountStatus::PendingVerification {
            return Ok(());
        }

        let now = self.clock.now();
        let (token, user) = self
            .verification
            .issue(
                user.id,
                VerificationKind::EmailVerify,
                Duration::seconds(self.config.email_verification_ttl_secs),
                now,
            )
            .await?;
        self.send_mail(MailKind::Activation, &user, token).await;
        Ok(())
    }

    /// Always succeeds from the caller's point of view.
    pub async fn forgot_password(&self, email: &str) {
        if let Err(err) = self.try_forgot_password(email).await {
            log::error!("password reset request failed: {err}");
        }
    }

    async fn try_forgot_password(&self, email: &str) -> AuthResult<()> {
        let email = email.trim().to_lowercase();
        let Some(user) = with_deadline(self.deadline, self.users.find_user_by_email(&email)).await?
        else {
            log::debug!("password reset requested for unknown address");
            return Ok(());
        };
        if !user.activated {
            return Ok(());
        }

        let now = self.clock.now();
        let (token, user) = self
            .verification
            .issue(
                user.id,
                VerificationKind::PasswordReset,
                Duration::seconds(self.config.password_reset_ttl_secs),
                now,
            )
            .await?;
        log::info!("password reset issued for user {}", user.id);
        self.send_mail(MailKind::PasswordReset, &user, token).await;
        Ok(())
    }

    pub async fn reset_password(&self, token: &str, new_password: &str) -> AuthResult<()> {
        self.passwords.validate_strength(new_password)?;
        let Some(user) = self
            .verification
            .lookup(token, VerificationKind::PasswordReset)
            .await?
        else {
            return Err(AuthError::InvalidOrExpiredToken);
        };
        let now = self.clock.now();
        if user
            .password_reset_expires_at
            .is_none_or(|expires_at| now >= expires_at)
        {
            self.verification
                .consume(token, VerificationKind::PasswordReset, now)
                .await?;
            return Err(AuthError::InvalidOrExpiredToken);
        }

        self.ensure_not_recent(&user, new_password).await?;
        let password_hash = self.passwords.hash_off_thread(new_password).await?;

        let outcome = self
            .verification
            .consume_with(token, VerificationKind::PasswordReset, now, |user| {
                user.password_hash = password_hash.clone();
                user.failed_login_attempts = 0;
                user.account_locked_until = None;
                user.last_password_change_at = Some(now);
                if user.account_status == AccountStatus::Locked {
                    user.account_status = AccountStatus::Active;
                }
            })
            .await?;
        let user = match outcome {
            VerificationOutcome::Consumed(user) => user,
            VerificationOutcome::Expired | VerificationOutcome::NotFound => {
                return Err(AuthError::InvalidOrExpiredToken);
            }
        };

        self.revoke_everything(user.id, REASON_PASSWORD_RESET, None, now)
            .await?;
        self.record_password(&user, PasswordChangeReason::Reset, now)
            .await;
        log::info!("password reset completed for user {}", user.id);
        Ok(())
    }

    pub async fn change_password(
        &self,
        ctx: &AuthContext,
        current_password: &str,
        new_password: &str,
    ) -> AuthResult<()> {
        let Some(user) = with_deadline(self.deadline, self.users.find_user(ctx.user_id)).await?
        else {
            return Err(AuthError::Unauthorized);
        };
        if !self
            .passwords
            .verify_off_thread(current_password, &user.password_hash)
            .await?
        {
            return Err(AuthError::WrongCurrentPassword);
        }
        self.passwords.validate_strength(new_password)?;
        self.ensure_not_recent(&user, new_password).await?;

        let password_hash = self.passwords.hash_off_thread(new_password).await?;
        let now = self.clock.now();
        let (user, ()) = self
            .update_user(user.id, |record| {
                record.password_hash = password_hash.clone();
                record.failed_login_attempts = 0;
                record.last_password_change_at = Some(now);
                record.last_modified_at = now;
                Ok(())
            })
            .await?;

        self.revoke_everything(user.id, REASON_PASSWORD_CHANGE, Some(ctx.session_id), now)
            .await?;
        self.record_password(&user, PasswordChangeReason::Change, now)
            .await;
        log::info!("password changed for user {}", user.id);
        Ok(())
    }

    pub async fn current_user(&self, ctx: &AuthContext) -> AuthResult<UserRecord> {
        with_deadline(self.deadline, self.users.find_user(ctx.user_id))
            .await?
            .ok_or(AuthError::NotFound)
    }

    pub async fn list_sessions(&self, ctx: &AuthContext) -> AuthResult<Vec<SessionRecord>> {
        self.sessions
            .list_active(ctx.user_id, self.clock.now())
            .await
    }

    pub async fn revoke_session(&self, ctx: &AuthContext, session_id: Uuid) -> AuthResult<()> {
        let now = self.clock.now();
        let Some(session) = self
            .sessions
            .find(session_id)
            .await?
            .filter(|session| session.user_id == ctx.user_id)
        else {
            return Err(AuthError::NotFound);
        };
        if self
            .sessions
            .revoke(session.id, REASON_USER_REVOKED, now)
            .await?
        {
            self.refresh_tokens
                .revoke_family(session.refresh_family_id, REASON_USER_REVOKED, now)
                .await?;
        }
        Ok(())
    }

    pub async fn admin_unlock(&self, actor: &AuthContext, user_id: Uuid) -> AuthResult<UserRecord> {
        require_admin(actor)?;
        let now = self.clock.now();
        let (user, ()) = self
            .update_user(user_id, |record| {
                record.failed_login_attempts = 0;
                record.account_locked_until = None;
                if record.account_status == AccountStatus::Locked {
                    record.account_status = if record.activated {
                        AccountStatus::Active
                    } else {
                        AccountStatus::PendingVerification
                    };
                }
                record.last_modified_at = now;
                Ok(())
            })
            .await?;
        log::info!("admin {} unlocked user {}", actor.user_id, user.id);
        Ok(user)
    }

    pub async fn admin_activate(&self, actor: &AuthContext, user_id: Uuid) -> AuthResult<UserRecord> {
        require_admin(actor)?;
        let now = self.clock.now();
        let (user, ()) = self
            .update_user(user_id, |record| {
                record.activated = true;
                record.account_status = AccountStatus::Active;
                record.failed_login_attempts = 0;
                record.account_locked_until = None;
                record.set_verification_slot(VerificationKind::EmailVerify, None, None);
                record.last_modified_at = now;
                Ok(())
            })
            .await?;
        log::info!("admin {} activated user {}", actor.user_id, user.id);
        Ok(user)
    }

    pub async fn admin_deactivate(
        &self,
        actor: &AuthContext,
        user_id: Uuid,
    ) -> AuthResult<UserRecord> {
        require_admin(actor)?;
        let now = self.clock.now();
        let (user, ()) = self
            .update_user(user_id, |record| {
                record.activated = false;
                record.account_status = AccountStatus::Inactive;
                record.last_modified_at = now;
                Ok(())
            })
            .await?;
        self.revoke_everything(user.id, REASON_DEACTIVATED, None, now)
            .await?;
        log::info!("admin {} deactivated user {}", actor.user_id, user.id);
        Ok(user)
    }

    pub async fn admin_revoke_sessions(&self, actor: &AuthContext, user_id: Uuid) -> AuthResult<u64> {
        require_admin(actor)?;
        let now = self.clock.now();
        if with_deadline(self.deadline, self.users.find_user(user_id))
            .await?
            .is_none()
        {
            return Err(AuthError::NotFound);
        }
        let revoked = self
            .revoke_everything(user_id, REASON_ADMIN, None, now)
            .await?;
        log::info!(
            "admin {} revoked {} sessions of user {}",
            actor.user_id,
            revoked,
            user_id
        );
        Ok(revoked)
    }

    /// Deletes closed sessions that ended before the retention window.
    ///
    /// Refresh token rows are kept forever so a consumed token is always
    /// recognised as a replay.
    pub async fn purge_expired(&self) -> AuthResult<PurgeReport> {
        let cutoff = self.clock.now() - Duration::days(self.config.purge_retention_days);
        let report = PurgeReport {
            sessions: self.sessions.purge(cutoff).await?,
        };
        log::info!("purged {} sessions older than {}", report.sessions, cutoff);
        Ok(report)
    }

    pub async fn recent_logins(
        &self,
        ctx: &AuthContext,
        limit: usize,
    ) -> AuthResult<Vec<LoginHistoryRecord>> {
        with_deadline(
            self.deadline,
            self.login_history.recent_login_events(ctx.user_id, limit),
        )
        .await
    }

    /// Re-reads the user and applies `mutate` until the conditional write lands.
    async fn update_user<T, F>(&self, user_id: Uuid, mut mutate: F) -> AuthResult<(UserRecord, T)>
    where
        F: FnMut(&mut UserRecord) -> AuthResult<T> + Send,
        T: Send,
    {
        for attempt in 0..=MAX_CAS_RETRIES {
            let Some(mut user) = with_deadline(self.deadline, self.users.find_user(user_id)).await?
            else {
                return Err(AuthError::NotFound);
            };
            let outcome = mutate(&mut user)?;
            if let Some(stored) =
                with_deadline(self.deadline, self.users.update_user_if_version(&user)).await?
            {
                return Ok((stored, outcome));
            }
            log::debug!("version conflict updating user {user_id}, attempt {attempt}");
        }
        Err(AuthError::Conflict)
    }

    /// Revokes every session and refresh token of `user_id`, keeping `keep_session`.
    async fn revoke_everything(
        &self,
        user_id: Uuid,
        reason: &str,
        keep_session: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> AuthResult<u64> {
        let keep_family = match keep_session {
            Some(id) => self
                .sessions
                .find(id)
                .await?
                .map(|session| session.refresh_family_id),
            None => None,
        };
        let revoked = self
            .sessions
            .revoke_all(user_id, reason, keep_session, now)
            .await?;
        self.refresh_tokens
            .revoke_all_for_user(user_id, keep_family, reason, now)
            .await?;
        Ok(revoked.len() as u64)
    }

    async fn ensure_not_recent(&self, user: &UserRecord, candidate: &str) -> AuthResult<()> {
        let mut hashes = with_deadline(
            self.deadline,
            self.password_history
                .recent_password_hashes(user.id, self.config.password_history_depth),
        )
        .await?;
        if !hashes.contains(&user.password_hash) {
            hashes.push(user.password_hash.clone());
        }
        if self.passwords.matches_any_off_thread(candidate, hashes).await? {
            return Err(AuthError::PasswordReused);
        }
        Ok(())
    }

    async fn record_password(
        &self,
        user: &UserRecord,
        reason: PasswordChangeReason,
        now: DateTime<Utc>,
    ) {
        let entry = PasswordHistoryRecord {
            id: Uuid::new_v4(),
            user_id: user.id,
            password_hash: user.password_hash.clone(),
            changed_at: now,
            reason,
        };
        if let Err(err) = with_deadline(
            self.deadline,
            self.password_history.append_password_history(&entry),
        )
        .await
        {
            log::error!("failed to record password history for user {}: {err}", user.id);
        }
    }

    async fn record_login(
        &self,
        user: &UserRecord,
        identifier: &str,
        device: &DeviceInfo,
        failure_reason: Option<&str>,
        now: DateTime<Utc>,
    ) {
        self.append_login_event(LoginHistoryRecord {
            id: Uuid::new_v4(),
            user_id: Some(user.id),
            identifier: identifier.to_string(),
            login_at: now,
            method: LoginMethod::Password,
            ip_address: device.ip_address.clone(),
            user_agent: device.user_agent.clone(),
            device_type: device.device_type,
            successful: failure_reason.is_none(),
            failure_reason: failure_reason.map(str::to_string),
        })
        .await;
    }

    /// Login history is an audit trail; failing to write it never fails a login.
    async fn append_login_event(&self, event: LoginHistoryRecord) {
        if let Err(err) = with_deadline(
            self.deadline,
            self.login_history.append_login_event(&event),
        )
        .await
        {
            log::error!("failed to record login event for {}: {err}", event.identifier);
        }
    }

    async fn send_mail(&self, kind: MailKind, user: &UserRecord, token: String) {
        let message = MailMessage {
            kind,
            to: user.email.clone(),
            login: user.login.clone(),
            token,
            language: user.language.clone(),
        };
        if let Err(err) = self.mailer.send(message).await {
            log::warn!(
                "{} mail to user {} not delivered: {err}",
                kind.template(),
                user.id
            );
        }
    }
}

fn require_admin(actor: &AuthContext) -> AuthResult<()> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(AuthError::Forbidden)
    }
}

pub fn validate_login(login: &str) -> AuthResult<()> {
    if login_regex().is_match(login) {
        Ok(())
    } else {
        Err(AuthError::Validation(
            "login must be 1-50 characters of letters, digits, '_', '.' or '-'".into(),
        ))
    }
}

pub fn validate_email(email: &str) -> AuthResult<()> {
    let valid = email.len() <= 254
        && email
            .split_once('@')
            .is_some_and(|(local, domain)| {
                !local.is_empty() && !domain.is_empty() && !domain.contains('@')
            });
    if valid {
        Ok(())
    } else {
        Err(AuthError::Validation("email address is not valid".into()))
    }
}
