//! Plain records persisted by the credential, session and refresh-token stores.

use chrono::{DateTime, Utc};
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::StoreError;

pub const DEFAULT_AUTHORITY: &str = "ROLE_USER";
pub const ADMIN_AUTHORITY: &str = "ROLE_ADMIN";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    PendingVerification,
    Active,
    Inactive,
    Locked,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::PendingVerification => "PENDING_VERIFICATION",
            AccountStatus::Active => "ACTIVE",
            AccountStatus::Inactive => "INACTIVE",
            AccountStatus::Locked => "LOCKED",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "PENDING_VERIFICATION" => Ok(AccountStatus::PendingVerification),
            "ACTIVE" => Ok(AccountStatus::Active),
            "INACTIVE" => Ok(AccountStatus::Inactive),
            "LOCKED" => Ok(AccountStatus::Locked),
            other => Err(StoreError::Corrupt(format!("unknown account status '{other}'"))),
        }
    }
}

/// Which single-use token slot on the user record a token lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationKind {
    EmailVerify,
    PasswordReset,
}

impl VerificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationKind::EmailVerify => "email_verify",
            VerificationKind::PasswordReset => "password_reset",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub id: Uuid,
    pub login: String,
    pub email: String,
    pub password_hash: String,
    pub activated: bool,
    pub account_status: AccountStatus,
    pub email_verified: bool,
    pub failed_login_attempts: i32,
    pub account_locked_until: Option<DateTime<Utc>>,
    pub email_verification_token: Option<String>,
    pub email_verification_expires_at: Option<DateTime<Utc>>,
    pub password_reset_token: Option<String>,
    pub password_reset_expires_at: Option<DateTime<Utc>>,
    pub authorities: Vec<String>,
    pub language: String,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub last_login_ip: Option<String>,
    pub last_password_change_at: Option<DateTime<Utc>>,
    /// Bumped by the store on every successful conditional update.
    pub version: i64,
}

impl UserRecord {
    /// A freshly registered, not yet activated account.
    pub fn pending(
        login: &str,
        email: &str,
        password_hash: String,
        language: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            login: login.to_lowercase(),
            email: email.to_lowercase(),
            password_hash,
            activated: false,
            account_status: AccountStatus::PendingVerification,
            email_verified: false,
            failed_login_attempts: 0,
            account_locked_until: None,
            email_verification_token: None,
            email_verification_expires_at: None,
            password_reset_token: None,
            password_reset_expires_at: None,
            authorities: vec![DEFAULT_AUTHORITY.to_string()],
            language: language.to_string(),
            created_at: now,
            last_modified_at: now,
            last_login_at: None,
            last_login_ip: None,
            last_password_change_at: Some(now),
            version: 0,
        }
    }

    pub fn verification_slot(&self, kind: VerificationKind) -> (Option<&str>, Option<DateTime<Utc>>) {
        match kind {
            VerificationKind::EmailVerify => (
                self.email_verification_token.as_deref(),
                self.email_verification_expires_at,
            ),
            VerificationKind::PasswordReset => (
                self.password_reset_token.as_deref(),
                self.password_reset_expires_at,
            ),
        }
    }

    pub fn set_verification_slot(
        &mut self,
        kind: VerificationKind,
        token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) {
        match kind {
            VerificationKind::EmailVerify => {
                self.email_verification_token = token;
                self.email_verification_expires_at = expires_at;
            }
            VerificationKind::PasswordReset => {
                self.password_reset_token = token;
                self.password_reset_expires_at = expires_at;
            }
        }
    }

    pub fn is_admin(&self) -> bool {
        self.authorities.iter().any(|a| a == ADMIN_AUTHORITY)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceType {
    Web,
    MobileIos,
    MobileAndroid,
    Tablet,
    DesktopApp,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Web => "WEB",
            DeviceType::MobileIos => "MOBILE_IOS",
            DeviceType::MobileAndroid => "MOBILE_ANDROID",
            DeviceType::Tablet => "TABLET",
            DeviceType::DesktopApp => "DESKTOP_APP",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "WEB" => Ok(DeviceType::Web),
            "MOBILE_IOS" => Ok(DeviceType::MobileIos),
            "MOBILE_ANDROID" => Ok(DeviceType::MobileAndroid),
            "TABLET" => Ok(DeviceType::Tablet),
            "DESKTOP_APP" => Ok(DeviceType::DesktopApp),
            other => Err(StoreError::Corrupt(format!("unknown device type '{other}'"))),
        }
    }
}

/// Client device metadata captured at login and carried through rotation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DeviceInfo {
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub device_type: Option<DeviceType>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub browser_name: Option<String>,
    pub browser_version: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    /// Id of the first token of the rotation chain this token belongs to.
    pub family_id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_reason: Option<String>,
    pub replaced_by: Option<Uuid>,
    pub device_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl RefreshTokenRecord {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && self.used_at.is_none() && now < self.expires_at
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Expired,
    Revoked,
    LoggedOut,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Expired => "EXPIRED",
            SessionStatus::Revoked => "REVOKED",
            SessionStatus::LoggedOut => "LOGGED_OUT",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "ACTIVE" => Ok(SessionStatus::Active),
            "EXPIRED" => Ok(SessionStatus::Expired),
            "REVOKED" => Ok(SessionStatus::Revoked),
            "LOGGED_OUT" => Ok(SessionStatus::LoggedOut),
            other => Err(StoreError::Corrupt(format!("unknown session status '{other}'"))),
        }
    }
}

/// Terminal transition applied to an `Active` session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionClose {
    Expired,
    LoggedOut,
    Revoked(String),
}

impl SessionClose {
    pub fn status(&self) -> SessionStatus {
        match self {
            SessionClose::Expired => SessionStatus::Expired,
            SessionClose::LoggedOut => SessionStatus::LoggedOut,
            SessionClose::Revoked(_) => SessionStatus::Revoked,
        }
    }

    /// Applies the transition to an in-memory copy of the session.
    pub fn apply(&self, session: &mut SessionRecord, now: DateTime<Utc>) {
        session.status = self.status();
        match self {
            SessionClose::Expired => {}
            SessionClose::LoggedOut => session.logout_at = Some(now),
            SessionClose::Revoked(reason) => {
                session.revoked_at = Some(now);
                session.revoked_reason = Some(reason.clone());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    /// `jti` of the most recent access token minted for this session.
    pub access_token_id: Uuid,
    pub refresh_token_id: Uuid,
    pub refresh_family_id: Uuid,
    pub device: DeviceInfo,
    pub remember_me: bool,
    pub trusted_device: bool,
    pub login_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub logout_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoginMethod {
    Password,
    RefreshToken,
}

impl LoginMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginMethod::Password => "PASSWORD",
            LoginMethod::RefreshToken => "REFRESH_TOKEN",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "PASSWORD" => Ok(LoginMethod::Password),
            "REFRESH_TOKEN" => Ok(LoginMethod::RefreshToken),
            other => Err(StoreError::Corrupt(format!("unknown login method '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoginHistoryRecord {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub identifier: String,
    pub login_at: DateTime<Utc>,
    pub method: LoginMethod,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub device_type: Option<DeviceType>,
    pub successful: bool,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordChangeReason {
    Registration,
    Reset,
    Change,
    Admin,
}

impl PasswordChangeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PasswordChangeReason::Registration => "registration",
            PasswordChangeReason::Reset => "reset",
            PasswordChangeReason::Change => "change",
            PasswordChangeReason::Admin => "admin",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "registration" => Ok(PasswordChangeReason::Registration),
            "reset" => Ok(PasswordChangeReason::Reset),
            "change" => Ok(PasswordChangeReason::Change),
            "admin" => Ok(PasswordChangeReason::Admin),
            other => Err(StoreError::Corrupt(format!(
                "unknown password change reason '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PasswordHistoryRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub password_hash: String,
    pub changed_at: DateTime<Utc>,
    pub reason: PasswordChangeReason,
}
