use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::auth::service::{LoginResult, TokenPair};
use crate::store::{AccountStatus, DeviceInfo, DeviceType, SessionRecord, UserRecord};

const TOKEN_TYPE: &str = "Bearer";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RegisterRequest {
    pub login: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RegisterResponse {
    pub id: String,
    pub status: AccountStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LoginRequest {
    /// Login or email address.
    #[serde(alias = "login", alias = "email")]
    pub username_or_email: String,
    pub password: String,
    #[serde(default)]
    pub remember_me: bool,
    /// Overrides device details derived from request headers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token_expires_at: DateTime<Utc>,
    pub session_id: String,
    pub authorities: Vec<String>,
    pub user: UserSummary,
}

impl From<LoginResult> for LoginResponse {
    fn from(result: LoginResult) -> Self {
        let LoginResult { user, tokens } = result;
        Self {
            access_token: tokens.access.token,
            refresh_token: tokens.refresh.token,
            token_type: TOKEN_TYPE.to_string(),
            expires_in: tokens.access.expires_in,
            access_token_expires_at: tokens.access.expires_at,
            refresh_token_expires_at: tokens.refresh.expires_at,
            session_id: tokens.session_id.to_string(),
            authorities: user.authorities.clone(),
            user: UserSummary::from(&user),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token_expires_at: DateTime<Utc>,
}

impl From<TokenPair> for RefreshResponse {
    fn from(tokens: TokenPair) -> Self {
        Self {
            access_token: tokens.access.token,
            refresh_token: tokens.refresh.token,
            token_type: TOKEN_TYPE.to_string(),
            expires_in: tokens.access.expires_in,
            access_token_expires_at: tokens.access.expires_at,
            refresh_token_expires_at: tokens.refresh.expires_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EmailRequest {
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub new_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UserSummary {
    pub id: String,
    pub login: String,
    pub email: String,
    pub activated: bool,
    pub email_verified: bool,
    pub account_status: AccountStatus,
    pub authorities: Vec<String>,
    pub language: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_login_at: Option<DateTime<Utc>>,
}

impl From<&UserRecord> for UserSummary {
    fn from(user: &UserRecord) -> Self {
        Self {
            id: user.id.to_string(),
            login: user.login.clone(),
            email: user.email.clone(),
            activated: user.activated,
            email_verified: user.email_verified,
            account_status: user.account_status,
            authorities: user.authorities.clone(),
            language: user.language.clone(),
            created_at: user.created_at,
            last_login_at: user.last_login_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionSummary {
    pub id: String,
    pub current: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type: Option<DeviceType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub remember_me: bool,
    pub login_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionSummary {
    pub fn new(session: &SessionRecord, current: bool) -> Self {
        Self {
            id: session.id.to_string(),
            current,
            device_name: session.device.device_name.clone(),
            device_type: session.device.device_type,
            ip_address: session.device.ip_address.clone(),
            user_agent: session.device.user_agent.clone(),
            remember_me: session.remember_me,
            login_at: session.login_at,
            last_activity_at: session.last_activity_at,
            expires_at: session.expires_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RevokedSessionsResponse {
    pub revoked: u64,
}
