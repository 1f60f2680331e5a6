use rocket::http::Status;
use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("account locked")]
    AccountLocked,
    #[error("account not activated")]
    NotActivated,
    #[error("token expired")]
    TokenExpired,
    #[error("token invalid")]
    TokenInvalid,
    #[error("token reuse detected")]
    TokenReuseDetected { user_id: Uuid },
    #[error("login already in use")]
    LoginTaken,
    #[error("email already in use")]
    EmailTaken,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("current password is incorrect")]
    WrongCurrentPassword,
    #[error("password was used recently")]
    PasswordReused,
    #[error("invalid or expired token")]
    InvalidOrExpiredToken,
    #[error("invalid activation key")]
    InvalidActivationKey,
    #[error("activation key expired")]
    ActivationKeyExpired,
    #[error("malformed authorities: {0}")]
    MalformedAuthorities(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("storage timed out")]
    StoreTimeout,
    #[error("concurrent update conflict")]
    Conflict,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("jwt error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("argon2 parameter error: {0}")]
    Argon2(String),
    #[error("password hashing error: {0}")]
    PasswordHash(String),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl AuthError {
    pub fn status(&self) -> Status {
        match self {
            AuthError::InvalidCredentials => Status::Unauthorized,
            AuthError::AccountLocked | AuthError::NotActivated => Status::Forbidden,
            AuthError::TokenExpired
            | AuthError::TokenInvalid
            | AuthError::TokenReuseDetected { .. } => Status::Unauthorized,
            AuthError::LoginTaken
            | AuthError::EmailTaken
            | AuthError::Validation(_)
            | AuthError::WrongCurrentPassword
            | AuthError::PasswordReused
            | AuthError::InvalidOrExpiredToken
            | AuthError::InvalidActivationKey
            | AuthError::ActivationKeyExpired => Status::BadRequest,
            AuthError::Unauthorized => Status::Unauthorized,
            AuthError::Forbidden => Status::Forbidden,
            AuthError::NotFound => Status::NotFound,
            AuthError::StoreTimeout | AuthError::Conflict => Status::ServiceUnavailable,
            AuthError::MalformedAuthorities(_)
            | AuthError::Config(_)
            | AuthError::Store(_)
            | AuthError::Jwt(_)
            | AuthError::Argon2(_)
            | AuthError::PasswordHash(_)
            | AuthError::Task(_) => Status::InternalServerError,
        }
    }

    /// Message safe to hand to a client. Reuse detection is reported as a plain
    /// invalid token and infrastructure faults never echo their internals.
    pub fn public_message(&self) -> String {
        match self {
            AuthError::TokenReuseDetected { .. } => AuthError::TokenInvalid.to_string(),
            AuthError::StoreTimeout | AuthError::Conflict => {
                "service temporarily unavailable".to_string()
            }
            err if err.status() == Status::InternalServerError => {
                "internal server error".to_string()
            }
            err => err.to_string(),
        }
    }

    /// Infrastructure faults as opposed to expected authentication outcomes.
    pub fn is_internal(&self) -> bool {
        self.status().code >= 500
    }
}

impl From<argon2::Error> for AuthError {
    fn from(err: argon2::Error) -> Self {
        AuthError::Argon2(err.to_string())
    }
}

impl From<argon2::password_hash::Error> for AuthError {
    fn from(err: argon2::password_hash::Error) -> Self {
        AuthError::PasswordHash(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuse_detection_is_indistinguishable_from_an_invalid_token() {
        let reuse = AuthError::TokenReuseDetected {
            user_id: Uuid::new_v4(),
        };
        assert_eq!(reuse.status(), AuthError::TokenInvalid.status());
        assert_eq!(reuse.public_message(), AuthError::TokenInvalid.public_message());
    }

    #[test]
    fn storage_timeouts_are_not_authentication_failures() {
        let err = AuthError::StoreTimeout;
        assert_eq!(err.status(), Status::ServiceUnavailable);
        assert_ne!(err.status(), AuthError::InvalidCredentials.status());
        assert!(err.is_internal());
    }
}
