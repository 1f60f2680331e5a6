use crate::auth::{AuthError, AuthResult};

const MIN_SECRET_LEN: usize = 32;
const MAX_WINDOW_SECS: i64 = 10 * 365 * 24 * 60 * 60;
const MAX_RETENTION_DAYS: i64 = 10 * 365;
const MAX_STORE_TIMEOUT_MS: i64 = 10 * 60 * 1000;
const MAX_SMALL_KNOB: i64 = 1024;
const MAX_ARGON2_MEMORY_KIB: i64 = 4 * 1024 * 1024;

/// Authentication configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub issuer: String,
    pub audience: String,
    pub jwt_secret: String,
    pub jwt_kid: Option<String>,
    pub access_token_ttl_secs: i64,
    pub remember_me_ttl_secs: i64,
    pub refresh_token_ttl_secs: i64,
    pub lockout_threshold: i32,
    pub lockout_duration_secs: i64,
    pub email_verification_ttl_secs: i64,
    pub password_reset_ttl_secs: i64,
    pub store_timeout_ms: u64,
    pub single_session_per_device: bool,
    pub password_min_length: usize,
    pub password_history_depth: usize,
    pub purge_retention_days: i64,
    pub argon2_memory_kib: u32,
    pub argon2_iterations: u32,
    pub argon2_parallelism: u32,
}

impl AuthConfig {
    pub fn from_env() -> AuthResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup so tests do not
    /// need to touch the process environment.
    pub fn from_lookup<F>(lookup: F) -> AuthResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |key: &str, default: i64, max: i64| -> AuthResult<i64> {
            match lookup(key) {
                Some(value) => value
                    .trim()
                    .parse::<i64>()
                    .ok()
                    .filter(|v| (1..=max).contains(v))
                    .ok_or_else(|| {
                        AuthError::Config(format!("{key} must be an integer between 1 and {max}"))
                    }),
                None => Ok(default),
            }
        };
        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
                .unwrap_or(default)
        };

        let jwt_secret = lookup("AUTH_JWT_SECRET")
            .ok_or_else(|| AuthError::Config("AUTH_JWT_SECRET is required".into()))?;
        if jwt_secret.len() < MIN_SECRET_LEN {
            return Err(AuthError::Config(format!(
                "AUTH_JWT_SECRET must be at least {MIN_SECRET_LEN} bytes"
            )));
        }

        let config = Self {
            issuer: lookup("AUTH_JWT_ISSUER").unwrap_or_else(|| "http://localhost".into()),
            audience: lookup("AUTH_JWT_AUDIENCE").unwrap_or_else(|| "auth-api".into()),
            jwt_secret,
            jwt_kid: lookup("AUTH_JWT_KID"),
            access_token_ttl_secs: number("AUTH_ACCESS_TOKEN_TTL_SECS", 15 * 60, MAX_WINDOW_SECS)?,
            remember_me_ttl_secs: number(
                "AUTH_REMEMBER_ME_TTL_SECS",
                7 * 24 * 60 * 60,
                MAX_WINDOW_SECS,
            )?,
            refresh_token_ttl_secs: number(
                "AUTH_REFRESH_TOKEN_TTL_SECS",
                30 * 24 * 60 * 60,
                MAX_WINDOW_SECS,
            )?,
            lockout_threshold: narrow(
                "AUTH_LOCKOUT_THRESHOLD",
                number("AUTH_LOCKOUT_THRESHOLD", 5, MAX_SMALL_KNOB)?,
            )?,
            lockout_duration_secs: number("AUTH_LOCKOUT_DURATION_SECS", 30 * 60, MAX_WINDOW_SECS)?,
            email_verification_ttl_secs: number(
                "AUTH_EMAIL_VERIFICATION_TTL_SECS",
                24 * 60 * 60,
                MAX_WINDOW_SECS,
            )?,
            password_reset_ttl_secs: number(
                "AUTH_PASSWORD_RESET_TTL_SECS",
                60 * 60,
                MAX_WINDOW_SECS,
            )?,
            store_timeout_ms: narrow(
                "AUTH_STORE_TIMEOUT_MS",
                number("AUTH_STORE_TIMEOUT_MS", 5_000, MAX_STORE_TIMEOUT_MS)?,
            )?,
            single_session_per_device: flag("AUTH_SINGLE_SESSION_PER_DEVICE", true),
            password_min_length: narrow(
                "AUTH_PASSWORD_MIN_LENGTH",
                number("AUTH_PASSWORD_MIN_LENGTH", 8, MAX_SMALL_KNOB)?,
            )?,
            password_history_depth: narrow(
                "AUTH_PASSWORD_HISTORY_DEPTH",
                number("AUTH_PASSWORD_HISTORY_DEPTH", 3, MAX_SMALL_KNOB)?,
            )?,
            purge_retention_days: number("AUTH_PURGE_RETENTION_DAYS", 30, MAX_RETENTION_DAYS)?,
            argon2_memory_kib: narrow(
                "AUTH_ARGON2_MEMORY_KIB",
                number("AUTH_ARGON2_MEMORY_KIB", 19 * 1024, MAX_ARGON2_MEMORY_KIB)?,
            )?,
            argon2_iterations: narrow(
                "AUTH_ARGON2_ITERATIONS",
                number("AUTH_ARGON2_ITERATIONS", 2, MAX_SMALL_KNOB)?,
            )?,
            argon2_parallelism: narrow(
                "AUTH_ARGON2_PARALLELISM",
                number("AUTH_ARGON2_PARALLELISM", 1, MAX_SMALL_KNOB)?,
            )?,
        };

        if config.refresh_token_ttl_secs <= config.remember_me_ttl_secs {
            return Err(AuthError::Config(
                "AUTH_REFRESH_TOKEN_TTL_SECS must exceed AUTH_REMEMBER_ME_TTL_SECS".into(),
            ));
        }

        Ok(config)
    }
}

fn narrow<T: TryFrom<i64>>(key: &str, value: i64) -> AuthResult<T> {
    T::try_from(value).map_err(|_| AuthError::Config(format!("{key} is out of range")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn applies_defaults() {
        let config = AuthConfig::from_lookup(lookup(&[("AUTH_JWT_SECRET", SECRET)]))
            .expect("config loads");
        assert_eq!(config.lockout_threshold, 5);
        assert_eq!(config.lockout_duration_secs, 1800);
        assert_eq!(config.email_verification_ttl_secs, 86_400);
        assert_eq!(config.password_reset_ttl_secs, 3_600);
        assert!(config.single_session_per_device);
    }

    #[test]
    fn missing_or_short_secret_is_fatal() {
        assert!(matches!(
            AuthConfig::from_lookup(lookup(&[])),
            Err(AuthError::Config(_))
        ));
        assert!(matches!(
            AuthConfig::from_lookup(lookup(&[("AUTH_JWT_SECRET", "short")])),
            Err(AuthError::Config(_))
        ));
    }

    #[test]
    fn rejects_refresh_window_shorter_than_remember_me() {
        let result = AuthConfig::from_lookup(lookup(&[
            ("AUTH_JWT_SECRET", SECRET),
            ("AUTH_REFRESH_TOKEN_TTL_SECS", "60"),
        ]));
        assert!(matches!(result, Err(AuthError::Config(_))));
    }

    #[test]
    fn parses_flags_and_overrides() {
        let config = AuthConfig::from_lookup(lookup(&[
            ("AUTH_JWT_SECRET", SECRET),
            ("AUTH_SINGLE_SESSION_PER_DEVICE", "off"),
            ("AUTH_LOCKOUT_THRESHOLD", "3"),
        ]))
        .expect("config loads");
        assert!(!config.single_session_per_device);
        assert_eq!(config.lockout_threshold, 3);
    }

    #[test]
    fn rejects_values_that_would_overflow() {
        for (key, value) in [
            ("AUTH_LOCKOUT_THRESHOLD", "4294967301"),
            ("AUTH_ACCESS_TOKEN_TTL_SECS", "9223372036854775807"),
            ("AUTH_STORE_TIMEOUT_MS", "999999999999"),
            ("AUTH_ARGON2_MEMORY_KIB", "8589934592"),
        ] {
            let result = AuthConfig::from_lookup(lookup(&[("AUTH_JWT_SECRET", SECRET), (key, value)]));
            assert!(matches!(result, Err(AuthError::Config(_))), "{key}={value} accepted");
        }
    }
}
