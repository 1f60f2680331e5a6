use std::sync::OnceLock;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use regex::Regex;
use uuid::Uuid;

use crate::auth::{AuthConfig, AuthError, AuthResult};

static AUTHORITY_REGEX: OnceLock<Regex> = OnceLock::new();

fn authority_regex() -> &'static Regex {
    AUTHORITY_REGEX
        .get_or_init(|| Regex::new(r"^[A-Z][A-Z0-9_]*$").expect("Invalid authority regex"))
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AccessTokenClaims {
    /// Login of the authenticated user.
    pub sub: String,
    pub uid: Uuid,
    pub sid: Uuid,
    pub iss: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    pub jti: Uuid,
    pub auth: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SignedAccessToken {
    pub token: String,
    pub token_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub expires_in: i64,
}

pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    audience: String,
    access_token_ttl: Duration,
    remember_me_ttl: Duration,
    kid: Option<String>,
}

impl JwtService {
    pub fn from_config(config: &AuthConfig) -> AuthResult<Self> {
        if config.jwt_secret.len() < 32 {
            return Err(AuthError::Config(
                "jwt secret must be at least 32 bytes".into(),
            ));
        }
        let secret_bytes = config.jwt_secret.as_bytes();
        let encoding_key = EncodingKey::from_secret(secret_bytes);
        let decoding_key = DecodingKey::from_secret(secret_bytes);

        // Expiry is checked against the injected clock in `decode_access_token`.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[config.audience.clone()]);
        validation.set_issuer(&[config.issuer.clone()]);
        validation.validate_exp = false;
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        Ok(Self {
            encoding_key,
            decoding_key,
            validation,
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            access_token_ttl: Duration::seconds(config.access_token_ttl_secs),
            remember_me_ttl: Duration::seconds(config.remember_me_ttl_secs),
            kid: config.jwt_kid.clone(),
        })
    }

    pub fn validity_window(&self, remember_me: bool) -> Duration {
        if remember_me {
            self.remember_me_ttl
        } else {
            self.access_token_ttl
        }
    }

    pub fn issue_access_token(
        &self,
        subject: &str,
        user_id: Uuid,
        session_id: Uuid,
        authorities: &[String],
        remember_me: bool,
        now: DateTime<Utc>,
    ) -> AuthResult<SignedAccessToken> {
        validate_authorities(authorities)?;

        let window = self.validity_window(remember_me);
        let expires_at = now + window;
        let token_id = Uuid::new_v4();

        let mut header = Header::new(Algorithm::HS256);
        header.kid = self.kid.clone();

        let claims = AccessTokenClaims {
            sub: subject.to_string(),
            uid: user_id,
            sid: session_id,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
            jti: token_id,
            auth: authorities.to_vec(),
        };

        let token = encode(&header, &claims, &self.encoding_key)?;

        Ok(SignedAccessToken {
            token,
            token_id,
            expires_at,
            expires_in: window.num_seconds(),
        })
    }

    /// Verifies signature, issuer and audience, then expiry against `now`.
    pub fn decode_access_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<AccessTokenClaims> {
        let token_data = decode::<AccessTokenClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|_| AuthError::TokenInvalid)?;
        let claims = token_data.claims;
        if claims.exp <= now.timestamp() {
            return Err(AuthError::TokenExpired);
        }
        Ok(claims)
    }
}

pub fn validate_authorities(authorities: &[String]) -> AuthResult<()> {
    if authorities.is_empty() {
        return Err(AuthError::MalformedAuthorities(
            "at least one authority is required".into(),
        ));
    }
    if let Some(bad) = authorities.iter().find(|a| !authority_regex().is_match(a)) {
        return Err(AuthError::MalformedAuthorities(format!(
            "'{bad}' is not a valid authority"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_config;

    fn authorities() -> Vec<String> {
        vec!["ROLE_USER".to_string()]
    }

    #[test]
    fn issues_and_decodes_access_tokens() {
        let service = JwtService::from_config(&test_config()).expect("jwt service");
        let now = Utc::now();
        let user_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();

        let token = service
            .issue_access_token("alice", user_id, session_id, &authorities(), false, now)
            .expect("issue token");
        let claims = service
            .decode_access_token(&token.token, now)
            .expect("decode token");

        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.uid, user_id);
        assert_eq!(claims.sid, session_id);
        assert_eq!(claims.jti, token.token_id);
        assert_eq!(claims.auth, authorities());
        assert_eq!(token.expires_in, 900);
    }

    #[test]
    fn remember_me_selects_the_extended_window() {
        let service = JwtService::from_config(&test_config()).expect("jwt service");
        let now = Utc::now();
        let short = service
            .issue_access_token("alice", Uuid::new_v4(), Uuid::new_v4(), &authorities(), false, now)
            .expect("short token");
        let long = service
            .issue_access_token("alice", Uuid::new_v4(), Uuid::new_v4(), &authorities(), true, now)
            .expect("long token");
        assert!(long.expires_in > short.expires_in);
        assert_eq!(long.expires_in, 7 * 24 * 60 * 60);
    }

    #[test]
    fn expired_tokens_are_rejected_against_the_given_clock() {
        let service = JwtService::from_config(&test_config()).expect("jwt service");
        let now = Utc::now();
        let token = service
            .issue_access_token("alice", Uuid::new_v4(), Uuid::new_v4(), &authorities(), false, now)
            .expect("issue token");
        let later = now + Duration::seconds(901);
        assert!(matches!(
            service.decode_access_token(&token.token, later),
            Err(AuthError::TokenExpired)
        ));
    }

    #[test]
    fn tampered_tokens_are_invalid() {
        let service = JwtService::from_config(&test_config()).expect("jwt service");
        let now = Utc::now();
        let token = service
            .issue_access_token("alice", Uuid::new_v4(), Uuid::new_v4(), &authorities(), false, now)
            .expect("issue token");
        let mut tampered = token.token.clone();
        tampered.push('x');
        assert!(matches!(
            service.decode_access_token(&tampered, now),
            Err(AuthError::TokenInvalid)
        ));
    }

    #[test]
    fn malformed_authorities_are_rejected_locally() {
        assert!(validate_authorities(&[]).is_err());
        assert!(validate_authorities(&["role_user".to_string()]).is_err());
        assert!(validate_authorities(&["ROLE USER".to_string()]).is_err());
        assert!(validate_authorities(&["ROLE_ADMIN".to_string(), "ROLE_USER".to_string()]).is_ok());
    }
}
