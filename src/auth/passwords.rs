use argon2::{
    Algorithm, Argon2, ParamsBuilder, PasswordHash, PasswordHasher, PasswordVerifier, Version,
    password_hash::SaltString,
};
use rand::RngCore;

use crate::auth::{AuthConfig, AuthError, AuthResult};

const SALT_LEN: usize = 16;

#[derive(Clone)]
pub struct PasswordService {
    argon2: Argon2<'static>,
    min_length: usize,
}

impl PasswordService {
    pub fn new() -> AuthResult<Self> {
        Self::with_params(19 * 1024, 2, 1, 8)
    }

    pub fn from_config(config: &AuthConfig) -> AuthResult<Self> {
        Self::with_params(
            config.argon2_memory_kib,
            config.argon2_iterations,
            config.argon2_parallelism,
            config.password_min_length,
        )
    }

    pub fn with_params(
        memory_kib: u32,
        iterations: u32,
        parallelism: u32,
        min_length: usize,
    ) -> AuthResult<Self> {
        let mut builder = ParamsBuilder::new();
        builder.m_cost(memory_kib);
        builder.t_cost(iterations);
        builder.p_cost(parallelism);
        let params = builder.build().map_err(AuthError::from)?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        Ok(Self { argon2, min_length })
    }

    pub fn validate_strength(&self, password: &str) -> AuthResult<()> {
        if password.chars().count() < self.min_length {
            return Err(AuthError::Validation(format!(
                "password must be at least {} characters long",
                self.min_length
            )));
        }
        Ok(())
    }

    pub fn hash_password(&self, password: &str) -> AuthResult<String> {
        let mut salt_bytes = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt_bytes);
        let salt = SaltString::encode_b64(&salt_bytes).map_err(AuthError::from)?;
        let hash = self
            .argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(AuthError::from)?
            .to_string();
        Ok(hash)
    }

    pub fn verify_password(&self, password: &str, encoded: &str) -> AuthResult<bool> {
        let parsed = PasswordHash::new(encoded)?;
        match self.argon2.verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(err) => Err(AuthError::from(err)),
        }
    }

    /// Hashes on the blocking pool so request-serving workers stay free.
    pub async fn hash_off_thread(&self, password: &str) -> AuthResult<String> {
        let service = self.clone();
        let password = password.to_owned();
        tokio::task::spawn_blocking(move || service.hash_password(&password)).await?
    }

    pub async fn verify_off_thread(&self, password: &str, encoded: &str) -> AuthResult<bool> {
        let service = self.clone();
        let password = password.to_owned();
        let encoded = encoded.to_owned();
        tokio::task::spawn_blocking(move || service.verify_password(&password, &encoded)).await?
    }

    /// True if `password` matches any of the given historical hashes.
    pub async fn matches_any_off_thread(
        &self,
        password: &str,
        hashes: Vec<String>,
    ) -> AuthResult<bool> {
        if hashes.is_empty() {
            return Ok(false);
        }
        let service = self.clone();
        let password = password.to_owned();
        tokio::task::spawn_blocking(move || {
            for hash in &hashes {
                if service.verify_password(&password, hash)? {
                    return Ok(true);
                }
            }
            Ok(false)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_and_verifies_passwords() {
        let service = PasswordService::new().expect("password service");
        let hash = service
            .hash_password("super-secret")
            .expect("hash generation");
        assert!(hash.starts_with("$argon2id$"));
        assert!(
            service
                .verify_password("super-secret", &hash)
                .expect("verify succeeds")
        );
        assert!(
            !service
                .verify_password("wrong-password", &hash)
                .expect("verify runs")
        );
    }

    #[test]
    fn enforces_minimum_length() {
        let service = PasswordService::with_params(1024, 1, 1, 8).expect("password service");
        assert!(matches!(
            service.validate_strength("short"),
            Err(AuthError::Validation(_))
        ));
        assert!(service.validate_strength("long-enough").is_ok());
    }

    #[tokio::test]
    async fn off_thread_helpers_match_history() {
        let service = PasswordService::with_params(1024, 1, 1, 8).expect("password service");
        let old = service.hash_off_thread("first-password").await.expect("hash");
        assert!(service.verify_off_thread("first-password", &old).await.expect("verify"));
        assert!(
            service
                .matches_any_off_thread("first-password", vec![old.clone()])
                .await
                .expect("history check")
        );
        assert!(
            !service
                .matches_any_off_thread("second-password", vec![old])
                .await
                .expect("history check")
        );
    }
}
