//! Refresh-token ledger: issuance, single-use rotation and reuse detection.
//!
//! A plaintext refresh token is `"{id}.{secret}"`. Only a salted SHA-512 of the
//! secret is stored. Every token belongs to a family (the id of the first token
//! in its rotation chain) so a replayed token can take down its whole lineage
//! with one update.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use sha2::{Digest, Sha512};
use uuid::Uuid;

use crate::auth::{AuthResult, with_deadline};
use crate::store::{DeviceInfo, RefreshTokenRecord, RefreshTokenStore};

const SECRET_LEN: usize = 32;
const SALT_LEN: usize = 16;

pub const REASON_REUSE: &str = "reuse_detected";
pub const REASON_LOGOUT: &str = "logout";

#[derive(Debug, Clone)]
pub struct RefreshTokenIssued {
    pub token_id: Uuid,
    pub family_id: Uuid,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum RedeemOutcome {
    Rotated {
        previous: RefreshTokenRecord,
        issued: RefreshTokenIssued,
    },
    Expired,
    /// A used or revoked token was presented; its family is now revoked.
    ReuseDetected { user_id: Uuid, family_id: Uuid },
    Invalid,
}

pub struct RefreshTokenLedger {
    store: Arc<dyn RefreshTokenStore>,
    ttl: Duration,
    deadline: StdDuration,
}

impl RefreshTokenLedger {
    pub fn new(store: Arc<dyn RefreshTokenStore>, ttl: Duration, deadline: StdDuration) -> Self {
        Self {
            store,
            ttl,
            deadline,
        }
    }

    /// Issues a token. `family_id` of `None` starts a new rotation chain.
    pub async fn issue(
        &self,
        user_id: Uuid,
        family_id: Option<Uuid>,
        device: &DeviceInfo,
        now: DateTime<Utc>,
    ) -> AuthResult<RefreshTokenIssued> {
        self.issue_with_id(Uuid::new_v4(), user_id, family_id, device, now)
            .await
    }

    async fn issue_with_id(
        &self,
        token_id: Uuid,
        user_id: Uuid,
        family_id: Option<Uuid>,
        device: &DeviceInfo,
        now: DateTime<Utc>,
    ) -> AuthResult<RefreshTokenIssued> {
        let secret = generate_secret();
        let salt = generate_salt();
        let hashed_token = hash_secret(&secret, &salt);
        let expires_at = now + self.ttl;
        let family_id = family_id.unwrap_or(token_id);

        let record = RefreshTokenRecord {
            id: token_id,
            family_id,
            user_id,
            token_hash: encode_hash(&salt, &hashed_token),
            created_at: now,
            expires_at,
            used_at: None,
            revoked: false,
            revoked_at: None,
            revoked_reason: None,
            replaced_by: None,
            device_id: device.device_id.clone(),
            ip_address: device.ip_address.clone(),
            user_agent: device.user_agent.clone(),
        };
        with_deadline(self.deadline, self.store.insert_refresh_token(&record)).await?;

        Ok(RefreshTokenIssued {
            token_id,
            family_id,
            token: format!("{}.{}", token_id, secret),
            expires_at,
        })
    }

    /// Exchanges a refresh token for its successor.
    pub async fn redeem(
        &self,
        plain_token: &str,
        device: &DeviceInfo,
        now: DateTime<Utc>,
    ) -> AuthResult<RedeemOutcome> {
        let Some(record) = self.lookup(plain_token).await? else {
            return Ok(RedeemOutcome::Invalid);
        };

        if record.revoked || record.used_at.is_some() {
            return self.reuse_detected(&record, now).await;
        }

        if now >= record.expires_at {
            return Ok(RedeemOutcome::Expired);
        }

        let successor_id = Uuid::new_v4();
        let consumed = with_deadline(
            self.deadline,
            self.store
                .mark_refresh_token_used(record.id, successor_id, now),
        )
        .await?;
        if !consumed {
            // Another redemption won the race; this presentation is a replay.
            return self.reuse_detected(&record, now).await;
        }

        let device = merge_device(device, &record);
        let issued = self
            .issue_with_id(
                successor_id,
                record.user_id,
                Some(record.family_id),
                &device,
                now,
            )
            .await?;

        // A concurrent replay may have revoked the family before the successor
        // existed; the successor must not outlive that revocation.
        let current =
            with_deadline(self.deadline, self.store.find_refresh_token(record.id)).await?;
        if current.is_none_or(|current| current.revoked) {
            self.revoke(issued.token_id, REASON_REUSE, now).await?;
            return Ok(RedeemOutcome::ReuseDetected {
                user_id: record.user_id,
                family_id: record.family_id,
            });
        }

        let mut previous = record;
        previous.used_at = Some(now);
        previous.replaced_by = Some(successor_id);

        Ok(RedeemOutcome::Rotated { previous, issued })
    }

    /// Parses and authenticates a plaintext token without changing it.
    pub async fn lookup(&self, plain_token: &str) -> AuthResult<Option<RefreshTokenRecord>> {
        let Some(parsed) = ParsedRefreshToken::parse(plain_token) else {
            return Ok(None);
        };
        let record =
            with_deadline(self.deadline, self.store.find_refresh_token(parsed.token_id)).await?;
        Ok(record.filter(|record| verify_secret(&parsed.secret, &record.token_hash)))
    }

    pub async fn revoke(&self, token_id: Uuid, reason: &str, now: DateTime<Utc>) -> AuthResult<bool> {
        with_deadline(
            self.deadline,
            self.store.revoke_refresh_token(token_id, reason, now),
        )
        .await
    }

    pub async fn revoke_family(
        &self,
        family_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<u64> {
        with_deadline(
            self.deadline,
            self.store.revoke_refresh_family(family_id, reason, now),
        )
        .await
    }

    pub async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        except_family: Option<Uuid>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<u64> {
        with_deadline(
            self.deadline,
            self.store
                .revoke_refresh_tokens_for_user(user_id, except_family, reason, now),
        )
        .await
    }

    async fn reuse_detected(
        &self,
        record: &RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> AuthResult<RedeemOutcome> {
        let revoked = self.revoke_family(record.family_id, REASON_REUSE, now).await?;
        log::warn!(
            "refresh token reuse detected: user_id={} family_id={} revoked={}",
            record.user_id,
            record.family_id,
            revoked
        );
        Ok(RedeemOutcome::ReuseDetected {
            user_id: record.user_id,
            family_id: record.family_id,
        })
    }
}

fn merge_device(presented: &DeviceInfo, record: &RefreshTokenRecord) -> DeviceInfo {
    DeviceInfo {
        device_id: presented.device_id.clone().or_else(|| record.device_id.clone()),
        ip_address: presented
            .ip_address
            .clone()
            .or_else(|| record.ip_address.clone()),
        user_agent: presented
            .user_agent
            .clone()
            .or_else(|| record.user_agent.clone()),
        ..presented.clone()
    }
}

#[derive(Debug)]
struct ParsedRefreshToken {
    token_id: Uuid,
    secret: String,
}

impl ParsedRefreshToken {
    fn parse(token: &str) -> Option<Self> {
        let (id, secret) = token.split_once('.')?;
        let token_id = id.parse::<Uuid>().ok()?;
        if secret.is_empty() {
            return None;
        }
        Some(Self {
            token_id,
            secret: secret.to_string(),
        })
    }
}

fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD_NO_PAD.encode(bytes)
}

fn generate_salt() -> [u8; SALT_LEN] {
    let mut bytes = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

fn hash_secret(secret: &str, salt: &[u8]) -> Vec<u8> {
    let mut hasher = Sha512::new();
    hasher.update(salt);
    hasher.update(secret.as_bytes());
    hasher.finalize().to_vec()
}

fn encode_hash(salt: &[u8], hash: &[u8]) -> String {
    let salt_b64 = STANDARD_NO_PAD.encode(salt);
    let hash_b64 = STANDARD_NO_PAD.encode(hash);
    format!("{}${}", salt_b64, hash_b64)
}

fn verify_secret(secret: &str, stored: &str) -> bool {
    let Some((salt_b64, hash_b64)) = stored.split_once('$') else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (STANDARD_NO_PAD.decode(salt_b64), STANDARD_NO_PAD.decode(hash_b64))
    else {
        return false;
    };
    let candidate = hash_secret(secret, &salt);
    constant_time_eq(&candidate, &expected)
}

/// Constant-time comparison to avoid timing side-channels.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result: u8 = 0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }

    result == 0
}
