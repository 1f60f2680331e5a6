//! Authentication module: configuration, credential handling, token minting,
//! session tracking, Rocket request guards, and HTTP route handlers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::store::StoreResult;

pub mod clock;
pub mod config;
pub mod error;
pub mod guards;
pub mod jwt;
pub mod lockout;
pub mod mailer;
pub mod passwords;
pub mod refresh_store;
pub mod responses;
pub mod routes;
pub mod service;
pub mod sessions;
pub mod verification;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AuthConfig;
pub use error::{AuthError, AuthResult};
pub use guards::{AuthUser, ClientMeta, RequireAdmin};
pub use jwt::JwtService;
pub use mailer::{LogMailer, Mailer, RecordingMailer};
pub use passwords::PasswordService;
pub use refresh_store::RefreshTokenLedger;
pub use service::{AuthContext, AuthService};

/// Retries after the first attempt of an optimistic user update.
pub const MAX_CAS_RETRIES: usize = 3;

#[derive(Clone)]
pub struct AuthState {
    pub service: Arc<AuthService>,
}

impl AuthState {
    pub fn new(service: AuthService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }
}

/// Runs a store call under `deadline`. Running out of time is reported as
/// [`AuthError::StoreTimeout`], never as an authentication failure.
pub(crate) async fn with_deadline<T, F>(deadline: Duration, call: F) -> AuthResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result.map_err(AuthError::from),
        Err(_) => Err(AuthError::StoreTimeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slow_store_calls_time_out() {
        let result: AuthResult<()> = with_deadline(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(AuthError::StoreTimeout)));
    }
}
