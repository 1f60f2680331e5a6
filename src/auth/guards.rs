use std::convert::Infallible;

use rocket::Request;
use rocket::State;
use rocket::request::{FromRequest, Outcome};
use rocket_okapi::request::OpenApiFromRequest;

use crate::auth::{AuthContext, AuthError, AuthResult, AuthState};
use crate::request_logger::RequestId;
use crate::store::{DeviceInfo, DeviceType};

/// Caller authenticated by a bearer access token bound to an active session.
#[derive(Debug, Clone, OpenApiFromRequest)]
pub struct AuthUser(pub AuthContext);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AuthUser {
    type Error = AuthError;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match extract_user(request).await {
            Ok(ctx) => Outcome::Success(AuthUser(ctx)),
            Err(err) => {
                if err.is_internal() {
                    let request_id = RequestId::resolve(request);
                    log::error!("request_id={} authentication failed: {}", request_id, err);
                }
                Outcome::Error((err.status(), err))
            }
        }
    }
}

#[derive(Debug, Clone, OpenApiFromRequest)]
pub struct RequireAdmin(pub AuthContext);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for RequireAdmin {
    type Error = AuthError;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match AuthUser::from_request(request).await {
            Outcome::Success(AuthUser(ctx)) => {
                if ctx.is_admin() {
                    Outcome::Success(RequireAdmin(ctx))
                } else {
                    let err = AuthError::Forbidden;
                    Outcome::Error((err.status(), err))
                }
            }
            Outcome::Error(err) => Outcome::Error(err),
            Outcome::Forward(_) => {
                let err = AuthError::Unauthorized;
                Outcome::Error((err.status(), err))
            }
        }
    }
}

/// Device details supplied through headers and the connection itself.
#[derive(Debug, Clone, Default, OpenApiFromRequest)]
pub struct ClientMeta(pub DeviceInfo);

impl ClientMeta {
    /// Fields present in `overrides` win over the header-derived ones.
    pub fn merged(&self, overrides: Option<&DeviceInfo>) -> DeviceInfo {
        let base = self.0.clone();
        let Some(overrides) = overrides else {
            return base;
        };
        DeviceInfo {
            device_id: overrides.device_id.clone().or(base.device_id),
            device_name: overrides.device_name.clone().or(base.device_name),
            device_type: overrides.device_type.or(base.device_type),
            os_name: overrides.os_name.clone().or(base.os_name),
            os_version: overrides.os_version.clone().or(base.os_version),
            browser_name: overrides.browser_name.clone().or(base.browser_name),
            browser_version: overrides.browser_version.clone().or(base.browser_version),
            // The connection is authoritative for the address.
            ip_address: base.ip_address.or_else(|| overrides.ip_address.clone()),
            user_agent: overrides.user_agent.clone().or(base.user_agent),
        }
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ClientMeta {
    type Error = Infallible;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let header = |name: &str| {
            request
                .headers()
                .get_one(name)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        Outcome::Success(ClientMeta(DeviceInfo {
            device_id: header("X-Device-Id"),
            device_name: header("X-Device-Name"),
            device_type: header("X-Device-Type").and_then(|value| DeviceType::parse(&value).ok()),
            os_name: None,
            os_version: None,
            browser_name: None,
            browser_version: None,
            ip_address: request.client_ip().map(|ip| ip.to_string()),
            user_agent: header("User-Agent"),
        }))
    }
}

async fn extract_user(request: &Request<'_>) -> AuthResult<AuthContext> {
    let token = bearer_token_from_request(request)?;

    let auth_state = request
        .guard::<&State<AuthState>>()
        .await
        .succeeded()
        .ok_or_else(|| AuthError::Config("AuthState missing from state".into()))?;

    auth_state.service.authenticate(token).await
}

fn bearer_token_from_request<'a>(request: &'a Request<'_>) -> AuthResult<&'a str> {
    let header = request
        .headers()
        .get_one("Authorization")
        .ok_or(AuthError::Unauthorized)?;
    let (scheme, token) = header.split_once(' ').ok_or(AuthError::Unauthorized)?;
    let token = token.trim();
    if scheme.eq_ignore_ascii_case("Bearer") && !token.is_empty() {
        Ok(token)
    } else {
        Err(AuthError::Unauthorized)
    }
}
