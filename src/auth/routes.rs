use rocket::http::Status;
use rocket::response::status;
use rocket::serde::json::Json;
use rocket::{State, delete, get, post};
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use uuid::Uuid;

use crate::auth::guards::{AuthUser, ClientMeta, RequireAdmin};
use crate::auth::responses::{
    ChangePasswordRequest, EmailRequest, LoginRequest, LoginResponse, MessageResponse,
    RefreshRequest, RefreshResponse, RegisterRequest, RegisterResponse, ResetPasswordRequest,
    RevokedSessionsResponse, SessionSummary, UserSummary,
};
use crate::auth::service::{ActivationOutcome, LoginCommand, NewAccount};
use crate::auth::{AuthError, AuthState};
use crate::request_logger::RequestId;

type AuthRouteResult<T> = Result<Json<T>, status::Custom<Json<AuthErrorResponse>>>;

const GENERIC_RESET_MESSAGE: &str =
    "If the address belongs to an account, a password reset link has been sent.";
const GENERIC_ACTIVATION_MESSAGE: &str =
    "If the address belongs to an account awaiting activation, a new activation link has been sent.";

#[derive(Debug, serde::Serialize, JsonSchema)]
pub struct AuthErrorResponse {
    pub status: u16,
    pub message: String,
}

#[openapi(tag = "Auth")]
#[post("/auth/register", data = "<payload>")]
pub async fn register(
    state: &State<AuthState>,
    request_id: RequestId,
    payload: Json<RegisterRequest>,
) -> Result<status::Custom<Json<RegisterResponse>>, status::Custom<Json<AuthErrorResponse>>> {
    let payload = payload.into_inner();
    let user = state
        .service
        .register(NewAccount {
            login: payload.login,
            email: payload.email,
            password: payload.password,
            language: payload.language,
        })
        .await
        .map_err(|err| respond_error(err, &request_id))?;

    Ok(status::Custom(
        Status::Created,
        Json(RegisterResponse {
            id: user.id.to_string(),
            status: user.account_status,
        }),
    ))
}

#[openapi(tag = "Auth")]
#[post("/auth/login", data = "<payload>")]
pub async fn login(
    state: &State<AuthState>,
    request_id: RequestId,
    client: ClientMeta,
    payload: Json<LoginRequest>,
) -> AuthRouteResult<LoginResponse> {
    let payload = payload.into_inner();
    if payload.username_or_email.trim().is_empty() || payload.password.is_empty() {
        return Err(respond_message(
            Status::BadRequest,
            "Login and password are required",
        ));
    }

    let result = state
        .service
        .login(LoginCommand {
            identifier: payload.username_or_email,
            password: payload.password,
            remember_me: payload.remember_me,
            device: client.merged(payload.device.as_ref()),
        })
        .await
        .map_err(|err| respond_error(err, &request_id))?;

    Ok(Json(LoginResponse::from(result)))
}

#[openapi(tag = "Auth")]
#[post("/auth/refresh", data = "<payload>")]
pub async fn refresh(
    state: &State<AuthState>,
    request_id: RequestId,
    client: ClientMeta,
    payload: Json<RefreshRequest>,
) -> AuthRouteResult<RefreshResponse> {
    let tokens = state
        .service
        .refresh(payload.refresh_token.trim(), &client.0)
        .await
        .map_err(|err| respond_error(err, &request_id))?;

    Ok(Json(RefreshResponse::from(tokens)))
}

#[openapi(tag = "Auth")]
#[post("/auth/logout")]
pub async fn logout(
    state: &State<AuthState>,
    request_id: RequestId,
    user: AuthUser,
) -> Result<status::NoContent, status::Custom<Json<AuthErrorResponse>>> {
    state
        .service
        .logout(&user.0)
        .await
        .map_err(|err| respond_error(err, &request_id))?;

    Ok(status::NoContent)
}

#[openapi(tag = "Auth")]
#[get("/auth/activate?<key>")]
pub async fn activate(
    state: &State<AuthState>,
    request_id: RequestId,
    key: String,
) -> AuthRouteResult<MessageResponse> {
    activate_account(state, &request_id, &key).await
}

/// Same flow as `/auth/activate`, addressed the way verification mails link to it.
#[openapi(tag = "Auth")]
#[get("/auth/verify-email?<token>")]
pub async fn verify_email(
    state: &State<AuthState>,
    request_id: RequestId,
    token: String,
) -> AuthRouteResult<MessageResponse> {
    activate_account(state, &request_id, &token).await
}

#[openapi(tag = "Auth")]
#[post("/auth/resend-activation", data = "<payload>")]
pub async fn resend_activation(
    state: &State<AuthState>,
    payload: Json<EmailRequest>,
) -> Json<MessageResponse> {
    state.service.resend_activation(&payload.email).await;
    Json(MessageResponse::new(GENERIC_ACTIVATION_MESSAGE))
}

#[openapi(tag = "Auth")]
#[post("/auth/forgot-password", data = "<payload>")]
pub async fn forgot_password(
    state: &State<AuthState>,
    payload: Json<EmailRequest>,
) -> Json<MessageResponse> {
    state.service.forgot_password(&payload.email).await;
    Json(MessageResponse::new(GENERIC_RESET_MESSAGE))
}

#[openapi(tag = "Auth")]
#[post("/auth/reset-password", data = "<payload>")]
pub async fn reset_password(
    state: &State<AuthState>,
    request_id: RequestId,
    payload: Json<ResetPasswordRequest>,
) -> AuthRouteResult<MessageResponse> {
    state
        .service
        .reset_password(payload.token.trim(), &payload.new_password)
        .await
        .map_err(|err| respond_error(err, &request_id))?;

    Ok(Json(MessageResponse::new("Password has been reset")))
}

#[openapi(tag = "Auth")]
#[post("/auth/change-password", data = "<payload>")]
pub async fn change_password(
    state: &State<AuthState>,
    request_id: RequestId,
    user: AuthUser,
    payload: Json<ChangePasswordRequest>,
) -> AuthRouteResult<MessageResponse> {
    state
        .service
        .change_password(&user.0, &payload.current_password, &payload.new_password)
        .await
        .map_err(|err| respond_error(err, &request_id))?;

    Ok(Json(MessageResponse::new("Password changed")))
}

#[openapi(tag = "Auth")]
#[get("/auth/me")]
pub async fn current_user(
    state: &State<AuthState>,
    request_id: RequestId,
    user: AuthUser,
) -> AuthRouteResult<UserSummary> {
    let record = state
        .service
        .current_user(&user.0)
        .await
        .map_err(|err| respond_error(err, &request_id))?;

    Ok(Json(UserSummary::from(&record)))
}

#[openapi(tag = "Auth")]
#[get("/auth/sessions")]
pub async fn list_sessions(
    state: &State<AuthState>,
    request_id: RequestId,
    user: AuthUser,
) -> AuthRouteResult<Vec<SessionSummary>> {
    let sessions = state
        .service
        .list_sessions(&user.0)
        .await
        .map_err(|err| respond_error(err, &request_id))?;

    Ok(Json(
        sessions
            .iter()
            .map(|session| SessionSummary::new(session, session.id == user.0.session_id))
            .collect(),
    ))
}

#[openapi(tag = "Auth")]
#[delete("/auth/sessions/<session_id>")]
pub async fn revoke_session(
    state: &State<AuthState>,
    request_id: RequestId,
    user: AuthUser,
    session_id: &str,
) -> Result<status::NoContent, status::Custom<Json<AuthErrorResponse>>> {
    let session_id = parse_id(session_id, &request_id)?;
    state
        .service
        .revoke_session(&user.0, session_id)
        .await
        .map_err(|err| respond_error(err, &request_id))?;

    Ok(status::NoContent)
}

#[openapi(tag = "Admin")]
#[post("/admin/users/<user_id>/unlock")]
pub async fn admin_unlock(
    state: &State<AuthState>,
    request_id: RequestId,
    admin: RequireAdmin,
    user_id: &str,
) -> AuthRouteResult<UserSummary> {
    let user_id = parse_id(user_id, &request_id)?;
    let user = state
        .service
        .admin_unlock(&admin.0, user_id)
        .await
        .map_err(|err| respond_error(err, &request_id))?;

    Ok(Json(UserSummary::from(&user)))
}

#[openapi(tag = "Admin")]
#[post("/admin/users/<user_id>/activate")]
pub async fn admin_activate(
    state: &State<AuthState>,
    request_id: RequestId,
    admin: RequireAdmin,
    user_id: &str,
) -> AuthRouteResult<UserSummary> {
    let user_id = parse_id(user_id, &request_id)?;
    let user = state
        .service
        .admin_activate(&admin.0, user_id)
        .await
        .map_err(|err| respond_error(err, &request_id))?;

    Ok(Json(UserSummary::from(&user)))
}

#[openapi(tag = "Admin")]
#[post("/admin/users/<user_id>/deactivate")]
pub async fn admin_deactivate(
    state: &State<AuthState>,
    request_id: RequestId,
    admin: RequireAdmin,
    user_id: &str,
) -> AuthRouteResult<UserSummary> {
    let user_id = parse_id(user_id, &request_id)?;
    let user = state
        .service
        .admin_deactivate(&admin.0, user_id)
        .await
        .map_err(|err| respond_error(err, &request_id))?;

    Ok(Json(UserSummary::from(&user)))
}

#[openapi(tag = "Admin")]
#[post("/admin/users/<user_id>/revoke-sessions")]
pub async fn admin_revoke_sessions(
    state: &State<AuthState>,
    request_id: RequestId,
    admin: RequireAdmin,
    user_id: &str,
) -> AuthRouteResult<RevokedSessionsResponse> {
    let user_id = parse_id(user_id, &request_id)?;
    let revoked = state
        .service
        .admin_revoke_sessions(&admin.0, user_id)
        .await
        .map_err(|err| respond_error(err, &request_id))?;

    Ok(Json(RevokedSessionsResponse { revoked }))
}

async fn activate_account(
    state: &State<AuthState>,
    request_id: &RequestId,
    key: &str,
) -> AuthRouteResult<MessageResponse> {
    let outcome = state
        .service
        .activate(key.trim())
        .await
        .map_err(|err| respond_error(err, request_id))?;

    let message = match outcome {
        ActivationOutcome::Activated(_) => "Account activated",
        ActivationOutcome::AlreadyActive(_) => "Account is already active",
    };
    Ok(Json(MessageResponse::new(message)))
}

fn parse_id(
    raw: &str,
    request_id: &RequestId,
) -> Result<Uuid, status::Custom<Json<AuthErrorResponse>>> {
    raw.parse::<Uuid>()
        .map_err(|_| respond_error(AuthError::NotFound, request_id))
}

fn respond_error(err: AuthError, request_id: &RequestId) -> status::Custom<Json<AuthErrorResponse>> {
    let status = err.status();
    if err.is_internal() {
        log::error!("request_id={} auth request failed: {}", request_id, err);
    } else if let AuthError::TokenReuseDetected { user_id } = &err {
        log::warn!(
            "request_id={} rejected replayed refresh token for user {}",
            request_id,
            user_id
        );
    }
    respond_message(status, err.public_message())
}

fn respond_message(
    status: Status,
    message: impl Into<String>,
) -> status::Custom<Json<AuthErrorResponse>> {
    status::Custom(
        status,
        Json(AuthErrorResponse {
            status: status.code,
            message: message.into(),
        }),
    )
}
