//! Lightweight service health endpoint used for readiness checks and tests.

use rocket::State;
use rocket::serde::json::Json;
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::{Deserialize, Serialize};

use crate::store::StoreBackend;

/// Basic response payload describing API health.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct HealthResponse {
    /// Static status string reporting application readiness.
    pub status: String,
    /// Backend holding credentials and sessions.
    pub store: StoreBackend,
}

#[openapi(tag = "Health")]
#[get("/health")]
pub fn health_check(backend: &State<StoreBackend>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        store: *backend.inner(),
    })
}
