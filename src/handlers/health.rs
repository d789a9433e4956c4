use axum::Json;
use serde::Serialize;

pub const SERVICE_NAME: &str = "skypulse";

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
}

/// GET /health - Liveness probe
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Prefix under which the API routes are also mounted.
pub const API_PREFIX: &str = "/api/v1";

#[derive(Serialize)]
pub struct RootResponse {
    pub message: &'static str,
    pub api: &'static str,
}

/// GET / - Service banner
pub async fn root_handler() -> Json<RootResponse> {
    Json(RootResponse {
        message: "SkyPulse weather API",
        api: API_PREFIX,
    })
}
