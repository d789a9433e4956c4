//! SkyPulse - weather question answering service
//!
//! This library exposes the service components (query orchestration, city
//! inference, location cache, stream filtering) so the binary and the
//! integration tests share one router.

pub mod agent;
pub mod cache;
pub mod config;
pub mod detector;
pub mod error;
pub mod geoip;
pub mod handlers;
pub mod orchestrator;
pub mod state;
pub mod stream;
pub mod weather;

// Re-export key types for convenience
pub use agent::{AgentClient, AgentError, AgentTurn, FragmentStream};
pub use cache::LocationCache;
pub use config::Config;
pub use detector::{CityDetector, Lexicon};
pub use error::{AppError, Result};
pub use geoip::{CityResolver, GeoResolution};
pub use handlers::{
    chat_handler, chat_stream_handler, health_handler, ip_handler, root_handler, API_PREFIX,
};
pub use orchestrator::{Query, QueryOrchestrator};
pub use state::AppState;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat", post(chat_handler))
        .route("/chat/stream", post(chat_stream_handler))
        .route("/ip", get(ip_handler))
        .route("/health", get(health_handler))
}

/// Application routes without transport middleware or the metrics endpoint.
///
/// The API is served both at the root and under [`API_PREFIX`].
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .merge(api_routes())
        .nest(API_PREFIX, api_routes())
        .with_state(state)
}
