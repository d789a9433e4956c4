use crate::error::{AppError, Result};
use crate::handlers::health::SERVICE_NAME;
use crate::handlers::ip::client_address;
use crate::orchestrator::Query;
use crate::state::AppState;
use crate::stream::sse_frames;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderName},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

const ACCEL_BUFFERING_HEADER: &str = "x-accel-buffering";

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    /// Caller address; when absent the request's own address is used.
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub agent: &'static str,
}

impl ChatRequest {
    fn into_query(
        self,
        headers: &HeaderMap,
        peer: Option<ConnectInfo<SocketAddr>>,
    ) -> Result<Query> {
        if self.message.trim().is_empty() {
            return Err(AppError::ValidationError(
                "Message cannot be empty".to_string(),
            ));
        }

        let ip = self
            .ip
            .filter(|ip| !ip.trim().is_empty())
            .or_else(|| client_address(headers, peer.map(|ConnectInfo(addr)| addr)).ip);

        Ok(Query::new(self.message)
            .with_ip(ip)
            .with_user_id(self.user_id))
    }
}

/// POST /chat - Answer a question in a single response.
///
/// # Flow
/// 1. Validate input and settle the caller address
/// 2. Submit to the agent
/// 3. If the reply asks for a city, infer one from the address and retry once
pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>> {
    let start = Instant::now();
    let query = request.into_query(&headers, peer)?;

    let answer = state.orchestrator.answer(&query).await?;

    let elapsed_ms = start.elapsed().as_millis() as u64;
    tracing::debug!(
        attempts = answer.attempts,
        inferred_city = answer.inferred_city.as_deref().unwrap_or("-"),
        elapsed_ms,
        "Chat completed"
    );
    metrics::counter!("chat_requests_total").increment(1);
    metrics::histogram!("chat_latency_ms").record(elapsed_ms as f64);

    Ok(Json(ChatResponse {
        response: answer.text,
        agent: SERVICE_NAME,
    }))
}

/// POST /chat/stream - Answer a question as server-sent events.
///
/// Each assistant text fragment is sent as a `data:` event and the stream is
/// closed by `data: [DONE]`. A failure before the first fragment is an
/// ordinary error response; a failure after it becomes an `error` event.
pub async fn chat_stream_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    Json(request): Json<ChatRequest>,
) -> Result<Response> {
    let query = request.into_query(&headers, peer)?;

    let fragments = state.orchestrator.answer_stream(&query).await?;
    metrics::counter!("chat_stream_requests_total").increment(1);

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static(ACCEL_BUFFERING_HEADER), "no"),
        ],
        Body::from_stream(sse_frames(fragments)),
    )
        .into_response())
}
