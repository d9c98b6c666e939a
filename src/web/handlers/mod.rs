use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::hub::HubStats;
use crate::rtsp::client::redact_url;
use crate::rtsp::{parse_source_url, SourceStatus};
use crate::state::AppState;
use crate::webrtc::{AnswerResponse, CloseRequest, OfferRequest, PeerSessionInfo};

/// Media type of offer and answer bodies on `/offer`
pub const SDP_CONTENT_TYPE: &str = "application/sdp";
/// Response header carrying the viewer session ID on `/offer`
pub const SESSION_ID_HEADER: &str = "x-session-id";

// ============================================================================
// Health & Status
// ============================================================================

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
pub struct RelayStatus {
    /// Configured source, credentials removed
    pub source_url: String,
    pub source: SourceStatus,
    pub viewers: usize,
    pub hub: HubStats,
}

/// Source state, viewer count and per-subscription counters
pub async fn relay_status(State(state): State<Arc<AppState>>) -> Json<RelayStatus> {
    let source_url = state.config.get().source.url.clone();
    let source_url = match parse_source_url(&source_url) {
        Ok(url) => redact_url(&url),
        Err(_) => source_url,
    };

    Json(RelayStatus {
        source_url,
        source: state.source.status(),
        viewers: state.sessions.count().await,
        hub: state.hub().stats(),
    })
}

// ============================================================================
// WebRTC
// ============================================================================

/// Raw SDP offer in, raw SDP answer out
///
/// Errors are answered as plain text with the matching status code.
pub async fn offer_sdp(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    match answer_raw_offer(&state, &headers, &body).await {
        Ok(response) => response,
        Err(e) => {
            let status = e.status_code();
            if status.is_server_error() {
                warn!("Offer failed: {}", e);
            } else {
                info!("Offer rejected: {}", e);
            }
            (
                status,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                e.to_string(),
            )
                .into_response()
        }
    }
}

async fn answer_raw_offer(state: &AppState, headers: &HeaderMap, body: &str) -> Result<Response> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !content_type
        .trim()
        .to_ascii_lowercase()
        .starts_with(SDP_CONTENT_TYPE)
    {
        return Err(AppError::BadRequest(format!(
            "expected Content-Type {}, got {:?}",
            SDP_CONTENT_TYPE, content_type
        )));
    }

    let answer = state.negotiator.negotiate(body).await?;
    let session_id = HeaderValue::from_str(&answer.session_id)
        .map_err(|e| AppError::Internal(format!("invalid session id header: {}", e)))?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, SDP_CONTENT_TYPE)
        .header(SESSION_ID_HEADER, session_id)
        .body(Body::from(answer.sdp))
        .map_err(|e| AppError::Internal(format!("failed to build answer response: {}", e)))
}

/// JSON offer for clients that track their session ID
pub async fn webrtc_offer(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OfferRequest>,
) -> Result<Json<AnswerResponse>> {
    let answer = state.negotiator.negotiate(&req.sdp).await?;
    Ok(Json(AnswerResponse::new(answer.sdp, answer.session_id)))
}

#[derive(Serialize)]
pub struct CloseResponse {
    pub success: bool,
}

/// Close one viewer session
pub async fn webrtc_close_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CloseRequest>,
) -> Result<Json<CloseResponse>> {
    state.sessions.close(&req.session_id).await?;
    Ok(Json(CloseResponse { success: true }))
}

/// List viewer sessions
pub async fn webrtc_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<PeerSessionInfo>> {
    Json(state.sessions.list().await)
}
