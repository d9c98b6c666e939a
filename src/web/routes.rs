use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/status", get(handlers::relay_status))
        .route("/webrtc/offer", post(handlers::webrtc_offer))
        .route("/webrtc/close", post(handlers::webrtc_close_session))
        .route("/webrtc/sessions", get(handlers::webrtc_sessions));

    Router::new()
        .route("/health", get(handlers::health_check))
        // Raw SDP in, raw SDP out, for WHEP-style players
        .route("/offer", post(handlers::offer_sdp))
        .nest("/api", api_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
