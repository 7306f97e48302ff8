//! HTTP surface: the signaling WebSocket, health and metrics, and the
//! optional static frontend.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use canvascast_common::SignalingChannel;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::hub::BroadcastHub;
use crate::session;

const WS_MAX_TEXT_BYTES: usize = 64 * 1024;

pub fn router(hub: Arc<BroadcastHub>, frontend_dir: Option<PathBuf>) -> Router {
    let app = Router::new()
        .route("/connect", get(connect))
        .route("/health", get(health))
        .route("/metrics/prometheus", get(prometheus_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(hub);

    match frontend_dir {
        Some(dir) => app.fallback_service(ServeDir::new(dir)),
        None => app,
    }
}

async fn connect(ws: WebSocketUpgrade, State(hub): State<Arc<BroadcastHub>>) -> impl IntoResponse {
    ws.max_message_size(WS_MAX_TEXT_BYTES)
        .max_frame_size(WS_MAX_TEXT_BYTES)
        .on_upgrade(move |socket| session::serve(hub, SignalingChannel::from_websocket(socket)))
}

async fn health(State(hub): State<Arc<BroadcastHub>>) -> impl IntoResponse {
    (StatusCode::OK, Json(hub.snapshot().await))
}

async fn prometheus_metrics(State(hub): State<Arc<BroadcastHub>>) -> impl IntoResponse {
    let snapshot = hub.snapshot().await;
    let prometheus_text = format!(
        r#"# HELP canvascast_sessions Live signaling sessions
# TYPE canvascast_sessions gauge
canvascast_sessions {sessions}
# HELP canvascast_producers Sessions that delivered an inbound media track
# TYPE canvascast_producers gauge
canvascast_producers {producers}
# HELP canvascast_packets_forwarded_total Packets written to the outbound whiteboard track
# TYPE canvascast_packets_forwarded_total counter
canvascast_packets_forwarded_total {packets_forwarded}
# HELP canvascast_keyframe_requests_total Keyframe refresh requests issued
# TYPE canvascast_keyframe_requests_total counter
canvascast_keyframe_requests_total {keyframe_requests}
"#,
        sessions = snapshot.sessions,
        producers = snapshot.producers,
        packets_forwarded = snapshot.packets_forwarded,
        keyframe_requests = snapshot.keyframe_requests,
    );

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        prometheus_text,
    )
}
