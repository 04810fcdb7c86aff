//! Dashboard HTTP / WebSocket surface
//!
//! REST API for session lifecycle, event ingest and analytics queries, plus
//! the `/ws` live stream, served by axum at localhost:3927 by default.

pub mod handlers;
pub mod state;
pub mod websocket;

use std::future::Future;

use axum::Router;
use axum::http::{HeaderValue, Method, header};
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;

use state::AppState;

/// Build the axum router with all dashboard routes
pub fn build_router(state: AppState, port: u16) -> Router {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", port),
        format!("http://localhost:{}", port),
        // dashboard dev server
        "http://localhost:5173".to_string(),
        "http://127.0.0.1:5173".to_string(),
    ]
    .iter()
    .filter_map(|origin| HeaderValue::from_str(origin).ok())
    .collect();

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        // WebSocket for live session streams
        .route("/ws", get(websocket::ws_handler))
        // Session CRUD
        .route(
            "/api/sessions",
            get(handlers::list_sessions).post(handlers::create_session),
        )
        .route(
            "/api/sessions/{id}",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        // Lifecycle
        .route("/api/sessions/{id}/start", post(handlers::start_session))
        .route("/api/sessions/{id}/pause", post(handlers::pause_session))
        .route("/api/sessions/{id}/resume", post(handlers::resume_session))
        .route("/api/sessions/{id}/complete", post(handlers::complete_session))
        .route("/api/sessions/{id}/cancel", post(handlers::cancel_session))
        // Ingest
        .route("/api/sessions/{id}/events", post(handlers::ingest_event))
        .route("/api/sessions/{id}/events/batch", post(handlers::ingest_batch))
        .route("/api/sessions/{id}/metrics", post(handlers::ingest_metrics))
        // Analytics
        .route("/api/sessions/{id}/live", get(handlers::get_live_metrics))
        .route("/api/sessions/{id}/timeline", get(handlers::get_timeline))
        .route("/api/sessions/{id}/categories", get(handlers::get_categories))
        .route("/api/sessions/{id}/subjects", get(handlers::get_subjects))
        .route("/api/sessions/{id}/report", get(handlers::get_report))
        // Stats & health
        .route("/api/stats", get(handlers::get_stats))
        .route("/api/health", get(handlers::health_check))
        .layer(ServiceBuilder::new().concurrency_limit(50).layer(cors))
        .with_state(state)
}

/// Serve `router` on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(
            "Dashboard available at http://{} (WebSocket at ws://{}/ws)",
            addr, addr
        );
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
