//! PMA gateway HTTP surface
//!
//! REST routes over the unified service facade, a WebSocket push channel
//! and a parallel SSE stream, all speaking the same
//! `{success, data, error, meta, timestamp}` envelope. The core returns
//! tagged errors; this crate maps them onto status codes.

pub mod auth;
mod entities;
mod rooms;
mod sse;
mod system;
mod websocket;

use std::sync::Arc;

use axum::{
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use pma_core::CoreError;
use pma_events::Hub;
use pma_unified::UnifiedService;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub use auth::AuthService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<UnifiedService>,
    pub hub: Arc<Hub>,
    pub auth: Arc<AuthService>,
}

/// Response envelope used by every route.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            meta: None,
            timestamp: Utc::now(),
        })
    }

    pub fn ok_with_meta(data: T, meta: serde_json::Value) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            meta: Some(meta),
            timestamp: Utc::now(),
        })
    }
}

/// Core error wrapper carrying the HTTP mapping.
#[derive(Debug)]
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::Validation { .. } => StatusCode::BAD_REQUEST,
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::Conflict { .. } => StatusCode::CONFLICT,
            CoreError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
            CoreError::NoAdapterForSource { .. } | CoreError::SourceUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CoreError::ActionFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let meta = match &self.0 {
            CoreError::ActionFailed { code, .. } => {
                Some(serde_json::json!({ "code": code.as_str() }))
            }
            CoreError::Internal(_) => {
                let correlation_id = ulid::Ulid::new().to_string().to_lowercase();
                error!(correlation_id = %correlation_id, error = %self.0, "Internal error");
                Some(serde_json::json!({ "correlation_id": correlation_id }))
            }
            _ => None,
        };

        let body = Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.0.to_string()),
            meta,
            timestamp: Utc::now(),
        });
        (status, body).into_response()
    }
}

/// Result alias for handlers
pub type ApiResult<T> = Result<T, ApiError>;

/// Build the full router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let public = Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/pin", post(auth::set_pin))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/session", get(auth::session));

    let protected = Router::new()
        // Entities
        .route("/api/entities", get(entities::list).post(entities::create))
        .route("/api/entities/search", get(entities::search))
        .route("/api/entities/type/:entity_type", get(entities::by_type))
        .route("/api/entities/source/:source", get(entities::by_source))
        .route("/api/entities/room/:room_id", get(entities::by_room))
        .route(
            "/api/entities/:id",
            get(entities::get_one)
                .put(entities::update)
                .delete(entities::delete),
        )
        .route("/api/entities/:id/action", post(entities::execute_action))
        // Legacy state write, routed into the action pipeline
        .route("/api/entities/:id/state", put(entities::put_state))
        // Rooms
        .route("/api/rooms", get(rooms::list).post(rooms::create))
        .route("/api/rooms/stats", get(rooms::stats))
        .route(
            "/api/rooms/:id",
            get(rooms::get_one).put(rooms::update).delete(rooms::delete),
        )
        // Sync, adapters, status
        .route("/api/sync", post(system::sync))
        .route("/api/sync/history", get(system::sync_history))
        .route("/api/adapters", get(system::adapters))
        .route("/api/adapters/:id", get(system::adapter))
        .route("/api/status", get(system::status))
        // Push channel
        .route("/api/ws", get(websocket::ws_handler))
        .route("/api/events", get(sse::sse_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    public
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API on the given address until the process exits.
pub async fn start_server(state: AppState, addr: &str) -> std::io::Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API server listening on {}", addr);
    axum::serve(listener, router).await
}

/// GET /api/health - liveness, unauthenticated
async fn health() -> &'static str {
    "OK"
}
