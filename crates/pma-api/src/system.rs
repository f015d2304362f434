//! Sync, adapter and status routes

use axum::{
    extract::{Path, Query, State},
    Json,
};
use pma_adapters::AdapterRecord;
use pma_core::SyncResult;
use pma_unified::SystemStatus;
use serde::Deserialize;

use crate::{ApiResponse, ApiResult, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct SyncQuery {
    pub source: Option<String>,
}

/// POST /api/sync?source= — one source when given, otherwise all.
pub async fn sync(
    State(state): State<AppState>,
    Query(query): Query<SyncQuery>,
) -> ApiResult<Json<ApiResponse<Vec<SyncResult>>>> {
    let results = match &query.source {
        Some(source) => vec![state.service.sync_from_source(source).await?],
        None => state.service.sync_from_all().await,
    };

    let meta = serde_json::json!({
        "sources": results.len(),
        "failed": results.iter().filter(|r| !r.success).count(),
    });
    Ok(ApiResponse::ok_with_meta(results, meta))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    50
}

/// GET /api/sync/history
pub async fn sync_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Json<ApiResponse<Vec<SyncResult>>> {
    ApiResponse::ok(state.service.sync_history(query.limit))
}

/// GET /api/adapters
pub async fn adapters(State(state): State<AppState>) -> Json<ApiResponse<Vec<AdapterRecord>>> {
    ApiResponse::ok(state.service.adapter_records())
}

/// GET /api/adapters/:id
pub async fn adapter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<AdapterRecord>>> {
    Ok(ApiResponse::ok(state.service.adapter_record(&id)?))
}

/// GET /api/status
pub async fn status(State(state): State<AppState>) -> Json<ApiResponse<SystemStatus>> {
    ApiResponse::ok(state.service.system_status())
}

#[cfg(test)]
mod tests {
    use crate::test_support::{body_json, make_gateway, make_light};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use pma_core::EntityState;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_sync_single_source() {
        let gateway = make_gateway().await;
        gateway
            .adapter
            .set_entities(vec![make_light("ha_light_kitchen", EntityState::Off)]);
        let app = crate::create_router(gateway.state);

        let response = app
            .oneshot(
                Request::post("/api/sync?source=homeassistant")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"][0]["source"], "homeassistant");
        assert_eq!(body["data"][0]["success"], true);
        assert_eq!(body["meta"]["failed"], 0);
    }

    #[tokio::test]
    async fn test_sync_unknown_source_is_503() {
        let gateway = make_gateway().await;
        let app = crate::create_router(gateway.state);

        let response = app
            .oneshot(
                Request::post("/api/sync?source=zigbee")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_sync_all_and_history() {
        let gateway = make_gateway().await;
        let app = crate::create_router(gateway.state);

        let response = app
            .clone()
            .oneshot(Request::post("/api/sync").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/api/sync/history").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_adapter_routes() {
        let gateway = make_gateway().await;
        let app = crate::create_router(gateway.state);

        let response = app
            .clone()
            .oneshot(Request::get("/api/adapters").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["data"][0]["id"], "ha_main");
        assert_eq!(body["data"][0]["connected"], true);

        let response = app
            .clone()
            .oneshot(
                Request::get("/api/adapters/ha_main")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::get("/api/adapters/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_route() {
        let gateway = make_gateway().await;
        let app = crate::create_router(gateway.state);

        let response = app
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["data"]["entities"], 1);
        assert_eq!(body["data"]["adapters"][0]["source"], "homeassistant");
    }
}
