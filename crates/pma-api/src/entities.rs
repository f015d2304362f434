//! Entity routes

use std::collections::{HashMap, HashSet};

use axum::{
    extract::{Path, Query, State},
    Json,
};
use pma_core::{
    Action, ActionContext, ActionErrorCode, ActionResult, Capability, CoreError, Entity,
    EntityMetadata, EntityState, EntityType, SOURCE_PMA,
};
use pma_unified::{EntityWithContext, QueryOptions};
use serde::Deserialize;

use crate::{ApiError, ApiResponse, ApiResult, AppState};

/// Query string accepted by the entity read routes.
#[derive(Debug, Default, Deserialize)]
pub struct EntityQuery {
    #[serde(default)]
    pub include_room: bool,
    #[serde(default)]
    pub include_area: bool,
    #[serde(default)]
    pub available_only: bool,
    /// Comma-separated capability list
    pub capabilities: Option<String>,
    pub domain: Option<String>,
}

impl EntityQuery {
    fn to_options(&self) -> ApiResult<QueryOptions> {
        let capabilities = match &self.capabilities {
            Some(raw) => raw
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|s| {
                    serde_json::from_value::<Capability>(serde_json::Value::String(s.to_string()))
                        .map_err(|_| {
                            ApiError(CoreError::validation(
                                "capabilities",
                                format!("unknown capability '{s}'"),
                            ))
                        })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        let domain = match &self.domain {
            Some(raw) => Some(parse_type(raw)?),
            None => None,
        };

        Ok(QueryOptions {
            include_room: self.include_room,
            include_area: self.include_area,
            available_only: self.available_only,
            capabilities,
            domain,
        })
    }
}

fn parse_type(raw: &str) -> ApiResult<EntityType> {
    EntityType::parse(raw).ok_or_else(|| {
        ApiError(CoreError::validation(
            "type",
            format!("unknown entity type '{raw}'"),
        ))
    })
}

fn list_response(
    entities: Vec<EntityWithContext>,
) -> Json<ApiResponse<Vec<EntityWithContext>>> {
    let meta = serde_json::json!({ "count": entities.len() });
    ApiResponse::ok_with_meta(entities, meta)
}

/// GET /api/entities
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<EntityQuery>,
) -> ApiResult<Json<ApiResponse<Vec<EntityWithContext>>>> {
    let options = query.to_options()?;
    Ok(list_response(state.service.get_all(&options)))
}

/// GET /api/entities/:id
pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EntityQuery>,
) -> ApiResult<Json<ApiResponse<EntityWithContext>>> {
    let options = query.to_options()?;
    Ok(ApiResponse::ok(state.service.get_by_id(&id, &options)?))
}

/// GET /api/entities/type/:entity_type
pub async fn by_type(
    State(state): State<AppState>,
    Path(entity_type): Path<String>,
    Query(query): Query<EntityQuery>,
) -> ApiResult<Json<ApiResponse<Vec<EntityWithContext>>>> {
    let entity_type = parse_type(&entity_type)?;
    let options = query.to_options()?;
    Ok(list_response(state.service.get_by_type(entity_type, &options)))
}

/// GET /api/entities/source/:source
pub async fn by_source(
    State(state): State<AppState>,
    Path(source): Path<String>,
    Query(query): Query<EntityQuery>,
) -> ApiResult<Json<ApiResponse<Vec<EntityWithContext>>>> {
    let options = query.to_options()?;
    Ok(list_response(state.service.get_by_source(&source, &options)))
}

/// GET /api/entities/room/:room_id
pub async fn by_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<EntityQuery>,
) -> ApiResult<Json<ApiResponse<Vec<EntityWithContext>>>> {
    let options = query.to_options()?;
    Ok(list_response(state.service.get_by_room(&room_id, &options)?))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    #[serde(default = "default_search_limit")]
    pub limit: usize,
    #[serde(default)]
    pub include_room: bool,
    #[serde(default)]
    pub include_area: bool,
    #[serde(default)]
    pub available_only: bool,
}

fn default_search_limit() -> usize {
    20
}

/// GET /api/entities/search?q=
pub async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<ApiResponse<Vec<EntityWithContext>>>> {
    if query.q.trim().is_empty() {
        return Err(ApiError(CoreError::validation("q", "must not be empty")));
    }
    let options = QueryOptions {
        include_room: query.include_room,
        include_area: query.include_area,
        available_only: query.available_only,
        ..QueryOptions::default()
    };
    Ok(list_response(
        state.service.search(&query.q, query.limit, &options),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    pub action: String,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    pub description: Option<String>,
}

/// Translate an unsuccessful adapter result into the error taxonomy so
/// the surface answers 422 with the adapter's code embedded.
fn result_to_response(result: ActionResult) -> ApiResult<Json<ApiResponse<ActionResult>>> {
    if result.success {
        return Ok(ApiResponse::ok(result));
    }
    let (code, message) = match &result.error {
        Some(error) => (error.code, error.message.clone()),
        None => (
            ActionErrorCode::SourceUnavailable,
            "adapter reported failure without detail".to_string(),
        ),
    };
    Err(ApiError(CoreError::ActionFailed { code, message }))
}

/// POST /api/entities/:id/action
pub async fn execute_action(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ActionRequest>,
) -> ApiResult<Json<ApiResponse<ActionResult>>> {
    let mut context = ActionContext::new("api");
    context.description = body.description;

    let action = Action {
        entity_id: id,
        action: body.action,
        parameters: body.parameters,
        context,
    };
    let result = state.service.execute_action(action).await?;
    result_to_response(result)
}

#[derive(Debug, Deserialize)]
pub struct PutStateRequest {
    pub state: EntityState,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

fn action_for_state(state: EntityState) -> Option<&'static str> {
    match state {
        EntityState::On => Some("turn_on"),
        EntityState::Off => Some("turn_off"),
        EntityState::Open => Some("open"),
        EntityState::Closed => Some("close"),
        EntityState::Locked => Some("lock"),
        EntityState::Unlocked => Some("unlock"),
        EntityState::Playing => Some("play"),
        EntityState::Paused => Some("pause"),
        EntityState::Idle => Some("stop"),
        EntityState::Active => Some("activate"),
        _ => None,
    }
}

/// PUT /api/entities/:id/state — legacy surface, routed through the
/// action pipeline so the owning adapter stays the source of truth.
pub async fn put_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PutStateRequest>,
) -> ApiResult<Json<ApiResponse<ActionResult>>> {
    let Some(action_name) = action_for_state(body.state) else {
        return Err(ApiError(CoreError::validation(
            "state",
            format!("state '{}' cannot be requested directly", body.state),
        )));
    };

    let action = Action {
        entity_id: id,
        action: action_name.to_string(),
        parameters: body.attributes,
        context: ActionContext::new("api").with_description("legacy state write"),
    };
    let result = state.service.execute_action(action).await?;
    result_to_response(result)
}

#[derive(Debug, Deserialize)]
pub struct WriteEntityRequest {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub friendly_name: String,
    pub icon: Option<String>,
    pub state: Option<EntityState>,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub capabilities: HashSet<Capability>,
    pub room_id: Option<String>,
}

impl WriteEntityRequest {
    fn into_entity(self, id: String) -> Entity {
        let metadata = EntityMetadata::new(SOURCE_PMA, id.clone());
        let mut entity = Entity::new(
            id,
            self.entity_type,
            self.friendly_name,
            self.state.unwrap_or(EntityState::Unknown),
            metadata,
        );
        entity.icon = self.icon;
        entity.attributes = self.attributes;
        entity.capabilities = self.capabilities;
        entity.room_id = self.room_id;
        entity
    }
}

/// POST /api/entities — create a locally owned entity
pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<WriteEntityRequest>,
) -> ApiResult<Json<ApiResponse<Entity>>> {
    let id = match &body.id {
        Some(id) if !id.trim().is_empty() => id.clone(),
        _ => format!("pma_{}", ulid::Ulid::new().to_string().to_lowercase()),
    };
    let entity = body.into_entity(id);
    Ok(ApiResponse::ok(state.service.create_or_update_entity(entity)?))
}

/// PUT /api/entities/:id — update a locally owned entity
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<WriteEntityRequest>,
) -> ApiResult<Json<ApiResponse<Entity>>> {
    let entity = body.into_entity(id);
    Ok(ApiResponse::ok(state.service.create_or_update_entity(entity)?))
}

/// DELETE /api/entities/:id — delete a locally owned entity
pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<&'static str>>> {
    state.service.delete_entity(&id)?;
    Ok(ApiResponse::ok("deleted"))
}
