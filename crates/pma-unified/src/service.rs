//! Unified service facade
//!
//! The coarse read/write API the HTTP surface calls. Long-lived and
//! injected once at wiring time; handlers never construct per-request
//! service objects.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pma_adapters::{AdapterRecord, AdapterRegistry};
use pma_core::{
    Action, ActionResult, Capability, CoreError, CoreResult, Entity, EntityState, EntityType,
    Room, SyncResult, SOURCE_PMA,
};
use pma_events::{Hub, RoomChange, RoomUpdatedEvent, StateChangeEvent};
use pma_registries::{Registries, RoomStats};
use pma_sync::SyncCoordinator;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::pipeline::ActionPipeline;

/// Options accepted by every read operation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryOptions {
    #[serde(default)]
    pub include_room: bool,
    #[serde(default)]
    pub include_area: bool,
    #[serde(default)]
    pub available_only: bool,
    /// Keep only entities carrying all of these capabilities
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Keep only entities of this type
    #[serde(default)]
    pub domain: Option<EntityType>,
}

/// Area reference resolved from an entity's back-reference.
#[derive(Debug, Clone, Serialize)]
pub struct AreaRef {
    pub id: String,
}

/// A read result: the entity plus optional resolved context.
#[derive(Debug, Clone, Serialize)]
pub struct EntityWithContext {
    pub entity: Entity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<Room>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area: Option<AreaRef>,
}

/// A room plus, optionally, its member entities resolved.
#[derive(Debug, Clone, Serialize)]
pub struct RoomWithEntities {
    #[serde(flatten)]
    pub room: Room,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entities: Option<Vec<Entity>>,
}

/// Gateway-level status summary.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub entities: usize,
    pub rooms: usize,
    pub adapters: Vec<AdapterRecord>,
    pub started_at: DateTime<Utc>,
    pub version: String,
}

/// Coarse API over registries, pipeline and sync coordinator.
pub struct UnifiedService {
    registries: Arc<Registries>,
    adapters: Arc<AdapterRegistry>,
    pipeline: ActionPipeline,
    sync: Arc<SyncCoordinator>,
    hub: Arc<Hub>,
    started_at: DateTime<Utc>,
}

impl UnifiedService {
    pub fn new(
        registries: Arc<Registries>,
        adapters: Arc<AdapterRegistry>,
        pipeline: ActionPipeline,
        sync: Arc<SyncCoordinator>,
        hub: Arc<Hub>,
    ) -> Self {
        Self {
            registries,
            adapters,
            pipeline,
            sync,
            hub,
            started_at: Utc::now(),
        }
    }

    // ==================== Reads ====================

    pub fn get_all(&self, options: &QueryOptions) -> Vec<EntityWithContext> {
        self.project(self.registries.entities.all(), options)
    }

    pub fn get_by_id(&self, id: &str, options: &QueryOptions) -> CoreResult<EntityWithContext> {
        let entity = self.registries.entities.get(id)?;
        Ok(self.resolve(entity, options))
    }

    pub fn get_by_type(
        &self,
        entity_type: EntityType,
        options: &QueryOptions,
    ) -> Vec<EntityWithContext> {
        self.project(self.registries.entities.by_type(entity_type), options)
    }

    pub fn get_by_source(&self, source: &str, options: &QueryOptions) -> Vec<EntityWithContext> {
        self.project(self.registries.entities.by_source(source), options)
    }

    pub fn get_by_room(
        &self,
        room_id: &str,
        options: &QueryOptions,
    ) -> CoreResult<Vec<EntityWithContext>> {
        // Distinguish an unknown room from an empty one
        self.registries.rooms.get(room_id)?;
        Ok(self.project(self.registries.entities.by_room(room_id), options))
    }

    pub fn search(
        &self,
        query: &str,
        limit: usize,
        options: &QueryOptions,
    ) -> Vec<EntityWithContext> {
        self.project(self.registries.entities.search(query, limit), options)
    }

    // ==================== Writes ====================

    pub async fn execute_action(&self, action: Action) -> CoreResult<ActionResult> {
        self.pipeline.execute(action).await
    }

    pub async fn sync_from_source(&self, source: &str) -> CoreResult<SyncResult> {
        self.sync.sync_from_source(source).await
    }

    pub async fn sync_from_all(&self) -> Vec<SyncResult> {
        self.sync.sync_from_all_sources().await
    }

    pub fn sync_history(&self, limit: usize) -> Vec<SyncResult> {
        self.sync.history(limit)
    }

    /// Entry point for adapters that push asynchronous state updates
    /// outside a sync cycle.
    #[instrument(skip(self))]
    pub fn update_entity_state(
        &self,
        id: &str,
        state: EntityState,
        source: &str,
    ) -> CoreResult<Entity> {
        let old_state = self.registries.entities.get(id)?.state;
        let updated = self.registries.entities.update_state(id, state, source)?;
        if updated.state != old_state {
            self.hub.publish_state_change(StateChangeEvent {
                entity_id: id.to_string(),
                old_state,
                new_state: updated.state,
                source: source.to_string(),
                entity: updated.clone(),
                action_result: None,
            });
        }
        Ok(updated)
    }

    /// Create or update a locally owned entity. External-sourced entities
    /// are read-only outside the action pipeline.
    #[instrument(skip(self, entity), fields(entity_id = %entity.id))]
    pub fn create_or_update_entity(&self, mut entity: Entity) -> CoreResult<Entity> {
        if entity.metadata.source != SOURCE_PMA {
            return Err(CoreError::Forbidden(format!(
                "only '{SOURCE_PMA}'-sourced entities may be written; got '{}'",
                entity.metadata.source
            )));
        }
        entity.metadata.is_virtual = true;
        entity.metadata.last_synced = Utc::now();

        match self.registries.entities.get(&entity.id) {
            Ok(existing) => {
                if existing.metadata.source != SOURCE_PMA {
                    return Err(CoreError::Forbidden(format!(
                        "entity '{}' is owned by source '{}'",
                        entity.id, existing.metadata.source
                    )));
                }
                let old_state = existing.state;
                let updated = self.registries.update_entity(entity)?;
                if updated.state != old_state {
                    self.hub.publish_state_change(StateChangeEvent {
                        entity_id: updated.id.clone(),
                        old_state,
                        new_state: updated.state,
                        source: SOURCE_PMA.to_string(),
                        entity: updated.clone(),
                        action_result: None,
                    });
                }
                Ok(updated)
            }
            Err(_) => {
                self.registries.register_entity(entity.clone())?;
                let stored = self.registries.entities.get(&entity.id)?;
                self.hub.publish_entity_added(&stored);
                Ok(stored)
            }
        }
    }

    /// Delete a locally owned entity.
    #[instrument(skip(self))]
    pub fn delete_entity(&self, id: &str) -> CoreResult<()> {
        let entity = self.registries.entities.get(id)?;
        if entity.metadata.source != SOURCE_PMA {
            return Err(CoreError::Forbidden(format!(
                "entity '{}' is owned by source '{}'",
                id, entity.metadata.source
            )));
        }
        self.registries.unregister_entity(id)?;
        self.hub.publish_entity_removed(id, SOURCE_PMA);
        Ok(())
    }

    // ==================== Rooms ====================

    pub fn get_rooms(&self, include_entities: bool) -> Vec<RoomWithEntities> {
        let mut rooms: Vec<_> = self
            .registries
            .rooms
            .all()
            .into_iter()
            .map(|room| self.resolve_room(room, include_entities))
            .collect();
        rooms.sort_by(|a, b| a.room.id.cmp(&b.room.id));
        rooms
    }

    pub fn get_room(&self, id: &str, include_entities: bool) -> CoreResult<RoomWithEntities> {
        let room = self.registries.rooms.get(id)?;
        Ok(self.resolve_room(room, include_entities))
    }

    #[instrument(skip(self))]
    pub fn create_room(
        &self,
        name: &str,
        icon: Option<String>,
        description: Option<String>,
    ) -> CoreResult<Room> {
        if name.trim().is_empty() {
            return Err(CoreError::validation("name", "must not be empty"));
        }
        let id = format!("pma_room_{}", ulid::Ulid::new().to_string().to_lowercase());
        let mut room = self.registries.types.create_room(id, name);
        if icon.is_some() {
            room.icon = icon;
        }
        room.description = description;

        self.registries.rooms.register(room.clone())?;
        self.hub.publish_room_updated(RoomUpdatedEvent {
            room_id: room.id.clone(),
            name: room.name.clone(),
            change: RoomChange::Created,
        });
        Ok(room)
    }

    /// Rename or restyle a locally owned room.
    #[instrument(skip(self))]
    pub fn update_room(
        &self,
        id: &str,
        name: Option<String>,
        icon: Option<String>,
        description: Option<String>,
    ) -> CoreResult<Room> {
        let mut room = self.registries.rooms.get(id)?;
        if room.source != SOURCE_PMA {
            return Err(CoreError::Forbidden(format!(
                "room '{}' is owned by source '{}'",
                id, room.source
            )));
        }
        if let Some(name) = name {
            room.name = name;
        }
        if let Some(icon) = icon {
            room.icon = Some(icon);
        }
        if let Some(description) = description {
            room.description = Some(description);
        }

        let updated = self.registries.rooms.update(room)?;
        self.hub.publish_room_updated(RoomUpdatedEvent {
            room_id: updated.id.clone(),
            name: updated.name.clone(),
            change: RoomChange::Updated,
        });
        Ok(updated)
    }

    /// Delete a locally owned room, reassigning or releasing members.
    #[instrument(skip(self))]
    pub fn delete_room(&self, id: &str, reassign_to: Option<&str>) -> CoreResult<()> {
        let room = self.registries.rooms.get(id)?;
        if room.source != SOURCE_PMA {
            return Err(CoreError::Forbidden(format!(
                "room '{}' is owned by source '{}'",
                id, room.source
            )));
        }

        let removed = self.registries.delete_room(id, reassign_to)?;
        self.hub.publish_room_updated(RoomUpdatedEvent {
            room_id: removed.id,
            name: removed.name,
            change: RoomChange::Deleted,
        });
        Ok(())
    }

    pub fn assign_entity_to_room(&self, entity_id: &str, room_id: &str) -> CoreResult<()> {
        self.registries.assign_entity(entity_id, room_id)
    }

    pub fn room_stats(&self) -> RoomStats {
        self.registries.rooms.stats()
    }

    // ==================== Status ====================

    pub fn system_status(&self) -> SystemStatus {
        SystemStatus {
            entities: self.registries.entities.len(),
            rooms: self.registries.rooms.len(),
            adapters: self.adapters.records(),
            started_at: self.started_at,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn adapter_records(&self) -> Vec<AdapterRecord> {
        self.adapters.records()
    }

    pub fn adapter_record(&self, id: &str) -> CoreResult<AdapterRecord> {
        self.adapters.record(id)
    }

    // ==================== Internals ====================

    fn matches(&self, entity: &Entity, options: &QueryOptions) -> bool {
        if options.available_only && !entity.available {
            return false;
        }
        if let Some(domain) = options.domain {
            if entity.entity_type != domain {
                return false;
            }
        }
        options
            .capabilities
            .iter()
            .all(|capability| entity.capabilities.contains(capability))
    }

    fn project(&self, entities: Vec<Entity>, options: &QueryOptions) -> Vec<EntityWithContext> {
        let mut results: Vec<_> = entities
            .into_iter()
            .filter(|entity| self.matches(entity, options))
            .map(|entity| self.resolve(entity, options))
            .collect();
        results.sort_by(|a, b| a.entity.id.cmp(&b.entity.id));
        results
    }

    fn resolve(&self, entity: Entity, options: &QueryOptions) -> EntityWithContext {
        let room = if options.include_room {
            entity
                .room_id
                .as_deref()
                .and_then(|room_id| self.registries.rooms.get(room_id).ok())
        } else {
            None
        };
        let area = if options.include_area {
            entity.area_id.clone().map(|id| AreaRef { id })
        } else {
            None
        };
        EntityWithContext { entity, room, area }
    }

    fn resolve_room(&self, room: Room, include_entities: bool) -> RoomWithEntities {
        let entities = include_entities.then(|| {
            room.entity_ids
                .iter()
                .filter_map(|id| self.registries.entities.get(id).ok())
                .collect()
        });
        RoomWithEntities { room, entities }
    }
}
