//! Entity registry
//!
//! In-memory store of all entities keyed by id, with indexes by type,
//! source and room. One reader-writer lock guards the primary map and
//! every index together, so a mutation is never observable half-applied.
//! Read operations return cloned snapshots; callers never hold registry
//! locks.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use chrono::Utc;
use pma_core::{CoreError, CoreResult, Entity, EntityState, EntityType};
use tracing::{debug, instrument, warn};

#[derive(Default)]
struct Inner {
    entities: HashMap<String, Entity>,
    by_type: HashMap<EntityType, HashSet<String>>,
    by_source: HashMap<String, HashSet<String>>,
    by_room: HashMap<String, HashSet<String>>,
}

impl Inner {
    fn index(&mut self, entity: &Entity) {
        self.by_type
            .entry(entity.entity_type)
            .or_default()
            .insert(entity.id.clone());
        self.by_source
            .entry(entity.metadata.source.clone())
            .or_default()
            .insert(entity.id.clone());
        if let Some(room_id) = &entity.room_id {
            self.by_room
                .entry(room_id.clone())
                .or_default()
                .insert(entity.id.clone());
        }
    }

    fn unindex(&mut self, entity: &Entity) {
        if let Some(ids) = self.by_type.get_mut(&entity.entity_type) {
            ids.remove(&entity.id);
        }
        if let Some(ids) = self.by_source.get_mut(&entity.metadata.source) {
            ids.remove(&entity.id);
        }
        if let Some(room_id) = &entity.room_id {
            if let Some(ids) = self.by_room.get_mut(room_id) {
                ids.remove(&entity.id);
            }
        }
    }
}

/// Thread-safe registry of entities with secondary indexes.
pub struct EntityRegistry {
    inner: RwLock<Inner>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Insert a new entity. Fails with Conflict if the id already exists.
    #[instrument(skip(self, entity), fields(entity_id = %entity.id))]
    pub fn register(&self, entity: Entity) -> CoreResult<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.entities.contains_key(&entity.id) {
            return Err(CoreError::Conflict {
                kind: "entity",
                id: entity.id,
                reason: "already registered".to_string(),
            });
        }

        debug!(entity_type = %entity.entity_type, source = %entity.metadata.source, "Registering entity");
        inner.index(&entity);
        inner.entities.insert(entity.id.clone(), entity);
        Ok(())
    }

    /// Replace an existing entity. Fails with NotFound if absent.
    ///
    /// `last_updated` is clamped to be non-decreasing: an update carrying
    /// an older timestamp keeps the registry's newer one.
    #[instrument(skip(self, entity), fields(entity_id = %entity.id))]
    pub fn update(&self, mut entity: Entity) -> CoreResult<Entity> {
        let mut inner = self.inner.write().unwrap();
        let existing = inner
            .entities
            .get(&entity.id)
            .ok_or_else(|| CoreError::entity_not_found(&entity.id))?
            .clone();

        if entity.last_updated < existing.last_updated {
            entity.last_updated = existing.last_updated;
        }

        inner.unindex(&existing);
        inner.index(&entity);
        inner.entities.insert(entity.id.clone(), entity.clone());
        Ok(entity)
    }

    /// Remove an entity from the registry and all indexes. Returns the
    /// removed record so callers can reconcile room membership.
    #[instrument(skip(self))]
    pub fn unregister(&self, id: &str) -> CoreResult<Entity> {
        let mut inner = self.inner.write().unwrap();
        let entity = inner
            .entities
            .remove(id)
            .ok_or_else(|| CoreError::entity_not_found(id))?;
        inner.unindex(&entity);
        debug!(source = %entity.metadata.source, "Unregistered entity");
        Ok(entity)
    }

    pub fn get(&self, id: &str) -> CoreResult<Entity> {
        let inner = self.inner.read().unwrap();
        inner
            .entities
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::entity_not_found(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().unwrap().entities.contains_key(id)
    }

    pub fn all(&self) -> Vec<Entity> {
        let inner = self.inner.read().unwrap();
        inner.entities.values().cloned().collect()
    }

    pub fn by_type(&self, entity_type: EntityType) -> Vec<Entity> {
        let inner = self.inner.read().unwrap();
        inner
            .by_type
            .get(&entity_type)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.entities.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn by_source(&self, source: &str) -> Vec<Entity> {
        let inner = self.inner.read().unwrap();
        inner
            .by_source
            .get(source)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.entities.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn by_room(&self, room_id: &str) -> Vec<Entity> {
        let inner = self.inner.read().unwrap();
        inner
            .by_room
            .get(room_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.entities.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Case-insensitive substring search over id and friendly name,
    /// ordered best-match first.
    pub fn search(&self, query: &str, limit: usize) -> Vec<Entity> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }

        let inner = self.inner.read().unwrap();
        let mut ranked: Vec<(u8, &Entity)> = inner
            .entities
            .values()
            .filter_map(|e| {
                let id = e.id.to_lowercase();
                let name = e.friendly_name.to_lowercase();
                let rank = if id == needle {
                    0
                } else if id.starts_with(&needle) {
                    1
                } else if name.starts_with(&needle) {
                    2
                } else if id.contains(&needle) {
                    3
                } else if name.contains(&needle) {
                    4
                } else {
                    return None;
                };
                Some((rank, e))
            })
            .collect();

        ranked.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        ranked
            .into_iter()
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Adapter-sourced state update. Rejected when `source` is not the
    /// entity's owning source; invariant 5 keeps external entities
    /// read-only outside the action pipeline.
    #[instrument(skip(self))]
    pub fn update_state(&self, id: &str, new_state: EntityState, source: &str) -> CoreResult<Entity> {
        let mut inner = self.inner.write().unwrap();
        let entity = inner
            .entities
            .get_mut(id)
            .ok_or_else(|| CoreError::entity_not_found(id))?;

        if entity.metadata.source != source {
            warn!(
                owner = %entity.metadata.source,
                claimed = %source,
                "Rejecting state update from non-owning source"
            );
            return Err(CoreError::Forbidden(format!(
                "entity '{}' is owned by source '{}'",
                id, entity.metadata.source
            )));
        }

        entity.state = new_state;
        entity.available = !new_state.is_unavailable();
        entity.last_updated = Utc::now().max(entity.last_updated);
        Ok(entity.clone())
    }

    /// Set an entity's room back-reference, returning the previous value.
    /// Membership on the room side is reconciled by the caller.
    pub fn set_room(&self, id: &str, room_id: Option<String>) -> CoreResult<Option<String>> {
        let mut inner = self.inner.write().unwrap();
        let entity = inner
            .entities
            .get(id)
            .ok_or_else(|| CoreError::entity_not_found(id))?
            .clone();

        let previous = entity.room_id.clone();
        let mut updated = entity.clone();
        updated.room_id = room_id;
        updated.last_updated = Utc::now().max(entity.last_updated);

        inner.unindex(&entity);
        inner.index(&updated);
        inner.entities.insert(updated.id.clone(), updated);
        Ok(previous)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pma_core::EntityMetadata;

    fn make_entity(id: &str, entity_type: EntityType, source: &str) -> Entity {
        Entity::new(
            id,
            entity_type,
            id.replace('_', " "),
            EntityState::Off,
            EntityMetadata::new(source, id),
        )
    }

    #[test]
    fn test_register_conflict() {
        let registry = EntityRegistry::new();
        registry
            .register(make_entity("ha_light_kitchen", EntityType::Light, "homeassistant"))
            .unwrap();

        let err = registry
            .register(make_entity("ha_light_kitchen", EntityType::Light, "homeassistant"))
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict { .. }));
    }

    #[test]
    fn test_update_not_found() {
        let registry = EntityRegistry::new();
        let err = registry
            .update(make_entity("ghost", EntityType::Light, "homeassistant"))
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[test]
    fn test_last_updated_is_monotonic() {
        let registry = EntityRegistry::new();
        let entity = make_entity("ha_light_kitchen", EntityType::Light, "homeassistant");
        let original_ts = entity.last_updated;
        registry.register(entity.clone()).unwrap();

        // An update carrying an older timestamp must not move time backwards
        let mut stale = entity.clone();
        stale.last_updated = original_ts - chrono::Duration::seconds(60);
        let stored = registry.update(stale).unwrap();
        assert_eq!(stored.last_updated, original_ts);

        // update_state always lands at or after the stored timestamp
        let after = registry
            .update_state("ha_light_kitchen", EntityState::On, "homeassistant")
            .unwrap();
        assert!(after.last_updated >= original_ts);
    }

    #[test]
    fn test_indexes_follow_mutations() {
        let registry = EntityRegistry::new();
        registry
            .register(make_entity("ha_light_a", EntityType::Light, "homeassistant"))
            .unwrap();
        registry
            .register(make_entity("ha_light_b", EntityType::Light, "homeassistant"))
            .unwrap();
        registry
            .register(make_entity("ring_cam_door", EntityType::Camera, "ring"))
            .unwrap();

        assert_eq!(registry.by_type(EntityType::Light).len(), 2);
        assert_eq!(registry.by_source("ring").len(), 1);

        registry.unregister("ha_light_a").unwrap();
        assert_eq!(registry.by_type(EntityType::Light).len(), 1);
        assert!(registry.by_source("homeassistant").iter().all(|e| e.id == "ha_light_b"));
    }

    #[test]
    fn test_room_index() {
        let registry = EntityRegistry::new();
        registry
            .register(make_entity("ha_light_a", EntityType::Light, "homeassistant"))
            .unwrap();

        let previous = registry
            .set_room("ha_light_a", Some("pma_room_1".to_string()))
            .unwrap();
        assert!(previous.is_none());
        assert_eq!(registry.by_room("pma_room_1").len(), 1);

        let previous = registry.set_room("ha_light_a", None).unwrap();
        assert_eq!(previous.as_deref(), Some("pma_room_1"));
        assert!(registry.by_room("pma_room_1").is_empty());
    }

    #[test]
    fn test_update_state_rejects_wrong_source() {
        let registry = EntityRegistry::new();
        registry
            .register(make_entity("ha_light_a", EntityType::Light, "homeassistant"))
            .unwrap();

        let err = registry
            .update_state("ha_light_a", EntityState::On, "ring")
            .unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));

        // State untouched by the rejected update
        assert_eq!(registry.get("ha_light_a").unwrap().state, EntityState::Off);
    }

    #[test]
    fn test_update_state_tracks_availability() {
        let registry = EntityRegistry::new();
        registry
            .register(make_entity("ha_light_a", EntityType::Light, "homeassistant"))
            .unwrap();

        registry
            .update_state("ha_light_a", EntityState::Unavailable, "homeassistant")
            .unwrap();
        assert!(!registry.get("ha_light_a").unwrap().available);

        registry
            .update_state("ha_light_a", EntityState::On, "homeassistant")
            .unwrap();
        assert!(registry.get("ha_light_a").unwrap().available);
    }

    #[test]
    fn test_search_ranking() {
        let registry = EntityRegistry::new();
        let mut exact = make_entity("kitchen", EntityType::Light, "homeassistant");
        exact.friendly_name = "Exact".to_string();
        registry.register(exact).unwrap();
        registry
            .register(make_entity("kitchen_counter", EntityType::Light, "homeassistant"))
            .unwrap();
        let mut named = make_entity("ha_light_7", EntityType::Light, "homeassistant");
        named.friendly_name = "Kitchen Ceiling".to_string();
        registry.register(named).unwrap();
        let mut contains = make_entity("old_kitchen_lamp", EntityType::Light, "homeassistant");
        contains.friendly_name = "Lamp".to_string();
        registry.register(contains).unwrap();
        registry
            .register(make_entity("ha_light_8", EntityType::Light, "homeassistant"))
            .unwrap();

        let results = registry.search("kitchen", 10);
        let ids: Vec<&str> = results.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["kitchen", "kitchen_counter", "ha_light_7", "old_kitchen_lamp"]
        );

        assert!(registry.search("  ", 10).is_empty());
        assert_eq!(registry.search("kitchen", 2).len(), 2);
    }

    #[test]
    fn test_snapshots_do_not_alias() {
        let registry = EntityRegistry::new();
        registry
            .register(make_entity("ha_light_a", EntityType::Light, "homeassistant"))
            .unwrap();

        let mut snapshot = registry.all();
        snapshot[0].friendly_name = "mutated".to_string();
        assert_ne!(registry.get("ha_light_a").unwrap().friendly_name, "mutated");
    }
}
