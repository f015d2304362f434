//! Room registry
//!
//! Mirror of the entity registry for rooms, with membership helpers and
//! aggregate statistics. Symmetric membership with entity back-references
//! is coordinated by the `Registries` aggregate.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use pma_core::{CoreError, CoreResult, Room};
use serde::Serialize;
use tracing::{debug, instrument};

#[derive(Default)]
struct Inner {
    rooms: HashMap<String, Room>,
    by_source: HashMap<String, Vec<String>>,
}

/// Aggregate statistics over all rooms.
#[derive(Debug, Clone, Serialize)]
pub struct RoomStats {
    pub total_rooms: usize,
    pub rooms_by_source: HashMap<String, usize>,
    pub total_assigned_entities: usize,
    /// Id and member count of the room with the most entities
    pub largest_room: Option<(String, usize)>,
    pub average_entities_per_room: f64,
}

/// Thread-safe registry of rooms.
pub struct RoomRegistry {
    inner: RwLock<Inner>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    #[instrument(skip(self, room), fields(room_id = %room.id))]
    pub fn register(&self, room: Room) -> CoreResult<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.rooms.contains_key(&room.id) {
            return Err(CoreError::Conflict {
                kind: "room",
                id: room.id,
                reason: "already registered".to_string(),
            });
        }

        debug!(source = %room.source, "Registering room");
        inner
            .by_source
            .entry(room.source.clone())
            .or_default()
            .push(room.id.clone());
        inner.rooms.insert(room.id.clone(), room);
        Ok(())
    }

    pub fn update(&self, mut room: Room) -> CoreResult<Room> {
        let mut inner = self.inner.write().unwrap();
        let (created_at, old_source) = {
            let existing = inner
                .rooms
                .get(&room.id)
                .ok_or_else(|| CoreError::room_not_found(&room.id))?;
            (existing.created_at, existing.source.clone())
        };

        room.created_at = created_at;
        room.updated_at = Utc::now();
        if room.source != old_source {
            if let Some(ids) = inner.by_source.get_mut(&old_source) {
                ids.retain(|id| id != &room.id);
            }
            inner
                .by_source
                .entry(room.source.clone())
                .or_default()
                .push(room.id.clone());
        }
        inner.rooms.insert(room.id.clone(), room.clone());
        Ok(room)
    }

    #[instrument(skip(self))]
    pub fn unregister(&self, id: &str) -> CoreResult<Room> {
        let mut inner = self.inner.write().unwrap();
        let room = inner
            .rooms
            .remove(id)
            .ok_or_else(|| CoreError::room_not_found(id))?;
        if let Some(ids) = inner.by_source.get_mut(&room.source) {
            ids.retain(|room_id| room_id != id);
        }
        Ok(room)
    }

    pub fn get(&self, id: &str) -> CoreResult<Room> {
        let inner = self.inner.read().unwrap();
        inner
            .rooms
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::room_not_found(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().unwrap().rooms.contains_key(id)
    }

    pub fn all(&self) -> Vec<Room> {
        self.inner.read().unwrap().rooms.values().cloned().collect()
    }

    pub fn by_source(&self, source: &str) -> Vec<Room> {
        let inner = self.inner.read().unwrap();
        inner
            .by_source
            .get(source)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.rooms.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Add an entity to a room's membership. Fails NotFound on a missing
    /// room; adding an existing member is a no-op.
    pub fn add_member(&self, room_id: &str, entity_id: &str) -> CoreResult<()> {
        let mut inner = self.inner.write().unwrap();
        let room = inner
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| CoreError::room_not_found(room_id))?;
        room.add_entity(entity_id);
        Ok(())
    }

    /// Remove an entity from a room's membership; missing room or member
    /// is a no-op so unregister paths stay idempotent.
    pub fn remove_member(&self, room_id: &str, entity_id: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(room) = inner.rooms.get_mut(room_id) {
            room.remove_entity(entity_id);
        }
    }

    pub fn stats(&self) -> RoomStats {
        let inner = self.inner.read().unwrap();
        let total_rooms = inner.rooms.len();
        let mut rooms_by_source: HashMap<String, usize> = HashMap::new();
        let mut total_assigned = 0usize;
        let mut largest: Option<(String, usize)> = None;

        for room in inner.rooms.values() {
            *rooms_by_source.entry(room.source.clone()).or_default() += 1;
            total_assigned += room.entity_ids.len();
            let count = room.entity_ids.len();
            if largest.as_ref().map(|(_, n)| count > *n).unwrap_or(true) {
                largest = Some((room.id.clone(), count));
            }
        }

        RoomStats {
            total_rooms,
            rooms_by_source,
            total_assigned_entities: total_assigned,
            largest_room: largest,
            average_entities_per_room: if total_rooms == 0 {
                0.0
            } else {
                total_assigned as f64 / total_rooms as f64
            },
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_conflict() {
        let registry = RoomRegistry::new();
        registry
            .register(Room::new("pma_room_1", "Kitchen", "pma"))
            .unwrap();
        assert!(registry.contains("pma_room_1"));
        assert!(matches!(
            registry.register(Room::new("pma_room_1", "Kitchen", "pma")),
            Err(CoreError::Conflict { .. })
        ));
    }

    #[test]
    fn test_membership_helpers() {
        let registry = RoomRegistry::new();
        registry
            .register(Room::new("pma_room_1", "Kitchen", "pma"))
            .unwrap();

        registry.add_member("pma_room_1", "ha_light_a").unwrap();
        registry.add_member("pma_room_1", "ha_light_a").unwrap();
        assert_eq!(registry.get("pma_room_1").unwrap().entity_ids.len(), 1);

        registry.remove_member("pma_room_1", "ha_light_a");
        assert!(registry.get("pma_room_1").unwrap().entity_ids.is_empty());

        // Missing rooms: add fails, remove is a no-op
        assert!(registry.add_member("ghost", "ha_light_a").is_err());
        registry.remove_member("ghost", "ha_light_a");
    }

    #[test]
    fn test_update_preserves_created_at() {
        let registry = RoomRegistry::new();
        let room = Room::new("pma_room_1", "Kitchen", "pma");
        let created = room.created_at;
        registry.register(room.clone()).unwrap();

        let mut renamed = room;
        renamed.name = "Galley".to_string();
        let stored = registry.update(renamed).unwrap();
        assert_eq!(stored.created_at, created);
        assert_eq!(stored.name, "Galley");
    }

    #[test]
    fn test_stats() {
        let registry = RoomRegistry::new();
        let mut kitchen = Room::new("pma_room_1", "Kitchen", "pma");
        kitchen.add_entity("a");
        kitchen.add_entity("b");
        kitchen.add_entity("c");
        let mut office = Room::new("ha_room_office", "Office", "homeassistant");
        office.add_entity("d");
        registry.register(kitchen).unwrap();
        registry.register(office).unwrap();

        let stats = registry.stats();
        assert_eq!(stats.total_rooms, 2);
        assert_eq!(stats.rooms_by_source["pma"], 1);
        assert_eq!(stats.total_assigned_entities, 4);
        assert_eq!(stats.largest_room, Some(("pma_room_1".to_string(), 3)));
        assert!((stats.average_entities_per_room - 2.0).abs() < f64::EPSILON);
    }
}
