//! PMA gateway registries
//!
//! This crate provides the in-process registries at the heart of the
//! gateway:
//! - TypeRegistry: catalogue of entity types, their actions and states
//! - EntityRegistry: entities keyed by id with type/source/room indexes
//! - RoomRegistry: rooms with entity membership sets
//!
//! The `Registries` aggregate wires the three together and owns every
//! operation that must keep an entity's `room_id` and the room's
//! `entity_ids` symmetric.

pub mod entity_registry;
pub mod room_registry;
pub mod type_registry;

pub use entity_registry::EntityRegistry;
pub use room_registry::{RoomRegistry, RoomStats};
pub use type_registry::{TypeInfo, TypeRegistry};

use pma_core::{CoreError, CoreResult, Entity, Room};
use tracing::instrument;

/// All registries bundled together.
///
/// Cross-registry mutations always touch the entity side first and the
/// room side second, so concurrent callers cannot deadlock and a reader
/// never observes an entity pointing at a room that denies membership
/// for longer than one reconciliation step.
pub struct Registries {
    pub types: TypeRegistry,
    pub entities: EntityRegistry,
    pub rooms: RoomRegistry,
}

impl Registries {
    pub fn new() -> Self {
        Self {
            types: TypeRegistry::new(),
            entities: EntityRegistry::new(),
            rooms: RoomRegistry::new(),
        }
    }

    /// Validate and register an entity, reconciling room membership. A
    /// `room_id` pointing at an unknown room is stripped rather than left
    /// dangling.
    #[instrument(skip(self, entity), fields(entity_id = %entity.id))]
    pub fn register_entity(&self, mut entity: Entity) -> CoreResult<()> {
        self.types.validate(&entity)?;

        if let Some(room_id) = entity.room_id.clone() {
            if !self.rooms.contains(&room_id) {
                entity.room_id = None;
            }
        }

        let room_id = entity.room_id.clone();
        let entity_id = entity.id.clone();
        self.entities.register(entity)?;
        if let Some(room_id) = room_id {
            self.rooms.add_member(&room_id, &entity_id)?;
        }
        Ok(())
    }

    /// Validate and update an entity, moving room membership if the
    /// back-reference changed.
    #[instrument(skip(self, entity), fields(entity_id = %entity.id))]
    pub fn update_entity(&self, mut entity: Entity) -> CoreResult<Entity> {
        self.types.validate(&entity)?;

        if let Some(room_id) = entity.room_id.clone() {
            if !self.rooms.contains(&room_id) {
                entity.room_id = None;
            }
        }

        let previous = self.entities.get(&entity.id)?;
        let updated = self.entities.update(entity)?;

        if previous.room_id != updated.room_id {
            if let Some(old_room) = &previous.room_id {
                self.rooms.remove_member(old_room, &updated.id);
            }
            if let Some(new_room) = &updated.room_id {
                self.rooms.add_member(new_room, &updated.id)?;
            }
        }
        Ok(updated)
    }

    /// Unregister an entity and drop it from its room's membership.
    #[instrument(skip(self))]
    pub fn unregister_entity(&self, id: &str) -> CoreResult<Entity> {
        let entity = self.entities.unregister(id)?;
        if let Some(room_id) = &entity.room_id {
            self.rooms.remove_member(room_id, id);
        }
        Ok(entity)
    }

    /// Move an entity into a room, updating both sides.
    #[instrument(skip(self))]
    pub fn assign_entity(&self, entity_id: &str, room_id: &str) -> CoreResult<()> {
        if !self.rooms.contains(room_id) {
            return Err(CoreError::room_not_found(room_id));
        }

        let previous = self.entities.set_room(entity_id, Some(room_id.to_string()))?;
        if let Some(old_room) = previous {
            if old_room != room_id {
                self.rooms.remove_member(&old_room, entity_id);
            }
        }
        self.rooms.add_member(room_id, entity_id)
    }

    /// Clear an entity's room assignment, updating both sides.
    #[instrument(skip(self))]
    pub fn unassign_entity(&self, entity_id: &str) -> CoreResult<()> {
        let previous = self.entities.set_room(entity_id, None)?;
        if let Some(old_room) = previous {
            self.rooms.remove_member(&old_room, entity_id);
        }
        Ok(())
    }

    /// Bulk-move every entity from one room to another. Atomic from the
    /// caller's perspective: the member list is snapshotted once and each
    /// entity is moved through the same symmetric path.
    #[instrument(skip(self))]
    pub fn reassign(&self, from_room: &str, to_room: &str) -> CoreResult<usize> {
        if !self.rooms.contains(to_room) {
            return Err(CoreError::room_not_found(to_room));
        }
        let members = self.rooms.get(from_room)?.entity_ids;
        let mut moved = 0;
        for entity_id in members {
            // A member that disappeared mid-move is not an error
            if self.assign_entity(&entity_id, to_room).is_ok() {
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Delete a room. Members are reassigned to `reassign_to` when given,
    /// otherwise their room reference is cleared.
    #[instrument(skip(self))]
    pub fn delete_room(&self, room_id: &str, reassign_to: Option<&str>) -> CoreResult<Room> {
        match reassign_to {
            Some(target) => {
                if target == room_id {
                    return Err(CoreError::validation(
                        "reassign_to_room_id",
                        "cannot reassign into the room being deleted",
                    ));
                }
                self.reassign(room_id, target)?;
            }
            None => {
                let members = self.rooms.get(room_id)?.entity_ids;
                for entity_id in members {
                    let _ = self.unassign_entity(&entity_id);
                }
            }
        }
        self.rooms.unregister(room_id)
    }
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pma_core::{EntityMetadata, EntityState, EntityType};

    fn make_entity(id: &str) -> Entity {
        Entity::new(
            id,
            EntityType::Light,
            id,
            EntityState::Off,
            EntityMetadata::new("homeassistant", id),
        )
    }

    fn membership_is_symmetric(registries: &Registries) -> bool {
        let entities = registries.entities.all();
        let rooms = registries.rooms.all();

        for entity in &entities {
            if let Some(room_id) = &entity.room_id {
                let Ok(room) = registries.rooms.get(room_id) else {
                    return false;
                };
                if !room.contains(&entity.id) {
                    return false;
                }
            }
        }
        for room in &rooms {
            for entity_id in &room.entity_ids {
                let Ok(entity) = registries.entities.get(entity_id) else {
                    return false;
                };
                if entity.room_id.as_deref() != Some(room.id.as_str()) {
                    return false;
                }
            }
        }
        true
    }

    #[test]
    fn test_assign_and_move_keep_membership_symmetric() {
        let registries = Registries::new();
        registries
            .rooms
            .register(Room::new("r1", "One", "pma"))
            .unwrap();
        registries
            .rooms
            .register(Room::new("r2", "Two", "pma"))
            .unwrap();
        registries.register_entity(make_entity("ha_light_a")).unwrap();

        registries.assign_entity("ha_light_a", "r1").unwrap();
        assert!(membership_is_symmetric(&registries));

        registries.assign_entity("ha_light_a", "r2").unwrap();
        assert!(membership_is_symmetric(&registries));
        assert!(!registries.rooms.get("r1").unwrap().contains("ha_light_a"));

        registries.unassign_entity("ha_light_a").unwrap();
        assert!(membership_is_symmetric(&registries));
    }

    #[test]
    fn test_register_strips_dangling_room() {
        let registries = Registries::new();
        let mut entity = make_entity("ha_light_a");
        entity.room_id = Some("no_such_room".to_string());
        registries.register_entity(entity).unwrap();

        assert!(registries.entities.get("ha_light_a").unwrap().room_id.is_none());
        assert!(membership_is_symmetric(&registries));
    }

    #[test]
    fn test_unregister_entity_cleans_room() {
        let registries = Registries::new();
        registries
            .rooms
            .register(Room::new("r1", "One", "pma"))
            .unwrap();
        registries.register_entity(make_entity("ha_light_a")).unwrap();
        registries.assign_entity("ha_light_a", "r1").unwrap();

        registries.unregister_entity("ha_light_a").unwrap();
        assert!(registries.rooms.get("r1").unwrap().entity_ids.is_empty());
    }

    #[test]
    fn test_delete_room_with_reassign() {
        let registries = Registries::new();
        registries
            .rooms
            .register(Room::new("r1", "One", "pma"))
            .unwrap();
        registries
            .rooms
            .register(Room::new("r2", "Two", "pma"))
            .unwrap();
        registries.register_entity(make_entity("e1")).unwrap();
        registries.register_entity(make_entity("e2")).unwrap();
        registries.assign_entity("e1", "r1").unwrap();
        registries.assign_entity("e2", "r1").unwrap();

        registries.delete_room("r1", Some("r2")).unwrap();

        assert!(!registries.rooms.contains("r1"));
        let r2 = registries.rooms.get("r2").unwrap();
        assert!(r2.contains("e1") && r2.contains("e2"));
        assert_eq!(
            registries.entities.get("e1").unwrap().room_id.as_deref(),
            Some("r2")
        );
        assert!(membership_is_symmetric(&registries));
    }

    #[test]
    fn test_delete_room_without_reassign_clears_members() {
        let registries = Registries::new();
        registries
            .rooms
            .register(Room::new("r1", "One", "pma"))
            .unwrap();
        registries.register_entity(make_entity("e1")).unwrap();
        registries.assign_entity("e1", "r1").unwrap();

        registries.delete_room("r1", None).unwrap();
        assert!(registries.entities.get("e1").unwrap().room_id.is_none());
    }

    #[test]
    fn test_delete_room_rejects_self_reassign() {
        let registries = Registries::new();
        registries
            .rooms
            .register(Room::new("r1", "One", "pma"))
            .unwrap();
        assert!(matches!(
            registries.delete_room("r1", Some("r1")),
            Err(CoreError::Validation { .. })
        ));
    }

    #[test]
    fn test_update_entity_moves_membership() {
        let registries = Registries::new();
        registries
            .rooms
            .register(Room::new("r1", "One", "pma"))
            .unwrap();
        registries
            .rooms
            .register(Room::new("r2", "Two", "pma"))
            .unwrap();
        registries.register_entity(make_entity("e1")).unwrap();
        registries.assign_entity("e1", "r1").unwrap();

        let mut moved = registries.entities.get("e1").unwrap();
        moved.room_id = Some("r2".to_string());
        registries.update_entity(moved).unwrap();

        assert!(membership_is_symmetric(&registries));
        assert!(registries.rooms.get("r2").unwrap().contains("e1"));
    }
}
