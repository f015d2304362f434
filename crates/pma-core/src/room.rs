//! Room model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A room groups entities for display and bulk operations.
///
/// `entity_ids` is an ordered set: membership is unique, insertion order
/// is preserved for the UI. The room registry keeps it symmetric with the
/// entities' own `room_id` back-references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    /// Stable room id; `pma_room_<ulid>` for locally created rooms
    pub id: String,

    /// Display name
    pub name: String,

    /// Display icon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Source tag of the adapter that owns this room (`pma` for local)
    pub source: String,

    /// Ids of member entities, ordered, no duplicates
    #[serde(default)]
    pub entity_ids: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Room {
    /// Create a room with empty membership.
    pub fn new(id: impl Into<String>, name: impl Into<String>, source: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            icon: None,
            description: None,
            source: source.into(),
            entity_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a locally owned room with a generated id.
    pub fn new_local(name: impl Into<String>) -> Self {
        let id = format!("pma_room_{}", ulid::Ulid::new().to_string().to_lowercase());
        Self::new(id, name, crate::SOURCE_PMA)
    }

    /// Add an entity id, preserving order and uniqueness. Returns true if
    /// the membership changed.
    pub fn add_entity(&mut self, entity_id: &str) -> bool {
        if self.entity_ids.iter().any(|id| id == entity_id) {
            return false;
        }
        self.entity_ids.push(entity_id.to_string());
        self.updated_at = Utc::now();
        true
    }

    /// Remove an entity id. Returns true if it was a member.
    pub fn remove_entity(&mut self, entity_id: &str) -> bool {
        let before = self.entity_ids.len();
        self.entity_ids.retain(|id| id != entity_id);
        if self.entity_ids.len() != before {
            self.updated_at = Utc::now();
            true
        } else {
            false
        }
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.entity_ids.iter().any(|id| id == entity_id)
    }

    pub fn is_pma_owned(&self) -> bool {
        self.source == crate::SOURCE_PMA
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_is_ordered_set() {
        let mut room = Room::new_local("Living Room");
        assert!(room.add_entity("ha_light_sofa"));
        assert!(room.add_entity("ha_sensor_temp"));
        assert!(!room.add_entity("ha_light_sofa"));

        assert_eq!(room.entity_ids, vec!["ha_light_sofa", "ha_sensor_temp"]);
        assert!(room.contains("ha_sensor_temp"));

        assert!(room.remove_entity("ha_light_sofa"));
        assert!(!room.remove_entity("ha_light_sofa"));
        assert_eq!(room.entity_ids, vec!["ha_sensor_temp"]);
    }

    #[test]
    fn test_local_room_id_prefix() {
        let room = Room::new_local("Office");
        assert!(room.id.starts_with("pma_room_"));
        assert!(room.is_pma_owned());
    }
}
