//! Type registry
//!
//! Canonical catalogue of entity types: which capabilities a type may
//! declare, which actions it accepts, which semantic states are legal,
//! and the display defaults. Read-mostly, built once at start-up.

use std::collections::HashMap;

use pma_core::{Capability, CoreError, CoreResult, Entity, EntityState, EntityType, Room};

/// Everything the gateway knows about one entity type.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    /// Superset of capabilities instances of this type may declare
    pub capabilities: Vec<Capability>,

    /// Actions instances of this type accept
    pub actions: Vec<&'static str>,

    /// Icon used when the source provides none
    pub default_icon: &'static str,

    /// State used when the source provides none
    pub default_state: EntityState,

    /// Semantic states legal for this type (Unavailable and Unknown are
    /// always legal and not listed)
    pub legal_states: Vec<EntityState>,

    /// Attributes an instance must carry to validate
    pub mandatory_attributes: Vec<&'static str>,
}

/// Catalogue of entity types and validation of entity instances.
pub struct TypeRegistry {
    types: HashMap<EntityType, TypeInfo>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        use Capability::*;
        use EntityState::*;
        use EntityType::*;

        let mut types = HashMap::new();

        types.insert(
            Light,
            TypeInfo {
                capabilities: vec![Dimmable, Colorable, Brightness, Connectivity],
                actions: vec!["turn_on", "turn_off", "toggle", "set_brightness", "set_color"],
                default_icon: "mdi:lightbulb",
                default_state: Off,
                legal_states: vec![On, Off],
                mandatory_attributes: vec![],
            },
        );
        types.insert(
            Switch,
            TypeInfo {
                capabilities: vec![Connectivity],
                actions: vec!["turn_on", "turn_off", "toggle"],
                default_icon: "mdi:toggle-switch",
                default_state: Off,
                legal_states: vec![On, Off],
                mandatory_attributes: vec![],
            },
        );
        types.insert(
            Sensor,
            TypeInfo {
                capabilities: vec![Temperature, Humidity, Battery, Connectivity],
                actions: vec![],
                default_icon: "mdi:gauge",
                default_state: Unknown,
                legal_states: vec![Active, Idle],
                mandatory_attributes: vec![],
            },
        );
        types.insert(
            BinarySensor,
            TypeInfo {
                capabilities: vec![Motion, Battery, Connectivity],
                actions: vec![],
                default_icon: "mdi:checkbox-blank-circle-outline",
                default_state: Clear,
                legal_states: vec![On, Off, Detected, Clear],
                mandatory_attributes: vec![],
            },
        );
        types.insert(
            Climate,
            TypeInfo {
                capabilities: vec![Temperature, Humidity, Connectivity],
                actions: vec!["turn_on", "turn_off", "set_temperature", "set_hvac_mode"],
                default_icon: "mdi:thermostat",
                default_state: Idle,
                legal_states: vec![On, Off, Idle, Active],
                mandatory_attributes: vec!["temperature"],
            },
        );
        types.insert(
            Cover,
            TypeInfo {
                capabilities: vec![Position, Battery, Connectivity],
                actions: vec!["open", "close", "stop", "set_position"],
                default_icon: "mdi:window-shutter",
                default_state: Closed,
                legal_states: vec![Open, Closed],
                mandatory_attributes: vec![],
            },
        );
        types.insert(
            Camera,
            TypeInfo {
                capabilities: vec![Motion, Recording, Streaming, Battery, Connectivity],
                actions: vec!["start_stream", "stop_stream", "snapshot", "enable_recording", "disable_recording"],
                default_icon: "mdi:cctv",
                default_state: Idle,
                legal_states: vec![Idle, Active],
                mandatory_attributes: vec![],
            },
        );
        types.insert(
            Lock,
            TypeInfo {
                capabilities: vec![Battery, Notification, Connectivity],
                actions: vec!["lock", "unlock"],
                default_icon: "mdi:lock",
                default_state: Locked,
                legal_states: vec![Locked, Unlocked],
                mandatory_attributes: vec![],
            },
        );
        types.insert(
            Fan,
            TypeInfo {
                capabilities: vec![Connectivity],
                actions: vec!["turn_on", "turn_off", "toggle", "set_speed"],
                default_icon: "mdi:fan",
                default_state: Off,
                legal_states: vec![On, Off],
                mandatory_attributes: vec![],
            },
        );
        types.insert(
            MediaPlayer,
            TypeInfo {
                capabilities: vec![Volume, Connectivity],
                actions: vec![
                    "turn_on",
                    "turn_off",
                    "play",
                    "pause",
                    "stop",
                    "next_track",
                    "previous_track",
                    "set_volume",
                ],
                default_icon: "mdi:speaker",
                default_state: Idle,
                legal_states: vec![On, Off, Playing, Paused, Idle],
                mandatory_attributes: vec![],
            },
        );
        types.insert(
            Scene,
            TypeInfo {
                capabilities: vec![],
                actions: vec!["activate"],
                default_icon: "mdi:palette",
                default_state: Idle,
                legal_states: vec![Idle, Active],
                mandatory_attributes: vec![],
            },
        );
        types.insert(
            Device,
            TypeInfo {
                capabilities: vec![Battery, Connectivity, Notification],
                actions: vec!["turn_on", "turn_off"],
                default_icon: "mdi:devices",
                default_state: Unknown,
                legal_states: vec![On, Off, Idle, Active],
                mandatory_attributes: vec![],
            },
        );
        types.insert(
            Generic,
            TypeInfo {
                capabilities: vec![
                    Dimmable,
                    Colorable,
                    Temperature,
                    Humidity,
                    Position,
                    Volume,
                    Brightness,
                    Motion,
                    Recording,
                    Streaming,
                    Notification,
                    Battery,
                    Connectivity,
                ],
                actions: vec!["turn_on", "turn_off", "toggle"],
                default_icon: "mdi:help-circle",
                default_state: Unknown,
                legal_states: vec![
                    On, Off, Open, Closed, Locked, Unlocked, Playing, Paused, Idle, Active,
                    Detected, Clear,
                ],
                mandatory_attributes: vec![],
            },
        );

        Self { types }
    }

    /// All supported entity types.
    pub fn supported_types(&self) -> Vec<EntityType> {
        EntityType::ALL.to_vec()
    }

    pub fn info(&self, entity_type: EntityType) -> &TypeInfo {
        // The table covers every EntityType variant
        &self.types[&entity_type]
    }

    /// Whether the given action is legal for the given type.
    pub fn supports_action(&self, entity_type: EntityType, action: &str) -> bool {
        self.info(entity_type).actions.iter().any(|a| *a == action)
    }

    /// Whether the state is legal for the type. Unavailable and Unknown
    /// are legal everywhere.
    pub fn is_legal_state(&self, entity_type: EntityType, state: EntityState) -> bool {
        state.is_unavailable()
            || state.is_unknown()
            || self.info(entity_type).legal_states.contains(&state)
    }

    /// Validate an entity instance against the catalogue.
    pub fn validate(&self, entity: &Entity) -> CoreResult<()> {
        if entity.id.trim().is_empty() {
            return Err(CoreError::validation("id", "must not be empty"));
        }

        let info = self.info(entity.entity_type);

        if !self.is_legal_state(entity.entity_type, entity.state) {
            return Err(CoreError::validation(
                "state",
                format!(
                    "'{}' is not a legal state for type '{}'",
                    entity.state, entity.entity_type
                ),
            ));
        }

        for capability in &entity.capabilities {
            if !info.capabilities.contains(capability) {
                return Err(CoreError::validation(
                    "capabilities",
                    format!(
                        "type '{}' does not declare capability {:?}",
                        entity.entity_type, capability
                    ),
                ));
            }
        }

        for attr in &info.mandatory_attributes {
            if !entity.attributes.contains_key(*attr) {
                return Err(CoreError::validation(
                    "attributes",
                    format!(
                        "type '{}' requires attribute '{}'",
                        entity.entity_type, attr
                    ),
                ));
            }
        }

        Ok(())
    }

    /// Create a room with the default icon and empty membership.
    pub fn create_room(&self, id: impl Into<String>, name: impl Into<String>) -> Room {
        let mut room = Room::new(id, name, pma_core::SOURCE_PMA);
        room.icon = Some("mdi:door".to_string());
        room
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
