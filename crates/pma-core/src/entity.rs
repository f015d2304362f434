//! The unified entity model
//!
//! An Entity is the canonical representation of one controllable or
//! observable thing, normalised out of whatever shape the owning adapter
//! speaks. The state is always a semantic value from a closed set, never
//! raw adapter JSON; adapter-specific detail lives in `attributes`.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of entity types. The type determines which actions are
/// legal for an entity (see the type registry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Light,
    Switch,
    Sensor,
    BinarySensor,
    Climate,
    Cover,
    Camera,
    Lock,
    Fan,
    MediaPlayer,
    Scene,
    Device,
    Generic,
}

impl EntityType {
    /// All supported types, in declaration order.
    pub const ALL: &'static [EntityType] = &[
        EntityType::Light,
        EntityType::Switch,
        EntityType::Sensor,
        EntityType::BinarySensor,
        EntityType::Climate,
        EntityType::Cover,
        EntityType::Camera,
        EntityType::Lock,
        EntityType::Fan,
        EntityType::MediaPlayer,
        EntityType::Scene,
        EntityType::Device,
        EntityType::Generic,
    ];

    /// The snake_case wire name of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Light => "light",
            EntityType::Switch => "switch",
            EntityType::Sensor => "sensor",
            EntityType::BinarySensor => "binary_sensor",
            EntityType::Climate => "climate",
            EntityType::Cover => "cover",
            EntityType::Camera => "camera",
            EntityType::Lock => "lock",
            EntityType::Fan => "fan",
            EntityType::MediaPlayer => "media_player",
            EntityType::Scene => "scene",
            EntityType::Device => "device",
            EntityType::Generic => "generic",
        }
    }

    /// Parse a wire name back into a type.
    pub fn parse(s: &str) -> Option<EntityType> {
        EntityType::ALL.iter().copied().find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Semantic entity state drawn from a closed vocabulary.
///
/// Numeric readings (temperature, battery %) are attributes, not states;
/// a measuring sensor reports `Active` while it is delivering values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    On,
    Off,
    Open,
    Closed,
    Locked,
    Unlocked,
    Playing,
    Paused,
    Idle,
    Active,
    Detected,
    Clear,
    Unavailable,
    Unknown,
}

impl EntityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityState::On => "on",
            EntityState::Off => "off",
            EntityState::Open => "open",
            EntityState::Closed => "closed",
            EntityState::Locked => "locked",
            EntityState::Unlocked => "unlocked",
            EntityState::Playing => "playing",
            EntityState::Paused => "paused",
            EntityState::Idle => "idle",
            EntityState::Active => "active",
            EntityState::Detected => "detected",
            EntityState::Clear => "clear",
            EntityState::Unavailable => "unavailable",
            EntityState::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<EntityState> {
        match s {
            "on" => Some(EntityState::On),
            "off" => Some(EntityState::Off),
            "open" => Some(EntityState::Open),
            "closed" => Some(EntityState::Closed),
            "locked" => Some(EntityState::Locked),
            "unlocked" => Some(EntityState::Unlocked),
            "playing" => Some(EntityState::Playing),
            "paused" => Some(EntityState::Paused),
            "idle" => Some(EntityState::Idle),
            "active" => Some(EntityState::Active),
            "detected" => Some(EntityState::Detected),
            "clear" => Some(EntityState::Clear),
            "unavailable" => Some(EntityState::Unavailable),
            "unknown" => Some(EntityState::Unknown),
            _ => None,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, EntityState::Unavailable)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, EntityState::Unknown)
    }
}

impl std::fmt::Display for EntityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed capability vocabulary. A capability marks a type-specific trait
/// an entity instance possesses (a dimmable light, a camera that streams).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
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
}

/// Provenance and bookkeeping attached to every entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMetadata {
    /// Source tag of the owning adapter (or `pma` for local entities)
    pub source: String,

    /// The entity's id in the source's own namespace
    pub source_entity_id: String,

    /// When the entity was last reconciled against its source
    pub last_synced: DateTime<Utc>,

    /// Confidence in the entity's data, in `[0, 1]`
    pub quality_score: f64,

    /// True for entities that do not map to a physical device
    #[serde(default)]
    pub is_virtual: bool,
}

impl EntityMetadata {
    pub fn new(source: impl Into<String>, source_entity_id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            source_entity_id: source_entity_id.into(),
            last_synced: Utc::now(),
            quality_score: 1.0,
            is_virtual: false,
        }
    }
}

/// The canonical representation of one controllable or observable thing.
///
/// Type-specific detail is exposed through the typed attribute accessors
/// (`brightness`, `temperature`, ...) so the JSON shape stays identical
/// for every entity regardless of variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Stable globally unique id, `<source>_<source-local-id>` by convention
    pub id: String,

    /// Entity type, determines legal actions
    #[serde(rename = "type")]
    pub entity_type: EntityType,

    /// Display name
    pub friendly_name: String,

    /// Display icon (e.g. "mdi:lightbulb")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    /// Semantic state
    pub state: EntityState,

    /// Adapter-specific detail (brightness, temperature, stream URL, ...)
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,

    /// Capabilities this instance possesses
    #[serde(default)]
    pub capabilities: HashSet<Capability>,

    /// Room this entity belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,

    /// Area back-reference, if the source models areas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_id: Option<String>,

    /// Device back-reference, if the source models devices
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    /// False when the source cannot currently reach the entity
    pub available: bool,

    /// Timestamp of the most recent authoritative state, monotonically
    /// non-decreasing within a process lifetime
    pub last_updated: DateTime<Utc>,

    /// Provenance
    pub metadata: EntityMetadata,
}

impl Entity {
    /// Create an entity with defaults for the optional fields.
    pub fn new(
        id: impl Into<String>,
        entity_type: EntityType,
        friendly_name: impl Into<String>,
        state: EntityState,
        metadata: EntityMetadata,
    ) -> Self {
        Self {
            id: id.into(),
            entity_type,
            friendly_name: friendly_name.into(),
            icon: None,
            state,
            attributes: HashMap::new(),
            capabilities: HashSet::new(),
            room_id: None,
            area_id: None,
            device_id: None,
            available: true,
            last_updated: Utc::now(),
            metadata,
        }
    }

    /// Get a typed attribute value by key.
    pub fn attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Brightness in 0..=255, for lights with the Brightness capability.
    pub fn brightness(&self) -> Option<u8> {
        self.attribute("brightness")
    }

    /// Colour temperature in mireds.
    pub fn color_temp(&self) -> Option<u32> {
        self.attribute("color_temp")
    }

    /// Temperature reading in the source's configured unit.
    pub fn temperature(&self) -> Option<f64> {
        self.attribute("temperature")
    }

    /// Relative humidity percentage.
    pub fn humidity(&self) -> Option<f64> {
        self.attribute("humidity")
    }

    /// Battery level percentage.
    pub fn battery_level(&self) -> Option<f64> {
        self.attribute("battery_level")
    }

    /// Cover or blind position in 0..=100.
    pub fn position(&self) -> Option<u8> {
        self.attribute("position")
    }

    /// Media or notification volume in 0..=100.
    pub fn volume(&self) -> Option<u8> {
        self.attribute("volume")
    }

    /// Live stream URL for streaming cameras.
    pub fn stream_url(&self) -> Option<String> {
        self.attribute("stream_url")
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Whether this entity is owned by the gateway itself rather than an
    /// external source.
    pub fn is_pma_owned(&self) -> bool {
        self.metadata.source == crate::SOURCE_PMA
    }

    pub fn is_on(&self) -> bool {
        matches!(self.state, EntityState::On)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_light() -> Entity {
        let mut e = Entity::new(
            "ha_light_kitchen",
            EntityType::Light,
            "Kitchen Light",
            EntityState::On,
            EntityMetadata::new("homeassistant", "light.kitchen"),
        );
        e.attributes.insert("brightness".to_string(), json!(200));
        e.capabilities.insert(Capability::Dimmable);
        e.capabilities.insert(Capability::Brightness);
        e
    }

    #[test]
    fn test_typed_accessors() {
        let light = make_light();
        assert_eq!(light.brightness(), Some(200));
        assert_eq!(light.temperature(), None);
        assert!(light.has_capability(Capability::Dimmable));
        assert!(!light.has_capability(Capability::Motion));
    }

    #[test]
    fn test_json_shape_is_canonical() {
        let light = make_light();
        let value = serde_json::to_value(&light).unwrap();

        assert_eq!(value["id"], "ha_light_kitchen");
        assert_eq!(value["type"], "light");
        assert_eq!(value["state"], "on");
        assert_eq!(value["attributes"]["brightness"], 200);
        assert_eq!(value["metadata"]["source"], "homeassistant");
        // Optional back-references are omitted, not null
        assert!(value.get("room_id").is_none());
    }

    #[test]
    fn test_state_roundtrip() {
        for state in [
            EntityState::On,
            EntityState::Closed,
            EntityState::Playing,
            EntityState::Unavailable,
        ] {
            assert_eq!(EntityState::parse(state.as_str()), Some(state));
        }
        assert_eq!(EntityState::parse("warp_speed"), None);
    }

    #[test]
    fn test_type_roundtrip() {
        for t in EntityType::ALL {
            assert_eq!(EntityType::parse(t.as_str()), Some(*t));
        }
        assert_eq!(EntityType::parse("toaster"), None);
    }

    #[test]
    fn test_pma_ownership() {
        let light = make_light();
        assert!(!light.is_pma_owned());

        let local = Entity::new(
            "pma_virtual_switch",
            EntityType::Switch,
            "Virtual Switch",
            EntityState::Off,
            EntityMetadata::new(crate::SOURCE_PMA, "virtual_switch"),
        );
        assert!(local.is_pma_owned());
    }
}
