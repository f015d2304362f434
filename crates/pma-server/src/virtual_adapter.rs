//! Built-in virtual source
//!
//! Serves a small set of generated devices so the whole stack (sync,
//! actions, push channel) can be exercised without any upstream system.
//! Enabled with `virtual_source: true` in the config.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use pma_adapters::{Adapter, AdapterHealth, AdapterMetrics};
use pma_core::{
    Action, ActionError, ActionErrorCode, ActionResult, Capability, CoreResult, Entity,
    EntityMetadata, EntityState, EntityType, Room,
};
use serde_json::json;

pub const VIRTUAL_SOURCE: &str = "virtual";

pub struct VirtualAdapter {
    connected: AtomicBool,
    entities: Mutex<HashMap<String, Entity>>,
    order: Vec<String>,
    rooms: Vec<Room>,
    actions_executed: AtomicU64,
    actions_failed: AtomicU64,
}

impl VirtualAdapter {
    pub fn new() -> Self {
        let seed = seed_entities();
        let order = seed.iter().map(|e| e.id.clone()).collect();
        let entities = seed.into_iter().map(|e| (e.id.clone(), e)).collect();

        let mut living_room = Room::new("virtual_room_living", "Living Room", VIRTUAL_SOURCE);
        living_room.icon = Some("mdi:sofa".to_string());
        living_room.add_entity("virtual_light_ceiling");
        living_room.add_entity("virtual_sensor_climate");
        let mut porch = Room::new("virtual_room_porch", "Porch", VIRTUAL_SOURCE);
        porch.icon = Some("mdi:door-open".to_string());
        porch.add_entity("virtual_cam_porch");

        Self {
            connected: AtomicBool::new(false),
            entities: Mutex::new(entities),
            order,
            rooms: vec![living_room, porch],
            actions_executed: AtomicU64::new(0),
            actions_failed: AtomicU64::new(0),
        }
    }
}

impl Default for VirtualAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn seed_entities() -> Vec<Entity> {
    let mut ceiling = Entity::new(
        "virtual_light_ceiling",
        EntityType::Light,
        "Ceiling Light",
        EntityState::Off,
        EntityMetadata::new(VIRTUAL_SOURCE, "light_ceiling"),
    );
    ceiling.icon = Some("mdi:ceiling-light".to_string());
    ceiling.attributes.insert("brightness".to_string(), json!(180));
    ceiling.capabilities.insert(Capability::Dimmable);
    ceiling.capabilities.insert(Capability::Brightness);
    ceiling.metadata.is_virtual = true;

    let mut climate = Entity::new(
        "virtual_sensor_climate",
        EntityType::Sensor,
        "Climate Sensor",
        EntityState::Active,
        EntityMetadata::new(VIRTUAL_SOURCE, "sensor_climate"),
    );
    climate.attributes.insert("temperature".to_string(), json!(21.4));
    climate.attributes.insert("humidity".to_string(), json!(48.0));
    climate.capabilities.insert(Capability::Temperature);
    climate.capabilities.insert(Capability::Humidity);
    climate.metadata.is_virtual = true;

    let mut porch_cam = Entity::new(
        "virtual_cam_porch",
        EntityType::Camera,
        "Porch Camera",
        EntityState::Idle,
        EntityMetadata::new(VIRTUAL_SOURCE, "cam_porch"),
    );
    porch_cam
        .attributes
        .insert("stream_url".to_string(), json!("rtsp://127.0.0.1/porch"));
    porch_cam.capabilities.insert(Capability::Streaming);
    porch_cam.capabilities.insert(Capability::Motion);
    porch_cam.metadata.is_virtual = true;

    let mut front_lock = Entity::new(
        "virtual_lock_front",
        EntityType::Lock,
        "Front Door",
        EntityState::Locked,
        EntityMetadata::new(VIRTUAL_SOURCE, "lock_front"),
    );
    front_lock.attributes.insert("battery_level".to_string(), json!(92.0));
    front_lock.capabilities.insert(Capability::Battery);
    front_lock.metadata.is_virtual = true;

    vec![ceiling, climate, porch_cam, front_lock]
}

fn state_for_action(action: &str, current: EntityState) -> Option<EntityState> {
    match action {
        "turn_on" | "set_brightness" | "set_color" => Some(EntityState::On),
        "turn_off" => Some(EntityState::Off),
        "toggle" => Some(match current {
            EntityState::On => EntityState::Off,
            _ => EntityState::On,
        }),
        "lock" => Some(EntityState::Locked),
        "unlock" => Some(EntityState::Unlocked),
        "start_stream" => Some(EntityState::Active),
        "stop_stream" => Some(EntityState::Idle),
        _ => None,
    }
}

#[async_trait]
impl Adapter for VirtualAdapter {
    fn id(&self) -> &str {
        "virtual_main"
    }

    fn name(&self) -> &str {
        "Virtual Devices"
    }

    fn source(&self) -> &str {
        VIRTUAL_SOURCE
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    async fn connect(&self) -> CoreResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> CoreResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn health(&self) -> AdapterHealth {
        AdapterHealth::healthy(0)
    }

    fn metrics(&self) -> AdapterMetrics {
        AdapterMetrics {
            entities_managed: self.order.len(),
            rooms_managed: self.rooms.len(),
            last_sync: Some(Utc::now()),
            sync_errors: 0,
            actions_executed: self.actions_executed.load(Ordering::SeqCst),
            actions_failed: self.actions_failed.load(Ordering::SeqCst),
        }
    }

    async fn sync_entities(&self) -> CoreResult<Vec<Entity>> {
        let entities = self.entities.lock().unwrap();
        Ok(self
            .order
            .iter()
            .filter_map(|id| entities.get(id).cloned())
            .collect())
    }

    async fn sync_rooms(&self) -> CoreResult<Vec<Room>> {
        Ok(self.rooms.clone())
    }

    async fn refresh_entity(&self, entity_id: &str) -> CoreResult<Option<Entity>> {
        Ok(self.entities.lock().unwrap().get(entity_id).cloned())
    }

    async fn execute_action(&self, action: &Action) -> ActionResult {
        let mut entities = self.entities.lock().unwrap();
        let Some(entity) = entities.get_mut(&action.entity_id) else {
            self.actions_failed.fetch_add(1, Ordering::SeqCst);
            return ActionResult::failure(
                action,
                ActionError::new(
                    ActionErrorCode::EntityNotFound,
                    format!("virtual source does not know '{}'", action.entity_id),
                ),
                0,
            );
        };

        match state_for_action(&action.action, entity.state) {
            Some(new_state) => {
                entity.state = new_state;
                entity.last_updated = Utc::now();
                for (key, value) in &action.parameters {
                    entity.attributes.insert(key.clone(), value.clone());
                }
                self.actions_executed.fetch_add(1, Ordering::SeqCst);
                ActionResult::success(action, new_state, 0)
            }
            None => {
                self.actions_failed.fetch_add(1, Ordering::SeqCst);
                ActionResult::failure(
                    action,
                    ActionError::new(
                        ActionErrorCode::ActionNotSupported,
                        format!(
                            "action '{}' is not supported by '{}'",
                            action.action, action.entity_id
                        ),
                    ),
                    0,
                )
            }
        }
    }
}
