//! Test support: a configurable in-memory adapter
//!
//! Used by the registry, sync and pipeline tests across the workspace.
//! The mock keeps an internal entity snapshot that actions mutate, so
//! sync and refresh after an action converge the way a real source does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use pma_core::{
    Action, ActionError, ActionErrorCode, ActionResult, CoreError, CoreResult, Entity,
    EntityState, Room,
};

use crate::{Adapter, AdapterHealth, AdapterMetrics};

/// In-memory adapter with scriptable behaviour.
pub struct MockAdapter {
    id: String,
    name: String,
    source: String,
    connected: AtomicBool,
    healthy: AtomicBool,
    connect_failures_remaining: AtomicU32,
    fail_next_sync: Mutex<Option<String>>,
    refresh_supported: AtomicBool,
    entities: Mutex<HashMap<String, Entity>>,
    entity_order: Mutex<Vec<String>>,
    rooms: Mutex<Vec<Room>>,
    refresh_calls: Mutex<Vec<String>>,
    sync_calls: AtomicU64,
    actions_executed: AtomicU64,
    actions_failed: AtomicU64,
    sync_errors: AtomicU64,
}

impl MockAdapter {
    pub fn new(id: impl Into<String>, source: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: format!("Mock {id}"),
            id,
            source: source.into(),
            connected: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            connect_failures_remaining: AtomicU32::new(0),
            fail_next_sync: Mutex::new(None),
            refresh_supported: AtomicBool::new(true),
            entities: Mutex::new(HashMap::new()),
            entity_order: Mutex::new(Vec::new()),
            rooms: Mutex::new(Vec::new()),
            refresh_calls: Mutex::new(Vec::new()),
            sync_calls: AtomicU64::new(0),
            actions_executed: AtomicU64::new(0),
            actions_failed: AtomicU64::new(0),
            sync_errors: AtomicU64::new(0),
        }
    }

    /// Replace the snapshot the next sync returns.
    pub fn set_entities(&self, entities: Vec<Entity>) {
        let mut map = self.entities.lock().unwrap();
        let mut order = self.entity_order.lock().unwrap();
        order.clear();
        map.clear();
        for entity in entities {
            order.push(entity.id.clone());
            map.insert(entity.id.clone(), entity);
        }
    }

    pub fn set_rooms(&self, rooms: Vec<Room>) {
        *self.rooms.lock().unwrap() = rooms;
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_connects(&self, n: u32) {
        self.connect_failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Make the next sync_entities call fail with the given message.
    pub fn fail_next_sync(&self, message: impl Into<String>) {
        *self.fail_next_sync.lock().unwrap() = Some(message.into());
    }

    pub fn set_refresh_supported(&self, supported: bool) {
        self.refresh_supported.store(supported, Ordering::SeqCst);
    }

    /// Entity ids refresh_entity was called with, in order.
    pub fn refresh_calls(&self) -> Vec<String> {
        self.refresh_calls.lock().unwrap().clone()
    }

    pub fn sync_calls(&self) -> u64 {
        self.sync_calls.load(Ordering::SeqCst)
    }

    /// Current state of one entity in the mock's own snapshot.
    pub fn entity_state(&self, entity_id: &str) -> Option<EntityState> {
        self.entities.lock().unwrap().get(entity_id).map(|e| e.state)
    }

    fn state_for_action(action: &str, current: EntityState) -> Option<EntityState> {
        match action {
            "turn_on" | "set_brightness" | "set_color" | "set_speed" => Some(EntityState::On),
            "turn_off" => Some(EntityState::Off),
            "toggle" => Some(match current {
                EntityState::On => EntityState::Off,
                _ => EntityState::On,
            }),
            "open" => Some(EntityState::Open),
            "close" => Some(EntityState::Closed),
            "lock" => Some(EntityState::Locked),
            "unlock" => Some(EntityState::Unlocked),
            "play" => Some(EntityState::Playing),
            "pause" => Some(EntityState::Paused),
            "stop" | "stop_stream" => Some(EntityState::Idle),
            "start_stream" | "activate" => Some(EntityState::Active),
            _ => None,
        }
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> &str {
        &self.source
    }

    fn version(&self) -> &str {
        "0.0.0-mock"
    }

    async fn connect(&self) -> CoreResult<()> {
        let remaining = self.connect_failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures_remaining
                .store(remaining - 1, Ordering::SeqCst);
            return Err(CoreError::SourceUnavailable {
                source_id: self.source.clone(),
            });
        }
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
        if self.healthy.load(Ordering::SeqCst) && self.is_connected() {
            AdapterHealth::healthy(1)
        } else {
            AdapterHealth::unhealthy("mock marked unhealthy")
        }
    }

    fn metrics(&self) -> AdapterMetrics {
        AdapterMetrics {
            entities_managed: self.entities.lock().unwrap().len(),
            rooms_managed: self.rooms.lock().unwrap().len(),
            last_sync: if self.sync_calls.load(Ordering::SeqCst) > 0 {
                Some(Utc::now())
            } else {
                None
            },
            sync_errors: self.sync_errors.load(Ordering::SeqCst),
            actions_executed: self.actions_executed.load(Ordering::SeqCst),
            actions_failed: self.actions_failed.load(Ordering::SeqCst),
        }
    }

    async fn sync_entities(&self) -> CoreResult<Vec<Entity>> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.fail_next_sync.lock().unwrap().take() {
            self.sync_errors.fetch_add(1, Ordering::SeqCst);
            return Err(CoreError::Internal(message));
        }

        let map = self.entities.lock().unwrap();
        let order = self.entity_order.lock().unwrap();
        Ok(order.iter().filter_map(|id| map.get(id).cloned()).collect())
    }

    async fn sync_rooms(&self) -> CoreResult<Vec<Room>> {
        Ok(self.rooms.lock().unwrap().clone())
    }

    fn supports_refresh(&self) -> bool {
        self.refresh_supported.load(Ordering::SeqCst)
    }

    async fn refresh_entity(&self, entity_id: &str) -> CoreResult<Option<Entity>> {
        self.refresh_calls.lock().unwrap().push(entity_id.to_string());
        Ok(self.entities.lock().unwrap().get(entity_id).cloned())
    }

    async fn execute_action(&self, action: &Action) -> ActionResult {
        if !self.is_connected() {
            self.actions_failed.fetch_add(1, Ordering::SeqCst);
            return ActionResult::failure(
                action,
                ActionError::new(
                    ActionErrorCode::SourceUnavailable,
                    format!("mock source '{}' is disconnected", self.source),
                ),
                0,
            );
        }

        let mut entities = self.entities.lock().unwrap();
        let Some(entity) = entities.get_mut(&action.entity_id) else {
            self.actions_failed.fetch_add(1, Ordering::SeqCst);
            return ActionResult::failure(
                action,
                ActionError::new(
                    ActionErrorCode::EntityNotFound,
                    format!("mock source does not know '{}'", action.entity_id),
                ),
                0,
            );
        };

        match Self::state_for_action(&action.action, entity.state) {
            Some(new_state) => {
                entity.state = new_state;
                entity.last_updated = Utc::now();
                for (key, value) in &action.parameters {
                    entity.attributes.insert(key.clone(), value.clone());
                }
                self.actions_executed.fetch_add(1, Ordering::SeqCst);
                let mut result = ActionResult::success(action, new_state, 1);
                result.attributes = entity.attributes.clone();
                result
            }
            None => {
                self.actions_failed.fetch_add(1, Ordering::SeqCst);
                ActionResult::failure(
                    action,
                    ActionError::new(
                        ActionErrorCode::ActionNotSupported,
                        format!("action '{}' is not supported", action.action),
                    ),
                    0,
                )
            }
        }
    }
}
