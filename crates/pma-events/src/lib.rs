//! Push channel hub
//!
//! The Hub fans state-change, room-change and sync events out to every
//! subscriber (WebSocket connections, SSE streams, in-process listeners).
//! Publishing is non-blocking: each subscriber has a bounded queue, slow
//! subscribers lose the oldest messages, and the subscription surfaces a
//! single `lagged` notice per overflow episode so clients know to
//! resynchronise.

use chrono::{DateTime, Utc};
use pma_core::{ActionResult, Entity, EntityState};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Default per-subscriber queue depth.
pub const DEFAULT_QUEUE_DEPTH: usize = 100;

/// Default heartbeat period.
pub const HEARTBEAT_PERIOD: std::time::Duration = std::time::Duration::from_secs(30);

/// Kinds of events the hub delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    EntityStateChange,
    EntityAdded,
    EntityRemoved,
    RoomUpdated,
    SyncCompleted,
    AdapterHealthChange,
    SystemStatus,
    Heartbeat,
    Error,
    Lagged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::EntityStateChange => "entity_state_change",
            EventKind::EntityAdded => "entity_added",
            EventKind::EntityRemoved => "entity_removed",
            EventKind::RoomUpdated => "room_updated",
            EventKind::SyncCompleted => "sync_completed",
            EventKind::AdapterHealthChange => "adapter_health_change",
            EventKind::SystemStatus => "system_status",
            EventKind::Heartbeat => "heartbeat",
            EventKind::Error => "error",
            EventKind::Lagged => "lagged",
        }
    }
}

/// One event on the wire: `{type, data, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl PushEvent {
    pub fn new(kind: EventKind, data: impl Serialize) -> Self {
        Self {
            kind,
            data: serde_json::to_value(data).unwrap_or_default(),
            timestamp: Utc::now(),
        }
    }
}

/// Payload of `entity_state_change`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangeEvent {
    pub entity_id: String,
    pub old_state: EntityState,
    pub new_state: EntityState,
    pub entity: Entity,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_result: Option<ActionResult>,
}

/// Payload of `entity_added` / `entity_removed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityLifecycleEvent {
    pub entity_id: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<Entity>,
}

/// What happened to a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomChange {
    Created,
    Updated,
    Deleted,
}

/// Payload of `room_updated`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomUpdatedEvent {
    pub room_id: String,
    pub name: String,
    pub change: RoomChange,
}

/// Payload of `sync_completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncCompletedEvent {
    pub source: String,
    pub entities_synced: usize,
    pub entities_updated: usize,
    pub duration_ms: u64,
}

/// Payload of `adapter_health_change`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterHealthEvent {
    pub adapter_id: String,
    pub connected: bool,
    pub is_healthy: bool,
}

/// Payload of `heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatEvent {
    pub server_time: DateTime<Utc>,
}

/// Payload of the `lagged` notice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaggedEvent {
    /// Number of messages dropped for this subscriber
    pub missed: u64,
}

/// Fan-out hub for push events.
///
/// Built on a broadcast ring: every subscriber sees every event, the ring
/// bounds each subscriber's backlog, and a subscriber that stops reading
/// silently drops the oldest entries instead of blocking publishers.
pub struct Hub {
    sender: broadcast::Sender<PushEvent>,
}

impl Hub {
    pub fn new() -> Self {
        Self::with_queue_depth(DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_queue_depth(depth: usize) -> Self {
        let (sender, _) = broadcast::channel(depth);
        Self { sender }
    }

    /// Publish an event to every subscriber. Never blocks; an event with
    /// no subscribers is dropped.
    pub fn publish(&self, event: PushEvent) {
        trace!(kind = ?event.kind, "Publishing event");
        let _ = self.sender.send(event);
    }

    pub fn publish_state_change(&self, payload: StateChangeEvent) {
        self.publish(PushEvent::new(EventKind::EntityStateChange, payload));
    }

    pub fn publish_entity_added(&self, entity: &Entity) {
        self.publish(PushEvent::new(
            EventKind::EntityAdded,
            EntityLifecycleEvent {
                entity_id: entity.id.clone(),
                source: entity.metadata.source.clone(),
                entity: Some(entity.clone()),
            },
        ));
    }

    pub fn publish_entity_removed(&self, entity_id: &str, source: &str) {
        self.publish(PushEvent::new(
            EventKind::EntityRemoved,
            EntityLifecycleEvent {
                entity_id: entity_id.to_string(),
                source: source.to_string(),
                entity: None,
            },
        ));
    }

    pub fn publish_room_updated(&self, payload: RoomUpdatedEvent) {
        self.publish(PushEvent::new(EventKind::RoomUpdated, payload));
    }

    pub fn publish_sync_completed(&self, payload: SyncCompletedEvent) {
        self.publish(PushEvent::new(EventKind::SyncCompleted, payload));
    }

    pub fn publish_adapter_health(&self, payload: AdapterHealthEvent) {
        self.publish(PushEvent::new(EventKind::AdapterHealthChange, payload));
    }

    /// Subscribe to the event stream from this point onward.
    pub fn subscribe(&self) -> Subscription {
        debug!(subscribers = self.sender.receiver_count() + 1, "New hub subscriber");
        Subscription {
            rx: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Spawn the heartbeat task publishing `heartbeat {server_time}` on
    /// the given period.
    pub fn spawn_heartbeat(
        hub: std::sync::Arc<Hub>,
        period: std::time::Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                hub.publish(PushEvent::new(
                    EventKind::Heartbeat,
                    HeartbeatEvent {
                        server_time: Utc::now(),
                    },
                ));
            }
        })
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's view of the event stream.
///
/// When the subscriber falls behind and the ring overwrites unread
/// entries, the next receive yields a single `lagged` notice carrying the
/// number of dropped messages, then delivery resumes with the oldest
/// retained event.
pub struct Subscription {
    rx: broadcast::Receiver<PushEvent>,
}

impl Subscription {
    /// Receive the next event; None when the hub is gone.
    pub async fn recv(&mut self) -> Option<PushEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                Some(PushEvent::new(EventKind::Lagged, LaggedEvent { missed }))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Non-blocking receive; None when no event is ready.
    pub fn try_recv(&mut self) -> Option<PushEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                Some(PushEvent::new(EventKind::Lagged, LaggedEvent { missed }))
            }
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pma_core::{EntityMetadata, EntityType};

    fn make_entity(id: &str, state: EntityState) -> Entity {
        Entity::new(
            id,
            EntityType::Light,
            id,
            state,
            EntityMetadata::new("homeassistant", id),
        )
    }

    fn state_change(id: &str, old: EntityState, new: EntityState) -> StateChangeEvent {
        StateChangeEvent {
            entity_id: id.to_string(),
            old_state: old,
            new_state: new,
            entity: make_entity(id, new),
            source: "homeassistant".to_string(),
            action_result: None,
        }
    }

    #[tokio::test]
    async fn test_fan_out_to_multiple_subscribers() {
        let hub = Hub::new();
        let mut sub_a = hub.subscribe();
        let mut sub_b = hub.subscribe();

        hub.publish_state_change(state_change("ha_light_a", EntityState::Off, EntityState::On));

        for sub in [&mut sub_a, &mut sub_b] {
            let event = sub.recv().await.unwrap();
            assert_eq!(event.kind, EventKind::EntityStateChange);
            assert_eq!(event.data["entity_id"], "ha_light_a");
        }
    }

    #[tokio::test]
    async fn test_per_entity_ordering() {
        let hub = Hub::new();
        let mut sub = hub.subscribe();

        let transitions = [
            (EntityState::Off, EntityState::On),
            (EntityState::On, EntityState::Off),
            (EntityState::Off, EntityState::On),
        ];
        for (old, new) in transitions {
            hub.publish_state_change(state_change("ha_light_a", old, new));
        }

        for (old, _) in transitions {
            let event = sub.recv().await.unwrap();
            assert_eq!(event.data["old_state"], old.as_str());
        }
    }

    #[tokio::test]
    async fn test_backpressure_drops_oldest_with_one_lagged_notice() {
        let hub = Hub::with_queue_depth(100);
        let mut sub = hub.subscribe();

        // Subscriber is not reading while 200 events arrive
        for i in 0..200u32 {
            hub.publish(PushEvent::new(EventKind::SystemStatus, serde_json::json!({ "seq": i })));
        }

        // Exactly one lagged notice for the dropped half
        let first = sub.try_recv().unwrap();
        assert_eq!(first.kind, EventKind::Lagged);
        assert_eq!(first.data["missed"], 100);

        // The retained backlog never exceeded the queue depth and is the
        // newest 100 events, still in order
        let mut delivered = Vec::new();
        while let Some(event) = sub.try_recv() {
            assert_ne!(event.kind, EventKind::Lagged);
            delivered.push(event.data["seq"].as_u64().unwrap());
        }
        assert_eq!(delivered.len(), 100);
        assert_eq!(delivered[0], 100);
        assert_eq!(*delivered.last().unwrap(), 199);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let hub = Hub::new();
        hub.publish_entity_removed("ha_light_a", "homeassistant");
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscription_starts_at_subscribe_point() {
        let hub = Hub::new();
        hub.publish_entity_removed("before", "homeassistant");

        let mut sub = hub.subscribe();
        hub.publish_entity_removed("after", "homeassistant");

        let event = sub.recv().await.unwrap();
        assert_eq!(event.data["entity_id"], "after");
    }

    #[tokio::test]
    async fn test_heartbeat_publishes_on_period() {
        let hub = std::sync::Arc::new(Hub::new());
        let mut sub = hub.subscribe();
        let handle = Hub::spawn_heartbeat(hub.clone(), std::time::Duration::from_millis(20));

        // First tick fires immediately, the next after the period
        let first = sub.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::Heartbeat);
        let second = sub.recv().await.unwrap();
        assert_eq!(second.kind, EventKind::Heartbeat);
        assert!(second.data["server_time"].is_string());

        handle.abort();
    }

    #[test]
    fn test_wire_schema() {
        let event = PushEvent::new(
            EventKind::RoomUpdated,
            RoomUpdatedEvent {
                room_id: "pma_room_1".to_string(),
                name: "Kitchen".to_string(),
                change: RoomChange::Created,
            },
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "room_updated");
        assert_eq!(value["data"]["change"], "created");
        assert!(value["timestamp"].is_string());
    }
}
