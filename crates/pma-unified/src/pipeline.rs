//! Action pipeline
//!
//! Routes an action from the HTTP surface to the adapter that owns the
//! target entity, applies the reported state optimistically, pushes the
//! transition, and schedules a delayed source-of-truth refresh so the
//! registry converges on what the source actually did.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pma_adapters::{AdapterLease, AdapterRegistry};
use pma_core::{Action, ActionResult, CoreError, CoreResult, EntityState};
use pma_events::{Hub, StateChangeEvent};
use pma_registries::Registries;
use tracing::{debug, instrument, warn};

/// Default deadline for one adapter action call.
pub const ACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay before the convergence refresh.
pub const REFRESH_DELAY: Duration = Duration::from_millis(500);

pub struct ActionPipeline {
    registries: Arc<Registries>,
    adapters: Arc<AdapterRegistry>,
    hub: Arc<Hub>,
    action_timeout: Duration,
    refresh_delay: Duration,
}

impl ActionPipeline {
    pub fn new(
        registries: Arc<Registries>,
        adapters: Arc<AdapterRegistry>,
        hub: Arc<Hub>,
    ) -> Self {
        Self {
            registries,
            adapters,
            hub,
            action_timeout: ACTION_TIMEOUT,
            refresh_delay: REFRESH_DELAY,
        }
    }

    pub fn with_timeouts(mut self, action_timeout: Duration, refresh_delay: Duration) -> Self {
        self.action_timeout = action_timeout;
        self.refresh_delay = refresh_delay;
        self
    }

    /// Execute one action. An adapter-reported failure comes back as an
    /// unsuccessful result, not an error; errors are reserved for the
    /// pipeline's own failures (unknown entity, no adapter, deadline).
    #[instrument(skip(self, action), fields(entity_id = %action.entity_id, action = %action.action, correlation_id = %action.context.correlation_id))]
    pub async fn execute(&self, action: Action) -> CoreResult<ActionResult> {
        let entity = self.registries.entities.get(&action.entity_id)?;
        let source = entity.metadata.source.clone();
        let adapter = self.adapters.adapter_by_source(&source)?;

        let result = tokio::time::timeout(self.action_timeout, adapter.execute_action(&action))
            .await
            .map_err(|_| CoreError::Timeout(self.action_timeout))??;

        // Apply optimistically only when the adapter reports success and
        // a concrete post-action state; a failed action never moves the
        // registry.
        if result.success {
            if let Some(new_state) = result.new_state {
                self.apply_result(&action, new_state, &result, &source);

                let current = self
                    .registries
                    .entities
                    .get(&action.entity_id)
                    .unwrap_or_else(|_| entity.clone());
                self.hub.publish_state_change(StateChangeEvent {
                    entity_id: action.entity_id.clone(),
                    old_state: entity.state,
                    new_state,
                    entity: current,
                    source: source.clone(),
                    action_result: Some(result.clone()),
                });

                if adapter.supports_refresh() {
                    self.schedule_refresh(adapter.clone(), action.entity_id.clone(), source);
                }
            }
        }

        Ok(result)
    }

    fn apply_result(
        &self,
        action: &Action,
        new_state: EntityState,
        result: &ActionResult,
        source: &str,
    ) {
        match self
            .registries
            .entities
            .update_state(&action.entity_id, new_state, source)
        {
            Ok(updated) => {
                if !result.attributes.is_empty() {
                    let mut merged = updated;
                    merged
                        .attributes
                        .extend(result.attributes.clone().into_iter());
                    if let Err(e) = self.registries.update_entity(merged) {
                        debug!(error = %e, "Attribute merge after action skipped");
                    }
                }
            }
            Err(e) => {
                // The registry refusing a legitimate post-action update is
                // worth a warning; the delayed refresh reconciles either way.
                warn!(
                    entity_id = %action.entity_id,
                    error = %e,
                    "State update rejected, falling back to direct mutation"
                );
                match self.registries.entities.get(&action.entity_id) {
                    Ok(mut entity) => {
                        entity.state = new_state;
                        entity.available = true;
                        entity
                            .attributes
                            .extend(result.attributes.clone().into_iter());
                        entity.last_updated = Utc::now();
                        if let Err(e) = self.registries.update_entity(entity) {
                            warn!(entity_id = %action.entity_id, error = %e, "Direct mutation also failed");
                        }
                    }
                    Err(e) => {
                        warn!(entity_id = %action.entity_id, error = %e, "Entity vanished before fallback mutation");
                    }
                }
            }
        }
    }

    /// Fire-and-forget convergence refresh: re-read the entity from the
    /// source shortly after the action and fold the authoritative view
    /// into the registry. Errors are logged only.
    fn schedule_refresh(&self, adapter: AdapterLease, entity_id: String, source: String) {
        let registries = self.registries.clone();
        let hub = self.hub.clone();
        let delay = self.refresh_delay;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match adapter.refresh_entity(&entity_id).await {
                Ok(Some(mut fresh)) => {
                    let Ok(existing) = registries.entities.get(&entity_id) else {
                        return;
                    };
                    fresh.metadata.source = source.clone();
                    fresh.metadata.last_synced = Utc::now();
                    fresh.available = !fresh.state.is_unavailable();
                    if fresh.room_id.is_none() {
                        fresh.room_id = existing.room_id.clone();
                    }

                    let old_state = existing.state;
                    match registries.update_entity(fresh) {
                        Ok(updated) if updated.state != old_state => {
                            hub.publish_state_change(StateChangeEvent {
                                entity_id: entity_id.clone(),
                                old_state,
                                new_state: updated.state,
                                source,
                                entity: updated,
                                action_result: None,
                            });
                        }
                        Ok(_) => {}
                        Err(e) => {
                            debug!(entity_id = %entity_id, error = %e, "Refresh update rejected");
                        }
                    }
                }
                Ok(None) => {
                    debug!(entity_id = %entity_id, "Source no longer knows entity at refresh");
                }
                Err(e) => {
                    debug!(entity_id = %entity_id, error = %e, "Post-action refresh failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pma_adapters::testing::MockAdapter;
    use pma_core::{ActionErrorCode, Entity, EntityMetadata, EntityType};
    use pma_events::EventKind;

    fn make_light(id: &str, state: EntityState) -> Entity {
        Entity::new(
            id,
            EntityType::Light,
            id,
            state,
            EntityMetadata::new("homeassistant", id),
        )
    }

    async fn make_setup() -> (Arc<Registries>, Arc<Hub>, Arc<MockAdapter>, ActionPipeline) {
        let registries = Arc::new(Registries::new());
        let hub = Arc::new(Hub::new());
        let adapters = Arc::new(AdapterRegistry::new(hub.clone()));
        let adapter = Arc::new(MockAdapter::new("ha_main", "homeassistant"));
        adapters.register(adapter.clone()).await.unwrap();

        let light = make_light("ha_light_kitchen", EntityState::Off);
        adapter.set_entities(vec![light.clone()]);
        registries.register_entity(light).unwrap();

        let pipeline = ActionPipeline::new(registries.clone(), adapters, hub.clone())
            .with_timeouts(Duration::from_secs(5), Duration::from_millis(10));
        (registries, hub, adapter, pipeline)
    }

    #[tokio::test]
    async fn test_action_round_trip() {
        let (registries, hub, _, pipeline) = make_setup().await;
        let mut sub = hub.subscribe();

        let result = pipeline
            .execute(Action::new("ha_light_kitchen", "turn_on"))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.new_state, Some(EntityState::On));

        // Synchronous step: registry already shows the new state
        let entity = registries.entities.get("ha_light_kitchen").unwrap();
        assert_eq!(entity.state, EntityState::On);
        assert!(entity.last_updated >= result.processed_at - chrono::Duration::seconds(1));

        let event = sub.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::EntityStateChange);
        assert_eq!(event.data["old_state"], "off");
        assert_eq!(event.data["new_state"], "on");
        assert_eq!(event.data["action_result"]["success"], true);
    }

    #[tokio::test]
    async fn test_failed_action_moves_nothing() {
        let (registries, hub, _, pipeline) = make_setup().await;
        let mut sub = hub.subscribe();

        let result = pipeline
            .execute(Action::new("ha_light_kitchen", "fly"))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(
            result.error.as_ref().unwrap().code,
            ActionErrorCode::ActionNotSupported
        );
        // No state change, no event
        assert_eq!(
            registries.entities.get("ha_light_kitchen").unwrap().state,
            EntityState::Off
        );
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unknown_entity() {
        let (_, _, _, pipeline) = make_setup().await;
        let err = pipeline
            .execute(Action::new("ha_light_ghost", "turn_on"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_disconnected_adapter_is_source_unavailable() {
        let (_, _, adapter, pipeline) = make_setup().await;
        adapter.set_connected(false);

        let err = pipeline
            .execute(Action::new("ha_light_kitchen", "turn_on"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NoAdapterForSource { .. }));
    }

    #[tokio::test]
    async fn test_refresh_is_scheduled_after_success() {
        let (_, _, adapter, pipeline) = make_setup().await;

        pipeline
            .execute(Action::new("ha_light_kitchen", "turn_on"))
            .await
            .unwrap();

        // Refresh runs ~10 ms later in this configuration
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(adapter.refresh_calls(), vec!["ha_light_kitchen"]);
    }

    #[tokio::test]
    async fn test_no_refresh_when_unsupported() {
        let (_, _, adapter, pipeline) = make_setup().await;
        adapter.set_refresh_supported(false);

        pipeline
            .execute(Action::new("ha_light_kitchen", "turn_on"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(adapter.refresh_calls().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_converges_on_source_view() {
        let (registries, _, adapter, pipeline) = make_setup().await;

        pipeline
            .execute(Action::new("ha_light_kitchen", "turn_on"))
            .await
            .unwrap();

        // The source flips the light back off before the refresh lands
        adapter.set_entities(vec![make_light("ha_light_kitchen", EntityState::Off)]);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            registries.entities.get("ha_light_kitchen").unwrap().state,
            EntityState::Off
        );
    }

    #[tokio::test]
    async fn test_action_parameters_land_in_attributes() {
        let (registries, _, _, pipeline) = make_setup().await;

        let result = pipeline
            .execute(
                Action::new("ha_light_kitchen", "set_brightness")
                    .with_parameter("brightness", serde_json::json!(128)),
            )
            .await
            .unwrap();

        assert!(result.success);
        let entity = registries.entities.get("ha_light_kitchen").unwrap();
        assert_eq!(entity.brightness(), Some(128));
    }
}
