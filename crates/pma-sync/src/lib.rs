//! Sync coordinator
//!
//! Invokes adapters' snapshot syncs and reconciles the returned entities
//! and rooms into the registries. At most one sync runs per source; the
//! sources themselves are independent, so one failing source never
//! aborts the others. An entity that goes missing from its source's
//! snapshot is kept for one grace cycle marked unavailable before it is
//! unregistered, which keeps briefly-flapping devices stable.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use pma_adapters::{AdapterLease, AdapterRegistry};
use pma_core::{CoreResult, Entity, SyncResult};
use pma_events::{Hub, RoomChange, RoomUpdatedEvent, StateChangeEvent, SyncCompletedEvent};
use pma_registries::Registries;
use pma_store::MetricsStore;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Coordinator tunables.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Deadline for one source's sync
    pub per_source_timeout: Duration,
    /// Deadline for a full multi-source sync
    pub aggregate_timeout: Duration,
    /// Bounded history ring size
    pub history_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            per_source_timeout: Duration::from_secs(60),
            aggregate_timeout: Duration::from_secs(300),
            history_limit: 1000,
        }
    }
}

/// Reconciles source snapshots into the registries.
pub struct SyncCoordinator {
    registries: Arc<Registries>,
    adapters: Arc<AdapterRegistry>,
    hub: Arc<Hub>,
    metrics: Option<Arc<dyn MetricsStore>>,
    config: SyncConfig,
    /// Per-source sync serialisation
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Entity ids missing at the previous sync, per source (grace cycle)
    missing_entities: DashMap<String, HashSet<String>>,
    /// Room ids missing at the previous sync, per source
    missing_rooms: DashMap<String, HashSet<String>>,
    history: StdMutex<VecDeque<SyncResult>>,
}

impl SyncCoordinator {
    pub fn new(
        registries: Arc<Registries>,
        adapters: Arc<AdapterRegistry>,
        hub: Arc<Hub>,
        metrics: Option<Arc<dyn MetricsStore>>,
    ) -> Self {
        Self::with_config(registries, adapters, hub, metrics, SyncConfig::default())
    }

    pub fn with_config(
        registries: Arc<Registries>,
        adapters: Arc<AdapterRegistry>,
        hub: Arc<Hub>,
        metrics: Option<Arc<dyn MetricsStore>>,
        config: SyncConfig,
    ) -> Self {
        Self {
            registries,
            adapters,
            hub,
            metrics,
            config,
            locks: DashMap::new(),
            missing_entities: DashMap::new(),
            missing_rooms: DashMap::new(),
            history: StdMutex::new(VecDeque::new()),
        }
    }

    /// Sync one source. Fails fast when no connected adapter serves the
    /// source; execution failures are reported inside the result.
    #[instrument(skip(self))]
    pub async fn sync_from_source(&self, source: &str) -> CoreResult<SyncResult> {
        let lease = self.adapters.adapter_by_source(source)?;
        Ok(self.sync_with_lease(source, lease).await)
    }

    /// Sync every source with a registered adapter. Sources run
    /// concurrently and independently; each source's outcome appears in
    /// the aggregate, failures included.
    pub async fn sync_from_all_sources(&self) -> Vec<SyncResult> {
        let mut sources: Vec<String> = self
            .adapters
            .leases()
            .into_iter()
            .map(|lease| lease.source())
            .collect();
        sources.sort();
        sources.dedup();

        let futures = sources.iter().map(|source| async move {
            match self.sync_from_source(source).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(source = %source, error = %e, "Source skipped during aggregate sync");
                    let mut result = SyncResult::failed(source.clone(), e.to_string());
                    result.duration_ms = 0;
                    result
                }
            }
        });

        match tokio::time::timeout(self.config.aggregate_timeout, join_all(futures)).await {
            Ok(results) => results,
            Err(_) => sources
                .iter()
                .map(|s| SyncResult::failed(s.clone(), "aggregate sync deadline exceeded"))
                .collect(),
        }
    }

    /// Most recent sync results, newest first.
    pub fn history(&self, limit: usize) -> Vec<SyncResult> {
        let history = self.history.lock().unwrap();
        history.iter().rev().take(limit).cloned().collect()
    }

    /// Spawn the periodic full-sync loop.
    pub fn spawn_periodic(
        coordinator: Arc<SyncCoordinator>,
        period: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let results = coordinator.sync_from_all_sources().await;
                debug!(sources = results.len(), "Periodic sync completed");
            }
        })
    }

    async fn sync_with_lease(&self, source: &str, lease: AdapterLease) -> SyncResult {
        let lock = self
            .locks
            .entry(source.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let mut result = SyncResult::started(source);
        let started = std::time::Instant::now();

        let snapshot =
            match tokio::time::timeout(self.config.per_source_timeout, lease.sync_entities()).await
            {
                Ok(Ok(entities)) => entities,
                Ok(Err(e)) => {
                    warn!(source = %source, error = %e, "Entity sync failed");
                    result.error = Some(e.to_string());
                    result.duration_ms = started.elapsed().as_millis() as u64;
                    self.finish(result.clone());
                    return result;
                }
                Err(_) => {
                    warn!(source = %source, "Entity sync timed out");
                    result.error = Some("sync deadline exceeded".to_string());
                    result.duration_ms = started.elapsed().as_millis() as u64;
                    self.finish(result.clone());
                    return result;
                }
            };

        result.entities_found = snapshot.len();
        let seen: HashSet<String> = snapshot.iter().map(|e| e.id.clone()).collect();

        for entity in snapshot {
            self.reconcile_entity(source, entity, &mut result);
        }

        self.sweep_missing_entities(source, &seen, &mut result);

        match tokio::time::timeout(self.config.per_source_timeout, lease.sync_rooms()).await {
            Ok(Ok(rooms)) => {
                result.rooms_found = rooms.len();
                self.reconcile_rooms(source, rooms);
            }
            Ok(Err(e)) => {
                warn!(source = %source, error = %e, "Room sync failed");
            }
            Err(_) => {
                warn!(source = %source, "Room sync timed out");
            }
        }

        result.success = true;
        result.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            source = %source,
            found = result.entities_found,
            registered = result.entities_registered,
            updated = result.entities_updated,
            removed = result.entities_removed,
            "Sync completed"
        );
        self.finish(result.clone());
        result
    }

    fn reconcile_entity(&self, source: &str, mut incoming: Entity, result: &mut SyncResult) {
        incoming.metadata.source = source.to_string();
        incoming.metadata.last_synced = Utc::now();
        incoming.available = !incoming.state.is_unavailable();

        match self.registries.entities.get(&incoming.id) {
            Err(_) => {
                if let Err(e) = self.registries.register_entity(incoming.clone()) {
                    warn!(entity_id = %incoming.id, error = %e, "Skipping invalid entity from sync");
                    return;
                }
                result.entities_registered += 1;
                self.hub.publish_entity_added(&incoming);
            }
            Ok(existing) => {
                // A source that does not model rooms must not clobber a
                // locally made assignment
                if incoming.room_id.is_none() {
                    incoming.room_id = existing.room_id.clone();
                }

                if !entity_changed(&existing, &incoming) {
                    return;
                }

                let old_state = existing.state;
                if incoming.state != old_state {
                    incoming.last_updated = Utc::now();
                }
                match self.registries.update_entity(incoming.clone()) {
                    Ok(updated) => {
                        result.entities_updated += 1;
                        if updated.state != old_state {
                            self.hub.publish_state_change(StateChangeEvent {
                                entity_id: updated.id.clone(),
                                old_state,
                                new_state: updated.state,
                                source: source.to_string(),
                                entity: updated,
                                action_result: None,
                            });
                        }
                    }
                    Err(e) => {
                        warn!(entity_id = %incoming.id, error = %e, "Entity update rejected during sync");
                    }
                }
            }
        }
    }

    /// Grace-cycle sweep: an id absent from the snapshot is marked
    /// unavailable on its first miss and unregistered on the second
    /// consecutive miss.
    fn sweep_missing_entities(
        &self,
        source: &str,
        seen: &HashSet<String>,
        result: &mut SyncResult,
    ) {
        let previously_missing = self
            .missing_entities
            .get(source)
            .map(|set| set.clone())
            .unwrap_or_default();
        let mut now_missing = HashSet::new();

        for entity in self.registries.entities.by_source(source) {
            if seen.contains(&entity.id) {
                continue;
            }

            if previously_missing.contains(&entity.id) {
                if self.registries.unregister_entity(&entity.id).is_ok() {
                    result.entities_removed += 1;
                    self.hub.publish_entity_removed(&entity.id, source);
                    debug!(entity_id = %entity.id, "Entity removed after grace cycle");
                }
            } else {
                let mut unavailable = entity.clone();
                unavailable.available = false;
                if let Err(e) = self.registries.update_entity(unavailable) {
                    warn!(entity_id = %entity.id, error = %e, "Failed to mark entity unavailable");
                }
                now_missing.insert(entity.id.clone());
                debug!(entity_id = %entity.id, "Entity missing from snapshot, grace cycle started");
            }
        }

        self.missing_entities.insert(source.to_string(), now_missing);
    }

    fn reconcile_rooms(&self, source: &str, rooms: Vec<pma_core::Room>) {
        let seen: HashSet<String> = rooms.iter().map(|r| r.id.clone()).collect();

        for mut room in rooms {
            room.source = source.to_string();
            let members = std::mem::take(&mut room.entity_ids);

            if self.registries.rooms.contains(&room.id) {
                let existing = match self.registries.rooms.get(&room.id) {
                    Ok(existing) => existing,
                    Err(_) => continue,
                };
                if existing.name != room.name
                    || existing.icon != room.icon
                    || existing.description != room.description
                {
                    let mut updated = existing.clone();
                    updated.name = room.name.clone();
                    updated.icon = room.icon.clone();
                    updated.description = room.description.clone();
                    if self.registries.rooms.update(updated).is_ok() {
                        self.hub.publish_room_updated(RoomUpdatedEvent {
                            room_id: room.id.clone(),
                            name: room.name.clone(),
                            change: RoomChange::Updated,
                        });
                    }
                }
            } else if self.registries.rooms.register(room.clone()).is_ok() {
                self.hub.publish_room_updated(RoomUpdatedEvent {
                    room_id: room.id.clone(),
                    name: room.name.clone(),
                    change: RoomChange::Created,
                });
            }

            for entity_id in members {
                if self.registries.entities.contains(&entity_id) {
                    let _ = self.registries.assign_entity(&entity_id, &room.id);
                }
            }
        }

        self.sweep_missing_rooms(source, &seen);
    }

    /// Rooms get the same one-cycle grace as entities; a room deleted at
    /// its source releases its members' assignments.
    fn sweep_missing_rooms(&self, source: &str, seen: &HashSet<String>) {
        let previously_missing = self
            .missing_rooms
            .get(source)
            .map(|set| set.clone())
            .unwrap_or_default();
        let mut now_missing = HashSet::new();

        for room in self.registries.rooms.by_source(source) {
            if seen.contains(&room.id) {
                continue;
            }
            if previously_missing.contains(&room.id) {
                if self.registries.delete_room(&room.id, None).is_ok() {
                    self.hub.publish_room_updated(RoomUpdatedEvent {
                        room_id: room.id.clone(),
                        name: room.name.clone(),
                        change: RoomChange::Deleted,
                    });
                }
            } else {
                now_missing.insert(room.id.clone());
            }
        }

        self.missing_rooms.insert(source.to_string(), now_missing);
    }

    fn finish(&self, result: SyncResult) {
        if result.success {
            self.hub.publish_sync_completed(SyncCompletedEvent {
                source: result.source.clone(),
                entities_synced: result.entities_found,
                entities_updated: result.entities_updated,
                duration_ms: result.duration_ms,
            });
        }

        if let Some(metrics) = &self.metrics {
            if let Err(e) = metrics.record_sync(&result) {
                warn!(error = %e, "Failed to record sync metrics");
            }
        }

        let mut history = self.history.lock().unwrap();
        if history.len() >= self.config.history_limit {
            history.pop_front();
        }
        history.push_back(result);
    }
}

/// Whether a sync snapshot entry differs from the stored record in any
/// field a source is authoritative for.
fn entity_changed(existing: &Entity, incoming: &Entity) -> bool {
    existing.state != incoming.state
        || existing.available != incoming.available
        || existing.friendly_name != incoming.friendly_name
        || existing.icon != incoming.icon
        || existing.attributes != incoming.attributes
        || existing.capabilities != incoming.capabilities
        || existing.room_id != incoming.room_id
        || existing.area_id != incoming.area_id
        || existing.device_id != incoming.device_id
}
