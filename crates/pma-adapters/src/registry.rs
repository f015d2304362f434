//! Adapter registry and lifecycle supervision
//!
//! The registry exclusively owns adapter instances. Each registered
//! adapter gets a supervision task that connects with exponential
//! backoff, polls health on an interval, and demotes the adapter to
//! Unhealthy after three consecutive failed probes. Other components
//! obtain non-owning `AdapterLease` handles, released per call.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use pma_core::{Action, ActionResult, CoreError, CoreResult, Entity, Room};
use pma_events::{AdapterHealthEvent, Hub};
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::{Adapter, AdapterMetrics, AdapterRecord, ConnectionState};

/// Supervision tunables.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Period between health probes
    pub health_interval: Duration,
    /// Deadline for one health probe
    pub health_timeout: Duration,
    /// Deadline for one connect attempt
    pub connect_timeout: Duration,
    /// Failed probes in a row before the adapter is demoted
    pub max_consecutive_failures: u32,
    /// Per-adapter concurrent action permits
    pub action_concurrency: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(30),
            health_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(15),
            max_consecutive_failures: 3,
            action_concurrency: 8,
        }
    }
}

/// Delay before reconnect attempt `attempt` (0-based): exponential from
/// 1 s to a 60 s cap, ±20% jitter, clamped back into [1 s, 60 s].
pub fn backoff_delay(attempt: u32) -> Duration {
    const BASE_MS: u64 = 1_000;
    const CAP_MS: u64 = 60_000;

    let exponential = BASE_MS.saturating_mul(1u64 << attempt.min(6));
    let capped = exponential.min(CAP_MS) as f64;
    let jittered = capped * rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((jittered as u64).clamp(BASE_MS, CAP_MS))
}

struct LifecycleState {
    connection: ConnectionState,
    consecutive_failures: u32,
    last_health_check: Option<DateTime<Utc>>,
    response_time_ms: u64,
}

struct AdapterHandle {
    adapter: Arc<dyn Adapter>,
    state: StdMutex<LifecycleState>,
    actions: Arc<Semaphore>,
}

impl AdapterHandle {
    fn new(adapter: Arc<dyn Adapter>, action_concurrency: usize) -> Self {
        Self {
            adapter,
            state: StdMutex::new(LifecycleState {
                connection: ConnectionState::Disconnected,
                consecutive_failures: 0,
                last_health_check: None,
                response_time_ms: 0,
            }),
            actions: Arc::new(Semaphore::new(action_concurrency)),
        }
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().unwrap().connection
    }

    fn set_connection(&self, connection: ConnectionState) {
        self.state.lock().unwrap().connection = connection;
    }
}

/// Non-owning, per-call handle to one adapter.
#[derive(Clone)]
pub struct AdapterLease {
    handle: Arc<AdapterHandle>,
}

impl std::fmt::Debug for AdapterLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterLease")
            .field("id", &self.handle.adapter.id())
            .field("source", &self.handle.adapter.source())
            .finish()
    }
}

impl AdapterLease {
    pub fn id(&self) -> String {
        self.handle.adapter.id().to_string()
    }

    pub fn source(&self) -> String {
        self.handle.adapter.source().to_string()
    }

    pub fn is_connected(&self) -> bool {
        self.handle.connection_state() == ConnectionState::Connected
            && self.handle.adapter.is_connected()
    }

    pub fn supports_refresh(&self) -> bool {
        self.handle.adapter.supports_refresh()
    }

    /// Execute an action under the adapter's concurrency limit. The
    /// caller owns the deadline.
    pub async fn execute_action(&self, action: &Action) -> CoreResult<ActionResult> {
        let _permit = self
            .handle
            .actions
            .acquire()
            .await
            .map_err(|_| CoreError::Internal("adapter semaphore closed".to_string()))?;
        Ok(self.handle.adapter.execute_action(action).await)
    }

    pub async fn sync_entities(&self) -> CoreResult<Vec<Entity>> {
        self.handle.adapter.sync_entities().await
    }

    pub async fn sync_rooms(&self) -> CoreResult<Vec<Room>> {
        self.handle.adapter.sync_rooms().await
    }

    pub async fn refresh_entity(&self, entity_id: &str) -> CoreResult<Option<Entity>> {
        self.handle.adapter.refresh_entity(entity_id).await
    }

    pub fn metrics(&self) -> AdapterMetrics {
        self.handle.adapter.metrics()
    }
}

/// Owns all adapters; everything else holds leases.
pub struct AdapterRegistry {
    adapters: DashMap<String, Arc<AdapterHandle>>,
    tasks: DashMap<String, JoinHandle<()>>,
    hub: Arc<Hub>,
    config: RegistryConfig,
}

impl AdapterRegistry {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self::with_config(hub, RegistryConfig::default())
    }

    pub fn with_config(hub: Arc<Hub>, config: RegistryConfig) -> Self {
        Self {
            adapters: DashMap::new(),
            tasks: DashMap::new(),
            hub,
            config,
        }
    }

    /// Register an adapter and start supervising it. The first connect
    /// attempt happens inline so callers observe a settled state;
    /// reconnection and health polling continue in the background.
    #[instrument(skip(self, adapter), fields(adapter_id = %adapter.id()))]
    pub async fn register(&self, adapter: Arc<dyn Adapter>) -> CoreResult<()> {
        let id = adapter.id().to_string();
        if self.adapters.contains_key(&id) {
            return Err(CoreError::Conflict {
                kind: "adapter",
                id,
                reason: "already registered".to_string(),
            });
        }

        info!(source = %adapter.source(), "Registering adapter");
        let handle = Arc::new(AdapterHandle::new(adapter, self.config.action_concurrency));
        self.adapters.insert(id.clone(), handle.clone());

        if Self::try_connect(&handle, &self.config).await {
            self.publish_health(&id, true, true);
        }

        let task = tokio::spawn(Self::supervise(
            handle,
            self.hub.clone(),
            self.config.clone(),
        ));
        self.tasks.insert(id, task);
        Ok(())
    }

    /// Remove an adapter, stopping supervision and disconnecting it.
    /// Idempotent from the caller's perspective.
    #[instrument(skip(self))]
    pub async fn unregister(&self, id: &str) -> CoreResult<()> {
        let (_, handle) = self
            .adapters
            .remove(id)
            .ok_or_else(|| CoreError::adapter_not_found(id))?;
        if let Some((_, task)) = self.tasks.remove(id) {
            task.abort();
        }
        let _ = handle.adapter.disconnect().await;
        handle.set_connection(ConnectionState::Disconnected);
        self.publish_health(id, false, false);
        Ok(())
    }

    /// Stop supervision and disconnect every adapter.
    pub async fn shutdown(&self) {
        for task in self.tasks.iter() {
            task.value().abort();
        }
        self.tasks.clear();
        for entry in self.adapters.iter() {
            let _ = entry.value().adapter.disconnect().await;
            entry.value().set_connection(ConnectionState::Disconnected);
        }
    }

    pub fn lease(&self, id: &str) -> CoreResult<AdapterLease> {
        self.adapters
            .get(id)
            .map(|h| AdapterLease {
                handle: h.value().clone(),
            })
            .ok_or_else(|| CoreError::adapter_not_found(id))
    }

    /// First connected adapter whose source matches.
    pub fn adapter_by_source(&self, source: &str) -> CoreResult<AdapterLease> {
        for entry in self.adapters.iter() {
            let lease = AdapterLease {
                handle: entry.value().clone(),
            };
            if lease.source() == source && lease.is_connected() {
                return Ok(lease);
            }
        }
        Err(CoreError::NoAdapterForSource {
            source_id: source.to_string(),
        })
    }

    /// Leases for every registered adapter, connected or not.
    pub fn leases(&self) -> Vec<AdapterLease> {
        self.adapters
            .iter()
            .map(|entry| AdapterLease {
                handle: entry.value().clone(),
            })
            .collect()
    }

    pub fn record(&self, id: &str) -> CoreResult<AdapterRecord> {
        let handle = self
            .adapters
            .get(id)
            .ok_or_else(|| CoreError::adapter_not_found(id))?;
        Ok(Self::build_record(handle.value()))
    }

    pub fn records(&self) -> Vec<AdapterRecord> {
        let mut records: Vec<_> = self
            .adapters
            .iter()
            .map(|entry| Self::build_record(entry.value()))
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    fn build_record(handle: &AdapterHandle) -> AdapterRecord {
        let adapter = &handle.adapter;
        let metrics = adapter.metrics();
        let state = handle.state.lock().unwrap();
        AdapterRecord {
            id: adapter.id().to_string(),
            name: adapter.name().to_string(),
            source: adapter.source().to_string(),
            version: adapter.version().to_string(),
            connected: state.connection == ConnectionState::Connected,
            state: state.connection,
            last_health_check: state.last_health_check,
            response_time_ms: state.response_time_ms,
            entities_managed: metrics.entities_managed,
            rooms_managed: metrics.rooms_managed,
            last_sync: metrics.last_sync,
            sync_errors: metrics.sync_errors,
        }
    }

    fn publish_health(&self, adapter_id: &str, connected: bool, is_healthy: bool) {
        self.hub.publish_adapter_health(AdapterHealthEvent {
            adapter_id: adapter_id.to_string(),
            connected,
            is_healthy,
        });
    }

    async fn try_connect(handle: &AdapterHandle, config: &RegistryConfig) -> bool {
        handle.set_connection(ConnectionState::Connecting);
        let outcome = tokio::time::timeout(config.connect_timeout, handle.adapter.connect()).await;
        match outcome {
            Ok(Ok(())) => {
                let mut state = handle.state.lock().unwrap();
                state.connection = ConnectionState::Connected;
                state.consecutive_failures = 0;
                drop(state);
                info!(adapter_id = %handle.adapter.id(), "Adapter connected");
                true
            }
            Ok(Err(e)) => {
                warn!(adapter_id = %handle.adapter.id(), error = %e, "Adapter connect failed");
                handle.set_connection(ConnectionState::Disconnected);
                false
            }
            Err(_) => {
                warn!(adapter_id = %handle.adapter.id(), "Adapter connect timed out");
                handle.set_connection(ConnectionState::Disconnected);
                false
            }
        }
    }

    /// Probe health once; returns whether the probe succeeded. Never
    /// touches entity state.
    async fn probe(handle: &AdapterHandle, config: &RegistryConfig) -> bool {
        let started = Instant::now();
        let outcome = tokio::time::timeout(config.health_timeout, handle.adapter.health()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let mut state = handle.state.lock().unwrap();
        state.last_health_check = Some(Utc::now());
        match outcome {
            Ok(health) if health.healthy => {
                state.response_time_ms = if health.response_time_ms > 0 {
                    health.response_time_ms
                } else {
                    elapsed_ms
                };
                state.consecutive_failures = 0;
                true
            }
            _ => {
                state.response_time_ms = elapsed_ms;
                state.consecutive_failures += 1;
                false
            }
        }
    }

    /// Per-adapter supervision: reconnect with backoff while
    /// disconnected, poll health while connected, demote after repeated
    /// failed probes and fall back into the reconnect phase.
    async fn supervise(handle: Arc<AdapterHandle>, hub: Arc<Hub>, config: RegistryConfig) {
        let adapter_id = handle.adapter.id().to_string();
        loop {
            let mut attempt: u32 = 0;
            while handle.connection_state() != ConnectionState::Connected {
                tokio::time::sleep(backoff_delay(attempt)).await;
                attempt = attempt.saturating_add(1);
                if Self::try_connect(&handle, &config).await {
                    hub.publish_adapter_health(AdapterHealthEvent {
                        adapter_id: adapter_id.clone(),
                        connected: true,
                        is_healthy: true,
                    });
                }
            }

            let mut ticker = tokio::time::interval(config.health_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if Self::probe(&handle, &config).await {
                    continue;
                }

                let failures = handle.state.lock().unwrap().consecutive_failures;
                debug!(adapter_id = %adapter_id, failures, "Health probe failed");
                if failures >= config.max_consecutive_failures {
                    warn!(adapter_id = %adapter_id, "Adapter unhealthy, reconnecting");
                    handle.set_connection(ConnectionState::Unhealthy);
                    hub.publish_adapter_health(AdapterHealthEvent {
                        adapter_id: adapter_id.clone(),
                        connected: true,
                        is_healthy: false,
                    });

                    let _ = handle.adapter.disconnect().await;
                    handle.set_connection(ConnectionState::Disconnected);
                    hub.publish_adapter_health(AdapterHealthEvent {
                        adapter_id: adapter_id.clone(),
                        connected: false,
                        is_healthy: false,
                    });
                    break;
                }
            }
        }
    }
}
