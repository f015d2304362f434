//! Adapter framework for the PMA gateway
//!
//! Every upstream source (Home Assistant, Ring, UPS, ...) is wrapped in
//! an adapter implementing the `Adapter` contract. The `AdapterRegistry`
//! owns every adapter instance, drives its connection lifecycle and
//! health polling, and hands out non-owning leases to the rest of the
//! gateway.

pub mod registry;
pub mod testing;

pub use registry::{AdapterLease, AdapterRegistry, RegistryConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pma_core::{Action, ActionResult, CoreResult, Entity, Room};
use serde::{Deserialize, Serialize};

/// Connection lifecycle of an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Unhealthy,
}

/// Result of one health probe. Health checks never mutate entity state;
/// only sync, refresh and action results do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterHealth {
    pub healthy: bool,
    pub response_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl AdapterHealth {
    pub fn healthy(response_time_ms: u64) -> Self {
        Self {
            healthy: true,
            response_time_ms,
            details: None,
            checked_at: Utc::now(),
        }
    }

    pub fn unhealthy(details: impl Into<String>) -> Self {
        Self {
            healthy: false,
            response_time_ms: 0,
            details: Some(details.into()),
            checked_at: Utc::now(),
        }
    }
}

/// Counters an adapter maintains about its own activity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdapterMetrics {
    pub entities_managed: usize,
    pub rooms_managed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    pub sync_errors: u64,
    pub actions_executed: u64,
    pub actions_failed: u64,
}

/// Registry-level view of one adapter, as exposed over the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterRecord {
    pub id: String,
    pub name: String,
    pub source: String,
    pub version: String,
    pub connected: bool,
    pub state: ConnectionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,
    pub response_time_ms: u64,
    pub entities_managed: usize,
    pub rooms_managed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    pub sync_errors: u64,
}

/// Contract every source adapter implements.
///
/// `sync_entities` and `sync_rooms` return full snapshots; the sync
/// coordinator computes the diff. `execute_action` reports permanent
/// failures as `success = false` with a typed error code and must not
/// panic the process.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn source(&self) -> &str;
    fn version(&self) -> &str;

    async fn connect(&self) -> CoreResult<()>;
    async fn disconnect(&self) -> CoreResult<()>;
    fn is_connected(&self) -> bool;

    async fn health(&self) -> AdapterHealth;
    fn metrics(&self) -> AdapterMetrics;

    /// Full snapshot of this source's entities.
    async fn sync_entities(&self) -> CoreResult<Vec<Entity>>;

    /// Full snapshot of this source's rooms.
    async fn sync_rooms(&self) -> CoreResult<Vec<Room>>;

    /// Whether `refresh_entity` is implemented.
    fn supports_refresh(&self) -> bool {
        true
    }

    /// Re-read one entity from the source. Returns None when the source
    /// no longer knows the entity.
    async fn refresh_entity(&self, entity_id: &str) -> CoreResult<Option<Entity>>;

    /// Execute an action. The result's `new_state` is authoritative when
    /// the source confirms synchronously, optimistic otherwise (a later
    /// sync or refresh converges).
    async fn execute_action(&self, action: &Action) -> ActionResult;
}
