//! Persistence adapters
//!
//! The core depends on three narrow store interfaces, injected at wiring
//! time: a key/value ConfigStore for credentials and small settings, a
//! durable ActionQueue for deferred actions, and an append-only
//! MetricsStore for time-series records. The SQLite implementation lives
//! in `sqlite`; nothing in the hot path reads from these stores.

pub mod sqlite;

pub use sqlite::SqliteStore;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use pma_core::{Action, SyncResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from the persistence layer
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("credential sealing failed: {0}")]
    Sealing(String),

    #[error("sealed value requires a configured secret")]
    SecretMissing,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queued action not found: {0}")]
    QueueEntryNotFound(i64),
}

/// Key/value store for credentials and small settings.
///
/// Values written with `encrypted = true` are sealed at rest and
/// transparently unsealed on read.
pub trait ConfigStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<String>>;
    fn set(&self, key: &str, value: &str, encrypted: bool) -> StoreResult<()>;
    fn delete(&self, key: &str) -> StoreResult<()>;
    /// All stored keys, sorted. Values are not exposed here.
    fn list(&self) -> StoreResult<Vec<String>>;
}

/// Lifecycle of a queued action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Pending => "pending",
            QueueState::Processing => "processing",
            QueueState::Completed => "completed",
            QueueState::Failed => "failed",
            QueueState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<QueueState> {
        match s {
            "pending" => Some(QueueState::Pending),
            "processing" => Some(QueueState::Processing),
            "completed" => Some(QueueState::Completed),
            "failed" => Some(QueueState::Failed),
            "cancelled" => Some(QueueState::Cancelled),
            _ => None,
        }
    }
}

/// A durably stored deferred action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedAction {
    pub id: i64,
    pub action: Action,
    pub state: QueueState,
    pub attempts: u32,
    pub max_retries: u32,
    pub retry_backoff_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable queue for actions executed outside the synchronous pipeline.
pub trait ActionQueue: Send + Sync {
    fn enqueue(&self, action: &Action, max_retries: u32, retry_backoff_secs: u64)
        -> StoreResult<i64>;

    /// Claim the oldest pending action, moving it to Processing.
    fn claim_next(&self) -> StoreResult<Option<QueuedAction>>;

    fn complete(&self, id: i64) -> StoreResult<()>;

    /// Record a failed attempt. The entry returns to Pending until its
    /// retry budget is spent, then lands in Failed.
    fn fail(&self, id: i64, error: &str) -> StoreResult<()>;

    fn cancel(&self, id: i64) -> StoreResult<()>;

    fn get(&self, id: i64) -> StoreResult<Option<QueuedAction>>;

    fn pending_count(&self) -> StoreResult<u64>;
}

/// Append-only time series. The core only writes; readers live outside
/// the hot path.
pub trait MetricsStore: Send + Sync {
    fn record(&self, metric: &str, value: f64, labels: &HashMap<String, String>)
        -> StoreResult<()>;

    fn record_sync(&self, result: &SyncResult) -> StoreResult<()>;
}
