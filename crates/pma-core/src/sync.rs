//! Per-source sync results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of reconciling one source's snapshot into the registries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub source: String,
    pub success: bool,

    /// Entities the source reported in its snapshot
    pub entities_found: usize,

    /// Entities newly registered by this sync
    pub entities_registered: usize,

    /// Pre-existing entities whose record changed
    pub entities_updated: usize,

    /// Entities removed after exhausting the grace cycle
    pub entities_removed: usize,

    /// Rooms reconciled from the source
    pub rooms_found: usize,

    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncResult {
    pub fn started(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            success: false,
            entities_found: 0,
            entities_registered: 0,
            entities_updated: 0,
            entities_removed: 0,
            rooms_found: 0,
            started_at: Utc::now(),
            duration_ms: 0,
            error: None,
        }
    }

    pub fn failed(source: impl Into<String>, error: impl Into<String>) -> Self {
        let mut result = Self::started(source);
        result.error = Some(error.into());
        result
    }
}
