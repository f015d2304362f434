//! SQLite-backed store implementation
//!
//! One connection behind a mutex serves all three store interfaces.
//! Encrypted config values are sealed with AES-256-GCM; the sealing key
//! is derived from the configured gateway secret with SHA-256, and the
//! random nonce is stored alongside the ciphertext.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use pma_core::{Action, SyncResult};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{
    ActionQueue, ConfigStore, MetricsStore, QueueState, QueuedAction, StoreError, StoreResult,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS config (
    key        TEXT PRIMARY KEY,
    value      BLOB NOT NULL,
    encrypted  INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS action_queue (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    payload            TEXT NOT NULL,
    state              TEXT NOT NULL,
    attempts           INTEGER NOT NULL DEFAULT 0,
    max_retries        INTEGER NOT NULL,
    retry_backoff_secs INTEGER NOT NULL,
    last_error         TEXT,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_action_queue_state ON action_queue (state, id);
CREATE TABLE IF NOT EXISTS metrics (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    metric      TEXT NOT NULL,
    value       REAL NOT NULL,
    labels      TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_metrics_metric ON metrics (metric, recorded_at);
";

struct Sealer {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl Sealer {
    fn new(secret: &str) -> StoreResult<Self> {
        let digest = Sha256::digest(secret.as_bytes());
        let unbound = UnboundKey::new(&AES_256_GCM, &digest)
            .map_err(|_| StoreError::Sealing("invalid derived key".to_string()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    fn seal(&self, plaintext: &[u8]) -> StoreResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| StoreError::Sealing("nonce generation failed".to_string()))?;

        let nonce = Nonce::assume_unique_for_key(nonce_bytes);
        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| StoreError::Sealing("seal failed".to_string()))?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend_from_slice(&in_out);
        Ok(sealed)
    }

    fn unseal(&self, sealed: &[u8]) -> StoreResult<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(StoreError::Sealing("sealed value too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| StoreError::Sealing("invalid nonce".to_string()))?;

        let mut buffer = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut buffer)
            .map_err(|_| StoreError::Sealing("unseal failed".to_string()))?;
        Ok(plaintext.to_vec())
    }
}

/// SQLite store implementing ConfigStore, ActionQueue and MetricsStore.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    sealer: Option<Sealer>,
}

impl SqliteStore {
    /// Open (and migrate) the store at the given path. `secret` enables
    /// sealing of encrypted config values.
    pub fn open(path: impl AsRef<Path>, secret: Option<&str>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn, secret)
    }

    /// In-memory store for tests.
    pub fn open_in_memory(secret: Option<&str>) -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, secret)
    }

    fn init(conn: Connection, secret: Option<&str>) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        debug!("SQLite store ready");
        Ok(Self {
            conn: Mutex::new(conn),
            sealer: secret.map(Sealer::new).transpose()?,
        })
    }

    fn row_to_queued(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, String, u32, u32, u64, Option<String>, String, String)> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
            row.get(8)?,
        ))
    }

    fn parse_queued(
        (id, payload, state, attempts, max_retries, retry_backoff_secs, last_error, created_at, updated_at): (
            i64,
            String,
            String,
            u32,
            u32,
            u64,
            Option<String>,
            String,
            String,
        ),
    ) -> StoreResult<QueuedAction> {
        let action: Action = serde_json::from_str(&payload)?;
        Ok(QueuedAction {
            id,
            action,
            state: QueueState::parse(&state).unwrap_or(QueueState::Failed),
            attempts,
            max_retries,
            retry_backoff_secs,
            last_error,
            created_at: parse_ts(&created_at),
            updated_at: parse_ts(&updated_at),
        })
    }
}

fn parse_ts(value: &str) -> DateTime<Utc> {
    value
        .parse::<DateTime<Utc>>()
        .unwrap_or_else(|_| Utc::now())
}

impl ConfigStore for SqliteStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(Vec<u8>, bool)> = conn
            .query_row(
                "SELECT value, encrypted FROM config WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((value, encrypted)) = row else {
            return Ok(None);
        };

        let bytes = if encrypted {
            let sealer = self.sealer.as_ref().ok_or(StoreError::SecretMissing)?;
            sealer.unseal(&value)?
        } else {
            value
        };
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| StoreError::Sealing("stored value is not UTF-8".to_string()))
    }

    fn set(&self, key: &str, value: &str, encrypted: bool) -> StoreResult<()> {
        let bytes = if encrypted {
            let sealer = self.sealer.as_ref().ok_or(StoreError::SecretMissing)?;
            sealer.seal(value.as_bytes())?
        } else {
            value.as_bytes().to_vec()
        };

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO config (key, value, encrypted, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET value = ?2, encrypted = ?3, updated_at = ?4",
            params![key, bytes, encrypted, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM config WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn list(&self) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT key FROM config ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}

impl ActionQueue for SqliteStore {
    fn enqueue(
        &self,
        action: &Action,
        max_retries: u32,
        retry_backoff_secs: u64,
    ) -> StoreResult<i64> {
        let payload = serde_json::to_string(action)?;
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO action_queue
                (payload, state, attempts, max_retries, retry_backoff_secs, created_at, updated_at)
             VALUES (?1, 'pending', 0, ?2, ?3, ?4, ?4)",
            params![payload, max_retries, retry_backoff_secs, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn claim_next(&self) -> StoreResult<Option<QueuedAction>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, payload, state, attempts, max_retries, retry_backoff_secs,
                        last_error, created_at, updated_at
                 FROM action_queue WHERE state = 'pending' ORDER BY id LIMIT 1",
                [],
                Self::row_to_queued,
            )
            .optional()?;

        let Some(raw) = row else {
            return Ok(None);
        };
        conn.execute(
            "UPDATE action_queue SET state = 'processing', updated_at = ?2 WHERE id = ?1",
            params![raw.0, Utc::now().to_rfc3339()],
        )?;
        let mut queued = Self::parse_queued(raw)?;
        queued.state = QueueState::Processing;
        Ok(Some(queued))
    }

    fn complete(&self, id: i64) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE action_queue SET state = 'completed', updated_at = ?2 WHERE id = ?1",
            params![id, Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(StoreError::QueueEntryNotFound(id));
        }
        Ok(())
    }

    fn fail(&self, id: i64, error: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let (attempts, max_retries): (u32, u32) = conn
            .query_row(
                "SELECT attempts, max_retries FROM action_queue WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or(StoreError::QueueEntryNotFound(id))?;

        let attempts = attempts + 1;
        let state = if attempts > max_retries {
            "failed"
        } else {
            "pending"
        };
        conn.execute(
            "UPDATE action_queue
             SET state = ?2, attempts = ?3, last_error = ?4, updated_at = ?5
             WHERE id = ?1",
            params![id, state, attempts, error, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn cancel(&self, id: i64) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE action_queue SET state = 'cancelled', updated_at = ?2
             WHERE id = ?1 AND state IN ('pending', 'processing')",
            params![id, Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(StoreError::QueueEntryNotFound(id));
        }
        Ok(())
    }

    fn get(&self, id: i64) -> StoreResult<Option<QueuedAction>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, payload, state, attempts, max_retries, retry_backoff_secs,
                        last_error, created_at, updated_at
                 FROM action_queue WHERE id = ?1",
                params![id],
                Self::row_to_queued,
            )
            .optional()?;
        row.map(Self::parse_queued).transpose()
    }

    fn pending_count(&self) -> StoreResult<u64> {
        let conn = self.conn.lock().unwrap();
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM action_queue WHERE state = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

impl MetricsStore for SqliteStore {
    fn record(
        &self,
        metric: &str,
        value: f64,
        labels: &HashMap<String, String>,
    ) -> StoreResult<()> {
        let labels = serde_json::to_string(labels)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO metrics (metric, value, labels, recorded_at) VALUES (?1, ?2, ?3, ?4)",
            params![metric, value, labels, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn record_sync(&self, result: &SyncResult) -> StoreResult<()> {
        let labels = HashMap::from([
            ("source".to_string(), result.source.clone()),
            ("success".to_string(), result.success.to_string()),
        ]);
        self.record("sync_duration_ms", result.duration_ms as f64, &labels)?;
        self.record(
            "sync_entities_found",
            result.entities_found as f64,
            &labels,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_roundtrip_plaintext() {
        let store = SqliteStore::open_in_memory(None).unwrap();
        store.set("ui.theme", "dark", false).unwrap();
        assert_eq!(ConfigStore::get(&store, "ui.theme").unwrap().as_deref(), Some("dark"));

        store.set("ui.theme", "light", false).unwrap();
        assert_eq!(ConfigStore::get(&store, "ui.theme").unwrap().as_deref(), Some("light"));

        store.delete("ui.theme").unwrap();
        assert_eq!(ConfigStore::get(&store, "ui.theme").unwrap(), None);
    }

    #[test]
    fn test_config_sealing_roundtrip() {
        let store = SqliteStore::open_in_memory(Some("gateway-secret")).unwrap();
        store
            .set("ring.refresh_token", "tok_abc123", true)
            .unwrap();
        assert_eq!(
            ConfigStore::get(&store, "ring.refresh_token").unwrap().as_deref(),
            Some("tok_abc123")
        );
    }

    #[test]
    fn test_sealed_value_is_not_plaintext_at_rest() {
        let store = SqliteStore::open_in_memory(Some("gateway-secret")).unwrap();
        store.set("auth.pin_hash", "super-secret", true).unwrap();

        let conn = store.conn.lock().unwrap();
        let raw: Vec<u8> = conn
            .query_row(
                "SELECT value FROM config WHERE key = 'auth.pin_hash'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(!raw.windows(12).any(|w| w == b"super-secret"));
    }

    #[test]
    fn test_encrypted_set_requires_secret() {
        let store = SqliteStore::open_in_memory(None).unwrap();
        assert!(matches!(
            store.set("ring.refresh_token", "tok", true),
            Err(StoreError::SecretMissing)
        ));
    }

    #[test]
    fn test_list_returns_sorted_keys() {
        let store = SqliteStore::open_in_memory(None).unwrap();
        store.set("b", "2", false).unwrap();
        store.set("a", "1", false).unwrap();
        assert_eq!(store.list().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_queue_lifecycle() {
        let store = SqliteStore::open_in_memory(None).unwrap();
        let action = Action::new("ha_light_kitchen", "turn_on");
        let id = store.enqueue(&action, 2, 30).unwrap();
        assert_eq!(store.pending_count().unwrap(), 1);

        let claimed = store.claim_next().unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.state, QueueState::Processing);
        assert_eq!(claimed.action.entity_id, "ha_light_kitchen");
        assert_eq!(store.pending_count().unwrap(), 0);
        assert!(store.claim_next().unwrap().is_none());

        store.complete(id).unwrap();
        assert_eq!(ActionQueue::get(&store, id).unwrap().unwrap().state, QueueState::Completed);
    }

    #[test]
    fn test_queue_retry_budget() {
        let store = SqliteStore::open_in_memory(None).unwrap();
        let id = store
            .enqueue(&Action::new("ha_light_kitchen", "turn_on"), 1, 30)
            .unwrap();

        // First failure: back to pending
        store.claim_next().unwrap().unwrap();
        store.fail(id, "source timed out").unwrap();
        let entry = ActionQueue::get(&store, id).unwrap().unwrap();
        assert_eq!(entry.state, QueueState::Pending);
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.last_error.as_deref(), Some("source timed out"));

        // Second failure exhausts the budget
        store.claim_next().unwrap().unwrap();
        store.fail(id, "source timed out again").unwrap();
        assert_eq!(ActionQueue::get(&store, id).unwrap().unwrap().state, QueueState::Failed);
    }

    #[test]
    fn test_queue_cancel_only_open_entries() {
        let store = SqliteStore::open_in_memory(None).unwrap();
        let id = store
            .enqueue(&Action::new("ha_light_kitchen", "turn_on"), 0, 30)
            .unwrap();
        store.cancel(id).unwrap();
        assert_eq!(ActionQueue::get(&store, id).unwrap().unwrap().state, QueueState::Cancelled);

        // Cancelling a settled entry fails
        assert!(store.cancel(id).is_err());
    }

    #[test]
    fn test_metrics_append() {
        let store = SqliteStore::open_in_memory(None).unwrap();
        let labels = HashMap::from([("source".to_string(), "ups".to_string())]);
        store.record("ups_battery_pct", 87.5, &labels).unwrap();

        let mut result = pma_core::SyncResult::started("homeassistant");
        result.success = true;
        result.duration_ms = 42;
        store.record_sync(&result).unwrap();

        let conn = store.conn.lock().unwrap();
        let count: u64 = conn
            .query_row("SELECT COUNT(*) FROM metrics", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.db");
        {
            let store = SqliteStore::open(&path, Some("s")).unwrap();
            store.set("auth.pin_hash", "h", false).unwrap();
        }
        let reopened = SqliteStore::open(&path, Some("s")).unwrap();
        assert_eq!(ConfigStore::get(&reopened, "auth.pin_hash").unwrap().as_deref(), Some("h"));
    }
}
