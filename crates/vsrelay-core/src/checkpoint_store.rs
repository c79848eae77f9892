//! Checkpoint store backends.
//!
//! Every backend keeps two tiers: `stage` records a checkpoint in memory and
//! `flush` persists everything staged so far. Reads see staged values first,
//! then durable ones.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::checkpoint::Checkpoint;
use crate::error::StoreError;

/// Durable key/value store for checkpoints.
#[allow(async_fn_in_trait)]
pub trait CheckpointStore: Send + Sync {
    /// Staged value for `key` if any, otherwise the durable one.
    async fn get(&self, key: &str) -> Result<Option<Checkpoint>, StoreError>;

    /// Record `checkpoint` under `key` in memory. Not durable until `flush`.
    async fn stage(&self, key: &str, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    /// Persist all staged state.
    async fn flush(&self) -> Result<(), StoreError>;
}

impl<T: CheckpointStore + ?Sized> CheckpointStore for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<Checkpoint>, StoreError> {
        (**self).get(key).await
    }

    async fn stage(&self, key: &str, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        (**self).stage(key, checkpoint).await
    }

    async fn flush(&self) -> Result<(), StoreError> {
        (**self).flush().await
    }
}

#[derive(Debug, Default)]
struct Tiers {
    staged: BTreeMap<String, Checkpoint>,
    durable: BTreeMap<String, Checkpoint>,
}

impl Tiers {
    fn get(&self, key: &str) -> Option<Checkpoint> {
        self.staged
            .get(key)
            .or_else(|| self.durable.get(key))
            .cloned()
    }

    /// Merge staged entries into the durable view, returning what was staged.
    fn promote(&mut self) -> BTreeMap<String, Checkpoint> {
        let staged = std::mem::take(&mut self.staged);
        for (key, cp) in &staged {
            self.durable.insert(key.clone(), cp.clone());
        }
        staged
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Process-local store. Flushing only moves staged entries to the durable map.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    tiers: Mutex<Tiers>,
    flushes: AtomicU64,
}

impl MemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `flush` calls so far.
    #[must_use]
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Acquire)
    }

    /// Durable value for `key`, ignoring staged state.
    pub async fn durable(&self, key: &str) -> Option<Checkpoint> {
        self.tiers.lock().await.durable.get(key).cloned()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, key: &str) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.tiers.lock().await.get(key))
    }

    async fn stage(&self, key: &str, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.tiers
            .lock()
            .await
            .staged
            .insert(key.to_string(), checkpoint.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.tiers.lock().await.promote();
        self.flushes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

// =============================================================================
// JSON file
// =============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedCheckpoints {
    #[serde(default)]
    checkpoints: BTreeMap<String, Checkpoint>,
}

/// All keys in one JSON document, replaced atomically on every flush.
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    tiers: Mutex<Tiers>,
}

impl FileCheckpointStore {
    /// Open the document at `path`. A missing or empty file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let persisted = load_persisted(&path)?;
        Ok(Self {
            path,
            tiers: Mutex::new(Tiers {
                staged: BTreeMap::new(),
                durable: persisted.checkpoints,
            }),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, key: &str) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.tiers.lock().await.get(key))
    }

    async fn stage(&self, key: &str, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.tiers
            .lock()
            .await
            .staged
            .insert(key.to_string(), checkpoint.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let mut tiers = self.tiers.lock().await;
        let mut next = tiers.durable.clone();
        next.extend(tiers.staged.iter().map(|(k, v)| (k.clone(), v.clone())));
        write_persisted(
            &self.path,
            &PersistedCheckpoints { checkpoints: next },
        )?;
        tiers.promote();
        Ok(())
    }
}

fn load_persisted(path: &Path) -> Result<PersistedCheckpoints, StoreError> {
    if !path.exists() {
        return Ok(PersistedCheckpoints::default());
    }
    let bytes = std::fs::read(path)?;
    if bytes.is_empty() {
        return Ok(PersistedCheckpoints::default());
    }
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
        location: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn write_persisted(path: &Path, state: &PersistedCheckpoints) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    let bytes = serde_json::to_vec_pretty(state).map_err(|e| StoreError::Corrupt {
        location: path.display().to_string(),
        reason: e.to_string(),
    })?;
    std::fs::write(&tmp_path, bytes)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

// =============================================================================
// SQLite
// =============================================================================

const SQLITE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS checkpoints (
    key        TEXT PRIMARY KEY NOT NULL,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

/// One row per key; a flush writes every staged key in a single transaction.
pub struct SqliteCheckpointStore {
    path: PathBuf,
    conn: Arc<std::sync::Mutex<rusqlite::Connection>>,
    staged: Mutex<BTreeMap<String, Checkpoint>>,
}

impl std::fmt::Debug for SqliteCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCheckpointStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteCheckpointStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(&path)?;
        conn.execute_batch(SQLITE_SCHEMA)?;
        Ok(Self {
            path,
            conn: Arc::new(std::sync::Mutex::new(conn)),
            staged: Mutex::new(BTreeMap::new()),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn decode(&self, value: &str) -> Result<Checkpoint, StoreError> {
        serde_json::from_str(value).map_err(|e| StoreError::Corrupt {
            location: self.path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Run `op` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StoreError::Io(std::io::Error::other("sqlite connection poisoned")))?;
            op(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(format!("task join: {e}"))))?
    }
}

fn load_value_sync(
    conn: &rusqlite::Connection,
    key: &str,
) -> Result<Option<String>, StoreError> {
    let value = conn
        .query_row(
            "SELECT value FROM checkpoints WHERE key = ?1",
            rusqlite::params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

/// Upsert `rows` in one transaction.
fn save_values_sync(
    conn: &mut rusqlite::Connection,
    rows: &[(String, String)],
) -> Result<(), StoreError> {
    let tx = conn.transaction()?;
    let updated_at = chrono::Utc::now().to_rfc3339();
    for (key, value) in rows {
        tx.execute(
            "INSERT INTO checkpoints (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            rusqlite::params![key, value, updated_at],
        )?;
    }
    tx.commit()?;
    Ok(())
}

impl CheckpointStore for SqliteCheckpointStore {
    async fn get(&self, key: &str) -> Result<Option<Checkpoint>, StoreError> {
        if let Some(cp) = self.staged.lock().await.get(key) {
            return Ok(Some(cp.clone()));
        }
        let key = key.to_string();
        let value = self
            .with_conn(move |conn| load_value_sync(conn, &key))
            .await?;
        value.map(|v| self.decode(&v)).transpose()
    }

    async fn stage(&self, key: &str, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.staged
            .lock()
            .await
            .insert(key.to_string(), checkpoint.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let mut staged = self.staged.lock().await;
        if staged.is_empty() {
            return Ok(());
        }
        let rows = staged
            .iter()
            .map(|(key, cp)| {
                let value = serde_json::to_string(cp).map_err(|e| StoreError::Corrupt {
                    location: self.path.display().to_string(),
                    reason: e.to_string(),
                })?;
                Ok((key.clone(), value))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        self.with_conn(move |conn| save_values_sync(conn, &rows))
            .await?;
        staged.clear();
        Ok(())
    }
}

// =============================================================================
// Location dispatch
// =============================================================================

/// Backend chosen from a location string by [`open_store`].
#[derive(Debug)]
pub enum AnyCheckpointStore {
    Memory(MemoryCheckpointStore),
    File(FileCheckpointStore),
    Sqlite(SqliteCheckpointStore),
}

impl AnyCheckpointStore {
    /// Human-readable location for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Memory(_) => "memory://".to_string(),
            Self::File(s) => s.path().display().to_string(),
            Self::Sqlite(s) => format!("sqlite://{}", s.path().display()),
        }
    }
}

impl CheckpointStore for AnyCheckpointStore {
    async fn get(&self, key: &str) -> Result<Option<Checkpoint>, StoreError> {
        match self {
            Self::Memory(s) => s.get(key).await,
            Self::File(s) => s.get(key).await,
            Self::Sqlite(s) => s.get(key).await,
        }
    }

    async fn stage(&self, key: &str, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        match self {
            Self::Memory(s) => s.stage(key, checkpoint).await,
            Self::File(s) => s.stage(key, checkpoint).await,
            Self::Sqlite(s) => s.stage(key, checkpoint).await,
        }
    }

    async fn flush(&self) -> Result<(), StoreError> {
        match self {
            Self::Memory(s) => s.flush().await,
            Self::File(s) => s.flush().await,
            Self::Sqlite(s) => s.flush().await,
        }
    }
}

/// Open a store from its location:
/// `memory://`, `sqlite://<path>`, or a plain path to a JSON document.
pub fn open_store(location: &str) -> Result<AnyCheckpointStore, StoreError> {
    let location = location.trim();
    if location == "memory://" {
        return Ok(AnyCheckpointStore::Memory(MemoryCheckpointStore::new()));
    }
    if let Some(path) = location.strip_prefix("sqlite://") {
        if path.is_empty() {
            return Err(StoreError::UnsupportedLocation(location.to_string()));
        }
        return Ok(AnyCheckpointStore::Sqlite(SqliteCheckpointStore::open(path)?));
    }
    if location.is_empty() || location.contains("://") {
        return Err(StoreError::UnsupportedLocation(location.to_string()));
    }
    Ok(AnyCheckpointStore::File(FileCheckpointStore::open(location)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use tempfile::tempdir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn cp(key: i64) -> Checkpoint {
        Checkpoint {
            source: "vc01".to_string(),
            last_event_key: key,
            last_event_type: "UserLoginSessionEvent".to_string(),
            last_event_timestamp: at(1_700_000_000 + key),
            written_at: at(1_700_000_100),
        }
    }

    #[tokio::test]
    async fn memory_stage_is_visible_before_flush() {
        let store = MemoryCheckpointStore::new();
        assert!(store.get("k").await.unwrap().is_none());

        store.stage("k", &cp(1)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(cp(1)));
        assert!(store.durable("k").await.is_none());

        store.flush().await.unwrap();
        assert_eq!(store.durable("k").await, Some(cp(1)));
        assert_eq!(store.flush_count(), 1);
    }

    #[tokio::test]
    async fn memory_staged_value_shadows_durable() {
        let store = MemoryCheckpointStore::new();
        store.stage("k", &cp(1)).await.unwrap();
        store.flush().await.unwrap();
        store.stage("k", &cp(2)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(cp(2)));
        assert_eq!(store.durable("k").await, Some(cp(1)));
    }

    #[tokio::test]
    async fn file_store_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("checkpoints.json");

        let store = FileCheckpointStore::open(&path).unwrap();
        store.stage("a", &cp(10)).await.unwrap();
        store.stage("b", &cp(20)).await.unwrap();
        assert!(!path.exists(), "stage must not write");
        store.flush().await.unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let reopened = FileCheckpointStore::open(&path).unwrap();
        assert_eq!(reopened.get("a").await.unwrap(), Some(cp(10)));
        assert_eq!(reopened.get("b").await.unwrap(), Some(cp(20)));
    }

    #[tokio::test]
    async fn file_store_unflushed_stage_is_lost_on_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cp.json");

        let store = FileCheckpointStore::open(&path).unwrap();
        store.stage("k", &cp(1)).await.unwrap();
        store.flush().await.unwrap();
        store.stage("k", &cp(2)).await.unwrap();
        drop(store);

        let reopened = FileCheckpointStore::open(&path).unwrap();
        assert_eq!(reopened.get("k").await.unwrap(), Some(cp(1)));
    }

    #[tokio::test]
    async fn file_store_empty_file_is_empty_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cp.json");
        std::fs::write(&path, b"").unwrap();
        let store = FileCheckpointStore::open(&path).unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[test]
    fn file_store_corrupt_document_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cp.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let err = FileCheckpointStore::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }), "{err}");
    }

    #[tokio::test]
    async fn sqlite_store_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cp.db");

        let store = SqliteCheckpointStore::open(&path).unwrap();
        store.stage("k", &cp(5)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(cp(5)));
        store.flush().await.unwrap();
        store.stage("k", &cp(6)).await.unwrap();
        store.flush().await.unwrap();
        drop(store);

        let reopened = SqliteCheckpointStore::open(&path).unwrap();
        assert_eq!(reopened.get("k").await.unwrap(), Some(cp(6)));

        let conn = rusqlite::Connection::open(&path).unwrap();
        let rows: i64 = conn
            .query_row("SELECT count(*) FROM checkpoints", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn sqlite_store_missing_key_is_none() {
        let dir = tempdir().unwrap();
        let store = SqliteCheckpointStore::open(dir.path().join("cp.db")).unwrap();
        assert!(store.get("absent").await.unwrap().is_none());
        store.flush().await.unwrap();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn sqlite_flush_waits_for_locks_off_the_runtime_thread() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cp.db");
        let store = SqliteCheckpointStore::open(&path).unwrap();
        store.stage("k", &cp(7)).await.unwrap();

        // Another writer holds the database; it lets go only once the
        // runtime gets to run its timer.
        let holder = rusqlite::Connection::open(&path).unwrap();
        holder.execute_batch("BEGIN EXCLUSIVE").unwrap();
        let release = async {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            holder.execute_batch("COMMIT").unwrap();
        };

        let started = std::time::Instant::now();
        let (flushed, ()) = tokio::join!(store.flush(), release);
        flushed.unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(4));

        drop(store);
        let reopened = SqliteCheckpointStore::open(&path).unwrap();
        assert_eq!(reopened.get("k").await.unwrap(), Some(cp(7)));
    }

    #[tokio::test]
    async fn open_store_dispatches_on_location() {
        let dir = tempdir().unwrap();

        let mem = open_store("memory://").unwrap();
        assert!(matches!(mem, AnyCheckpointStore::Memory(_)));
        assert_eq!(mem.describe(), "memory://");

        let db = dir.path().join("cp.db");
        let sqlite = open_store(&format!("sqlite://{}", db.display())).unwrap();
        assert!(matches!(sqlite, AnyCheckpointStore::Sqlite(_)));
        sqlite.stage("k", &cp(1)).await.unwrap();
        sqlite.flush().await.unwrap();
        assert!(db.exists());

        let json = dir.path().join("cp.json");
        let file = open_store(json.to_str().unwrap()).unwrap();
        assert!(matches!(file, AnyCheckpointStore::File(_)));
    }

    #[test]
    fn open_store_rejects_unknown_schemes() {
        for location in ["", "sqlite://", "s3://bucket/key", "redis://localhost"] {
            let err = open_store(location).unwrap_err();
            assert!(
                matches!(err, StoreError::UnsupportedLocation(_)),
                "{location}: {err}"
            );
        }
    }

    #[tokio::test]
    async fn arc_store_delegates() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let shared = Arc::clone(&store);
        shared.stage("k", &cp(3)).await.unwrap();
        shared.flush().await.unwrap();
        assert_eq!(store.flush_count(), 1);
        assert_eq!(store.get("k").await.unwrap(), Some(cp(3)));
    }
}
