//! Durable key/value state shared by all automations
//!
//! The store keeps an in-memory index over an append-only operation log at
//! `<data-dir>/global_state.dat`. Every mutation appends one JSON record
//! and is fsynced before the call returns, so a crash-and-restart observes
//! every acknowledged write. The log is compacted on open once dead
//! records outnumber live ones.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// File name of the operation log inside the data directory
pub const STORE_FILE: &str = "global_state.dat";

/// Compact on open only once the log holds at least this many records
const COMPACT_MIN_RECORDS: usize = 64;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store is closed")]
    Closed,
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// One record of the operation log
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogRecord {
    Set { key: String, value: serde_json::Value },
    Delete { key: String },
    Clear,
}

/// The durable global key/value store
///
/// Reads are lock-free lookups against the in-memory index. Writes are
/// serialized through a single file handle and return only after the
/// mutation reached disk.
pub struct GlobalStore {
    /// Live view of the log
    index: DashMap<String, serde_json::Value>,
    /// Append handle; None once closed
    writer: Mutex<Option<File>>,
    /// Path of the log file
    path: PathBuf,
}

impl GlobalStore {
    /// Open the store under the given data directory
    ///
    /// Creates the directory when missing, replays the existing log into
    /// memory, and compacts it when it has accumulated more dead records
    /// than live ones.
    pub async fn open(data_dir: impl AsRef<Path>) -> StoreResult<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir).await?;
        let path = data_dir.join(STORE_FILE);

        let (entries, record_count) = replay(&path).await?;
        let live = entries.len();

        let index: DashMap<String, serde_json::Value> = entries.into_iter().collect();

        if record_count >= COMPACT_MIN_RECORDS && record_count > live * 2 {
            info!(record_count, live, "compacting global state log");
            compact(&path, &index).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        debug!(?path, entries = index.len(), "opened global store");

        Ok(Self {
            index,
            writer: Mutex::new(Some(file)),
            path,
        })
    }

    /// Look up a value
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.index.get(key).map(|v| v.clone())
    }

    /// Look up a value, falling back to a default
    pub fn get_or(&self, key: &str, default: serde_json::Value) -> serde_json::Value {
        self.get(key).unwrap_or(default)
    }

    /// Store a value durably
    ///
    /// Returns once the record is flushed to disk; a disk failure is
    /// surfaced and the in-memory index is left unchanged.
    pub async fn set(&self, key: impl Into<String>, value: serde_json::Value) -> StoreResult<()> {
        let key = key.into();
        self.append(&LogRecord::Set {
            key: key.clone(),
            value: value.clone(),
        })
        .await?;
        self.index.insert(key, value);
        Ok(())
    }

    /// Delete a key durably; deleting an absent key is a no-op
    pub async fn delete(&self, key: &str) -> StoreResult<()> {
        if !self.index.contains_key(key) {
            return Ok(());
        }
        self.append(&LogRecord::Delete {
            key: key.to_string(),
        })
        .await?;
        self.index.remove(key);
        Ok(())
    }

    /// Remove every key durably
    pub async fn clear(&self) -> StoreResult<()> {
        self.append(&LogRecord::Clear).await?;
        self.index.clear();
        Ok(())
    }

    /// All keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.index.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// A snapshot of the full map
    pub fn all(&self) -> HashMap<String, serde_json::Value> {
        self.index
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the store holds no entries
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Flush and drop the file handle; further mutations fail with
    /// [`StoreError::Closed`]
    pub async fn close(&self) -> StoreResult<()> {
        let mut writer = self.writer.lock().await;
        if let Some(file) = writer.take() {
            file.sync_all().await?;
            info!(path = ?self.path, "closed global store");
        }
        Ok(())
    }

    async fn append(&self, record: &LogRecord) -> StoreResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        let file = writer.as_mut().ok_or(StoreError::Closed)?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }
}

/// Replay the log into a map, returning the map and the record count
///
/// A torn trailing line (from a crash mid-append) ends the replay with a
/// warning; everything before it is intact because records are fsynced in
/// order.
async fn replay(path: &Path) -> StoreResult<(HashMap<String, serde_json::Value>, usize)> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok((HashMap::new(), 0)),
        Err(e) => return Err(e.into()),
    };

    let mut entries = HashMap::new();
    let mut count = 0usize;

    for line in content.lines() {
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<LogRecord>(line) {
            Ok(LogRecord::Set { key, value }) => {
                entries.insert(key, value);
            }
            Ok(LogRecord::Delete { key }) => {
                entries.remove(&key);
            }
            Ok(LogRecord::Clear) => entries.clear(),
            Err(e) => {
                warn!(error = %e, "truncated or corrupt log record; stopping replay");
                break;
            }
        }
        count += 1;
    }

    Ok((entries, count))
}

/// Rewrite the log as one Set record per live entry
///
/// Writes to a temp file, fsyncs it, then atomically renames over the log.
async fn compact(path: &Path, index: &DashMap<String, serde_json::Value>) -> StoreResult<()> {
    let tmp_path = path.with_extension("dat.tmp");

    let mut tmp = File::create(&tmp_path).await?;
    for entry in index.iter() {
        let record = LogRecord::Set {
            key: entry.key().clone(),
            value: entry.value().clone(),
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        tmp.write_all(&line).await?;
    }
    tmp.sync_all().await?;
    drop(tmp);

    fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_set_survives_reopen() {
        let dir = TempDir::new().unwrap();

        let store = GlobalStore::open(dir.path()).await.unwrap();
        store.set("night_mode", json!(true)).await.unwrap();
        store.close().await.unwrap();

        let store = GlobalStore::open(dir.path()).await.unwrap();
        assert_eq!(store.get("night_mode"), Some(json!(true)));
    }

    #[tokio::test]
    async fn test_set_delete_get_default() {
        let dir = TempDir::new().unwrap();
        let store = GlobalStore::open(dir.path()).await.unwrap();

        store.set("k", json!(1)).await.unwrap();
        store.delete("k").await.unwrap();

        assert_eq!(store.get("k"), None);
        assert_eq!(store.get_or("k", json!("fallback")), json!("fallback"));
    }

    #[tokio::test]
    async fn test_delete_survives_reopen() {
        let dir = TempDir::new().unwrap();

        let store = GlobalStore::open(dir.path()).await.unwrap();
        store.set("gone", json!("soon")).await.unwrap();
        store.delete("gone").await.unwrap();
        store.close().await.unwrap();

        let store = GlobalStore::open(dir.path()).await.unwrap();
        assert_eq!(store.get("gone"), None);
    }

    #[tokio::test]
    async fn test_delete_absent_key_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = GlobalStore::open(dir.path()).await.unwrap();

        store.delete("never_set").await.unwrap();
        store.delete("never_set").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_clear() {
        let dir = TempDir::new().unwrap();

        let store = GlobalStore::open(dir.path()).await.unwrap();
        store.set("a", json!(1)).await.unwrap();
        store.set("b", json!(2)).await.unwrap();
        store.clear().await.unwrap();
        store.close().await.unwrap();

        let store = GlobalStore::open(dir.path()).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_keys_sorted_and_all() {
        let dir = TempDir::new().unwrap();
        let store = GlobalStore::open(dir.path()).await.unwrap();

        store.set("zeta", json!(1)).await.unwrap();
        store.set("alpha", json!(2)).await.unwrap();

        assert_eq!(store.keys(), vec!["alpha", "zeta"]);
        assert_eq!(store.all().len(), 2);
    }

    #[tokio::test]
    async fn test_latest_write_wins_after_reopen() {
        let dir = TempDir::new().unwrap();

        let store = GlobalStore::open(dir.path()).await.unwrap();
        store.set("counter", json!(1)).await.unwrap();
        store.set("counter", json!(2)).await.unwrap();
        store.set("counter", json!(3)).await.unwrap();
        store.close().await.unwrap();

        let store = GlobalStore::open(dir.path()).await.unwrap();
        assert_eq!(store.get("counter"), Some(json!(3)));
    }

    #[tokio::test]
    async fn test_torn_tail_line_is_tolerated() {
        let dir = TempDir::new().unwrap();

        let store = GlobalStore::open(dir.path()).await.unwrap();
        store.set("intact", json!("yes")).await.unwrap();
        store.close().await.unwrap();

        // Simulate a crash mid-append
        let path = dir.path().join(STORE_FILE);
        let mut content = std::fs::read(&path).unwrap();
        content.extend_from_slice(br#"{"op":"set","key":"torn"#);
        std::fs::write(&path, content).unwrap();

        let store = GlobalStore::open(dir.path()).await.unwrap();
        assert_eq!(store.get("intact"), Some(json!("yes")));
        assert_eq!(store.get("torn"), None);
    }

    #[tokio::test]
    async fn test_compaction_preserves_state() {
        let dir = TempDir::new().unwrap();

        let store = GlobalStore::open(dir.path()).await.unwrap();
        for i in 0..100 {
            store.set("hot_key", json!(i)).await.unwrap();
        }
        store.set("other", json!("kept")).await.unwrap();
        store.close().await.unwrap();

        // Reopen compacts: 101 records, 2 live
        let store = GlobalStore::open(dir.path()).await.unwrap();
        assert_eq!(store.get("hot_key"), Some(json!(99)));
        assert_eq!(store.get("other"), Some(json!("kept")));
        store.close().await.unwrap();

        let compacted = std::fs::read_to_string(dir.path().join(STORE_FILE)).unwrap();
        assert_eq!(compacted.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_mutation_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let store = GlobalStore::open(dir.path()).await.unwrap();
        store.close().await.unwrap();

        let err = store.set("k", json!(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Closed));
    }
}
