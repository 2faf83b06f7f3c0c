//! Durable per-session state persistence.
//!
//! A session's entire [`crate::state_store::AdapterState`] is persisted as one
//! opaque JSON record under a single logical key (`"state"`); the alarm
//! instant is an orthogonal slot next to it. Implementations must make writes
//! durable before returning and must make a `get` immediately after a `put`
//! in the same logical tick observe the written value.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Serialize};

/// The one key under which the state record lives.
pub const STATE_KEY: &str = "state";

/// Persists a single opaque state record per session with an orthogonal alarm slot.
///
/// Mirrors the "atomic overwrite, durable-before-return" contract every
/// keyed persistence layer in this crate relies on.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn put(&self, key: &str, value: serde_json::Value) -> io::Result<()>;
    async fn get(&self, key: &str) -> io::Result<Option<serde_json::Value>>;
    async fn delete(&self, key: &str) -> io::Result<()>;
    async fn delete_all(&self) -> io::Result<()>;
    async fn set_alarm(&self, instant_millis: u64) -> io::Result<()>;
    async fn delete_alarm(&self) -> io::Result<()>;
    async fn get_alarm(&self) -> io::Result<Option<u64>>;
}

/// Helper for typed access on top of the raw `serde_json::Value` contract.
pub async fn put_typed<S: Serialize + Sync>(
    store: &dyn DurableStore,
    key: &str,
    value: &S,
) -> io::Result<()> {
    let json = serde_json::to_value(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    store.put(key, json).await
}

/// Helper for typed access on top of the raw `serde_json::Value` contract.
pub async fn get_typed<T: DeserializeOwned>(
    store: &dyn DurableStore,
    key: &str,
) -> io::Result<Option<T>> {
    match store.get(key).await? {
        Some(v) => serde_json::from_value(v)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        None => Ok(None),
    }
}

/// In-memory durable store. Used in tests and for sessions that opt out of
/// disk persistence (hibernation survives only the process lifetime).
#[derive(Default)]
pub struct InMemoryDurableStore {
    records: RwLock<HashMap<String, serde_json::Value>>,
    alarm: RwLock<Option<u64>>,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn put(&self, key: &str, value: serde_json::Value) -> io::Result<()> {
        self.records.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> io::Result<Option<serde_json::Value>> {
        Ok(self.records.read().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> io::Result<()> {
        self.records.write().remove(key);
        Ok(())
    }

    async fn delete_all(&self) -> io::Result<()> {
        self.records.write().clear();
        Ok(())
    }

    async fn set_alarm(&self, instant_millis: u64) -> io::Result<()> {
        *self.alarm.write() = Some(instant_millis);
        Ok(())
    }

    async fn delete_alarm(&self) -> io::Result<()> {
        *self.alarm.write() = None;
        Ok(())
    }

    async fn get_alarm(&self) -> io::Result<Option<u64>> {
        Ok(*self.alarm.read())
    }
}

/// File-backed durable store: one JSON file per session directory, written
/// via a temp-file-then-rename so a crash mid-write never leaves a torn
/// record. The alarm is stored alongside as a sibling file rather than
/// embedded in the record, mirroring the store's "orthogonal slot" contract.
pub struct FileDurableStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileDurableStore {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn alarm_path(&self) -> PathBuf {
        self.dir.join("alarm.json")
    }

    /// Writes `value` to `path` atomically via a temp file in the same
    /// directory followed by a rename, so concurrent readers never observe
    /// a partial write.
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        let _guard = self.write_lock.lock();
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, bytes)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

#[async_trait]
impl DurableStore for FileDurableStore {
    async fn put(&self, key: &str, value: serde_json::Value) -> io::Result<()> {
        let path = self.record_path(key);
        let bytes = serde_json::to_vec(&value)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.write_atomic(&path, &bytes)
    }

    async fn get(&self, key: &str) -> io::Result<Option<serde_json::Value>> {
        let path = self.record_path(key);
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, key: &str) -> io::Result<()> {
        match std::fs::remove_file(self.record_path(key)) {
            Ok(()) | Err(_) => Ok(()),
        }
    }

    async fn delete_all(&self) -> io::Result<()> {
        self.delete(STATE_KEY).await?;
        self.delete_alarm().await
    }

    async fn set_alarm(&self, instant_millis: u64) -> io::Result<()> {
        let bytes = instant_millis.to_string().into_bytes();
        self.write_atomic(&self.alarm_path(), &bytes)
    }

    async fn delete_alarm(&self) -> io::Result<()> {
        match std::fs::remove_file(self.alarm_path()) {
            Ok(()) | Err(_) => Ok(()),
        }
    }

    async fn get_alarm(&self) -> io::Result<Option<u64>> {
        match std::fs::read_to_string(self.alarm_path()) {
            Ok(s) => Ok(s.trim().parse().ok()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Global lock guarding concurrent writers to the same data directory
/// across multiple `FileDurableStore` instances within one process, mirroring
/// the single process-wide write mutex used for atomic config persistence.
pub fn process_write_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Current time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_put_then_get_returns_same_tick_value() {
        let store = InMemoryDurableStore::new();
        store.put(STATE_KEY, serde_json::json!({"a": 1})).await.unwrap();
        let got = store.get(STATE_KEY).await.unwrap();
        assert_eq!(got, Some(serde_json::json!({"a": 1})));
    }

    #[tokio::test]
    async fn set_alarm_replaces_prior_alarm() {
        let store = InMemoryDurableStore::new();
        store.set_alarm(100).await.unwrap();
        store.set_alarm(50).await.unwrap();
        assert_eq!(store.get_alarm().await.unwrap(), Some(50));
    }

    #[tokio::test]
    async fn delete_all_clears_record_and_alarm() {
        let store = InMemoryDurableStore::new();
        store.put(STATE_KEY, serde_json::json!({"x": true})).await.unwrap();
        store.set_alarm(10).await.unwrap();
        store.delete_all().await.unwrap();
        assert_eq!(store.get(STATE_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_round_trips_through_temp_rename() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileDurableStore::new(tmp.path()).unwrap();
        store.put(STATE_KEY, serde_json::json!({"sessionName": "s1"})).await.unwrap();
        let got = store.get(STATE_KEY).await.unwrap().unwrap();
        assert_eq!(got["sessionName"], "s1");
        store.set_alarm(12345).await.unwrap();
        assert_eq!(store.get_alarm().await.unwrap(), Some(12345));
    }

    #[tokio::test]
    async fn file_store_get_missing_key_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileDurableStore::new(tmp.path()).unwrap();
        assert_eq!(store.get(STATE_KEY).await.unwrap(), None);
        assert_eq!(store.get_alarm().await.unwrap(), None);
    }
}
