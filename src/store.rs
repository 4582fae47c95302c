use crate::error::StorageError;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use tokio::sync::RwLock;

const DB_FILE_NAME: &str = "crystal-guide.db";

/// String-keyed text storage. Values are JSON produced by [`set_json`].
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set_raw(&self, key: &str, value: String) -> Result<(), StorageError>;

    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Wipes every key.
    async fn clear(&self) -> Result<(), StorageError>;

    async fn keys(&self) -> Result<Vec<String>, StorageError>;
}

/// Outcome of a typed read. Reads never fail; callers that only care about
/// presence use [`Lookup::into_option`].
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Found(T),
    Absent,
    /// Stored text did not deserialize into the requested type.
    Corrupt(String),
    /// The backend could not be read.
    Unreadable(String),
}

impl<T> Lookup<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            _ => None,
        }
    }
}

pub async fn get_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Lookup<T> {
    let text = match store.get_raw(key).await {
        Ok(Some(text)) => text,
        Ok(None) => return Lookup::Absent,
        Err(error) => {
            log::warn!("[store] Failed to read {}: {}", key, error);
            return Lookup::Unreadable(error.to_string());
        }
    };
    match serde_json::from_str(&text) {
        Ok(value) => Lookup::Found(value),
        Err(error) => {
            log::warn!("[store] Corrupt value under {}: {}", key, error);
            Lookup::Corrupt(error.to_string())
        }
    }
}

pub async fn set_json<T>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<(), StorageError>
where
    T: Serialize + Sync + ?Sized,
{
    let text = serde_json::to_string(value)?;
    store.set_raw(key, text).await
}

/// SQLite-backed store. Each call opens its own connection on a blocking
/// worker thread.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pub base_dir: PathBuf,
    pub db_path: PathBuf,
}

impl SqliteStore {
    pub async fn open(base_dir: PathBuf) -> Result<Self, StorageError> {
        let db_path = base_dir.join(DB_FILE_NAME);
        let store = Self { base_dir, db_path };
        let init = store.clone();
        run_blocking(move || init.init()).await?;
        log::info!("[store] Opened {}", store.db_path.display());
        Ok(store)
    }

    fn init(&self) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.base_dir)?;
        let conn = self.open_conn()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS kv_entries (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );
        "#,
        )?;
        Ok(())
    }

    fn open_conn(&self) -> Result<Connection, StorageError> {
        Ok(Connection::open(&self.db_path)?)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, StorageError> {
        let store = self.clone();
        let key = key.to_string();
        run_blocking(move || {
            let conn = store.open_conn()?;
            let value = conn
                .query_row(
                    "SELECT value FROM kv_entries WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn set_raw(&self, key: &str, value: String) -> Result<(), StorageError> {
        let store = self.clone();
        let key = key.to_string();
        run_blocking(move || {
            let conn = store.open_conn()?;
            conn.execute(
                r#"
                INSERT INTO kv_entries(key, value, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
                "#,
                params![key, value, now()],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let store = self.clone();
        let key = key.to_string();
        run_blocking(move || {
            let conn = store.open_conn()?;
            conn.execute("DELETE FROM kv_entries WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let store = self.clone();
        run_blocking(move || {
            let conn = store.open_conn()?;
            conn.execute("DELETE FROM kv_entries", [])?;
            Ok(())
        })
        .await?;
        log::info!("[store] Cleared all keys");
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let store = self.clone();
        run_blocking(move || {
            let conn = store.open_conn()?;
            let mut stmt = conn.prepare("SELECT key FROM kv_entries ORDER BY key")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let keys = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        })
        .await
    }
}

/// Ordered in-memory store for ephemeral sessions and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
    #[cfg(test)]
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        #[cfg(test)]
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StorageError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set_raw(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.check_writable()?;
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.check_writable()?;
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.check_writable()?;
        self.entries.write().await.clear();
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }
}

async fn run_blocking<T, F>(job: F) -> Result<T, StorageError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|error| StorageError::Worker(error.to_string()))?
}

pub fn now() -> String {
    Utc::now().to_rfc3339()
}
