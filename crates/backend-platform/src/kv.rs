//! Durable key-value tier.
//!
//! Records are addressed by `(entity_type, conversation_id, entity_id)` and
//! carry their own expiry. Values are plain JSON text.

use std::{
    collections::BTreeMap,
    path::Path,
    sync::{Arc, Mutex, RwLock},
};

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KvStoreError {
    #[error("durable store unavailable: {0}")]
    Unavailable(String),
    #[error("durable store backend failure: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for KvStoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub entity_type: String,
    pub conversation_id: String,
    pub entity_id: String,
}

impl RecordKey {
    pub fn new(
        entity_type: impl Into<String>,
        conversation_id: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            conversation_id: conversation_id.into(),
            entity_id: entity_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableRecord {
    pub key: RecordKey,
    /// Serialized entity.
    pub value: String,
    pub cached_at_ms: u64,
    pub expires_at_ms: u64,
}

impl DurableRecord {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// Storage that survives process restarts.
///
/// Implementations return expired records as stored; callers filter them.
pub trait DurableStore: Send + Sync {
    /// Insert or replace records.
    fn put_many(&self, records: &[DurableRecord]) -> Result<(), KvStoreError>;

    fn get(&self, key: &RecordKey) -> Result<Option<DurableRecord>, KvStoreError>;

    /// All records of one entity type in one conversation.
    fn scan(
        &self,
        entity_type: &str,
        conversation_id: &str,
    ) -> Result<Vec<DurableRecord>, KvStoreError>;

    fn delete_conversation(
        &self,
        entity_type: &str,
        conversation_id: &str,
    ) -> Result<usize, KvStoreError>;

    /// Delete every record expired at `now_ms`.
    fn purge_expired(&self, now_ms: u64) -> Result<usize, KvStoreError>;
}

impl<S: DurableStore + ?Sized> DurableStore for Arc<S> {
    fn put_many(&self, records: &[DurableRecord]) -> Result<(), KvStoreError> {
        (**self).put_many(records)
    }

    fn get(&self, key: &RecordKey) -> Result<Option<DurableRecord>, KvStoreError> {
        (**self).get(key)
    }

    fn scan(
        &self,
        entity_type: &str,
        conversation_id: &str,
    ) -> Result<Vec<DurableRecord>, KvStoreError> {
        (**self).scan(entity_type, conversation_id)
    }

    fn delete_conversation(
        &self,
        entity_type: &str,
        conversation_id: &str,
    ) -> Result<usize, KvStoreError> {
        (**self).delete_conversation(entity_type, conversation_id)
    }

    fn purge_expired(&self, now_ms: u64) -> Result<usize, KvStoreError> {
        (**self).purge_expired(now_ms)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryDurableStore {
    data: Arc<RwLock<BTreeMap<RecordKey, DurableRecord>>>,
}

impl InMemoryDurableStore {
    pub fn len(&self) -> usize {
        self.data.read().map(|data| data.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DurableStore for InMemoryDurableStore {
    fn put_many(&self, records: &[DurableRecord]) -> Result<(), KvStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| KvStoreError::Backend("poisoned lock".to_owned()))?;
        for record in records {
            data.insert(record.key.clone(), record.clone());
        }
        Ok(())
    }

    fn get(&self, key: &RecordKey) -> Result<Option<DurableRecord>, KvStoreError> {
        let data = self
            .data
            .read()
            .map_err(|_| KvStoreError::Backend("poisoned lock".to_owned()))?;
        Ok(data.get(key).cloned())
    }

    fn scan(
        &self,
        entity_type: &str,
        conversation_id: &str,
    ) -> Result<Vec<DurableRecord>, KvStoreError> {
        let data = self
            .data
            .read()
            .map_err(|_| KvStoreError::Backend("poisoned lock".to_owned()))?;
        Ok(data
            .values()
            .filter(|r| {
                r.key.entity_type == entity_type && r.key.conversation_id == conversation_id
            })
            .cloned()
            .collect())
    }

    fn delete_conversation(
        &self,
        entity_type: &str,
        conversation_id: &str,
    ) -> Result<usize, KvStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| KvStoreError::Backend("poisoned lock".to_owned()))?;
        let before = data.len();
        data.retain(|key, _| {
            !(key.entity_type == entity_type && key.conversation_id == conversation_id)
        });
        Ok(before - data.len())
    }

    fn purge_expired(&self, now_ms: u64) -> Result<usize, KvStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| KvStoreError::Backend("poisoned lock".to_owned()))?;
        let before = data.len();
        data.retain(|_, record| !record.is_expired(now_ms));
        Ok(before - data.len())
    }
}

/// SQLite-backed durable tier.
///
/// Every call blocks the calling thread on disk I/O. Async callers must move
/// it off the runtime worker (`block_in_place` or `spawn_blocking`).
pub struct SqliteDurableStore {
    conn: Mutex<Connection>,
}

impl SqliteDurableStore {
    pub fn open(path: &Path) -> Result<Self, KvStoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| KvStoreError::Unavailable(err.to_string()))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        migrate(&conn)?;
        info!(path = %path.display(), "durable cache opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, KvStoreError> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T, KvStoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, KvStoreError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| KvStoreError::Backend("poisoned lock".to_owned()))?;
        f(&mut conn)
    }
}

fn migrate(conn: &Connection) -> Result<(), KvStoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS cache_entries (
            entity_type     TEXT NOT NULL,
            conversation_id TEXT NOT NULL,
            entity_id       TEXT NOT NULL,
            value           TEXT NOT NULL,
            cached_at       INTEGER NOT NULL,
            expires_at      INTEGER NOT NULL,
            PRIMARY KEY (entity_type, conversation_id, entity_id)
        );

        CREATE INDEX IF NOT EXISTS idx_cache_entries_expiry
            ON cache_entries(expires_at);
        ",
    )?;
    Ok(())
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DurableRecord> {
    Ok(DurableRecord {
        key: RecordKey {
            entity_type: row.get(0)?,
            conversation_id: row.get(1)?,
            entity_id: row.get(2)?,
        },
        value: row.get(3)?,
        cached_at_ms: row.get::<_, i64>(4)?.max(0) as u64,
        expires_at_ms: row.get::<_, i64>(5)?.max(0) as u64,
    })
}

fn to_sql_ms(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

impl DurableStore for SqliteDurableStore {
    fn put_many(&self, records: &[DurableRecord]) -> Result<(), KvStoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR REPLACE INTO cache_entries
                        (entity_type, conversation_id, entity_id, value, cached_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for record in records {
                    stmt.execute(params![
                        record.key.entity_type,
                        record.key.conversation_id,
                        record.key.entity_id,
                        record.value,
                        to_sql_ms(record.cached_at_ms),
                        to_sql_ms(record.expires_at_ms),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn get(&self, key: &RecordKey) -> Result<Option<DurableRecord>, KvStoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT entity_type, conversation_id, entity_id, value, cached_at, expires_at
                 FROM cache_entries
                 WHERE entity_type = ?1 AND conversation_id = ?2 AND entity_id = ?3",
                params![key.entity_type, key.conversation_id, key.entity_id],
                record_from_row,
            )
            .optional()
            .map_err(KvStoreError::from)
        })
    }

    fn scan(
        &self,
        entity_type: &str,
        conversation_id: &str,
    ) -> Result<Vec<DurableRecord>, KvStoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT entity_type, conversation_id, entity_id, value, cached_at, expires_at
                 FROM cache_entries
                 WHERE entity_type = ?1 AND conversation_id = ?2",
            )?;
            let rows = stmt.query_map(params![entity_type, conversation_id], record_from_row)?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            Ok(records)
        })
    }

    fn delete_conversation(
        &self,
        entity_type: &str,
        conversation_id: &str,
    ) -> Result<usize, KvStoreError> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM cache_entries WHERE entity_type = ?1 AND conversation_id = ?2",
                params![entity_type, conversation_id],
            )?;
            Ok(deleted)
        })
    }

    fn purge_expired(&self, now_ms: u64) -> Result<usize, KvStoreError> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM cache_entries WHERE expires_at <= ?1",
                params![to_sql_ms(now_ms)],
            )?;
            debug!(deleted, "purged expired durable cache entries");
            Ok(deleted)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(entity_type: &str, room: &str, id: &str, expires_at_ms: u64) -> DurableRecord {
        DurableRecord {
            key: RecordKey::new(entity_type, room, id),
            value: format!("{{\"id\":\"{id}\"}}"),
            cached_at_ms: 1,
            expires_at_ms,
        }
    }

    fn exercise_store(store: &dyn DurableStore) {
        store
            .put_many(&[
                record("message", "!a", "$1", 100),
                record("message", "!a", "$2", 200),
                record("message", "!b", "$3", 300),
                record("room", "!a", "!a", 400),
            ])
            .expect("put should work");

        let mut a = store.scan("message", "!a").expect("scan should work");
        a.sort_by(|x, y| x.key.cmp(&y.key));
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].key.entity_id, "$1");

        store
            .put_many(&[DurableRecord {
                value: "{\"id\":\"$1\",\"v\":2}".into(),
                ..record("message", "!a", "$1", 150)
            }])
            .expect("replace should work");
        let replaced = store
            .get(&RecordKey::new("message", "!a", "$1"))
            .expect("get should work")
            .expect("record should exist");
        assert_eq!(replaced.expires_at_ms, 150);
        assert!(replaced.value.contains("\"v\":2"));

        let deleted = store
            .delete_conversation("message", "!a")
            .expect("delete should work");
        assert_eq!(deleted, 2);
        assert_eq!(store.scan("message", "!b").expect("scan b").len(), 1);
        assert_eq!(store.scan("room", "!a").expect("scan room").len(), 1);

        let purged = store.purge_expired(300).expect("purge should work");
        assert_eq!(purged, 1);
        assert!(store.scan("message", "!b").expect("scan b").is_empty());
        assert_eq!(store.scan("room", "!a").expect("scan room").len(), 1);
    }

    #[test]
    fn in_memory_store_semantics() {
        let store = InMemoryDurableStore::default();
        exercise_store(&store);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn sqlite_store_semantics() {
        let store = SqliteDurableStore::open_in_memory().expect("sqlite should open");
        exercise_store(&store);
    }

    #[test]
    fn sqlite_store_survives_reopen() {
        let path = std::env::temp_dir().join(format!(
            "pikachat-kv-{}.sqlite3",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0)
        ));
        {
            let store = SqliteDurableStore::open(&path).expect("open should work");
            store
                .put_many(&[record("message", "!a", "$1", u64::MAX)])
                .expect("put should work");
        }
        let reopened = SqliteDurableStore::open(&path).expect("reopen should work");
        let got = reopened
            .get(&RecordKey::new("message", "!a", "$1"))
            .expect("get should work");
        assert!(got.is_some());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_record_is_none() {
        let store = SqliteDurableStore::open_in_memory().expect("sqlite should open");
        let got = store
            .get(&RecordKey::new("message", "!nope", "$0"))
            .expect("get should work");
        assert_eq!(got, None);
    }
}
