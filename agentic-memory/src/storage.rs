//! Durable record store
//!
//! The record store is the authoritative copy of every memory record and the
//! source of truth when the secondary indexes are reconciled. The built-in
//! implementation persists records in RocksDB with LZ4 compression and serves
//! reads from a warm in-process cache.

use async_trait::async_trait;
use dashmap::DashMap;
use rocksdb::{IteratorMode, Options, WriteBatch, DB};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use crate::error::{MemoryError, Result};
use crate::record::{MemoryKind, MemoryRecord, RecordId};

/// Database version stored in metadata
const DB_VERSION_KEY: &[u8] = b"_db_version";
const CURRENT_VERSION: u32 = 1;

const MESSAGE_PREFIX: &str = "msg:";
const VECTOR_PREFIX: &str = "vec:";

/// Authoritative storage for the three record collections
///
/// Writes must be durable before they return. Reads observe every write made
/// through the same store (read-after-write), and nothing else is promised.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Commit a new record to its collection. Records are append-only, so an
    /// id that already exists is rejected.
    async fn put(&self, record: MemoryRecord) -> Result<RecordId>;

    /// Fetch a record from one collection
    fn get(&self, kind: MemoryKind, id: &RecordId) -> Option<MemoryRecord>;

    /// All records of one collection
    fn list(&self, kind: MemoryKind) -> Vec<MemoryRecord>;

    /// Persist the embedding computed for a record during sync
    async fn put_embedding(&self, id: &RecordId, vector: &[f32]) -> Result<()>;

    /// Embedding previously persisted for a record
    fn embedding(&self, id: &RecordId) -> Option<Vec<f32>>;

    /// Commit every record a message produced together with the message
    /// index entry. Either all of them become durable or none do.
    async fn commit_message(&self, message_id: &str, records: &[MemoryRecord]) -> Result<()>;

    /// Records produced by an already memorized message
    fn message_records(&self, message_id: &str) -> Option<Vec<MemoryRecord>>;

    /// Total number of records across all collections
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn record_key(kind: MemoryKind, id: &RecordId) -> String {
    format!("{}:{}", kind.as_str(), id)
}

/// RocksDB-based record store
pub struct RocksRecordStore {
    db: Arc<DB>,
    records: Arc<DashMap<RecordId, MemoryRecord>>,
}

impl RocksRecordStore {
    /// Open (or create) a store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_background_jobs(2);
        opts.set_bytes_per_sync(1048576); // 1MB
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)?;
        check_version(&db)?;

        log::info!("RecordStore opened at: {}", path.display());

        let store = Self {
            db: Arc::new(db),
            records: Arc::new(DashMap::new()),
        };

        store.load_cache()?;
        Ok(store)
    }

    /// Load existing records into cache on startup
    fn load_cache(&self) -> Result<()> {
        let mut count = 0;
        let mut skipped = 0;

        for item in self.db.iterator(IteratorMode::Start) {
            let (key, value) = item?;
            let key_str = String::from_utf8_lossy(&key);

            let Some((collection, id)) = key_str.split_once(':') else {
                continue;
            };
            if collection.parse::<MemoryKind>().is_err() {
                continue;
            }

            // Gracefully handle decoding errors
            match serde_json::from_slice::<MemoryRecord>(&value) {
                Ok(record) => {
                    self.records.insert(record.id, record);
                    count += 1;
                }
                Err(e) => {
                    log::warn!("Failed to decode record {}: {}. Skipping.", id, e);
                    skipped += 1;
                }
            }
        }

        if count > 0 {
            log::info!("Loaded {} records from disk", count);
        }
        if skipped > 0 {
            log::warn!("Skipped {} records due to decoding errors", skipped);
        }

        Ok(())
    }

    /// Get store statistics
    pub fn stats(&self) -> serde_json::Value {
        let mut by_kind = serde_json::Map::new();
        for kind in MemoryKind::ALL {
            let count = self
                .records
                .iter()
                .filter(|entry| entry.value().kind() == kind)
                .count();
            by_kind.insert(kind.as_str().to_string(), count.into());
        }

        serde_json::json!({
            "totalRecords": self.records.len(),
            "byKind": by_kind,
        })
    }
}

/// Stamp a fresh database and refuse one written by a newer release
fn check_version(db: &DB) -> Result<()> {
    match db.get(DB_VERSION_KEY)? {
        Some(bytes) => {
            let version_bytes: [u8; 4] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| MemoryError::other("Invalid database version format"))?;
            let version = u32::from_le_bytes(version_bytes);
            if version > CURRENT_VERSION {
                return Err(MemoryError::other(format!(
                    "Database version {} is newer than supported version {}",
                    version, CURRENT_VERSION
                )));
            }
            log::debug!("Database version: {}", version);
        }
        None => {
            db.put(DB_VERSION_KEY, CURRENT_VERSION.to_le_bytes())?;
            db.flush()?;
        }
    }
    Ok(())
}

impl RocksRecordStore {
    /// Check a record can be appended and encode it under its key
    fn prepare(&self, record: &MemoryRecord) -> Result<(String, MemoryRecord, Vec<u8>)> {
        record.check_scope()?;

        let key = record_key(record.kind(), &record.id);
        if self.records.contains_key(&record.id) || self.db.get(key.as_bytes())?.is_some() {
            return Err(MemoryError::other(format!(
                "Record {} already exists; records are append-only",
                record.id
            )));
        }

        // Embeddings live under their own key, never inside the record
        let mut stored = record.clone();
        stored.embedding = None;
        let bytes = serde_json::to_vec(&stored)?;
        Ok((key, stored, bytes))
    }
}

#[async_trait]
impl RecordStore for RocksRecordStore {
    async fn put(&self, record: MemoryRecord) -> Result<RecordId> {
        let (key, stored, bytes) = self.prepare(&record)?;
        let id = stored.id;

        self.db.put(key.as_bytes(), bytes)?;
        self.db.flush()?;
        self.records.insert(id, stored);

        log::debug!("Committed {} record {}", key, id);
        Ok(id)
    }

    fn get(&self, kind: MemoryKind, id: &RecordId) -> Option<MemoryRecord> {
        self.records
            .get(id)
            .filter(|entry| entry.value().kind() == kind)
            .map(|entry| entry.value().clone())
    }

    fn list(&self, kind: MemoryKind) -> Vec<MemoryRecord> {
        let mut records: Vec<MemoryRecord> = self
            .records
            .iter()
            .filter(|entry| entry.value().kind() == kind)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|record| (record.created_at, record.id));
        records
    }

    async fn put_embedding(&self, id: &RecordId, vector: &[f32]) -> Result<()> {
        let key = format!("{}{}", VECTOR_PREFIX, id);
        self.db.put(key.as_bytes(), bincode::serialize(vector)?)?;
        Ok(())
    }

    fn embedding(&self, id: &RecordId) -> Option<Vec<f32>> {
        let key = format!("{}{}", VECTOR_PREFIX, id);
        let bytes = self.db.get(key.as_bytes()).ok()??;
        bincode::deserialize(&bytes).ok()
    }

    async fn commit_message(&self, message_id: &str, records: &[MemoryRecord]) -> Result<()> {
        let message_key = format!("{}{}", MESSAGE_PREFIX, message_id);
        if self.db.get(message_key.as_bytes())?.is_some() {
            return Err(MemoryError::DuplicateMessage(message_id.to_string()));
        }

        let mut seen = HashSet::new();
        let mut batch = WriteBatch::default();
        let mut staged = Vec::with_capacity(records.len());
        for record in records {
            if !seen.insert(record.id) {
                return Err(MemoryError::other(format!(
                    "Record {} appears twice in message {}",
                    record.id, message_id
                )));
            }
            let (key, stored, bytes) = self.prepare(record)?;
            batch.put(key.as_bytes(), bytes);
            staged.push(stored);
        }

        let entries: Vec<(MemoryKind, RecordId)> =
            staged.iter().map(|record| (record.kind(), record.id)).collect();
        batch.put(message_key.as_bytes(), bincode::serialize(&entries)?);

        self.db.write(batch)?;
        self.db.flush()?;
        for record in staged {
            self.records.insert(record.id, record);
        }

        log::debug!(
            "Committed message {} with {} records",
            message_id,
            entries.len()
        );
        Ok(())
    }

    fn message_records(&self, message_id: &str) -> Option<Vec<MemoryRecord>> {
        let key = format!("{}{}", MESSAGE_PREFIX, message_id);
        let bytes = match self.db.get(key.as_bytes()) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("Failed to read message index for {}: {}", message_id, e);
                return None;
            }
        };
        let entries: Vec<(MemoryKind, RecordId)> = match bincode::deserialize(&bytes) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Corrupt message index for {}: {}", message_id, e);
                return None;
            }
        };
        Some(
            entries
                .iter()
                .filter_map(|(kind, id)| self.get(*kind, id))
                .collect(),
        )
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temporal::ValidityWindow;

    fn episode(group: &str, text: &str) -> MemoryRecord {
        MemoryRecord::builder()
            .episode(None, text)
            .group_id(Some(group.to_string()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksRecordStore::open(dir.path()).unwrap();

        let record = episode("G1", "planning the offsite");
        let id = store.put(record.clone()).await.unwrap();

        assert_eq!(id, record.id);
        assert_eq!(store.get(MemoryKind::Episode, &id), Some(record));
        assert!(store.get(MemoryKind::EventLog, &id).is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_records_are_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksRecordStore::open(dir.path()).unwrap();

        let record = episode("G1", "first");
        store.put(record.clone()).await.unwrap();
        assert!(store.put(record).await.is_err());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_put_rejects_scope_violation() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksRecordStore::open(dir.path()).unwrap();

        let mut record = MemoryRecord::builder()
            .semantic_memory(None, "likes tea", None, ValidityWindow::unbounded())
            .user_id("user_001")
            .build()
            .unwrap();
        record.user_id = None;

        let err = store.put(record).await.unwrap_err();
        assert!(matches!(err, MemoryError::ScopeViolation(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_reopen_restores_records() {
        let dir = tempfile::tempdir().unwrap();
        let record = episode("G1", "persisted");
        {
            let store = RocksRecordStore::open(dir.path()).unwrap();
            store.commit_message("m1", &[record.clone()]).await.unwrap();
            store.put_embedding(&record.id, &[0.5, 0.5]).await.unwrap();
        }

        let store = RocksRecordStore::open(dir.path()).unwrap();
        assert_eq!(store.list(MemoryKind::Episode), vec![record.clone()]);
        assert_eq!(store.message_records("m1"), Some(vec![record.clone()]));
        assert_eq!(store.embedding(&record.id), Some(vec![0.5, 0.5]));
        assert!(store.message_records("m2").is_none());
    }

    #[tokio::test]
    async fn test_commit_message_is_all_or_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let existing = episode("G1", "already here");
        let fresh = episode("G1", "new episode");
        {
            let store = RocksRecordStore::open(dir.path()).unwrap();
            store.put(existing.clone()).await.unwrap();

            let err = store
                .commit_message("m1", &[fresh.clone(), existing.clone()])
                .await
                .unwrap_err();
            assert!(err.to_string().contains("append-only"));
            assert!(store.get(MemoryKind::Episode, &fresh.id).is_none());
            assert!(store.message_records("m1").is_none());
            assert_eq!(store.len(), 1);
        }

        let store = RocksRecordStore::open(dir.path()).unwrap();
        assert_eq!(store.list(MemoryKind::Episode), vec![existing]);
        assert!(store.message_records("m1").is_none());
    }

    #[tokio::test]
    async fn test_commit_message_rejects_known_message() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksRecordStore::open(dir.path()).unwrap();

        store
            .commit_message("m1", &[episode("G1", "first")])
            .await
            .unwrap();
        let err = store
            .commit_message("m1", &[episode("G1", "second")])
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::DuplicateMessage(id) if id == "m1"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_embedding_is_not_stored_inline() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksRecordStore::open(dir.path()).unwrap();

        let mut record = episode("G1", "with vector");
        record.embedding = Some(vec![1.0, 0.0]);
        let id = store.put(record).await.unwrap();

        assert!(store.get(MemoryKind::Episode, &id).unwrap().embedding.is_none());
    }

    #[test]
    fn test_newer_database_version_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut opts = Options::default();
            opts.create_if_missing(true);
            let db = DB::open(&opts, dir.path()).unwrap();
            db.put(DB_VERSION_KEY, (CURRENT_VERSION + 1).to_le_bytes())
                .unwrap();
        }

        let err = RocksRecordStore::open(dir.path()).err().unwrap();
        assert!(err.to_string().contains("newer than supported"));
    }

    #[tokio::test]
    async fn test_stats_by_kind() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksRecordStore::open(dir.path()).unwrap();
        store.put(episode("G1", "a")).await.unwrap();
        store.put(episode("G1", "b")).await.unwrap();

        let stats = store.stats();
        assert_eq!(stats["totalRecords"], 2);
        assert_eq!(stats["byKind"]["episode"], 2);
        assert_eq!(stats["byKind"]["event_log"], 0);
    }
}
