//! Memory service
//!
//! Facade over the write path (extract, commit, enqueue sync) and the read
//! path (route, rank, assemble).

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::assembler::{assemble, RetrievalResponse};
use crate::config::{DuplicatePolicy, MemoryConfig};
use crate::dispatcher::{DeadLetter, SyncDispatcher, SyncJob, SyncStats};
use crate::embedding::{EmbeddingProvider, HashingEmbedder, VectorEngine, DEFAULT_DIMENSION};
use crate::error::{MemoryError, Result};
use crate::extract::{
    latest_profile, ActivityProfiler, Analyzer, MemoryExtractor, ProfileDraft, ProfileExtractor,
    ProfileMemory, ProfileMemoryMerger, SentenceAnalyzer, Summarizer, TranscriptSummarizer,
};
use crate::fusion::RankFusionEngine;
use crate::index::{Bm25LexicalIndex, HnswVectorIndex, LexicalIndex, VectorIndex};
use crate::record::{MemoryKind, MemoryRecord, Message};
use crate::router::{RetrievalQuery, RetrievalRouter};
use crate::storage::{RecordStore, RocksRecordStore};

/// Result of memorizing one message
#[derive(Debug, Clone)]
pub struct MemorizeOutcome {
    /// Committed records, episode first
    pub saved: Vec<MemoryRecord>,
    /// Present when personal extraction failed
    pub notice: Option<String>,
    /// The message had been memorized before; nothing new was written
    pub replayed: bool,
}

/// Service statistics
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub total_records: usize,
    pub sync: SyncStats,
}

/// Builder for [`MemoryService`]. Unset collaborators fall back to the
/// in-process implementations.
pub struct MemoryServiceBuilder {
    store: Arc<dyn RecordStore>,
    config: MemoryConfig,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    vector: Option<Arc<dyn VectorIndex>>,
    lexical: Option<Arc<dyn LexicalIndex>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    analyzer: Option<Arc<dyn Analyzer>>,
    profiler: Option<Arc<dyn ProfileExtractor>>,
}

impl MemoryServiceBuilder {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            config: MemoryConfig::default(),
            embedder: None,
            vector: None,
            lexical: None,
            summarizer: None,
            analyzer: None,
            profiler: None,
        }
    }

    pub fn config(mut self, config: MemoryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn vector_index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.vector = Some(index);
        self
    }

    pub fn lexical_index(mut self, index: Arc<dyn LexicalIndex>) -> Self {
        self.lexical = Some(index);
        self
    }

    pub fn summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn profiler(mut self, profiler: Arc<dyn ProfileExtractor>) -> Self {
        self.profiler = Some(profiler);
        self
    }

    /// Wire the service and start its sync workers. Must be called within a
    /// Tokio runtime.
    pub fn build(self) -> MemoryService {
        let embedder = self
            .embedder
            .unwrap_or_else(|| Arc::new(HashingEmbedder::new(DEFAULT_DIMENSION)));
        let engine = Arc::new(VectorEngine::with_cache_capacity(
            embedder,
            self.config.retrieval.embedding_cache_capacity,
        ));
        let vector = self
            .vector
            .unwrap_or_else(|| Arc::new(HnswVectorIndex::new(engine.dimension())));
        let lexical = self
            .lexical
            .unwrap_or_else(|| Arc::new(Bm25LexicalIndex::new()));
        let summarizer = self
            .summarizer
            .unwrap_or_else(|| Arc::new(TranscriptSummarizer));
        let analyzer = self.analyzer.unwrap_or_else(|| Arc::new(SentenceAnalyzer));
        let profiler = self.profiler.unwrap_or_else(|| Arc::new(ActivityProfiler));

        let extractor = MemoryExtractor::new(summarizer, self.config.extraction.clone())
            .with_analyzer(analyzer)
            .with_profiler(profiler);
        let merger = ProfileMemoryMerger::new(self.config.extraction.importance_threshold);
        let dispatcher = SyncDispatcher::start(
            Arc::clone(&self.store),
            Arc::clone(&engine),
            Arc::clone(&vector),
            Arc::clone(&lexical),
            self.config.sync.clone(),
        );
        let router = RetrievalRouter::new(self.config.retrieval.max_top_k);
        let fusion = RankFusionEngine::new(engine, vector, lexical, self.config.retrieval.clone());

        MemoryService {
            store: self.store,
            extractor,
            dispatcher,
            router,
            fusion,
            merger,
            duplicate_policy: self.config.duplicate_policy,
            message_locks: DashMap::new(),
            profile_locks: DashMap::new(),
        }
    }
}

/// Memorize and retrieve over one record store
pub struct MemoryService {
    store: Arc<dyn RecordStore>,
    extractor: MemoryExtractor,
    dispatcher: SyncDispatcher,
    router: RetrievalRouter,
    fusion: RankFusionEngine,
    merger: ProfileMemoryMerger,
    duplicate_policy: DuplicatePolicy,
    /// Serializes concurrent memorize calls for the same message id
    message_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Serializes profile read-merge-commit per user; taken after a message lock
    profile_locks: DashMap<String, Arc<Mutex<()>>>,
}

fn acquire(locks: &DashMap<String, Arc<Mutex<()>>>, key: &str) -> Arc<Mutex<()>> {
    locks.entry(key.to_string()).or_default().clone()
}

/// Drop the lock entry once no other caller holds or waits on it
fn release(locks: &DashMap<String, Arc<Mutex<()>>>, key: &str, lock: Arc<Mutex<()>>) {
    drop(lock);
    locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
}

impl MemoryService {
    pub fn builder(store: Arc<dyn RecordStore>) -> MemoryServiceBuilder {
        MemoryServiceBuilder::new(store)
    }

    /// Open a RocksDB store at `path` with in-process indexes, then queue
    /// every stored record for re-indexing.
    pub async fn open(
        path: impl AsRef<Path>,
        config: MemoryConfig,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let store = Arc::new(RocksRecordStore::open(path)?);
        let service = Self::builder(store).config(config).embedder(embedder).build();
        service.dispatcher.backfill().await;
        Ok(service)
    }

    /// Derive records from a message, commit them, and queue them for sync
    ///
    /// Returns once every record is durable; index propagation continues in
    /// the background and never fails this call.
    ///
    /// # Errors
    /// - `Validation` for a malformed message
    /// - `Extraction` when no episode could be produced (nothing is stored)
    /// - `DuplicateMessage` under [`DuplicatePolicy::Reject`]
    /// - `Storage` when the commit fails; no record of the message is kept,
    ///   so the call can be retried
    pub async fn memorize(&self, message: Message) -> Result<MemorizeOutcome> {
        message.validate()?;

        let lock = acquire(&self.message_locks, &message.message_id);
        let outcome = {
            let _guard = lock.lock().await;
            self.memorize_exclusive(&message).await
        };
        release(&self.message_locks, &message.message_id, lock);

        outcome
    }

    async fn memorize_exclusive(&self, message: &Message) -> Result<MemorizeOutcome> {
        if let Some(saved) = self.store.message_records(&message.message_id) {
            return match self.duplicate_policy {
                DuplicatePolicy::Replay => {
                    log::info!(
                        "Message {} already memorized; replaying {} records",
                        message.message_id,
                        saved.len()
                    );
                    Ok(MemorizeOutcome {
                        saved,
                        notice: None,
                        replayed: true,
                    })
                }
                DuplicatePolicy::Reject => {
                    Err(MemoryError::DuplicateMessage(message.message_id.clone()))
                }
            };
        }

        let mut extraction = self.extractor.extract(message).await?;

        let committed = match extraction.profile.take() {
            Some(draft) => {
                let lock = acquire(&self.profile_locks, &message.sender);
                let committed = {
                    let _guard = lock.lock().await;
                    match self.next_profile(message, draft) {
                        Ok(record) => {
                            extraction.records.push(record);
                            self.store
                                .commit_message(&message.message_id, &extraction.records)
                                .await
                        }
                        Err(e) => Err(e),
                    }
                };
                release(&self.profile_locks, &message.sender, lock);
                committed
            }
            None => {
                self.store
                    .commit_message(&message.message_id, &extraction.records)
                    .await
            }
        };
        committed?;

        for record in &extraction.records {
            self.dispatcher
                .enqueue(SyncJob {
                    record_id: record.id,
                    kind: record.kind(),
                })
                .await;
        }

        log::info!(
            "Memorized message {}: {} records",
            message.message_id,
            extraction.records.len()
        );
        Ok(MemorizeOutcome {
            saved: extraction.records,
            notice: extraction.notice,
            replayed: false,
        })
    }

    /// Merge a draft into the sender's latest profile, as a new record that
    /// supersedes it. Caller holds the sender's profile lock.
    fn next_profile(&self, message: &Message, draft: ProfileDraft) -> Result<MemoryRecord> {
        let previous = latest_profile(self.store.list(MemoryKind::SemanticMemory), &message.sender);
        let merged = self.merger.merge(
            &message.sender,
            previous.as_ref().map(|(_, profile)| profile),
            draft,
        );
        // The newest profile must sort last even when messages arrive out of order
        let created_at = match &previous {
            Some((record, _)) if message.create_time <= record.created_at => record
                .created_at
                .checked_add_signed(chrono::Duration::microseconds(1))
                .unwrap_or(record.created_at),
            _ => message.create_time,
        };
        merged.to_record(message, created_at, previous.map(|(record, _)| record.id))
    }

    /// Latest merged profile of a user
    pub fn profile(&self, user_id: &str) -> Option<ProfileMemory> {
        latest_profile(self.store.list(MemoryKind::SemanticMemory), user_id)
            .map(|(_, profile)| profile)
    }

    /// Answer a query from the secondary indexes
    ///
    /// # Errors
    /// - `Validation` for an empty query or out-of-range `top_k`
    /// - `RetrievalBackend` or `Timeout` from the rank fusion engine
    pub async fn retrieve(&self, query: RetrievalQuery) -> Result<RetrievalResponse> {
        let route = self.router.resolve(&query, Utc::now())?;
        let outcome = self
            .fusion
            .search(&query.query_text, query.retrieval_mode, &route, query.top_k)
            .await?;
        Ok(assemble(
            outcome,
            query.retrieval_mode,
            query.data_source,
            query.top_k,
        ))
    }

    /// Wait for queued sync jobs to finish. Returns false on timeout.
    pub async fn wait_for_sync(&self, timeout: Duration) -> bool {
        self.dispatcher.wait_idle(timeout).await
    }

    pub async fn backfill(&self) -> usize {
        self.dispatcher.backfill().await
    }

    pub async fn retry_dead_letters(&self) -> usize {
        self.dispatcher.retry_dead_letters().await
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dispatcher.dead_letters()
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            total_records: self.store.len(),
            sync: self.dispatcher.stats(),
        }
    }

    /// Stop accepting sync jobs and drain the queue
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtractionConfig;
    use crate::extract::{EpisodeDraft, PersonalDrafts};
    use crate::record::RecordId;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSummarizer(AtomicUsize);

    #[async_trait]
    impl Summarizer for CountingSummarizer {
        async fn summarize(&self, message: &Message) -> Result<EpisodeDraft> {
            self.0.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            TranscriptSummarizer.summarize(message).await
        }
    }

    struct BrokenAnalyzer;

    #[async_trait]
    impl Analyzer for BrokenAnalyzer {
        async fn analyze(&self, _message: &Message) -> Result<PersonalDrafts> {
            Err(MemoryError::other("analyzer offline"))
        }
    }

    /// Store whose first `failures` message commits fail
    struct FlakyStore {
        inner: RocksRecordStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl RecordStore for FlakyStore {
        async fn put(&self, record: MemoryRecord) -> Result<RecordId> {
            self.inner.put(record).await
        }

        fn get(&self, kind: MemoryKind, id: &RecordId) -> Option<MemoryRecord> {
            self.inner.get(kind, id)
        }

        fn list(&self, kind: MemoryKind) -> Vec<MemoryRecord> {
            self.inner.list(kind)
        }

        async fn put_embedding(&self, id: &RecordId, vector: &[f32]) -> Result<()> {
            self.inner.put_embedding(id, vector).await
        }

        fn embedding(&self, id: &RecordId) -> Option<Vec<f32>> {
            self.inner.embedding(id)
        }

        async fn commit_message(&self, message_id: &str, records: &[MemoryRecord]) -> Result<()> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(MemoryError::other("disk full"));
            }
            self.inner.commit_message(message_id, records).await
        }

        fn message_records(&self, message_id: &str) -> Option<Vec<MemoryRecord>> {
            self.inner.message_records(message_id)
        }

        fn len(&self) -> usize {
            self.inner.len()
        }
    }

    fn service(dir: &tempfile::TempDir, config: MemoryConfig) -> MemoryService {
        let store = Arc::new(RocksRecordStore::open(dir.path()).unwrap());
        MemoryService::builder(store)
            .config(config)
            .embedder(Arc::new(HashingEmbedder::new(64)))
            .build()
    }

    fn message(id: &str) -> Message {
        Message::new(id, "user_001", "我昨天去北京出差").with_group("G1")
    }

    #[tokio::test]
    async fn test_memorize_commits_before_returning() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir, MemoryConfig::default());

        let outcome = service.memorize(message("m1")).await.unwrap();
        assert_eq!(outcome.saved.len(), 1);
        assert!(!outcome.replayed);
        assert_eq!(service.stats().total_records, 1);
        assert_eq!(
            service.store.get(MemoryKind::Episode, &outcome.saved[0].id),
            Some(outcome.saved[0].clone())
        );
    }

    #[tokio::test]
    async fn test_duplicate_message_replays() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir, MemoryConfig::default());

        let first = service.memorize(message("m1")).await.unwrap();
        let second = service.memorize(message("m1")).await.unwrap();

        assert!(second.replayed);
        assert_eq!(first.saved, second.saved);
        assert_eq!(service.stats().total_records, 1);
    }

    #[tokio::test]
    async fn test_duplicate_message_rejected_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryConfig {
            duplicate_policy: DuplicatePolicy::Reject,
            ..MemoryConfig::default()
        };
        let service = service(&dir, config);

        service.memorize(message("m1")).await.unwrap();
        let err = service.memorize(message("m1")).await.unwrap_err();
        assert!(matches!(err, MemoryError::DuplicateMessage(id) if id == "m1"));
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_extract_once() {
        let dir = tempfile::tempdir().unwrap();
        let summarizer = Arc::new(CountingSummarizer(AtomicUsize::new(0)));
        let store = Arc::new(RocksRecordStore::open(dir.path()).unwrap());
        let service = Arc::new(
            MemoryService::builder(store)
                .embedder(Arc::new(HashingEmbedder::new(64)))
                .summarizer(summarizer.clone())
                .build(),
        );

        let calls: Vec<_> = (0..4)
            .map(|_| {
                let service = Arc::clone(&service);
                tokio::spawn(async move { service.memorize(message("m1")).await })
            })
            .collect();
        for call in calls {
            call.await.unwrap().unwrap();
        }

        assert_eq!(summarizer.0.load(Ordering::SeqCst), 1);
        assert_eq!(service.stats().total_records, 1);
        assert!(service.message_locks.is_empty());
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_nothing_and_retry_saves_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore {
            inner: RocksRecordStore::open(dir.path()).unwrap(),
            failures: AtomicUsize::new(1),
        });
        let service = MemoryService::builder(store.clone())
            .config(MemoryConfig {
                extraction: ExtractionConfig {
                    personal_memory: true,
                    ..ExtractionConfig::default()
                },
                ..MemoryConfig::default()
            })
            .embedder(Arc::new(HashingEmbedder::new(64)))
            .build();

        let err = service.memorize(message("m1")).await.unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert!(store.is_empty());
        assert!(store.message_records("m1").is_none());
        assert_eq!(service.stats().sync.enqueued, 0);

        let outcome = service.memorize(message("m1")).await.unwrap();
        assert!(!outcome.replayed);
        assert_eq!(store.list(MemoryKind::Episode).len(), 1);
        assert_eq!(store.len(), outcome.saved.len());
        assert_eq!(store.message_records("m1"), Some(outcome.saved));
    }

    #[tokio::test]
    async fn test_partial_extraction_still_saves_episode() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RocksRecordStore::open(dir.path()).unwrap());
        let service = MemoryService::builder(store)
            .config(MemoryConfig {
                extraction: ExtractionConfig {
                    personal_memory: true,
                    ..ExtractionConfig::default()
                },
                ..MemoryConfig::default()
            })
            .embedder(Arc::new(HashingEmbedder::new(64)))
            .analyzer(Arc::new(BrokenAnalyzer))
            .build();

        let outcome = service.memorize(message("m1")).await.unwrap();
        assert_eq!(outcome.saved.len(), 1);
        assert!(outcome.notice.unwrap().contains("analyzer offline"));
    }

    #[tokio::test]
    async fn test_invalid_message_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir, MemoryConfig::default());

        let err = service
            .memorize(Message::new("m1", "user_001", "   "))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
        assert_eq!(service.stats().total_records, 0);
    }

    #[tokio::test]
    async fn test_empty_query_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir, MemoryConfig::default());

        let err = service.retrieve(RetrievalQuery::new("")).await.unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
    }

    fn profiling_service(dir: &tempfile::TempDir) -> MemoryService {
        service(
            dir,
            MemoryConfig {
                extraction: ExtractionConfig {
                    profile_memory: true,
                    importance_threshold: 2,
                    ..ExtractionConfig::default()
                },
                ..MemoryConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_profile_updates_supersede_previous() {
        let dir = tempfile::tempdir().unwrap();
        let service = profiling_service(&dir);

        let first = service.memorize(message("m1")).await.unwrap();
        assert_eq!(first.saved.len(), 2);
        assert_eq!(first.saved[1].kind(), MemoryKind::SemanticMemory);
        let profile = service.profile("user_001").unwrap();
        assert_eq!(profile.groups[0].evidence.message_count, 1);
        assert!(!profile.groups[0].is_important);

        let second = service.memorize(message("m2")).await.unwrap();
        let profile = service.profile("user_001").unwrap();
        assert_eq!(profile.groups[0].evidence.message_count, 2);
        assert!(profile.groups[0].is_important);
        assert_eq!(
            second.saved[1].metadata["supersedes"],
            first.saved[1].id.to_string()
        );

        // both versions are kept; nothing is rewritten in place
        assert_eq!(service.store.list(MemoryKind::SemanticMemory).len(), 2);
        assert!(service.profile("user_002").is_none());
    }

    #[tokio::test]
    async fn test_out_of_order_message_still_updates_latest_profile() {
        let dir = tempfile::tempdir().unwrap();
        let service = profiling_service(&dir);

        let now = Utc::now();
        service
            .memorize(message("m2").with_create_time(now))
            .await
            .unwrap();
        let late = service
            .memorize(message("m1").with_create_time(now - chrono::Duration::hours(1)))
            .await
            .unwrap();

        assert!(late.saved[1].created_at > now);
        assert_eq!(
            service.profile("user_001").unwrap().groups[0].evidence.message_count,
            2
        );
    }

    #[tokio::test]
    async fn test_concurrent_messages_from_one_sender_all_count() {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(profiling_service(&dir));

        let calls: Vec<_> = (0..8)
            .map(|i| {
                let service = Arc::clone(&service);
                tokio::spawn(async move { service.memorize(message(&format!("m{i}"))).await })
            })
            .collect();
        for call in calls {
            call.await.unwrap().unwrap();
        }

        let profile = service.profile("user_001").unwrap();
        assert_eq!(profile.groups[0].evidence.message_count, 8);
        assert!(service.profile_locks.is_empty());
    }
}
