//! Agentic Memory
//!
//! Memory storage and hybrid retrieval for conversational agents.
//!
//! ## Features
//!
//! - **Typed memory extraction** - Every message becomes a group-scoped episode,
//!   plus personal semantic memories and event logs when enabled
//! - **Profile memory** - A per-user profile merged forward as messages arrive
//! - **Durable writes** - Records are committed to RocksDB before `memorize` returns
//! - **Asynchronous sync** - A bounded worker pool propagates records into the
//!   vector and lexical indexes with retries and a dead-letter table
//! - **Hybrid search** - HNSW vector search + BM25, fused with Reciprocal Rank Fusion
//! - **Scoped retrieval** - `all`, `personal` and `group` scopes over each collection
//!
//! ## Example
//!
//! ```ignore
//! use agentic_memory::{HashingEmbedder, MemoryConfig, MemoryService, Message, RetrievalQuery};
//!
//! let service = MemoryService::open(&db_path, MemoryConfig::default(),
//!     Arc::new(HashingEmbedder::new(256))).await?;
//!
//! service.memorize(Message::new("m1", "user_001", "我昨天去北京出差").with_group("G1")).await?;
//! service.wait_for_sync(Duration::from_secs(1)).await;
//!
//! let response = service.retrieve(RetrievalQuery::new("北京").group("G1")).await?;
//! ```

pub mod assembler;
pub mod config;
pub mod dispatcher;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod fusion;
pub mod index;
pub mod record;
pub mod router;
pub mod service;
pub mod storage;
pub mod temporal;

// Re-exports for convenience
pub use assembler::{RetrievalMetadata, RetrievalResponse, RetrievedMemory};
pub use config::{DuplicatePolicy, ExtractionConfig, MemoryConfig, RetrievalConfig, SyncConfig};
pub use dispatcher::{DeadLetter, SyncDispatcher, SyncJob, SyncStats};
pub use embedding::{EmbeddingProvider, HashingEmbedder, VectorEngine};
pub use error::{MemoryError, Result};
pub use extract::{
    ActivityProfiler, Analyzer, MemoryExtractor, ProfileExtractor, ProfileMemory,
    ProfileMemoryMerger, SentenceAnalyzer, Summarizer, TranscriptSummarizer,
};
pub use fusion::{reciprocal_rank_fusion, FusionDiagnostics, RankFusionEngine};
pub use index::{Bm25LexicalIndex, HnswVectorIndex, IndexHit, IndexPayload, LexicalIndex, VectorIndex};
pub use record::{MemoryKind, MemoryRecord, MemoryRecordBuilder, Message, RecordBody, RecordId};
pub use router::{DataSource, MemoryScope, RetrievalMode, RetrievalQuery, RetrievalRouter};
pub use service::{MemorizeOutcome, MemoryService, MemoryServiceBuilder, ServiceStats};
pub use storage::{RecordStore, RocksRecordStore};
pub use temporal::ValidityWindow;
