//! Command-line and environment configuration

use agentic_memory::embedding::{DEFAULT_CACHE_CAPACITY, DEFAULT_DIMENSION};
use agentic_memory::{DuplicatePolicy, ExtractionConfig, MemoryConfig, RetrievalConfig, SyncConfig};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(name = "agentic-memory-server")]
#[command(about = "Agentic memory store serving JSON-RPC over stdio")]
#[command(version)]
pub struct Args {
    /// Directory holding the RocksDB record store
    #[arg(long, env = "AGENTIC_MEMORY_DATA_DIR", default_value = ".agentic-memory")]
    pub data_dir: PathBuf,

    /// Sync worker tasks
    #[arg(long, env = "AGENTIC_MEMORY_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Sync queue capacity
    #[arg(long, env = "AGENTIC_MEMORY_QUEUE_CAPACITY", default_value_t = 1024)]
    pub queue_capacity: usize,

    /// Derive personal semantic memories and event logs
    #[arg(long, env = "AGENTIC_MEMORY_PERSONAL_MEMORY")]
    pub personal_memory: bool,

    /// Keep a merged profile per sender
    #[arg(long, env = "AGENTIC_MEMORY_PROFILE_MEMORY")]
    pub profile_memory: bool,

    /// Group activity at which a sender counts as important there
    #[arg(long, env = "AGENTIC_MEMORY_IMPORTANCE_THRESHOLD", default_value_t = 5)]
    pub importance_threshold: u32,

    /// Deadline for one retrieval, in milliseconds
    #[arg(long, env = "AGENTIC_MEMORY_REQUEST_TIMEOUT_MS", default_value_t = 5000)]
    pub request_timeout_ms: u64,

    /// Embeddings kept in memory between requests
    #[arg(long, env = "AGENTIC_MEMORY_EMBEDDING_CACHE", default_value_t = DEFAULT_CACHE_CAPACITY)]
    pub embedding_cache: usize,

    /// Dimension of the built-in hashing embedder
    #[arg(long, env = "AGENTIC_MEMORY_EMBEDDING_DIM", default_value_t = DEFAULT_DIMENSION)]
    pub embedding_dim: usize,

    /// Fail on a repeated message_id instead of replaying the first result
    #[arg(long, env = "AGENTIC_MEMORY_REJECT_DUPLICATES")]
    pub reject_duplicates: bool,
}

impl Args {
    pub fn memory_config(&self) -> MemoryConfig {
        MemoryConfig {
            extraction: ExtractionConfig {
                personal_memory: self.personal_memory,
                profile_memory: self.profile_memory,
                importance_threshold: self.importance_threshold,
            },
            sync: SyncConfig {
                workers: self.workers,
                queue_capacity: self.queue_capacity,
                ..SyncConfig::default()
            },
            retrieval: RetrievalConfig {
                request_timeout: Duration::from_millis(self.request_timeout_ms),
                embedding_cache_capacity: self.embedding_cache,
                ..RetrievalConfig::default()
            },
            duplicate_policy: if self.reject_duplicates {
                DuplicatePolicy::Reject
            } else {
                DuplicatePolicy::Replay
            },
        }
    }
}
