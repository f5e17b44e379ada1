//! Runtime configuration
//!
//! Every knob has a default; callers override individual fields.

use std::time::Duration;

use crate::embedding::DEFAULT_CACHE_CAPACITY;

pub const DEFAULT_MAX_TOP_K: usize = 1000;

/// What to do when a `message_id` is memorized a second time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Return the records saved the first time, without re-extracting
    #[default]
    Replay,
    /// Fail with `DuplicateMessage`
    Reject,
}

/// Memory extraction settings
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// Run the analyzer to derive semantic memories and event logs
    pub personal_memory: bool,
    /// Keep a merged profile per sender
    pub profile_memory: bool,
    /// Group activity (messages + references) at which a sender counts as
    /// important in that group
    pub importance_threshold: u32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            personal_memory: false,
            profile_memory: false,
            importance_threshold: 5,
        }
    }
}

/// Sync dispatcher settings
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Worker tasks draining the queue
    pub workers: usize,
    /// Queue capacity before producers block
    pub queue_capacity: usize,
    /// How long a producer waits on a full queue before dead-lettering
    pub enqueue_timeout: Duration,
    /// Attempts per upsert, including the first
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            enqueue_timeout: Duration::from_secs(2),
            max_attempts: 5,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl SyncConfig {
    /// Delay before retry number `attempt` (1-based): doubling, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }
}

/// Retrieval settings
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// RRF smoothing constant
    pub rrf_k: f32,
    /// Candidate pool is `max(top_k * multiplier, min_candidates)`
    pub candidate_multiplier: usize,
    pub min_candidates: usize,
    /// Deadline for all subsearches of one request
    pub request_timeout: Duration,
    pub max_top_k: usize,
    /// Embeddings kept in the query/record embedding cache
    pub embedding_cache_capacity: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            candidate_multiplier: 3,
            min_candidates: 20,
            request_timeout: Duration::from_secs(5),
            max_top_k: DEFAULT_MAX_TOP_K,
            embedding_cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl RetrievalConfig {
    /// Candidate pool size requested from each backend in RRF mode
    pub fn candidate_pool(&self, top_k: usize) -> usize {
        top_k
            .saturating_mul(self.candidate_multiplier)
            .max(self.min_candidates)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default)]
pub struct MemoryConfig {
    pub extraction: ExtractionConfig,
    pub sync: SyncConfig,
    pub retrieval: RetrievalConfig,
    pub duplicate_policy: DuplicatePolicy,
}
