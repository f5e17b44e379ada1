//! Rank fusion engine
//!
//! Executes a routed query against the vector index, the lexical index, or
//! both, and fuses the two rankings with Reciprocal Rank Fusion:
//!
//! ```text
//! score(d) = Σ 1 / (k + rank_i(d))      ranks are 1-based
//! ```
//!
//! Every ordering uses score descending with record id ascending as the
//! tie-break, so identical inputs always produce identical output.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::config::RetrievalConfig;
use crate::embedding::VectorEngine;
use crate::error::{MemoryError, Result};
use crate::index::{sort_hits, IndexHit, LexicalIndex, VectorIndex};
use crate::record::RecordId;
use crate::router::{RetrievalMode, Route};

pub const EMBEDDING_BACKEND: &str = "embedding";
pub const BM25_BACKEND: &str = "bm25";

/// Per-request counters reported back to the caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FusionDiagnostics {
    pub embedding_candidates: usize,
    pub bm25_candidates: usize,
    pub final_count: usize,
    pub total_latency_ms: u64,
    /// One backend failed and the ranking came from the other
    pub degraded: bool,
    pub failed_backend: Option<String>,
}

/// Ranked hits plus how they were obtained
#[derive(Debug, Clone)]
pub struct FusionOutcome {
    pub hits: Vec<IndexHit>,
    pub diagnostics: FusionDiagnostics,
}

/// Fuse several best-first rankings into one
///
/// A record's fused score is the sum of `1 / (rrf_k + rank)` over every
/// ranking it appears in. The payload of its first appearance is kept.
pub fn reciprocal_rank_fusion(rankings: &[&[IndexHit]], rrf_k: f32, top_k: usize) -> Vec<IndexHit> {
    let mut fused: HashMap<RecordId, IndexHit> = HashMap::new();

    for ranking in rankings {
        for (position, hit) in ranking.iter().enumerate() {
            let contribution = 1.0 / (rrf_k + (position + 1) as f32);
            fused
                .entry(hit.record_id)
                .or_insert_with(|| IndexHit {
                    score: 0.0,
                    ..hit.clone()
                })
                .score += contribution;
        }
    }

    let mut hits: Vec<IndexHit> = fused.into_values().collect();
    sort_hits(&mut hits);
    hits.truncate(top_k);
    hits
}

/// Runs subsearches and fuses their results
pub struct RankFusionEngine {
    engine: Arc<VectorEngine>,
    vector: Arc<dyn VectorIndex>,
    lexical: Arc<dyn LexicalIndex>,
    config: RetrievalConfig,
}

impl RankFusionEngine {
    pub fn new(
        engine: Arc<VectorEngine>,
        vector: Arc<dyn VectorIndex>,
        lexical: Arc<dyn LexicalIndex>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            engine,
            vector,
            lexical,
            config,
        }
    }

    /// Rank up to `top_k` records for a routed query
    ///
    /// # Errors
    /// - `Timeout` when the subsearches outlive `request_timeout`; in-flight
    ///   subsearches are cancelled.
    /// - `RetrievalBackend` when a single-mode backend fails, or when both
    ///   backends fail in `rrf` mode.
    pub async fn search(
        &self,
        query_text: &str,
        mode: RetrievalMode,
        route: &Route,
        top_k: usize,
    ) -> Result<FusionOutcome> {
        let started = Instant::now();
        let timeout = self.config.request_timeout;

        let ranked = tokio::time::timeout(timeout, self.rank(query_text, mode, route, top_k))
            .await
            .map_err(|_| {
                log::warn!(
                    "{} retrieval over {} exceeded {:?}",
                    mode.as_str(),
                    route.collection,
                    timeout
                );
                MemoryError::Timeout(timeout.as_millis() as u64)
            })?;

        let (hits, mut diagnostics) = ranked?;
        diagnostics.final_count = hits.len();
        diagnostics.total_latency_ms = started.elapsed().as_millis() as u64;

        log::debug!(
            "{} retrieval over {}: {} hits in {} ms",
            mode.as_str(),
            route.collection,
            hits.len(),
            diagnostics.total_latency_ms
        );
        Ok(FusionOutcome { hits, diagnostics })
    }

    async fn rank(
        &self,
        query_text: &str,
        mode: RetrievalMode,
        route: &Route,
        top_k: usize,
    ) -> Result<(Vec<IndexHit>, FusionDiagnostics)> {
        let mut diagnostics = FusionDiagnostics::default();

        match mode {
            RetrievalMode::Embedding => {
                let mut hits = self.vector_search(query_text, route, top_k).await?;
                diagnostics.embedding_candidates = hits.len();
                sort_hits(&mut hits);
                hits.truncate(top_k);
                Ok((hits, diagnostics))
            }
            RetrievalMode::Bm25 => {
                let mut hits = self.lexical_search(query_text, route, top_k).await?;
                diagnostics.bm25_candidates = hits.len();
                sort_hits(&mut hits);
                hits.truncate(top_k);
                Ok((hits, diagnostics))
            }
            RetrievalMode::Rrf => {
                let pool = self.config.candidate_pool(top_k);

                // Both subsearches in flight at once
                let (vector, lexical) = tokio::join!(
                    self.vector_search(query_text, route, pool),
                    self.lexical_search(query_text, route, pool)
                );

                let rankings: Vec<Vec<IndexHit>> = match (vector, lexical) {
                    (Ok(vector), Ok(lexical)) => {
                        diagnostics.embedding_candidates = vector.len();
                        diagnostics.bm25_candidates = lexical.len();
                        vec![vector, lexical]
                    }
                    (Ok(vector), Err(e)) => {
                        log::warn!("BM25 backend failed, ranking from embeddings only: {}", e);
                        diagnostics.embedding_candidates = vector.len();
                        diagnostics.degraded = true;
                        diagnostics.failed_backend = Some(BM25_BACKEND.to_string());
                        vec![vector]
                    }
                    (Err(e), Ok(lexical)) => {
                        log::warn!("Embedding backend failed, ranking from BM25 only: {}", e);
                        diagnostics.bm25_candidates = lexical.len();
                        diagnostics.degraded = true;
                        diagnostics.failed_backend = Some(EMBEDDING_BACKEND.to_string());
                        vec![lexical]
                    }
                    (Err(vector_err), Err(lexical_err)) => {
                        return Err(MemoryError::backend(
                            format!("{}+{}", EMBEDDING_BACKEND, BM25_BACKEND),
                            format!("{}; {}", vector_err, lexical_err),
                        ));
                    }
                };

                let slices: Vec<&[IndexHit]> = rankings.iter().map(Vec::as_slice).collect();
                let hits = reciprocal_rank_fusion(&slices, self.config.rrf_k, top_k);
                Ok((hits, diagnostics))
            }
        }
    }

    async fn vector_search(&self, query_text: &str, route: &Route, k: usize) -> Result<Vec<IndexHit>> {
        let vector = self
            .engine
            .embed(query_text)
            .await
            .map_err(|e| as_backend(EMBEDDING_BACKEND, e))?;
        self.vector
            .search(route.collection, &vector, &route.filter, k)
            .await
            .map_err(|e| as_backend(EMBEDDING_BACKEND, e))
    }

    async fn lexical_search(&self, query_text: &str, route: &Route, k: usize) -> Result<Vec<IndexHit>> {
        self.lexical
            .search(route.collection, query_text, &route.filter, k)
            .await
            .map_err(|e| as_backend(BM25_BACKEND, e))
    }
}

fn as_backend(backend: &str, error: MemoryError) -> MemoryError {
    match error {
        MemoryError::RetrievalBackend { .. } => error,
        other => MemoryError::backend(backend, other.to_string()),
    }
}
