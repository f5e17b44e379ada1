//! Result assembly
//!
//! Turns ranked index hits into the caller-facing response. Display fields
//! come from the payload each index entry carries, so no record store lookup
//! happens on the read path.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::fusion::{FusionDiagnostics, FusionOutcome};
use crate::index::IndexHit;
use crate::record::RecordId;
use crate::router::{DataSource, RetrievalMode};

/// One retrieved memory
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedMemory {
    pub score: f32,
    pub record_id: RecordId,
    pub user_id: Option<String>,
    pub group_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub subject: Option<String>,
    pub episode: Option<String>,
    pub summary: Option<String>,
    pub evidence: Option<String>,
    pub metadata: serde_json::Value,
}

impl From<IndexHit> for RetrievedMemory {
    fn from(hit: IndexHit) -> Self {
        let payload = hit.payload;
        Self {
            score: hit.score,
            record_id: hit.record_id,
            user_id: payload.user_id,
            group_id: payload.group_id,
            timestamp: payload.timestamp,
            subject: payload.subject,
            episode: payload.episode,
            summary: payload.summary,
            evidence: payload.evidence,
            metadata: payload.metadata,
        }
    }
}

/// How a response was produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetrievalMetadata {
    pub retrieval_mode: RetrievalMode,
    pub data_source: DataSource,
    pub embedding_candidates: usize,
    pub bm25_candidates: usize,
    pub final_count: usize,
    pub total_latency_ms: u64,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_backend: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResponse {
    pub memories: Vec<RetrievedMemory>,
    pub count: usize,
    pub metadata: RetrievalMetadata,
}

/// Build the response for a fused ranking, capped at `top_k`
pub fn assemble(
    outcome: FusionOutcome,
    mode: RetrievalMode,
    source: DataSource,
    top_k: usize,
) -> RetrievalResponse {
    let memories: Vec<RetrievedMemory> = outcome
        .hits
        .into_iter()
        .take(top_k)
        .map(RetrievedMemory::from)
        .collect();

    let FusionDiagnostics {
        embedding_candidates,
        bm25_candidates,
        total_latency_ms,
        degraded,
        failed_backend,
        ..
    } = outcome.diagnostics;

    RetrievalResponse {
        count: memories.len(),
        metadata: RetrievalMetadata {
            retrieval_mode: mode,
            data_source: source,
            embedding_candidates,
            bm25_candidates,
            final_count: memories.len(),
            total_latency_ms,
            degraded,
            failed_backend,
        },
        memories,
    }
}
