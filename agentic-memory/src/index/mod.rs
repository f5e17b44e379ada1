//! Secondary indexes
//!
//! Both indexes are keyed by [`RecordId`] and hold a denormalized copy of the
//! display fields, so retrieval never needs a second round trip to the record
//! store. Upserts are idempotent: the same id overwrites, never duplicates.

mod lexical;
mod tokenizer;
mod vector;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::Result;
use crate::record::{MemoryKind, MemoryRecord, RecordBody, RecordId};
use crate::router::RecordFilter;
use crate::temporal::ValidityWindow;

pub use lexical::Bm25LexicalIndex;
pub use tokenizer::tokenize;
pub use vector::HnswVectorIndex;

/// Display and filter fields carried by every index entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexPayload {
    pub kind: MemoryKind,
    pub user_id: Option<String>,
    pub group_id: Option<String>,
    /// Creation time of the record
    pub timestamp: DateTime<Utc>,
    pub subject: Option<String>,
    pub episode: Option<String>,
    pub summary: Option<String>,
    pub evidence: Option<String>,
    pub validity: ValidityWindow,
    pub metadata: serde_json::Value,
}

impl IndexPayload {
    pub fn from_record(record: &MemoryRecord) -> Self {
        let (subject, episode, summary, evidence) = match &record.body {
            RecordBody::Episode { subject, episode } => {
                (subject.clone(), Some(episode.clone()), None, None)
            }
            RecordBody::SemanticMemory {
                subject,
                summary,
                evidence,
                ..
            } => (subject.clone(), None, Some(summary.clone()), evidence.clone()),
            RecordBody::EventLog { fact, evidence } => {
                (None, None, Some(fact.clone()), evidence.clone())
            }
        };

        Self {
            kind: record.kind(),
            user_id: record.user_id.clone(),
            group_id: record.group_id.clone(),
            timestamp: record.created_at,
            subject,
            episode,
            summary,
            evidence,
            validity: record.validity(),
            metadata: record.metadata.clone(),
        }
    }
}

/// One ranked entry returned by an index
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub record_id: RecordId,
    pub score: f32,
    pub payload: IndexPayload,
}

/// Dense-vector similarity index
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(
        &self,
        collection: MemoryKind,
        record_id: RecordId,
        vector: Vec<f32>,
        payload: IndexPayload,
    ) -> Result<()>;

    /// Up to `k` matching entries, best first
    async fn search(
        &self,
        collection: MemoryKind,
        vector: &[f32],
        filter: &RecordFilter,
        k: usize,
    ) -> Result<Vec<IndexHit>>;

    /// Number of entries in a collection
    fn len(&self, collection: MemoryKind) -> usize;
}

/// Tokenized full-text index
#[async_trait]
pub trait LexicalIndex: Send + Sync {
    async fn upsert(
        &self,
        collection: MemoryKind,
        record_id: RecordId,
        text: &str,
        payload: IndexPayload,
    ) -> Result<()>;

    /// Up to `k` matching entries, best first
    async fn search(
        &self,
        collection: MemoryKind,
        query: &str,
        filter: &RecordFilter,
        k: usize,
    ) -> Result<Vec<IndexHit>>;

    /// Number of entries in a collection
    fn len(&self, collection: MemoryKind) -> usize;
}

/// Order by score descending, then record id ascending
pub fn rank_order(a_score: f32, a_id: &RecordId, b_score: f32, b_id: &RecordId) -> Ordering {
    b_score
        .partial_cmp(&a_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a_id.cmp(b_id))
}

/// Sort hits best first with the deterministic tie-break
pub fn sort_hits(hits: &mut [IndexHit]) {
    hits.sort_by(|a, b| rank_order(a.score, &a.record_id, b.score, &b.record_id));
}
