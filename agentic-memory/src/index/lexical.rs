//! BM25 lexical index
//!
//! Incremental inverted index, one per collection. Re-upserting a record id
//! first withdraws the previous document's postings, so repeated delivery of
//! the same record never inflates its term frequencies.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};

use super::{sort_hits, tokenize, IndexHit, IndexPayload, LexicalIndex};
use crate::error::Result;
use crate::record::{MemoryKind, RecordId};
use crate::router::RecordFilter;

/// BM25 k1 parameter
const K1: f32 = 1.2;
/// BM25 b parameter
const B: f32 = 0.75;

struct Document {
    term_freqs: HashMap<String, f32>,
    length: f32,
    payload: IndexPayload,
}

#[derive(Default)]
struct Bm25Collection {
    /// Inverted index: term -> ids of documents containing it
    inverted: HashMap<String, HashSet<RecordId>>,
    documents: HashMap<RecordId, Document>,
    total_length: f32,
}

impl Bm25Collection {
    fn upsert(&mut self, id: RecordId, text: &str, payload: IndexPayload) {
        self.remove(&id);

        let tokens = tokenize(text);
        let mut term_freqs: HashMap<String, f32> = HashMap::new();
        for token in tokens.iter() {
            *term_freqs.entry(token.clone()).or_insert(0.0) += 1.0;
        }
        for term in term_freqs.keys() {
            self.inverted.entry(term.clone()).or_default().insert(id);
        }

        let length = tokens.len() as f32;
        self.total_length += length;
        self.documents.insert(
            id,
            Document {
                term_freqs,
                length,
                payload,
            },
        );
    }

    fn remove(&mut self, id: &RecordId) {
        let Some(old) = self.documents.remove(id) else {
            return;
        };
        self.total_length -= old.length;
        for term in old.term_freqs.keys() {
            if let Some(postings) = self.inverted.get_mut(term) {
                postings.remove(id);
                if postings.is_empty() {
                    self.inverted.remove(term);
                }
            }
        }
    }

    fn avg_doc_length(&self) -> f32 {
        if self.documents.is_empty() {
            0.0
        } else {
            self.total_length / self.documents.len() as f32
        }
    }

    /// Calculate IDF
    fn idf(&self, doc_freq: usize) -> f32 {
        let n = self.documents.len() as f32;
        let df = doc_freq as f32;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    /// Calculate BM25 score for a term
    fn bm25_score(&self, tf: f32, doc_length: f32, idf: f32) -> f32 {
        let avg = self.avg_doc_length().max(f32::EPSILON);
        let numerator = tf * (K1 + 1.0);
        let denominator = tf + K1 * (1.0 - B + B * doc_length / avg);
        idf * numerator / denominator
    }

    fn search(&self, query: &str, filter: &RecordFilter, limit: usize) -> Vec<IndexHit> {
        let mut query_terms = tokenize(query);
        query_terms.sort();
        query_terms.dedup();

        let mut scores: HashMap<RecordId, f32> = HashMap::new();
        for term in &query_terms {
            let Some(postings) = self.inverted.get(term) else {
                continue;
            };
            let idf = self.idf(postings.len());
            for id in postings {
                let Some(doc) = self.documents.get(id) else {
                    continue;
                };
                if !filter.matches(&doc.payload) {
                    continue;
                }
                let tf = doc.term_freqs.get(term).copied().unwrap_or(0.0);
                *scores.entry(*id).or_insert(0.0) += self.bm25_score(tf, doc.length, idf);
            }
        }

        let mut hits: Vec<IndexHit> = scores
            .into_iter()
            .filter_map(|(id, score)| {
                self.documents.get(&id).map(|doc| IndexHit {
                    record_id: id,
                    score,
                    payload: doc.payload.clone(),
                })
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(limit);
        hits
    }
}

/// In-process BM25 index over all collections
#[derive(Default)]
pub struct Bm25LexicalIndex {
    collections: DashMap<MemoryKind, Bm25Collection>,
}

impl Bm25LexicalIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LexicalIndex for Bm25LexicalIndex {
    async fn upsert(
        &self,
        collection: MemoryKind,
        record_id: RecordId,
        text: &str,
        payload: IndexPayload,
    ) -> Result<()> {
        self.collections
            .entry(collection)
            .or_default()
            .upsert(record_id, text, payload);
        Ok(())
    }

    async fn search(
        &self,
        collection: MemoryKind,
        query: &str,
        filter: &RecordFilter,
        k: usize,
    ) -> Result<Vec<IndexHit>> {
        Ok(self
            .collections
            .get(&collection)
            .map(|entry| entry.value().search(query, filter, k))
            .unwrap_or_default())
    }

    fn len(&self, collection: MemoryKind) -> usize {
        self.collections
            .get(&collection)
            .map_or(0, |entry| entry.value().documents.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MemoryRecord;

    fn episode(group: &str, text: &str) -> MemoryRecord {
        MemoryRecord::builder()
            .episode(None, text)
            .group_id(Some(group.to_string()))
            .build()
            .unwrap()
    }

    async fn index_all(index: &Bm25LexicalIndex, records: &[MemoryRecord]) {
        for record in records {
            index
                .upsert(
                    record.kind(),
                    record.id,
                    &record.searchable_text(),
                    IndexPayload::from_record(record),
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_search_ranks_matching_documents() {
        let index = Bm25LexicalIndex::new();
        let beijing = episode("G1", "我昨天去北京出差，吃了烤鸭");
        let shanghai = episode("G1", "下周去上海开会");
        index_all(&index, &[beijing.clone(), shanghai]).await;

        let hits = index
            .search(MemoryKind::Episode, "北京", &RecordFilter::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record_id, beijing.id);
        assert!(hits[0].score > 0.0);
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let index = Bm25LexicalIndex::new();
        let record = episode("G1", "rust async runtime rust");
        index_all(&index, &[record.clone()]).await;
        let first = index
            .search(MemoryKind::Episode, "rust", &RecordFilter::default(), 10)
            .await
            .unwrap();

        index_all(&index, &[record.clone(), record.clone()]).await;
        let again = index
            .search(MemoryKind::Episode, "rust", &RecordFilter::default(), 10)
            .await
            .unwrap();

        assert_eq!(index.len(MemoryKind::Episode), 1);
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn test_filter_and_limit() {
        let index = Bm25LexicalIndex::new();
        let records: Vec<_> = (0..5)
            .map(|i| episode(if i % 2 == 0 { "G1" } else { "G2" }, "team standup notes"))
            .collect();
        index_all(&index, &records).await;

        let filter = RecordFilter {
            group_id: Some("G2".into()),
            ..RecordFilter::default()
        };
        let hits = index
            .search(MemoryKind::Episode, "standup", &filter, 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|hit| hit.payload.group_id.as_deref() == Some("G2")));

        let limited = index
            .search(MemoryKind::Episode, "standup", &RecordFilter::default(), 3)
            .await
            .unwrap();
        assert_eq!(limited.len(), 3);
    }

    #[tokio::test]
    async fn test_collections_are_separate() {
        let index = Bm25LexicalIndex::new();
        index_all(&index, &[episode("G1", "quarterly planning")]).await;

        let hits = index
            .search(MemoryKind::EventLog, "planning", &RecordFilter::default(), 10)
            .await
            .unwrap();
        assert!(hits.is_empty());
        assert_eq!(index.len(MemoryKind::EventLog), 0);
    }
}
