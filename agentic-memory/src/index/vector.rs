//! In-process vector index with HNSW acceleration
//!
//! Points live in a per-collection map keyed by record id. Small collections
//! are searched by exact cosine scan. Larger ones are searched through an
//! instant-distance HNSW graph. Points upserted since the graph was built are
//! kept in a pending set and scanned exactly next to the graph search; the
//! graph is rebuilt only once enough of them pile up. When graph and pending
//! candidates cannot fill `k` after filtering, the search falls back to the
//! exact scan so filtered queries never come back short.

use async_trait::async_trait;
use dashmap::DashMap;
use instant_distance::{Builder, HnswMap, Point, Search};
use std::collections::{HashMap, HashSet};

use super::{sort_hits, IndexHit, IndexPayload, VectorIndex};
use crate::embedding::cosine_similarity;
use crate::error::{MemoryError, Result};
use crate::record::{MemoryKind, RecordId};
use crate::router::RecordFilter;

/// Collections smaller than this are always scanned exactly
const HNSW_MIN_POINTS: usize = 256;
const HNSW_SEED: u64 = 0x5eed;
/// Pending upserts that always trigger a rebuild
const REBUILD_MIN_PENDING: usize = 64;
/// Pending share of the collection, in percent, that triggers a rebuild
const REBUILD_PENDING_PERCENT: usize = 10;

/// HNSW point wrapper for semantic search
#[derive(Clone)]
struct VectorPoint {
    vector: Vec<f32>,
}

impl Point for VectorPoint {
    fn distance(&self, other: &Self) -> f32 {
        // Cosine distance = 1 - similarity (HNSW finds minimum)
        1.0 - cosine_similarity(&self.vector, &other.vector)
    }
}

struct VectorEntry {
    vector: Vec<f32>,
    payload: IndexPayload,
}

#[derive(Default)]
struct VectorCollection {
    points: HashMap<RecordId, VectorEntry>,
    graph: Option<HnswMap<VectorPoint, RecordId>>,
    /// Upserted since the graph was built; the graph may not hold their
    /// current vectors
    pending: HashSet<RecordId>,
}

impl VectorCollection {
    fn needs_rebuild(&self) -> bool {
        let len = self.points.len();
        if len < HNSW_MIN_POINTS {
            return false;
        }
        match self.graph {
            None => true,
            Some(_) => {
                let threshold = REBUILD_MIN_PENDING.max(len * REBUILD_PENDING_PERCENT / 100);
                self.pending.len() >= threshold
            }
        }
    }

    fn rebuild(&mut self) {
        let mut ids: Vec<RecordId> = self.points.keys().copied().collect();
        ids.sort();
        let points: Vec<VectorPoint> = ids
            .iter()
            .map(|id| VectorPoint {
                vector: self.points[id].vector.clone(),
            })
            .collect();

        self.graph = Some(
            Builder::default()
                .ef_construction(100)
                .seed(HNSW_SEED)
                .build(points, ids),
        );
        self.pending.clear();
        log::debug!("Rebuilt HNSW graph over {} points", self.points.len());
    }

    fn search(&self, query: &[f32], filter: &RecordFilter, k: usize) -> Vec<IndexHit> {
        if let Some(graph) = &self.graph {
            let query_point = VectorPoint {
                vector: query.to_vec(),
            };
            let mut search = Search::default();
            let mut hits: Vec<IndexHit> = graph
                .search(&query_point, &mut search)
                .map(|item| *item.value)
                .filter(|id| !self.pending.contains(id))
                .filter_map(|id| self.scored(&id, query, filter))
                .take(k)
                .collect();
            hits.extend(
                self.pending
                    .iter()
                    .filter_map(|id| self.scored(id, query, filter)),
            );
            if hits.len() >= k {
                sort_hits(&mut hits);
                hits.truncate(k);
                return hits;
            }
        }
        self.linear_search(query, filter, k)
    }

    /// Exact score of one point against its current vector, if it matches
    fn scored(&self, id: &RecordId, query: &[f32], filter: &RecordFilter) -> Option<IndexHit> {
        let entry = self.points.get(id)?;
        if !filter.matches(&entry.payload) {
            return None;
        }
        Some(IndexHit {
            record_id: *id,
            score: cosine_similarity(query, &entry.vector),
            payload: entry.payload.clone(),
        })
    }

    /// Exact cosine scan over matching points
    fn linear_search(&self, query: &[f32], filter: &RecordFilter, k: usize) -> Vec<IndexHit> {
        let mut hits: Vec<IndexHit> = self
            .points
            .iter()
            .filter(|(_, entry)| filter.matches(&entry.payload))
            .map(|(id, entry)| IndexHit {
                record_id: *id,
                score: cosine_similarity(query, &entry.vector),
                payload: entry.payload.clone(),
            })
            .collect();

        sort_hits(&mut hits);
        hits.truncate(k);
        hits
    }
}

/// In-process vector index over all collections
pub struct HnswVectorIndex {
    dimension: usize,
    collections: DashMap<MemoryKind, VectorCollection>,
}

impl HnswVectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            collections: DashMap::new(),
        }
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(MemoryError::other(format!(
                "Vector has {} dimensions, index expects {}",
                vector.len(),
                self.dimension
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for HnswVectorIndex {
    async fn upsert(
        &self,
        collection: MemoryKind,
        record_id: RecordId,
        vector: Vec<f32>,
        payload: IndexPayload,
    ) -> Result<()> {
        self.check_dimension(&vector)?;
        let mut entry = self.collections.entry(collection).or_default();
        entry.points.insert(record_id, VectorEntry { vector, payload });
        entry.pending.insert(record_id);
        Ok(())
    }

    async fn search(
        &self,
        collection: MemoryKind,
        vector: &[f32],
        filter: &RecordFilter,
        k: usize,
    ) -> Result<Vec<IndexHit>> {
        self.check_dimension(vector)?;

        // Rebuild under the shard's write lock, then search under a read lock
        if let Some(mut entry) = self.collections.get_mut(&collection) {
            if entry.needs_rebuild() {
                entry.rebuild();
            }
        }

        Ok(self
            .collections
            .get(&collection)
            .map(|entry| entry.value().search(vector, filter, k))
            .unwrap_or_default())
    }

    fn len(&self, collection: MemoryKind) -> usize {
        self.collections
            .get(&collection)
            .map_or(0, |entry| entry.value().points.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::record::MemoryRecord;

    fn event(user: &str, fact: &str) -> MemoryRecord {
        MemoryRecord::builder()
            .event_log(fact, None)
            .user_id(user)
            .build()
            .unwrap()
    }

    async fn index_all(index: &HnswVectorIndex, embedder: &HashingEmbedder, records: &[MemoryRecord]) {
        for record in records {
            index
                .upsert(
                    record.kind(),
                    record.id,
                    embedder.embed_text(&record.searchable_text()),
                    IndexPayload::from_record(record),
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_nearest_first() {
        let embedder = HashingEmbedder::new(64);
        let index = HnswVectorIndex::new(64);
        let tea = event("u1", "likes green tea");
        let code = event("u1", "writes rust code daily");
        index_all(&index, &embedder, &[tea.clone(), code]).await;

        let hits = index
            .search(
                MemoryKind::EventLog,
                &embedder.embed_text("green tea"),
                &RecordFilter::default(),
                2,
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record_id, tea.id);
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn test_upsert_overwrites() {
        let embedder = HashingEmbedder::new(16);
        let index = HnswVectorIndex::new(16);
        let record = event("u1", "likes tea");
        index_all(&index, &embedder, &[record.clone(), record.clone()]).await;
        assert_eq!(index.len(MemoryKind::EventLog), 1);
    }

    #[tokio::test]
    async fn test_dimension_is_checked() {
        let index = HnswVectorIndex::new(8);
        let record = event("u1", "likes tea");
        let err = index
            .upsert(
                record.kind(),
                record.id,
                vec![1.0; 4],
                IndexPayload::from_record(&record),
            )
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_filtered_search_over_hnsw_is_complete() {
        let embedder = HashingEmbedder::new(32);
        let index = HnswVectorIndex::new(32);
        let mut records: Vec<MemoryRecord> = (0..HNSW_MIN_POINTS + 20)
            .map(|i| event("crowd", &format!("note number {}", i)))
            .collect();
        let rare: Vec<MemoryRecord> = (0..3).map(|i| event("rare", &format!("rare fact {}", i))).collect();
        records.extend(rare.iter().cloned());
        index_all(&index, &embedder, &records).await;

        let filter = RecordFilter {
            user: crate::router::UserClause::Equals("rare".into()),
            ..RecordFilter::default()
        };
        let hits = index
            .search(MemoryKind::EventLog, &embedder.embed_text("note"), &filter, 5)
            .await
            .unwrap();

        assert_eq!(hits.len(), 3);
        assert!(hits
            .iter()
            .all(|hit| hit.payload.user_id.as_deref() == Some("rare")));
    }

    #[tokio::test]
    async fn test_repeated_search_is_stable() {
        let embedder = HashingEmbedder::new(32);
        let index = HnswVectorIndex::new(32);
        let records: Vec<MemoryRecord> = (0..HNSW_MIN_POINTS + 10)
            .map(|i| event("u1", &format!("meeting {} about roadmap", i % 7)))
            .collect();
        index_all(&index, &embedder, &records).await;

        let query = embedder.embed_text("roadmap meeting");
        let first = index
            .search(MemoryKind::EventLog, &query, &RecordFilter::default(), 10)
            .await
            .unwrap();
        let second = index
            .search(MemoryKind::EventLog, &query, &RecordFilter::default(), 10)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 10);
    }

    #[tokio::test]
    async fn test_graph_is_rebuilt_only_after_enough_upserts() {
        let embedder = HashingEmbedder::new(32);
        let index = HnswVectorIndex::new(32);
        let records: Vec<MemoryRecord> = (0..HNSW_MIN_POINTS + 10)
            .map(|i| event("u1", &format!("filler entry {}", i)))
            .collect();
        index_all(&index, &embedder, &records).await;

        let search = |text: &'static str| {
            let query = embedder.embed_text(text);
            let index = &index;
            async move {
                index
                    .search(MemoryKind::EventLog, &query, &RecordFilter::default(), 3)
                    .await
                    .unwrap()
            }
        };
        let pending = || index.collections.get(&MemoryKind::EventLog).unwrap().pending.len();

        search("filler").await;
        assert_eq!(pending(), 0);

        // A fresh point is found right away, without a rebuild
        let fresh = event("u1", "quarterly budget review");
        index_all(&index, &embedder, &[fresh.clone()]).await;
        let hits = search("quarterly budget review").await;
        assert_eq!(hits[0].record_id, fresh.id);
        assert_eq!(pending(), 1);

        // Overwriting a point already in the graph uses its new vector
        let moved = records[0].clone();
        let moved_vector = embedder.embed_text("orbital launch window");
        index
            .upsert(
                moved.kind(),
                moved.id,
                moved_vector,
                IndexPayload::from_record(&moved),
            )
            .await
            .unwrap();
        let hits = search("orbital launch window").await;
        assert_eq!(hits[0].record_id, moved.id);
        assert!((hits[0].score - 1.0).abs() < 1e-5);

        let more: Vec<MemoryRecord> = (0..REBUILD_MIN_PENDING)
            .map(|i| event("u1", &format!("late arrival {}", i)))
            .collect();
        index_all(&index, &embedder, &more).await;
        search("late arrival").await;
        assert_eq!(pending(), 0);
    }
}
