//! Sync dispatcher
//!
//! Propagates committed records from the record store into the vector index
//! and the lexical index, off the `memorize` critical path. Jobs flow through
//! a bounded queue drained by a fixed pool of worker tasks.
//!
//! Delivery is at-least-once. Every upsert is keyed by record id, so a job
//! processed twice leaves the indexes exactly as processing it once would.
//!
//! Policies:
//! - **Backpressure**: a producer waits up to `enqueue_timeout` for queue space;
//!   past that the job is dead-lettered with a warning instead of blocking
//!   `memorize` indefinitely.
//! - **Retries**: each upsert is retried with doubling backoff up to
//!   `max_attempts`, independently of the other upsert.
//! - **Terminal failures**: go to the dead-letter table and are logged; other
//!   jobs keep flowing. `retry_dead_letters` re-enqueues them.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::embedding::VectorEngine;
use crate::error::Result;
use crate::index::{IndexPayload, LexicalIndex, VectorIndex};
use crate::record::{MemoryKind, RecordId};
use crate::storage::RecordStore;

/// One record to propagate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncJob {
    pub record_id: RecordId,
    pub kind: MemoryKind,
}

/// A job that exhausted its attempts or could not be queued
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub job: SyncJob,
    pub reason: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub enqueued: u64,
    pub indexed: u64,
    pub retries: u64,
    pub dead_lettered: u64,
    /// Jobs queued or in flight
    pub pending: usize,
}

struct Shared {
    store: Arc<dyn RecordStore>,
    engine: Arc<VectorEngine>,
    vector: Arc<dyn VectorIndex>,
    lexical: Arc<dyn LexicalIndex>,
    config: SyncConfig,
    dead_letters: DashMap<RecordId, DeadLetter>,
    pending: AtomicUsize,
    idle: Notify,
    enqueued: AtomicU64,
    indexed: AtomicU64,
    retries: AtomicU64,
    dead_lettered: AtomicU64,
}

impl Shared {
    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn dead_letter(&self, job: SyncJob, reason: String, attempts: u32) {
        log::error!(
            "Sync of {} record {} failed after {} attempt(s): {}",
            job.kind,
            job.record_id,
            attempts,
            reason
        );
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.dead_letters.insert(
            job.record_id,
            DeadLetter {
                job,
                reason,
                attempts,
                failed_at: Utc::now(),
            },
        );
    }

    async fn process(&self, job: SyncJob) {
        let Some(record) = self.store.get(job.kind, &job.record_id) else {
            self.dead_letter(job, "record not found in store".to_string(), 1);
            return;
        };

        let payload = IndexPayload::from_record(&record);
        let text = record.searchable_text();
        let (payload, text) = (&payload, text.as_str());
        let (store, engine, vector_index, lexical_index) =
            (&*self.store, &*self.engine, &*self.vector, &*self.lexical);
        let id = job.record_id;

        let vector_upsert = self.with_retry(job, "vector", || async move {
            let vector = match store.embedding(&id) {
                Some(vector) if vector.len() == engine.dimension() => vector,
                _ => {
                    let vector = engine.embed(text).await?;
                    store.put_embedding(&id, &vector).await?;
                    vector
                }
            };
            vector_index.upsert(job.kind, id, vector, payload.clone()).await
        });
        let lexical_upsert = self.with_retry(job, "lexical", || async move {
            lexical_index.upsert(job.kind, id, text, payload.clone()).await
        });

        let failures: Vec<(String, u32)> = match tokio::join!(vector_upsert, lexical_upsert) {
            (Ok(()), Ok(())) => Vec::new(),
            (vector, lexical) => [vector.err(), lexical.err()].into_iter().flatten().collect(),
        };

        if failures.is_empty() {
            self.indexed.fetch_add(1, Ordering::Relaxed);
            self.dead_letters.remove(&id);
            log::debug!("Indexed {} record {}", job.kind, id);
        } else {
            let attempts = failures.iter().map(|(_, n)| *n).max().unwrap_or(1);
            let reason = failures
                .into_iter()
                .map(|(reason, _)| reason)
                .collect::<Vec<_>>()
                .join("; ");
            self.dead_letter(job, reason, attempts);
        }
    }

    /// Run `op` until it succeeds or attempts run out
    async fn with_retry<F, Fut>(
        &self,
        job: SyncJob,
        stage: &str,
        mut op: F,
    ) -> std::result::Result<(), (String, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < max_attempts => {
                    let delay = self.config.backoff(attempt);
                    log::warn!(
                        "{} upsert of {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        stage,
                        job.record_id,
                        attempt,
                        max_attempts,
                        e,
                        delay
                    );
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err((format!("{} upsert: {}", stage, e), attempt)),
            }
        }
    }
}

/// Bounded queue plus worker pool feeding the secondary indexes
pub struct SyncDispatcher {
    sender: parking_lot::Mutex<Option<mpsc::Sender<SyncJob>>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl SyncDispatcher {
    /// Spawn the worker pool. Must be called within a Tokio runtime.
    pub fn start(
        store: Arc<dyn RecordStore>,
        engine: Arc<VectorEngine>,
        vector: Arc<dyn VectorIndex>,
        lexical: Arc<dyn LexicalIndex>,
        config: SyncConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let worker_count = config.workers.max(1);

        let shared = Arc::new(Shared {
            store,
            engine,
            vector,
            lexical,
            config,
            dead_letters: DashMap::new(),
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
            enqueued: AtomicU64::new(0),
            indexed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
        });

        let workers = (0..worker_count)
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    loop {
                        let job = receiver.lock().await.recv().await;
                        let Some(job) = job else {
                            break;
                        };
                        shared.process(job).await;
                        shared.finish_one();
                    }
                    log::debug!("Sync worker {} stopped", worker);
                })
            })
            .collect();

        log::info!(
            "SyncDispatcher started ({} workers, queue capacity {})",
            worker_count,
            shared.config.queue_capacity
        );

        Self {
            sender: parking_lot::Mutex::new(Some(sender)),
            workers: parking_lot::Mutex::new(workers),
            shared,
        }
    }

    /// Queue a record for propagation. Never fails the caller: a job that
    /// cannot be queued is dead-lettered. Returns whether it was queued.
    pub async fn enqueue(&self, job: SyncJob) -> bool {
        let sender = self.sender.lock().clone();
        let Some(sender) = sender else {
            self.shared
                .dead_letter(job, "dispatcher is shut down".to_string(), 0);
            return false;
        };

        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        match sender
            .send_timeout(job, self.shared.config.enqueue_timeout)
            .await
        {
            Ok(()) => {
                self.shared.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(SendTimeoutError::Timeout(job)) => {
                self.shared.finish_one();
                log::warn!(
                    "Sync queue full for {:?}; dead-lettering {}",
                    self.shared.config.enqueue_timeout,
                    job.record_id
                );
                self.shared.dead_letter(job, "queue full".to_string(), 0);
                false
            }
            Err(SendTimeoutError::Closed(job)) => {
                self.shared.finish_one();
                self.shared
                    .dead_letter(job, "dispatcher is shut down".to_string(), 0);
                false
            }
        }
    }

    /// Re-enqueue every record in the store
    ///
    /// Rebuilds in-memory indexes after a restart.
    pub async fn backfill(&self) -> usize {
        let mut queued = 0;
        for kind in MemoryKind::ALL {
            for record in self.shared.store.list(kind) {
                let job = SyncJob {
                    record_id: record.id,
                    kind,
                };
                if self.enqueue(job).await {
                    queued += 1;
                }
            }
        }
        log::info!("Backfill queued {} records", queued);
        queued
    }

    /// Move every dead letter back onto the queue
    pub async fn retry_dead_letters(&self) -> usize {
        let ids: Vec<RecordId> = self
            .shared
            .dead_letters
            .iter()
            .map(|entry| *entry.key())
            .collect();

        let mut queued = 0;
        for id in ids {
            if let Some((_, letter)) = self.shared.dead_letters.remove(&id) {
                if self.enqueue(letter.job).await {
                    queued += 1;
                }
            }
        }
        queued
    }

    /// Current dead letters, oldest first
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        let mut letters: Vec<DeadLetter> = self
            .shared
            .dead_letters
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        letters.sort_by_key(|letter| letter.failed_at);
        letters
    }

    /// Wait until no job is queued or in flight. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.pending.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.shared.pending.load(Ordering::SeqCst) == 0;
            }
        }
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            enqueued: self.shared.enqueued.load(Ordering::Relaxed),
            indexed: self.shared.indexed.load(Ordering::Relaxed),
            retries: self.shared.retries.load(Ordering::Relaxed),
            dead_lettered: self.shared.dead_lettered.load(Ordering::Relaxed),
            pending: self.shared.pending.load(Ordering::SeqCst),
        }
    }

    /// Close the queue and wait for workers to drain it
    pub async fn shutdown(&self) {
        self.sender.lock().take();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                log::warn!("Sync worker ended abnormally: {}", e);
            }
        }
        log::info!("SyncDispatcher stopped");
    }
}
