//! Run orchestrator: plans, dispatches, merges, checkpoints
//!
//! Owns the run lifecycle: plan the corpus into chunks, dispatch them to
//! a bounded worker set over a shared queue, and merge each validated
//! outcome into the graph. Merging is single-threaded by construction:
//! workers only send outcomes over a channel, and one merge loop owns
//! the accumulator, so dedup needs no locking.
//!
//! Progress is checkpointed at batch boundaries. A chunk in flight at
//! checkpoint time is persisted as pending, so a crash between
//! checkpoint and completion costs at most that chunk's work, never its
//! consistency.

use crate::cancel::CancelToken;
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::engine::SessionFactory;
use crate::graph::{GraphAccumulator, GraphSnapshot};
use crate::planner::{
    render_chunk, Chunk, ChunkId, ChunkPlanner, ChunkStatus, Corpus, PlannerError,
};
use crate::pool::{ConnectionPool, PoolError};
use crate::validate::{ValidationReport, Validator, Violation};
use crate::worker::{process_chunk, ChunkOutcome, RetryPolicy};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Tunables for one extraction run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Engine sessions in the pool
    pub pool_size: usize,
    /// Concurrent chunk workers (may exceed pool size; the pool is the
    /// real concurrency bound)
    pub worker_count: usize,
    /// Chunk size target in bytes
    pub chunk_size_target: u64,
    pub retry: RetryPolicy,
    /// Wall-clock bound per chunk attempt
    pub chunk_timeout: Duration,
    /// Dispatch attempts per chunk before it is marked failed
    pub max_chunk_attempts: u32,
    /// How long a worker waits for a pool handle
    pub acquire_timeout: Duration,
    /// Chunks merged between checkpoints
    pub checkpoint_batch: usize,
    pub max_orphan_rate: f64,
    pub max_broken_ref_rate: f64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            worker_count: 4,
            chunk_size_target: 16 * 1024,
            retry: RetryPolicy::default(),
            chunk_timeout: Duration::from_secs(120),
            max_chunk_attempts: 3,
            acquire_timeout: Duration::from_secs(30),
            checkpoint_batch: 1,
            max_orphan_rate: 0.5,
            max_broken_ref_rate: 0.1,
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("corpus error: {0}")]
    Corpus(#[from] PlannerError),
    #[error("pool warm-up failed: {0}")]
    WarmUp(#[source] PoolError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// A chunk that exhausted its retries, with its full error trail.
#[derive(Debug, Clone, Serialize)]
pub struct FailedChunk {
    pub chunk: ChunkId,
    pub trail: Vec<String>,
}

/// Counters for one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub chunks_total: usize,
    pub chunks_completed: usize,
    /// Chunks that needed more than one engine invocation
    pub chunks_retried: usize,
    pub chunks_failed: usize,
    pub entity_count: usize,
    pub relationship_count: usize,
    pub collision_count: usize,
    pub failed_chunks: Vec<FailedChunk>,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
}

/// Overall run verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitStatus {
    /// Every chunk completed and validation raised nothing
    Success,
    /// The run finished, but with failed chunks, validation warnings, or
    /// an early cancellation
    Degraded,
}

/// Everything a run produces.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub status: ExitStatus,
    pub summary: RunSummary,
    pub validation: ValidationReport,
    pub graph: GraphSnapshot,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        match self.status {
            ExitStatus::Success => 0,
            ExitStatus::Degraded => 2,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// What a worker sends back for each chunk it picked up.
enum WorkerReport {
    Finished(Chunk, ChunkOutcome),
    TimedOut(Chunk),
}

/// Drives extraction runs against one checkpoint store.
pub struct Orchestrator {
    config: RunConfig,
    factory: Arc<dyn SessionFactory>,
    checkpoints: CheckpointStore,
}

impl Orchestrator {
    pub fn new(
        config: RunConfig,
        factory: Arc<dyn SessionFactory>,
        checkpoints: CheckpointStore,
    ) -> Self {
        Self {
            config,
            factory,
            checkpoints,
        }
    }

    /// Plan the corpus without running anything.
    pub fn plan(&self, corpus: &dyn Corpus) -> Result<Vec<Chunk>, OrchestratorError> {
        Ok(ChunkPlanner::new(self.config.chunk_size_target).plan(corpus)?)
    }

    /// Run extraction from scratch.
    pub async fn run(
        &self,
        corpus: Arc<dyn Corpus>,
        cancel: CancelToken,
    ) -> Result<RunReport, OrchestratorError> {
        let chunks = self.plan(corpus.as_ref())?;
        info!(chunks = chunks.len(), "starting extraction run");
        self.execute(chunks, GraphAccumulator::new(), corpus, cancel)
            .await
    }

    /// Resume from the latest checkpoint.
    ///
    /// Completed chunks keep their merged output and are never sent back
    /// to the engine; everything else is re-dispatched from a clean
    /// pending state. `force` re-dispatches completed chunks too (the
    /// accumulated graph is kept; merging is idempotent).
    pub async fn resume(
        &self,
        corpus: Arc<dyn Corpus>,
        cancel: CancelToken,
        force: bool,
    ) -> Result<RunReport, OrchestratorError> {
        let Some((record, snapshot)) = self.checkpoints.latest()? else {
            info!("no checkpoint found; starting a fresh run");
            return self.run(corpus, cancel).await;
        };

        let mut chunks = self.plan(corpus.as_ref())?;
        for chunk in &mut chunks {
            chunk.status = match record.statuses.get(&chunk.id) {
                Some(ChunkStatus::Completed) if !force => ChunkStatus::Completed,
                _ => ChunkStatus::Pending,
            };
        }

        let resumable = chunks
            .iter()
            .filter(|c| c.status != ChunkStatus::Completed)
            .count();
        info!(
            seq = record.seq,
            total = chunks.len(),
            resumable,
            force,
            "resuming from checkpoint"
        );

        self.execute(chunks, GraphAccumulator::from_snapshot(snapshot), corpus, cancel)
            .await
    }

    async fn execute(
        &self,
        chunks: Vec<Chunk>,
        mut accumulator: GraphAccumulator,
        corpus: Arc<dyn Corpus>,
        cancel: CancelToken,
    ) -> Result<RunReport, OrchestratorError> {
        let pool = Arc::new(ConnectionPool::new(
            Arc::clone(&self.factory),
            self.config.pool_size,
        ));
        pool.warm_up().await.map_err(OrchestratorError::WarmUp)?;

        let statuses: Arc<DashMap<ChunkId, ChunkStatus>> = Arc::new(DashMap::new());
        for chunk in &chunks {
            statuses.insert(chunk.id.clone(), chunk.status);
        }

        let (work_tx, work_rx) = mpsc::unbounded_channel::<Chunk>();
        let work_rx = Arc::new(Mutex::new(work_rx));
        let (report_tx, mut report_rx) = mpsc::unbounded_channel::<WorkerReport>();

        let chunks_total = chunks.len();
        let mut outstanding = 0usize;
        let mut completed = 0usize;
        for chunk in chunks {
            if chunk.status == ChunkStatus::Completed {
                completed += 1;
                continue;
            }
            outstanding += 1;
            // Receiver is alive in this scope; unbounded send cannot fail.
            let _ = work_tx.send(chunk);
        }

        let mut workers = Vec::with_capacity(self.config.worker_count);
        for worker_id in 0..self.config.worker_count {
            workers.push(tokio::spawn(Self::worker_loop(
                worker_id,
                Arc::clone(&work_rx),
                report_tx.clone(),
                Arc::clone(&pool),
                Arc::clone(&corpus),
                Arc::clone(&statuses),
                self.config.clone(),
                cancel.clone(),
            )));
        }
        drop(report_tx);

        let validator = Validator::new(
            self.config.max_orphan_rate,
            self.config.max_broken_ref_rate,
        );
        let mut violations: Vec<Violation> = Vec::new();
        let mut failed_chunks: Vec<FailedChunk> = Vec::new();
        let mut retried = 0usize;
        let mut since_checkpoint = 0usize;

        while outstanding > 0 {
            let Some(report) = report_rx.recv().await else {
                break;
            };
            match report {
                WorkerReport::Finished(chunk, ChunkOutcome::Completed { result, attempts }) => {
                    for warning in &result.warnings {
                        debug!(chunk = %chunk.id, warning, "extraction warning");
                    }
                    let checked = validator.check_chunk(&result);
                    for entity in checked.entities {
                        accumulator.merge_entity(entity);
                    }
                    for relationship in checked.relationships {
                        accumulator.merge_relationship(relationship);
                    }
                    violations.extend(checked.violations);

                    statuses.insert(chunk.id.clone(), ChunkStatus::Completed);
                    completed += 1;
                    if attempts > 1 {
                        retried += 1;
                    }
                    outstanding -= 1;

                    since_checkpoint += 1;
                    if since_checkpoint >= self.config.checkpoint_batch {
                        self.persist(&statuses, &accumulator)?;
                        since_checkpoint = 0;
                    }
                }
                WorkerReport::Finished(chunk, ChunkOutcome::Failed { trail }) => {
                    warn!(chunk = %chunk.id, attempts = trail.len(), "chunk failed");
                    statuses.insert(chunk.id.clone(), ChunkStatus::Failed);
                    failed_chunks.push(FailedChunk {
                        chunk: chunk.id,
                        trail,
                    });
                    outstanding -= 1;
                }
                WorkerReport::Finished(chunk, ChunkOutcome::Cancelled) => {
                    // Left pending so a resume picks it up.
                    statuses.insert(chunk.id.clone(), ChunkStatus::Pending);
                    outstanding -= 1;
                }
                WorkerReport::TimedOut(chunk) => {
                    if chunk.attempts < self.config.max_chunk_attempts && !cancel.is_cancelled() {
                        warn!(chunk = %chunk.id, attempt = chunk.attempts, "chunk timed out; requeued");
                        statuses.insert(chunk.id.clone(), ChunkStatus::Pending);
                        let _ = work_tx.send(chunk);
                    } else {
                        warn!(chunk = %chunk.id, "chunk timed out terminally");
                        statuses.insert(chunk.id.clone(), ChunkStatus::Failed);
                        failed_chunks.push(FailedChunk {
                            trail: vec![format!(
                                "timed out after {} attempt(s) of {:?} each",
                                chunk.attempts, self.config.chunk_timeout
                            )],
                            chunk: chunk.id,
                        });
                        outstanding -= 1;
                    }
                }
            }
        }

        drop(work_tx);
        for worker in workers {
            let _ = worker.await;
        }
        pool.shutdown().await;

        self.persist(&statuses, &accumulator)?;

        let validation = validator.finalize(&accumulator, violations);
        let cancelled = cancel.is_cancelled();
        if cancelled {
            info!(
                reason = cancel.reason().as_deref().unwrap_or("unspecified"),
                "run stopped before completion"
            );
        }
        let summary = RunSummary {
            chunks_total,
            chunks_completed: completed,
            chunks_retried: retried,
            chunks_failed: failed_chunks.len(),
            entity_count: accumulator.entity_count(),
            relationship_count: accumulator.relationship_count(),
            collision_count: accumulator.collisions().len(),
            failed_chunks,
            cancelled,
            cancel_reason: cancel.reason(),
        };
        let status = if summary.chunks_failed == 0 && !validation.has_warnings() && !cancelled {
            ExitStatus::Success
        } else {
            ExitStatus::Degraded
        };
        info!(
            completed = summary.chunks_completed,
            failed = summary.chunks_failed,
            entities = summary.entity_count,
            relationships = summary.relationship_count,
            ?status,
            "run finished"
        );

        Ok(RunReport {
            status,
            summary,
            validation,
            graph: accumulator.snapshot(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn worker_loop(
        worker_id: usize,
        work_rx: Arc<Mutex<mpsc::UnboundedReceiver<Chunk>>>,
        report_tx: mpsc::UnboundedSender<WorkerReport>,
        pool: Arc<ConnectionPool>,
        corpus: Arc<dyn Corpus>,
        statuses: Arc<DashMap<ChunkId, ChunkStatus>>,
        config: RunConfig,
        cancel: CancelToken,
    ) {
        loop {
            // Lock held only for the recv; workers take turns claiming.
            let next = { work_rx.lock().await.recv().await };
            let Some(mut chunk) = next else {
                debug!(worker_id, "work queue closed");
                return;
            };

            chunk.attempts += 1;
            statuses.insert(chunk.id.clone(), ChunkStatus::InProgress);

            let content = match render_chunk(corpus.as_ref(), &chunk) {
                Ok(content) => content,
                Err(e) => {
                    let trail = vec![format!("chunk content unavailable: {e}")];
                    let report = WorkerReport::Finished(chunk, ChunkOutcome::Failed { trail });
                    if report_tx.send(report).is_err() {
                        return;
                    }
                    continue;
                }
            };

            let attempt = process_chunk(
                &chunk.id,
                &content,
                &pool,
                &config.retry,
                config.acquire_timeout,
                &cancel,
            );
            let report = match tokio::time::timeout(config.chunk_timeout, attempt).await {
                Ok(outcome) => WorkerReport::Finished(chunk, outcome),
                Err(_) => WorkerReport::TimedOut(chunk),
            };
            if report_tx.send(report).is_err() {
                return;
            }
        }
    }

    /// Write a checkpoint. In-flight chunks are persisted as pending so
    /// a resume retries them.
    fn persist(
        &self,
        statuses: &DashMap<ChunkId, ChunkStatus>,
        accumulator: &GraphAccumulator,
    ) -> Result<(), CheckpointError> {
        let map: BTreeMap<ChunkId, ChunkStatus> = statuses
            .iter()
            .map(|entry| {
                let status = match *entry.value() {
                    ChunkStatus::InProgress => ChunkStatus::Pending,
                    other => other,
                };
                (entry.key().clone(), status)
            })
            .collect();
        self.checkpoints.write(&map, &accumulator.snapshot())?;
        Ok(())
    }
}
