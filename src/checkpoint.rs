//! Durable run state for crash recovery
//!
//! A checkpoint is two JSON files tied together by a sequence number:
//! the status map (`checkpoint-NNNNNN.json`) and the graph snapshot it
//! refers to (`graph-NNNNNN.json`). Both are written to a temp file and
//! atomically renamed into place, graph first, so a crash mid-write can
//! never produce a record that points at a missing or truncated
//! snapshot. Loading scans for the highest sequence number; stray
//! `.tmp` files from an interrupted write are ignored.

use crate::graph::GraphSnapshot;
use crate::planner::{ChunkId, ChunkStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The newest checkpoint on disk cannot be loaded. Fatal: resuming
    /// from an older state would silently redo or lose work, so the
    /// operator must intervene.
    #[error("corrupt checkpoint: {0}")]
    Corrupt(String),
}

/// One durable record of run progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    /// Status of every chunk in the plan at checkpoint time
    pub statuses: BTreeMap<ChunkId, ChunkStatus>,
    /// File name of the graph snapshot this record pairs with
    pub graph_ref: String,
}

/// Sequence-numbered checkpoint files in one directory.
pub struct CheckpointStore {
    dir: PathBuf,
    next_seq: AtomicU64,
}

impl CheckpointStore {
    /// Open (creating if needed) a checkpoint directory. The next write
    /// continues the sequence after whatever is already on disk.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let next_seq = Self::scan_max_seq(&dir)?.map(|s| s + 1).unwrap_or(0);
        Ok(Self {
            dir,
            next_seq: AtomicU64::new(next_seq),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("checkpoint-{seq:06}.json"))
    }

    fn graph_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("graph-{seq:06}.json"))
    }

    /// Parse `checkpoint-NNNNNN.json` file names; anything else
    /// (including `.tmp` leftovers) yields None.
    fn seq_of(name: &str) -> Option<u64> {
        let rest = name.strip_prefix("checkpoint-")?;
        let digits = rest.strip_suffix(".json")?;
        digits.parse().ok()
    }

    fn scan_max_seq(dir: &Path) -> Result<Option<u64>, CheckpointError> {
        let mut max = None;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(seq) = Self::seq_of(&entry.file_name().to_string_lossy()) {
                max = Some(max.map_or(seq, |m: u64| m.max(seq)));
            }
        }
        Ok(max)
    }

    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Persist a checkpoint. Returns its sequence number.
    pub fn write(
        &self,
        statuses: &BTreeMap<ChunkId, ChunkStatus>,
        graph: &GraphSnapshot,
    ) -> Result<u64, CheckpointError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let graph_name = format!("graph-{seq:06}.json");

        // Snapshot lands before the record that references it.
        Self::write_atomic(&self.graph_path(seq), &serde_json::to_vec_pretty(graph)?)?;

        let record = CheckpointRecord {
            seq,
            timestamp: Utc::now(),
            statuses: statuses.clone(),
            graph_ref: graph_name,
        };
        Self::write_atomic(&self.record_path(seq), &serde_json::to_vec_pretty(&record)?)?;

        debug!(seq, "checkpoint written");
        self.prune(seq);
        Ok(seq)
    }

    /// Delete checkpoints older than the previous one. Best-effort; a
    /// failed delete only costs disk space.
    fn prune(&self, current: u64) {
        let keep_from = current.saturating_sub(1);
        for seq in (0..keep_from).rev() {
            let record = self.record_path(seq);
            if !record.exists() {
                break;
            }
            for path in [record, self.graph_path(seq)] {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "failed to prune old checkpoint");
                }
            }
        }
    }

    /// Load the newest checkpoint, if any.
    ///
    /// Only the highest sequence number is considered; if that record or
    /// its snapshot cannot be read, loading fails rather than silently
    /// falling back to older state.
    pub fn latest(&self) -> Result<Option<(CheckpointRecord, GraphSnapshot)>, CheckpointError> {
        let Some(seq) = Self::scan_max_seq(&self.dir)? else {
            return Ok(None);
        };

        let record_path = self.record_path(seq);
        let record: CheckpointRecord = serde_json::from_slice(&fs::read(&record_path)?)
            .map_err(|e| {
                CheckpointError::Corrupt(format!("{}: {e}", record_path.display()))
            })?;

        let graph_path = self.dir.join(&record.graph_ref);
        let bytes = fs::read(&graph_path).map_err(|e| {
            CheckpointError::Corrupt(format!(
                "graph snapshot {} missing or unreadable: {e}",
                graph_path.display()
            ))
        })?;
        let graph: GraphSnapshot = serde_json::from_slice(&bytes).map_err(|e| {
            CheckpointError::Corrupt(format!("{}: {e}", graph_path.display()))
        })?;

        info!(seq, "loaded checkpoint");
        Ok(Some((record, graph)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Entity, GraphAccumulator, Urn};

    fn statuses(pairs: &[(usize, ChunkStatus)]) -> BTreeMap<ChunkId, ChunkStatus> {
        pairs
            .iter()
            .map(|(n, s)| (ChunkId::new(*n), *s))
            .collect()
    }

    fn small_graph() -> GraphSnapshot {
        let mut acc = GraphAccumulator::new();
        acc.merge_entity(Entity::new(
            Urn::parse("urn:service:billing").unwrap(),
            "service",
            "Billing",
            ChunkId::new(0),
        ));
        acc.snapshot()
    }

    #[test]
    fn write_then_latest_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();

        let map = statuses(&[(0, ChunkStatus::Completed), (1, ChunkStatus::Pending)]);
        let seq = store.write(&map, &small_graph()).unwrap();

        let (record, graph) = store.latest().unwrap().unwrap();
        assert_eq!(record.seq, seq);
        assert_eq!(record.statuses, map);
        assert_eq!(graph, small_graph());
    }

    #[test]
    fn empty_directory_has_no_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        assert!(store.latest().unwrap().is_none());
    }

    #[test]
    fn sequence_continues_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let map = statuses(&[(0, ChunkStatus::Completed)]);

        let first = CheckpointStore::open(dir.path()).unwrap();
        let seq0 = first.write(&map, &small_graph()).unwrap();

        let second = CheckpointStore::open(dir.path()).unwrap();
        let seq1 = second.write(&map, &small_graph()).unwrap();
        assert_eq!(seq1, seq0 + 1);
    }

    // --- Scenario: crash mid-write leaves a .tmp file ---

    #[test]
    fn interrupted_write_leftovers_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();

        let map = statuses(&[(0, ChunkStatus::Completed)]);
        let seq = store.write(&map, &small_graph()).unwrap();

        // Simulate a crash partway through the next checkpoint.
        fs::write(
            dir.path().join(format!("checkpoint-{:06}.json.tmp", seq + 1)),
            b"{ truncat",
        )
        .unwrap();

        let (record, _) = store.latest().unwrap().unwrap();
        assert_eq!(record.seq, seq);
    }

    #[test]
    fn corrupt_newest_record_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        let map = statuses(&[(0, ChunkStatus::Completed)]);
        let seq = store.write(&map, &small_graph()).unwrap();

        fs::write(
            dir.path().join(format!("checkpoint-{:06}.json", seq + 1)),
            b"not json at all",
        )
        .unwrap();

        let err = store.latest().unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt(_)));
    }

    #[test]
    fn record_without_its_snapshot_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        let map = statuses(&[(0, ChunkStatus::Completed)]);
        let seq = store.write(&map, &small_graph()).unwrap();

        fs::remove_file(dir.path().join(format!("graph-{seq:06}.json"))).unwrap();

        let err = store.latest().unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt(_)));
    }

    #[test]
    fn prune_keeps_current_and_previous() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        let map = statuses(&[(0, ChunkStatus::Completed)]);

        for _ in 0..4 {
            store.write(&map, &small_graph()).unwrap();
        }

        assert!(!dir.path().join("checkpoint-000000.json").exists());
        assert!(!dir.path().join("checkpoint-000001.json").exists());
        assert!(dir.path().join("checkpoint-000002.json").exists());
        assert!(dir.path().join("checkpoint-000003.json").exists());
        assert!(dir.path().join("graph-000003.json").exists());
    }
}
