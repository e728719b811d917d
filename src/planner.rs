//! Chunk planner: partitions the corpus into bounded work units
//!
//! Source units are grouped by locality (their parent path) before
//! packing, so related units land in the same chunk where feasible and
//! cross-chunk references are reduced. Planning is deterministic: the
//! same corpus always yields the same chunk ids, which is what lets a
//! resumed run line its plan up against a checkpoint's status map.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from corpus access and planning. An unreadable corpus is
/// fatal; the run aborts before any worker starts.
#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("corpus unreadable at '{path}': {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("source unit not found: {0}")]
    UnitNotFound(String),
    #[error("corpus contains no source units")]
    Empty,
}

/// A reference to one independently readable piece of the corpus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    /// Stable identifier (relative path for directory corpora)
    pub id: String,
    /// Grouping key; units sharing a locality are packed together
    pub locality: String,
    /// Size estimate in bytes
    pub size: u64,
}

/// Read access to the input corpus.
pub trait Corpus: Send + Sync {
    /// Enumerate source units. Metadata only; no content is read.
    fn units(&self) -> Result<Vec<SourceUnit>, PlannerError>;

    /// Read one unit's content.
    fn read_unit(&self, id: &str) -> Result<String, PlannerError>;
}

/// A corpus rooted at a directory; every regular file is a source unit.
pub struct DirectoryCorpus {
    root: PathBuf,
}

impl DirectoryCorpus {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn collect(&self, dir: &Path, units: &mut Vec<SourceUnit>) -> Result<(), PlannerError> {
        let entries = fs::read_dir(dir).map_err(|e| PlannerError::Unreadable {
            path: dir.display().to_string(),
            source: e,
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| PlannerError::Unreadable {
                path: dir.display().to_string(),
                source: e,
            })?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            if path.is_dir() {
                self.collect(&path, units)?;
            } else if path.is_file() {
                let size = entry
                    .metadata()
                    .map_err(|e| PlannerError::Unreadable {
                        path: path.display().to_string(),
                        source: e,
                    })?
                    .len();
                let id = path
                    .strip_prefix(&self.root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .to_string();
                let locality = Path::new(&id)
                    .parent()
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_default();
                units.push(SourceUnit { id, locality, size });
            }
        }
        Ok(())
    }
}

impl Corpus for DirectoryCorpus {
    fn units(&self) -> Result<Vec<SourceUnit>, PlannerError> {
        let mut units = Vec::new();
        self.collect(&self.root, &mut units)?;
        Ok(units)
    }

    fn read_unit(&self, id: &str) -> Result<String, PlannerError> {
        let path = self.root.join(id);
        fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PlannerError::UnitNotFound(id.to_string())
            } else {
                PlannerError::Unreadable {
                    path: path.display().to_string(),
                    source: e,
                }
            }
        })
    }
}

/// Identifier of a chunk within a plan.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    pub fn new(index: usize) -> Self {
        Self(format!("chunk-{index:04}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a chunk. Mutated only by the orchestrator; a chunk is
/// immutable once completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// A bounded, independently processable unit of work.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: ChunkId,
    /// Ordered source unit ids
    pub units: Vec<String>,
    pub size_estimate: u64,
    pub status: ChunkStatus,
    pub attempts: u32,
}

/// Packs source units into chunks bounded by a size target.
pub struct ChunkPlanner {
    target_size: u64,
}

impl ChunkPlanner {
    pub fn new(target_size: u64) -> Self {
        Self { target_size }
    }

    /// Produce the ordered chunk sequence for a corpus.
    ///
    /// Units are sorted by (locality, id) and packed greedily; a chunk
    /// is sealed before it would exceed the target, except that a
    /// single oversized unit still gets a chunk of its own.
    pub fn plan(&self, corpus: &dyn Corpus) -> Result<Vec<Chunk>, PlannerError> {
        let mut units = corpus.units()?;
        if units.is_empty() {
            return Err(PlannerError::Empty);
        }
        units.sort_by(|a, b| (&a.locality, &a.id).cmp(&(&b.locality, &b.id)));

        let mut chunks: Vec<Chunk> = Vec::new();
        let mut current: Vec<String> = Vec::new();
        let mut current_size = 0u64;

        for unit in units {
            if !current.is_empty() && current_size + unit.size > self.target_size {
                chunks.push(Self::seal(chunks.len(), &mut current, &mut current_size));
            }
            current_size += unit.size;
            current.push(unit.id);
        }
        if !current.is_empty() {
            chunks.push(Self::seal(chunks.len(), &mut current, &mut current_size));
        }
        Ok(chunks)
    }

    fn seal(index: usize, units: &mut Vec<String>, size: &mut u64) -> Chunk {
        let chunk = Chunk {
            id: ChunkId::new(index),
            units: std::mem::take(units),
            size_estimate: *size,
            status: ChunkStatus::Pending,
            attempts: 0,
        };
        *size = 0;
        chunk
    }
}

/// Concatenate a chunk's source units into the content sent to the
/// engine, with a provenance header per unit.
pub fn render_chunk(corpus: &dyn Corpus, chunk: &Chunk) -> Result<String, PlannerError> {
    let mut content = String::with_capacity(chunk.size_estimate as usize);
    for unit_id in &chunk.units {
        content.push_str(&format!("--- source: {unit_id} ---\n"));
        content.push_str(&corpus.read_unit(unit_id)?);
        content.push('\n');
    }
    Ok(content)
}
