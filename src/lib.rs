//! Tessera: Corpus-to-Graph Extraction Orchestration
//!
//! Drives a reasoning engine over a document corpus and accumulates its
//! structured output into a deduplicated knowledge graph. The engine is
//! treated as opaque and unreliable; everything around it is
//! deterministic and resumable.
//!
//! # Core Concepts
//!
//! - **Chunks**: Bounded, locality-grouped slices of the corpus, planned
//!   deterministically
//! - **Pool**: A fixed set of engine sessions; the real concurrency bound
//! - **Accumulator**: Single-writer merged graph with last-write-wins
//!   attributes and audited collisions
//! - **Checkpoints**: Sequence-numbered run state, written atomically, so
//!   an interrupted run resumes without repeating completed work
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tessera::{
//!     CancelToken, CheckpointStore, Corpus, DirectoryCorpus, MockEngine, Orchestrator,
//!     RunConfig,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let corpus: Arc<dyn Corpus> = Arc::new(DirectoryCorpus::new("./docs"));
//! let checkpoints = CheckpointStore::open("./state")?;
//! let orchestrator = Orchestrator::new(RunConfig::default(), Arc::new(MockEngine::new()), checkpoints);
//! let report = orchestrator.run(corpus, CancelToken::new()).await?;
//! println!("{} entities", report.summary.entity_count);
//! # Ok(())
//! # }
//! ```

mod cancel;
mod checkpoint;
mod engine;
mod graph;
mod orchestrator;
mod planner;
mod pool;
mod validate;
mod worker;

pub use cancel::CancelToken;
pub use checkpoint::{CheckpointError, CheckpointRecord, CheckpointStore};
pub use engine::{
    EngineFailure, EngineRequest, EngineSession, MockEngine, MockReply, SessionFactory,
    SubprocessFactory, EXTRACTION_SCHEMA,
};
pub use graph::{
    AttributeCollision, AttributeValue, Attributes, Confidence, Entity, GraphAccumulator,
    GraphSnapshot, Relationship, TripleKey, Urn, UrnError,
};
pub use orchestrator::{
    ExitStatus, FailedChunk, Orchestrator, OrchestratorError, RunConfig, RunReport, RunSummary,
};
pub use planner::{
    render_chunk, Chunk, ChunkId, ChunkPlanner, ChunkStatus, Corpus, DirectoryCorpus,
    PlannerError, SourceUnit,
};
pub use pool::{ConnectionHandle, ConnectionPool, PoolError, ReleaseOutcome};
pub use validate::{ChunkValidation, Rule, ValidationReport, Validator, Violation};
pub use worker::{
    process_chunk, CandidateEntity, CandidateRelationship, ChunkOutcome, ExtractionResult,
    RetryPolicy,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
