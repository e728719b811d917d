//! Shared fixtures for integration tests: corpus builders, engine
//! payload constructors, and a pre-wired orchestrator.

#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tessera::{
    CheckpointStore, Corpus, DirectoryCorpus, MockEngine, Orchestrator, RetryPolicy, RunConfig,
};

/// A temporary on-disk corpus built file by file.
pub struct TestCorpus {
    dir: tempfile::TempDir,
}

impl TestCorpus {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn file(self, name: &str, content: &str) -> Self {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, content).expect("write corpus file");
        self
    }

    pub fn corpus(&self) -> Arc<dyn Corpus> {
        Arc::new(DirectoryCorpus::new(self.dir.path()))
    }
}

/// JSON for one extracted entity.
pub fn entity_json(urn: &str, entity_type: &str, name: &str, attrs: &[(&str, &str)]) -> serde_json::Value {
    let attributes: serde_json::Map<String, serde_json::Value> = attrs
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::json!(v)))
        .collect();
    serde_json::json!({
        "urn": urn,
        "type": entity_type,
        "name": name,
        "attributes": attributes,
    })
}

/// JSON for one extracted relationship.
pub fn relationship_json(
    source: &str,
    predicate: &str,
    target: &str,
    confidence: &str,
) -> serde_json::Value {
    serde_json::json!({
        "source": source,
        "predicate": predicate,
        "target": target,
        "confidence": confidence,
    })
}

/// A complete engine payload string.
pub fn payload(entities: &[serde_json::Value], relationships: &[serde_json::Value]) -> String {
    serde_json::json!({
        "entities": entities,
        "relationships": relationships,
    })
    .to_string()
}

/// Run configuration tuned for fast tests: one source unit per chunk,
/// millisecond backoff.
pub fn test_config(pool_size: usize, worker_count: usize) -> RunConfig {
    RunConfig {
        pool_size,
        worker_count,
        chunk_size_target: 1,
        retry: RetryPolicy {
            backoff_base: Duration::from_millis(1),
            ..Default::default()
        },
        chunk_timeout: Duration::from_secs(10),
        acquire_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

pub fn orchestrator(
    engine: &MockEngine,
    state_dir: &Path,
    pool_size: usize,
    worker_count: usize,
) -> Orchestrator {
    Orchestrator::new(
        test_config(pool_size, worker_count),
        Arc::new(engine.clone()),
        CheckpointStore::open(state_dir).expect("checkpoint store"),
    )
}
