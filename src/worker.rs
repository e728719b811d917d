//! Extraction worker: drives one chunk from pending to completed/failed
//!
//! Retries are an explicit bounded state machine, not an ad-hoc loop:
//! each failure class has its own attempt counter and terminal bound, so
//! termination is provable. Classification drives policy:
//! - malformed output → corrective re-invocation (bounded)
//! - transient engine failure → exponential backoff retry (bounded)
//! - connection failure → release the handle as broken, retry the chunk
//!   on a fresh handle (bounded)
//!
//! Exactly one release happens per acquire on every exit path; a chunk
//! that exhausts its retries is reported with its full error trail,
//! never silently dropped.

use crate::cancel::CancelToken;
use crate::engine::{EngineFailure, EngineRequest, EXTRACTION_SCHEMA};
use crate::graph::Confidence;
use crate::planner::ChunkId;
use crate::pool::{ConnectionPool, PoolError, ReleaseOutcome};
use std::time::Duration;
use tracing::{debug, warn};

/// Bounds and backoff schedule for the retry state machine.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum transient failures (rate limit, timeout, pool exhaustion)
    pub max_transient: u32,
    /// Maximum corrective re-invocations after malformed output
    pub max_corrective: u32,
    /// Maximum handle replacements after connection failures
    pub max_reconnect: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_transient: 3,
            max_corrective: 2,
            max_reconnect: 2,
            backoff_base: Duration::from_millis(250),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the nth transient failure (1-based).
    pub fn backoff(&self, failure_count: u32) -> Duration {
        let exp = failure_count.saturating_sub(1).min(16);
        let delay = self.backoff_base.saturating_mul(1u32 << exp);
        delay.min(self.backoff_cap)
    }
}

/// A candidate entity as reported by the engine, before validation.
/// Fields are kept raw so the validator can report precise violations.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateEntity {
    pub urn: String,
    pub entity_type: String,
    pub name: String,
    pub attributes: Vec<(String, serde_json::Value)>,
}

/// A candidate relationship as reported by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRelationship {
    pub source: String,
    pub predicate: String,
    pub target: String,
    pub confidence: Confidence,
}

/// Parsed engine output for one chunk.
#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub chunk: ChunkId,
    pub entities: Vec<CandidateEntity>,
    pub relationships: Vec<CandidateRelationship>,
    /// Non-fatal parse observations (unknown confidence labels, etc.)
    pub warnings: Vec<String>,
}

/// Terminal outcome of processing one chunk.
#[derive(Debug)]
pub enum ChunkOutcome {
    Completed {
        result: ExtractionResult,
        /// Engine invocations it took, 1 = first-attempt success
        attempts: u32,
    },
    Failed {
        /// Accumulated error trail, one entry per failed attempt
        trail: Vec<String>,
    },
    /// The run was cancelled before this chunk finished
    Cancelled,
}

/// Extract a JSON object from engine response text.
///
/// Engines sometimes wrap JSON in markdown code fences or add prose.
/// Tries, in order: direct parse, fenced ```json block, first-`{` to
/// last-`}` span.
fn extract_json(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();

    if let Ok(v) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if v.is_object() {
            return Some(v);
        }
    }

    let fenced = if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        after.find("```").map(|end| &after[..end])
    } else if let Some(start) = trimmed.find("```\n") {
        let after = &trimmed[start + 4..];
        after.find("```").map(|end| &after[..end])
    } else {
        None
    };
    if let Some(block) = fenced {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(block.trim()) {
            if v.is_object() {
                return Some(v);
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(v) = serde_json::from_str::<serde_json::Value>(&trimmed[start..=end]) {
                if v.is_object() {
                    return Some(v);
                }
            }
        }
    }

    None
}

/// Parse a raw engine payload into candidate entities and relationships.
///
/// Lenient by design: candidates with missing or ungrammatical fields
/// are carried through so the validator can report them; only a payload
/// with no recognizable structure at all is a parse failure.
pub fn parse_payload(raw: &str, chunk: &ChunkId) -> Result<ExtractionResult, String> {
    let value = extract_json(raw).ok_or_else(|| {
        let preview: String = raw.chars().take(120).collect();
        format!("no JSON object found in engine payload: {preview}")
    })?;

    let entities_json = value.get("entities").and_then(|v| v.as_array());
    let relationships_json = value.get("relationships").and_then(|v| v.as_array());
    if entities_json.is_none() && relationships_json.is_none() {
        return Err("payload has neither an \"entities\" nor a \"relationships\" array".to_string());
    }

    let mut result = ExtractionResult {
        chunk: chunk.clone(),
        entities: Vec::new(),
        relationships: Vec::new(),
        warnings: Vec::new(),
    };

    for entity in entities_json.map(|v| v.as_slice()).unwrap_or(&[]) {
        // Accept "urn" (canonical) or "id" (engine fallback)
        let urn = entity
            .get("urn")
            .or_else(|| entity.get("id"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let entity_type = entity
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let name = entity
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let mut attributes = Vec::new();
        if let Some(map) = entity.get("attributes").and_then(|v| v.as_object()) {
            for (key, value) in map {
                attributes.push((key.clone(), value.clone()));
            }
        }
        result.entities.push(CandidateEntity {
            urn,
            entity_type,
            name,
            attributes,
        });
    }

    for rel in relationships_json.map(|v| v.as_slice()).unwrap_or(&[]) {
        let source = rel
            .get("source")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let target = rel
            .get("target")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let predicate = rel
            .get("predicate")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let confidence_raw = rel.get("confidence").and_then(|v| v.as_str());
        let confidence = match confidence_raw {
            Some(label) => Confidence::parse(label).unwrap_or_else(|| {
                result
                    .warnings
                    .push(format!("unknown confidence label '{label}', using low"));
                Confidence::Low
            }),
            None => {
                result
                    .warnings
                    .push(format!("relationship {source} -{predicate}-> {target} missing confidence, using low"));
                Confidence::Low
            }
        };
        result.relationships.push(CandidateRelationship {
            source,
            predicate,
            target,
            confidence,
        });
    }

    Ok(result)
}

fn corrective_instruction(detail: &str) -> String {
    format!(
        "The previous response could not be parsed: {detail}. \
         Respond with exactly one JSON object matching the requested schema, with no surrounding prose."
    )
}

/// Process one chunk to a terminal outcome.
///
/// Acquires a pooled handle (pool exhaustion counts against the
/// transient budget; it is backpressure, so the worker simply waits
/// again), invokes the engine, and walks the retry state machine until
/// success, cancellation, or exhaustion.
pub async fn process_chunk(
    chunk_id: &ChunkId,
    content: &str,
    pool: &ConnectionPool,
    policy: &RetryPolicy,
    acquire_timeout: Duration,
    cancel: &CancelToken,
) -> ChunkOutcome {
    let mut trail: Vec<String> = Vec::new();
    let mut transient_failures = 0u32;
    let mut corrective_retries = 0u32;
    let mut reconnects = 0u32;
    let mut attempts = 0u32;
    let mut corrective: Option<String> = None;

    loop {
        if cancel.is_cancelled() {
            return ChunkOutcome::Cancelled;
        }

        let mut handle = match pool.acquire(acquire_timeout).await {
            Ok(handle) => handle,
            Err(PoolError::Exhausted(timeout)) => {
                transient_failures += 1;
                trail.push(format!("no engine connection available within {timeout:?}"));
                if transient_failures > policy.max_transient {
                    return ChunkOutcome::Failed { trail };
                }
                continue;
            }
            Err(e) => {
                trail.push(format!("connection acquisition failed: {e}"));
                return ChunkOutcome::Failed { trail };
            }
        };

        // The handle stays checked out across transient and corrective
        // retries; only a connection failure sends us back to acquire.
        loop {
            if cancel.is_cancelled() {
                pool.release(handle, ReleaseOutcome::Healthy).await;
                return ChunkOutcome::Cancelled;
            }

            attempts += 1;
            let request = EngineRequest {
                chunk_id: chunk_id.to_string(),
                content: content.to_string(),
                schema: EXTRACTION_SCHEMA.to_string(),
                corrective: corrective.clone(),
            };

            let outcome = match handle.extract(&request).await {
                Ok(raw) => parse_payload(&raw, chunk_id).map_err(EngineFailure::Malformed),
                Err(failure) => Err(failure),
            };

            match outcome {
                Ok(result) => {
                    pool.release(handle, ReleaseOutcome::Healthy).await;
                    debug!(chunk = %chunk_id, attempts, "chunk extraction completed");
                    return ChunkOutcome::Completed { result, attempts };
                }
                Err(EngineFailure::Malformed(detail)) => {
                    corrective_retries += 1;
                    trail.push(format!("attempt {attempts}: malformed output: {detail}"));
                    if corrective_retries > policy.max_corrective {
                        pool.release(handle, ReleaseOutcome::Healthy).await;
                        warn!(chunk = %chunk_id, "corrective retries exhausted");
                        return ChunkOutcome::Failed { trail };
                    }
                    corrective = Some(corrective_instruction(&detail));
                }
                Err(EngineFailure::Transient(detail)) => {
                    transient_failures += 1;
                    trail.push(format!("attempt {attempts}: transient failure: {detail}"));
                    if transient_failures > policy.max_transient {
                        pool.release(handle, ReleaseOutcome::Healthy).await;
                        warn!(chunk = %chunk_id, "transient retries exhausted");
                        return ChunkOutcome::Failed { trail };
                    }
                    tokio::time::sleep(policy.backoff(transient_failures)).await;
                }
                Err(EngineFailure::Connection(detail)) => {
                    trail.push(format!("attempt {attempts}: connection failure: {detail}"));
                    pool.release(handle, ReleaseOutcome::Broken).await;
                    reconnects += 1;
                    if reconnects > policy.max_reconnect {
                        warn!(chunk = %chunk_id, "handle replacements exhausted");
                        return ChunkOutcome::Failed { trail };
                    }
                    break; // reacquire a fresh handle
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MockEngine, MockReply, SessionFactory};
    use std::sync::Arc;

    const T: Duration = Duration::from_millis(200);

    fn chunk(n: usize) -> ChunkId {
        ChunkId::new(n)
    }

    fn pool_for(engine: &MockEngine, size: usize) -> ConnectionPool {
        let factory: Arc<dyn SessionFactory> = Arc::new(engine.clone());
        ConnectionPool::new(factory, size)
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            backoff_base: Duration::from_millis(1),
            ..Default::default()
        }
    }

    // --- extract_json salvage ladder ---

    #[test]
    fn extract_json_direct() {
        let v = extract_json(r#"{"entities": []}"#).unwrap();
        assert!(v.get("entities").is_some());
    }

    #[test]
    fn extract_json_from_fenced_block() {
        let text = "Here you go:\n```json\n{\"entities\": []}\n```\nDone.";
        assert!(extract_json(text).is_some());
    }

    #[test]
    fn extract_json_from_brace_span() {
        let text = "The result is {\"entities\": []} as requested.";
        assert!(extract_json(text).is_some());
    }

    #[test]
    fn extract_json_rejects_prose() {
        assert!(extract_json("I could not process this document.").is_none());
    }

    // --- parse_payload ---

    #[test]
    fn parse_payload_reads_candidates() {
        let raw = r#"{
            "entities": [
                { "urn": "urn:service:billing", "type": "service", "name": "Billing",
                  "attributes": { "tier": "gold" } }
            ],
            "relationships": [
                { "source": "urn:service:billing", "predicate": "depends_on",
                  "target": "urn:service:ledger", "confidence": "high" }
            ]
        }"#;

        let result = parse_payload(raw, &chunk(0)).unwrap();
        assert_eq!(result.entities.len(), 1);
        assert_eq!(result.entities[0].urn, "urn:service:billing");
        assert_eq!(result.relationships.len(), 1);
        assert_eq!(result.relationships[0].confidence, Confidence::High);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn parse_payload_keeps_incomplete_candidates_for_the_validator() {
        let raw = r#"{"entities": [{ "urn": "NOT A URN", "type": "", "name": "x" }]}"#;
        let result = parse_payload(raw, &chunk(0)).unwrap();
        assert_eq!(result.entities.len(), 1);
        assert_eq!(result.entities[0].urn, "NOT A URN");
    }

    #[test]
    fn parse_payload_warns_on_unknown_confidence() {
        let raw = r#"{"relationships": [
            { "source": "urn:a:b:c", "predicate": "p", "target": "urn:a:b:d", "confidence": "certain" }
        ]}"#;
        let result = parse_payload(raw, &chunk(0)).unwrap();
        assert_eq!(result.relationships[0].confidence, Confidence::Low);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn parse_payload_rejects_unstructured_object() {
        let err = parse_payload(r#"{"answer": 42}"#, &chunk(0)).unwrap_err();
        assert!(err.contains("entities"));
    }

    // --- backoff schedule ---

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_millis(350),
            ..Default::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(4), Duration::from_millis(350));
    }

    // --- retry state machine ---

    #[tokio::test]
    async fn first_attempt_success_releases_healthy() {
        let engine = MockEngine::new();
        let pool = pool_for(&engine, 1);

        let outcome = process_chunk(
            &chunk(0),
            "content",
            &pool,
            &fast_policy(),
            T,
            &CancelToken::new(),
        )
        .await;

        assert!(matches!(outcome, ChunkOutcome::Completed { attempts: 1, .. }));
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn transient_failures_back_off_then_succeed() {
        let engine = MockEngine::new();
        engine.script(
            "chunk-0000",
            vec![
                MockReply::Fail(EngineFailure::Transient("rate limited".into())),
                MockReply::Fail(EngineFailure::Transient("rate limited".into())),
            ],
        );
        let pool = pool_for(&engine, 1);

        let outcome = process_chunk(
            &chunk(0),
            "content",
            &pool,
            &fast_policy(),
            T,
            &CancelToken::new(),
        )
        .await;

        assert!(matches!(outcome, ChunkOutcome::Completed { attempts: 3, .. }));
        assert_eq!(engine.invocations("chunk-0000"), 3);
    }

    #[tokio::test]
    async fn malformed_output_gets_corrective_retry() {
        let engine = MockEngine::new();
        engine.script(
            "chunk-0000",
            vec![
                MockReply::Payload("sorry, no JSON here".into()),
                MockReply::Payload("still prose".into()),
                MockReply::Payload(r#"{"entities":[],"relationships":[]}"#.into()),
            ],
        );
        let pool = pool_for(&engine, 1);

        let outcome = process_chunk(
            &chunk(0),
            "content",
            &pool,
            &fast_policy(),
            T,
            &CancelToken::new(),
        )
        .await;

        assert!(matches!(outcome, ChunkOutcome::Completed { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn corrective_exhaustion_fails_with_trail() {
        let engine = MockEngine::new();
        engine.set_default_payload("never valid json");
        let pool = pool_for(&engine, 1);

        let outcome = process_chunk(
            &chunk(0),
            "content",
            &pool,
            &fast_policy(),
            T,
            &CancelToken::new(),
        )
        .await;

        match outcome {
            ChunkOutcome::Failed { trail } => {
                // max_corrective = 2 allows 3 total attempts
                assert_eq!(trail.len(), 3);
                assert!(trail[0].contains("malformed"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn connection_failure_replaces_handle_and_retries() {
        let engine = MockEngine::new();
        engine.script(
            "chunk-0000",
            vec![MockReply::Fail(EngineFailure::Connection(
                "socket closed".into(),
            ))],
        );
        let pool = pool_for(&engine, 1);
        pool.warm_up().await.unwrap();
        let connects_before = engine.connects();

        let outcome = process_chunk(
            &chunk(0),
            "content",
            &pool,
            &fast_policy(),
            T,
            &CancelToken::new(),
        )
        .await;

        assert!(matches!(outcome, ChunkOutcome::Completed { attempts: 2, .. }));
        // Broken release connected a replacement session.
        assert!(engine.connects() > connects_before);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_between_attempts() {
        let engine = MockEngine::new();
        let pool = pool_for(&engine, 1);
        let cancel = CancelToken::new();
        cancel.cancel("operator stop");

        let outcome = process_chunk(&chunk(0), "content", &pool, &fast_policy(), T, &cancel).await;

        assert!(matches!(outcome, ChunkOutcome::Cancelled));
        assert_eq!(engine.total_invocations(), 0);
        assert_eq!(pool.available(), 1);
    }
}
