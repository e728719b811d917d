//! Reasoning-engine client: the only interface to the external service
//!
//! Defines the session trait and typed failure taxonomy for calling the
//! reasoning engine. Two implementations:
//! - `SubprocessFactory`: spawns an engine command per session and speaks
//!   JSON lines over stdin/stdout (production)
//! - `MockEngine`: scripted per-chunk outcomes (testing)
//!
//! The engine's internals are opaque and possibly unreliable. Responses
//! are modelled as a tagged result (payload | transient | malformed |
//! connection) rather than exceptions, so every caller handles all tags
//! explicitly.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

/// Description of the structured payload the engine is asked to return.
/// Sent with every request so the engine knows the expected shape.
pub const EXTRACTION_SCHEMA: &str = r#"{
  "entities": [
    { "urn": "urn:type:name", "type": "string", "name": "string", "attributes": { "key": "value" } }
  ],
  "relationships": [
    { "source": "urn:type:name", "predicate": "string", "target": "urn:type:name", "confidence": "high|medium|low" }
  ]
}"#;

/// A single extraction request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineRequest {
    /// Chunk being processed (for logging and scripted mocks)
    pub chunk_id: String,
    /// Rendered chunk content
    pub content: String,
    /// Expected output schema description
    pub schema: String,
    /// Corrective instruction added after a malformed response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corrective: Option<String>,
}

/// Typed failure from an engine call. Classification drives retry policy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineFailure {
    /// Rate limit or timeout; retried with exponential backoff
    #[error("transient engine failure: {0}")]
    Transient(String),
    /// Unparsable or schema-violating payload; retried with a corrective
    /// instruction
    #[error("malformed engine output: {0}")]
    Malformed(String),
    /// Session-level fault; the handle is replaced in the pool
    #[error("engine connection failure: {0}")]
    Connection(String),
}

/// An exclusive session with the reasoning engine.
///
/// One session backs one pooled connection; it is owned by exactly one
/// worker while checked out. Sessions are destroyed and replaced, never
/// repaired, after a connection-level failure.
#[async_trait]
pub trait EngineSession: Send {
    /// Invoke the engine. Success is the raw textual payload; the worker
    /// parses it downstream.
    async fn extract(&mut self, request: &EngineRequest) -> Result<String, EngineFailure>;
}

/// Creates engine sessions for the connection pool.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn EngineSession>, EngineFailure>;
}

// ---------------------------------------------------------------------------
// Subprocess transport
// ---------------------------------------------------------------------------

/// Wire envelope read back from the subprocess, one JSON object per line.
#[derive(Debug, Deserialize)]
struct WireResponse {
    status: String,
    #[serde(default)]
    payload: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

/// Spawns the engine command once per session.
///
/// Each session holds its own child process; requests are serialized as
/// single JSON lines on stdin and one JSON line is read back per request.
pub struct SubprocessFactory {
    command: String,
    args: Vec<String>,
}

impl SubprocessFactory {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

#[async_trait]
impl SessionFactory for SubprocessFactory {
    async fn connect(&self) -> Result<Box<dyn EngineSession>, EngineFailure> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EngineFailure::Connection(format!("failed to spawn '{}': {}", self.command, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineFailure::Connection("engine stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineFailure::Connection("engine stdout unavailable".to_string()))?;

        Ok(Box::new(SubprocessSession {
            _child: child,
            stdin,
            stdout: BufReader::new(stdout),
        }))
    }
}

struct SubprocessSession {
    // Held so the child is killed when the session is dropped.
    _child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

#[async_trait]
impl EngineSession for SubprocessSession {
    async fn extract(&mut self, request: &EngineRequest) -> Result<String, EngineFailure> {
        let mut line = serde_json::to_string(request)
            .map_err(|e| EngineFailure::Malformed(format!("request serialization: {e}")))?;
        line.push('\n');

        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| EngineFailure::Connection(format!("engine stdin write: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| EngineFailure::Connection(format!("engine stdin flush: {e}")))?;

        let mut response_line = String::new();
        let read = self
            .stdout
            .read_line(&mut response_line)
            .await
            .map_err(|e| EngineFailure::Connection(format!("engine stdout read: {e}")))?;
        if read == 0 {
            return Err(EngineFailure::Connection(
                "engine closed its stdout".to_string(),
            ));
        }

        let response: WireResponse = serde_json::from_str(response_line.trim())
            .map_err(|e| EngineFailure::Malformed(format!("response envelope: {e}")))?;

        match response.status.as_str() {
            "ok" => {
                let payload = response.payload.ok_or_else(|| {
                    EngineFailure::Malformed("ok response without payload".to_string())
                })?;
                match payload {
                    serde_json::Value::String(s) => Ok(s),
                    other => Ok(other.to_string()),
                }
            }
            "transient" => Err(EngineFailure::Transient(
                response.message.unwrap_or_else(|| "unspecified".to_string()),
            )),
            "malformed" => Err(EngineFailure::Malformed(
                response.message.unwrap_or_else(|| "unspecified".to_string()),
            )),
            other => Err(EngineFailure::Malformed(format!(
                "unknown response status '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Mock engine
// ---------------------------------------------------------------------------

/// A scripted reply the mock engine plays back for one invocation.
#[derive(Debug, Clone)]
pub enum MockReply {
    Payload(String),
    Fail(EngineFailure),
    /// Never resolves; models an engine call that stalls until the
    /// caller's timeout fires
    Hang,
}

#[derive(Default)]
struct MockState {
    scripts: Mutex<HashMap<String, VecDeque<MockReply>>>,
    invocations: Mutex<HashMap<String, u32>>,
    default_payload: Mutex<Option<String>>,
    connects: AtomicUsize,
}

/// Mock engine for tests; plays back preconfigured replies per chunk.
///
/// Implements `SessionFactory` directly; every `connect` is counted so
/// tests can verify broken-handle replacement. When a chunk has no
/// scripted replies left, the default payload (an empty graph unless
/// overridden) is returned.
#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<MockState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue replies for a chunk id; they are consumed in order.
    pub fn script(&self, chunk_id: impl Into<String>, replies: Vec<MockReply>) {
        self.state
            .scripts
            .lock()
            .expect("mock script state poisoned")
            .entry(chunk_id.into())
            .or_default()
            .extend(replies);
    }

    /// Payload returned when a chunk has no scripted reply.
    pub fn set_default_payload(&self, payload: impl Into<String>) {
        *self
            .state
            .default_payload
            .lock()
            .expect("mock default state poisoned") = Some(payload.into());
    }

    /// How many times the engine was invoked for a chunk.
    pub fn invocations(&self, chunk_id: &str) -> u32 {
        self.state
            .invocations
            .lock()
            .expect("mock invocation state poisoned")
            .get(chunk_id)
            .copied()
            .unwrap_or(0)
    }

    /// Total invocations across all chunks.
    pub fn total_invocations(&self) -> u32 {
        self.state
            .invocations
            .lock()
            .expect("mock invocation state poisoned")
            .values()
            .sum()
    }

    /// How many sessions have been created.
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionFactory for MockEngine {
    async fn connect(&self) -> Result<Box<dyn EngineSession>, EngineFailure> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockSession {
    state: Arc<MockState>,
}

#[async_trait]
impl EngineSession for MockSession {
    async fn extract(&mut self, request: &EngineRequest) -> Result<String, EngineFailure> {
        *self
            .state
            .invocations
            .lock()
            .expect("mock invocation state poisoned")
            .entry(request.chunk_id.clone())
            .or_insert(0) += 1;

        let scripted = self
            .state
            .scripts
            .lock()
            .expect("mock script state poisoned")
            .get_mut(&request.chunk_id)
            .and_then(|queue| queue.pop_front());

        match scripted {
            Some(MockReply::Payload(p)) => Ok(p),
            Some(MockReply::Fail(f)) => Err(f),
            Some(MockReply::Hang) => std::future::pending().await,
            None => Ok(self
                .state
                .default_payload
                .lock()
                .expect("mock default state poisoned")
                .clone()
                .unwrap_or_else(|| r#"{"entities":[],"relationships":[]}"#.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(chunk_id: &str) -> EngineRequest {
        EngineRequest {
            chunk_id: chunk_id.to_string(),
            content: "content".to_string(),
            schema: EXTRACTION_SCHEMA.to_string(),
            corrective: None,
        }
    }

    #[tokio::test]
    async fn mock_plays_scripted_replies_in_order() {
        let engine = MockEngine::new();
        engine.script(
            "chunk-0001",
            vec![
                MockReply::Fail(EngineFailure::Transient("rate limited".into())),
                MockReply::Payload(r#"{"entities":[]}"#.into()),
            ],
        );

        let mut session = engine.connect().await.unwrap();
        let first = session.extract(&request("chunk-0001")).await;
        assert!(matches!(first, Err(EngineFailure::Transient(_))));

        let second = session.extract(&request("chunk-0001")).await.unwrap();
        assert_eq!(second, r#"{"entities":[]}"#);
        assert_eq!(engine.invocations("chunk-0001"), 2);
    }

    #[tokio::test]
    async fn mock_falls_back_to_default_payload() {
        let engine = MockEngine::new();
        let mut session = engine.connect().await.unwrap();

        let raw = session.extract(&request("chunk-0042")).await.unwrap();
        assert_eq!(raw, r#"{"entities":[],"relationships":[]}"#);
    }

    #[tokio::test]
    async fn mock_counts_connects() {
        let engine = MockEngine::new();
        let _a = engine.connect().await.unwrap();
        let _b = engine.connect().await.unwrap();
        assert_eq!(engine.connects(), 2);
    }

    #[test]
    fn corrective_is_omitted_from_wire_format_when_absent() {
        let serialized = serde_json::to_string(&request("chunk-0001")).unwrap();
        assert!(!serialized.contains("corrective"));
    }
}
