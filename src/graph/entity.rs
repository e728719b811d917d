//! Entity representation and the URN identifier grammar

use crate::planner::ChunkId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Why a candidate identifier failed the URN grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UrnError {
    #[error("empty identifier")]
    Empty,
    #[error("expected at least 3 segments, found {0}")]
    TooFewSegments(usize),
    #[error("segment {0} is empty")]
    EmptySegment(usize),
    #[error("segment '{0}' contains invalid characters")]
    InvalidSegment(String),
}

/// Canonical entity identifier.
///
/// Grammar: colon-separated segments, each lowercase alphanumeric/hyphen
/// and not starting with a hyphen, minimum three segments
/// (e.g. `urn:service:billing`). A `Urn` can only be constructed through
/// `parse`, so holding one implies the grammar check already passed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Urn(String);

impl Urn {
    /// Validate a raw identifier against the URN grammar.
    pub fn parse(raw: &str) -> Result<Self, UrnError> {
        if raw.is_empty() {
            return Err(UrnError::Empty);
        }
        let segments: Vec<&str> = raw.split(':').collect();
        if segments.len() < 3 {
            return Err(UrnError::TooFewSegments(segments.len()));
        }
        for (i, segment) in segments.iter().enumerate() {
            if segment.is_empty() {
                return Err(UrnError::EmptySegment(i));
            }
            let mut chars = segment.chars();
            let first = chars.next().unwrap_or(' ');
            if !(first.is_ascii_lowercase() || first.is_ascii_digit()) {
                return Err(UrnError::InvalidSegment(segment.to_string()));
            }
            if !segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            {
                return Err(UrnError::InvalidSegment(segment.to_string()));
            }
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Urn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Typed attribute values carried on entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl AttributeValue {
    /// Convert an engine-supplied JSON value into an attribute value.
    ///
    /// Scalars map directly; anything structured is kept as its JSON text
    /// so no engine output is silently discarded.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => Self::String(s.clone()),
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            other => Self::String(other.to_string()),
        }
    }
}

/// Attribute collection; keys are unique by construction.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// A finalized entity in the extracted graph.
///
/// Identity is the URN: two entities with the same URN from different
/// chunks are merge candidates for the accumulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Canonical identifier (already grammar-checked)
    pub urn: Urn,
    /// Type tag (e.g. "service", "person")
    pub entity_type: String,
    /// Human-readable name
    pub name: String,
    /// Domain attributes
    pub attributes: Attributes,
    /// Chunk that most recently contributed to this entity
    pub provenance: ChunkId,
}

impl Entity {
    pub fn new(
        urn: Urn,
        entity_type: impl Into<String>,
        name: impl Into<String>,
        provenance: ChunkId,
    ) -> Self {
        Self {
            urn,
            entity_type: entity_type.into(),
            name: name.into(),
            attributes: BTreeMap::new(),
            provenance,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}
