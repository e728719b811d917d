//! Directed relationships between entities

use super::entity::Urn;
use serde::{Deserialize, Serialize};

/// Engine-reported confidence in a relationship.
///
/// Ordered so that merging duplicate triples can keep the maximum.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    /// Parse an engine-supplied confidence label, case-insensitively.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// A directed relationship between two entities.
///
/// Identity is the exact (source, predicate, target) triple; duplicates
/// collapse to one record with the maximum confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub source: Urn,
    pub predicate: String,
    pub target: Urn,
    pub confidence: Confidence,
}

impl Relationship {
    pub fn new(
        source: Urn,
        predicate: impl Into<String>,
        target: Urn,
        confidence: Confidence,
    ) -> Self {
        Self {
            source,
            predicate: predicate.into(),
            target,
            confidence,
        }
    }

    /// The triple that identifies this relationship.
    pub fn key(&self) -> TripleKey {
        TripleKey {
            source: self.source.clone(),
            predicate: self.predicate.clone(),
            target: self.target.clone(),
        }
    }
}

/// Deduplication key for relationships.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TripleKey {
    pub source: Urn,
    pub predicate: String,
    pub target: Urn,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urn(raw: &str) -> Urn {
        Urn::parse(raw).unwrap()
    }

    #[test]
    fn confidence_ordering_supports_max_merge() {
        assert!(Confidence::High > Confidence::Medium);
        assert!(Confidence::Medium > Confidence::Low);
        assert_eq!(
            Confidence::Low.max(Confidence::High),
            Confidence::High
        );
    }

    #[test]
    fn confidence_parses_case_insensitively() {
        assert_eq!(Confidence::parse("HIGH"), Some(Confidence::High));
        assert_eq!(Confidence::parse("medium"), Some(Confidence::Medium));
        assert_eq!(Confidence::parse("certain"), None);
    }

    #[test]
    fn identical_triples_share_a_key() {
        let a = Relationship::new(
            urn("urn:service:billing"),
            "depends_on",
            urn("urn:service:ledger"),
            Confidence::High,
        );
        let b = Relationship::new(
            urn("urn:service:billing"),
            "depends_on",
            urn("urn:service:ledger"),
            Confidence::Low,
        );
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn direction_distinguishes_triples() {
        let forward = Relationship::new(
            urn("urn:service:a-x:one"),
            "calls",
            urn("urn:service:a-x:two"),
            Confidence::Medium,
        );
        let reverse = Relationship::new(
            urn("urn:service:a-x:two"),
            "calls",
            urn("urn:service:a-x:one"),
            Confidence::Medium,
        );
        assert_ne!(forward.key(), reverse.key());
    }
}
