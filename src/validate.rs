//! Deterministic extraction validator
//!
//! Two passes, no engine calls in either:
//! - per-chunk (lenient): checks each candidate in isolation. URN
//!   grammar and required fields exclude the offending record; a
//!   relationship with an ungrammatical endpoint is dropped. Other
//!   candidates from the same chunk are unaffected.
//! - run-level (strict): after all chunks are merged, checks reference
//!   integrity and structural rates over the whole graph. Violations
//!   here flag, they do not remove.
//!
//! Same input, same violations, in the same order.

use crate::graph::{
    AttributeValue, Entity, GraphAccumulator, Relationship, Urn,
};
use crate::worker::ExtractionResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// The rule a violation was raised under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rule {
    UrnGrammar,
    RequiredFields,
    ReferenceIntegrity,
    OrphanRate,
    BrokenReferenceRate,
}

/// One validation finding, tied to the record (or run) it concerns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    /// URN, triple, or "run" for run-level findings
    pub subject: String,
    pub rule: Rule,
    pub detail: String,
}

/// Result of validating one chunk's extraction output.
#[derive(Debug)]
pub struct ChunkValidation {
    /// Candidates that passed, converted to finalized records
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
    pub violations: Vec<Violation>,
}

/// Run-level validation verdict.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub violations: Vec<Violation>,
    pub orphan_rate: f64,
    pub broken_reference_rate: f64,
}

impl ValidationReport {
    pub fn has_warnings(&self) -> bool {
        !self.violations.is_empty()
    }

    pub fn rule_passed(&self, rule: Rule) -> bool {
        !self.violations.iter().any(|v| v.rule == rule)
    }
}

/// Structural validator with configurable rate ceilings.
#[derive(Debug, Clone)]
pub struct Validator {
    /// Maximum tolerated fraction of entities with no relationships
    pub max_orphan_rate: f64,
    /// Maximum tolerated fraction of relationships with a missing endpoint
    pub max_broken_ref_rate: f64,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            max_orphan_rate: 0.5,
            max_broken_ref_rate: 0.1,
        }
    }
}

impl Validator {
    pub fn new(max_orphan_rate: f64, max_broken_ref_rate: f64) -> Self {
        Self {
            max_orphan_rate,
            max_broken_ref_rate,
        }
    }

    /// Validate one chunk's candidates in isolation.
    ///
    /// A relationship may reference an entity this chunk never saw; that
    /// is fine here and judged only at run level.
    pub fn check_chunk(&self, result: &ExtractionResult) -> ChunkValidation {
        let mut validation = ChunkValidation {
            entities: Vec::new(),
            relationships: Vec::new(),
            violations: Vec::new(),
        };

        for candidate in &result.entities {
            let urn = match Urn::parse(&candidate.urn) {
                Ok(urn) => urn,
                Err(e) => {
                    validation.violations.push(Violation {
                        subject: candidate.urn.clone(),
                        rule: Rule::UrnGrammar,
                        detail: e.to_string(),
                    });
                    continue;
                }
            };
            if candidate.entity_type.is_empty() || candidate.name.is_empty() {
                validation.violations.push(Violation {
                    subject: candidate.urn.clone(),
                    rule: Rule::RequiredFields,
                    detail: "entity requires a non-empty type and name".to_string(),
                });
                continue;
            }
            let mut entity = Entity::new(
                urn,
                candidate.entity_type.clone(),
                candidate.name.clone(),
                result.chunk.clone(),
            );
            for (key, value) in &candidate.attributes {
                entity
                    .attributes
                    .insert(key.clone(), AttributeValue::from_json(value));
            }
            validation.entities.push(entity);
        }

        for candidate in &result.relationships {
            let endpoints = (Urn::parse(&candidate.source), Urn::parse(&candidate.target));
            let (source, target) = match endpoints {
                (Ok(source), Ok(target)) => (source, target),
                (source_result, _) => {
                    let bad = if source_result.is_err() {
                        &candidate.source
                    } else {
                        &candidate.target
                    };
                    validation.violations.push(Violation {
                        subject: format!(
                            "{} -{}-> {}",
                            candidate.source, candidate.predicate, candidate.target
                        ),
                        rule: Rule::UrnGrammar,
                        detail: format!("relationship endpoint '{bad}' fails the URN grammar"),
                    });
                    continue;
                }
            };
            if candidate.predicate.is_empty() {
                validation.violations.push(Violation {
                    subject: format!("{source} -> {target}"),
                    rule: Rule::RequiredFields,
                    detail: "relationship requires a non-empty predicate".to_string(),
                });
                continue;
            }
            validation.relationships.push(Relationship::new(
                source,
                candidate.predicate.clone(),
                target,
                candidate.confidence,
            ));
        }

        debug!(
            chunk = %result.chunk,
            entities = validation.entities.len(),
            relationships = validation.relationships.len(),
            violations = validation.violations.len(),
            "chunk validated"
        );
        validation
    }

    /// Validate the merged graph after the last chunk has landed.
    ///
    /// Broken references and orphans are flagged but retained; only the
    /// rate ceilings decide whether the run counts as degraded.
    pub fn finalize(
        &self,
        graph: &GraphAccumulator,
        mut violations: Vec<Violation>,
    ) -> ValidationReport {
        let mut referenced: BTreeSet<&Urn> = BTreeSet::new();
        let mut broken = 0usize;
        for rel in graph.relationships() {
            referenced.insert(&rel.source);
            referenced.insert(&rel.target);
            for endpoint in [&rel.source, &rel.target] {
                if !graph.contains(endpoint) {
                    broken += 1;
                    violations.push(Violation {
                        subject: format!("{} -{}-> {}", rel.source, rel.predicate, rel.target),
                        rule: Rule::ReferenceIntegrity,
                        detail: format!("references '{endpoint}' which has no entity record"),
                    });
                }
            }
        }

        let orphans = graph
            .entities()
            .filter(|e| !referenced.contains(&e.urn))
            .count();

        let entity_count = graph.entity_count();
        let relationship_count = graph.relationship_count();
        let orphan_rate = if entity_count == 0 {
            0.0
        } else {
            orphans as f64 / entity_count as f64
        };
        let broken_reference_rate = if relationship_count == 0 {
            0.0
        } else {
            broken as f64 / relationship_count as f64
        };

        if orphan_rate > self.max_orphan_rate {
            violations.push(Violation {
                subject: "run".to_string(),
                rule: Rule::OrphanRate,
                detail: format!(
                    "orphan rate {orphan_rate:.2} exceeds ceiling {:.2}",
                    self.max_orphan_rate
                ),
            });
        }
        if broken_reference_rate > self.max_broken_ref_rate {
            violations.push(Violation {
                subject: "run".to_string(),
                rule: Rule::BrokenReferenceRate,
                detail: format!(
                    "broken reference rate {broken_reference_rate:.2} exceeds ceiling {:.2}",
                    self.max_broken_ref_rate
                ),
            });
        }

        ValidationReport {
            violations,
            orphan_rate,
            broken_reference_rate,
        }
    }
}
