//! Deduplicating graph accumulator
//!
//! The single-writer running graph the orchestrator merges validated
//! extraction output into. Entities sharing a URN are merged with
//! last-write-wins attribute semantics; every overwritten value is
//! recorded as a collision for audit. Relationships deduplicate on
//! exact triple equality, keeping the maximum confidence.
//!
//! Merging is idempotent: merging an accumulator's own contents back
//! into it changes nothing.

use super::entity::{AttributeValue, Entity, Urn};
use super::relationship::{Relationship, TripleKey};
use crate::planner::ChunkId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Audit record for an attribute overwritten during entity merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeCollision {
    pub urn: Urn,
    pub key: String,
    pub previous: AttributeValue,
    pub replacement: AttributeValue,
    /// Chunk whose value won
    pub chunk: ChunkId,
}

/// Serializable view of the accumulated graph.
///
/// Entities and relationships are emitted in key order, so two
/// accumulators with the same contents produce identical snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
    pub collisions: Vec<AttributeCollision>,
}

/// The running deduplicated graph.
#[derive(Debug, Default)]
pub struct GraphAccumulator {
    entities: BTreeMap<Urn, Entity>,
    relationships: BTreeMap<TripleKey, Relationship>,
    collisions: Vec<AttributeCollision>,
}

impl GraphAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild an accumulator from a checkpoint snapshot.
    pub fn from_snapshot(snapshot: GraphSnapshot) -> Self {
        let mut acc = Self::new();
        for entity in snapshot.entities {
            acc.entities.insert(entity.urn.clone(), entity);
        }
        for rel in snapshot.relationships {
            acc.relationships.insert(rel.key(), rel);
        }
        acc.collisions = snapshot.collisions;
        acc
    }

    /// Merge an entity into the graph.
    ///
    /// Attribute maps are unioned; on key collision the incoming value
    /// wins and the collision is recorded. Merging an entity that is
    /// already present with identical attributes records nothing.
    pub fn merge_entity(&mut self, entity: Entity) {
        match self.entities.get_mut(&entity.urn) {
            None => {
                self.entities.insert(entity.urn.clone(), entity);
            }
            Some(existing) => {
                for (key, value) in entity.attributes {
                    match existing.attributes.get(&key) {
                        Some(previous) if *previous != value => {
                            self.collisions.push(AttributeCollision {
                                urn: entity.urn.clone(),
                                key: key.clone(),
                                previous: previous.clone(),
                                replacement: value.clone(),
                                chunk: entity.provenance.clone(),
                            });
                            existing.attributes.insert(key, value);
                        }
                        Some(_) => {}
                        None => {
                            existing.attributes.insert(key, value);
                        }
                    }
                }
                existing.entity_type = entity.entity_type;
                existing.name = entity.name;
                existing.provenance = entity.provenance;
            }
        }
    }

    /// Merge a relationship. Identical triples collapse to one record
    /// with the maximum of the colliding confidences.
    pub fn merge_relationship(&mut self, relationship: Relationship) {
        let key = relationship.key();
        match self.relationships.get_mut(&key) {
            None => {
                self.relationships.insert(key, relationship);
            }
            Some(existing) => {
                existing.confidence = existing.confidence.max(relationship.confidence);
            }
        }
    }

    pub fn contains(&self, urn: &Urn) -> bool {
        self.entities.contains_key(urn)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn relationships(&self) -> impl Iterator<Item = &Relationship> {
        self.relationships.values()
    }

    pub fn collisions(&self) -> &[AttributeCollision] {
        &self.collisions
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            entities: self.entities.values().cloned().collect(),
            relationships: self.relationships.values().cloned().collect(),
            collisions: self.collisions.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Confidence;

    fn urn(raw: &str) -> Urn {
        Urn::parse(raw).unwrap()
    }

    fn chunk(n: usize) -> ChunkId {
        ChunkId::new(n)
    }

    // --- Scenario: same URN from two chunks, differing attribute ---

    #[test]
    fn later_attribute_wins_and_collision_is_recorded() {
        let mut acc = GraphAccumulator::new();

        acc.merge_entity(
            Entity::new(urn("urn:service:billing"), "service", "Billing", chunk(0))
                .with_attribute("tier", AttributeValue::String("silver".into())),
        );
        acc.merge_entity(
            Entity::new(urn("urn:service:billing"), "service", "Billing", chunk(1))
                .with_attribute("tier", AttributeValue::String("gold".into())),
        );

        assert_eq!(acc.entity_count(), 1);
        let entity = acc.entities().next().unwrap();
        assert_eq!(
            entity.attributes.get("tier"),
            Some(&AttributeValue::String("gold".into()))
        );

        assert_eq!(acc.collisions().len(), 1);
        let collision = &acc.collisions()[0];
        assert_eq!(collision.key, "tier");
        assert_eq!(collision.previous, AttributeValue::String("silver".into()));
        assert_eq!(collision.replacement, AttributeValue::String("gold".into()));
        assert_eq!(collision.chunk, chunk(1));
    }

    #[test]
    fn identical_attribute_does_not_record_collision() {
        let mut acc = GraphAccumulator::new();
        for n in 0..2 {
            acc.merge_entity(
                Entity::new(urn("urn:service:billing"), "service", "Billing", chunk(n))
                    .with_attribute("tier", AttributeValue::String("gold".into())),
            );
        }
        assert!(acc.collisions().is_empty());
    }

    #[test]
    fn disjoint_attributes_are_unioned() {
        let mut acc = GraphAccumulator::new();
        acc.merge_entity(
            Entity::new(urn("urn:service:billing"), "service", "Billing", chunk(0))
                .with_attribute("tier", AttributeValue::String("gold".into())),
        );
        acc.merge_entity(
            Entity::new(urn("urn:service:billing"), "service", "Billing", chunk(1))
                .with_attribute("owner", AttributeValue::String("payments".into())),
        );

        let entity = acc.entities().next().unwrap();
        assert_eq!(entity.attributes.len(), 2);
        assert!(acc.collisions().is_empty());
    }

    #[test]
    fn duplicate_triples_keep_maximum_confidence() {
        let mut acc = GraphAccumulator::new();
        acc.merge_relationship(Relationship::new(
            urn("urn:service:billing"),
            "depends_on",
            urn("urn:service:ledger"),
            Confidence::Low,
        ));
        acc.merge_relationship(Relationship::new(
            urn("urn:service:billing"),
            "depends_on",
            urn("urn:service:ledger"),
            Confidence::High,
        ));
        acc.merge_relationship(Relationship::new(
            urn("urn:service:billing"),
            "depends_on",
            urn("urn:service:ledger"),
            Confidence::Medium,
        ));

        assert_eq!(acc.relationship_count(), 1);
        let rel = acc.relationships().next().unwrap();
        assert_eq!(rel.confidence, Confidence::High);
    }

    // --- Dedup idempotence: merging a graph into itself changes nothing ---

    #[test]
    fn merging_own_snapshot_is_idempotent() {
        let mut acc = GraphAccumulator::new();
        acc.merge_entity(
            Entity::new(urn("urn:service:billing"), "service", "Billing", chunk(0))
                .with_attribute("tier", AttributeValue::String("gold".into())),
        );
        acc.merge_entity(
            Entity::new(urn("urn:service:ledger"), "service", "Ledger", chunk(1)),
        );
        acc.merge_relationship(Relationship::new(
            urn("urn:service:billing"),
            "depends_on",
            urn("urn:service:ledger"),
            Confidence::Medium,
        ));

        let before = acc.snapshot();
        for entity in before.entities.clone() {
            acc.merge_entity(entity);
        }
        for rel in before.relationships.clone() {
            acc.merge_relationship(rel);
        }

        assert_eq!(acc.snapshot(), before);
    }

    #[test]
    fn snapshot_roundtrip_restores_graph() {
        let mut acc = GraphAccumulator::new();
        acc.merge_entity(Entity::new(
            urn("urn:service:billing"),
            "service",
            "Billing",
            chunk(0),
        ));
        acc.merge_relationship(Relationship::new(
            urn("urn:service:billing"),
            "depends_on",
            urn("urn:service:ledger"),
            Confidence::High,
        ));

        let snapshot = acc.snapshot();
        let restored = GraphAccumulator::from_snapshot(snapshot.clone());
        assert_eq!(restored.snapshot(), snapshot);
    }
}
