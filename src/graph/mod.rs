//! Core graph data structures

mod accumulator;
mod entity;
mod relationship;

pub use accumulator::{AttributeCollision, GraphAccumulator, GraphSnapshot};
pub use entity::{AttributeValue, Attributes, Entity, Urn, UrnError};
pub use relationship::{Confidence, Relationship, TripleKey};
