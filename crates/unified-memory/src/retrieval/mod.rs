//! Ranking and traversal over the memory graph.
pub mod graph_walk;
pub mod hybrid;
pub mod scoring;

pub use graph_walk::{Direction, Neighbor, NeighborQuery};
pub use hybrid::{SearchFilters, SearchHit, SearchRequest};
pub use scoring::{HybridWeights, ScoreBreakdown};
