//! Relationship inference over the change log.
pub mod engine;
pub mod strategies;

pub use engine::{ProcessReport, RelationshipEngine, DEFAULT_CONSUMER};
pub use strategies::{InferenceStrategy, ProposedLink, SemanticSimilarity, SharedFile, TemporalProximity};

#[derive(Debug, Clone)]
pub struct RelationConfig {
    /// How far outside a task/session window a node still counts as co-occurring.
    pub temporal_window: chrono::Duration,
    pub similarity_threshold: f32,
    pub max_semantic_links: usize,
    /// Change-log entries read per query.
    pub batch_size: usize,
}

impl Default for RelationConfig {
    fn default() -> Self {
        Self {
            temporal_window: chrono::Duration::minutes(15),
            similarity_threshold: 0.85,
            max_semantic_links: 10,
            batch_size: 256,
        }
    }
}
