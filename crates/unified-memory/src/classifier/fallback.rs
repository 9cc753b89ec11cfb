//! Boundary to the model-backed classifier consulted when rules are inconclusive.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::SourceTag;
use crate::memory_db::schema::NodeType;

/// What the fallback gets to see besides the text.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackContext {
    pub source: SourceTag,
    /// Best rule label, if any rule matched below the threshold.
    pub rule_guess: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackVerdict {
    pub label: String,
    pub confidence: f32,
}

/// A classifier consulted only when rules do not settle an event.
///
/// Implementations may be slow; the caller enforces its own deadline and
/// drops the future when it expires.
#[async_trait]
pub trait FallbackClassifier: Send + Sync {
    async fn classify_fallback(&self, text: &str, context: &FallbackContext) -> anyhow::Result<FallbackVerdict>;

    fn name(&self) -> &str {
        "fallback"
    }
}

/// Map a free-form label onto a node type.
pub fn label_to_node_type(label: &str) -> NodeType {
    let label = label.trim().to_lowercase();
    match label.as_str() {
        "decision" | "fix" | "feat" | "feature" | "refactor" | "perf" | "revert" | "merge" | "breaking_change"
        | "docs" | "style" | "chore" | "ci" | "commit" | "architecture" => NodeType::Decision,
        "task" | "todo" | "command" | "test" | "build" | "deploy" | "install" | "git" | "bug" => NodeType::Task,
        l if l.starts_with("file") => NodeType::File,
        _ => NodeType::Message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_mapping() {
        assert_eq!(label_to_node_type("Refactor"), NodeType::Decision);
        assert_eq!(label_to_node_type("todo"), NodeType::Task);
        assert_eq!(label_to_node_type("file_rename"), NodeType::File);
        assert_eq!(label_to_node_type("chitchat"), NodeType::Message);
    }
}
