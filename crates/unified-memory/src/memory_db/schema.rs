//! Persisted types for the memory system: nodes, edges, sessions, leases and the change log.
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Open JSON mapping carried by nodes.
pub type Metadata = serde_json::Map<String, Value>;

/// Kind of a node. The well-known kinds get variants, anything else is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeType {
    Decision,
    File,
    Task,
    Message,
    Session,
    Agent,
    Custom(String),
}

impl NodeType {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "decision" => NodeType::Decision,
            "file" => NodeType::File,
            "task" => NodeType::Task,
            "message" => NodeType::Message,
            "session" => NodeType::Session,
            "agent" => NodeType::Agent,
            other => NodeType::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            NodeType::Decision => "decision",
            NodeType::File => "file",
            NodeType::Task => "task",
            NodeType::Message => "message",
            NodeType::Session => "session",
            NodeType::Agent => "agent",
            NodeType::Custom(s) => s.as_str(),
        }
    }
}

impl From<String> for NodeType {
    fn from(s: String) -> Self {
        NodeType::parse(&s)
    }
}

impl From<NodeType> for String {
    fn from(t: NodeType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed unit of memory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    /// Empty means "assign one for me" on upsert.
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Set when `text` changed after the embedding was computed.
    #[serde(default)]
    pub embedding_stale: bool,
    #[serde(default = "default_version")]
    pub version: i64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> i64 {
    1
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: NodeType, text: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            node_type,
            text: text.into(),
            metadata: Metadata::new(),
            repo: None,
            author: None,
            embedding: None,
            embedding_stale: false,
            version: default_version(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_repo(mut self, repo: impl Into<String>) -> Self {
        self.repo = Some(repo.into());
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// String value of a metadata key, if present and a string.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// A directed, typed relationship between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edge {
    pub from_id: String,
    pub to_id: String,
    pub relation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Stale,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Active => "active",
            SessionState::Stale => "stale",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(SessionState::Active),
            "stale" => Some(SessionState::Stale),
            _ => None,
        }
    }
}

/// One running agent instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub instance_id: String,
    pub role: String,
    pub workspace_path: String,
    pub state: SessionState,
    /// Resource keys with an unexpired lease held by this instance.
    #[serde(default)]
    pub active_leases: Vec<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Session {
    /// Id of the graph node mirroring this session.
    pub fn node_id(instance_id: &str) -> String {
        format!("session:{}", instance_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseMode {
    Read,
    Write,
}

impl LeaseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseMode::Read => "read",
            LeaseMode::Write => "write",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "read" => Some(LeaseMode::Read),
            "write" => Some(LeaseMode::Write),
            _ => None,
        }
    }
}

/// A time-bounded claim on a named resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lease {
    pub resource_key: String,
    pub holder_instance_id: String,
    pub mode: LeaseMode,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    NodeUpserted,
    NodeDeleted,
    EdgeLinked,
    EdgeUnlinked,
    EmbeddingUpdated,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::NodeUpserted => "node_upserted",
            ChangeKind::NodeDeleted => "node_deleted",
            ChangeKind::EdgeLinked => "edge_linked",
            ChangeKind::EdgeUnlinked => "edge_unlinked",
            ChangeKind::EmbeddingUpdated => "embedding_updated",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "node_upserted" => Some(ChangeKind::NodeUpserted),
            "node_deleted" => Some(ChangeKind::NodeDeleted),
            "edge_linked" => Some(ChangeKind::EdgeLinked),
            "edge_unlinked" => Some(ChangeKind::EdgeUnlinked),
            "embedding_updated" => Some(ChangeKind::EmbeddingUpdated),
            _ => None,
        }
    }
}

/// One row of the append-only change log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEntry {
    pub seq: i64,
    pub kind: ChangeKind,
    pub node_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_nodes: i64,
    pub total_edges: i64,
    pub total_sessions: i64,
    pub total_leases: i64,
    pub stale_embeddings: i64,
    pub change_log_head: i64,
    pub database_size_bytes: i64,
}

/// Timestamps are stored as fixed-width RFC 3339 strings so that SQL string
/// comparison orders them chronologically.
pub(crate) fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn ts_from_sql(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_type_round_trips_custom_kinds() {
        assert_eq!(NodeType::parse("Decision"), NodeType::Decision);
        assert_eq!(NodeType::parse("incident"), NodeType::Custom("incident".into()));
        let json = serde_json::to_string(&NodeType::Task).unwrap();
        assert_eq!(json, "\"task\"");
    }

    #[test]
    fn test_node_deserializes_with_defaults() {
        let node: Node = serde_json::from_str(r#"{"id":"d1","type":"decision","text":"use sqlite"}"#).unwrap();
        assert_eq!(node.node_type, NodeType::Decision);
        assert!(node.metadata.is_empty());
        assert_eq!(node.version, 1);
        assert!(node.embedding.is_none());
    }

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let early = DateTime::parse_from_rfc3339("2024-01-01T00:00:00.5Z").unwrap().with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2024-01-01T00:00:01Z").unwrap().with_timezone(&Utc);
        assert!(ts_to_sql(&early) < ts_to_sql(&late));
        assert_eq!(ts_from_sql(0, &ts_to_sql(&early)).unwrap(), early);
    }
}
