//! Breadth-first neighborhood expansion over the edge table.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

use crate::error::Result;
use crate::memory_db::edge_store;
use crate::memory_db::node_store;
use crate::memory_db::schema::{Edge, Node};

pub const DEFAULT_DEPTH: usize = 1;
pub const MAX_DEPTH: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
    #[default]
    Both,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NeighborQuery {
    /// Hops to expand; defaults to 1 and is clamped to [`MAX_DEPTH`].
    #[serde(default)]
    pub depth: Option<usize>,
    /// Only follow edges with this relation.
    #[serde(default)]
    pub relation: Option<String>,
    #[serde(default)]
    pub direction: Direction,
}

impl NeighborQuery {
    pub fn depth(depth: usize) -> Self {
        Self {
            depth: Some(depth),
            ..Default::default()
        }
    }

    pub fn with_relation(mut self, relation: impl Into<String>) -> Self {
        self.relation = Some(relation.into());
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    fn effective_depth(&self) -> usize {
        self.depth.unwrap_or(DEFAULT_DEPTH).min(MAX_DEPTH)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Neighbor {
    pub node: Node,
    pub depth: usize,
    /// Edge this node was first reached through; `None` for the origin.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via: Option<Edge>,
}

/// BFS from `origin`. Each node is reported once, at its shortest distance.
pub(crate) fn walk(conn: &Connection, origin: &str, query: &NeighborQuery) -> Result<Vec<Neighbor>> {
    let origin_node = node_store::require_node(conn, origin)?;
    let max_depth = query.effective_depth();
    let relation = query.relation.as_deref();

    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(origin_node.id.clone());
    let mut frontier: VecDeque<(String, usize)> = VecDeque::new();
    frontier.push_back((origin_node.id.clone(), 0));
    let mut found = vec![Neighbor { node: origin_node, depth: 0, via: None }];
    let mut pending: Vec<(String, usize, Edge)> = Vec::new();

    while let Some((current, depth)) = frontier.pop_front() {
        if depth >= max_depth {
            continue;
        }

        let mut steps: Vec<(String, Edge)> = Vec::new();
        if matches!(query.direction, Direction::Outgoing | Direction::Both) {
            for edge in edge_store::outgoing(conn, &current, relation)? {
                steps.push((edge.to_id.clone(), edge));
            }
        }
        if matches!(query.direction, Direction::Incoming | Direction::Both) {
            for edge in edge_store::incoming(conn, &current, relation)? {
                steps.push((edge.from_id.clone(), edge));
            }
        }

        for (next, edge) in steps {
            if visited.insert(next.clone()) {
                frontier.push_back((next.clone(), depth + 1));
                pending.push((next, depth + 1, edge));
            }
        }
    }

    let ids: Vec<String> = pending.iter().map(|(id, _, _)| id.clone()).collect();
    let mut nodes = node_store::get_nodes(conn, &ids)?;
    for (id, depth, edge) in pending {
        if let Some(node) = nodes.remove(&id) {
            found.push(Neighbor { node, depth, via: Some(edge) });
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MemoryError;
    use crate::memory_db::schema::NodeType;
    use crate::memory_db::{MemoryStore, StoreOptions};

    fn store_with(ids: &[&str], edges: &[(&str, &str, &str)]) -> MemoryStore {
        let store = MemoryStore::open_in_memory(&StoreOptions { embedding_dim: 2, ..Default::default() }).unwrap();
        for id in ids {
            store.upsert(Node::new(*id, NodeType::Task, *id)).unwrap();
        }
        for (from, to, rel) in edges {
            store.link(from, to, rel, None).unwrap();
        }
        store
    }

    #[test]
    fn test_depth_zero_is_origin_only() {
        let store = store_with(&["a", "b"], &[("a", "b", "blocks")]);
        let found = store.neighbors("a", &NeighborQuery::depth(0)).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].node.id, "a");
        assert_eq!(found[0].depth, 0);
        assert!(found[0].via.is_none());
    }

    #[test]
    fn test_cycle_is_not_revisited() {
        let store = store_with(&["a", "b"], &[("a", "b", "blocks"), ("b", "a", "blocks")]);
        let found = store.neighbors("a", &NeighborQuery::depth(5)).unwrap();
        let ids: Vec<&str> = found.iter().map(|n| n.node.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_depth_and_relation_filter() {
        let store = store_with(
            &["a", "b", "c", "d"],
            &[("a", "b", "blocks"), ("b", "c", "blocks"), ("a", "d", "touches")],
        );
        let found = store.neighbors("a", &NeighborQuery::depth(2).with_relation("blocks")).unwrap();
        let got: Vec<(&str, usize)> = found.iter().map(|n| (n.node.id.as_str(), n.depth)).collect();
        assert_eq!(got, vec![("a", 0), ("b", 1), ("c", 2)]);
        assert_eq!(found[2].via.as_ref().unwrap().from_id, "b");
    }

    #[test]
    fn test_direction_outgoing_ignores_incoming() {
        let store = store_with(&["a", "b", "c"], &[("a", "b", "blocks"), ("c", "a", "blocks")]);
        let found = store
            .neighbors("a", &NeighborQuery::depth(1).with_direction(Direction::Outgoing))
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[1].node.id, "b");
    }

    #[test]
    fn test_depth_is_clamped() {
        let ids: Vec<String> = (0..8).map(|i| format!("n{}", i)).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let edges: Vec<(&str, &str, &str)> = id_refs.windows(2).map(|w| (w[0], w[1], "next")).collect();
        let store = store_with(&id_refs, &edges);
        let found = store.neighbors("n0", &NeighborQuery::depth(50)).unwrap();
        assert_eq!(found.iter().map(|n| n.depth).max(), Some(MAX_DEPTH));
    }

    #[test]
    fn test_missing_origin_is_not_found() {
        let store = store_with(&[], &[]);
        assert!(matches!(store.neighbors("ghost", &NeighborQuery::default()), Err(MemoryError::NotFound(_))));
    }
}
