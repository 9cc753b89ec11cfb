//! Hybrid search: filter, score on three axes, fuse with weights, rank.

use rayon::prelude::*;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::{MemoryError, Result};
use crate::memory_db::edge_store;
use crate::memory_db::node_store::{row_to_node, NODE_COLUMNS};
use crate::memory_db::schema::{Metadata, Node, NodeType};
use crate::retrieval::scoring::{self, CorpusStats, HybridWeights, ScoreBreakdown};
use crate::utils::TextUtils;

pub const DEFAULT_LIMIT: usize = 20;
pub const MAX_LIMIT: usize = 200;

/// Exact-match filters applied before any scoring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub node_type: Option<NodeType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Every listed key must be present with an equal value.
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub filters: SearchFilters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Per-request override of the store-wide weights.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<HybridWeights>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, node_type: NodeType) -> Self {
        self.filters.node_type = Some(node_type);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.query_embedding = Some(embedding);
        self
    }

    /// Resolved limit, `InvalidInput` for 0.
    pub fn effective_limit(&self) -> Result<usize> {
        match self.limit {
            Some(0) => Err(MemoryError::invalid("limit must be at least 1")),
            Some(n) => Ok(n.min(MAX_LIMIT)),
            None => Ok(DEFAULT_LIMIT),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub node: Node,
    pub score: f32,
    pub breakdown: ScoreBreakdown,
}

fn load_candidates(conn: &Connection, filters: &SearchFilters) -> Result<Vec<Node>> {
    let sql = format!(
        "SELECT {} FROM nodes
         WHERE (?1 IS NULL OR node_type = ?1)
           AND (?2 IS NULL OR repo = ?2)
           AND (?3 IS NULL OR author = ?3)",
        NODE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let node_type = filters.node_type.as_ref().map(|t| t.as_str().to_string());
    let rows = stmt.query_map(params![node_type, filters.repo, filters.author], row_to_node)?;

    let mut nodes = Vec::new();
    for row in rows {
        let node = row?;
        let metadata_ok = filters
            .metadata
            .iter()
            .all(|(key, value)| node.metadata.get(key) == Some(value));
        if metadata_ok {
            nodes.push(node);
        }
    }
    Ok(nodes)
}

/// Rank nodes for `request`. Must run inside one read transaction so the
/// candidate rows and the degree counts come from the same snapshot.
pub(crate) fn run_search(conn: &Connection, request: &SearchRequest, weights: &HybridWeights) -> Result<Vec<SearchHit>> {
    let limit = request.effective_limit()?;
    let weights = request.weights.unwrap_or(*weights);
    weights.validate()?;

    let candidates = load_candidates(conn, &request.filters)?;
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let query_terms = TextUtils::tokenize(&request.query);
    let query_embedding = request.query_embedding.as_deref();
    let has_signal = !query_terms.is_empty() || query_embedding.is_some();

    let doc_terms: Vec<Vec<String>> = candidates.par_iter().map(|n| TextUtils::tokenize(&n.text)).collect();
    let stats = CorpusStats::from_documents(doc_terms.iter().map(Vec::as_slice));
    let mut keyword: Vec<f32> = doc_terms
        .par_iter()
        .map(|terms| scoring::bm25(&query_terms, terms, &stats))
        .collect();
    scoring::normalize_by_max(&mut keyword);

    let degrees = edge_store::degree_map(conn)?;
    let degree_of = |id: &str| degrees.get(id).copied().unwrap_or(0);
    let max_degree = candidates.iter().map(|n| degree_of(&n.id)).max().unwrap_or(0);

    let mut hits: Vec<SearchHit> = candidates
        .into_par_iter()
        .zip(keyword.into_par_iter())
        .filter_map(|(node, keyword)| {
            let breakdown = ScoreBreakdown {
                keyword,
                vector: scoring::vector_score(query_embedding, node.embedding.as_deref()),
                centrality: scoring::centrality_score(degree_of(&node.id), max_degree),
            };
            if has_signal && breakdown.keyword <= 0.0 && breakdown.vector <= 0.0 {
                return None;
            }
            Some(SearchHit {
                score: weights.combine(&breakdown),
                node,
                breakdown,
            })
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.node.updated_at.cmp(&a.node.updated_at))
            .then_with(|| a.node.id.cmp(&b.node.id))
    });
    hits.truncate(limit);
    Ok(hits)
}
