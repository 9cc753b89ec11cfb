//! The three ranking signals and their weighted combination.
//!
//! Each scorer is a pure function returning a value in `[0, 1]`, so weights
//! can be tuned or hot-swapped without touching the search pipeline.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use crate::error::{MemoryError, Result};

pub const BM25_K1: f32 = 1.2;
pub const BM25_B: f32 = 0.75;

/// Per-axis contribution of one search hit, before weighting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub keyword: f32,
    pub vector: f32,
    pub centrality: f32,
}

/// Weights for `keyword`, `vector` and `centrality`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HybridWeights {
    pub keyword: f32,
    pub vector: f32,
    pub centrality: f32,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            keyword: 0.3,
            vector: 0.5,
            centrality: 0.2,
        }
    }
}

impl HybridWeights {
    pub fn validate(&self) -> Result<()> {
        let all = [self.keyword, self.vector, self.centrality];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(MemoryError::invalid("search weights must be finite and non-negative"));
        }
        if all.iter().sum::<f32>() <= 0.0 {
            return Err(MemoryError::invalid("at least one search weight must be positive"));
        }
        Ok(())
    }

    pub fn combine(&self, breakdown: &ScoreBreakdown) -> f32 {
        self.keyword * breakdown.keyword + self.vector * breakdown.vector + self.centrality * breakdown.centrality
    }
}

/// Parses `"keyword,vector,centrality"`, e.g. `"0.3,0.5,0.2"`.
impl FromStr for HybridWeights {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<f32> = s
            .split(',')
            .map(|p| p.trim().parse::<f32>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| MemoryError::invalid(format!("bad weight list '{}': {}", s, e)))?;
        if parts.len() != 3 {
            return Err(MemoryError::invalid(format!("expected 3 weights, got {}", parts.len())));
        }
        let weights = Self {
            keyword: parts[0],
            vector: parts[1],
            centrality: parts[2],
        };
        weights.validate()?;
        Ok(weights)
    }
}

/// Document frequencies over one candidate set.
#[derive(Debug, Default)]
pub struct CorpusStats {
    pub doc_count: usize,
    pub avg_doc_len: f32,
    pub doc_freq: HashMap<String, usize>,
}

impl CorpusStats {
    pub fn from_documents<'a, I>(docs: I) -> Self
    where
        I: IntoIterator<Item = &'a [String]>,
    {
        let mut stats = CorpusStats::default();
        let mut total_len = 0usize;
        for doc in docs {
            stats.doc_count += 1;
            total_len += doc.len();
            let unique: HashSet<&String> = doc.iter().collect();
            for term in unique {
                *stats.doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
        }
        if stats.doc_count > 0 {
            stats.avg_doc_len = total_len as f32 / stats.doc_count as f32;
        }
        stats
    }

    fn idf(&self, term: &str) -> f32 {
        let n = *self.doc_freq.get(term).unwrap_or(&0) as f32;
        let big_n = self.doc_count as f32;
        (1.0 + (big_n - n + 0.5) / (n + 0.5)).ln()
    }
}

/// Raw (unnormalized) BM25 of one document against the query terms.
pub fn bm25(query_terms: &[String], doc_terms: &[String], stats: &CorpusStats) -> f32 {
    if query_terms.is_empty() || doc_terms.is_empty() {
        return 0.0;
    }
    let mut tf: HashMap<&str, usize> = HashMap::new();
    for term in doc_terms {
        *tf.entry(term.as_str()).or_insert(0) += 1;
    }
    let dl = doc_terms.len() as f32;
    let avgdl = if stats.avg_doc_len > 0.0 { stats.avg_doc_len } else { dl };

    let unique_query: HashSet<&str> = query_terms.iter().map(String::as_str).collect();
    unique_query
        .into_iter()
        .filter_map(|term| tf.get(term).map(|f| (term, *f as f32)))
        .map(|(term, f)| {
            let norm = f + BM25_K1 * (1.0 - BM25_B + BM25_B * dl / avgdl);
            stats.idf(term) * f * (BM25_K1 + 1.0) / norm
        })
        .sum()
}

/// Scale raw scores into `[0, 1]` by the best one.
pub fn normalize_by_max(scores: &mut [f32]) {
    let max = scores.iter().cloned().fold(0.0f32, f32::max);
    if max > 0.0 {
        for s in scores.iter_mut() {
            *s /= max;
        }
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Cosine similarity clamped to `[0, 1]`; 0 when either side is missing
/// or the dimensions disagree.
pub fn vector_score(query: Option<&[f32]>, node: Option<&[f32]>) -> f32 {
    match (query, node) {
        (Some(q), Some(n)) => cosine_similarity(q, n).clamp(0.0, 1.0),
        _ => 0.0,
    }
}

/// `ln(1 + degree) / ln(1 + max_degree)`.
pub fn centrality_score(degree: i64, max_degree: i64) -> f32 {
    if max_degree <= 0 || degree <= 0 {
        return 0.0;
    }
    let score = (1.0 + degree as f64).ln() / (1.0 + max_degree as f64).ln();
    score.clamp(0.0, 1.0) as f32
}
