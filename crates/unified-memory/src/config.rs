use anyhow::{bail, Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::classifier::ClassifierConfig;
use crate::coordinator::CoordinatorConfig;
use crate::memory_db::StoreOptions;
use crate::relationship::RelationConfig;
use crate::retrieval::hybrid::{DEFAULT_LIMIT, MAX_LIMIT};
use crate::retrieval::scoring::HybridWeights;

#[derive(Debug, Clone)]
pub struct Config {
    // storage
    pub db_path: PathBuf,
    pub db_pool_size: u32,
    pub db_busy_timeout_ms: u64,

    // http
    pub api_host: String,
    pub api_port: u16,
    pub request_timeout_seconds: u64,

    // classifier
    pub rule_confidence_threshold: f32,
    pub rule_budget_ms: u64,
    pub fallback_budget_ms: u64,
    /// OpenAI-compatible base URL; no fallback classifier when unset.
    pub fallback_url: Option<String>,
    pub fallback_model: String,
    pub fallback_api_key: Option<String>,

    // search and embeddings
    pub search_weights: HybridWeights,
    pub search_default_limit: usize,
    pub embedding_dim: usize,
    pub embedding_model: String,
    pub embedding_cache_size: u64,
    pub embedding_refresh_ms: u64,
    pub embedding_batch_size: usize,

    // relationship engine
    pub temporal_window_seconds: i64,
    pub similarity_threshold: f32,
    pub max_semantic_links: usize,
    pub relation_poll_ms: u64,

    // coordination
    pub lease_ttl_seconds: i64,
    pub heartbeat_timeout_seconds: i64,
    pub sweep_interval_seconds: u64,

    // capture
    pub queue_size: usize,
    pub queue_timeout_ms: u64,
    pub capture_workers: usize,
    pub capture_max_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/memory.db"),
            db_pool_size: 8,
            db_busy_timeout_ms: 5000,
            api_host: "127.0.0.1".into(),
            api_port: 8700,
            request_timeout_seconds: 30,
            rule_confidence_threshold: 0.7,
            rule_budget_ms: 10,
            fallback_budget_ms: 2000,
            fallback_url: None,
            fallback_model: "local-model".into(),
            fallback_api_key: None,
            search_weights: HybridWeights::default(),
            search_default_limit: DEFAULT_LIMIT,
            embedding_dim: 384,
            embedding_model: "all-minilm".into(),
            embedding_cache_size: 1024,
            embedding_refresh_ms: 5000,
            embedding_batch_size: 32,
            temporal_window_seconds: 15 * 60,
            similarity_threshold: 0.85,
            max_semantic_links: 10,
            relation_poll_ms: 1000,
            lease_ttl_seconds: 60,
            heartbeat_timeout_seconds: 60,
            sweep_interval_seconds: 10,
            queue_size: 1024,
            queue_timeout_ms: 5,
            capture_workers: Self::auto_detect_workers(),
            capture_max_attempts: 3,
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} has invalid value '{}': {}", key, raw, e)),
        _ => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let d = Self::default();

        let capture_workers = match lookup("CAPTURE_WORKERS").as_deref().map(str::trim) {
            None | Some("") | Some("auto") => Self::auto_detect_workers(),
            Some(raw) => raw.parse().context("CAPTURE_WORKERS must be a number or 'auto'")?,
        };

        let search_weights = match lookup("SEARCH_WEIGHTS") {
            Some(raw) if !raw.trim().is_empty() => {
                HybridWeights::from_str(&raw).map_err(|e| anyhow::anyhow!("SEARCH_WEIGHTS: {}", e))?
            }
            _ => d.search_weights,
        };

        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let cfg = Self {
            db_path: non_empty("DB_PATH").map(PathBuf::from).unwrap_or(d.db_path),
            db_pool_size: parse_var(&lookup, "DB_POOL_SIZE", d.db_pool_size)?,
            db_busy_timeout_ms: parse_var(&lookup, "DB_BUSY_TIMEOUT_MS", d.db_busy_timeout_ms)?,
            api_host: non_empty("API_HOST").unwrap_or(d.api_host),
            api_port: parse_var(&lookup, "API_PORT", d.api_port)?,
            request_timeout_seconds: parse_var(&lookup, "REQUEST_TIMEOUT_SECONDS", d.request_timeout_seconds)?,
            rule_confidence_threshold: parse_var(&lookup, "RULE_CONFIDENCE_THRESHOLD", d.rule_confidence_threshold)?,
            rule_budget_ms: parse_var(&lookup, "RULE_BUDGET_MS", d.rule_budget_ms)?,
            fallback_budget_ms: parse_var(&lookup, "FALLBACK_BUDGET_MS", d.fallback_budget_ms)?,
            fallback_url: non_empty("FALLBACK_URL"),
            fallback_model: non_empty("FALLBACK_MODEL").unwrap_or(d.fallback_model),
            fallback_api_key: non_empty("FALLBACK_API_KEY"),
            search_weights,
            search_default_limit: parse_var(&lookup, "SEARCH_DEFAULT_LIMIT", d.search_default_limit)?,
            embedding_dim: parse_var(&lookup, "EMBEDDING_DIM", d.embedding_dim)?,
            embedding_model: non_empty("EMBEDDING_MODEL").unwrap_or(d.embedding_model),
            embedding_cache_size: parse_var(&lookup, "EMBEDDING_CACHE_SIZE", d.embedding_cache_size)?,
            embedding_refresh_ms: parse_var(&lookup, "EMBEDDING_REFRESH_MS", d.embedding_refresh_ms)?,
            embedding_batch_size: parse_var(&lookup, "EMBEDDING_BATCH_SIZE", d.embedding_batch_size)?,
            temporal_window_seconds: parse_var(&lookup, "TEMPORAL_WINDOW_SECONDS", d.temporal_window_seconds)?,
            similarity_threshold: parse_var(&lookup, "SIMILARITY_THRESHOLD", d.similarity_threshold)?,
            max_semantic_links: parse_var(&lookup, "MAX_SEMANTIC_LINKS", d.max_semantic_links)?,
            relation_poll_ms: parse_var(&lookup, "RELATION_POLL_MS", d.relation_poll_ms)?,
            lease_ttl_seconds: parse_var(&lookup, "LEASE_TTL_SECONDS", d.lease_ttl_seconds)?,
            heartbeat_timeout_seconds: parse_var(&lookup, "HEARTBEAT_TIMEOUT_SECONDS", d.heartbeat_timeout_seconds)?,
            sweep_interval_seconds: parse_var(&lookup, "SWEEP_INTERVAL_SECONDS", d.sweep_interval_seconds)?,
            queue_size: parse_var(&lookup, "QUEUE_SIZE", d.queue_size)?,
            queue_timeout_ms: parse_var(&lookup, "QUEUE_TIMEOUT_MS", d.queue_timeout_ms)?,
            capture_workers,
            capture_max_attempts: parse_var(&lookup, "CAPTURE_MAX_ATTEMPTS", d.capture_max_attempts)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn auto_detect_workers() -> usize {
        (num_cpus::get() / 2).clamp(1, 4)
    }

    pub fn validate(&self) -> Result<()> {
        if self.db_pool_size == 0 {
            bail!("DB_POOL_SIZE must be at least 1");
        }
        if self.embedding_dim == 0 {
            bail!("EMBEDDING_DIM must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.rule_confidence_threshold) {
            bail!("RULE_CONFIDENCE_THRESHOLD must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            bail!("SIMILARITY_THRESHOLD must be within [0, 1]");
        }
        if self.search_default_limit == 0 || self.search_default_limit > MAX_LIMIT {
            bail!("SEARCH_DEFAULT_LIMIT must be within 1..={}", MAX_LIMIT);
        }
        self.search_weights
            .validate()
            .map_err(|e| anyhow::anyhow!("SEARCH_WEIGHTS: {}", e))?;
        if self.lease_ttl_seconds <= 0 || self.heartbeat_timeout_seconds <= 0 {
            bail!("lease TTL and heartbeat timeout must be positive");
        }
        if self.sweep_interval_seconds == 0 || self.relation_poll_ms == 0 || self.embedding_refresh_ms == 0 {
            bail!("background intervals must be positive");
        }
        if self.queue_size == 0 || self.capture_workers == 0 || self.capture_max_attempts == 0 {
            bail!("QUEUE_SIZE, CAPTURE_WORKERS and CAPTURE_MAX_ATTEMPTS must be at least 1");
        }
        if self.fallback_budget_ms == 0 {
            bail!("FALLBACK_BUDGET_MS must be positive");
        }
        Ok(())
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            pool_size: self.db_pool_size,
            embedding_dim: self.embedding_dim,
            busy_timeout_ms: self.db_busy_timeout_ms,
        }
    }

    pub fn classifier_config(&self) -> ClassifierConfig {
        ClassifierConfig {
            confidence_threshold: self.rule_confidence_threshold,
            rule_budget: Duration::from_millis(self.rule_budget_ms),
            fallback_budget: Duration::from_millis(self.fallback_budget_ms),
        }
    }

    pub fn relation_config(&self) -> RelationConfig {
        RelationConfig {
            temporal_window: chrono::Duration::seconds(self.temporal_window_seconds),
            similarity_threshold: self.similarity_threshold,
            max_semantic_links: self.max_semantic_links,
            ..Default::default()
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            lease_ttl: chrono::Duration::seconds(self.lease_ttl_seconds),
            heartbeat_timeout: chrono::Duration::seconds(self.heartbeat_timeout_seconds),
            sweep_interval: Duration::from_secs(self.sweep_interval_seconds),
        }
    }

    pub fn print_config(&self) {
        info!(
            db_path = %self.db_path.display(),
            pool_size = self.db_pool_size,
            embedding_dim = self.embedding_dim,
            "Storage configuration"
        );
        info!(
            threshold = self.rule_confidence_threshold,
            fallback = self.fallback_url.as_deref().unwrap_or("disabled"),
            fallback_budget_ms = self.fallback_budget_ms,
            "Classifier configuration"
        );
        info!(
            lease_ttl_s = self.lease_ttl_seconds,
            heartbeat_timeout_s = self.heartbeat_timeout_seconds,
            sweep_interval_s = self.sweep_interval_seconds,
            "Coordination configuration"
        );
        info!(
            workers = self.capture_workers,
            queue_size = self.queue_size,
            queue_timeout_ms = self.queue_timeout_ms,
            "Capture configuration"
        );
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.api_host, self.api_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.lease_ttl_seconds, 60);
        assert_eq!(config.queue_timeout_ms, 5);
        assert_eq!(config.search_weights, HybridWeights::default());
        assert!(config.capture_workers >= 1);
    }

    #[test]
    fn test_lookup_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("DB_PATH", "/tmp/mem.db"),
            ("API_PORT", "9100"),
            ("SEARCH_WEIGHTS", "0.5, 0.5, 0"),
            ("CAPTURE_WORKERS", "2"),
            ("FALLBACK_URL", "http://127.0.0.1:8081"),
            ("TEMPORAL_WINDOW_SECONDS", "60"),
        ]))
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/mem.db"));
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.search_weights.centrality, 0.0);
        assert_eq!(config.capture_workers, 2);
        assert_eq!(config.fallback_url.as_deref(), Some("http://127.0.0.1:8081"));
        assert_eq!(config.relation_config().temporal_window, chrono::Duration::seconds(60));
    }

    #[test]
    fn test_blank_values_keep_defaults() {
        let config = Config::from_lookup(lookup(&[("API_HOST", "  "), ("CAPTURE_WORKERS", "auto"), ("FALLBACK_URL", "")]))
            .unwrap();
        assert_eq!(config.api_host, "127.0.0.1");
        assert!(config.fallback_url.is_none());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(Config::from_lookup(lookup(&[("API_PORT", "not-a-port")])).is_err());
        assert!(Config::from_lookup(lookup(&[("SEARCH_WEIGHTS", "1,2")])).is_err());
        assert!(Config::from_lookup(lookup(&[("EMBEDDING_DIM", "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[("SIMILARITY_THRESHOLD", "1.5")])).is_err());
        assert!(Config::from_lookup(lookup(&[("SEARCH_DEFAULT_LIMIT", "500")])).is_err());
    }

    #[test]
    fn test_component_configs() {
        let config = Config::default();
        assert_eq!(config.coordinator_config().lease_ttl, chrono::Duration::seconds(60));
        assert_eq!(config.classifier_config().fallback_budget, Duration::from_secs(2));
        assert_eq!(config.store_options().embedding_dim, 384);
        assert_eq!(config.api_addr().unwrap().port(), 8700);
    }
}
