//! Event classification: ordered pattern rules, then an optional model
//! fallback under a hard deadline.
pub mod fallback;
pub mod rules;

pub use fallback::{label_to_node_type, FallbackClassifier, FallbackContext, FallbackVerdict};
pub use rules::{Rule, RuleLabel, RuleMatch, RuleSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{MemoryError, Result};
use crate::memory_db::schema::{Metadata, NodeType};

/// Confidence ceiling for a rule guess returned because the fallback failed.
pub const DEGRADED_CONFIDENCE_CAP: f32 = 0.5;
/// Confidence of the per-source default when no rule matched.
pub const SOURCE_DEFAULT_CONFIDENCE: f32 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
    GitCommit,
    ShellCommand,
    Message,
    FileChange,
}

impl SourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTag::GitCommit => "git_commit",
            SourceTag::ShellCommand => "shell_command",
            SourceTag::Message => "message",
            SourceTag::FileChange => "file_change",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "git_commit" => Some(SourceTag::GitCommit),
            "shell_command" => Some(SourceTag::ShellCommand),
            "message" => Some(SourceTag::Message),
            "file_change" => Some(SourceTag::FileChange),
            _ => None,
        }
    }

    /// Label and node type used when nothing better is known.
    pub fn default_guess(&self) -> (&'static str, NodeType) {
        match self {
            SourceTag::GitCommit => ("commit", NodeType::Decision),
            SourceTag::ShellCommand => ("command", NodeType::Task),
            SourceTag::Message => ("message", NodeType::Message),
            SourceTag::FileChange => ("file_change", NodeType::File),
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event as it arrives from a hook or client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    /// Becomes the node id; empty means one is assigned at submit time.
    #[serde(default)]
    pub id: String,
    pub source: SourceTag,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl RawEvent {
    pub fn new(source: SourceTag, text: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            source,
            text: text.into(),
            metadata: Metadata::new(),
            repo: None,
            author: None,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassificationMethod {
    Rule { name: String },
    SourceDefault,
    Fallback,
    Degraded { reason: String },
}

impl ClassificationMethod {
    /// Short form for metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationMethod::Rule { .. } => "rule",
            ClassificationMethod::SourceDefault => "source_default",
            ClassificationMethod::Fallback => "fallback",
            ClassificationMethod::Degraded { .. } => "degraded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedEvent {
    pub label: String,
    pub confidence: f32,
    pub suggested_type: NodeType,
    pub method: ClassificationMethod,
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub confidence_threshold: f32,
    /// Advisory; overruns are logged, never enforced.
    pub rule_budget: Duration,
    pub fallback_budget: Duration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            rule_budget: Duration::from_millis(10),
            fallback_budget: Duration::from_secs(2),
        }
    }
}

pub struct Classifier {
    rules: RuleSet,
    fallback: Option<Arc<dyn FallbackClassifier>>,
    config: ClassifierConfig,
}

impl Classifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self::with_rules(RuleSet::default(), config)
    }

    pub fn with_rules(rules: RuleSet, config: ClassifierConfig) -> Self {
        Self {
            rules,
            fallback: None,
            config,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackClassifier>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Rules only. The bool is true when an actual rule matched rather than
    /// the source default.
    ///
    /// `rule_budget` is advisory: rules always run to completion and an
    /// overrun is only logged, so a match is never discarded for being slow.
    pub fn classify_rules(&self, event: &RawEvent) -> Result<(ClassifiedEvent, bool)> {
        let text = event.text.trim();
        if text.is_empty() {
            return Err(MemoryError::invalid("event text is empty"));
        }

        let started = Instant::now();
        let matched = self.rules.evaluate(event.source, text);
        let elapsed = started.elapsed();
        if elapsed > self.config.rule_budget {
            warn!(
                source = %event.source,
                elapsed_us = elapsed.as_micros() as u64,
                budget_ms = self.config.rule_budget.as_millis() as u64,
                "Rule evaluation exceeded its budget"
            );
        }

        Ok(match matched {
            Some(m) => (
                ClassifiedEvent {
                    label: m.label,
                    confidence: m.confidence,
                    suggested_type: m.node_type,
                    method: ClassificationMethod::Rule { name: m.rule },
                },
                true,
            ),
            None => {
                let (label, node_type) = event.source.default_guess();
                (
                    ClassifiedEvent {
                        label: label.to_string(),
                        confidence: SOURCE_DEFAULT_CONFIDENCE,
                        suggested_type: node_type,
                        method: ClassificationMethod::SourceDefault,
                    },
                    false,
                )
            }
        })
    }

    /// Classify one event. Only fails for empty text; fallback trouble
    /// degrades to the rule guess instead.
    pub async fn classify(&self, event: &RawEvent) -> Result<ClassifiedEvent> {
        let (guess, rule_matched) = self.classify_rules(event)?;

        if rule_matched && guess.confidence >= self.config.confidence_threshold {
            return Ok(self.finish(guess));
        }
        let Some(fallback) = &self.fallback else {
            return Ok(self.finish(guess));
        };

        let context = FallbackContext {
            source: event.source,
            rule_guess: rule_matched.then(|| guess.label.clone()),
        };
        let text = event.text.trim();
        let budget = self.config.fallback_budget;

        let outcome = tokio::time::timeout(budget, fallback.classify_fallback(text, &context)).await;
        let classified = match outcome {
            Ok(Ok(verdict)) if !verdict.label.trim().is_empty() => {
                let confidence = if verdict.confidence.is_finite() {
                    verdict.confidence.clamp(0.0, 1.0)
                } else {
                    0.0
                };
                debug!(source = %event.source, label = %verdict.label, confidence, "Fallback classification");
                ClassifiedEvent {
                    suggested_type: label_to_node_type(&verdict.label),
                    label: verdict.label.trim().to_lowercase(),
                    confidence,
                    method: ClassificationMethod::Fallback,
                }
            }
            Ok(Ok(_)) => degrade(guess, "fallback returned an empty label".to_string()),
            Ok(Err(e)) => {
                warn!(source = %event.source, provider = fallback.name(), error = %e, "Fallback classifier failed");
                degrade(guess, format!("fallback error: {}", e))
            }
            Err(_) => {
                let err = MemoryError::Timeout(budget);
                warn!(source = %event.source, provider = fallback.name(), error = %err, "Fallback classifier timed out");
                degrade(guess, format!("fallback: {}", err))
            }
        };
        Ok(self.finish(classified))
    }

    fn finish(&self, classified: ClassifiedEvent) -> ClassifiedEvent {
        crate::metrics::record_classification(classified.method.as_str());
        classified
    }
}

fn degrade(mut guess: ClassifiedEvent, reason: String) -> ClassifiedEvent {
    guess.confidence = guess.confidence.min(DEGRADED_CONFIDENCE_CAP);
    guess.method = ClassificationMethod::Degraded { reason };
    guess
}
