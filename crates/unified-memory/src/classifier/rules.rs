//! Pattern rules evaluated before any model is consulted.

use lazy_static::lazy_static;
use regex::Regex;

use super::SourceTag;
use crate::memory_db::schema::NodeType;

/// Where a rule takes its label from.
#[derive(Debug, Clone)]
pub enum RuleLabel {
    Fixed(String),
    /// Lowercased text of a named capture group, or `fallback` when the group did not match.
    Capture { group: &'static str, fallback: String },
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    /// `None` matches events from every source.
    pub source: Option<SourceTag>,
    pub pattern: Regex,
    pub label: RuleLabel,
    pub confidence: f32,
    pub node_type: NodeType,
    pub priority: i32,
}

impl Rule {
    pub fn new(
        name: impl Into<String>,
        source: Option<SourceTag>,
        pattern: Regex,
        label: impl Into<String>,
        confidence: f32,
        node_type: NodeType,
        priority: i32,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            pattern,
            label: RuleLabel::Fixed(label.into()),
            confidence: confidence.clamp(0.0, 1.0),
            node_type,
            priority,
        }
    }

    fn applies_to(&self, source: SourceTag) -> bool {
        self.source.map_or(true, |s| s == source)
    }

    fn try_match(&self, text: &str) -> Option<String> {
        let captures = self.pattern.captures(text)?;
        let label = match &self.label {
            RuleLabel::Fixed(label) => label.clone(),
            RuleLabel::Capture { group, fallback } => captures
                .name(group)
                .map(|m| m.as_str().to_lowercase())
                .unwrap_or_else(|| fallback.clone()),
        };
        Some(label)
    }
}

/// Outcome of the winning rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub rule: String,
    pub label: String,
    pub confidence: f32,
    pub node_type: NodeType,
}

/// Rules ordered by descending priority, ties by name. First match wins.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(mut rules: Vec<Rule>) -> Self {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        Self { rules }
    }

    pub fn evaluate(&self, source: SourceTag, text: &str) -> Option<RuleMatch> {
        self.rules
            .iter()
            .filter(|rule| rule.applies_to(source))
            .find_map(|rule| {
                rule.try_match(text).map(|label| RuleMatch {
                    rule: rule.name.clone(),
                    label,
                    confidence: rule.confidence,
                    node_type: rule.node_type.clone(),
                })
            })
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        RuleSet::new(DEFAULT_RULES.clone())
    }
}

lazy_static! {
    static ref DEFAULT_RULES: Vec<Rule> = default_rules();
}

fn re(pattern: &str) -> Regex {
    // patterns below are literals; a typo is a programming error
    Regex::new(pattern).unwrap()
}

fn default_rules() -> Vec<Rule> {
    use NodeType::{Decision, File, Task};
    use SourceTag::{FileChange, GitCommit, Message, ShellCommand};

    vec![
        // conventional commits
        Rule::new(
            "commit-breaking-change",
            Some(GitCommit),
            re(r"(?m)^[a-z]+(\([^)]*\))?!:|BREAKING[ -]CHANGE"),
            "breaking_change",
            0.95,
            Decision,
            100,
        ),
        Rule::new("commit-fix", Some(GitCommit), re(r"(?i)^\s*fix(\([^)]*\))?:\s*\S"), "fix", 0.9, Decision, 90),
        Rule::new("commit-feat", Some(GitCommit), re(r"(?i)^\s*feat(\([^)]*\))?:\s*\S"), "feat", 0.9, Decision, 90),
        Rule {
            name: "commit-conventional".into(),
            source: Some(GitCommit),
            pattern: re(r"(?i)^\s*(?P<kind>build|chore|ci|docs|perf|refactor|revert|style|test)(\([^)]*\))?:\s*\S"),
            label: RuleLabel::Capture { group: "kind", fallback: "commit".into() },
            confidence: 0.85,
            node_type: Decision,
            priority: 80,
        },
        Rule::new("commit-revert", Some(GitCommit), re(r#"^\s*Revert ""#), "revert", 0.85, Decision, 75),
        Rule::new(
            "commit-merge",
            Some(GitCommit),
            re(r"^\s*Merge (branch|pull request|remote-tracking branch|tag)\b"),
            "merge",
            0.8,
            Decision,
            75,
        ),
        // conversation
        Rule::new(
            "message-decision",
            Some(Message),
            re(r"(?i)\b(we decided|decided to|decision:|let'?s go with|going with|we will use|we'll use|agreed to|chose \S+ over)"),
            "decision",
            0.8,
            Decision,
            60,
        ),
        Rule::new(
            "todo",
            None,
            re(r"(?i)\b(todo|fixme|action item|follow[- ]up|need to|needs to)\b"),
            "task",
            0.75,
            Task,
            50,
        ),
        // shell
        Rule::new(
            "shell-test",
            Some(ShellCommand),
            re(r"^\s*(cargo (nextest run|test)|npm (run )?test|yarn test|pnpm test|pytest|go test|make test|mvn test|gradle test)\b"),
            "test",
            0.8,
            Task,
            70,
        ),
        Rule::new(
            "shell-build",
            Some(ShellCommand),
            re(r"^\s*(cargo build|npm run build|yarn build|pnpm build|go build|make|docker build|mvn package|gradle build)\b"),
            "build",
            0.8,
            Task,
            70,
        ),
        Rule::new(
            "shell-deploy",
            Some(ShellCommand),
            re(r"^\s*(kubectl apply|terraform apply|helm (upgrade|install)|fly deploy|vercel|\S*deploy\S*)\b"),
            "deploy",
            0.8,
            Task,
            70,
        ),
        Rule::new(
            "shell-install",
            Some(ShellCommand),
            re(r"^\s*(sudo\s+)?(npm (install|i)|yarn add|pnpm add|pip3? install|cargo (install|add)|apt(-get)? install|brew install)\b"),
            "install",
            0.8,
            Task,
            70,
        ),
        Rule::new("shell-git", Some(ShellCommand), re(r"^\s*git\s+[a-z-]+"), "git", 0.75, Task, 60),
        Rule::new(
            "file-change-path",
            Some(FileChange),
            re(r"^\s*(?:[AMDR?]{1,2}\s+)?[\w.\-/\\]+\.[A-Za-z0-9]+\s*$"),
            "file_change",
            0.9,
            File,
            50,
        ),
    ]
}
