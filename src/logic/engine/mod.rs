//! Detection Engine
//!
//! Contract between the agent and the rule-matching engine. An engine is
//! built once, loaded with containers then rules, and never mutated after it
//! becomes the active instance; reloads build a fresh one.

use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

use crate::logic::event::Event;

pub mod rules;

pub use rules::{CompiledRule, RuleDefinition, RuleEngine};

// ============================================================================
// TYPES
// ============================================================================

/// Outcome of matching one event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchResult {
    /// Names of alerting rules that fired
    pub names: Vec<String>,
    /// Max criticality over matched rules
    pub criticality: i64,
    /// Event matched a non-alerting filter rule
    pub filtered: bool,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        !self.names.is_empty() || self.filtered
    }
}

pub trait DetectionEngine: Send + Sync {
    /// Record matched rules and actions in the event
    fn set_show_actions(&mut self, show: bool);

    fn add_rule(&mut self, rule: CompiledRule) -> Result<(), EngineError>;

    /// Load every rule file of a directory
    fn load_directory(&mut self, dir: &Path) -> Result<(), EngineError>;

    /// Load a named lookup table, one entry per line
    fn load_container(&mut self, name: &str, reader: &mut dyn BufRead) -> Result<(), EngineError>;

    /// Number of loaded rules
    fn count(&self) -> usize;

    fn match_or_filter(&self, event: &mut Event) -> MatchResult;
}

/// Builds fresh, empty engine instances for reloads
pub type EngineFactory = Arc<dyn Fn() -> Box<dyn DetectionEngine> + Send + Sync>;

pub fn rule_engine_factory() -> EngineFactory {
    Arc::new(|| Box::new(RuleEngine::new()) as Box<dyn DetectionEngine>)
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug)]
pub enum EngineError {
    Io(String),
    /// Rule file line that is not a valid rule
    Parse { file: String, line: usize, message: String },
    UnknownContainer(String),
    InvalidRegex { rule: String, message: String },
    DuplicateRule(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Io(msg) => write!(f, "Engine I/O error: {}", msg),
            EngineError::Parse { file, line, message } => {
                write!(f, "Failed to parse rule {}:{}: {}", file, line, message)
            }
            EngineError::UnknownContainer(name) => write!(f, "Unknown container: {}", name),
            EngineError::InvalidRegex { rule, message } => {
                write!(f, "Invalid regex in rule {}: {}", rule, message)
            }
            EngineError::DuplicateRule(name) => write!(f, "Duplicate rule: {}", name),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}
