//! JSON Rule Engine
//!
//! Rules are stored one JSON document per line in `*.rules` files. A rule
//! matches when its channel / event ID scope fits and its field matchers
//! hold (all or any). Matchers may reference containers, which must be
//! loaded before the rule is added.

use std::collections::{HashMap, HashSet};
use std::io::BufRead;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{DetectionEngine, EngineError, MatchResult};
use crate::constants::RULES_EXT;
use crate::logic::event::{paths, Event};

// ============================================================================
// RULE DEFINITIONS
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    #[default]
    All,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOp {
    Equals,
    /// Case-insensitive equality
    Iequals,
    /// Case-insensitive substring
    Contains,
    Regex,
    /// Field value (lowercased) is an entry of the named container
    InContainer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMatch {
    pub field: String,
    pub op: MatchOp,
    pub value: String,
    /// Invert the result
    #[serde(default)]
    pub negate: bool,
}

/// On-disk rule format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub name: String,
    #[serde(default)]
    pub criticality: i64,
    /// Non-alerting filter rule
    #[serde(default)]
    pub filter: bool,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub event_ids: Vec<i64>,
    #[serde(default)]
    pub matches: Vec<FieldMatch>,
    #[serde(default)]
    pub condition: Condition,
}

impl RuleDefinition {
    pub fn compile(&self) -> Result<CompiledRule, EngineError> {
        let matchers = self
            .matches
            .iter()
            .map(|m| Matcher::compile(&self.name, m))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CompiledRule {
            name: self.name.clone(),
            criticality: self.criticality,
            filter: self.filter,
            actions: self.actions.clone(),
            channels: self.channels.iter().cloned().collect(),
            event_ids: self.event_ids.iter().copied().collect(),
            condition: self.condition,
            matchers,
        })
    }
}

// ============================================================================
// COMPILED RULES
// ============================================================================

#[derive(Debug, Clone)]
struct Matcher {
    kind: MatcherKind,
    negate: bool,
}

#[derive(Debug, Clone)]
enum MatcherKind {
    Equals { field: String, value: String },
    IEquals { field: String, value: String },
    Contains { field: String, needle: String },
    Regex { field: String, re: Regex },
    InContainer { field: String, container: String },
}

impl Matcher {
    fn compile(rule: &str, m: &FieldMatch) -> Result<Self, EngineError> {
        let field = m.field.clone();
        let kind = match m.op {
            MatchOp::Equals => MatcherKind::Equals { field, value: m.value.clone() },
            MatchOp::Iequals => MatcherKind::IEquals { field, value: m.value.to_lowercase() },
            MatchOp::Contains => MatcherKind::Contains { field, needle: m.value.to_lowercase() },
            MatchOp::Regex => MatcherKind::Regex {
                field,
                re: Regex::new(&m.value).map_err(|e| EngineError::InvalidRegex {
                    rule: rule.to_string(),
                    message: e.to_string(),
                })?,
            },
            MatchOp::InContainer => MatcherKind::InContainer { field, container: m.value.clone() },
        };
        Ok(Self { kind, negate: m.negate })
    }

    fn container(&self) -> Option<&str> {
        match &self.kind {
            MatcherKind::InContainer { container, .. } => Some(container),
            _ => None,
        }
    }

    fn matches(&self, event: &Event, containers: &HashMap<String, HashSet<String>>) -> bool {
        let hit = match &self.kind {
            MatcherKind::Equals { field, value } => {
                event.get_str(field).as_deref() == Some(value.as_str())
            }
            MatcherKind::IEquals { field, value } => {
                event.get_str(field).map_or(false, |v| v.to_lowercase() == *value)
            }
            MatcherKind::Contains { field, needle } => {
                event.get_str(field).map_or(false, |v| v.to_lowercase().contains(needle.as_str()))
            }
            MatcherKind::Regex { field, re } => {
                event.get_str(field).map_or(false, |v| re.is_match(&v))
            }
            MatcherKind::InContainer { field, container } => {
                match (event.get_str(field), containers.get(container)) {
                    (Some(v), Some(set)) => set.contains(&v.to_lowercase()),
                    _ => false,
                }
            }
        };
        hit != self.negate
    }
}

#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: String,
    pub criticality: i64,
    pub filter: bool,
    pub actions: Vec<String>,
    channels: HashSet<String>,
    event_ids: HashSet<i64>,
    condition: Condition,
    matchers: Vec<Matcher>,
}

impl CompiledRule {
    /// Containers this rule looks up
    pub fn containers(&self) -> impl Iterator<Item = &str> {
        self.matchers.iter().filter_map(Matcher::container)
    }

    fn in_scope(&self, event: &Event) -> bool {
        if !self.channels.is_empty() {
            match event.channel() {
                Some(c) if self.channels.contains(&c) => {}
                _ => return false,
            }
        }
        if !self.event_ids.is_empty() {
            match event.event_id() {
                Some(id) if self.event_ids.contains(&id) => {}
                _ => return false,
            }
        }
        true
    }

    fn matches(&self, event: &Event, containers: &HashMap<String, HashSet<String>>) -> bool {
        if !self.in_scope(event) {
            return false;
        }
        if self.matchers.is_empty() {
            return true;
        }
        match self.condition {
            Condition::All => self.matchers.iter().all(|m| m.matches(event, containers)),
            Condition::Any => self.matchers.iter().any(|m| m.matches(event, containers)),
        }
    }
}

// ============================================================================
// ENGINE
// ============================================================================

#[derive(Default)]
pub struct RuleEngine {
    rules: Vec<CompiledRule>,
    names: HashSet<String>,
    containers: HashMap<String, HashSet<String>>,
    show_actions: bool,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    fn load_file(&mut self, path: &Path) -> Result<(), EngineError> {
        let content = std::fs::read_to_string(path)?;
        let file = path.display().to_string();

        for (i, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let def: RuleDefinition = serde_json::from_str(line).map_err(|e| EngineError::Parse {
                file: file.clone(),
                line: i + 1,
                message: e.to_string(),
            })?;
            self.add_rule(def.compile()?)?;
        }
        Ok(())
    }
}

impl DetectionEngine for RuleEngine {
    fn set_show_actions(&mut self, show: bool) {
        self.show_actions = show;
    }

    fn add_rule(&mut self, rule: CompiledRule) -> Result<(), EngineError> {
        if let Some(missing) = rule.containers().find(|c| !self.containers.contains_key(*c)) {
            return Err(EngineError::UnknownContainer(missing.to_string()));
        }
        if !self.names.insert(rule.name.clone()) {
            return Err(EngineError::DuplicateRule(rule.name));
        }
        self.rules.push(rule);
        Ok(())
    }

    fn load_directory(&mut self, dir: &Path) -> Result<(), EngineError> {
        let mut files: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().map_or(false, |ext| ext == RULES_EXT))
            .collect();
        files.sort();

        for file in files {
            self.load_file(&file)?;
        }
        Ok(())
    }

    fn load_container(&mut self, name: &str, reader: &mut dyn BufRead) -> Result<(), EngineError> {
        let mut entries = HashSet::new();
        for line in reader.lines() {
            let line = line?;
            let entry = line.trim();
            if !entry.is_empty() {
                entries.insert(entry.to_lowercase());
            }
        }
        self.containers.insert(name.to_string(), entries);
        Ok(())
    }

    fn count(&self) -> usize {
        self.rules.len()
    }

    fn match_or_filter(&self, event: &mut Event) -> MatchResult {
        let mut result = MatchResult::default();
        let mut actions: Vec<String> = Vec::new();

        for rule in self.rules.iter().filter(|r| r.matches(event, &self.containers)) {
            if rule.filter {
                result.filtered = true;
                continue;
            }
            result.names.push(rule.name.clone());
            result.criticality = result.criticality.max(rule.criticality);
            for action in &rule.actions {
                if !actions.contains(action) {
                    actions.push(action.clone());
                }
            }
        }

        if !result.names.is_empty() {
            let mut info = json!({
                "Signature": result.names,
                "Criticality": result.criticality,
            });
            if self.show_actions {
                info["Actions"] = json!(actions);
            }
            event.set(paths::DETECTION, info);
        } else if result.filtered {
            event.set(paths::DETECTION, json!({ "Filtered": true }));
        }

        result
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::config::SYSMON_CHANNEL;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn process_event(image: &str) -> Event {
        Event::from_value(json!({
            "Event": {
                "System": { "Channel": SYSMON_CHANNEL, "EventID": 1 },
                "EventData": { "Image": image, "ProcessGuid": "{G}" }
            }
        }))
        .unwrap()
    }

    fn write_rules(dir: &Path, lines: &[&str]) {
        std::fs::write(dir.join("database.rules"), lines.join("\n")).unwrap();
    }

    #[test]
    fn test_load_directory_and_match() {
        let temp_dir = TempDir::new().unwrap();
        write_rules(
            temp_dir.path(),
            &[
                "# comment",
                r#"{"name":"SuspiciousTool","criticality":8,"actions":["kill"],"event_ids":[1],"matches":[{"field":"Event/EventData/Image","op":"contains","value":"mimikatz"}]}"#,
                r#"{"name":"LowNoise","criticality":2,"matches":[{"field":"Event/EventData/Image","op":"regex","value":"(?i)\\\\temp\\\\"}]}"#,
            ],
        );

        let mut engine = RuleEngine::new();
        engine.set_show_actions(true);
        engine.load_directory(temp_dir.path()).unwrap();
        assert_eq!(engine.count(), 2);

        let mut event = process_event("C:\\Temp\\Mimikatz.exe");
        let result = engine.match_or_filter(&mut event);
        assert_eq!(result.names, vec!["SuspiciousTool", "LowNoise"]);
        assert_eq!(result.criticality, 8);
        assert!(!result.filtered);
        assert_eq!(event.get_i64(paths::DETECTION_CRITICALITY), Some(8));
        assert_eq!(event.get(paths::DETECTION_ACTIONS), Some(&json!(["kill"])));

        let mut clean = process_event("C:\\Windows\\notepad.exe");
        assert!(!engine.match_or_filter(&mut clean).is_match());
        assert!(clean.get(paths::DETECTION).is_none());
    }

    #[test]
    fn test_filter_rule() {
        let mut engine = RuleEngine::new();
        let def: RuleDefinition = serde_json::from_str(
            r#"{"name":"AuditNotepad","filter":true,"matches":[{"field":"Event/EventData/Image","op":"iequals","value":"c:\\windows\\notepad.exe"}]}"#,
        )
        .unwrap();
        engine.add_rule(def.compile().unwrap()).unwrap();

        let mut event = process_event("C:\\Windows\\Notepad.exe");
        let result = engine.match_or_filter(&mut event);
        assert!(result.filtered);
        assert!(result.names.is_empty());
        assert_eq!(event.get(paths::DETECTION), Some(&json!({ "Filtered": true })));
    }

    #[test]
    fn test_container_required_before_rule() {
        let def: RuleDefinition = serde_json::from_str(
            r#"{"name":"BadDomain","criticality":9,"matches":[{"field":"Event/EventData/QueryName","op":"in_container","value":"blacklist"}]}"#,
        )
        .unwrap();

        let mut engine = RuleEngine::new();
        assert!(matches!(
            engine.add_rule(def.compile().unwrap()),
            Err(EngineError::UnknownContainer(_))
        ));

        engine
            .load_container("blacklist", &mut Cursor::new("Evil.com\n\nbad.org\n"))
            .unwrap();
        engine.add_rule(def.compile().unwrap()).unwrap();

        let mut event = Event::from_value(json!({
            "Event": {
                "System": { "Channel": SYSMON_CHANNEL, "EventID": 22 },
                "EventData": { "QueryName": "EVIL.com" }
            }
        }))
        .unwrap();
        assert_eq!(engine.match_or_filter(&mut event).criticality, 9);
    }

    #[test]
    fn test_invalid_rules_fail_load() {
        let temp_dir = TempDir::new().unwrap();
        write_rules(temp_dir.path(), &["{not json"]);
        let mut engine = RuleEngine::new();
        assert!(matches!(
            engine.load_directory(temp_dir.path()),
            Err(EngineError::Parse { line: 1, .. })
        ));

        let bad_regex = RuleDefinition {
            name: "Broken".to_string(),
            criticality: 1,
            filter: false,
            actions: vec![],
            channels: vec![],
            event_ids: vec![],
            matches: vec![FieldMatch {
                field: "Event/EventData/Image".to_string(),
                op: MatchOp::Regex,
                value: "(".to_string(),
                negate: false,
            }],
            condition: Condition::All,
        };
        assert!(matches!(bad_regex.compile(), Err(EngineError::InvalidRegex { .. })));
    }

    #[test]
    fn test_duplicate_rule_rejected() {
        let def: RuleDefinition = serde_json::from_str(r#"{"name":"Dup"}"#).unwrap();
        let mut engine = RuleEngine::new();
        engine.add_rule(def.compile().unwrap()).unwrap();
        assert!(matches!(
            engine.add_rule(def.compile().unwrap()),
            Err(EngineError::DuplicateRule(_))
        ));
    }
}
