//! Canary Files
//!
//! Tripwire files dropped in configured directories. Two built-in rules fire
//! when they are touched: one on Sysmon file creation telemetry, one on
//! Security object access auditing.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::logic::config::{SECURITY_CHANNEL, SYSMON_CHANNEL};
use crate::logic::engine::rules::{Condition, FieldMatch, MatchOp};
use crate::logic::engine::RuleDefinition;
use crate::logic::event::paths;

pub const CANARY_RULE_NAME: &str = "Canary";
pub const CANARY_FS_RULE_NAME: &str = "CanaryFS";

const CANARY_CRITICALITY: i64 = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Canary {
    pub directories: Vec<PathBuf>,
    pub files: Vec<String>,
    /// Remove the files when the agent stops
    pub delete: bool,
}

impl Canary {
    pub fn paths(&self) -> impl Iterator<Item = PathBuf> + '_ {
        self.directories
            .iter()
            .flat_map(move |dir| self.files.iter().map(move |f| dir.join(f)))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CanariesConfig {
    pub enable: bool,
    pub canaries: Vec<Canary>,
    /// Actions attached to canary detections
    pub actions: Vec<String>,
    /// Images allowed to touch canary files
    pub whitelist: Vec<String>,
}

impl CanariesConfig {
    pub fn paths(&self) -> Vec<PathBuf> {
        self.canaries.iter().flat_map(|c| c.paths()).collect()
    }

    /// Create the canary files that do not exist yet
    pub fn configure(&self) {
        if !self.enable {
            return;
        }
        for path in self.paths() {
            if path.exists() {
                continue;
            }
            let result = path
                .parent()
                .map_or(Ok(()), fs::create_dir_all)
                .and_then(|_| fs::write(&path, canary_content()));
            match result {
                Ok(()) => log::info!("Canary file created: {}", path.display()),
                Err(e) => log::error!("Failed to create canary {}: {}", path.display(), e),
            }
        }
    }

    /// Remove canary files marked for deletion
    pub fn clean(&self) {
        if !self.enable {
            return;
        }
        for canary in self.canaries.iter().filter(|c| c.delete) {
            for path in canary.paths() {
                if let Err(e) = fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        log::error!("Failed to remove canary {}: {}", path.display(), e);
                    }
                }
            }
        }
    }

    fn path_regex(&self) -> String {
        let alternatives: Vec<String> = self
            .paths()
            .iter()
            .map(|p| regex::escape(&p.to_string_lossy()))
            .collect();
        format!("(?i)^({})$", alternatives.join("|"))
    }

    fn rule(&self, name: &str, channel: &str, event_id: i64, field: &str) -> RuleDefinition {
        let mut matches = vec![FieldMatch {
            field: field.to_string(),
            op: MatchOp::Regex,
            value: self.path_regex(),
            negate: false,
        }];
        matches.extend(self.whitelist.iter().map(|image| FieldMatch {
            field: paths::IMAGE.to_string(),
            op: MatchOp::Iequals,
            value: image.clone(),
            negate: true,
        }));

        RuleDefinition {
            name: name.to_string(),
            criticality: CANARY_CRITICALITY,
            filter: false,
            actions: self.actions.clone(),
            channels: vec![channel.to_string()],
            event_ids: vec![event_id],
            matches,
            condition: Condition::All,
        }
    }

    /// Rule on Sysmon file creation telemetry
    pub fn gen_rule_generic(&self) -> RuleDefinition {
        self.rule(
            CANARY_RULE_NAME,
            SYSMON_CHANNEL,
            paths::ID_FILE_CREATE,
            "Event/EventData/TargetFilename",
        )
    }

    /// Rule on Security object access auditing
    pub fn gen_rule_fs_audit(&self) -> RuleDefinition {
        self.rule(
            CANARY_FS_RULE_NAME,
            SECURITY_CHANNEL,
            paths::ID_OBJECT_ACCESS,
            "Event/EventData/ObjectName",
        )
    }
}

fn canary_content() -> String {
    format!("{}\n", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::engine::{DetectionEngine, RuleEngine};
    use crate::logic::event::Event;
    use serde_json::json;
    use tempfile::TempDir;

    fn config(dir: PathBuf) -> CanariesConfig {
        CanariesConfig {
            enable: true,
            canaries: vec![Canary {
                directories: vec![dir],
                files: vec!["passwords.xlsx".to_string()],
                delete: true,
            }],
            actions: vec!["kill".to_string()],
            whitelist: vec!["C:\\Windows\\explorer.exe".to_string()],
        }
    }

    #[test]
    fn test_configure_and_clean() {
        let temp_dir = TempDir::new().unwrap();
        let canaries = config(temp_dir.path().join("docs"));

        canaries.configure();
        let path = canaries.paths()[0].clone();
        assert!(path.exists());

        canaries.clean();
        assert!(!path.exists());
    }

    #[test]
    fn test_generic_rule_fires_on_canary() {
        let temp_dir = TempDir::new().unwrap();
        let canaries = config(temp_dir.path().to_path_buf());
        let target = canaries.paths()[0].to_string_lossy().to_string();

        let mut engine = RuleEngine::new();
        engine.add_rule(canaries.gen_rule_generic().compile().unwrap()).unwrap();
        engine.add_rule(canaries.gen_rule_fs_audit().compile().unwrap()).unwrap();
        assert_eq!(engine.count(), 2);

        let file_create = |image: &str| {
            Event::from_value(json!({
                "Event": {
                    "System": { "Channel": SYSMON_CHANNEL, "EventID": 11 },
                    "EventData": { "TargetFilename": target, "Image": image }
                }
            }))
            .unwrap()
        };

        let mut hit = file_create("C:\\Temp\\ransom.exe");
        let result = engine.match_or_filter(&mut hit);
        assert_eq!(result.names, vec![CANARY_RULE_NAME]);
        assert_eq!(result.criticality, CANARY_CRITICALITY);

        let mut allowed = file_create("C:\\Windows\\Explorer.exe");
        assert!(!engine.match_or_filter(&mut allowed).is_match());
    }
}
