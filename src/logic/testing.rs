//! Test doubles shared by the unit test suites

use std::collections::{BTreeMap, VecDeque};
use std::io::{BufRead, Read};
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::logic::commands::Command;
use crate::logic::engine::{CompiledRule, DetectionEngine, EngineError, EngineFactory, MatchResult};
use crate::logic::event::Event;
use crate::logic::forwarder::EventSink;
use crate::logic::integrity;
use crate::logic::manager::{FileUpload, ManagerClient, ManagerError};

// ============================================================================
// MANAGER
// ============================================================================

#[derive(Default)]
pub struct MockManager {
    pub rules: Mutex<String>,
    pub rules_digest: Mutex<String>,
    /// name -> (claimed digest, lines)
    pub containers: Mutex<BTreeMap<String, (String, Vec<String>)>>,
    pub commands: Mutex<VecDeque<Command>>,
    pub posted_commands: Mutex<Vec<Command>>,
    pub dumps: Mutex<Vec<FileUpload>>,
    pub logs: Mutex<Vec<String>>,
    pub fail_dumps: AtomicBool,
    pub ip: Option<IpAddr>,
    calls: Mutex<Vec<String>>,
}

impl MockManager {
    pub fn new() -> Self {
        Self {
            ip: Some("10.0.0.1".parse().unwrap()),
            ..Default::default()
        }
    }

    /// Serve rules with a correct digest
    pub fn with_rules(self, content: &str) -> Self {
        let digest = integrity::sha256_hex(content.as_bytes());
        self.with_rules_claiming(content, &digest)
    }

    /// Serve rules with an arbitrary claimed digest
    pub fn with_rules_claiming(self, content: &str, digest: &str) -> Self {
        *self.rules.lock() = content.to_string();
        *self.rules_digest.lock() = digest.to_string();
        self
    }

    pub fn with_container(self, name: &str, lines: &[&str], claimed: Option<&str>) -> Self {
        let lines: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
        let digest = claimed
            .map(str::to_string)
            .unwrap_or_else(|| integrity::sha256_lines(&lines));
        self.containers.lock().insert(name.to_string(), (digest, lines));
        self
    }

    pub fn calls_to(&self, name: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == name).count()
    }

    fn call(&self, name: &str) {
        self.calls.lock().push(name.to_string());
    }
}

impl ManagerClient for MockManager {
    fn is_local(&self) -> bool {
        false
    }

    fn manager_ip(&self) -> Option<IpAddr> {
        self.ip
    }

    fn rules_sha256(&self) -> Result<String, ManagerError> {
        self.call("rules_sha256");
        Ok(self.rules_digest.lock().clone())
    }

    fn rules(&self) -> Result<String, ManagerError> {
        self.call("rules");
        Ok(self.rules.lock().clone())
    }

    fn containers_list(&self) -> Result<Vec<String>, ManagerError> {
        self.call("containers_list");
        Ok(self.containers.lock().keys().cloned().collect())
    }

    fn container_sha256(&self, name: &str) -> Result<String, ManagerError> {
        self.call("container_sha256");
        self.containers
            .lock()
            .get(name)
            .map(|(digest, _)| digest.clone())
            .ok_or(ManagerError::ServerError(404))
    }

    fn container(&self, name: &str) -> Result<Vec<String>, ManagerError> {
        self.call("container");
        self.containers
            .lock()
            .get(name)
            .map(|(_, lines)| lines.clone())
            .ok_or(ManagerError::ServerError(404))
    }

    fn fetch_command(&self) -> Result<Option<Command>, ManagerError> {
        self.call("fetch_command");
        Ok(self.commands.lock().pop_front())
    }

    fn post_command(&self, command: &Command) -> Result<(), ManagerError> {
        self.posted_commands.lock().push(command.clone());
        Ok(())
    }

    fn post_dump(&self, upload: &FileUpload) -> Result<(), ManagerError> {
        if self.fail_dumps.load(Ordering::SeqCst) {
            return Err(ManagerError::ServerError(500));
        }
        self.dumps.lock().push(upload.clone());
        Ok(())
    }

    fn post_logs(&self, events: &[String]) -> Result<(), ManagerError> {
        self.logs.lock().extend(events.iter().cloned());
        Ok(())
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// Engine recording the order of load calls.
/// Each non-empty line of a rule file counts as one rule.
pub struct RecordingEngine {
    journal: Arc<Mutex<Vec<String>>>,
    fail_rules: Arc<AtomicBool>,
    rules: usize,
}

impl DetectionEngine for RecordingEngine {
    fn set_show_actions(&mut self, _show: bool) {}

    fn add_rule(&mut self, rule: CompiledRule) -> Result<(), EngineError> {
        self.journal.lock().push(format!("add_rule:{}", rule.name));
        self.rules += 1;
        Ok(())
    }

    fn load_directory(&mut self, dir: &Path) -> Result<(), EngineError> {
        self.journal.lock().push("load_directory".to_string());
        if self.fail_rules.load(Ordering::SeqCst) {
            return Err(EngineError::Io("rules unavailable".to_string()));
        }
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |e| e == "rules") {
                let content = std::fs::read_to_string(&path)?;
                self.rules += content.lines().filter(|l| !l.trim().is_empty()).count();
            }
        }
        Ok(())
    }

    fn load_container(&mut self, name: &str, reader: &mut dyn BufRead) -> Result<(), EngineError> {
        let mut content = String::new();
        reader.read_to_string(&mut content)?;
        self.journal.lock().push(format!("load_container:{}", name));
        Ok(())
    }

    fn count(&self) -> usize {
        self.rules
    }

    fn match_or_filter(&self, _event: &mut Event) -> MatchResult {
        MatchResult::default()
    }
}

pub struct RecordingFactory {
    pub journal: Arc<Mutex<Vec<String>>>,
    pub fail_rules: Arc<AtomicBool>,
}

impl RecordingFactory {
    pub fn new() -> Self {
        Self {
            journal: Arc::new(Mutex::new(Vec::new())),
            fail_rules: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn factory(&self) -> EngineFactory {
        let journal = self.journal.clone();
        let fail_rules = self.fail_rules.clone();
        Arc::new(move || {
            Box::new(RecordingEngine {
                journal: journal.clone(),
                fail_rules: fail_rules.clone(),
                rules: 0,
            }) as Box<dyn DetectionEngine>
        })
    }
}

// ============================================================================
// SINK
// ============================================================================

/// Event sink keeping everything in memory
#[derive(Clone, Default)]
pub struct MemorySink {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl EventSink for MemorySink {
    fn write_batch(&mut self, batch: &[String]) -> std::io::Result<()> {
        self.events.lock().extend(batch.iter().cloned());
        Ok(())
    }
}
