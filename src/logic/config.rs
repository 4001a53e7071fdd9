//! Agent Configuration
//!
//! TOML configuration loaded at startup. Every section has defaults so a
//! minimal file (or none at all) yields a working standalone agent.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::logic::audit::AuditConfig;
use crate::logic::canary::CanariesConfig;
use crate::logic::commands::report::ReportConfig;

// ============================================================================
// CHANNELS
// ============================================================================

pub const SYSMON_CHANNEL: &str = "Microsoft-Windows-Sysmon/Operational";
pub const SECURITY_CHANNEL: &str = "Security";
pub const POWERSHELL_CHANNEL: &str = "Microsoft-Windows-PowerShell/Operational";
pub const DEFENDER_CHANNEL: &str = "Microsoft-Windows-Windows Defender/Operational";

/// Resolve a channel alias to the concrete channel names it stands for
pub fn expand_channel_alias(alias: &str) -> Vec<String> {
    match alias.to_lowercase().as_str() {
        "sysmon" => vec![SYSMON_CHANNEL.to_string()],
        "security" => vec![SECURITY_CHANNEL.to_string()],
        "ps" => vec![POWERSHELL_CHANNEL.to_string()],
        "defender" => vec![DEFENDER_CHANNEL.to_string()],
        "all" => vec![
            SYSMON_CHANNEL.to_string(),
            SECURITY_CHANNEL.to_string(),
            POWERSHELL_CHANNEL.to_string(),
            DEFENDER_CHANNEL.to_string(),
        ],
        _ => vec![alias.to_string()],
    }
}

/// Expand every alias, dropping duplicates while keeping order
pub fn expand_channels(channels: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    channels
        .iter()
        .flat_map(|c| expand_channel_alias(c))
        .filter(|c| seen.insert(c.clone()))
        .collect()
}

// ============================================================================
// SECTIONS
// ============================================================================

/// Manager connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub url: String,
    pub key: String,
    /// Address allowed through containment; resolved from `url` when empty
    pub ip: String,
    pub timeout_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            url: constants::get_manager_url(),
            key: constants::get_manager_key(),
            ip: String::new(),
            timeout_secs: 30,
        }
    }
}

/// Local alert log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    /// Rotate the JSONL file once it grows past this many bytes
    pub rotation_size: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: constants::data_dir().join("logs"),
            rotation_size: 50 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Never talk to a manager
    pub local: bool,
    pub manager: ManagerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SysmonConfig {
    pub archive_directory: Option<PathBuf>,
    pub clean_archived: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DumpConfig {
    /// Comma separated list of: file, registry, memory, all
    pub mode: String,
    pub dir: PathBuf,
    /// Minimum criticality triggering a dump
    pub threshold: i64,
    /// Maximum dumps per process
    pub max_dumps: u32,
    pub compression: bool,
    pub dump_untracked: bool,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            mode: String::new(),
            dir: constants::data_dir().join("dumps"),
            threshold: 8,
            max_dumps: 4,
            compression: true,
            dump_untracked: false,
        }
    }
}

impl DumpConfig {
    fn modes(&self) -> impl Iterator<Item = String> + '_ {
        self.mode
            .split(',')
            .map(|m| m.trim().to_lowercase())
            .filter(|m| !m.is_empty())
    }

    pub fn is_mode_enabled(&self, mode: &str) -> bool {
        let mode = mode.to_lowercase();
        self.modes().any(|m| m == "all" || m == mode)
    }

    pub fn is_any_mode_enabled(&self) -> bool {
        self.modes().next().is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    pub rules_db: PathBuf,
    pub containers_db: PathBuf,
    /// Engine refresh interval in seconds, 0 disables the refresh loop
    pub update_interval_secs: u64,
}

impl Default for RulesConfig {
    fn default() -> Self {
        let base = constants::data_dir().join("database");
        Self {
            rules_db: base.join("rules"),
            containers_db: base.join("containers"),
            update_interval_secs: 60,
        }
    }
}

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub channels: Vec<String>,
    pub criticality_threshold: i64,
    pub enable_hooks: bool,
    pub enable_filtering: bool,
    pub logfile: Option<PathBuf>,
    /// Forward every event whatever its score
    pub log_all: bool,
    /// Endpoint mode enables response hooks (dumps)
    pub endpoint: bool,
    pub forwarder: ForwarderConfig,
    pub sysmon: SysmonConfig,
    pub dump: DumpConfig,
    pub report: ReportConfig,
    pub rules: RulesConfig,
    pub audit: AuditConfig,
    pub canaries: CanariesConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            channels: vec!["all".to_string()],
            criticality_threshold: 5,
            enable_hooks: true,
            enable_filtering: true,
            logfile: None,
            log_all: false,
            endpoint: true,
            forwarder: ForwarderConfig::default(),
            sysmon: SysmonConfig::default(),
            dump: DumpConfig::default(),
            report: ReportConfig::default(),
            rules: RulesConfig::default(),
            audit: AuditConfig::default(),
            canaries: CanariesConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Forwarding is enabled when a manager URL is set and local mode is off
    pub fn is_forwarding_enabled(&self) -> bool {
        !self.forwarder.local && !self.forwarder.manager.url.is_empty()
    }

    pub fn is_dump_enabled(&self) -> bool {
        self.dump.is_any_mode_enabled()
    }

    /// Create the working directories the agent writes to
    pub fn prepare(&self) -> Result<(), ConfigError> {
        let mut dirs = vec![
            self.rules.rules_db.clone(),
            self.rules.containers_db.clone(),
            self.forwarder.logging.dir.clone(),
        ];
        if self.is_dump_enabled() {
            dirs.push(self.dump.dir.clone());
        }
        for dir in dirs {
            std::fs::create_dir_all(&dir).map_err(|e| ConfigError::Io(dir.clone(), e))?;
        }
        Ok(())
    }

    /// Sanity checks performed before the agent starts
    pub fn verify(&self) -> Result<(), ConfigError> {
        for (name, path) in [
            ("rules_db", &self.rules.rules_db),
            ("containers_db", &self.rules.containers_db),
        ] {
            if !path.is_dir() {
                return Err(ConfigError::NotADirectory(name, path.clone()));
            }
        }
        if self.sysmon.clean_archived && self.sysmon.archive_directory.is_none() {
            return Err(ConfigError::Invalid(
                "clean_archived requires sysmon.archive_directory".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(String),
    NotADirectory(&'static str, PathBuf),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Config I/O error on {}: {}", path.display(), e),
            ConfigError::Parse(msg) => write!(f, "Config parse error: {}", msg),
            ConfigError::NotADirectory(name, path) => {
                write!(f, "{} must be a directory: {}", name, path.display())
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// TESTS
// ============================================================================
