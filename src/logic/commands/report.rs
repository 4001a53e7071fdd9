//! Forensic Report
//!
//! On-demand snapshot of tracked processes, loaded drivers and the output
//! of a configurable list of commands. Assembled synchronously and returned
//! whole.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Command;
use crate::logic::tracker::{ActivityTracker, DriverInfo, ProcessTrack};

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OSQueryConfig {
    pub bin: PathBuf,
    /// Tables dumped in full into reports
    pub tables: Vec<String>,
}

impl Default for OSQueryConfig {
    fn default() -> Self {
        Self {
            bin: PathBuf::from(r"C:\Program Files\osquery\osqueryi.exe"),
            tables: Vec::new(),
        }
    }
}

impl OSQueryConfig {
    pub fn is_available(&self) -> bool {
        self.bin.is_file()
    }

    /// Arguments selecting a whole table with JSON output
    pub fn table_args(table: &str) -> Vec<String> {
        vec!["--json".to_string(), "-A".to_string(), table.to_string()]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportCommand {
    #[serde(default)]
    pub description: String,
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub expect_json: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub osquery: OSQueryConfig,
    pub commands: Vec<ReportCommand>,
}

impl ReportConfig {
    /// Commands run for every full report
    pub fn prepare_commands(&self) -> Vec<Command> {
        let mut commands: Vec<Command> = self
            .commands
            .iter()
            .map(|rc| {
                let args: Vec<&str> = rc.args.iter().map(String::as_str).collect();
                let mut cmd = Command::new(&rc.name, &args);
                cmd.expect_json = rc.expect_json;
                cmd
            })
            .collect();

        if self.osquery.is_available() {
            let bin = self.osquery.bin.to_string_lossy();
            for table in &self.osquery.tables {
                let mut cmd = Command::new("osquery", &[]);
                cmd.from_exec(&bin, OSQueryConfig::table_args(table));
                cmd.expect_json = true;
                commands.push(cmd);
            }
        } else if !self.osquery.tables.is_empty() {
            log::warn!(
                "OSQuery binary {} not found, skipping {} report tables",
                self.osquery.bin.display(),
                self.osquery.tables.len()
            );
        }

        commands
    }
}

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
    pub processes: HashMap<String, ProcessTrack>,
    pub drivers: Vec<DriverInfo>,
    pub commands: Vec<Command>,
}

impl Report {
    /// Snapshot the tracker and, unless `light`, run the configured commands.
    /// Command failures end up in each command's own error field.
    pub fn assemble(tracker: &ActivityTracker, config: &ReportConfig, light: bool) -> Self {
        let start_time = Utc::now();
        let processes = tracker.ps();
        let drivers = tracker.drivers().to_vec();

        let mut commands = Vec::new();
        if !light {
            commands = config.prepare_commands();
            for cmd in commands.iter_mut() {
                if let Err(e) = cmd.run() {
                    log::error!("Report command \"{}\" failed: {}", cmd, e);
                }
            }
        }

        Self {
            start_time,
            stop_time: Utc::now(),
            processes,
            drivers,
            commands,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_commands_without_osquery() {
        let config = ReportConfig {
            osquery: OSQueryConfig {
                bin: PathBuf::from("/nonexistent/osqueryi"),
                tables: vec!["processes".to_string()],
            },
            commands: vec![ReportCommand {
                description: "network".to_string(),
                name: "netstat".to_string(),
                args: vec!["-an".to_string()],
                expect_json: false,
            }],
        };
        let commands = config.prepare_commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].to_string(), "netstat -an");
    }

    #[test]
    fn test_prepare_commands_with_osquery() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let bin = temp_dir.path().join("osqueryi");
        std::fs::write(&bin, b"").unwrap();

        let config = ReportConfig {
            osquery: OSQueryConfig {
                bin: bin.clone(),
                tables: vec!["users".to_string()],
            },
            commands: Vec::new(),
        };
        let commands = config.prepare_commands();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].expect_json);
        assert_eq!(commands[0].args, vec!["--json", "-A", "users"]);
    }

    #[test]
    fn test_light_report_runs_nothing() {
        let mut tracker = ActivityTracker::new();
        tracker.add(ProcessTrack {
            guid: "{A}".to_string(),
            pid: 10,
            ..Default::default()
        });
        let config = ReportConfig {
            commands: vec![ReportCommand {
                name: "definitely-not-a-binary-xyz".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let report = Report::assemble(&tracker, &config, true);
        assert!(report.commands.is_empty());
        assert!(report.processes.contains_key("{A}"));
        assert!(report.stop_time >= report.start_time);

        let full = Report::assemble(&tracker, &config, false);
        assert_eq!(full.commands.len(), 1);
        assert!(!full.commands[0].error.is_empty());
    }
}
