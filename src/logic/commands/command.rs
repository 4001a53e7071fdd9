//! Manager Command
//!
//! Request/response unit exchanged with the manager. Handlers mutate the
//! command in place; `run` finalizes it, spawning a process only for
//! runnable commands.

use std::fmt;
use std::process::Command as ProcessCommand;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Command {
    pub uuid: String,
    pub name: String,
    pub args: Vec<String>,
    /// Captured output; structured when `expect_json` is set
    pub stdout: Value,
    pub stderr: String,
    pub error: String,
    pub expect_json: bool,
    /// Fully handled locally, no process to spawn
    pub unrunnable: bool,
    pub sent: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
}

impl Command {
    pub fn new(name: &str, args: &[&str]) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Mark as handled locally
    pub fn unrunnable(&mut self) {
        self.unrunnable = true;
    }

    /// Bind to an OS process invocation
    pub fn from_exec(&mut self, program: &str, args: Vec<String>) {
        self.name = program.to_string();
        self.args = args;
        self.unrunnable = false;
    }

    /// Store a handler result as JSON output or as the error string
    pub fn set_result<T: Serialize, E: fmt::Display>(&mut self, result: Result<T, E>) {
        match result.map(|v| serde_json::to_value(v)) {
            Ok(Ok(value)) => self.stdout = value,
            Ok(Err(e)) => self.error = e.to_string(),
            Err(e) => self.error = e.to_string(),
        }
    }

    pub fn set_error<E: fmt::Display>(&mut self, e: E) {
        self.error = e.to_string();
    }

    /// Execute runnable commands and stamp completion
    pub fn run(&mut self) -> Result<(), CommandError> {
        let result = if self.unrunnable {
            Ok(())
        } else {
            self.exec()
        };
        if let Err(e) = &result {
            if self.error.is_empty() {
                self.error = e.to_string();
            }
        }
        self.completed = Some(Utc::now());
        result
    }

    fn exec(&mut self) -> Result<(), CommandError> {
        let output = ProcessCommand::new(&self.name)
            .args(&self.args)
            .output()
            .map_err(|e| CommandError::Spawn {
                command: self.to_string(),
                message: e.to_string(),
            })?;

        self.stderr = String::from_utf8_lossy(&output.stderr).to_string();
        self.stdout = if self.expect_json {
            serde_json::from_slice(&output.stdout).map_err(|e| CommandError::Output {
                command: self.to_string(),
                message: e.to_string(),
            })?
        } else {
            Value::String(String::from_utf8_lossy(&output.stdout).to_string())
        };

        if output.status.success() {
            Ok(())
        } else {
            Err(CommandError::Failed {
                command: self.to_string(),
                exit_code: output.status.code().unwrap_or(-1),
                stderr: self.stderr.clone(),
            })
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug)]
pub enum CommandError {
    Spawn { command: String, message: String },
    Output { command: String, message: String },
    Failed { command: String, exit_code: i32, stderr: String },
    ProcessNotFound { pid: u32 },
    KillFailed { pid: u32 },
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Spawn { command, message } => {
                write!(f, "Failed to start '{}': {}", command, message)
            }
            CommandError::Output { command, message } => {
                write!(f, "Unexpected output from '{}': {}", command, message)
            }
            CommandError::Failed { command, exit_code, stderr } => {
                write!(f, "Command '{}' failed ({}): {}", command, exit_code, stderr)
            }
            CommandError::ProcessNotFound { pid } => write!(f, "Process {} not found", pid),
            CommandError::KillFailed { pid } => write!(f, "Failed to kill process {}", pid),
        }
    }
}

impl std::error::Error for CommandError {}
