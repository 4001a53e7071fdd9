//! Manager Client
//!
//! Contract used to exchange rules, containers, commands, dumps and alert
//! logs with the remote manager. A local (standalone) client disables all
//! remote operations.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::logic::commands::Command;

pub mod http;

pub use http::HttpManagerClient;

// ============================================================================
// TYPES
// ============================================================================

/// A dump file ready to be posted
#[derive(Debug, Clone, PartialEq)]
pub struct FileUpload {
    pub path: PathBuf,
    pub guid: String,
    pub event_hash: String,
    pub filename: String,
    pub content: Vec<u8>,
}

impl FileUpload {
    pub fn prepare(path: &Path, guid: &str, event_hash: &str, filename: &str) -> Result<Self, ManagerError> {
        let content = std::fs::read(path).map_err(|e| ManagerError::Io(e.to_string()))?;
        Ok(Self {
            path: path.to_path_buf(),
            guid: guid.to_string(),
            event_hash: event_hash.to_string(),
            filename: filename.to_string(),
            content,
        })
    }
}

pub trait ManagerClient: Send + Sync {
    /// Standalone agent, no manager to talk to
    fn is_local(&self) -> bool;

    /// Address left reachable by network containment
    fn manager_ip(&self) -> Option<IpAddr>;

    fn rules_sha256(&self) -> Result<String, ManagerError>;
    fn rules(&self) -> Result<String, ManagerError>;

    fn containers_list(&self) -> Result<Vec<String>, ManagerError>;
    fn container_sha256(&self, name: &str) -> Result<String, ManagerError>;
    fn container(&self, name: &str) -> Result<Vec<String>, ManagerError>;

    /// `Ok(None)` when the manager has nothing queued
    fn fetch_command(&self) -> Result<Option<Command>, ManagerError>;
    fn post_command(&self, command: &Command) -> Result<(), ManagerError>;

    fn prepare_file_upload(
        &self,
        path: &Path,
        guid: &str,
        event_hash: &str,
        filename: &str,
    ) -> Result<FileUpload, ManagerError> {
        FileUpload::prepare(path, guid, event_hash, filename)
    }

    fn post_dump(&self, upload: &FileUpload) -> Result<(), ManagerError>;

    /// Post a batch of serialized events
    fn post_logs(&self, events: &[String]) -> Result<(), ManagerError>;
}

// ============================================================================
// LOCAL CLIENT
// ============================================================================

/// Client of a standalone agent
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalClient;

impl ManagerClient for LocalClient {
    fn is_local(&self) -> bool {
        true
    }

    fn manager_ip(&self) -> Option<IpAddr> {
        None
    }

    fn rules_sha256(&self) -> Result<String, ManagerError> {
        Err(ManagerError::NotConfigured)
    }

    fn rules(&self) -> Result<String, ManagerError> {
        Err(ManagerError::NotConfigured)
    }

    fn containers_list(&self) -> Result<Vec<String>, ManagerError> {
        Err(ManagerError::NotConfigured)
    }

    fn container_sha256(&self, _name: &str) -> Result<String, ManagerError> {
        Err(ManagerError::NotConfigured)
    }

    fn container(&self, _name: &str) -> Result<Vec<String>, ManagerError> {
        Err(ManagerError::NotConfigured)
    }

    fn fetch_command(&self) -> Result<Option<Command>, ManagerError> {
        Err(ManagerError::NotConfigured)
    }

    fn post_command(&self, _command: &Command) -> Result<(), ManagerError> {
        Err(ManagerError::NotConfigured)
    }

    fn post_dump(&self, _upload: &FileUpload) -> Result<(), ManagerError> {
        Err(ManagerError::NotConfigured)
    }

    fn post_logs(&self, _events: &[String]) -> Result<(), ManagerError> {
        Err(ManagerError::NotConfigured)
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ManagerError {
    NotConfigured,
    NetworkError(String),
    ServerError(u16),
    ParseError(String),
    Io(String),
}

impl std::fmt::Display for ManagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagerError::NotConfigured => write!(f, "Manager not configured"),
            ManagerError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            ManagerError::ServerError(code) => write!(f, "Server error: {}", code),
            ManagerError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            ManagerError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for ManagerError {}
