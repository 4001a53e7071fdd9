//! Rule & Container Synchronization
//!
//! Decides whether local rules and containers are stale relative to the
//! manager, fetches replacements and verifies them against the digest the
//! manager reports before anything touches disk.
//!
//! Layout:
//! - `<rules_db>/database.rules` + `database.rules.sha256`
//! - `<containers_db>/<name>.cont.zst` + `<name>.cont.zst.sha256`
//!
//! Container digests cover the uncompressed content (one entry per line).

use std::fs;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::constants::{CONTAINER_EXT, RULES_FILE};
use crate::logic::engine::{DetectionEngine, EngineError};
use crate::logic::integrity;
use crate::logic::manager::{ManagerClient, ManagerError};


// ============================================================================
// LAST ERROR ACCUMULATOR
// ============================================================================

/// Keeps going on failure and remembers the last error seen
#[derive(Debug)]
pub struct LastError<E> {
    last: Option<E>,
    failures: usize,
}

impl<E> Default for LastError<E> {
    fn default() -> Self {
        Self { last: None, failures: 0 }
    }
}

impl<E> LastError<E> {
    pub fn record(&mut self, e: E) {
        self.failures += 1;
        self.last = Some(e);
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn into_result(self) -> Result<(), E> {
        match self.last {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// ============================================================================
// RULE SYNC
// ============================================================================

pub struct RuleSync {
    client: Arc<dyn ManagerClient>,
    rules_db: PathBuf,
    containers_db: PathBuf,
}

impl RuleSync {
    pub fn new(client: Arc<dyn ManagerClient>, rules_db: PathBuf, containers_db: PathBuf) -> Self {
        Self { client, rules_db, containers_db }
    }

    pub fn rules_db(&self) -> &Path {
        &self.rules_db
    }

    pub fn rules_path(&self) -> PathBuf {
        self.rules_db.join(RULES_FILE)
    }

    pub fn container_path(&self, name: &str) -> PathBuf {
        self.containers_db.join(format!("{}{}", name, CONTAINER_EXT))
    }

    // ------------------------------------------------------------------------
    // Staleness
    // ------------------------------------------------------------------------

    /// Remote rules digest differs from the local one.
    /// Errors count as "no update" so a flaky manager never disrupts detection.
    pub fn needs_rules_update(&self) -> bool {
        if self.client.is_local() {
            return false;
        }
        match self.client.rules_sha256() {
            Ok(remote) => !integrity::digest_matches(&self.rules_path(), &remote),
            Err(e) => {
                log::debug!("Failed to get rules digest: {}", e);
                false
            }
        }
    }

    /// Any remote container digest differs from the local one
    pub fn needs_containers_update(&self) -> bool {
        if self.client.is_local() {
            return false;
        }
        let names = match self.client.containers_list() {
            Ok(names) => names,
            Err(e) => {
                log::debug!("Failed to list containers: {}", e);
                return false;
            }
        };
        names.iter().any(|name| match self.client.container_sha256(name) {
            Ok(remote) => !integrity::digest_matches(&self.container_path(name), &remote),
            Err(e) => {
                log::debug!("Failed to get digest of container {}: {}", name, e);
                false
            }
        })
    }

    // ------------------------------------------------------------------------
    // Fetch & verify
    // ------------------------------------------------------------------------

    pub fn fetch_rules(&self) -> Result<(), SyncError> {
        let remote = self.client.rules_sha256()?;
        let rules = self.client.rules()?;

        let computed = integrity::sha256_hex(rules.as_bytes());
        if !computed.eq_ignore_ascii_case(remote.trim()) {
            return Err(SyncError::Integrity {
                what: "rules".to_string(),
                expected: remote,
                computed,
            });
        }

        let path = self.rules_path();
        integrity::write_atomic(&path, rules.as_bytes())?;
        integrity::write_digest(&path, &computed)?;

        log::info!("Rules updated ({} bytes, sha256 {})", rules.len(), computed);
        Ok(())
    }

    /// Fetch every stale container; returns how many were replaced
    pub fn fetch_containers(&self) -> Result<usize, SyncError> {
        let mut updated = 0;

        for name in self.client.containers_list()? {
            validate_container_name(&name)?;

            let path = self.container_path(&name);
            let remote = self.client.container_sha256(&name)?;
            if integrity::digest_matches(&path, &remote) {
                continue;
            }

            let content = self.client.container(&name)?;
            let computed = integrity::sha256_lines(&content);
            if !computed.eq_ignore_ascii_case(remote.trim()) {
                return Err(SyncError::Integrity {
                    what: format!("container {}", name),
                    expected: remote,
                    computed,
                });
            }

            write_container(&path, &content)?;
            integrity::write_digest(&path, &computed)?;

            log::info!("Container {} updated ({} entries)", name, content.len());
            updated += 1;
        }

        Ok(updated)
    }

    // ------------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------------

    /// Load every persisted container into an engine.
    /// A broken container is skipped; the last failure is returned at the end.
    pub fn load_containers(&self, engine: &mut dyn DetectionEngine) -> LastError<SyncError> {
        let mut errors = LastError::default();

        let entries = match fs::read_dir(&self.containers_db) {
            Ok(entries) => entries,
            Err(e) => {
                errors.record(SyncError::Io(format!(
                    "{}: {}",
                    self.containers_db.display(),
                    e
                )));
                return errors;
            }
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.to_string_lossy().ends_with(CONTAINER_EXT))
            .collect();
        files.sort();

        for path in files {
            let Some(name) = container_name(&path) else { continue };
            if let Err(e) = load_container_file(engine, &name, &path) {
                log::error!("Failed to load container {}: {}", name, e);
                errors.record(e);
            }
        }

        errors
    }
}

/// Container name: file name up to the first dot
fn container_name(path: &Path) -> Option<String> {
    let file_name = path.file_name()?.to_string_lossy();
    let name = file_name.split('.').next()?;
    (!name.is_empty()).then(|| name.to_string())
}

fn validate_container_name(name: &str) -> Result<(), SyncError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SyncError::InvalidName(name.to_string()))
    }
}

fn load_container_file(engine: &mut dyn DetectionEngine, name: &str, path: &Path) -> Result<(), SyncError> {
    let file = fs::File::open(path)?;
    let decoder = zstd::stream::read::Decoder::new(file)?;
    let mut reader = BufReader::new(decoder);
    engine.load_container(name, &mut reader)?;
    Ok(())
}

/// Persist a container compressed, through a temporary file
fn write_container(path: &Path, lines: &[String]) -> Result<(), SyncError> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let file = fs::File::create(&tmp)?;
    let mut encoder = zstd::stream::write::Encoder::new(file, 3)?;
    for line in lines {
        encoder.write_all(line.as_bytes())?;
        encoder.write_all(b"\n")?;
    }
    encoder.finish()?.sync_all()?;

    fs::rename(&tmp, path)?;
    Ok(())
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug)]
pub enum SyncError {
    Manager(ManagerError),
    /// Content does not hash to the digest the manager claimed
    Integrity { what: String, expected: String, computed: String },
    InvalidName(String),
    Io(String),
    Engine(EngineError),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Manager(e) => write!(f, "Manager error: {}", e),
            SyncError::Integrity { what, expected, computed } => write!(
                f,
                "Integrity check failed for {}: expected {}, computed {}",
                what, expected, computed
            ),
            SyncError::InvalidName(name) => write!(f, "Invalid container name: {:?}", name),
            SyncError::Io(msg) => write!(f, "I/O error: {}", msg),
            SyncError::Engine(e) => write!(f, "Engine error: {}", e),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<ManagerError> for SyncError {
    fn from(e: ManagerError) -> Self {
        SyncError::Manager(e)
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Io(e.to_string())
    }
}

impl From<EngineError> for SyncError {
    fn from(e: EngineError) -> Self {
        SyncError::Engine(e)
    }
}
