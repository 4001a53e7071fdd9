//! Central Configuration Constants
//!
//! Single source of truth for configuration defaults and on-disk layout.
//! Environment variables override the manager connection settings.

use std::path::PathBuf;
use std::time::Duration;

/// Default manager URL (empty means standalone)
pub const DEFAULT_MANAGER_URL: &str = "";

/// Default config file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "hids-agent.toml";

/// App version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// App name
pub const APP_NAME: &str = "hids-agent";

// ============================================
// Persisted state layout
// ============================================

/// Primary rule file inside the rules directory
pub const RULES_FILE: &str = "database.rules";

/// Extension of rule files loaded from the rules directory
pub const RULES_EXT: &str = "rules";

/// Extension of compressed container files
pub const CONTAINER_EXT: &str = ".cont.zst";

/// Extension of digest sidecar files
pub const DIGEST_EXT: &str = ".sha256";

/// Extensions picked up by the dump upload loop
pub const UPLOAD_EXTS: &[&str] = &["zst", "sha256"];

/// Name of the firewall rule used for network containment
pub const CONTAIN_RULE_NAME: &str = "EDR containment";

/// Maximum number of concurrent hook side jobs (dumps)
pub const HOOK_SEMAPHORE_SIZE: usize = 4;

// ============================================
// Scheduler cadences
// ============================================

/// Dump upload walk interval
pub const UPLOAD_INTERVAL: Duration = Duration::from_secs(60);

/// Archive cleanup walk interval
pub const ARCHIVE_CLEAN_INTERVAL: Duration = Duration::from_secs(60);

/// Archived artifacts younger than this are kept
pub const ARCHIVE_EXPIRY: Duration = Duration::from_secs(5 * 60);

/// Command runner slow poll
pub const COMMAND_DEFAULT_SLEEP: Duration = Duration::from_secs(5);

/// Command runner fast poll after a command arrived
pub const COMMAND_BURST_SLEEP: Duration = Duration::from_millis(500);

/// How long the command runner stays in burst mode
pub const COMMAND_BURST_WINDOW: Duration = Duration::from_secs(30);

/// Cron dispatcher tick
pub const CRON_TICK: Duration = Duration::from_secs(1);

/// Warn about missing process termination events every N scanned events
pub const PROC_TERM_WARN_EVERY: u64 = 1000;

// ============================================
// Helper functions to read from env with fallback
// ============================================

/// Get manager URL from environment or use default
pub fn get_manager_url() -> String {
    std::env::var("HIDS_MANAGER_URL")
        .unwrap_or_else(|_| DEFAULT_MANAGER_URL.to_string())
}

/// Get manager API key from environment
pub fn get_manager_key() -> String {
    std::env::var("HIDS_MANAGER_KEY").unwrap_or_default()
}

/// Get the config path from environment or use the default
pub fn get_config_path() -> PathBuf {
    std::env::var("HIDS_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Base data directory for the agent's working files
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}
