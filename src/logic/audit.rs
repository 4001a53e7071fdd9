//! Windows Auditing
//!
//! Audit policies enabled with `auditpol` and file system audit ACLs set on
//! configured directories, so that object access events (Security 4663)
//! exist for the file system canary rule. Both are undone when the agent
//! stops.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::thread;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::logic::commands::Command;

const AUDITPOL: &str = "auditpol.exe";
const POWERSHELL: &str = "powershell.exe";

/// Rights audited on configured directories, inherited by their content
const AUDIT_RIGHTS: &str = "Write,Delete,ChangePermissions,TakeOwnership";

static ENV_VAR_RE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"%([A-Za-z0-9_()]+)%").ok());

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enable: bool,
    /// Subcategories as listed by `auditpol /get /category:*`
    pub audit_policies: Vec<String>,
    /// Directories getting an audit ACL, `%VAR%` references are expanded
    pub audit_dirs: Vec<String>,
}

impl AuditConfig {
    /// Existing audited directories, expanded and without duplicates
    pub fn audit_directories(&self) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        self.audit_dirs
            .iter()
            .map(|d| PathBuf::from(expand_env(d)))
            .filter(|d| d.is_dir())
            .filter(|d| seen.insert(d.clone()))
            .collect()
    }

    pub fn policy_commands(&self, enable: bool) -> Vec<Command> {
        if !self.enable {
            return Vec::new();
        }
        self.audit_policies
            .iter()
            .map(|p| audit_policy_command(p, enable))
            .collect()
    }

    pub fn acl_commands(&self, set: bool) -> Vec<Command> {
        if !self.enable {
            return Vec::new();
        }
        self.audit_directories()
            .iter()
            .map(|d| audit_acl_command(d, set))
            .collect()
    }

    /// Enable audit policies, then set directory ACLs in the background
    /// since large trees take a while
    pub fn configure(&self) {
        for mut cmd in self.policy_commands(true) {
            match cmd.run() {
                Ok(()) => log::info!("Audit policy enabled: {}", cmd),
                Err(e) => log::error!("Failed to enable audit policy: {}", e),
            }
        }

        let acls = self.acl_commands(true);
        if acls.is_empty() {
            return;
        }
        thread::spawn(move || {
            log::info!("Setting file system audit ACLs on {} directories", acls.len());
            for mut cmd in acls {
                if let Err(e) = cmd.run() {
                    log::error!("Failed to set file system audit ACL: {}", e);
                }
            }
            log::info!("Finished setting file system audit ACLs");
        });
    }

    /// Disable the configured policies and remove the directory ACLs
    pub fn restore(&self) {
        for mut cmd in self.policy_commands(false) {
            if let Err(e) = cmd.run() {
                log::error!("Failed to disable audit policy: {}", e);
            }
        }
        for mut cmd in self.acl_commands(false) {
            if let Err(e) = cmd.run() {
                log::error!("Failed to restore file system audit ACL: {}", e);
            }
        }
    }
}

/// Expand `%NAME%` environment references, unknown names are kept verbatim
pub fn expand_env(value: &str) -> String {
    match ENV_VAR_RE.as_ref() {
        Some(re) => re
            .replace_all(value, |caps: &Captures| {
                std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
            })
            .into_owned(),
        None => value.to_string(),
    }
}

pub fn audit_policy_command(policy: &str, enable: bool) -> Command {
    let state = if enable { "enable" } else { "disable" };
    let subcategory = format!("/subcategory:{}", policy);
    let success = format!("/success:{}", state);
    let failure = format!("/failure:{}", state);
    Command::new(AUDITPOL, &["/set", &subcategory, &success, &failure])
}

fn ps_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', "''"))
}

/// Add (or remove) an inherited success audit rule for Everyone
pub fn audit_acl_command(dir: &Path, set: bool) -> Command {
    let path = ps_quote(dir);
    let change = if set {
        "$acl.AddAuditRule($rule)"
    } else {
        "$acl.RemoveAuditRuleSpecific($rule)"
    };
    let script = format!(
        "$acl = Get-Acl -LiteralPath {path} -Audit; \
         $rule = New-Object System.Security.AccessControl.FileSystemAuditRule(\
         'Everyone', '{rights}', 'ContainerInherit,ObjectInherit', 'None', 'Success'); \
         {change}; Set-Acl -LiteralPath {path} -AclObject $acl",
        path = path,
        rights = AUDIT_RIGHTS,
        change = change,
    );
    Command::new(POWERSHELL, &["-NoProfile", "-NonInteractive", "-Command", &script])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::config::Config;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_policy_commands() {
        let audit = AuditConfig {
            enable: true,
            audit_policies: vec!["File System".to_string()],
            audit_dirs: Vec::new(),
        };

        let enable = audit.policy_commands(true);
        assert_eq!(enable.len(), 1);
        assert_eq!(enable[0].name, "auditpol.exe");
        assert_eq!(
            enable[0].args,
            vec!["/set", "/subcategory:File System", "/success:enable", "/failure:enable"]
        );

        let disable = audit.policy_commands(false);
        assert_eq!(disable[0].args[2], "/success:disable");
        assert_eq!(disable[0].args[3], "/failure:disable");
    }

    #[test]
    fn test_disabled_runs_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let audit = AuditConfig {
            enable: false,
            audit_policies: vec!["File System".to_string()],
            audit_dirs: vec![temp_dir.path().to_string_lossy().to_string()],
        };
        assert!(audit.policy_commands(true).is_empty());
        assert!(audit.acl_commands(true).is_empty());
        assert!(audit.acl_commands(false).is_empty());
    }

    #[test]
    fn test_audit_directories_expanded_and_deduplicated() {
        let temp_dir = TempDir::new().unwrap();
        let docs = temp_dir.path().join("docs");
        fs::create_dir_all(&docs).unwrap();
        std::env::set_var("HIDS_AUDIT_TEST_ROOT", temp_dir.path());

        let audit = AuditConfig {
            enable: true,
            audit_policies: Vec::new(),
            audit_dirs: vec![
                "%HIDS_AUDIT_TEST_ROOT%/docs".to_string(),
                docs.to_string_lossy().to_string(),
                "%HIDS_AUDIT_TEST_ROOT%/missing".to_string(),
            ],
        };

        let dirs = audit.audit_directories();
        assert_eq!(dirs, vec![docs.clone()]);

        let set = audit.acl_commands(true);
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].name, "powershell.exe");
        let script = set[0].args.last().unwrap();
        assert!(script.contains("AddAuditRule"));
        assert!(script.contains(&*docs.to_string_lossy()));

        let unset = audit.acl_commands(false);
        assert!(unset[0].args.last().unwrap().contains("RemoveAuditRuleSpecific"));
    }

    #[test]
    fn test_expand_env_keeps_unknown() {
        assert_eq!(expand_env("%HIDS_SURELY_UNSET_VAR%\\x"), "%HIDS_SURELY_UNSET_VAR%\\x");
        assert_eq!(expand_env("C:\\plain"), "C:\\plain");
    }

    #[test]
    fn test_quoted_path() {
        let cmd = audit_acl_command(Path::new("C:\\Users\\o'brien"), true);
        assert!(cmd.args[3].contains("'C:\\Users\\o''brien'"));
    }

    #[test]
    fn test_audit_section_from_toml() {
        let config = Config::from_toml(
            r#"
            [audit]
            enable = true
            audit_policies = ["File System"]
            audit_dirs = ["%USERPROFILE%\\Documents"]
            "#,
        )
        .unwrap();
        assert!(config.audit.enable);
        assert_eq!(config.audit.audit_policies, vec!["File System"]);
        assert_eq!(config.audit.audit_dirs.len(), 1);
    }
}
