//! Dump upload and archive cleanup passes

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use once_cell::sync::Lazy;
use regex::Regex;
use walkdir::WalkDir;

use crate::constants::UPLOAD_EXTS;
use crate::logic::manager::ManagerClient;

/// Names of artifacts archived by Sysmon
static ARCHIVED_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^(CLIP-)??[0-9A-F]{32,}(\..*)?$").ok());

fn has_upload_ext(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |ext| UPLOAD_EXTS.contains(&ext))
}

/// `<guid>/<event hash>` of a dump file, from its directory relative to the
/// dump root
fn dump_coordinates(dump_dir: &Path, path: &Path) -> Option<(String, String)> {
    let parent = path.parent()?.strip_prefix(dump_dir).ok()?;
    let parts: Vec<String> = parent
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    if parts.len() < 2 {
        return None;
    }
    Some((parts[parts.len() - 2].clone(), parts[parts.len() - 1].clone()))
}

/// Post every uploadable dump file, deleting it once the manager took it.
/// Returns how many files were uploaded.
pub fn upload_dumps_once(dump_dir: &Path, client: &dyn ManagerClient) -> usize {
    let mut uploaded = 0;

    let files: Vec<PathBuf> = WalkDir::new(dump_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && has_upload_ext(e.path()))
        .map(|e| e.into_path())
        .collect();

    for path in files {
        let Some((guid, event_hash)) = dump_coordinates(dump_dir, &path) else {
            log::error!("Unexpected directory layout, cannot send dump to manager: {}", path.display());
            continue;
        };
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let upload = match client.prepare_file_upload(&path, &guid, &event_hash, &filename) {
            Ok(upload) => upload,
            Err(e) => {
                log::error!("Failed to prepare dump file to upload: {}", e);
                continue;
            }
        };
        if let Err(e) = client.post_dump(&upload) {
            log::error!("Failed to upload dump {}: {}", path.display(), e);
            continue;
        }

        log::info!("Dump file successfully sent to manager, deleting: {}", path.display());
        if let Err(e) = fs::remove_file(&path) {
            log::error!("Failed to delete uploaded dump {}: {}", path.display(), e);
        }
        uploaded += 1;
    }

    uploaded
}

pub fn is_archived_artifact(name: &str) -> bool {
    ARCHIVED_RE.as_ref().map_or(false, |re| re.is_match(name))
}

/// Remove archived artifacts older than `expiry`. Errors are reported once
/// per path through `reported`. Returns how many files were removed.
pub fn clean_archived_once(dir: &Path, expiry: Duration, reported: &mut HashSet<PathBuf>) -> usize {
    clean_archived_with(dir, expiry, reported, |path| fs::remove_file(path))
}

fn clean_archived_with<F>(dir: &Path, expiry: Duration, reported: &mut HashSet<PathBuf>, remove: F) -> usize
where
    F: Fn(&Path) -> io::Result<()>,
{
    let expired = SystemTime::now()
        .checked_sub(expiry)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut removed = 0;

    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !is_archived_artifact(&name) {
            continue;
        }
        let modified = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .unwrap_or_else(SystemTime::now);
        if modified >= expired {
            continue;
        }

        match remove(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => {
                if reported.insert(entry.path().to_path_buf()) {
                    log::error!("Failed to remove archived file {}: {}", entry.path().display(), e);
                }
            }
        }
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::compress::TMP_SUFFIX;
    use crate::logic::testing::MockManager;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn dump_tree() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("{GUID}").join("abcd");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("event.json.zst"), b"zz").unwrap();
        fs::write(dir.join("event.json.zst.sha256"), b"00").unwrap();
        fs::write(dir.join("notes.txt"), b"keep").unwrap();
        // Too shallow
        fs::write(temp_dir.path().join("stray.zst"), b"zz").unwrap();
        temp_dir
    }

    #[test]
    fn test_upload_dumps() {
        let temp_dir = dump_tree();
        let client = MockManager::new();

        assert_eq!(upload_dumps_once(temp_dir.path(), &client), 2);

        let dumps = client.dumps.lock();
        assert_eq!(dumps.len(), 2);
        assert!(dumps.iter().all(|d| d.guid == "{GUID}" && d.event_hash == "abcd"));

        let dir = temp_dir.path().join("{GUID}").join("abcd");
        assert!(!dir.join("event.json.zst").exists());
        assert!(dir.join("notes.txt").exists());
        assert!(temp_dir.path().join("stray.zst").exists());
    }

    #[test]
    fn test_archive_in_progress_not_uploaded() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("{GUID}").join("abcd");
        fs::create_dir_all(&dir).unwrap();
        let partial = dir.join(format!("event.json{}", TMP_SUFFIX));
        fs::write(&partial, b"partial").unwrap();
        let client = MockManager::new();

        assert_eq!(upload_dumps_once(temp_dir.path(), &client), 0);
        assert!(client.dumps.lock().is_empty());
        assert!(partial.exists());

        // Renamed into place once complete
        fs::rename(&partial, dir.join("event.json.zst")).unwrap();
        assert_eq!(upload_dumps_once(temp_dir.path(), &client), 1);
    }

    #[test]
    fn test_failed_upload_keeps_file() {
        let temp_dir = dump_tree();
        let client = MockManager::new();
        client.fail_dumps.store(true, Ordering::SeqCst);

        assert_eq!(upload_dumps_once(temp_dir.path(), &client), 0);
        assert!(temp_dir.path().join("{GUID}").join("abcd").join("event.json.zst").exists());
    }

    #[test]
    fn test_archived_pattern() {
        assert!(is_archived_artifact("0123456789ABCDEF0123456789ABCDEF.exe"));
        assert!(is_archived_artifact("CLIP-0123456789ABCDEF0123456789ABCDEF0123.txt"));
        assert!(!is_archived_artifact("0123456789abcdef0123456789abcdef.exe"));
        assert!(!is_archived_artifact("report.txt"));
    }

    #[test]
    fn test_clean_archived() {
        let temp_dir = TempDir::new().unwrap();
        let archived = temp_dir.path().join("0123456789ABCDEF0123456789ABCDEF.exe");
        let other = temp_dir.path().join("keep.exe");
        fs::write(&archived, b"MZ").unwrap();
        fs::write(&other, b"MZ").unwrap();

        let mut reported = HashSet::new();
        // Fresh files are kept
        assert_eq!(clean_archived_once(temp_dir.path(), Duration::from_secs(300), &mut reported), 0);
        assert!(archived.exists());

        // Everything is expired with a zero expiry
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(clean_archived_once(temp_dir.path(), Duration::ZERO, &mut reported), 1);
        assert!(!archived.exists());
        assert!(other.exists());
        assert!(reported.is_empty());
    }

    #[test]
    fn test_removal_error_reported_once() {
        let temp_dir = TempDir::new().unwrap();
        let locked = temp_dir.path().join("0123456789ABCDEF0123456789ABCDEF.dll");
        fs::write(&locked, b"MZ").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let deny = |_: &Path| -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "in use"))
        };
        let mut reported = HashSet::new();

        assert_eq!(clean_archived_with(temp_dir.path(), Duration::ZERO, &mut reported, deny), 0);
        assert_eq!(clean_archived_with(temp_dir.path(), Duration::ZERO, &mut reported, deny), 0);
        assert_eq!(reported.len(), 1);
        assert!(reported.contains(&locked));
        assert!(locked.exists());

        // Once removable, the file goes away
        assert_eq!(clean_archived_once(temp_dir.path(), Duration::ZERO, &mut reported), 1);
        assert!(!locked.exists());
    }
}
