//! Filesystem Inspection Commands
//!
//! Handlers behind the `hash`, `stat`, `dir`, `walk` and `find` manager
//! commands. Every result is serializable and sent back as JSON.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use walkdir::WalkDir;

use crate::logic::integrity;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileHash {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileStat {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WalkItem {
    pub dirpath: PathBuf,
    pub dirs: Vec<String>,
    pub files: Vec<String>,
}

pub fn hash(path: &Path) -> io::Result<FileHash> {
    let size = fs::metadata(path)?.len();
    Ok(FileHash {
        path: path.to_path_buf(),
        size,
        sha256: integrity::sha256_file(path)?,
    })
}

pub fn stat(path: &Path) -> io::Result<FileStat> {
    let meta = fs::metadata(path)?;
    Ok(FileStat {
        path: path.to_path_buf(),
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        size: meta.len(),
        is_dir: meta.is_dir(),
        modified: meta.modified().ok().map(DateTime::<Utc>::from),
    })
}

/// Stat every entry of a directory, sorted by path
pub fn dir(path: &Path) -> io::Result<Vec<FileStat>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path)? {
        match entry.and_then(|e| stat(&e.path())) {
            Ok(st) => entries.push(st),
            Err(e) => log::debug!("dir {}: {}", path.display(), e),
        }
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

/// Recursive listing grouped by directory, unreadable entries are skipped
pub fn walk(root: &Path) -> io::Result<Vec<WalkItem>> {
    if !root.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("not a directory: {}", root.display()),
        ));
    }

    let mut items: BTreeMap<PathBuf, WalkItem> = BTreeMap::new();
    items.insert(
        root.to_path_buf(),
        WalkItem {
            dirpath: root.to_path_buf(),
            ..Default::default()
        },
    );

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::debug!("walk {}: {}", root.display(), e);
                continue;
            }
        };
        let Some(parent) = entry.path().parent() else { continue };
        let name = entry.file_name().to_string_lossy().to_string();
        let is_dir = entry.file_type().is_dir();

        let item = items.entry(parent.to_path_buf()).or_insert_with(|| WalkItem {
            dirpath: parent.to_path_buf(),
            ..Default::default()
        });
        if is_dir {
            item.dirs.push(name);
            items.entry(entry.path().to_path_buf()).or_insert_with(|| WalkItem {
                dirpath: entry.path().to_path_buf(),
                ..Default::default()
            });
        } else {
            item.files.push(name);
        }
    }

    Ok(items.into_values().collect())
}

/// Files under `root` whose full path matches `pattern`
pub fn find(root: &Path, pattern: &str) -> Result<Vec<FileStat>, String> {
    let re = Regex::new(pattern).map_err(|e| format!("invalid pattern {}: {}", pattern, e))?;

    let mut found = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() || !re.is_match(&entry.path().to_string_lossy()) {
            continue;
        }
        match stat(entry.path()) {
            Ok(st) => found.push(st),
            Err(e) => log::debug!("find {}: {}", entry.path().display(), e),
        }
    }
    Ok(found)
}
