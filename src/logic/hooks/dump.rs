//! File Dump Hook
//!
//! Copies the image of an alerting process and the event itself to
//! `<dump dir>/<process guid>/<event hash>/`, the layout the upload loop
//! expects. Copies run on a side thread bounded by the hook semaphore.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use crate::logic::agent::Agent;
use crate::logic::compress::Compressor;
use crate::logic::event::{paths, Event};
use crate::logic::semaphore::Semaphore;

/// Name of the event file written next to dumped files
pub const EVENT_FILE: &str = "event.json";

struct DumpJob {
    dir: PathBuf,
    image: Option<PathBuf>,
    event_json: String,
    compressor: Option<Arc<Compressor>>,
}

pub fn hook_dump_file(agent: &Agent, event: &mut Event) {
    let config = &agent.config().dump;
    let criticality = event.get_i64(paths::DETECTION_CRITICALITY).unwrap_or_default();
    if criticality < config.threshold {
        return;
    }
    let Some(guid) = event.process_guid() else { return };

    {
        let mut tracker = agent.tracker().write();
        match tracker.get_by_guid_mut(&guid) {
            Some(track) if track.dumps >= config.max_dumps => {
                log::debug!("Dump limit reached for process {}", guid);
                return;
            }
            Some(track) => track.dumps += 1,
            None if !config.dump_untracked => return,
            None => {}
        }
    }

    let job = DumpJob {
        dir: config.dir.join(&guid).join(event.hash()),
        image: event.image().map(PathBuf::from),
        event_json: event.to_json(),
        compressor: agent.compressor().cloned(),
    };

    if agent.is_dry_run() {
        log::info!("Dry run: would dump to {}", job.dir.display());
        return;
    }

    let semaphore = agent.hook_semaphore().clone();
    thread::spawn(move || run_dump(&semaphore, job));
}

fn run_dump(semaphore: &Semaphore, job: DumpJob) {
    if semaphore.available() == 0 {
        log::debug!("All dump slots busy, waiting: {}", job.dir.display());
    }
    let _permit = semaphore.acquire();

    if let Err(e) = fs::create_dir_all(&job.dir) {
        log::error!("Failed to create dump directory {}: {}", job.dir.display(), e);
        return;
    }

    let mut written = Vec::new();

    let event_path = job.dir.join(EVENT_FILE);
    match fs::write(&event_path, job.event_json.as_bytes()) {
        Ok(()) => written.push(event_path),
        Err(e) => log::error!("Failed to dump event: {}", e),
    }

    if let Some(image) = job.image.as_deref() {
        match dump_image(image, &job.dir) {
            Ok(path) => written.push(path),
            Err(e) => log::error!("Failed to dump {}: {}", image.display(), e),
        }
    }

    if let Some(compressor) = &job.compressor {
        for path in written {
            compressor.compress(path);
        }
    }
}

/// Copy a file into the dump directory under `<name>.bin`
fn dump_image(image: &Path, dir: &Path) -> std::io::Result<PathBuf> {
    let name = image
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "image".to_string());
    let dest = dir.join(format!("{}.bin", name));
    fs::copy(image, &dest)?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_run_dump_writes_layout() {
        let temp_dir = TempDir::new().unwrap();
        let image = temp_dir.path().join("evil.exe");
        fs::write(&image, b"MZ").unwrap();

        let dir = temp_dir.path().join("dumps").join("{GUID}").join("abcd");
        let semaphore = Semaphore::new(1);
        run_dump(
            &semaphore,
            DumpJob {
                dir: dir.clone(),
                image: Some(image),
                event_json: "{}".to_string(),
                compressor: None,
            },
        );

        assert_eq!(fs::read(dir.join("evil.exe.bin")).unwrap(), b"MZ");
        assert_eq!(fs::read_to_string(dir.join(EVENT_FILE)).unwrap(), "{}");
        assert_eq!(semaphore.available(), 1);
    }

    #[test]
    fn test_run_dump_missing_image_keeps_event() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("g").join("h");
        run_dump(
            &Semaphore::new(1),
            DumpJob {
                dir: dir.clone(),
                image: Some(temp_dir.path().join("gone.exe")),
                event_json: "{}".to_string(),
                compressor: None,
            },
        );
        assert!(dir.join(EVENT_FILE).exists());
        assert!(!dir.join("gone.exe.bin").exists());
    }
}
