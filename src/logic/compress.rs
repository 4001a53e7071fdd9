//! Dump Compression Worker
//!
//! One worker thread drains compression requests in order. Each file is
//! replaced by `<file>.zst` plus a `<file>.zst.sha256` sidecar, the formats
//! picked up by the dump upload loop.

use std::fs;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::logic::integrity;

/// zstd level used for dumps
const COMPRESSION_LEVEL: i32 = 3;

/// Suffix of archives still being written
pub const TMP_SUFFIX: &str = ".zst.tmp";

pub struct Compressor {
    tx: Mutex<Option<Sender<PathBuf>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Compressor {
    pub fn start() -> Self {
        let (tx, rx) = mpsc::channel::<PathBuf>();

        let worker = thread::spawn(move || {
            log::info!("Compression worker started");
            for path in rx {
                match compress_file(&path) {
                    Ok(out) => log::debug!("Compressed {} -> {}", path.display(), out.display()),
                    Err(e) => log::error!("Failed to compress {}: {}", path.display(), e),
                }
            }
            log::info!("Compression worker stopped");
        });

        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue a file for compression
    pub fn compress(&self, path: PathBuf) {
        match self.tx.lock().as_ref() {
            Some(tx) => {
                if tx.send(path).is_err() {
                    log::error!("Compression worker is gone");
                }
            }
            None => log::warn!("Compressor stopped, leaving {} uncompressed", path.display()),
        }
    }

    /// Finish queued work and stop the worker
    pub fn stop(&self) {
        drop(self.tx.lock().take());
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                log::error!("Compression worker panicked");
            }
        }
    }
}

impl Drop for Compressor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Compress a file next to itself and remove the original. The archive is
/// written under a temporary name and only appears as `<file>.zst` once
/// complete, so the upload loop never sees a partial archive.
pub fn compress_file(path: &Path) -> io::Result<PathBuf> {
    let out = with_suffix(path, ".zst");
    let tmp = with_suffix(path, TMP_SUFFIX);

    let encoded = fs::File::open(path).and_then(|input| {
        let output = fs::File::create(&tmp)?;
        zstd::stream::copy_encode(BufReader::new(input), output, COMPRESSION_LEVEL)
    });
    if let Err(e) = encoded {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::rename(&tmp, &out)?;

    integrity::write_digest(&out, &integrity::sha256_file(&out)?)?;
    fs::remove_file(path)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_compress_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("image.bin");
        fs::write(&path, vec![b'A'; 4096]).unwrap();

        let out = compress_file(&path).unwrap();
        assert!(!path.exists());
        assert!(out.to_string_lossy().ends_with("image.bin.zst"));

        let restored = zstd::decode_all(fs::File::open(&out).unwrap()).unwrap();
        assert_eq!(restored, vec![b'A'; 4096]);
        assert!(integrity::digest_matches(&out, &integrity::sha256_file(&out).unwrap()));
        assert!(!temp_dir.path().join("image.bin.zst.tmp").exists());
    }

    #[test]
    fn test_missing_input_leaves_no_archive() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("gone.bin");

        assert!(compress_file(&path).is_err());
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_worker_drains_queue_on_stop() {
        let temp_dir = TempDir::new().unwrap();
        let compressor = Compressor::start();

        for i in 0..3 {
            let path = temp_dir.path().join(format!("dump{}.bin", i));
            fs::write(&path, b"dump").unwrap();
            compressor.compress(path);
        }
        compressor.stop();

        let zst = fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map_or(false, |x| x == "zst"))
            .count();
        assert_eq!(zst, 3);
    }
}
