//! Local Alert Log
//!
//! Append-only JSONL writer for forwarded events, rotated by size.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{Datelike, Timelike, Utc};

use super::EventSink;

/// Log file extension
const LOG_EXT: &str = ".jsonl";

pub struct FileSink {
    writer: BufWriter<File>,
    current_file: PathBuf,
    current_size: u64,
    max_size: u64,
    base_dir: PathBuf,
    sequence: u32,
}

impl FileSink {
    /// Create a sink writing into the given directory
    pub fn new(base_dir: PathBuf, max_size: u64) -> std::io::Result<Self> {
        std::fs::create_dir_all(&base_dir)?;
        let (file_path, file) = Self::open_new_file(&base_dir, 0)?;

        Ok(Self {
            writer: BufWriter::new(file),
            current_file: file_path,
            current_size: 0,
            max_size,
            base_dir,
            sequence: 0,
        })
    }

    /// Open a new log file with timestamp
    fn open_new_file(base_dir: &Path, sequence: u32) -> std::io::Result<(PathBuf, File)> {
        let now = Utc::now();
        let filename = format!(
            "alerts_{}_{:02}_{:02}_{:02}{:02}{:02}_{}{}",
            now.year(),
            now.month(),
            now.day(),
            now.hour(),
            now.minute(),
            now.second(),
            sequence,
            LOG_EXT
        );
        let file_path = base_dir.join(&filename);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_path)?;

        log::info!("Opened alert log: {:?}", file_path);
        Ok((file_path, file))
    }

    /// Rotate to a new file
    fn rotate(&mut self) -> std::io::Result<()> {
        self.writer.flush()?;

        self.sequence += 1;
        let (new_path, new_file) = Self::open_new_file(&self.base_dir, self.sequence)?;
        self.writer = BufWriter::new(new_file);

        log::info!("Rotated from {:?} to {:?}", self.current_file, new_path);
        self.current_file = new_path;
        self.current_size = 0;

        Ok(())
    }

    pub fn current_file(&self) -> &PathBuf {
        &self.current_file
    }
}

impl EventSink for FileSink {
    fn write_batch(&mut self, batch: &[String]) -> std::io::Result<()> {
        for line in batch {
            let bytes = line.as_bytes();

            if self.current_size > 0 && self.current_size + bytes.len() as u64 > self.max_size {
                self.rotate()?;
            }

            self.writer.write_all(bytes)?;
            self.writer.write_all(b"\n")?;
            self.current_size += bytes.len() as u64 + 1;
        }

        // Flush for durability
        self.writer.flush()
    }
}
