//! Telemetry Source
//!
//! Produces raw event records for the detection loop. The in-crate source
//! reads JSON lines, either tailing a file written by an event log exporter
//! or reading stdin.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use crate::logic::event::{paths, RawEvent};

/// Poll interval when the tailed file has no new data
const TAIL_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeMode {
    /// Only events produced after subscribing
    Future,
    /// Everything available, then new events
    All,
}

pub trait EventSource: Send + Sync {
    /// Subscribe to channels; the receiver closes when the source stops
    fn fetch_events(&self, channels: &[String], mode: SubscribeMode) -> Receiver<RawEvent>;

    fn stop(&self);
}

// ============================================================================
// JSON LINES SOURCE
// ============================================================================

#[derive(Debug, Clone)]
pub enum SourceInput {
    File(PathBuf),
    Stdin,
}

pub struct JsonLinesSource {
    input: SourceInput,
    stop: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl JsonLinesSource {
    pub fn new(input: SourceInput) -> Self {
        Self {
            input,
            stop: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
        }
    }
}

impl EventSource for JsonLinesSource {
    fn fetch_events(&self, channels: &[String], mode: SubscribeMode) -> Receiver<RawEvent> {
        let (tx, rx) = mpsc::channel();
        let filter = ChannelFilter::new(channels);
        let stop = self.stop.clone();
        let input = self.input.clone();

        let handle = thread::spawn(move || {
            let result = match &input {
                SourceInput::File(path) => tail_file(path, mode, &filter, &tx, &stop),
                SourceInput::Stdin => {
                    let stdin = std::io::stdin();
                    read_lines(stdin.lock(), &filter, &tx, &stop);
                    Ok(())
                }
            };
            if let Err(e) = result {
                log::error!("Event source {:?} failed: {}", input, e);
            }
            log::info!("Event source {:?} stopped", input);
        });

        *self.reader.lock() = Some(handle);
        rx
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        // Stdin readers may stay blocked on input; only wait for file tails
        if matches!(self.input, SourceInput::File(_)) {
            if let Some(handle) = self.reader.lock().take() {
                let _ = handle.join();
            }
        }
    }
}

struct ChannelFilter {
    channels: Vec<String>,
}

impl ChannelFilter {
    fn new(channels: &[String]) -> Self {
        Self { channels: channels.to_vec() }
    }

    /// Unparseable records are passed through so the consumer can report them
    fn accepts(&self, raw: &str) -> bool {
        if self.channels.is_empty() {
            return true;
        }
        let Ok(value) = serde_json::from_str::<Value>(raw) else {
            return true;
        };
        let channel = paths::CHANNEL
            .split('/')
            .try_fold(&value, |node, key| node.get(key))
            .and_then(Value::as_str);
        match channel {
            Some(c) => self.channels.iter().any(|wanted| wanted == c),
            None => true,
        }
    }
}

fn emit(line: &str, filter: &ChannelFilter, tx: &Sender<RawEvent>) -> bool {
    let line = line.trim();
    if line.is_empty() || !filter.accepts(line) {
        return true;
    }
    tx.send(line.to_string()).is_ok()
}

fn read_lines<R: BufRead>(reader: R, filter: &ChannelFilter, tx: &Sender<RawEvent>, stop: &AtomicBool) {
    for line in reader.lines() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match line {
            Ok(line) => {
                if !emit(&line, filter, tx) {
                    break;
                }
            }
            Err(e) => {
                log::error!("Failed to read event: {}", e);
                break;
            }
        }
    }
}

fn tail_file(
    path: &PathBuf,
    mode: SubscribeMode,
    filter: &ChannelFilter,
    tx: &Sender<RawEvent>,
    stop: &AtomicBool,
) -> std::io::Result<()> {
    let mut file = File::open(path)?;
    if mode == SubscribeMode::Future {
        file.seek(SeekFrom::End(0))?;
    }
    let mut reader = BufReader::new(file);
    let mut pending = String::new();

    while !stop.load(Ordering::SeqCst) {
        let n = reader.read_line(&mut pending)?;
        if n == 0 || !pending.ends_with('\n') {
            // No complete line yet
            thread::sleep(TAIL_POLL);
            continue;
        }
        if !emit(&pending, filter, tx) {
            break;
        }
        pending.clear();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::config::{SECURITY_CHANNEL, SYSMON_CHANNEL};
    use std::io::Write;
    use tempfile::TempDir;

    fn record(channel: &str, id: i64) -> String {
        serde_json::json!({"Event": {"System": {"Channel": channel, "EventID": id}}}).to_string()
    }

    #[test]
    fn test_channel_filter() {
        let filter = ChannelFilter::new(&[SYSMON_CHANNEL.to_string()]);
        assert!(filter.accepts(&record(SYSMON_CHANNEL, 1)));
        assert!(!filter.accepts(&record(SECURITY_CHANNEL, 4688)));
        assert!(filter.accepts("garbage"));
        assert!(ChannelFilter::new(&[]).accepts(&record(SECURITY_CHANNEL, 1)));
    }

    #[test]
    fn test_tail_all_then_stop() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("events.jsonl");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "{}", record(SYSMON_CHANNEL, 1)).unwrap();
        writeln!(file, "{}", record(SECURITY_CHANNEL, 4688)).unwrap();
        writeln!(file, "{}", record(SYSMON_CHANNEL, 5)).unwrap();
        file.flush().unwrap();

        let source = JsonLinesSource::new(SourceInput::File(path));
        let rx = source.fetch_events(&[SYSMON_CHANNEL.to_string()], SubscribeMode::All);

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(first.contains("\"EventID\":1"));
        assert!(second.contains("\"EventID\":5"));

        source.stop();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_tail_future_skips_existing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("events.jsonl");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "{}", record(SYSMON_CHANNEL, 1)).unwrap();
        file.flush().unwrap();

        let source = JsonLinesSource::new(SourceInput::File(path.clone()));
        let rx = source.fetch_events(&[], SubscribeMode::Future);
        thread::sleep(Duration::from_millis(300));

        let mut append = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(append, "{}", record(SYSMON_CHANNEL, 3)).unwrap();
        append.flush().unwrap();

        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(got.contains("\"EventID\":3"));
        source.stop();
    }
}
