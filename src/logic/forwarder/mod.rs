//! Alert Forwarder
//!
//! Events piped by the detection loop are queued on a channel and drained by
//! a worker thread that batches them into an `EventSink` (manager or local
//! JSONL log). `close` flushes what is queued and joins the worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::logic::event::Event;
use crate::logic::manager::ManagerClient;

pub mod recorder;

pub use recorder::FileSink;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Flush when this many events are pending
const BATCH_SIZE: usize = 100;

/// Flush pending events after this much idle time
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// SINKS
// ============================================================================

pub trait EventSink: Send {
    fn write_batch(&mut self, batch: &[String]) -> std::io::Result<()>;
}

/// Posts batches to the manager, spilling to a local log when it is down
pub struct ManagerSink {
    client: Arc<dyn ManagerClient>,
    fallback: FileSink,
}

impl ManagerSink {
    pub fn new(client: Arc<dyn ManagerClient>, fallback: FileSink) -> Self {
        Self { client, fallback }
    }
}

impl EventSink for ManagerSink {
    fn write_batch(&mut self, batch: &[String]) -> std::io::Result<()> {
        if let Err(e) = self.client.post_logs(batch) {
            log::warn!("Failed to post {} events to manager, logging locally: {}", batch.len(), e);
            return self.fallback.write_batch(batch);
        }
        Ok(())
    }
}

// ============================================================================
// FORWARDER
// ============================================================================

pub struct Forwarder {
    tx: Mutex<Option<Sender<String>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    forwarded: Arc<AtomicU64>,
}

impl Forwarder {
    /// Start the forwarding worker
    pub fn start(sink: Box<dyn EventSink>) -> Self {
        let (tx, rx) = mpsc::channel::<String>();
        let forwarded = Arc::new(AtomicU64::new(0));
        let counter = forwarded.clone();

        let worker = thread::spawn(move || {
            let mut sink = sink;
            let mut batch: Vec<String> = Vec::with_capacity(BATCH_SIZE);

            loop {
                match rx.recv_timeout(FLUSH_INTERVAL) {
                    Ok(line) => {
                        batch.push(line);
                        if batch.len() >= BATCH_SIZE {
                            flush(sink.as_mut(), &mut batch, &counter);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => flush(sink.as_mut(), &mut batch, &counter),
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }

            flush(sink.as_mut(), &mut batch, &counter);
            log::info!("Forwarder stopped ({} events forwarded)", counter.load(Ordering::SeqCst));
        });

        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            forwarded,
        }
    }

    /// Queue an event for forwarding; dropped once the forwarder is closed
    pub fn pipe_event(&self, event: &Event) {
        match self.tx.lock().as_ref() {
            Some(tx) => {
                if tx.send(event.to_json()).is_err() {
                    log::error!("Forwarder worker is gone, event dropped");
                }
            }
            None => log::debug!("Forwarder closed, event dropped"),
        }
    }

    /// Events written to the sink so far
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::SeqCst)
    }

    /// Flush and stop the worker; safe to call more than once
    pub fn close(&self) {
        drop(self.tx.lock().take());
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                log::error!("Forwarder worker panicked");
            }
        }
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.close();
    }
}

fn flush(sink: &mut dyn EventSink, batch: &mut Vec<String>, counter: &AtomicU64) {
    if batch.is_empty() {
        return;
    }
    match sink.write_batch(batch) {
        Ok(()) => {
            counter.fetch_add(batch.len() as u64, Ordering::SeqCst);
        }
        Err(e) => log::error!("Failed to forward {} events: {}", batch.len(), e),
    }
    batch.clear();
}

// ============================================================================
// TESTS
// ============================================================================
