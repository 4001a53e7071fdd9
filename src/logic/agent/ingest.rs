//! Event ingestion and detection loop

use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use super::Agent;
use crate::constants::PROC_TERM_WARN_EVERY;
use crate::logic::event::{paths, Event, RawEvent};

/// How often an idle loop checks for shutdown
const IDLE_POLL: Duration = Duration::from_millis(250);

/// What happened to one raw record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Could not be converted into an event
    Dropped,
    /// Produced by the agent's own process tree
    Skipped,
    Scanned { alert: bool },
}

impl Agent {
    /// Consume records in arrival order until the source closes or the
    /// agent stops
    pub(super) fn ingest(&self, events: Receiver<RawEvent>) {
        log::info!("Detection loop started");
        loop {
            match events.recv_timeout(IDLE_POLL) {
                Ok(raw) => {
                    self.process_raw(&raw);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.is_stopped() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        log::info!(
            "Detection loop stopped ({} events scanned, {} alerts)",
            self.events_scanned(),
            self.alerts_reported()
        );
    }

    /// Run one record through pre-hooks, the self-event filter, detection,
    /// post-hooks and forwarding
    pub fn process_raw(&self, raw: &str) -> Outcome {
        let mut event = match Event::from_raw(raw) {
            Ok(event) => event,
            Err(e) => {
                log::error!("Failed to convert event: {}", e);
                return Outcome::Dropped;
            }
        };

        let scanned = self.events_scanned();
        if self.config.enable_hooks
            && !self.proc_term_seen.load(Ordering::SeqCst)
            && scanned > 0
            && scanned % PROC_TERM_WARN_EVERY == 0
        {
            log::warn!(
                "No process termination event seen after {} events, some hooks will not work properly",
                scanned
            );
        }

        let print_all = self.is_print_all();
        let log_all = self.config.log_all;

        let engine = self.engine.read();

        // Bookkeeping must happen before the self-event check relies on it
        self.pre_hooks.run(self, &mut event);

        if self.is_self_event(&event) && !event.is_process_terminate() {
            if print_all {
                print_event(&event);
            }
            return Outcome::Skipped;
        }

        let result = engine.match_or_filter(&mut event);
        let mut alert = false;

        if result.is_match() {
            if result.criticality >= self.config.criticality_threshold {
                if self.config.enable_hooks {
                    self.post_hooks.run(self, &mut event);
                }
                // print/log-all modes already output every event
                if !print_all && !log_all {
                    self.forwarder.pipe_event(&event);
                }
                self.alerts_reported.fetch_add(1, Ordering::SeqCst);
                alert = true;
            } else if result.filtered && self.config.enable_filtering && !print_all && !log_all {
                event.del(paths::DETECTION);
                self.forwarder.pipe_event(&event);
            }
        }

        if print_all {
            print_event(&event);
        }
        if log_all {
            self.forwarder.pipe_event(&event);
        }

        self.events_scanned.fetch_add(1, Ordering::SeqCst);
        Outcome::Scanned { alert }
    }
}

fn print_event(event: &Event) {
    println!("{}", event.to_json());
}
