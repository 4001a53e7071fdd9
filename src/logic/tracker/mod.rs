//! Activity Tracker
//!
//! Process and driver bookkeeping built from telemetry. Records are indexed
//! by process GUID; the agent keeps the tracker behind a `RwLock` so readers
//! (self-event filter, report commands) get a consistent view.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::logic::event::{paths, Event};

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessTrack {
    pub guid: String,
    pub pid: u32,
    pub parent_guid: String,
    pub parent_pid: u32,
    pub image: String,
    pub parent_image: String,
    pub command_line: String,
    pub terminated: bool,
    /// Accumulated criticality of alerts raised by this process
    pub score: i64,
    pub dumps: u32,
}

impl ProcessTrack {
    /// Build a record from a process creation event
    pub fn from_event(event: &Event) -> Option<Self> {
        let guid = event.process_guid()?;
        Some(Self {
            guid,
            pid: event.process_id().unwrap_or_default(),
            parent_guid: event.parent_process_guid().unwrap_or_default(),
            parent_pid: event.parent_process_id().unwrap_or_default(),
            image: event.image().unwrap_or_default(),
            parent_image: event.get_str(paths::PARENT_IMAGE).unwrap_or_default(),
            command_line: event.get_str(paths::COMMAND_LINE).unwrap_or_default(),
            ..Default::default()
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverInfo {
    pub image: String,
    pub hashes: String,
    pub signed: bool,
    pub signature: String,
}

impl DriverInfo {
    pub fn from_event(event: &Event) -> Option<Self> {
        Some(Self {
            image: event.get_str(paths::IMAGE_LOADED)?,
            hashes: event.get_str(paths::HASHES).unwrap_or_default(),
            signed: event
                .get_str(paths::SIGNED)
                .map_or(false, |s| s.eq_ignore_ascii_case("true")),
            signature: event.get_str(paths::SIGNATURE).unwrap_or_default(),
        })
    }
}

// ============================================================================
// TRACKER
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ActivityTracker {
    processes: HashMap<String, ProcessTrack>,
    pids: HashMap<u32, String>,
    drivers: Vec<DriverInfo>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, track: ProcessTrack) {
        self.pids.insert(track.pid, track.guid.clone());
        self.processes.insert(track.guid.clone(), track);
    }

    pub fn get_by_guid(&self, guid: &str) -> Option<&ProcessTrack> {
        self.processes.get(guid)
    }

    pub fn get_by_guid_mut(&mut self, guid: &str) -> Option<&mut ProcessTrack> {
        self.processes.get_mut(guid)
    }

    /// Latest running process known under this PID
    pub fn get_by_pid(&self, pid: u32) -> Option<&ProcessTrack> {
        self.pids
            .get(&pid)
            .and_then(|guid| self.processes.get(guid))
            .filter(|t| !t.terminated)
    }

    pub fn terminate(&mut self, guid: &str) {
        if let Some(track) = self.processes.get_mut(guid) {
            track.terminated = true;
            if self.pids.get(&track.pid).map(String::as_str) == Some(guid) {
                self.pids.remove(&track.pid);
            }
        }
    }

    /// Snapshot of running processes keyed by GUID
    pub fn ps(&self) -> HashMap<String, ProcessTrack> {
        self.processes
            .iter()
            .filter(|(_, t)| !t.terminated)
            .map(|(g, t)| (g.clone(), t.clone()))
            .collect()
    }

    pub fn add_driver(&mut self, driver: DriverInfo) {
        if !self.drivers.iter().any(|d| d.image == driver.image) {
            self.drivers.push(driver);
        }
    }

    pub fn drivers(&self) -> &[DriverInfo] {
        &self.drivers
    }

    /// Drop terminated processes that no running process descends from
    pub fn free_terminated(&mut self) -> usize {
        let referenced: std::collections::HashSet<String> = self
            .processes
            .values()
            .filter(|t| !t.terminated)
            .map(|t| t.parent_guid.clone())
            .collect();

        let before = self.processes.len();
        self.processes
            .retain(|guid, t| !t.terminated || referenced.contains(guid));
        before - self.processes.len()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn track(guid: &str, pid: u32, parent: &str) -> ProcessTrack {
        ProcessTrack {
            guid: guid.to_string(),
            pid,
            parent_guid: parent.to_string(),
            image: format!("C:\\{}.exe", pid),
            ..Default::default()
        }
    }

    #[test]
    fn test_add_and_lookup() {
        let mut tracker = ActivityTracker::new();
        tracker.add(track("{A}", 10, ""));
        tracker.add(track("{B}", 20, "{A}"));

        assert_eq!(tracker.get_by_guid("{B}").unwrap().parent_guid, "{A}");
        assert_eq!(tracker.get_by_pid(10).unwrap().guid, "{A}");
        assert_eq!(tracker.ps().len(), 2);
    }

    #[test]
    fn test_terminate_and_free() {
        let mut tracker = ActivityTracker::new();
        tracker.add(track("{A}", 10, ""));
        tracker.add(track("{B}", 20, "{A}"));
        tracker.add(track("{C}", 30, ""));

        tracker.terminate("{A}");
        tracker.terminate("{C}");
        assert!(tracker.get_by_pid(10).is_none());
        assert_eq!(tracker.ps().len(), 1);

        // {A} still has a running child
        assert_eq!(tracker.free_terminated(), 1);
        assert!(tracker.get_by_guid("{A}").is_some());
        assert!(tracker.get_by_guid("{C}").is_none());
    }

    #[test]
    fn test_drivers_deduplicated() {
        let mut tracker = ActivityTracker::new();
        let driver = DriverInfo { image: "C:\\drv.sys".to_string(), ..Default::default() };
        tracker.add_driver(driver.clone());
        tracker.add_driver(driver);
        assert_eq!(tracker.drivers().len(), 1);
    }
}
