//! Event Model
//!
//! A telemetry record normalized into a JSON document addressed by
//! slash-separated field paths (`Event/EventData/Image`). Hooks enrich or
//! strip fields in place as the event moves through the pipeline.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::logic::config::SYSMON_CHANNEL;

pub mod paths;

// ============================================================================
// TYPES
// ============================================================================

/// Raw record as produced by an event source (one JSON document)
pub type RawEvent = String;

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    root: Value,
}

impl Event {
    /// Normalize a raw record
    pub fn from_raw(raw: &str) -> Result<Self, EventError> {
        let root: Value =
            serde_json::from_str(raw).map_err(|e| EventError::Parse(e.to_string()))?;
        Self::from_value(root)
    }

    pub fn from_value(root: Value) -> Result<Self, EventError> {
        if !root.is_object() {
            return Err(EventError::NotAnObject);
        }
        let event = Self { root };
        if event.get(paths::SYSTEM).map_or(true, |v| !v.is_object()) {
            return Err(EventError::MissingField(paths::SYSTEM));
        }
        Ok(event)
    }

    // ------------------------------------------------------------------------
    // Field access
    // ------------------------------------------------------------------------

    pub fn get(&self, path: &str) -> Option<&Value> {
        path.split('/')
            .try_fold(&self.root, |node, key| node.as_object()?.get(key))
    }

    /// String view of a field; numbers are rendered as text
    pub fn get_str(&self, path: &str) -> Option<String> {
        match self.get(path)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Integer view of a field; numeric strings are parsed
    pub fn get_i64(&self, path: &str) -> Option<i64> {
        match self.get(path)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Set a field, creating intermediate objects as needed
    pub fn set(&mut self, path: &str, value: Value) {
        let mut keys: Vec<&str> = path.split('/').collect();
        let Some(last) = keys.pop() else { return };

        let mut node = &mut self.root;
        for key in keys {
            let Some(obj) = node.as_object_mut() else { return };
            node = obj
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
        }
        if let Some(obj) = node.as_object_mut() {
            obj.insert(last.to_string(), value);
        }
    }

    /// Remove a field, returning its previous value
    pub fn del(&mut self, path: &str) -> Option<Value> {
        let (parent, last) = match path.rsplit_once('/') {
            Some((parent, last)) => (Some(parent), last),
            None => (None, path),
        };
        let node = match parent {
            Some(parent) => parent
                .split('/')
                .try_fold(&mut self.root, |node, key| node.as_object_mut()?.get_mut(key))?,
            None => &mut self.root,
        };
        node.as_object_mut()?.remove(last)
    }

    // ------------------------------------------------------------------------
    // Well-known fields
    // ------------------------------------------------------------------------

    pub fn event_id(&self) -> Option<i64> {
        self.get_i64(paths::EVENT_ID)
    }

    pub fn channel(&self) -> Option<String> {
        self.get_str(paths::CHANNEL)
    }

    pub fn process_guid(&self) -> Option<String> {
        self.get_str(paths::PROCESS_GUID)
    }

    pub fn parent_process_guid(&self) -> Option<String> {
        self.get_str(paths::PARENT_PROCESS_GUID)
    }

    pub fn source_process_guid(&self) -> Option<String> {
        self.get_str(paths::SOURCE_PROCESS_GUID)
    }

    pub fn process_id(&self) -> Option<u32> {
        self.get_i64(paths::PROCESS_ID).and_then(|pid| u32::try_from(pid).ok())
    }

    pub fn parent_process_id(&self) -> Option<u32> {
        self.get_i64(paths::PARENT_PROCESS_ID)
            .and_then(|pid| u32::try_from(pid).ok())
    }

    pub fn image(&self) -> Option<String> {
        self.get_str(paths::IMAGE)
    }

    fn is_sysmon_event(&self, id: i64) -> bool {
        self.channel().as_deref() == Some(SYSMON_CHANNEL) && self.event_id() == Some(id)
    }

    pub fn is_process_create(&self) -> bool {
        self.is_sysmon_event(paths::ID_PROCESS_CREATE)
    }

    pub fn is_process_terminate(&self) -> bool {
        self.is_sysmon_event(paths::ID_PROCESS_TERMINATE)
    }

    pub fn is_driver_load(&self) -> bool {
        self.is_sysmon_event(paths::ID_DRIVER_LOAD)
    }

    // ------------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------------

    pub fn to_json(&self) -> String {
        self.root.to_string()
    }

    /// SHA-256 of the serialized event, used to name dump directories
    pub fn hash(&self) -> String {
        hex::encode(Sha256::digest(self.to_json().as_bytes()))
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug)]
pub enum EventError {
    Parse(String),
    NotAnObject,
    MissingField(&'static str),
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventError::Parse(msg) => write!(f, "Failed to parse event: {}", msg),
            EventError::NotAnObject => write!(f, "Event is not a JSON object"),
            EventError::MissingField(path) => write!(f, "Event is missing {}", path),
        }
    }
}

impl std::error::Error for EventError {}

// ============================================================================
// TESTS
// ============================================================================
