//! Well-known event field paths

pub const SYSTEM: &str = "Event/System";
pub const CHANNEL: &str = "Event/System/Channel";
pub const EVENT_ID: &str = "Event/System/EventID";

pub const PROCESS_GUID: &str = "Event/EventData/ProcessGuid";
pub const PARENT_PROCESS_GUID: &str = "Event/EventData/ParentProcessGuid";
pub const SOURCE_PROCESS_GUID: &str = "Event/EventData/SourceProcessGuid";
pub const PROCESS_ID: &str = "Event/EventData/ProcessId";
pub const PARENT_PROCESS_ID: &str = "Event/EventData/ParentProcessId";
pub const IMAGE: &str = "Event/EventData/Image";
pub const PARENT_IMAGE: &str = "Event/EventData/ParentImage";
pub const COMMAND_LINE: &str = "Event/EventData/CommandLine";
pub const IMAGE_LOADED: &str = "Event/EventData/ImageLoaded";
pub const HASHES: &str = "Event/EventData/Hashes";
pub const SIGNED: &str = "Event/EventData/Signed";
pub const SIGNATURE: &str = "Event/EventData/Signature";

/// Detection info written by the engine on match
pub const DETECTION: &str = "Event/Detection";
pub const DETECTION_SIGNATURE: &str = "Event/Detection/Signature";
pub const DETECTION_CRITICALITY: &str = "Event/Detection/Criticality";
pub const DETECTION_ACTIONS: &str = "Event/Detection/Actions";
pub const DETECTION_SCORE: &str = "Event/Detection/Score";

// Sysmon event IDs
pub const ID_PROCESS_CREATE: i64 = 1;
pub const ID_PROCESS_TERMINATE: i64 = 5;
pub const ID_DRIVER_LOAD: i64 = 6;
pub const ID_FILE_CREATE: i64 = 11;

// Security event IDs
pub const ID_OBJECT_ACCESS: i64 = 4663;
