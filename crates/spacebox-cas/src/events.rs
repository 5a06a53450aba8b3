//! Store change notifications.
//!
//! The store reports every successful put and delete to an [`EventSink`].
//! Sinks must not block the caller; the service layer plugs in a bounded
//! publisher queue.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Object change notification.
///
/// Wire form: `{"eventType": "put", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "eventType", content = "payload", rename_all = "camelCase")]
pub enum StoreEvent {
    Put {
        key: String,
        bucket: String,
        /// Object path relative to the data root.
        #[serde(rename = "objectPath")]
        object_path: PathBuf,
        /// Disk root relative to the data root.
        #[serde(rename = "diskPath")]
        disk_path: PathBuf,
        size: u64,
    },
    Delete {
        key: String,
        bucket: String,
    },
}

impl StoreEvent {
    pub fn key(&self) -> &str {
        match self {
            StoreEvent::Put { key, .. } | StoreEvent::Delete { key, .. } => key,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StoreEvent::Put { .. } => "put",
            StoreEvent::Delete { .. } => "delete",
        }
    }
}

/// Receiver of store events.
pub trait EventSink: Send + Sync {
    /// Hand an event over. Must return promptly.
    fn emit(&self, event: StoreEvent);
}

/// Discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: StoreEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = StoreEvent::Put {
            key: "16abcd".to_string(),
            bucket: "files".to_string(),
            object_path: PathBuf::from("disk1/files/16/ab/16abcd"),
            disk_path: PathBuf::from("disk1"),
            size: 42,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["eventType"], "put");
        assert_eq!(json["payload"]["objectPath"], "disk1/files/16/ab/16abcd");
        assert_eq!(json["payload"]["diskPath"], "disk1");
        assert_eq!(json["payload"]["size"], 42);

        let back: StoreEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_delete_event_shape() {
        let event = StoreEvent::Delete {
            key: "16abcd".to_string(),
            bucket: "files".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"eventType":"delete","payload":{"key":"16abcd","bucket":"files"}}"#
        );
        assert_eq!(event.kind(), "delete");
    }
}
