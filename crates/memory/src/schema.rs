use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A single episodic event.  Immutable once created; identity is the id.
///
/// The timestamp carries its original UTC offset so persisted graphs
/// round-trip to the same instant *and* the same offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEvent {
    pub id: Uuid,
    pub timestamp: DateTime<FixedOffset>,
    /// Tag string, e.g. `collapse`, `anchor_added`, `sensor_reading`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Open key→value map.
    pub payload: Map<String, Value>,
}

impl MemoryEvent {
    pub fn new(
        kind: impl Into<String>,
        payload: Map<String, Value>,
        timestamp: DateTime<FixedOffset>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            kind: kind.into(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn serde_uses_type_key_and_preserves_offset() {
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let ts = offset.with_ymd_and_hms(2025, 3, 1, 14, 30, 0).unwrap();
        let mut payload = Map::new();
        payload.insert("text".into(), Value::String("hello".into()));
        let event = MemoryEvent::new("user_input", payload, ts);

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"user_input\""));
        assert!(json.contains("+02:00"));

        let back: MemoryEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.timestamp.offset(), event.timestamp.offset());
    }
}
