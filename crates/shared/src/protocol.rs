use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::domain::{MessageId, PeerId};

/// One unit of conversation history as it crosses any channel. The same
/// shape serves the durable store, the change feed, and the broadcast
/// room; `id` is the idempotency key everywhere.
///
/// Exactly one of the payload fields is set by well-behaved senders, but
/// receivers must not rely on that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub sender: PeerId,
    pub receiver: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    /// Assigned once at creation. Deserialized leniently: a malformed
    /// timestamp becomes `None` instead of rejecting the whole event.
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_read: bool,
}

impl MessageRecord {
    pub fn has_usable_id(&self) -> bool {
        self.id.is_usable()
    }

    /// Returns the record with both identities normalized for stable
    /// comparison. Applied at every ingestion point.
    pub fn normalized(mut self) -> Self {
        self.sender = self.sender.normalized();
        self.receiver = self.receiver.normalized();
        self
    }
}

/// Frames exchanged over the low-latency broadcast room. Advisory only;
/// the change feed remains authoritative for content and existence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum BroadcastFrame {
    Msg { message: MessageRecord },
    Typing { user: PeerId },
    StopTyping { user: PeerId },
    ReadReceipt { reader: PeerId },
}

/// Row-level notifications from the durable store's change feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "data", rename_all = "snake_case")]
pub enum ChangeFeedEvent {
    Insert {
        row: MessageRecord,
    },
    Update {
        row: MessageRecord,
    },
    /// A delete may arrive without an identifiable row id; receivers must
    /// treat that as "resync", never as "ignore".
    Delete {
        #[serde(default)]
        id: Option<MessageId>,
    },
}

/// One member entry of a full presence snapshot. Snapshots restate the
/// entire membership; they are never diffs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceMember {
    pub user: PeerId,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_timestamp"
    )]
    pub online_at: Option<DateTime<Utc>>,
}

/// Lifecycle of the subscribed room as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Subscribed,
    Closed,
    Errored,
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(parse_timestamp_value))
}

fn parse_timestamp_value(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_created_at_becomes_none_not_an_error() {
        let raw = r#"{
            "id": "m1",
            "sender": "a@x",
            "receiver": "b@x",
            "text": "hi",
            "created_at": "not-a-timestamp"
        }"#;
        let record: MessageRecord = serde_json::from_str(raw).expect("lenient decode");
        assert_eq!(record.created_at, None);
        assert_eq!(record.text.as_deref(), Some("hi"));
    }

    #[test]
    fn missing_optional_fields_default() {
        let raw = r#"{"id": "m2", "sender": "a@x", "receiver": "b@x"}"#;
        let record: MessageRecord = serde_json::from_str(raw).expect("decode");
        assert!(!record.is_read);
        assert_eq!(record.text, None);
        assert_eq!(record.created_at, None);
    }

    #[test]
    fn broadcast_frames_round_trip_with_snake_case_event_names() {
        let frame = BroadcastFrame::ReadReceipt {
            reader: PeerId::new("b@x"),
        };
        let encoded = serde_json::to_value(&frame).expect("encode");
        assert_eq!(encoded["event"], "read_receipt");
        let decoded: BroadcastFrame = serde_json::from_value(encoded).expect("decode");
        match decoded {
            BroadcastFrame::ReadReceipt { reader } => assert_eq!(reader, PeerId::new("b@x")),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn delete_event_tolerates_missing_id() {
        let raw = r#"{"op": "delete", "data": {}}"#;
        let event: ChangeFeedEvent = serde_json::from_str(raw).expect("decode");
        match event {
            ChangeFeedEvent::Delete { id } => assert_eq!(id, None),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
