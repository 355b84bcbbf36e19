//! Message types and payload integrity helpers.
//!
//! A message is the unit of delivery: an opaque JSON payload plus the queue
//! bookkeeping (priority, attempts, schedule, ack token). Acknowledged
//! messages are deleted rather than marked, so the live table only ever holds
//! `pending` and `in_flight` rows; exhausted messages move to the dead-letter
//! table as [`DeadLetterMessage`] snapshots.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::prelude::FromRow;

use crate::error::Error;

/// Priority bands for delivery ordering. Higher drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Critical,
}

impl MessagePriority {
    pub const fn value(self) -> i64 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }

    pub fn from_value(value: i64) -> Self {
        match value {
            i64::MIN..=0 => Self::Low,
            1 => Self::Normal,
            2 => Self::High,
            _ => Self::Critical,
        }
    }
}

impl Default for MessagePriority {
    fn default() -> Self {
        Self::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    InFlight,
    DeadLetter,
}

impl MessageStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_flight" => Some(Self::InFlight),
            "dead_letter" => Some(Self::DeadLetter),
            _ => None,
        }
    }
}

/// A message as handed to a consumer, ack token included.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    pub topic: String,
    pub payload: Value,
    pub priority: MessagePriority,
    pub status: MessageStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub created_at: f64,
    pub updated_at: f64,
    pub scheduled_at: f64,
    pub expires_at: Option<f64>,
    pub last_error: Option<String>,
    pub checksum: String,
    pub ack_token: Option<String>,
    pub metadata: Value,
}

/// Raw `messages` row; converted into [`Message`] after JSON columns parse.
#[derive(Debug, FromRow)]
pub(crate) struct MessageRow {
    pub id: String,
    pub topic: String,
    pub payload: String,
    pub priority: i64,
    pub status: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub created_at: f64,
    pub updated_at: f64,
    pub scheduled_at: f64,
    pub expires_at: Option<f64>,
    pub last_error: Option<String>,
    pub checksum: String,
    pub ack_token: Option<String>,
    pub metadata: String,
}

impl TryFrom<MessageRow> for Message {
    type Error = Error;

    fn try_from(row: MessageRow) -> Result<Self, Error> {
        let status = MessageStatus::parse(&row.status)
            .ok_or_else(|| Error::internal(eyre::eyre!("unknown message status {}", row.status)))?;
        Ok(Self {
            id: row.id,
            topic: row.topic,
            payload: serde_json::from_str(&row.payload)?,
            priority: MessagePriority::from_value(row.priority),
            status,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            created_at: row.created_at,
            updated_at: row.updated_at,
            scheduled_at: row.scheduled_at,
            expires_at: row.expires_at,
            last_error: row.last_error,
            checksum: row.checksum,
            ack_token: row.ack_token,
            metadata: serde_json::from_str(&row.metadata)?,
        })
    }
}

/// Snapshot of a permanently failed message.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterMessage {
    pub id: String,
    pub original_id: String,
    pub topic: String,
    pub payload: Value,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: f64,
    pub dead_lettered_at: f64,
    pub metadata: Value,
}

#[derive(Debug, FromRow)]
pub(crate) struct DeadLetterRow {
    pub id: String,
    pub original_id: String,
    pub topic: String,
    pub payload: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: f64,
    pub dead_lettered_at: f64,
    pub metadata: String,
}

impl TryFrom<DeadLetterRow> for DeadLetterMessage {
    type Error = Error;

    fn try_from(row: DeadLetterRow) -> Result<Self, Error> {
        Ok(Self {
            id: row.id,
            original_id: row.original_id,
            topic: row.topic,
            payload: serde_json::from_str(&row.payload)?,
            attempts: row.attempts,
            last_error: row.last_error,
            created_at: row.created_at,
            dead_lettered_at: row.dead_lettered_at,
            metadata: serde_json::from_str(&row.metadata)?,
        })
    }
}

/// Audit-trail row for every ack/nack decision.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AckLogEntry {
    pub id: i64,
    pub message_id: String,
    pub ack_token: String,
    pub status: String,
    pub response: Option<String>,
    pub timestamp: f64,
}

/// Serializes a payload to its canonical JSON form.
///
/// `serde_json` maps are ordered (BTreeMap-backed), so object keys come out
/// sorted at every nesting level and two semantically equal payloads produce
/// identical bytes.
pub fn canonical_json(payload: &Value) -> Result<String, Error> {
    Ok(serde_json::to_string(payload)?)
}

/// 16-hex-char prefix of SHA-256 over the canonical payload, used for
/// deduplication and integrity checks.
pub fn payload_checksum(payload: &Value) -> Result<String, Error> {
    let canonical = canonical_json(payload)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hex::encode(hasher.finalize());
    Ok(digest[..16].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn checksum_ignores_key_order() {
        let a = json!({"a": 1, "b": 2, "nested": {"y": 2, "x": 1}});
        let b = json!({"nested": {"x": 1, "y": 2}, "b": 2, "a": 1});
        assert_eq!(
            payload_checksum(&a).unwrap(),
            payload_checksum(&b).unwrap()
        );
    }

    #[test]
    fn checksum_differs_for_different_payloads() {
        let a = json!({"class": "deer", "conf": 0.91});
        let b = json!({"class": "boar", "conf": 0.91});
        assert_ne!(
            payload_checksum(&a).unwrap(),
            payload_checksum(&b).unwrap()
        );
    }

    #[test]
    fn checksum_is_sixteen_hex_chars() {
        let checksum = payload_checksum(&json!({"a": 1})).unwrap();
        assert_eq!(checksum.len(), 16);
        assert!(checksum.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn priority_round_trips_through_value() {
        for p in [
            MessagePriority::Low,
            MessagePriority::Normal,
            MessagePriority::High,
            MessagePriority::Critical,
        ] {
            assert_eq!(MessagePriority::from_value(p.value()), p);
        }
    }
}
