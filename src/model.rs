use std::collections::BTreeMap;

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{PulseError, Result};

/// Ingested timestamps are clamped to this precision so that merge
/// comparisons are stable across platforms with different clock
/// resolutions.
pub const TIMESTAMP_PRECISION_MS: i64 = 10;

/// A single activity event. Heartbeat-sourced events start with zero
/// duration and grow as identical heartbeats are merged into them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    #[serde(default = "Duration::zero", with = "seconds")]
    pub duration: Duration,
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
}

impl Event {
    pub fn new(timestamp: DateTime<Utc>, data: BTreeMap<String, Value>) -> Self {
        Self {
            id: None,
            timestamp,
            duration: Duration::zero(),
            data,
        }
    }

    /// The instant this event's window ends.
    pub fn end(&self) -> DateTime<Utc> {
        self.timestamp + self.duration
    }

    /// Truncate the timestamp to the store's fixed sub-second precision.
    pub fn clamp_precision(&mut self) {
        if let Ok(clamped) = self
            .timestamp
            .duration_trunc(Duration::milliseconds(TIMESTAMP_PRECISION_MS))
        {
            self.timestamp = clamped;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.duration < Duration::zero() {
            return Err(PulseError::InvalidInput(
                "event duration must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Bucket metadata. The event collection itself lives in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketMeta {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub hostname: String,
    pub created: DateTime<Utc>,
}

/// Body of `POST /api/0/buckets/{id}`.
#[derive(Debug, Deserialize)]
pub struct CreateBucket {
    #[serde(rename = "type")]
    pub event_type: String,
}

/// One bucket's full contents in the `GET /api/0/export` dump: the
/// metadata fields flattened alongside the complete event list.
#[derive(Debug, Serialize, Deserialize)]
pub struct BucketExport {
    #[serde(flatten)]
    pub meta: BucketMeta,
    pub events: Vec<Event>,
}

/// Serialize a chrono duration as fractional seconds, the wire format
/// clients expect for `duration`.
pub mod seconds {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(value.num_milliseconds() as f64 / 1000.0)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::milliseconds((secs * 1000.0).round() as i64))
    }
}
