use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::{
    error::{PulseError, Result},
    merge,
    model::{BucketMeta, Event},
};

/// Unbounded result set marker for `get`.
pub const LIMIT_UNBOUNDED: i64 = -1;

struct BucketData {
    meta: BucketMeta,
    events: Vec<Event>,
    // Index of the most recently inserted or merged event. Not
    // necessarily the event with the greatest timestamp.
    last: Option<usize>,
}

/// In-memory event store. The outer map serializes bucket lifecycle;
/// each bucket carries its own lock so the heartbeat read-decide-write
/// sequence is atomic per bucket while queries share the lock.
pub struct EventStore {
    hostname: String,
    buckets: RwLock<HashMap<String, Arc<RwLock<BucketData>>>>,
}

impl EventStore {
    pub fn new(hostname: String) -> Self {
        Self {
            hostname,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Create a bucket, or return the existing metadata when the id is
    /// already taken.
    pub fn create_bucket(&self, id: &str, event_type: &str) -> Result<BucketMeta> {
        let mut buckets = self.buckets.write();
        if let Some(bucket) = buckets.get(id) {
            return Ok(bucket.read().meta.clone());
        }

        let meta = BucketMeta {
            id: id.to_string(),
            event_type: event_type.to_string(),
            hostname: self.hostname.clone(),
            created: Utc::now(),
        };
        buckets.insert(
            id.to_string(),
            Arc::new(RwLock::new(BucketData {
                meta: meta.clone(),
                events: Vec::new(),
                last: None,
            })),
        );
        Ok(meta)
    }

    pub fn delete_bucket(&self, id: &str) -> Result<()> {
        let mut buckets = self.buckets.write();
        buckets.remove(id).ok_or(PulseError::BucketNotFound)?;
        Ok(())
    }

    pub fn buckets(&self) -> Vec<BucketMeta> {
        self.buckets
            .read()
            .values()
            .map(|bucket| bucket.read().meta.clone())
            .collect()
    }

    pub fn metadata(&self, id: &str) -> Result<BucketMeta> {
        let bucket = self.bucket(id)?;
        let data = bucket.read();
        Ok(data.meta.clone())
    }

    /// Append an event without consulting the merge engine. Assigns an
    /// id when absent. The bulk path may produce overlapping events;
    /// only the heartbeat path enforces non-overlap.
    pub fn insert(&self, bucket_id: &str, mut event: Event) -> Result<Event> {
        event.validate()?;
        event.clamp_precision();
        let bucket = self.bucket(bucket_id)?;
        let mut data = bucket.write();
        Ok(data.push(event).clone())
    }

    pub fn insert_many(&self, bucket_id: &str, events: Vec<Event>) -> Result<Vec<Event>> {
        for event in &events {
            event.validate()?;
        }
        let bucket = self.bucket(bucket_id)?;
        let mut data = bucket.write();
        let mut stored = Vec::with_capacity(events.len());
        for mut event in events {
            event.clamp_precision();
            stored.push(data.push(event).clone());
        }
        Ok(stored)
    }

    /// Merge-or-insert a heartbeat. Holding the bucket write lock for
    /// the whole read-decide-write sequence keeps concurrent heartbeats
    /// for one bucket from racing over the same last event.
    pub fn heartbeat(&self, bucket_id: &str, mut event: Event, pulsetime: f64) -> Result<Event> {
        merge::check_pulsetime(pulsetime)?;
        event.validate()?;
        event.clamp_precision();

        let bucket = self.bucket(bucket_id)?;
        let mut data = bucket.write();

        if let Some(idx) = data.last {
            if merge::extends(&data.events[idx], &event, pulsetime) {
                let duration = merge::extended_duration(&data.events[idx], &event);
                let merged = &mut data.events[idx];
                merged.duration = duration;
                return Ok(merged.clone());
            }
        }

        Ok(data.push(event).clone())
    }

    /// Events within `[start, end]`, most recent first. Filtering
    /// happens before sorting and truncation, so a limit always keeps
    /// the most recent events inside the range.
    pub fn get(
        &self,
        bucket_id: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Event>> {
        let bucket = self.bucket(bucket_id)?;
        let data = bucket.read();

        let mut events: Vec<Event> = data
            .events
            .iter()
            .filter(|event| {
                start.is_none_or(|start| event.timestamp >= start)
                    && end.is_none_or(|end| event.timestamp <= end)
            })
            .cloned()
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        if limit >= 0 {
            events.truncate(limit as usize);
        }
        Ok(events)
    }

    /// The most recently inserted or merged event for a bucket.
    pub fn last(&self, bucket_id: &str) -> Result<Option<Event>> {
        let bucket = self.bucket(bucket_id)?;
        let data = bucket.read();
        Ok(data.last.map(|idx| data.events[idx].clone()))
    }

    fn bucket(&self, id: &str) -> Result<Arc<RwLock<BucketData>>> {
        self.buckets
            .read()
            .get(id)
            .cloned()
            .ok_or(PulseError::BucketNotFound)
    }
}

impl BucketData {
    fn push(&mut self, mut event: Event) -> &Event {
        if event.id.is_none() {
            event.id = Some(Uuid::new_v4());
        }
        self.events.push(event);
        self.last = Some(self.events.len() - 1);
        &self.events[self.events.len() - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn store_with_bucket() -> EventStore {
        let store = EventStore::new("testhost".to_string());
        store.create_bucket("test-bucket", "testevents").unwrap();
        store
    }

    fn event_at(offset_secs: i64, label: &str) -> Event {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
            + Duration::seconds(offset_secs);
        let mut data = BTreeMap::new();
        data.insert("label".to_string(), json!(label));
        Event::new(ts, data)
    }

    #[test]
    fn insert_assigns_ids() {
        let store = store_with_bucket();
        let stored = store.insert("test-bucket", event_at(0, "test")).unwrap();
        assert!(stored.id.is_some());
    }

    #[test]
    fn unknown_bucket_is_not_found() {
        let store = EventStore::new("testhost".to_string());
        assert!(matches!(
            store.insert("nope", event_at(0, "test")),
            Err(PulseError::BucketNotFound)
        ));
        assert!(matches!(
            store.get("nope", None, None, LIMIT_UNBOUNDED),
            Err(PulseError::BucketNotFound)
        ));
        assert!(matches!(
            store.last("nope"),
            Err(PulseError::BucketNotFound)
        ));
        assert!(matches!(
            store.delete_bucket("nope"),
            Err(PulseError::BucketNotFound)
        ));
    }

    #[test]
    fn heartbeats_with_identical_data_merge_into_one_event() {
        let store = store_with_bucket();
        let first = event_at(0, "test");
        let second = event_at(1, "test");

        store.heartbeat("test-bucket", first.clone(), 0.0).unwrap();
        let merged = store.heartbeat("test-bucket", second, 10.0).unwrap();

        let events = store
            .get("test-bucket", None, None, LIMIT_UNBOUNDED)
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], merged);
        assert_eq!(events[0].timestamp, first.timestamp);
        assert_eq!(events[0].duration, Duration::seconds(1));
    }

    #[test]
    fn heartbeats_outside_pulsetime_stay_separate() {
        let store = store_with_bucket();
        store.heartbeat("test-bucket", event_at(0, "test"), 0.0).unwrap();
        store.heartbeat("test-bucket", event_at(5, "test"), 2.0).unwrap();

        let events = store
            .get("test-bucket", None, None, LIMIT_UNBOUNDED)
            .unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn retried_heartbeat_is_idempotent() {
        let store = store_with_bucket();
        let event = event_at(0, "test");
        store.heartbeat("test-bucket", event.clone(), 0.0).unwrap();
        store.heartbeat("test-bucket", event, 0.0).unwrap();

        let events = store
            .get("test-bucket", None, None, LIMIT_UNBOUNDED)
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].duration, Duration::zero());
    }

    #[test]
    fn in_order_stream_merges_into_one_spanning_event() {
        let store = store_with_bucket();
        for i in 0..10 {
            store.heartbeat("test-bucket", event_at(i, "test"), 2.0).unwrap();
        }

        let events = store
            .get("test-bucket", None, None, LIMIT_UNBOUNDED)
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].duration, Duration::seconds(9));
    }

    #[test]
    fn data_change_starts_a_new_event() {
        let store = store_with_bucket();
        store.heartbeat("test-bucket", event_at(0, "editor"), 10.0).unwrap();
        store.heartbeat("test-bucket", event_at(1, "browser"), 10.0).unwrap();
        store.heartbeat("test-bucket", event_at(2, "browser"), 10.0).unwrap();

        let events = store
            .get("test-bucket", None, None, LIMIT_UNBOUNDED)
            .unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn negative_pulsetime_is_rejected() {
        let store = store_with_bucket();
        assert!(matches!(
            store.heartbeat("test-bucket", event_at(0, "test"), -1.0),
            Err(PulseError::InvalidInput(_))
        ));
    }

    #[test]
    fn range_query_filters_then_sorts_then_truncates() {
        let store = store_with_bucket();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let events: Vec<Event> = (0..1000)
            .map(|i| {
                let ts = start + Duration::hours(i);
                Event::new(ts, BTreeMap::new())
            })
            .collect();
        store.insert_many("test-bucket", events).unwrap();

        let received = store
            .get(
                "test-bucket",
                Some(start),
                Some(start + Duration::days(1)),
                50,
            )
            .unwrap();

        assert_eq!(received.len(), 25);
        assert!(
            received
                .windows(2)
                .all(|pair| pair[0].timestamp >= pair[1].timestamp)
        );
        assert_eq!(received[0].timestamp, start + Duration::days(1));
        assert_eq!(received[24].timestamp, start);
    }

    #[test]
    fn unbounded_limit_returns_everything_descending() {
        let store = store_with_bucket();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for i in 0..100 {
            store
                .insert("test-bucket", Event::new(start + Duration::hours(i), BTreeMap::new()))
                .unwrap();
        }

        let received = store
            .get("test-bucket", None, None, LIMIT_UNBOUNDED)
            .unwrap();
        assert_eq!(received.len(), 100);
        assert_eq!(received[0].timestamp, start + Duration::hours(99));
    }

    #[test]
    fn empty_and_inverted_ranges_yield_empty_results() {
        let store = store_with_bucket();
        assert!(store.get("test-bucket", None, None, LIMIT_UNBOUNDED).unwrap().is_empty());

        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        store.insert("test-bucket", Event::new(start, BTreeMap::new())).unwrap();

        let inverted = store
            .get(
                "test-bucket",
                Some(start + Duration::days(1)),
                Some(start),
                LIMIT_UNBOUNDED,
            )
            .unwrap();
        assert!(inverted.is_empty());

        let zero_limit = store.get("test-bucket", None, None, 0).unwrap();
        assert!(zero_limit.is_empty());
    }

    #[test]
    fn last_tracks_most_recent_write_not_greatest_timestamp() {
        let store = store_with_bucket();
        store.insert("test-bucket", event_at(100, "later")).unwrap();
        store.insert("test-bucket", event_at(0, "earlier")).unwrap();

        let last = store.last("test-bucket").unwrap().unwrap();
        assert_eq!(last.data["label"], json!("earlier"));
    }

    #[test]
    fn create_bucket_is_idempotent() {
        let store = store_with_bucket();
        let again = store.create_bucket("test-bucket", "other-type").unwrap();
        assert_eq!(again.event_type, "testevents");
    }

    #[test]
    fn deleted_bucket_takes_events_with_it() {
        let store = store_with_bucket();
        store.insert("test-bucket", event_at(0, "test")).unwrap();
        store.delete_bucket("test-bucket").unwrap();
        assert!(matches!(
            store.get("test-bucket", None, None, LIMIT_UNBOUNDED),
            Err(PulseError::BucketNotFound)
        ));
    }
}
