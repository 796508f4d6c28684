use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time,
};
use tracing::{debug, warn};

use crate::{
    config::DispatchSettings,
    error::{PulseError, Result},
    merge,
};

use super::queue::{DurableQueue, QueueEntry};

pub(crate) enum Command {
    Enqueue(QueueEntry),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the background dispatch task. Enqueueing never waits on
/// the network; the task owns the per-bucket buffers and the durable
/// queue, so there is no shared mutable state to guard.
pub struct DispatcherHandle {
    tx: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl DispatcherHandle {
    pub(crate) fn spawn(
        http: reqwest::Client,
        base_url: String,
        queue: DurableQueue,
        settings: DispatchSettings,
    ) -> Result<Self> {
        // Replay heartbeats left over from a previous run.
        let pending = queue.load_pending()?;
        let mut worker = Worker::new(http, base_url, queue, settings);
        for entry in pending {
            worker.buffer(entry);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move { worker.run(rx).await });
        Ok(Self { tx, task })
    }

    pub(crate) fn enqueue(&self, entry: QueueEntry) -> Result<()> {
        self.tx
            .send(Command::Enqueue(entry))
            .map_err(|_| PulseError::Transient("dispatcher task has stopped".to_string()))
    }

    /// Trigger an immediate flush cycle and wait for it to finish.
    pub async fn flush(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Command::Flush(ack))
            .map_err(|_| PulseError::Transient("dispatcher task has stopped".to_string()))?;
        done.await
            .map_err(|_| PulseError::Transient("dispatcher task has stopped".to_string()))
    }

    /// Attempt one final flush, then stop the task.
    pub async fn shutdown(self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
        self.task
            .await
            .map_err(|err| PulseError::Transient(format!("dispatcher task panicked: {err}")))
    }
}

enum SendError {
    Transient(String),
    Permanent(String),
}

struct Worker {
    http: reqwest::Client,
    base_url: String,
    queue: DurableQueue,
    settings: DispatchSettings,
    // Per-bucket buffers in enqueue order. Cross-bucket ordering is not
    // guaranteed.
    buffers: HashMap<String, VecDeque<QueueEntry>>,
    retry_at: HashMap<String, Instant>,
}

impl Worker {
    fn new(
        http: reqwest::Client,
        base_url: String,
        queue: DurableQueue,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            http,
            base_url,
            queue,
            settings,
            buffers: HashMap::new(),
            retry_at: HashMap::new(),
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut ticker = time::interval(Duration::from_millis(self.settings.flush_interval_ms));
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Enqueue(entry)) => {
                        // Persist before buffering so the entry survives
                        // a crash between enqueue and flush.
                        if let Err(err) = self.queue.append_pending(&entry) {
                            warn!(
                                "failed to persist heartbeat for bucket '{}': {err}",
                                entry.bucket_id
                            );
                        }
                        self.buffer(entry);
                    }
                    Some(Command::Flush(ack)) => {
                        self.flush_all(true).await;
                        let _ = ack.send(());
                    }
                    Some(Command::Shutdown(ack)) => {
                        self.flush_all(true).await;
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        self.flush_all(true).await;
                        return;
                    }
                },
                _ = ticker.tick() => self.flush_all(false).await,
            }
        }
    }

    /// Add an entry to its bucket buffer, pre-merging against the last
    /// entry still awaiting flush. The merge decision is the same
    /// function the server runs, so coalescing here never changes the
    /// final stored outcome.
    fn buffer(&mut self, entry: QueueEntry) {
        let buffer = self.buffers.entry(entry.bucket_id.clone()).or_default();
        if let Some(back) = buffer.back_mut() {
            if merge::extends(&back.event, &entry.event, entry.pulsetime) {
                back.event.duration = merge::extended_duration(&back.event, &entry.event);
                debug!(
                    "pre-merged heartbeat for bucket '{}' (buffered duration {}ms)",
                    entry.bucket_id,
                    back.event.duration.num_milliseconds()
                );
                return;
            }
        }
        buffer.push_back(entry);
    }

    async fn flush_all(&mut self, ignore_backoff: bool) {
        let now = Instant::now();
        let buckets: Vec<String> = self
            .buffers
            .iter()
            .filter(|(_, buffer)| !buffer.is_empty())
            .map(|(bucket, _)| bucket.clone())
            .collect();

        let mut dirty = false;
        for bucket in buckets {
            if !ignore_backoff {
                if let Some(at) = self.retry_at.get(&bucket) {
                    if *at > now {
                        continue;
                    }
                }
            }
            dirty |= self.flush_bucket(&bucket).await;
        }

        if dirty {
            self.compact();
        }
    }

    /// Drain one bucket front-to-back, stopping at the first transient
    /// failure to preserve enqueue order. Returns whether the durable
    /// file needs compaction.
    async fn flush_bucket(&mut self, bucket: &str) -> bool {
        let mut dirty = false;
        loop {
            let Some(front) = self.buffers.get(bucket).and_then(|buffer| buffer.front()) else {
                break;
            };

            match self.send(front).await {
                Ok(()) => {
                    self.pop_front(bucket);
                    self.retry_at.remove(bucket);
                    dirty = true;
                }
                Err(SendError::Permanent(reason)) => {
                    warn!("parking heartbeat for bucket '{bucket}': {reason}");
                    if let Some(entry) = self.pop_front(bucket) {
                        if let Err(err) = self.queue.park(&entry) {
                            warn!("failed to park heartbeat for bucket '{bucket}': {err}");
                        }
                    }
                    dirty = true;
                }
                Err(SendError::Transient(reason)) => {
                    let max_attempts = self.settings.max_attempts;
                    let attempts = match self
                        .buffers
                        .get_mut(bucket)
                        .and_then(|buffer| buffer.front_mut())
                    {
                        Some(front) => {
                            front.attempts += 1;
                            front.attempts
                        }
                        None => break,
                    };
                    if attempts >= max_attempts {
                        let fatal = PulseError::RetryExhausted(format!(
                            "{max_attempts} attempts for bucket '{bucket}': {reason}"
                        ));
                        warn!("parking heartbeat: {fatal}");
                        if let Some(entry) = self.pop_front(bucket) {
                            if let Err(err) = self.queue.park(&entry) {
                                warn!("failed to park heartbeat for bucket '{bucket}': {err}");
                            }
                        }
                        dirty = true;
                    } else {
                        debug!("send failed for bucket '{bucket}' (attempt {attempts}): {reason}");
                        self.retry_at
                            .insert(bucket.to_string(), Instant::now() + backoff_delay(attempts));
                    }
                    break;
                }
            }
        }
        dirty
    }

    async fn send(&self, entry: &QueueEntry) -> std::result::Result<(), SendError> {
        let url = format!(
            "{}/api/0/heartbeat/{}?pulsetime={}",
            self.base_url, entry.bucket_id, entry.pulsetime
        );
        let request = self.http.post(url).json(&entry.event).send();
        let timeout = Duration::from_millis(self.settings.send_timeout_ms);

        match time::timeout(timeout, request).await {
            Err(_) => Err(SendError::Transient("send timed out".to_string())),
            Ok(Err(err)) => Err(SendError::Transient(err.to_string())),
            Ok(Ok(response)) => {
                let status = response.status();
                if status.is_success() {
                    Ok(())
                } else if status.is_server_error() {
                    Err(SendError::Transient(format!("server responded {status}")))
                } else {
                    // 4xx will not get better with retries.
                    Err(SendError::Permanent(format!("server responded {status}")))
                }
            }
        }
    }

    fn pop_front(&mut self, bucket: &str) -> Option<QueueEntry> {
        self.buffers
            .get_mut(bucket)
            .and_then(|buffer| buffer.pop_front())
    }

    /// Rewrite the pending file to the entries still buffered, oldest
    /// first.
    fn compact(&mut self) {
        let mut remaining: Vec<QueueEntry> = self
            .buffers
            .values()
            .flat_map(|buffer| buffer.iter().cloned())
            .collect();
        remaining.sort_by_key(|entry| entry.enqueued_at);

        if let Err(err) = self.queue.rewrite_pending(&remaining) {
            warn!("failed to compact pending queue file: {err}");
        }
    }
}

fn backoff_delay(attempts: u32) -> Duration {
    match attempts {
        0 | 1 => Duration::from_millis(1_000),
        2 => Duration::from_millis(2_000),
        3 => Duration::from_millis(4_000),
        _ => Duration::from_millis(10_000),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Event;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn entry(bucket: &str, offset_secs: i64, label: &str, pulsetime: f64) -> QueueEntry {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
            + chrono::Duration::seconds(offset_secs);
        let mut data = BTreeMap::new();
        data.insert("label".to_string(), json!(label));
        QueueEntry {
            bucket_id: bucket.to_string(),
            event: Event::new(ts, data),
            pulsetime,
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }

    fn worker(dir: &std::path::Path) -> Worker {
        Worker::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1".to_string(),
            DurableQueue::open(dir).unwrap(),
            DispatchSettings::default(),
        )
    }

    #[test]
    fn buffer_pre_merges_adjacent_identical_heartbeats() {
        let dir = tempdir().unwrap();
        let mut worker = worker(dir.path());

        worker.buffer(entry("bucket-a", 0, "test", 10.0));
        worker.buffer(entry("bucket-a", 1, "test", 10.0));
        worker.buffer(entry("bucket-a", 2, "other", 10.0));

        let buffer = &worker.buffers["bucket-a"];
        assert_eq!(buffer.len(), 2);
        assert_eq!(
            buffer[0].event.duration,
            chrono::Duration::seconds(1)
        );
    }

    #[test]
    fn buffer_keeps_buckets_independent() {
        let dir = tempdir().unwrap();
        let mut worker = worker(dir.path());

        worker.buffer(entry("bucket-a", 0, "test", 10.0));
        worker.buffer(entry("bucket-b", 1, "test", 10.0));

        assert_eq!(worker.buffers["bucket-a"].len(), 1);
        assert_eq!(worker.buffers["bucket-b"].len(), 1);
    }

    #[test]
    fn backoff_ladder_is_bounded() {
        assert_eq!(backoff_delay(1), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(3), Duration::from_millis(4_000));
        assert_eq!(backoff_delay(50), Duration::from_millis(10_000));
    }
}
