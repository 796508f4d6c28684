use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{error::Result, model::Event};

const PENDING_FILE: &str = "pending.jsonl";
const FAILED_FILE: &str = "failed.jsonl";

/// One queued heartbeat, serialized as a single JSON line so the
/// pending file can be appended to cheaply and replayed after a crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub bucket_id: String,
    pub event: Event,
    pub pulsetime: f64,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
}

/// File-backed heartbeat queue. Pending entries survive process
/// restarts; entries that exhaust their retries are parked in a sibling
/// failed file for operator inspection or later replay.
pub struct DurableQueue {
    pending_path: PathBuf,
    failed_path: PathBuf,
}

impl DurableQueue {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            pending_path: dir.join(PENDING_FILE),
            failed_path: dir.join(FAILED_FILE),
        })
    }

    pub fn append_pending(&self, entry: &QueueEntry) -> Result<()> {
        append_line(&self.pending_path, entry)
    }

    pub fn load_pending(&self) -> Result<Vec<QueueEntry>> {
        read_lines(&self.pending_path)
    }

    /// Compact the pending file down to the entries still awaiting
    /// delivery. Writes a sibling temp file and renames it into place so
    /// a crash mid-compaction never loses pending entries.
    pub fn rewrite_pending(&self, entries: &[QueueEntry]) -> Result<()> {
        let tmp_path = self.pending_path.with_extension("jsonl.tmp");
        let mut tmp = fs::File::create(&tmp_path)?;
        for entry in entries {
            serde_json::to_writer(&mut tmp, entry)?;
            tmp.write_all(b"\n")?;
        }
        tmp.sync_all()?;
        fs::rename(&tmp_path, &self.pending_path)?;
        Ok(())
    }

    pub fn park(&self, entry: &QueueEntry) -> Result<()> {
        append_line(&self.failed_path, entry)
    }

    pub fn load_failed(&self) -> Result<Vec<QueueEntry>> {
        read_lines(&self.failed_path)
    }

    pub fn clear_failed(&self) -> Result<()> {
        if self.failed_path.exists() {
            fs::remove_file(&self.failed_path)?;
        }
        Ok(())
    }
}

fn append_line(path: &Path, entry: &QueueEntry) -> Result<()> {
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    serde_json::to_writer(&mut file, entry)?;
    file.write_all(b"\n")?;
    Ok(())
}

fn read_lines(path: &Path) -> Result<Vec<QueueEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let contents = fs::read_to_string(path)?;
    let mut entries = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                // A torn write at the tail is expected after a crash;
                // anything else deserves a look.
                warn!("skipping unreadable queue record in {}: {err}", path.display());
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn entry(bucket: &str, offset_secs: i64) -> QueueEntry {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
            + chrono::Duration::seconds(offset_secs);
        QueueEntry {
            bucket_id: bucket.to_string(),
            event: Event::new(ts, BTreeMap::new()),
            pulsetime: 10.0,
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }

    #[test]
    fn pending_entries_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let queue = DurableQueue::open(dir.path()).unwrap();
            queue.append_pending(&entry("bucket-a", 0)).unwrap();
            queue.append_pending(&entry("bucket-a", 1)).unwrap();
        }

        let queue = DurableQueue::open(dir.path()).unwrap();
        let pending = queue.load_pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].bucket_id, "bucket-a");
        assert!(pending[0].event.timestamp < pending[1].event.timestamp);
    }

    #[test]
    fn rewrite_compacts_to_remaining_entries() {
        let dir = tempdir().unwrap();
        let queue = DurableQueue::open(dir.path()).unwrap();
        for i in 0..5 {
            queue.append_pending(&entry("bucket-a", i)).unwrap();
        }

        let mut pending = queue.load_pending().unwrap();
        let remaining = pending.split_off(3);
        queue.rewrite_pending(&remaining).unwrap();

        let reloaded = queue.load_pending().unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded[0].event.timestamp, remaining[0].event.timestamp);
    }

    #[test]
    fn parked_entries_go_to_the_failed_file() {
        let dir = tempdir().unwrap();
        let queue = DurableQueue::open(dir.path()).unwrap();
        queue.park(&entry("bucket-a", 0)).unwrap();

        assert!(queue.load_pending().unwrap().is_empty());
        assert_eq!(queue.load_failed().unwrap().len(), 1);

        queue.clear_failed().unwrap();
        assert!(queue.load_failed().unwrap().is_empty());
    }

    #[test]
    fn torn_tail_record_is_skipped() {
        let dir = tempdir().unwrap();
        let queue = DurableQueue::open(dir.path()).unwrap();
        queue.append_pending(&entry("bucket-a", 0)).unwrap();

        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join(PENDING_FILE))
            .unwrap();
        file.write_all(b"{\"bucket_id\":\"trunc").unwrap();

        let pending = queue.load_pending().unwrap();
        assert_eq!(pending.len(), 1);
    }
}
