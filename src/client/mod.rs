pub mod dispatcher;
pub mod queue;

use std::{collections::HashMap, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::{
    config::DispatchSettings,
    error::{PulseError, Result},
    merge,
    model::{BucketExport, BucketMeta, Event},
};

use dispatcher::DispatcherHandle;
use queue::{DurableQueue, QueueEntry};

#[derive(Debug, Deserialize)]
pub struct ServerInfo {
    pub hostname: String,
    pub version: String,
    pub testing: bool,
}

#[derive(Debug, Deserialize)]
pub struct SessionStarted {
    pub session_key: String,
}

/// Client for the pulsedb HTTP API. Synchronous calls go straight over
/// the wire; `connect` starts the background dispatcher that makes
/// `heartbeat(..., queued=true)` resilient to outages.
pub struct PulseClient {
    name: String,
    base_url: String,
    http: reqwest::Client,
    queue_dir: PathBuf,
    settings: DispatchSettings,
    dispatcher: Option<DispatcherHandle>,
}

impl PulseClient {
    pub fn new(name: &str, base_url: &str, queue_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            queue_dir: queue_dir.into(),
            settings: DispatchSettings::default(),
            dispatcher: None,
        }
    }

    pub fn with_settings(mut self, settings: DispatchSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start the queued-delivery dispatcher, replaying any heartbeats
    /// persisted by a previous run.
    pub fn connect(&mut self) -> Result<()> {
        if self.dispatcher.is_some() {
            return Ok(());
        }
        let queue = DurableQueue::open(&self.queue_dir)?;
        let handle = DispatcherHandle::spawn(
            self.http.clone(),
            self.base_url.clone(),
            queue,
            self.settings.clone(),
        )?;
        self.dispatcher = Some(handle);
        debug!("dispatcher started for client '{}'", self.name);
        Ok(())
    }

    /// Flush once more, then stop the dispatcher.
    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(handle) = self.dispatcher.take() {
            handle.shutdown().await?;
        }
        Ok(())
    }

    pub async fn get_info(&self) -> Result<ServerInfo> {
        let response = self.http.get(self.url("info")).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn get_buckets(&self) -> Result<HashMap<String, BucketMeta>> {
        let response = self.http.get(self.url("buckets")).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Dump of every bucket's metadata and complete event list.
    pub async fn export(&self) -> Result<HashMap<String, BucketExport>> {
        let response = self.http.get(self.url("export")).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn get_bucket(&self, bucket_id: &str) -> Result<BucketMeta> {
        let response = self
            .http
            .get(self.url(&format!("buckets/{bucket_id}")))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn create_bucket(&self, bucket_id: &str, event_type: &str) -> Result<BucketMeta> {
        let response = self
            .http
            .post(self.url(&format!("buckets/{bucket_id}")))
            .json(&serde_json::json!({ "type": event_type }))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn delete_bucket(&self, bucket_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("buckets/{bucket_id}")))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn get_events(
        &self,
        bucket_id: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Event>> {
        let mut request = self
            .http
            .get(self.url(&format!("buckets/{bucket_id}/events")))
            .query(&[("limit", limit.to_string())]);
        if let Some(start) = start {
            request = request.query(&[("start", start.to_rfc3339())]);
        }
        if let Some(end) = end {
            request = request.query(&[("end", end.to_rfc3339())]);
        }
        let response = request.send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn send_event(&self, bucket_id: &str, event: &Event) -> Result<Event> {
        let response = self
            .http
            .post(self.url(&format!("buckets/{bucket_id}/events")))
            .json(event)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn send_events(&self, bucket_id: &str, events: &[Event]) -> Result<Vec<Event>> {
        let response = self
            .http
            .post(self.url(&format!("buckets/{bucket_id}/events")))
            .json(events)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Report a heartbeat. With `queued` false the call blocks on the
    /// request and returns the server's resulting event; with `queued`
    /// true it is validated, persisted locally, handed to the
    /// dispatcher, and returns `None` without touching the network.
    pub async fn heartbeat(
        &self,
        bucket_id: &str,
        event: Event,
        pulsetime: f64,
        queued: bool,
    ) -> Result<Option<Event>> {
        merge::check_pulsetime(pulsetime)?;
        event.validate()?;

        if !queued {
            let response = self
                .http
                .post(self.url(&format!("heartbeat/{bucket_id}")))
                .query(&[("pulsetime", pulsetime.to_string())])
                .json(&event)
                .send()
                .await?;
            return Ok(Some(Self::check(response).await?.json().await?));
        }

        let handle = self.dispatcher.as_ref().ok_or_else(|| {
            PulseError::Config("queued heartbeats require a connected client".to_string())
        })?;

        let mut event = event;
        event.clamp_precision();
        let entry = QueueEntry {
            bucket_id: bucket_id.to_string(),
            event,
            pulsetime,
            enqueued_at: Utc::now(),
            attempts: 0,
        };

        handle.enqueue(entry)?;
        Ok(None)
    }

    /// Ask the dispatcher for an immediate flush cycle.
    pub async fn flush_queued(&self) -> Result<()> {
        match &self.dispatcher {
            Some(handle) => handle.flush().await,
            None => Ok(()),
        }
    }

    /// Heartbeats that exhausted their retries, awaiting intervention.
    pub fn parked_heartbeats(&self) -> Result<Vec<QueueEntry>> {
        DurableQueue::open(&self.queue_dir)?.load_failed()
    }

    /// Discard parked heartbeats once they have been dealt with.
    pub fn clear_parked(&self) -> Result<()> {
        DurableQueue::open(&self.queue_dir)?.clear_failed()
    }

    pub async fn start_session(&self, session_id: &str) -> Result<SessionStarted> {
        let response = self
            .http
            .post(self.url(&format!("session/{session_id}/start")))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn stop_session(&self, session_id: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("session/{session_id}/stop")))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/0/{path}", self.base_url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        match status.as_u16() {
            404 => Err(PulseError::BucketNotFound),
            400 => Err(PulseError::InvalidInput(body)),
            401 => Err(PulseError::Unauthorized),
            409 => Err(PulseError::Conflict(body)),
            _ => Err(PulseError::Transient(format!("server responded {status}: {body}"))),
        }
    }
}
