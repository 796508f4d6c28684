use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::{
    config::Config,
    error::{PulseError, Result},
    model::{BucketExport, BucketMeta, CreateBucket, Event},
    session::SessionManager,
    store::{EventStore, LIMIT_UNBOUNDED},
};

#[derive(Clone)]
pub struct AppState {
    store: Arc<EventStore>,
    sessions: Arc<SessionManager>,
    hostname: String,
    testing: bool,
}

impl AppState {
    pub fn new(store: Arc<EventStore>, sessions: Arc<SessionManager>, testing: bool) -> Self {
        Self {
            store,
            sessions,
            hostname: local_hostname(),
            testing,
        }
    }

}

/// Checks the session headers against the configured policy. A no-op
/// under `AuthPolicy::Disabled`.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<()> {
    let session_id = headers
        .get("session-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let session_key = headers
        .get("session-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if state.sessions.verify(session_id, session_key) {
        Ok(())
    } else {
        Err(PulseError::Unauthorized)
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/0/info", get(server_info))
        .route("/api/0/buckets", get(list_buckets))
        .route("/api/0/export", get(export_buckets))
        .route(
            "/api/0/buckets/{bucket_id}",
            get(get_bucket).post(create_bucket).delete(delete_bucket),
        )
        .route(
            "/api/0/buckets/{bucket_id}/events",
            get(get_events).post(post_events),
        )
        .route("/api/0/heartbeat/{bucket_id}", post(heartbeat))
        .route("/api/0/session/{session_id}/start", post(session_start))
        .route("/api/0/session/{session_id}/stop", post(session_stop))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(config: Config) -> Result<()> {
    let store = Arc::new(EventStore::new(local_hostname()));
    let sessions = Arc::new(SessionManager::new(config.auth));
    let state = AppState::new(store, sessions, config.testing);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Starting pulsedb server on {addr} (auth={:?})", config.auth);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("pulsedb server stopped");
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

#[derive(Serialize)]
struct HealthResponse<'a> {
    status: &'a str,
}

#[derive(Serialize)]
struct InfoResponse {
    hostname: String,
    version: &'static str,
    testing: bool,
}

async fn server_info(State(state): State<AppState>) -> Json<InfoResponse> {
    Json(InfoResponse {
        hostname: state.hostname.clone(),
        version: env!("CARGO_PKG_VERSION"),
        testing: state.testing,
    })
}

async fn list_buckets(State(state): State<AppState>) -> Json<HashMap<String, BucketMeta>> {
    let buckets = state
        .store
        .buckets()
        .into_iter()
        .map(|meta| (meta.id.clone(), meta))
        .collect();
    Json(buckets)
}

/// Full dump of every bucket with its events, newest first.
async fn export_buckets(State(state): State<AppState>) -> Json<HashMap<String, BucketExport>> {
    let mut export = HashMap::new();
    for meta in state.store.buckets() {
        // A bucket deleted while the dump runs is simply left out.
        let Ok(events) = state.store.get(&meta.id, None, None, LIMIT_UNBOUNDED) else {
            continue;
        };
        export.insert(meta.id.clone(), BucketExport { meta, events });
    }
    Json(export)
}

async fn get_bucket(
    State(state): State<AppState>,
    Path(bucket_id): Path<String>,
) -> Result<Json<BucketMeta>> {
    debug!("bucket metadata requested for '{bucket_id}'");
    Ok(Json(state.store.metadata(&bucket_id)?))
}

async fn create_bucket(
    State(state): State<AppState>,
    Path(bucket_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<CreateBucket>,
) -> Result<Json<BucketMeta>> {
    authorize(&state, &headers)?;
    Ok(Json(state.store.create_bucket(&bucket_id, &request.event_type)?))
}

async fn delete_bucket(
    State(state): State<AppState>,
    Path(bucket_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    authorize(&state, &headers)?;
    state.store.delete_bucket(&bucket_id)?;
    Ok(Json(Value::Object(Default::default())))
}

#[derive(Deserialize, Default)]
struct EventsQuery {
    #[serde(default)]
    start: Option<DateTime<Utc>>,
    #[serde(default)]
    end: Option<DateTime<Utc>>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn get_events(
    State(state): State<AppState>,
    Path(bucket_id): Path<String>,
    Query(params): Query<EventsQuery>,
) -> Result<Json<Vec<Event>>> {
    debug!("events requested for bucket '{bucket_id}'");
    let limit = params.limit.unwrap_or(LIMIT_UNBOUNDED);
    Ok(Json(state.store.get(&bucket_id, params.start, params.end, limit)?))
}

// Accepts a single event object or an array of events; the bulk path
// bypasses the merge engine. Payload shapes other than object/array are
// a server error, matching the contract clients rely on.
async fn post_events(
    State(state): State<AppState>,
    Path(bucket_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Json<Value>> {
    debug!("event post for bucket '{bucket_id}'");
    authorize(&state, &headers)?;
    match payload {
        Value::Object(_) => {
            let event: Event = serde_json::from_value(payload)?;
            let stored = state.store.insert(&bucket_id, event)?;
            Ok(Json(serde_json::to_value(stored)?))
        }
        Value::Array(_) => {
            let events: Vec<Event> = serde_json::from_value(payload)?;
            let stored = state.store.insert_many(&bucket_id, events)?;
            Ok(Json(serde_json::to_value(stored)?))
        }
        _ => Err(PulseError::Serialization(
            "event payload must be a JSON object or array".to_string(),
        )),
    }
}

#[derive(Deserialize)]
struct HeartbeatQuery {
    pulsetime: f64,
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(bucket_id): Path<String>,
    Query(params): Query<HeartbeatQuery>,
    headers: HeaderMap,
    Json(event): Json<Event>,
) -> Result<Json<Event>> {
    debug!(
        "heartbeat for bucket '{bucket_id}' (pulsetime={})",
        params.pulsetime
    );
    authorize(&state, &headers)?;
    Ok(Json(state.store.heartbeat(&bucket_id, event, params.pulsetime)?))
}

#[derive(Serialize)]
struct SessionStarted {
    session_key: String,
}

async fn session_start(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<SessionStarted> {
    let session_key = state.sessions.start_session(&session_id);
    Json(SessionStarted { session_key })
}

async fn session_stop(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<Value> {
    state.sessions.stop_session(&session_id);
    Json(Value::Object(Default::default()))
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
