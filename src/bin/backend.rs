#![forbid(unsafe_code)]

//! Axum backend behind the TubeIntel dashboard.
//!
//! Serves tracked channels, stored videos and collections out of the local
//! database, runs sync requests against the YouTube Data API and keeps stale
//! channels fresh with a periodic background pass. Long full syncs run as
//! jobs whose progress the dashboard polls.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::Utc;
use clap::Parser;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{signal, time::MissedTickBehavior};
use tracing::{error, info, warn};
use tubeintel::{
    config::{RuntimeOverrides, resolve_runtime_settings},
    error::{SourceError, StoreError},
    filters::{
        ChannelFilter, RawChannelFilter, RawVideoFilter, SortKey, VideoFilter, filter_channels,
        sort_videos,
    },
    library::{ChannelStore, CollectionStore},
    logging,
    models::{
        BackgroundSyncReport, ChannelSyncStatus, Collection, FullSyncOutcome, SyncProgress,
        SyncRequest, SyncResult, TrackedChannel, VideoRecord,
    },
    store::{Database, SyncStatusStore, VideoStore},
    sync::{SyncConfig, SyncService},
    youtube::{VideoSource, YouTubeClient},
};

#[derive(Debug, Parser)]
#[command(name = "backend", about = "TubeIntel HTTP API")]
struct BackendArgs {
    /// Database file; overrides TUBEINTEL_DB.
    #[arg(long, value_name = "PATH")]
    database: Option<PathBuf>,
    /// Alternative `.env` file.
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long, value_name = "KEY")]
    api_key: Option<String>,
}

impl BackendArgs {
    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            database_path: self.database.clone(),
            youtube_api_key: self.api_key.clone(),
            host: self.host.clone(),
            port: self.port,
            env_path: self.env_file.clone(),
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/TUBEINTEL_HOST")
}

/// Shared state injected into every handler. Every member is cheap to clone.
#[derive(Clone)]
struct AppState {
    videos: VideoStore,
    statuses: SyncStatusStore,
    channels: ChannelStore,
    collections: CollectionStore,
    source: Arc<dyn VideoSource>,
    sync: SyncService,
    jobs: SyncJobManager,
}

impl AppState {
    fn new(db: Database, source: Arc<dyn VideoSource>, config: SyncConfig) -> Self {
        Self {
            videos: VideoStore::new(db.clone()),
            statuses: SyncStatusStore::new(db.clone()),
            channels: ChannelStore::new(db.clone()),
            collections: CollectionStore::new(db.clone()),
            sync: SyncService::new(source.clone(), db, config),
            source,
            jobs: SyncJobManager::default(),
        }
    }
}

/// Finished jobs kept around for polling; older ones are dropped.
const MAX_FINISHED_JOBS: usize = 100;

/// Tracks full-sync jobs started through the API. Jobs live in memory only;
/// a restart forgets them.
#[derive(Clone, Default)]
struct SyncJobManager {
    inner: Arc<SyncJobManagerInner>,
}

#[derive(Default)]
struct SyncJobManagerInner {
    jobs: Mutex<HashMap<String, SyncJob>>,
    counter: AtomicUsize,
}

#[derive(Clone)]
struct SyncJob {
    /// Creation order.
    seq: usize,
    id: String,
    channel_id: String,
    status: JobStatus,
    fetched: usize,
    estimated_total: Option<usize>,
    video_count: Option<usize>,
    message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncJobResponse {
    id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncJobStatus {
    id: String,
    channel_id: String,
    status: String,
    /// 0-100. Stays below 100 until the job finishes.
    progress: u8,
    fetched: usize,
    estimated_total: Option<usize>,
    video_count: Option<usize>,
    message: String,
}

impl SyncJobManager {
    fn start_full_sync(&self, service: &SyncService, channel_id: String) -> String {
        let (seq, job_id) = self.next_job_id();
        {
            let mut jobs = self.inner.jobs.lock();
            prune_finished_jobs(&mut jobs, MAX_FINISHED_JOBS);
            jobs.insert(
                job_id.clone(),
                SyncJob {
                    seq,
                    id: job_id.clone(),
                    channel_id: channel_id.clone(),
                    status: JobStatus::Queued,
                    fetched: 0,
                    estimated_total: None,
                    video_count: None,
                    message: "Queued".to_string(),
                },
            );
        }

        let progress_inner = self.inner.clone();
        let progress_job = job_id.clone();
        let service = service
            .clone()
            .with_progress(Arc::new(move |progress: SyncProgress| {
                update_job(&progress_inner, &progress_job, |job| {
                    job.fetched = progress.fetched;
                    job.estimated_total = progress.estimated_total;
                });
            }));

        let inner = self.inner.clone();
        let job_id_clone = job_id.clone();
        tokio::spawn(async move {
            update_job(&inner, &job_id_clone, |job| {
                job.status = JobStatus::Running;
                job.message = "Fetching uploads".to_string();
            });
            let outcome = service.full_sync_channel(&channel_id).await;
            update_job(&inner, &job_id_clone, |job| apply_outcome(job, outcome));
        });

        job_id
    }

    fn get_status(&self, job_id: &str) -> Option<SyncJobStatus> {
        let job = self.inner.jobs.lock().get(job_id).cloned()?;
        Some(SyncJobStatus {
            progress: progress_percent(&job),
            id: job.id,
            channel_id: job.channel_id,
            status: job.status.as_str().to_string(),
            fetched: job.fetched,
            estimated_total: job.estimated_total,
            video_count: job.video_count,
            message: job.message,
        })
    }

    fn next_job_id(&self) -> (usize, String) {
        let id = self.inner.counter.fetch_add(1, Ordering::Relaxed) + 1;
        (id, format!("sync-{id}"))
    }
}

/// Keeps the `keep` most recent finished jobs. Queued and running jobs stay.
fn prune_finished_jobs(jobs: &mut HashMap<String, SyncJob>, keep: usize) {
    let mut finished: Vec<(usize, String)> = jobs
        .values()
        .filter(|job| job.status.is_finished())
        .map(|job| (job.seq, job.id.clone()))
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort_unstable_by(|a, b| b.0.cmp(&a.0));
    for (_, id) in finished.into_iter().skip(keep) {
        jobs.remove(&id);
    }
}

fn update_job(inner: &SyncJobManagerInner, job_id: &str, apply: impl FnOnce(&mut SyncJob)) {
    if let Some(job) = inner.jobs.lock().get_mut(job_id) {
        apply(job);
    }
}

fn apply_outcome(job: &mut SyncJob, outcome: FullSyncOutcome) {
    if outcome.success {
        job.status = JobStatus::Completed;
        job.video_count = Some(outcome.video_count);
        job.message = format!("Synced {} videos", outcome.video_count);
    } else {
        job.status = JobStatus::Failed;
        job.message = format!(
            "Failed: {}",
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
}

fn progress_percent(job: &SyncJob) -> u8 {
    if job.status.is_finished() {
        return 100;
    }
    match job.estimated_total {
        Some(total) if total > 0 => (job.fetched.saturating_mul(100) / total).min(99) as u8,
        _ => 0,
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ApiError::not_found(format!("{what} not found")),
            other => {
                error!(error = %other, "database failure");
                ApiError::internal(other.to_string())
            }
        }
    }
}

impl From<SourceError> for ApiError {
    fn from(err: SourceError) -> Self {
        let status = match &err {
            SourceError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            SourceError::NotFound(_) => StatusCode::NOT_FOUND,
            SourceError::Api { .. } | SourceError::Transport(_) | SourceError::Decode(_) => {
                StatusCode::BAD_GATEWAY
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("tubeintel=info,backend=info");

    let args = BackendArgs::parse();
    let settings = resolve_runtime_settings(args.overrides())?;
    let api_key = settings.require_api_key()?.to_string();
    let host = parse_host_arg(&settings.host)?;

    let db = Database::open(&settings.database_path)
        .await
        .with_context(|| format!("opening database {}", settings.database_path.display()))?;
    let source: Arc<dyn VideoSource> = Arc::new(YouTubeClient::new(
        api_key,
        settings.youtube_api_base.clone(),
    ));
    let config = SyncConfig::default().with_max_age_minutes(settings.sync_max_age_minutes);
    let state = AppState::new(db, source, config);

    if settings.background_sync_minutes > 0 {
        let every = Duration::from_secs(settings.background_sync_minutes.saturating_mul(60));
        spawn_background_sync(state.clone(), every);
        info!(minutes = settings.background_sync_minutes, "background sync enabled");
    } else {
        info!("background sync disabled");
    }

    let app = build_router(state);
    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(%addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/channels", get(list_channels).post(add_channel))
        .route("/api/channels/filter", post(filter_tracked_channels))
        .route(
            "/api/channels/{id}",
            get(get_tracked_channel).delete(delete_channel),
        )
        .route("/api/channels/{id}/status", get(get_channel_status))
        .route("/api/sync", post(sync_videos))
        .route("/api/sync/full/{id}", post(start_full_sync))
        .route("/api/sync/jobs/{id}", get(get_sync_job))
        .route("/api/videos/query", post(query_videos))
        .route(
            "/api/collections",
            get(list_collections).post(create_collection),
        )
        .route(
            "/api/collections/{id}",
            put(rename_collection).delete(delete_collection),
        )
        .route(
            "/api/collections/{id}/videos",
            get(list_collection_videos).post(add_collection_video),
        )
        .route(
            "/api/collections/{id}/videos/{video_id}",
            axum::routing::delete(remove_collection_video),
        )
        .fallback(|| async { ApiError::not_found("endpoint not found") })
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
}

fn spawn_background_sync(state: AppState, every: Duration) {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + every;
        let mut ticker = tokio::time::interval_at(start, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            run_background_pass(&state).await;
        }
    });
}

async fn run_background_pass(state: &AppState) -> Option<BackgroundSyncReport> {
    match state.channels.ids().await {
        Ok(ids) if ids.is_empty() => None,
        Ok(ids) => Some(state.sync.background_sync_all_channels(&ids).await),
        Err(err) => {
            warn!(error = %err, "could not list tracked channels for background sync");
            None
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChannelOverview {
    #[serde(flatten)]
    channel: TrackedChannel,
    sync_status: Option<ChannelSyncStatus>,
}

async fn list_channels(State(state): State<AppState>) -> ApiResult<Json<Vec<ChannelOverview>>> {
    let channels = state.channels.list().await?;
    let mut statuses: HashMap<String, ChannelSyncStatus> = state
        .statuses
        .list()
        .await?
        .into_iter()
        .map(|status| (status.channel_id.clone(), status))
        .collect();
    let overview = channels
        .into_iter()
        .map(|channel| ChannelOverview {
            sync_status: statuses.remove(&channel.channel_id),
            channel,
        })
        .collect();
    Ok(Json(overview))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddChannelRequest {
    channel_id: String,
}

async fn add_channel(
    State(state): State<AppState>,
    Json(payload): Json<AddChannelRequest>,
) -> ApiResult<(StatusCode, Json<TrackedChannel>)> {
    let channel_id = payload.channel_id.trim();
    if channel_id.is_empty() {
        return Err(ApiError::bad_request("channelId is required"));
    }

    let info = state.source.get_channel(channel_id).await?;
    let channel = TrackedChannel {
        channel_id: info.channel_id,
        title: info.title,
        thumbnail_url: info.thumbnail_url,
        subscriber_count: info.subscriber_count,
        video_count: info.video_count,
        added_at: Utc::now(),
    };
    state.channels.add(&channel).await?;
    let stored = state
        .channels
        .get(&channel.channel_id)
        .await?
        .unwrap_or(channel);
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn get_tracked_channel(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<ChannelOverview>> {
    let channel = state
        .channels
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("channel not found"))?;
    let sync_status = state.statuses.get(&id).await?;
    Ok(Json(ChannelOverview {
        channel,
        sync_status,
    }))
}

/// Stops tracking the channel. Its stored videos stay, since collections may
/// reference them.
async fn delete_channel(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<StatusCode> {
    if !state.channels.remove(&id).await? {
        return Err(ApiError::not_found("channel not found"));
    }
    state.statuses.remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_channel_status(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<ChannelSyncStatus>> {
    let status = state
        .statuses
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("channel has never been synced"))?;
    Ok(Json(status))
}

async fn sync_videos(
    State(state): State<AppState>,
    Json(request): Json<SyncRequest>,
) -> ApiResult<Json<SyncResult>> {
    let channel_ids: Vec<String> = request
        .channel_ids
        .iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect();
    if channel_ids.is_empty() {
        return Err(ApiError::bad_request("channelIds must not be empty"));
    }
    let result = state
        .sync
        .sync_channels_videos(&channel_ids, request.limit(), request.force_refresh)
        .await;
    Ok(Json(result))
}

async fn start_full_sync(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<(StatusCode, Json<SyncJobResponse>)> {
    let channel_id = id.trim().to_string();
    if channel_id.is_empty() {
        return Err(ApiError::bad_request("channel id is required"));
    }
    let job_id = state.jobs.start_full_sync(&state.sync, channel_id);
    Ok((StatusCode::ACCEPTED, Json(SyncJobResponse { id: job_id })))
}

async fn get_sync_job(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<SyncJobStatus>> {
    let status = state
        .jobs
        .get_status(&id)
        .ok_or_else(|| ApiError::not_found("sync job not found"))?;
    Ok(Json(status))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct VideoQuery {
    /// Defaults to every tracked channel.
    channel_ids: Option<Vec<String>>,
    per_channel_limit: Option<usize>,
    filter: RawVideoFilter,
    sort: SortKey,
}

async fn query_videos(
    State(state): State<AppState>,
    Json(query): Json<VideoQuery>,
) -> ApiResult<Json<Vec<VideoRecord>>> {
    let channel_ids = match query.channel_ids {
        Some(ids) => ids,
        None => state.channels.ids().await?,
    };
    let limit = query.per_channel_limit.filter(|limit| *limit > 0);
    let stored = state.videos.get_for_channels(&channel_ids, limit).await?;

    let filter = VideoFilter::from_raw(&query.filter);
    let mut videos = filter.apply(&stored, Utc::now());
    sort_videos(&mut videos, query.sort);
    Ok(Json(videos))
}

async fn filter_tracked_channels(
    State(state): State<AppState>,
    Json(raw): Json<RawChannelFilter>,
) -> ApiResult<Json<Vec<TrackedChannel>>> {
    let channels = state.channels.list().await?;
    let filter = ChannelFilter::from_raw(&raw);
    Ok(Json(filter_channels(&channels, &filter)))
}

#[derive(Debug, Deserialize)]
struct CollectionNameRequest {
    name: String,
}

fn validated_name(name: &str) -> ApiResult<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ApiError::bad_request("name must not be empty"));
    }
    Ok(trimmed)
}

async fn list_collections(State(state): State<AppState>) -> ApiResult<Json<Vec<Collection>>> {
    Ok(Json(state.collections.list().await?))
}

async fn create_collection(
    State(state): State<AppState>,
    Json(payload): Json<CollectionNameRequest>,
) -> ApiResult<(StatusCode, Json<Collection>)> {
    let name = validated_name(&payload.name)?;
    let collection = state.collections.create(name).await?;
    Ok((StatusCode::CREATED, Json(collection)))
}

async fn rename_collection(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
    Json(payload): Json<CollectionNameRequest>,
) -> ApiResult<Json<Collection>> {
    let name = validated_name(&payload.name)?;
    Ok(Json(state.collections.rename(id, name).await?))
}

async fn delete_collection(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult<StatusCode> {
    if !state.collections.delete(id).await? {
        return Err(ApiError::not_found("collection not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn list_collection_videos(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult<Json<Vec<VideoRecord>>> {
    if state.collections.get(id).await?.is_none() {
        return Err(ApiError::not_found("collection not found"));
    }
    let ids = state.collections.video_ids(id).await?;
    Ok(Json(state.videos.get_many(&ids).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddCollectionVideoRequest {
    video_id: String,
}

async fn add_collection_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
    Json(payload): Json<AddCollectionVideoRequest>,
) -> ApiResult<StatusCode> {
    state
        .collections
        .add_video(id, payload.video_id.trim())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_collection_video(
    State(state): State<AppState>,
    AxumPath((id, video_id)): AxumPath<(i64, String)>,
) -> ApiResult<StatusCode> {
    if !state.collections.remove_video(id, &video_id).await? {
        return Err(ApiError::not_found("video is not in this collection"));
    }
    Ok(StatusCode::NO_CONTENT)
}
