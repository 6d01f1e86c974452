use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use axum::body::Bytes;
use axum::extract::multipart::{Field, MultipartError};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Semaphore};
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::checkpoint::{parse_http_url, redacted_url_for_display, CheckpointStore, FetchOutcome};
use crate::config::AppConfig;
use crate::inference::{ModelLoader, OnnxModelLoader};
use crate::media::{validate_extension, UploadKind};
use crate::pipeline::{AnimationInputs, AnimationOutput, Animator};
use crate::types::{AnimationOptions, DownloadProgress};

/// Finished animations kept for download; the oldest is evicted first.
pub const MAX_STORED_RESULTS: usize = 8;

/// Progress events are broadcast at most once per this many bytes.
const DOWNLOAD_EVENT_STRIDE: u64 = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: AppConfig,
    animator: Arc<Animator>,
    checkpoint: Arc<CheckpointStore>,
    animate_semaphore: Arc<Semaphore>,
    results: DashMap<Uuid, StoredResult>,
    result_order: Mutex<VecDeque<Uuid>>,
    download: Mutex<DownloadState>,
    download_events: broadcast::Sender<DownloadState>,
}

#[derive(Clone)]
struct StoredResult {
    source_png: Bytes,
    video_mp4: Option<Bytes>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DownloadState {
    #[default]
    Idle,
    Running {
        downloaded: u64,
        total: Option<u64>,
    },
    Completed {
        bytes: u64,
    },
    Failed {
        error: String,
    },
}

impl DownloadState {
    fn from_progress(progress: DownloadProgress) -> Self {
        Self::Running {
            downloaded: progress.downloaded,
            total: progress.total,
        }
    }
}

impl AppState {
    pub fn new(config: AppConfig, data_dir: PathBuf, loader: Arc<dyn ModelLoader>) -> Self {
        let checkpoint = Arc::new(CheckpointStore::new(config.checkpoint_path(&data_dir)));
        let animator = Arc::new(Animator::new(
            &config,
            &data_dir,
            loader,
            Arc::clone(&checkpoint),
        ));
        let (download_events, _) = broadcast::channel(64);

        Self {
            inner: Arc::new(AppStateInner {
                config,
                animator,
                checkpoint,
                animate_semaphore: Arc::new(Semaphore::new(1)),
                results: DashMap::new(),
                result_order: Mutex::new(VecDeque::new()),
                download: Mutex::new(DownloadState::Idle),
                download_events,
            }),
        }
    }

    fn download_state(&self) -> DownloadState {
        self.inner
            .download
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish_download_state(&self, state: DownloadState) {
        *self
            .inner
            .download
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = state.clone();
        // No subscribers is fine.
        let _ = self.inner.download_events.send(state);
    }

    /// Moves the download to `Running` unless one is already in flight.
    fn try_begin_download(&self) -> bool {
        let mut state = self
            .inner
            .download
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, DownloadState::Running { .. }) {
            return false;
        }
        *state = DownloadState::Running {
            downloaded: 0,
            total: None,
        };
        let _ = self.inner.download_events.send(state.clone());
        true
    }

    fn store_result(&self, output: &AnimationOutput) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.results.insert(
            id,
            StoredResult {
                source_png: Bytes::from(output.source_png.clone()),
                video_mp4: output.video_mp4.clone().map(Bytes::from),
                created_at: Utc::now(),
            },
        );

        let mut order = self
            .inner
            .result_order
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        order.push_back(id);
        while order.len() > MAX_STORED_RESULTS {
            if let Some(evicted) = order.pop_front() {
                self.inner.results.remove(&evicted);
                debug!(%evicted, "evicted stored animation result");
            }
        }
        id
    }
}

/// State wired to the ONNX Runtime loader for the configured backend.
pub fn app_state_with_config(config: AppConfig, data_dir: PathBuf) -> AppState {
    let loader = Arc::new(OnnxModelLoader::new(config.inference.backend));
    AppState::new(config, data_dir, loader)
}

// ─── Embedded page ───────────────────────────────────────────────────────────

#[derive(rust_embed::RustEmbed)]
#[folder = "../../web"]
struct FrontendAssets;

async fn embedded_static_handler(uri: axum::http::Uri) -> Response {
    let path = uri.path().trim_start_matches('/');
    let path = if path.is_empty() { "index.html" } else { path };

    match FrontendAssets::get(path) {
        Some(file) => {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            ([(header::CONTENT_TYPE, mime.as_ref())], file.data).into_response()
        }
        None => match FrontendAssets::get("index.html") {
            Some(index) => ([(header::CONTENT_TYPE, "text/html")], index.data).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    let upload_limit = state.inner.config.server.max_upload_bytes;

    Router::new()
        .route("/api/health", get(health))
        .route("/api/config", get(get_config))
        .route("/api/checkpoint", get(get_checkpoint))
        .route("/api/checkpoint/download", post(start_checkpoint_download))
        .route("/api/checkpoint/ws", any(checkpoint_ws))
        .route("/api/animate", post(animate))
        .route("/api/results/{id}/video.mp4", get(result_video))
        .route("/api/results/{id}/source.png", get(result_source))
        .route("/api/{*path}", any(api_route_not_found))
        .layer(DefaultBodyLimit::max(upload_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
        .fallback(embedded_static_handler)
}

/// Binds `host:port` and serves until the process is stopped.
pub async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "Starting puppeteer server");
    axum::serve(listener, app_router(state)).await?;
    Ok(())
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct CheckpointResponse {
    pub present: bool,
    pub path: String,
    pub default_url: String,
    pub model_loaded: bool,
    pub download: DownloadState,
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadRequest {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Serialize)]
pub struct DownloadResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct AnimateResponse {
    pub id: Uuid,
    pub frame_count: usize,
    pub source_url: String,
    pub video_url: Option<String>,
    pub notice: Option<String>,
    pub created_at: DateTime<Utc>,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn get_config(State(state): State<AppState>) -> Json<AppConfig> {
    Json(state.inner.config.clone())
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("api endpoint not found: /api/{path}"))
}

async fn get_checkpoint(State(state): State<AppState>) -> Json<CheckpointResponse> {
    Json(CheckpointResponse {
        present: state.inner.checkpoint.is_present(),
        path: state.inner.checkpoint.path().display().to_string(),
        default_url: state.inner.config.checkpoint.url.clone(),
        model_loaded: state.inner.animator.model_loaded(),
        download: state.download_state(),
    })
}

async fn start_checkpoint_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> Result<(StatusCode, Json<DownloadResponse>), AppError> {
    if state.inner.checkpoint.is_present() {
        return Ok((
            StatusCode::OK,
            Json(DownloadResponse {
                status: "already_present",
            }),
        ));
    }

    let requested = payload
        .url
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty());
    let url = match requested {
        Some(url) => url,
        None if !state.inner.config.checkpoint.url.trim().is_empty() => {
            state.inner.config.checkpoint.url.trim().to_string()
        }
        None => {
            return Err(AppError::BadRequest(
                "checkpoint URL is required".to_string(),
            ))
        }
    };
    let parsed = parse_http_url(&url).map_err(|e| AppError::BadRequest(format!("{e:#}")))?;

    if !state.try_begin_download() {
        return Err(AppError::Conflict(
            "checkpoint download already running".to_string(),
        ));
    }

    info!(url = %redacted_url_for_display(&parsed), "checkpoint download requested");
    let task_state = state.clone();
    tokio::task::spawn_blocking(move || run_checkpoint_download(&task_state, &url));

    Ok((
        StatusCode::ACCEPTED,
        Json(DownloadResponse { status: "started" }),
    ))
}

fn run_checkpoint_download(state: &AppState, url: &str) {
    let mut last_published = 0u64;
    let result = state.inner.checkpoint.ensure(url, &mut |progress| {
        let finished = progress.total == Some(progress.downloaded);
        if finished || progress.downloaded >= last_published + DOWNLOAD_EVENT_STRIDE {
            last_published = progress.downloaded;
            state.publish_download_state(DownloadState::from_progress(progress));
        }
    });

    let final_state = match result {
        Ok(FetchOutcome::Downloaded { bytes }) => DownloadState::Completed { bytes },
        Ok(FetchOutcome::AlreadyPresent) => {
            let bytes = std::fs::metadata(state.inner.checkpoint.path())
                .map(|meta| meta.len())
                .unwrap_or(0);
            DownloadState::Completed { bytes }
        }
        Err(err) => {
            error!("checkpoint download failed: {err:#}");
            DownloadState::Failed {
                error: format!("{err:#}"),
            }
        }
    };
    state.publish_download_state(final_state);
}

async fn checkpoint_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let rx = state.inner.download_events.subscribe();
    let current = state.download_state();
    ws.on_upgrade(move |socket| handle_ws(socket, current, rx))
}

async fn handle_ws(
    mut socket: WebSocket,
    current: DownloadState,
    mut rx: broadcast::Receiver<DownloadState>,
) {
    if send_json(&mut socket, &current).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(update) => {
                        if send_json(&mut socket, &update).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("WebSocket receiver lagged by {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }
}

async fn send_json(socket: &mut WebSocket, value: &DownloadState) -> Result<(), ()> {
    let json = serde_json::to_string(value).map_err(|_| ())?;
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

// ─── Animation ───────────────────────────────────────────────────────────────

struct Upload {
    file_name: String,
    bytes: Bytes,
}

#[derive(Default)]
struct AnimateForm {
    source: Option<Upload>,
    driving: Option<Upload>,
    relative: Option<bool>,
    adapt_scale: Option<bool>,
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        AppError::BadRequest(format!("invalid multipart body: {}", err.body_text()))
    }
}

async fn read_upload(field: Field<'_>, name: &str) -> Result<Upload, AppError> {
    let file_name = field
        .file_name()
        .map(str::to_string)
        .ok_or_else(|| AppError::BadRequest(format!("field '{name}' must be a file upload")))?;
    let bytes = field.bytes().await?;
    if bytes.is_empty() {
        return Err(AppError::BadRequest(format!("uploaded file '{file_name}' is empty")));
    }
    Ok(Upload { file_name, bytes })
}

fn parse_flag(name: &str, value: &str) -> Result<bool, AppError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "1" | "yes" => Ok(true),
        "false" | "off" | "0" | "no" | "" => Ok(false),
        other => Err(AppError::BadRequest(format!(
            "field '{name}' must be a boolean, got '{other}'"
        ))),
    }
}

async fn read_animate_form(mut multipart: Multipart) -> Result<AnimateForm, AppError> {
    let mut form = AnimateForm::default();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "source_image" => form.source = Some(read_upload(field, &name).await?),
            "driving_video" => form.driving = Some(read_upload(field, &name).await?),
            "relative" => form.relative = Some(parse_flag(&name, &field.text().await?)?),
            "adapt_scale" => form.adapt_scale = Some(parse_flag(&name, &field.text().await?)?),
            other => debug!(field = other, "ignoring unknown multipart field"),
        }
    }
    Ok(form)
}

async fn animate(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<AnimateResponse>, AppError> {
    let form = read_animate_form(multipart).await?;
    let source = form
        .source
        .ok_or_else(|| AppError::BadRequest("missing field 'source_image'".to_string()))?;
    let driving = form
        .driving
        .ok_or_else(|| AppError::BadRequest("missing field 'driving_video'".to_string()))?;

    validate_extension(&source.file_name, UploadKind::Image)
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    validate_extension(&driving.file_name, UploadKind::Video)
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let defaults = state.inner.config.animation.options();
    let options = AnimationOptions {
        relative: form.relative.unwrap_or(defaults.relative),
        adapt_scale: form.adapt_scale.unwrap_or(defaults.adapt_scale),
    };

    let _permit = state
        .inner
        .animate_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|e| AppError::Internal(format!("animation queue closed: {e}")))?;

    info!(
        source = %source.file_name,
        driving = %driving.file_name,
        relative = options.relative,
        adapt_scale = options.adapt_scale,
        "animation requested"
    );

    let animator = Arc::clone(&state.inner.animator);
    let output = tokio::task::spawn_blocking(move || {
        animator.run(
            AnimationInputs {
                source_name: &source.file_name,
                source_bytes: &source.bytes,
                driving_name: &driving.file_name,
                driving_bytes: &driving.bytes,
                options,
            },
            &mut |progress| {
                debug!(
                    stage = ?progress.stage,
                    done = progress.done,
                    total = ?progress.total,
                    "animation progress"
                )
            },
        )
    })
    .await
    .map_err(|e| AppError::Internal(format!("Animation failed: worker panicked: {e}")))?
    .map_err(|e| {
        error!("animation failed: {e:#}");
        AppError::Internal(format!("Animation failed: {e:#}"))
    })?;

    let id = state.store_result(&output);
    let created_at = state
        .inner
        .results
        .get(&id)
        .map(|stored| stored.created_at)
        .unwrap_or_else(Utc::now);

    Ok(Json(AnimateResponse {
        id,
        frame_count: output.frame_count,
        source_url: format!("/api/results/{id}/source.png"),
        video_url: output
            .video_mp4
            .as_ref()
            .map(|_| format!("/api/results/{id}/video.mp4")),
        notice: output.notice,
        created_at,
    }))
}

fn lookup_result(state: &AppState, id: &str) -> Result<StoredResult, AppError> {
    let parsed =
        Uuid::parse_str(id).map_err(|_| AppError::NotFound(format!("result not found: {id}")))?;
    state
        .inner
        .results
        .get(&parsed)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| AppError::NotFound(format!("result not found: {id}")))
}

async fn result_video(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let video = lookup_result(&state, &id)?
        .video_mp4
        .ok_or_else(|| AppError::NotFound(format!("result {id} has no video")))?;
    Ok(([(header::CONTENT_TYPE, "video/mp4")], video).into_response())
}

async fn result_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let stored = lookup_result(&state, &id)?;
    Ok(([(header::CONTENT_TYPE, "image/png")], stored.source_png).into_response())
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}
