#![forbid(unsafe_code)]

//! Axum front-end for tubegrab.
//!
//! The browser posts a URL to `/info` to see which qualities exist, then to
//! `/download` to have yt-dlp fetch and convert it. Finished files are kept in
//! a short-lived cache and streamed back from `/file/{id}/{name}`.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Form, Json, Router,
    body::Body,
    extract::{Path as AxumPath, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use clap::Parser;
use mime_guess::{
    MimeGuess,
    mime::{self, Mime},
};
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal,
    sync::Semaphore,
};
use tokio_util::io::ReaderStream;
use tubegrab::{
    cache::{CacheEntry, CacheKey, DownloadCache, SweepReport, normalize_url, spawn_sweeper},
    config::{SettingsOverrides, resolve_settings},
    logging,
    media::{INVALID_FORMAT_MESSAGE, MediaSummary, OutputFormat, Variant, summarize},
    security::{ensure_not_root, is_safe_path_segment, is_safe_relative_path},
    ytdlp::{YtDlp, ensure_program_available},
};

#[derive(Debug, Parser)]
#[command(
    name = "tubegrab",
    version,
    about = "Web front-end that downloads and converts online media with yt-dlp"
)]
struct ServerArgs {
    /// Directory where downloads and the cache index are kept.
    #[arg(long)]
    downloads_dir: Option<PathBuf>,
    /// Directory holding index.html and static assets.
    #[arg(long)]
    www_root: Option<PathBuf>,
    /// Listen address.
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Alternate .env file.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl ServerArgs {
    fn into_overrides(self) -> SettingsOverrides {
        SettingsOverrides {
            downloads_dir: self.downloads_dir,
            www_root: self.www_root,
            host: self.host,
            port: self.port,
            env_path: self.env_file,
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/TUBEGRAB_HOST")
}

/// Shared state injected into every handler.
///
/// * `cache` owns the download directory and its TTL index.
/// * `jobs` caps how many yt-dlp processes run at once.
#[derive(Clone)]
struct AppState {
    cache: Arc<DownloadCache>,
    ytdlp: Arc<YtDlp>,
    jobs: Arc<Semaphore>,
    www_root: Arc<PathBuf>,
}

impl AppState {
    /// Runs a blocking yt-dlp call on the blocking pool once a job slot is
    /// free.
    async fn run_tool<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&YtDlp) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .jobs
            .clone()
            .acquire_owned()
            .await
            .context("job queue closed")?;
        let ytdlp = self.ytdlp.clone();
        tokio::task::spawn_blocking(move || job(&ytdlp))
            .await
            .context("download worker panicked")?
    }

    /// Downloads `key` into a fresh directory and records it in the cache.
    /// Returns the download URL and the media title.
    async fn fetch_into_cache(&self, key: CacheKey) -> ApiResult<(String, String)> {
        let variant = key.variant;
        let (download_id, output_dir) = self.cache.reserve();
        let url = key.url.clone();
        let result = self
            .run_tool(move |ytdlp| ytdlp.download(&url, variant, &output_dir))
            .await;
        let file = match result {
            Ok(file) => file,
            Err(err) => {
                self.cache.abandon(&download_id);
                tracing::warn!(url = %key.url, variant = %variant.label(), "download failed: {err:#}");
                return Err(ApiError::bad_request(format!("{err:#}")));
            }
        };

        let entry = CacheEntry {
            url: key.url,
            variant,
            download_id,
            file_name: file.file_name,
            file_path: file.path,
            created_at: Utc::now(),
        };
        let download_url = entry.download_url();
        if let Err(err) = self.cache.insert(entry) {
            // The entry is live in memory; only the on-disk index is behind.
            tracing::warn!("could not persist cache index: {err:#}");
        }
        Ok((download_url, file.title))
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

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize)]
struct InfoForm {
    url: String,
}

#[derive(Debug, Serialize)]
struct InfoResponse {
    success: bool,
    #[serde(flatten)]
    summary: MediaSummary,
}

#[derive(Deserialize)]
struct DownloadForm {
    url: String,
    format: String,
    #[serde(default)]
    quality: Option<String>,
}

#[derive(Debug, Serialize)]
struct DownloadResponse {
    success: bool,
    message: String,
    download_url: String,
    cached: bool,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    cached_entries: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServerArgs::parse();
    ensure_not_root("tubegrab")?;

    let settings = resolve_settings(args.into_overrides())?;
    if let Err(err) = logging::init_logging(settings.log_file.as_deref()) {
        logging::init_logging_stderr();
        tracing::warn!("log file unavailable, logging to stderr: {err:#}");
    }

    let host = parse_host_arg(&settings.host)?;
    let ytdlp = YtDlp::new(settings.ytdlp_bin.clone(), settings.ffmpeg_location.clone())
        .with_timeout(settings.job_timeout);
    check_external_tools(&ytdlp, settings.ffmpeg_location.as_deref());

    let cache = Arc::new(
        DownloadCache::open(settings.downloads_dir.clone(), settings.cache_ttl)
            .context("opening download cache")?,
    );
    startup_maintenance(cache.clone()).await?;
    let sweeper = spawn_sweeper(cache.clone(), settings.sweep_interval);

    let state = AppState {
        cache,
        ytdlp: Arc::new(ytdlp),
        jobs: Arc::new(Semaphore::new(settings.max_jobs)),
        www_root: Arc::new(settings.www_root.clone()),
    };

    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    tracing::info!(
        downloads = %settings.downloads_dir.display(),
        ttl_minutes = settings.cache_ttl.as_secs() / 60,
        sweep_secs = settings.sweep_interval.as_secs(),
        max_jobs = settings.max_jobs,
        job_timeout_secs = settings.job_timeout.as_secs(),
        "listening on http://{addr}"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running HTTP server")?;

    sweeper.abort();
    tracing::info!("shut down");
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/info", post(get_info))
        .route("/download", post(download))
        .route("/file/{download_id}/{file_name}", get(get_file))
        .route("/healthz", get(healthz))
        .fallback(static_fallback)
        .with_state(state)
}

/// Missing tools are not fatal: the server still serves cached files, and
/// requests report the spawn error.
fn check_external_tools(ytdlp: &YtDlp, ffmpeg_location: Option<&Path>) {
    if let Err(err) = ensure_program_available(ytdlp.binary(), "--version") {
        tracing::warn!("{err:#}");
    }
    let ffmpeg = match ffmpeg_location {
        Some(location) if location.is_dir() => location.join("ffmpeg"),
        Some(location) => location.to_path_buf(),
        None => PathBuf::from("ffmpeg"),
    };
    if let Err(err) = ensure_program_available(&ffmpeg, "-version") {
        tracing::warn!("{err:#}; mp3/wav conversion and mp4 merging will fail");
    }
}

/// Clears leftovers from the previous run on the blocking pool.
async fn startup_maintenance(cache: Arc<DownloadCache>) -> Result<SweepReport> {
    tokio::task::spawn_blocking(move || cache.run_maintenance(Utc::now()))
        .await
        .context("startup cache sweep")
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        tracing::error!("failed to install Ctrl+C handler: {err}");
    }
}

async fn index(State(state): State<AppState>) -> ApiResult<Response> {
    serve_www_path(&state.www_root, "/").await
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        cached_entries: state.cache.len(),
    })
}

async fn get_info(
    State(state): State<AppState>,
    Form(form): Form<InfoForm>,
) -> ApiResult<Json<InfoResponse>> {
    let url = normalize_url(&form.url).map_err(|err| ApiError::bad_request(err.to_string()))?;
    let info = state
        .run_tool(move |ytdlp| ytdlp.probe(&url))
        .await
        .map_err(|err| {
            tracing::warn!("info lookup failed: {err:#}");
            ApiError::bad_request(format!("{err:#}"))
        })?;

    Ok(Json(InfoResponse {
        success: true,
        summary: summarize(&info),
    }))
}

async fn download(
    State(state): State<AppState>,
    Form(form): Form<DownloadForm>,
) -> ApiResult<Json<DownloadResponse>> {
    let format =
        OutputFormat::parse(&form.format).ok_or_else(|| ApiError::bad_request(INVALID_FORMAT_MESSAGE))?;
    let variant = Variant::resolve(format, form.quality.as_deref())
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    let key =
        CacheKey::new(&form.url, variant).map_err(|err| ApiError::bad_request(err.to_string()))?;

    if let Some(entry) = state.cache.lookup(&key, Utc::now()) {
        tracing::info!(file = %entry.file_name, "serving cached file");
        return Ok(Json(DownloadResponse {
            success: true,
            message: "Serving cached file".to_string(),
            download_url: entry.download_url(),
            cached: true,
        }));
    }

    // The fetch runs detached so a dropped request still inserts or abandons
    // its reservation.
    let job_state = state.clone();
    let (download_url, title) = tokio::spawn(async move { job_state.fetch_into_cache(key).await })
        .await
        .map_err(|err| ApiError::internal(format!("download task failed: {err}")))??;

    Ok(Json(DownloadResponse {
        success: true,
        message: format!("Downloaded: {title}"),
        download_url,
        cached: false,
    }))
}

async fn get_file(
    State(state): State<AppState>,
    AxumPath((download_id, file_name)): AxumPath<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    if !is_safe_path_segment(&download_id) || !is_safe_path_segment(&file_name) {
        return Err(ApiError::not_found("File not found"));
    }
    let path = state.cache.root().join(&download_id).join(&file_name);
    let mut response = stream_file(path, Some(mime::APPLICATION_OCTET_STREAM), Some(&headers))
        .await
        .map_err(|_| ApiError::not_found("File not found"))?;
    response
        .headers_mut()
        .insert(header::CONTENT_DISPOSITION, attachment_header(&file_name));
    Ok(response)
}

/// `attachment; filename="..."` with anything outside a conservative ASCII
/// set replaced, so the header is always valid.
fn attachment_header(file_name: &str) -> HeaderValue {
    let safe: String = file_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ' | '(' | ')') {
                c
            } else {
                '_'
            }
        })
        .collect();
    HeaderValue::from_str(&format!("attachment; filename=\"{safe}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    match serve_www_path(&state.www_root, req.uri().path()).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    let target = match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => target.join("index.html"),
        Ok(_) => target,
        Err(_) => return Err(ApiError::not_found("not found")),
    };
    stream_file(target, None, None).await
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    if !is_safe_relative_path(trimmed) {
        return Err(ApiError::not_found("not found"));
    }
    Ok(root.join(trimmed))
}

fn header_value(value: String) -> ApiResult<HeaderValue> {
    HeaderValue::try_from(value).map_err(|err| ApiError::internal(err.to_string()))
}

async fn stream_file(
    path: PathBuf,
    mime: Option<Mime>,
    headers: Option<&HeaderMap>,
) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("not found"))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found("not found"));
    }
    let size = metadata.len();

    let content_type = mime.or_else(|| MimeGuess::from_path(&path).first());
    let range = headers
        .and_then(|headers| headers.get(header::RANGE))
        .and_then(|value| parse_range_header(value, size));

    let mut response = match range {
        Some((start, _)) if start >= size => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            response
                .headers_mut()
                .insert(header::CONTENT_RANGE, header_value(format!("bytes */{size}"))?);
            response
        }
        Some((start, end)) => {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|err| ApiError::internal(err.to_string()))?;
            let mut response = Body::from_stream(ReaderStream::new(file.take(length))).into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                header_value(format!("bytes {start}-{end}/{size}"))?,
            );
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            response
        }
        None => {
            let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
            response
        }
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(mime) = content_type
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}

fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?.trim();
    let (unit, range) = value.split_once('=')?;
    if unit.trim() != "bytes" {
        return None;
    }
    // Multi-range requests are answered with the full body.
    let range = range.trim();
    if range.is_empty() || range.contains(',') {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;

    if start_str.is_empty() {
        // Suffix range: "-N" means the last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        if suffix_len >= size {
            return Some((0, size.saturating_sub(1)));
        }
        return Some((size - suffix_len, size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end))
}
