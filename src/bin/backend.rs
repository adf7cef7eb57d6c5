#![forbid(unsafe_code)]

//! Axum backend for GrabTube: resolves video URLs to metadata, runs
//! asynchronous yt-dlp download jobs, streams their progress over SSE, and
//! delivers each finished artifact exactly once.
//!
//! The binary is thin plumbing; the job registry, state machine, and
//! subprocess handling live in the library crate.

use std::{
    convert::Infallible,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    pin::Pin,
    sync::Arc,
    task::{Context as TaskContext, Poll},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Path as AxumPath, State},
    http::{HeaderMap, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt};
use grabtube_tools::config::{RuntimeOverrides, resolve_runtime_paths};
use grabtube_tools::fetcher::{DownloadRequest, Fetcher, MetadataSummary};
use grabtube_tools::jobs::{
    DeliveryFormat, JobRegistry, JobSnapshot, JobStatus, is_safe_job_id, remove_artifact,
};
use grabtube_tools::security::{ensure_not_root, ensure_writable_root};
use grabtube_tools::urls::normalize_url;
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokio::{fs::File, signal};
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;

/// How often an open progress stream re-reads the registry.
const PROGRESS_TICK: Duration = Duration::from_millis(500);

/// How often the retention sweeper wakes up.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Jobs older than this are evicted regardless of status. Generous enough
/// for any realistic download, short enough that uncollected artifacts do
/// not pile up.
fn max_job_age() -> chrono::Duration {
    chrono::Duration::hours(1)
}

#[derive(Debug, Clone)]
struct BackendArgs {
    output_dir: PathBuf,
    port: u16,
    listen_host: IpAddr,
    ytdlp: Option<PathBuf>,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut output_dir_override: Option<PathBuf> = None;
        let mut port_override: Option<u16> = None;
        let mut host_override: Option<IpAddr> = None;
        let mut ytdlp_override: Option<PathBuf> = None;
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--output-dir=") {
                output_dir_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                port_override = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                host_override = Some(parse_host_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--ytdlp=") {
                ytdlp_override = Some(PathBuf::from(value));
                continue;
            }

            match arg.as_str() {
                "--output-dir" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--output-dir requires a value"))?;
                    output_dir_override = Some(PathBuf::from(value));
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    port_override = Some(parse_port_arg(&value)?);
                }
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    host_override = Some(parse_host_arg(&value)?);
                }
                "--ytdlp" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--ytdlp requires a value"))?;
                    ytdlp_override = Some(PathBuf::from(value));
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        let runtime = resolve_runtime_paths(RuntimeOverrides {
            downloads_root: output_dir_override,
            grabtube_port: port_override,
            grabtube_host: host_override.map(|host| host.to_string()),
            ytdlp_bin: ytdlp_override,
            ..RuntimeOverrides::default()
        })?;

        Ok(Self {
            output_dir: runtime.downloads_root,
            port: runtime.grabtube_port,
            listen_host: parse_host_arg(&runtime.grabtube_host)?,
            ytdlp: runtime.ytdlp_bin,
        })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/GRABTUBE_HOST")
}

/// Shared state injected into every handler: the process-wide job registry
/// and the yt-dlp handle. Both are cheap clones.
#[derive(Clone)]
struct AppState {
    registry: JobRegistry,
    fetcher: Arc<Fetcher>,
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
        let mut headers = HeaderMap::new();
        if let Ok(value) = "application/json".parse() {
            headers.insert(header::CONTENT_TYPE, value);
        }
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize)]
struct InfoRequest {
    url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadBody {
    url: Option<String>,
    job_id: Option<String>,
    format: Option<String>,
    quality: Option<u32>,
    title: Option<String>,
}

#[derive(Debug, Serialize)]
struct StartedResponse {
    started: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let BackendArgs {
        output_dir,
        port,
        listen_host,
        ytdlp,
    } = BackendArgs::parse()?;

    ensure_not_root("backend")?;
    ensure_writable_root(&output_dir)?;

    let registry = JobRegistry::new();
    let state = AppState {
        registry: registry.clone(),
        fetcher: Arc::new(Fetcher::new(output_dir, ytdlp)),
    };

    tokio::spawn(retention_sweeper(registry));

    let app = Router::new()
        .route("/info", post(get_info))
        .route("/download", post(start_download))
        .route("/progress/{job_id}", get(stream_progress))
        .route("/file/{job_id}", get(deliver_file))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::new(listen_host, port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    println!("GrabTube backend listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

async fn shutdown_signal() {
    // We do not propagate this error up because it only affects graceful
    // shutdown; the process still terminates when Ctrl+C fires.
    if let Err(err) = signal::ctrl_c().await {
        eprintln!("Failed to install Ctrl+C handler: {}", err);
    }
}

/// Periodically reclaims jobs whose client never collected the artifact,
/// along with stuck or failed ones. The only path out of the registry
/// besides delivery.
async fn retention_sweeper(registry: JobRegistry) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        // The sweep deletes files, so it runs on the blocking pool.
        let sweep_registry = registry.clone();
        let evicted =
            tokio::task::spawn_blocking(move || sweep_registry.sweep_stale(max_job_age()))
                .await
                .unwrap_or(0);
        if evicted > 0 {
            println!("Retention sweep evicted {evicted} stale job(s)");
        }
    }
}

async fn get_info(
    State(state): State<AppState>,
    Json(payload): Json<InfoRequest>,
) -> ApiResult<Json<MetadataSummary>> {
    let url = payload
        .url
        .ok_or_else(|| ApiError::bad_request("url is required"))?;
    let normalized = normalize_url(&url).map_err(|err| ApiError::bad_request(err.to_string()))?;

    let summary = state
        .fetcher
        .resolve_metadata(&normalized)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(summary))
}

async fn start_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadBody>,
) -> ApiResult<Json<StartedResponse>> {
    let (Some(url), Some(job_id)) = (payload.url, payload.job_id) else {
        return Err(ApiError::bad_request("url and jobId are required"));
    };
    if !is_safe_job_id(&job_id) {
        return Err(ApiError::bad_request("jobId is not a safe file name"));
    }
    let normalized = normalize_url(&url).map_err(|err| ApiError::bad_request(err.to_string()))?;

    let request = DownloadRequest {
        url: normalized,
        job_id,
        format: DeliveryFormat::parse(payload.format.as_deref()),
        quality: payload.quality,
        title: payload.title,
    };
    if !state.fetcher.submit(&state.registry, request) {
        return Err(ApiError::bad_request("a job with this id already exists"));
    }

    Ok(Json(StartedResponse { started: true }))
}

/// Polls the registry on a fixed tick and yields one snapshot per tick.
/// Ends after the first terminal snapshot, or after a single error snapshot
/// when the job id is unknown at open or vanishes mid-stream.
fn snapshot_events(registry: JobRegistry, job_id: String) -> impl Stream<Item = JobSnapshot> {
    async_stream::stream! {
        let mut ticker = tokio::time::interval(PROGRESS_TICK);
        loop {
            ticker.tick().await;
            match registry.snapshot(&job_id) {
                None => {
                    yield JobSnapshot::unknown();
                    break;
                }
                Some(snapshot) => {
                    let terminal = snapshot.status.is_terminal();
                    yield snapshot;
                    if terminal {
                        break;
                    }
                }
            }
        }
    }
}

async fn stream_progress(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = snapshot_events(state.registry.clone(), job_id).map(|snapshot| {
        let data = serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string());
        Ok::<_, Infallible>(Event::default().data(data))
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

async fn deliver_file(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<String>,
) -> ApiResult<Response> {
    let job = state
        .registry
        .get(&job_id)
        .ok_or_else(|| ApiError::not_found("job not found"))?;
    // `file_path` may hold the advisory destination while the subprocess is
    // still writing; only a Done job has an artifact worth handing out.
    if job.status != JobStatus::Done {
        return Err(ApiError::not_found("file not ready"));
    }
    let path = job
        .file_path
        .clone()
        .ok_or_else(|| ApiError::not_found("file not ready"))?;
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("bin");
    let filename = format!("{}.{extension}", sanitize_title(job.title.as_deref()));
    let mime = MimeGuess::from_path(&path).first();

    let stream = DeliveryStream::new(file, state.registry.clone(), job_id);
    let mut response = Body::from_stream(stream).into_response();
    response.headers_mut().insert(
        header::CONTENT_DISPOSITION,
        format!("attachment; filename=\"{filename}\"")
            .parse()
            .map_err(|_| ApiError::internal("could not build disposition header"))?,
    );
    if let Some(mime) = mime
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}

/// Body stream that enforces single-delivery semantics: when it is dropped
/// (transfer finished or the client hung up) the record is removed at once
/// and the backing file is deleted off the async threads.
struct DeliveryStream {
    inner: ReaderStream<File>,
    registry: JobRegistry,
    job_id: String,
}

impl DeliveryStream {
    fn new(file: File, registry: JobRegistry, job_id: String) -> Self {
        Self {
            inner: ReaderStream::new(file),
            registry,
            job_id,
        }
    }
}

impl Stream for DeliveryStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

impl Drop for DeliveryStream {
    fn drop(&mut self) {
        // Detach the record synchronously so a repeat request 404s right
        // away; the file deletion is blocking I/O, so it goes to the
        // blocking pool when a runtime is around to provide one.
        let Some(job) = self.registry.remove(&self.job_id) else {
            return;
        };
        let Some(path) = job.file_path else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_artifact(&path));
            }
            Err(_) => remove_artifact(&path),
        }
    }
}

/// Builds the user-facing file name from the job title: anything outside a
/// conservative alphanumeric/space/dash/underscore set becomes `_`.
fn sanitize_title(title: Option<&str>) -> String {
    let cleaned: String = title
        .unwrap_or("")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim().to_string();
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed
    }
}
