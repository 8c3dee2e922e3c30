use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    process::Command,
    sync::Semaphore,
    time::{Duration, timeout},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

const DEFAULT_MAX_CONCURRENT_EXTRACTIONS: usize = 3;
const DEFAULT_EXTRACTION_DEADLINE_SECONDS: u64 = 25;
const TIKTOK_DEADLINE_CEILING_SECONDS: u64 = 30;
const EXTRACTOR_PROBE_TIMEOUT_SECONDS: u64 = 5;
const STDERR_EXCERPT_LINES: usize = 3;
const STDERR_EXCERPT_MAX_CHARS: usize = 1_000;

const METADATA_FIELDS: [&str; 5] = ["url", "title", "thumbnail", "duration", "uploader"];

const TIKTOK_HEADERS: &[(&str, &str)] = &[
    ("User-Agent", "Mozilla/5.0"),
    ("Referer", "https://www.tiktok.com/"),
];

const INSTAGRAM_HEADERS: &[(&str, &str)] = &[
    ("User-Agent", "Mozilla/5.0"),
    ("Referer", "https://www.instagram.com/"),
];

const DIRECT_VIDEO_EXTENSIONS: &[&str] = &["mp4", "m4v", "webm", "mov", "ts", "flv", "3gp"];

const SUPPORTED_DOMAINS: [&str; 12] = [
    "youtube.com",
    "youtu.be",
    "m.youtube.com",
    "music.youtube.com",
    "tiktok.com",
    "vm.tiktok.com",
    "vt.tiktok.com",
    "instagram.com",
    "x.com",
    "twitter.com",
    "facebook.com",
    "fb.watch",
];

#[derive(Clone)]
struct AppState {
    config: Arc<ServiceConfig>,
    extraction_semaphore: Arc<Semaphore>,
    started_at: DateTime<Utc>,
    extractor_version: Option<String>,
}

#[derive(Debug, Clone)]
struct ServiceConfig {
    extractor_bin: String,
    cookie_file: PathBuf,
    deadline: Duration,
    api_key: Option<String>,
}

impl ServiceConfig {
    fn from_env() -> Self {
        let extractor_bin = std::env::var("EXTRACTOR_BIN")
            .ok()
            .and_then(|value| non_empty(&value).map(ToString::to_string))
            .unwrap_or_else(|| "yt-dlp".to_string());
        let cookie_file = std::env::var("COOKIE_FILE")
            .ok()
            .and_then(|value| non_empty(&value).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("cookies.txt"));
        let deadline_seconds = read_u64_env("EXTRACTION_DEADLINE_SECONDS")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_EXTRACTION_DEADLINE_SECONDS);
        let api_key = std::env::var("API_KEY")
            .ok()
            .and_then(|value| non_empty(&value).map(ToString::to_string));

        Self {
            extractor_bin,
            cookie_file,
            deadline: Duration::from_secs(deadline_seconds),
            api_key,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExtractRequest {
    #[serde(default)]
    url: String,
    #[serde(default)]
    mode: OutputMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum OutputMode {
    /// Canonical mode: direct URL plus title/thumbnail/duration/uploader.
    #[default]
    Metadata,
    /// Degraded view: newline-separated candidate URLs, no enrichment.
    Direct,
}

#[derive(Debug, Serialize)]
struct ExtractResponse {
    success: bool,
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    uploader: Option<String>,
}

impl From<MediaResolution> for ExtractResponse {
    fn from(resolution: MediaResolution) -> Self {
        Self {
            success: true,
            url: resolution.url,
            title: resolution.title,
            thumbnail: resolution.thumbnail,
            duration: resolution.duration,
            uploader: resolution.uploader,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
struct MediaResolution {
    url: String,
    title: Option<String>,
    thumbnail: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    detail: Option<String>,
}

impl ApiError {
    fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            detail: None,
        }
    }

    fn unsupported_platform() -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: "Unsupported URL. Use a link from YouTube, TikTok, Instagram, X or Facebook."
                .to_string(),
            detail: None,
        }
    }

    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "Invalid or missing API key.".to_string(),
            detail: None,
        }
    }

    fn overloaded() -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: "Server is busy with other extractions. Try again shortly.".to_string(),
            detail: None,
        }
    }

    fn timeout() -> Self {
        Self {
            status: StatusCode::GATEWAY_TIMEOUT,
            message: "Processing timeout exceeded".to_string(),
            detail: None,
        }
    }

    fn no_video_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: "No video found at this URL".to_string(),
            detail: None,
        }
    }

    fn invalid_media_format() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: "Extractor returned a non-video URL for this platform.".to_string(),
            detail: None,
        }
    }

    fn process_failed(detail: String) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Extraction failed".to_string(),
            detail: Some(detail),
        }
    }

    fn malformed_output(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Could not interpret extractor output".to_string(),
            detail: Some(detail.into()),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            detail: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            success: false,
            message: self.message,
            error: self.detail,
        });

        (self.status, body).into_response()
    }
}

/// Known platforms needing request shaping, in classification priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Platform {
    TikTok,
    Instagram,
    Generic,
}

impl Platform {
    fn classify(url: &Url) -> Self {
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();

        // First match wins; a URL never carries two profiles.
        if host_matches(&host, "tiktok.com") {
            Platform::TikTok
        } else if host_matches(&host, "instagram.com") {
            Platform::Instagram
        } else {
            Platform::Generic
        }
    }

    fn extra_headers(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Platform::TikTok => TIKTOK_HEADERS,
            Platform::Instagram => INSTAGRAM_HEADERS,
            Platform::Generic => &[],
        }
    }

    fn format_selector(self) -> &'static str {
        match self {
            Platform::TikTok | Platform::Instagram => "best[ext=mp4]/best",
            Platform::Generic => "best",
        }
    }

    fn deadline_ceiling(self) -> Option<Duration> {
        match self {
            Platform::TikTok => Some(Duration::from_secs(TIKTOK_DEADLINE_CEILING_SECONDS)),
            _ => None,
        }
    }

    /// TikTok occasionally resolves to a thumbnail or webpage URL even on a
    /// zero exit status, so its candidates get a direct-video check.
    fn requires_direct_video_check(self) -> bool {
        matches!(self, Platform::TikTok)
    }
}

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{domain}"))
}

#[derive(Debug, Clone, PartialEq)]
struct ExtractorInvocation {
    program: String,
    args: Vec<String>,
    deadline: Duration,
}

/// Builds the extractor argument array. The source URL is always passed as a
/// single opaque argument; nothing here goes through a shell.
fn build_invocation(
    url: &Url,
    platform: Platform,
    mode: OutputMode,
    config: &ServiceConfig,
) -> ExtractorInvocation {
    let mut args = vec![
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "-f".to_string(),
        platform.format_selector().to_string(),
    ];

    for &(name, value) in platform.extra_headers() {
        args.push("--add-header".to_string());
        args.push(format!("{name}: {value}"));
    }

    if config.cookie_file.is_file() {
        args.push("--cookies".to_string());
        args.push(config.cookie_file.to_string_lossy().into_owned());
    }

    match mode {
        OutputMode::Metadata => {
            for field in METADATA_FIELDS {
                args.push("--print".to_string());
                args.push(format!("{field}=%({field})s"));
            }
        }
        OutputMode::Direct => args.push("--get-url".to_string()),
    }

    args.push(url.as_str().to_string());

    let deadline = platform
        .deadline_ceiling()
        .map_or(config.deadline, |ceiling| config.deadline.min(ceiling));

    ExtractorInvocation {
        program: config.extractor_bin.clone(),
        args,
        deadline,
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "media_extractor_api=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = ServiceConfig::from_env();
    let max_concurrent_extractions = read_usize_env("MAX_CONCURRENT_EXTRACTIONS")
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_MAX_CONCURRENT_EXTRACTIONS);

    if !config.cookie_file.is_file() {
        warn!(
            "Cookie file {:?} not found. Extraction will run without session cookies.",
            config.cookie_file
        );
    }
    if config.api_key.is_none() {
        warn!("API_KEY not configured. The extraction endpoint is open.");
    }

    let extractor_version = probe_extractor_version(&config.extractor_bin).await;
    match &extractor_version {
        Some(version) => info!("Extractor {} version: {version}", config.extractor_bin),
        None => warn!(
            "Could not run {} --version. Extraction requests may fail until it is installed.",
            config.extractor_bin
        ),
    }

    let state = AppState {
        config: Arc::new(config),
        extraction_semaphore: Arc::new(Semaphore::new(max_concurrent_extractions)),
        started_at: Utc::now(),
        extractor_version,
    };

    let app = build_router(state);
    let addr = resolve_bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|error| ApiError::internal(format!("Could not bind to {addr}: {error}")))?;

    info!("Media extractor API listening on http://{addr}");

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/extract", post(extract))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "started_at": state.started_at,
        "uptime_seconds": (Utc::now() - state.started_at).num_seconds(),
        "extractor": state.extractor_version.as_deref().unwrap_or("unavailable"),
    }))
}

async fn extract(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ExtractRequest>,
) -> Result<Json<ExtractResponse>, ApiError> {
    require_api_key(&state.config, &headers)?;

    let url_input = payload.url.trim();
    if url_input.is_empty() {
        return Err(ApiError::invalid_input("URL is required"));
    }
    let source_url = parse_supported_url(url_input)?;
    let platform = Platform::classify(&source_url);

    let request_id = Uuid::new_v4();
    info!("[{request_id}] extraction request, platform {platform:?}, url {source_url}");

    let _permit = state
        .extraction_semaphore
        .clone()
        .try_acquire_owned()
        .map_err(|_| ApiError::overloaded())?;

    let invocation = build_invocation(&source_url, platform, payload.mode, &state.config);
    let output = run_extractor(&invocation).await?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let resolution = match payload.mode {
        OutputMode::Metadata => parse_metadata_output(&stdout)?,
        OutputMode::Direct => parse_url_list_output(&stdout)?,
    };

    if platform.requires_direct_video_check() && !is_direct_video_url(&resolution.url) {
        warn!("[{request_id}] extractor resolved a non-video URL for {platform:?}");
        return Err(ApiError::invalid_media_format());
    }

    info!("[{request_id}] resolved direct media URL");
    Ok(Json(ExtractResponse::from(resolution)))
}

fn require_api_key(config: &ServiceConfig, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = config.api_key.as_deref() else {
        return Ok(());
    };

    let provided = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if provided == expected {
        Ok(())
    } else {
        Err(ApiError::unauthorized())
    }
}

fn parse_supported_url(input: &str) -> Result<Url, ApiError> {
    let parsed = Url::parse(input).map_err(|_| ApiError::invalid_input("Enter a valid URL."))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ApiError::unsupported_platform());
    }

    let host = match parsed.host_str() {
        Some(host) => host.to_ascii_lowercase(),
        None => return Err(ApiError::unsupported_platform()),
    };

    if SUPPORTED_DOMAINS
        .iter()
        .any(|domain| host_matches(&host, domain))
    {
        Ok(parsed)
    } else {
        Err(ApiError::unsupported_platform())
    }
}

async fn run_extractor(invocation: &ExtractorInvocation) -> Result<std::process::Output, ApiError> {
    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|error| {
        if error.kind() == ErrorKind::NotFound {
            ApiError::internal(format!(
                "{} is not installed on this system. Install it and restart the service.",
                invocation.program
            ))
        } else {
            ApiError::internal(format!("Could not start the extractor: {error}"))
        }
    })?;

    // kill_on_drop tears the child down when the timer wins the race.
    let output = match timeout(invocation.deadline, child.wait_with_output()).await {
        Ok(result) => result.map_err(|error| {
            ApiError::internal(format!("Could not collect extractor output: {error}"))
        })?,
        Err(_) => {
            warn!(
                "Extractor exceeded the {:?} deadline, killing process",
                invocation.deadline
            );
            return Err(ApiError::timeout());
        }
    };

    if !output.status.success() {
        let detail = stderr_excerpt(&output.stderr);
        warn!("Extractor exited with {}: {detail}", output.status);
        return Err(ApiError::process_failed(detail));
    }

    Ok(output)
}

/// Parses the metadata-mode record: one `key=value` line per printed field.
/// The extractor prints `NA` for fields it could not resolve.
fn parse_metadata_output(stdout: &str) -> Result<MediaResolution, ApiError> {
    let mut fields: HashMap<&str, &str> = HashMap::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            fields.insert(key.trim(), value.trim());
        }
    }

    if fields.is_empty() {
        return Err(ApiError::malformed_output(
            "extractor printed no key=value record",
        ));
    }

    let url = fields
        .remove("url")
        .ok_or_else(|| ApiError::malformed_output("record is missing the url field"))?;
    if !is_absolute_http_url(url) {
        return Err(ApiError::no_video_found());
    }

    Ok(MediaResolution {
        url: url.to_string(),
        title: fields.remove("title").and_then(present_value),
        thumbnail: fields.remove("thumbnail").and_then(present_value),
        duration: fields
            .remove("duration")
            .and_then(|value| value.parse::<f64>().ok()),
        uploader: fields.remove("uploader").and_then(present_value),
    })
}

/// Parses URL-list mode output: the first line that is a well-formed absolute
/// http(s) URL wins.
fn parse_url_list_output(stdout: &str) -> Result<MediaResolution, ApiError> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| is_absolute_http_url(line))
        .map(|line| MediaResolution {
            url: line.to_string(),
            ..MediaResolution::default()
        })
        .ok_or_else(ApiError::no_video_found)
}

fn present_value(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed == "NA" {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn is_absolute_http_url(value: &str) -> bool {
    Url::parse(value).is_ok_and(|parsed| {
        matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some()
    })
}

/// A candidate counts as a direct video resource if its path carries a known
/// video extension or its query marks video content (TikTok CDN URLs use
/// `mime_type=video_mp4`).
fn is_direct_video_url(value: &str) -> bool {
    let Ok(parsed) = Url::parse(value) else {
        return false;
    };

    let path = parsed.path().to_ascii_lowercase();
    if let Some(extension) = Path::new(&path).extension().and_then(|ext| ext.to_str())
        && DIRECT_VIDEO_EXTENSIONS.contains(&extension)
    {
        return true;
    }

    parsed
        .query()
        .is_some_and(|query| query.to_ascii_lowercase().contains("mime_type=video"))
}

/// Bounded diagnostic excerpt for client-visible errors: the last few
/// non-empty stderr lines, never the invocation itself.
fn stderr_excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    let start = lines.len().saturating_sub(STDERR_EXCERPT_LINES);
    let joined = lines[start..].join(" | ");

    if joined.is_empty() {
        "extractor reported no diagnostic output".to_string()
    } else {
        joined.chars().take(STDERR_EXCERPT_MAX_CHARS).collect()
    }
}

async fn probe_extractor_version(extractor_bin: &str) -> Option<String> {
    let probe = Command::new(extractor_bin).arg("--version").output();
    let output = timeout(Duration::from_secs(EXTRACTOR_PROBE_TIMEOUT_SECONDS), probe)
        .await
        .ok()?
        .ok()?;

    if !output.status.success() {
        return None;
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToString::to_string)
}

fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn read_u64_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "127.0.0.1:8787".to_string()
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}
