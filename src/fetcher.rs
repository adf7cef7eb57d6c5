#![forbid(unsafe_code)]

//! yt-dlp plumbing: metadata probes, download orchestration, and the parser
//! that turns yt-dlp's line-oriented output into job state updates.
//!
//! The tool is an opaque collaborator. Its argument set, output text shape,
//! and exit semantics form a loosely-structured contract that is parsed
//! defensively: anything captured from output text is advisory, and the
//! post-exit directory scan is the authoritative completion check because
//! post-processing (remuxing, audio extraction) can rename the file after
//! the destination line was printed.

use crate::error::FetchError;
use crate::jobs::{DeliveryFormat, Job, JobRegistry, JobStatus, JobUpdate};
use crate::urls;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Quality ladder returned when the metadata probe is blocked. The target
/// platforms intermittently refuse probes while still serving the actual
/// download, so `/info` degrades instead of hard-failing.
pub const FALLBACK_QUALITIES: &[u32] = &[1080, 720, 480];

/// Video requests without an explicit cap fetch at most this height.
pub const DEFAULT_QUALITY_CAP: u32 = 1080;

/// Soft ceiling for direct preview links; anything bigger is not worth
/// proxying to a browser ahead of the real download.
const PREVIEW_SIZE_CEILING: u64 = 50 * 1024 * 1024;

fn progress_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\d+\.\d+)%").expect("valid progress pattern"))
}

/// Transient answer for `/info`; produced fresh per request, never cached.
#[derive(Clone, Debug, Serialize)]
pub struct MetadataSummary {
    pub title: String,
    pub platform: String,
    pub qualities: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

/// Minimal slice of yt-dlp's `-J` payload; everything else is ignored.
#[derive(Debug, Deserialize)]
struct InfoJson {
    title: Option<String>,
    extractor_key: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    formats: Vec<FormatEntry>,
}

#[derive(Debug, Deserialize)]
struct FormatEntry {
    height: Option<u32>,
    vcodec: Option<String>,
    acodec: Option<String>,
    ext: Option<String>,
    url: Option<String>,
    filesize: Option<u64>,
    filesize_approx: Option<u64>,
}

impl FormatEntry {
    /// Mirrors the upstream convention: a missing codec field is not the
    /// same as the explicit `"none"` marker.
    fn carries_video(&self) -> bool {
        self.height.is_some() && self.vcodec.as_deref() != Some("none")
    }

    fn carries_audio(&self) -> bool {
        self.acodec.as_deref() != Some("none")
    }

    fn size(&self) -> Option<u64> {
        self.filesize.or(self.filesize_approx)
    }
}

/// Everything the orchestrator needs to launch one download. The URL must
/// already have passed [`crate::urls::normalize_url`].
#[derive(Clone, Debug)]
pub struct DownloadRequest {
    pub url: String,
    pub job_id: String,
    pub format: DeliveryFormat,
    pub quality: Option<u32>,
    pub title: Option<String>,
}

/// Handle for invoking yt-dlp. Cheap to clone; carries the binary location
/// and the shared output directory.
#[derive(Clone, Debug)]
pub struct Fetcher {
    binary: PathBuf,
    output_dir: PathBuf,
}

impl Fetcher {
    pub fn new(output_dir: PathBuf, binary: Option<PathBuf>) -> Self {
        Self {
            binary: binary.unwrap_or_else(|| PathBuf::from("yt-dlp")),
            output_dir,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    /// Single-shot metadata probe; writes no files. Degrades to a fallback
    /// summary when the probe is blocked, fails with `MetadataParse` when
    /// the tool exits cleanly but prints something other than JSON.
    pub async fn resolve_metadata(&self, url: &str) -> Result<MetadataSummary, FetchError> {
        let output = self
            .command()
            .arg("--no-playlist")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("-J")
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|err| FetchError::EngineLaunch(err.to_string()))?;

        let blank_stdout = output.stdout.iter().all(|byte| byte.is_ascii_whitespace());
        if !output.status.success() || blank_stdout {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                eprintln!("[yt-dlp info] {}", stderr.trim());
            }
            return Ok(fallback_summary(url));
        }

        let info: InfoJson = serde_json::from_slice(&output.stdout)
            .map_err(|err| FetchError::MetadataParse(err.to_string()))?;
        Ok(summarize_info(info))
    }

    /// Records a `starting` job and launches the subprocess. Returns false
    /// when the job id is already live. Never blocks on the download; all
    /// further mutation happens from the spawned task.
    pub fn submit(&self, registry: &JobRegistry, request: DownloadRequest) -> bool {
        let job = Job::new(
            request.job_id.clone(),
            request.format,
            request.quality,
            request.title.clone(),
        );
        if !registry.insert(job) {
            return false;
        }

        let fetcher = self.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            let job_id = request.job_id.clone();
            match fetcher.run_to_completion(&registry, request).await {
                Ok(path) => registry.apply(
                    &job_id,
                    JobUpdate {
                        status: Some(JobStatus::Done),
                        progress: Some(100.0),
                        message: Some("Download complete".to_string()),
                        file_path: Some(path),
                    },
                ),
                Err(err) => {
                    eprintln!("[job {job_id}] {err}");
                    registry.apply(
                        &job_id,
                        JobUpdate {
                            status: Some(JobStatus::Error),
                            message: Some(err.to_string()),
                            ..JobUpdate::default()
                        },
                    );
                }
            }
        });
        true
    }

    /// Drives one subprocess from spawn to the authoritative directory scan.
    /// Success requires both a clean exit and a discoverable output file.
    async fn run_to_completion(
        &self,
        registry: &JobRegistry,
        request: DownloadRequest,
    ) -> Result<PathBuf, FetchError> {
        tokio::fs::create_dir_all(self.output_dir.join(&request.job_id))
            .await
            .map_err(|err| FetchError::DownloadFailed(format!("creating output dir: {err}")))?;

        let args = build_download_args(&self.output_dir, &request);
        let mut child = self
            .command()
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| FetchError::EngineLaunch(err.to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let job_id = request.job_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    eprintln!("[yt-dlp {job_id}] {line}");
                }
            });
        }

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(update) = parse_output_line(&line) {
                    registry.apply(&request.job_id, update);
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|err| FetchError::DownloadFailed(err.to_string()))?;
        if !status.success() {
            return Err(FetchError::DownloadFailed(format!(
                "yt-dlp exited with {status}"
            )));
        }

        // The scan is a directory read; keep it off the async threads.
        let root = self.output_dir.clone();
        let job_id = request.job_id.clone();
        tokio::task::spawn_blocking(move || discover_output_file(&root, &job_id))
            .await
            .map_err(|err| FetchError::DownloadFailed(err.to_string()))?
            .ok_or_else(|| FetchError::DownloadFailed("no output file produced".to_string()))
    }
}

/// Applies the two independent extraction rules to one line of subprocess
/// output. Returns nothing for lines that carry no job state.
pub fn parse_output_line(line: &str) -> Option<JobUpdate> {
    // yt-dlp reports a re-run against an existing file with a different
    // message shape; treat it as instant completion.
    if line.contains("has already been downloaded") {
        return Some(JobUpdate {
            status: Some(JobStatus::Downloading),
            progress: Some(100.0),
            message: Some("Already downloaded".to_string()),
            ..JobUpdate::default()
        });
    }

    if let Some((_, rest)) = line.split_once("Destination:") {
        let path = rest.trim();
        if !path.is_empty() {
            return Some(JobUpdate {
                status: Some(JobStatus::Downloading),
                message: Some("Downloading".to_string()),
                file_path: Some(PathBuf::from(path)),
                ..JobUpdate::default()
            });
        }
    }

    if let Some(captures) = progress_pattern().captures(line)
        && let Ok(percent) = captures[1].parse::<f64>()
    {
        return Some(JobUpdate {
            status: Some(JobStatus::Downloading),
            progress: Some(percent),
            message: Some("Downloading".to_string()),
            ..JobUpdate::default()
        });
    }

    None
}

/// Argument set for one download. Each job writes into its own
/// subdirectory, named after the job id, so concurrent jobs cannot collide
/// and the artifact can later be found regardless of the extension the
/// tool ends up choosing.
pub fn build_download_args(output_dir: &Path, request: &DownloadRequest) -> Vec<String> {
    let template = output_dir
        .join(&request.job_id)
        .join(format!("{}.%(ext)s", request.job_id));
    let mut args = vec![
        "--newline".to_string(),
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "-o".to_string(),
        template.to_string_lossy().into_owned(),
    ];

    match request.format {
        DeliveryFormat::Audio => {
            // Quality caps apply to video selection only; audio always takes
            // the best source before transcoding.
            args.extend([
                "-x".to_string(),
                "--audio-format".to_string(),
                "mp3".to_string(),
            ]);
        }
        DeliveryFormat::Video => {
            let cap = request.quality.unwrap_or(DEFAULT_QUALITY_CAP);
            args.extend([
                "-f".to_string(),
                format!("bestvideo[height<={cap}]+bestaudio/best"),
                "--merge-output-format".to_string(),
                "mp4".to_string(),
            ]);
        }
    }

    args.push(request.url.clone());
    args
}

/// Scans the job's own subdirectory for its artifact. The scan is scoped,
/// never the whole shared output root, so it stays cheap under concurrent
/// jobs; partial-download leftovers are skipped.
pub fn discover_output_file(root: &Path, job_id: &str) -> Option<PathBuf> {
    let dir = root.join(job_id);
    let mut names: Vec<String> = fs::read_dir(&dir)
        .ok()?
        .flatten()
        .filter(|entry| entry.file_type().map(|kind| kind.is_file()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !name.ends_with(".part") && !name.ends_with(".ytdl"))
        .collect();
    names.sort();
    names.into_iter().next().map(|name| dir.join(name))
}

fn fallback_summary(url: &str) -> MetadataSummary {
    MetadataSummary {
        title: "Unknown title".to_string(),
        platform: urls::platform_label(url).to_string(),
        qualities: FALLBACK_QUALITIES.to_vec(),
        thumbnail: None,
        preview: None,
    }
}

fn summarize_info(info: InfoJson) -> MetadataSummary {
    let platform = info
        .extractor_key
        .unwrap_or_else(|| "Unknown".to_string());

    let heights: BTreeSet<u32> = info
        .formats
        .iter()
        .filter(|format| format.carries_video())
        .filter_map(|format| format.height)
        .collect();
    let qualities: Vec<u32> = heights.into_iter().rev().collect();

    let preview = select_preview(&platform, &info.formats);

    MetadataSummary {
        title: info.title.unwrap_or_else(|| "Untitled".to_string()),
        platform,
        qualities,
        thumbnail: info.thumbnail,
        preview,
    }
}

/// Direct preview link policy: skipped for YouTube, whose playback is
/// handled by the embedded player on the client; for everything else, the
/// tallest mp4 that carries both streams and stays under the size ceiling.
fn select_preview(platform: &str, formats: &[FormatEntry]) -> Option<String> {
    if platform.to_ascii_lowercase().contains("youtube") {
        return None;
    }
    formats
        .iter()
        .filter(|format| format.ext.as_deref() == Some("mp4"))
        .filter(|format| format.carries_video() && format.carries_audio())
        .filter(|format| format.size().is_none_or(|size| size <= PREVIEW_SIZE_CEILING))
        .max_by_key(|format| format.height.unwrap_or(0))
        .and_then(|format| format.url.clone())
}
