#![forbid(unsafe_code)]

//! In-memory job registry and the download state machine.
//!
//! Every component shares one [`JobRegistry`] handle; it is the only mutable
//! state in the system. Records move strictly forward through
//! `Starting → Downloading → {Done | Error}` and leave the registry through
//! eviction only, which also reclaims the backing file.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Starting,
    Downloading,
    Done,
    Error,
}

impl JobStatus {
    /// Position in the state machine. Updates carrying a lower rank than the
    /// current status are dropped, which keeps transitions forward-only even
    /// if the subprocess emits output after failure was recorded.
    fn rank(self) -> u8 {
        match self {
            Self::Starting => 0,
            Self::Downloading => 1,
            Self::Done => 2,
            Self::Error => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryFormat {
    Video,
    Audio,
}

impl DeliveryFormat {
    /// Lenient request parsing: anything that is not explicitly audio is
    /// treated as a video request.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|value| value.trim().to_ascii_lowercase()) {
            Some(ref value) if value == "audio" => Self::Audio,
            _ => Self::Video,
        }
    }
}

/// One asynchronous download task, tracked from submission until delivery
/// or eviction.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub message: String,
    pub file_path: Option<PathBuf>,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub format: DeliveryFormat,
    pub requested_quality: Option<u32>,
}

impl Job {
    pub fn new(
        id: String,
        format: DeliveryFormat,
        requested_quality: Option<u32>,
        title: Option<String>,
    ) -> Self {
        Self {
            id,
            status: JobStatus::Starting,
            progress: 0.0,
            message: "Queued".to_string(),
            file_path: None,
            title,
            created_at: Utc::now(),
            format,
            requested_quality,
        }
    }
}

/// Serialized copy of a job record pushed over the progress stream. File
/// system paths never leave the process.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub status: JobStatus,
    pub progress: f64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl JobSnapshot {
    /// Snapshot pushed when the requested job id does not exist (or vanished
    /// mid-stream). The stream closes right after.
    pub fn unknown() -> Self {
        Self {
            status: JobStatus::Error,
            progress: 0.0,
            message: "Job not found".to_string(),
            title: None,
        }
    }
}

/// Partial mutation applied to a job record. Produced by the subprocess
/// output parser and by the orchestrator's exit handler.
#[derive(Clone, Debug, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<f64>,
    pub message: Option<String>,
    pub file_path: Option<PathBuf>,
}

/// Process-wide mapping from job id to job record. Cloning the registry
/// clones the handle, not the map.
#[derive(Clone, Default)]
pub struct JobRegistry {
    inner: Arc<Mutex<HashMap<String, Job>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new job. Returns false when the id is already live; the
    /// existing record is left untouched in that case.
    pub fn insert(&self, job: Job) -> bool {
        let mut jobs = self.inner.lock();
        if jobs.contains_key(&job.id) {
            return false;
        }
        jobs.insert(job.id.clone(), job);
        true
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.inner.lock().get(id).cloned()
    }

    pub fn snapshot(&self, id: &str) -> Option<JobSnapshot> {
        self.inner.lock().get(id).map(|job| JobSnapshot {
            status: job.status,
            progress: job.progress,
            message: job.message.clone(),
            title: job.title.clone(),
        })
    }

    /// Applies a partial update under the state-machine rules: status never
    /// regresses, progress is clamped to `[0, 100]` and never decreases.
    /// Unknown ids are ignored; the job may already have been evicted.
    pub fn apply(&self, id: &str, update: JobUpdate) {
        let mut jobs = self.inner.lock();
        let Some(job) = jobs.get_mut(id) else {
            return;
        };

        if let Some(status) = update.status
            && status.rank() >= job.status.rank()
            && !job.status.is_terminal()
        {
            job.status = status;
        }
        if let Some(progress) = update.progress {
            job.progress = job.progress.max(progress.clamp(0.0, 100.0));
        }
        if let Some(message) = update.message {
            job.message = message;
        }
        if let Some(file_path) = update.file_path {
            job.file_path = Some(file_path);
        }
    }

    /// Removes a record without touching the filesystem, returning it.
    /// Callers that need the backing file gone as well use [`Self::evict`],
    /// or pass the record's path to [`remove_artifact`] themselves when the
    /// deletion must run off the async threads.
    pub fn remove(&self, id: &str) -> Option<Job> {
        self.inner.lock().remove(id)
    }

    /// Removes a record and deletes its backing file when present.
    /// Idempotent: evicting an unknown id is a no-op returning false.
    pub fn evict(&self, id: &str) -> bool {
        match self.remove(id) {
            Some(job) => {
                if let Some(path) = &job.file_path {
                    remove_artifact(path);
                }
                true
            }
            None => false,
        }
    }

    /// Evicts every job older than `max_age`, regardless of status, deleting
    /// backing files along the way. Returns the number of evicted jobs.
    pub fn sweep_stale(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let stale: Vec<String> = self
            .inner
            .lock()
            .values()
            .filter(|job| now - job.created_at > max_age)
            .map(|job| job.id.clone())
            .collect();

        let mut evicted = 0;
        for id in stale {
            if self.evict(&id) {
                evicted += 1;
            }
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Deletes a job's artifact, best-effort. Blocking I/O; callers on an async
/// thread wrap this in `spawn_blocking`.
pub fn remove_artifact(path: &Path) {
    if let Err(err) = fs::remove_file(path)
        && err.kind() != std::io::ErrorKind::NotFound
    {
        eprintln!("Failed to remove {}: {err}", path.display());
    }
    // Artifacts live in per-job subdirectories; reclaim the directory once
    // it is empty. remove_dir refuses non-empty directories, so leftovers
    // from an in-flight subprocess are never touched.
    if let Some(parent) = path.parent() {
        let _ = fs::remove_dir(parent);
    }
}

/// Job ids become file name prefixes in the shared output directory, so a
/// valid id must stay a single, normal path segment.
pub fn is_safe_job_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && Path::new(id)
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
        && Path::new(id).components().count() == 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn job(id: &str) -> Job {
        Job::new(id.into(), DeliveryFormat::Video, None, None)
    }

    #[test]
    fn insert_rejects_duplicate_live_id() {
        let registry = JobRegistry::new();
        assert!(registry.insert(job("a")));
        assert!(!registry.insert(job("a")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn id_may_be_reused_after_eviction() {
        let registry = JobRegistry::new();
        assert!(registry.insert(job("a")));
        assert!(registry.evict("a"));
        assert!(registry.insert(job("a")));
    }

    #[test]
    fn status_never_regresses() {
        let registry = JobRegistry::new();
        registry.insert(job("a"));

        registry.apply(
            "a",
            JobUpdate {
                status: Some(JobStatus::Downloading),
                ..JobUpdate::default()
            },
        );
        registry.apply(
            "a",
            JobUpdate {
                status: Some(JobStatus::Starting),
                ..JobUpdate::default()
            },
        );
        assert_eq!(registry.get("a").unwrap().status, JobStatus::Downloading);

        registry.apply(
            "a",
            JobUpdate {
                status: Some(JobStatus::Error),
                ..JobUpdate::default()
            },
        );
        registry.apply(
            "a",
            JobUpdate {
                status: Some(JobStatus::Done),
                ..JobUpdate::default()
            },
        );
        assert_eq!(registry.get("a").unwrap().status, JobStatus::Error);
    }

    #[test]
    fn progress_is_monotone_and_clamped() {
        let registry = JobRegistry::new();
        registry.insert(job("a"));

        registry.apply(
            "a",
            JobUpdate {
                progress: Some(42.5),
                ..JobUpdate::default()
            },
        );
        registry.apply(
            "a",
            JobUpdate {
                progress: Some(17.0),
                ..JobUpdate::default()
            },
        );
        assert_eq!(registry.get("a").unwrap().progress, 42.5);

        registry.apply(
            "a",
            JobUpdate {
                progress: Some(250.0),
                ..JobUpdate::default()
            },
        );
        assert_eq!(registry.get("a").unwrap().progress, 100.0);
    }

    #[test]
    fn apply_ignores_unknown_ids() {
        let registry = JobRegistry::new();
        registry.apply(
            "ghost",
            JobUpdate {
                status: Some(JobStatus::Done),
                ..JobUpdate::default()
            },
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_detaches_record_without_touching_the_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.mp4");
        std::fs::write(&file, "bytes").unwrap();

        let registry = JobRegistry::new();
        let mut record = job("a");
        record.file_path = Some(file.clone());
        registry.insert(record);

        let removed = registry.remove("a").expect("record present");
        assert_eq!(removed.file_path, Some(file.clone()));
        assert!(file.exists());
        assert!(registry.remove("a").is_none());
    }

    #[test]
    fn evict_deletes_backing_file_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let job_dir = dir.path().join("a");
        std::fs::create_dir(&job_dir).unwrap();
        let file = job_dir.join("a.mp4");
        std::fs::write(&file, "bytes").unwrap();

        let registry = JobRegistry::new();
        let mut record = job("a");
        record.file_path = Some(file.clone());
        registry.insert(record);

        assert!(registry.evict("a"));
        assert!(!file.exists());
        assert!(!job_dir.exists());
        assert!(!registry.evict("a"));
    }

    #[test]
    fn sweep_removes_only_stale_jobs() {
        let dir = tempdir().unwrap();
        let old_dir = dir.path().join("old");
        std::fs::create_dir(&old_dir).unwrap();
        let old_file = old_dir.join("old.mp4");
        std::fs::write(&old_file, "bytes").unwrap();

        let registry = JobRegistry::new();
        let mut old = job("old");
        old.created_at = Utc::now() - Duration::hours(2);
        old.file_path = Some(old_file.clone());
        registry.insert(old);
        registry.insert(job("young"));

        let evicted = registry.sweep_stale(Duration::hours(1));
        assert_eq!(evicted, 1);
        assert!(!old_file.exists());
        assert!(registry.get("old").is_none());
        assert!(registry.get("young").is_some());
    }

    #[test]
    fn sweep_on_empty_registry_is_noop() {
        let registry = JobRegistry::new();
        assert_eq!(registry.sweep_stale(Duration::hours(1)), 0);
    }

    #[test]
    fn safe_job_ids_are_single_normal_segments() {
        assert!(is_safe_job_id("job1"));
        assert!(is_safe_job_id("job-1_a.b"));
        assert!(!is_safe_job_id(""));
        assert!(!is_safe_job_id(".."));
        assert!(!is_safe_job_id(".hidden"));
        assert!(!is_safe_job_id("a/b"));
        assert!(!is_safe_job_id("/etc"));
    }

    #[test]
    fn format_parsing_defaults_to_video() {
        assert_eq!(DeliveryFormat::parse(Some("audio")), DeliveryFormat::Audio);
        assert_eq!(DeliveryFormat::parse(Some("AUDIO ")), DeliveryFormat::Audio);
        assert_eq!(DeliveryFormat::parse(Some("video")), DeliveryFormat::Video);
        assert_eq!(DeliveryFormat::parse(Some("flac")), DeliveryFormat::Video);
        assert_eq!(DeliveryFormat::parse(None), DeliveryFormat::Video);
    }

    #[test]
    fn unknown_snapshot_is_terminal_error() {
        let snapshot = JobSnapshot::unknown();
        assert_eq!(snapshot.status, JobStatus::Error);
        assert!(snapshot.status.is_terminal());
    }
}
