#![forbid(unsafe_code)]

//! Failure taxonomy shared between the library modules and the HTTP layer.
//!
//! Validation failures surface synchronously as 4xx responses; collaborator
//! failures during a running download never do, they only flip the job's
//! status and are observed over the progress stream.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    /// The submitted URL failed to parse or its host is not allow-listed.
    #[error("invalid or unsupported url: {0}")]
    InvalidUrl(String),

    /// yt-dlp exited cleanly but printed something other than JSON.
    #[error("failed to parse metadata output: {0}")]
    MetadataParse(String),

    /// The yt-dlp binary is missing or not executable.
    #[error("failed to launch yt-dlp: {0}")]
    EngineLaunch(String),

    /// The subprocess exited abnormally or left no output file behind.
    #[error("download failed: {0}")]
    DownloadFailed(String),
}
