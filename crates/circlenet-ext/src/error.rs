//! Error types for circlenet-ext

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while provisioning, running or importing a detection job
#[derive(Error, Debug)]
pub enum DetectionError {
    /// Asset download failed (unreachable host or non-success status)
    #[error("Download failed for {url}: {reason}")]
    NetworkFailure {
        url: String,
        /// HTTP status, if the server answered at all
        status: Option<u16>,
        reason: String,
    },

    /// Archive entry would be written outside the extraction root
    #[error("Archive entry is outside of the target dir: {entry}")]
    UnsafeArchiveEntry { entry: String },

    /// Archive could not be read
    #[error("Invalid script archive: {0}")]
    Archive(String),

    /// Manifest entry resolves outside the provisioning root
    #[error("Manifest destination escapes the provisioning root: {0}")]
    InvalidManifest(String),

    /// Directory or file permissions could not be created or set
    #[error("Failed to set permissions on {path:?}: {source}")]
    PermissionFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Provisioning root could not be determined
    #[error("Provisioning root unavailable: {0}")]
    RootUnavailable(String),

    /// Interpreter discovery found nothing
    #[error("Python interpreter `{name}` not found on the search path")]
    InterpreterNotFound { name: String },

    /// Interpreter process could not be started
    #[error("Failed to start {program:?}: {source}")]
    ProcessLaunchFailure {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Detection script finished with a nonzero exit code
    #[error("Python script exited with error code: {exit_code}")]
    ProcessNonZeroExit { exit_code: i32, output: String },

    /// Detection script exceeded its time limit
    #[error("Python script timed out after {secs} seconds")]
    Timeout { secs: u64 },

    /// Image is not a recognized whole-slide format
    #[error("Unsupported WSI format for file: {path}")]
    UnsupportedImageFormat { path: String },

    /// Script reported success but wrote no result
    #[error("GeoJSON file not found: {path:?}")]
    ResultFileMissing { path: PathBuf },

    /// Result file exists but is not valid GeoJSON
    #[error("Failed to read GeoJSON file {path:?}: {reason}")]
    ResultParseFailure { path: PathBuf, reason: String },

    /// Another job is already in flight on this orchestrator
    #[error("A detection job is already running")]
    Busy,

    /// Host has no image open
    #[error("No image is open in the viewer")]
    NoActiveImage,

    /// Job was cancelled by the caller
    #[error("Detection job was cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client error outside a specific download
    #[error("HTTP error: {0}")]
    Http(String),
}

impl DetectionError {
    /// Whether retrying the same download may succeed.
    ///
    /// Only transport errors and 5xx responses qualify; a 404 will not heal.
    pub fn is_transient(&self) -> bool {
        match self {
            DetectionError::NetworkFailure { status, .. } => match status {
                None => true,
                Some(code) => *code >= 500,
            },
            _ => false,
        }
    }

    /// Whether the job must be reported as failed.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DetectionError::ResultFileMissing { .. })
    }

    /// Single-line message suitable for an error dialog.
    pub fn user_message(&self) -> String {
        match self {
            DetectionError::ProcessNonZeroExit { exit_code, output } => {
                let last = output
                    .lines()
                    .rev()
                    .find(|l| !l.trim().is_empty())
                    .unwrap_or("no output");
                format!("Python script exited with error code {}: {}", exit_code, last)
            }
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for DetectionError {
    fn from(err: reqwest::Error) -> Self {
        DetectionError::Http(err.to_string())
    }
}

impl From<zip::result::ZipError> for DetectionError {
    fn from(err: zip::result::ZipError) -> Self {
        DetectionError::Archive(err.to_string())
    }
}
