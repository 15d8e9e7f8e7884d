//! Error types for log-collector
//!
//! Three layers, matching how far a failure is allowed to travel:
//! - `ScanError`: one location could not be listed. Logged, the location is empty.
//! - `WriteError`: a sink could not store a file. Fails the unit of work.
//! - `CollectError`: the stage or job cannot continue. Reported to the job runner.

use std::path::PathBuf;
use thiserror::Error;

/// Failure while listing or opening files under one location
#[derive(Error, Debug)]
pub enum ScanError {
    /// Root path does not exist
    #[error("Path not found: {path}")]
    NotFound { path: String },

    /// Root path exists but cannot be read
    #[error("Access denied: {path}")]
    AccessDenied { path: String },

    /// Remote host unreachable or authentication failed
    #[error("Failed to connect to '{host}': {reason}")]
    Connection { host: String, reason: String },

    /// Job stopped before the listing finished
    #[error("Listing of {location} cancelled")]
    Cancelled { location: String },

    /// Location type has no usable backend in this build
    #[error("Unsupported location: {0}")]
    Unsupported(String),

    /// Any other I/O failure
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ScanError {
    /// Classify an I/O error raised while touching `path`
    pub fn from_io(path: impl Into<String>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => ScanError::NotFound { path },
            std::io::ErrorKind::PermissionDenied => ScanError::AccessDenied { path },
            _ => ScanError::Io { path, source },
        }
    }
}

/// A read cut short because the job is stopping
#[derive(Error, Debug)]
#[error("Job is stopping")]
pub struct Stopped;

impl Stopped {
    pub fn io() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::Other, Stopped)
    }

    /// True when `err` was raised by a stop-aware reader
    pub fn matches(err: &std::io::Error) -> bool {
        err.get_ref().map_or(false, |inner| inner.is::<Stopped>())
    }
}

/// Failure inside a result sink
#[derive(Error, Debug)]
pub enum WriteError {
    /// Output could not be created
    #[error("Failed to open output {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Archive container error
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Reading the source or writing the destination failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Write attempted after the sink was closed
    #[error("Writer is already closed")]
    Closed,
}

/// Failure that ends a stage or a job
#[derive(Error, Debug)]
pub enum CollectError {
    /// Pattern code did not resolve
    #[error("Log pattern '{0}' not found")]
    PatternNotFound(String),

    /// Job parameters cannot be executed as given
    #[error("Invalid job configuration: {0}")]
    InvalidConfig(String),

    /// Include glob or line regex failed to compile
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// A sink failed
    #[error("Write failed: {0}")]
    Write(#[from] WriteError),

    /// Worker pool could not start, accept work or drain in time
    #[error("Worker pool error: {0}")]
    Pool(String),

    /// Work items failed inside a stage, typically sink writes
    #[error("{failed} {stage} tasks failed, last error: {last}")]
    TaskFailures {
        stage: &'static str,
        failed: u64,
        last: String,
    },

    /// Stage hand-off could not be persisted or restored
    #[error("Checkpoint error at {path}: {reason}")]
    Checkpoint { path: PathBuf, reason: String },

    /// A job is already running
    #[error("A job is already running")]
    AlreadyRunning,

    /// I/O errors outside a single work item
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WriteError {
    /// The source read was interrupted by a stop request
    pub fn is_stopped(&self) -> bool {
        matches!(self, WriteError::Io(e) if Stopped::matches(e))
    }
}

pub type Result<T, E = CollectError> = std::result::Result<T, E>;
