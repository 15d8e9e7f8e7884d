pub mod locations;
pub mod manager;
pub mod pipeline;
pub mod pool;
pub mod processor;
pub mod queue;
pub mod results;
pub mod scanner;
pub mod writer;

pub use manager::JobManager;
pub use pipeline::{JobSummary, Pipeline, PipelineOptions};
pub use results::JobResults;

use crate::error::Stopped;
use crate::fs::FileServiceSelector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LocationKind {
    #[default]
    Local,
    #[serde(alias = "remote")]
    Sftp,
}

#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// A configured scan root. Immutable once loaded from the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Location {
    pub code: String,
    #[serde(default, rename = "type")]
    pub kind: LocationKind,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub credentials: Credentials,
    pub path: String,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Some(host) => write!(f, "{} {}:{}", self.code, host, self.path),
            None => write!(f, "{} {}", self.code, self.path),
        }
    }
}

/// File selection rules shared by every backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterParams {
    pub includes: Vec<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

impl FilterParams {
    pub fn for_job(pattern: &LogPattern, params: &JobParams) -> Self {
        Self {
            includes: pattern.includes.clone(),
            date_from: params.date_from,
            date_to: params.date_to,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileInfo {
    pub path: PathBuf,
    /// Path below the location root, `/`-separated
    pub relative_path: String,
    pub location_code: String,
    pub host: Option<String>,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl FileInfo {
    /// Destination of this file inside the archive or copy folder
    pub fn zip_path(&self) -> String {
        format!("{}/{}", self.location_code, self.relative_path.trim_start_matches('/'))
    }
}

/// Files matched under one location. Never empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirInfo {
    pub location_code: String,
    pub host: Option<String>,
    pub root_path: String,
    pub files: Vec<FileInfo>,
}

impl DirInfo {
    /// Bundle `files` for `location`, sorted case-insensitively by path.
    /// Returns `None` when there is nothing to hand off.
    pub fn new(location: &Location, mut files: Vec<FileInfo>) -> Option<Self> {
        if files.is_empty() {
            return None;
        }

        files.sort_by_cached_key(|f| f.path.to_string_lossy().to_lowercase());

        Some(Self {
            location_code: location.code.clone(),
            host: location.host.clone(),
            root_path: location.path.clone(),
            files,
        })
    }
}

/// Opens a fresh reader over one file's content through its backend
#[derive(Clone)]
pub struct ContentReader {
    services: Arc<FileServiceSelector>,
    location: Arc<Location>,
    file: FileInfo,
    stop: Option<JobResults>,
}

impl ContentReader {
    pub fn new(services: Arc<FileServiceSelector>, location: Arc<Location>, file: FileInfo) -> Self {
        Self {
            services,
            location,
            file,
            stop: None,
        }
    }

    /// Fail reads with `Stopped` once `results` leaves RUNNING
    pub fn stop_on(mut self, results: JobResults) -> Self {
        self.stop = Some(results);
        self
    }

    pub fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        let input = self
            .services
            .select(self.location.kind)
            .open(&self.location, &self.file)?;
        Ok(match &self.stop {
            Some(results) => Box::new(StopAware::new(input, results.clone())),
            None => input,
        })
    }
}

/// Checks the job state before every read, so any copy loop over it
/// ends within one buffer of a stop request
pub struct StopAware<R> {
    inner: R,
    results: JobResults,
}

impl<R: Read> StopAware<R> {
    pub fn new(inner: R, results: JobResults) -> Self {
        Self { inner, results }
    }
}

impl<R: Read> Read for StopAware<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.results.is_stopping() {
            return Err(Stopped::io());
        }
        self.inner.read(buf)
    }
}

/// A file selected for packaging
#[derive(Clone)]
pub struct FileData {
    pub file: FileInfo,
    pub zip_path: String,
    reader: ContentReader,
}

impl FileData {
    pub fn new(reader: ContentReader) -> Self {
        let file = reader.file.clone();
        Self {
            zip_path: file.zip_path(),
            file,
            reader,
        }
    }

    pub fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        self.reader.open()
    }
}

impl fmt::Debug for FileData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileData")
            .field("path", &self.file.path)
            .field("zip_path", &self.zip_path)
            .finish()
    }
}

/// Named filter definition from the catalog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogPattern {
    pub code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub includes: Vec<String>,
    /// Lines matching this regex become events
    #[serde(default)]
    pub line_regex: Option<String>,
    /// strftime format of a leading line timestamp
    #[serde(default)]
    pub timestamp_format: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub file: PathBuf,
    pub location_code: String,
    pub host: Option<String>,
    pub line: u64,
    pub text: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Running,
    Stopping,
    #[default]
    Stopped,
}

/// Inputs supplied by whoever launches a job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobParams {
    pub pattern_code: String,
    #[serde(default)]
    pub date_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub date_to: Option<DateTime<Utc>>,
    /// Comma-separated location codes
    pub locations: String,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub save_to_archive: bool,
    #[serde(default)]
    pub archive_path: Option<PathBuf>,
    #[serde(default)]
    pub copy_path: Option<PathBuf>,
    /// Package every listed file, matched or not. Falls back to the service config.
    #[serde(default)]
    pub package_all: Option<bool>,
}

impl JobParams {
    pub fn packaging_requested(&self) -> bool {
        self.save_to_archive || self.copy_path.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn file(path: &str) -> FileInfo {
        FileInfo {
            path: PathBuf::from(path),
            relative_path: path.trim_start_matches("/logs/").to_string(),
            location_code: "app".to_string(),
            host: None,
            size: 1,
            modified: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn location() -> Location {
        Location {
            code: "app".to_string(),
            kind: LocationKind::Local,
            host: None,
            port: None,
            credentials: Credentials::default(),
            path: "/logs".to_string(),
        }
    }

    #[test]
    fn test_dir_info_sorts_case_insensitively() {
        let files = vec![file("/logs/b.log"), file("/logs/C.log"), file("/logs/A.log")];
        let dir = DirInfo::new(&location(), files).unwrap();
        let names: Vec<_> = dir.files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(names, vec!["A.log", "b.log", "C.log"]);
    }

    #[test]
    fn test_dir_info_rejects_empty() {
        assert!(DirInfo::new(&location(), Vec::new()).is_none());
    }

    #[test]
    fn test_zip_path() {
        let mut f = file("/logs/nested/app.log");
        f.relative_path = "nested/app.log".to_string();
        assert_eq!(f.zip_path(), "app/nested/app.log");
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials {
            user: Some("ops".to_string()),
            password: Some("hunter2".to_string()),
        };
        let shown = format!("{:?}", creds);
        assert!(shown.contains("ops"));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn test_location_kind_accepts_remote_alias() {
        let kind: LocationKind = serde_json::from_str("\"remote\"").unwrap();
        assert_eq!(kind, LocationKind::Sftp);
    }

    #[test]
    fn test_stop_aware_reader_ends_on_stop() {
        let results = JobResults::new(10);
        results.before_job().unwrap();
        let mut reader = StopAware::new(io::Cursor::new(vec![b'x'; 64]), results.clone());

        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).unwrap(), 16);

        results.request_stop();
        let err = reader.read(&mut buf).unwrap_err();
        assert!(Stopped::matches(&err));
    }
}
