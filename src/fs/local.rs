use super::{to_slash, FileFilter, FileService};
use crate::collect::{FileInfo, Location};
use crate::error::ScanError;
use chrono::{DateTime, Utc};
use std::fs;
use std::io::Read;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// Direct filesystem walk
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileService;

impl FileService for LocalFileService {
    fn list_files(
        &self,
        location: &Location,
        filter: &FileFilter,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<Vec<FileInfo>, ScanError> {
        let root = Path::new(&location.path);
        let metadata = fs::metadata(root).map_err(|e| ScanError::from_io(&location.path, e))?;
        if !metadata.is_dir() {
            return Err(ScanError::NotFound {
                path: location.path.clone(),
            });
        }
        // Surface access denied on the root itself instead of an empty walk
        fs::read_dir(root).map_err(|e| ScanError::from_io(&location.path, e))?;

        let mut files = Vec::new();

        for entry in WalkDir::new(root).follow_links(true) {
            if cancelled() {
                debug!("{}: listing cancelled after {} files", location.code, files.len());
                return Err(ScanError::Cancelled {
                    location: location.code.clone(),
                });
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("{}: skipping unreadable entry: {}", location.code, e);
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let relative_path = self.relative_path(entry.path(), &location.path);
            if !filter.matches_name(&relative_path) {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    debug!("{}: no metadata for {}: {}", location.code, entry.path().display(), e);
                    continue;
                }
            };
            let modified: DateTime<Utc> = match metadata.modified() {
                Ok(t) => t.into(),
                Err(_) => continue,
            };
            if !filter.in_window(modified) {
                continue;
            }

            files.push(FileInfo {
                path: entry.path().to_path_buf(),
                relative_path,
                location_code: location.code.clone(),
                host: location.host.clone(),
                size: metadata.len(),
                modified,
            });
        }

        Ok(files)
    }

    fn relative_path(&self, path: &Path, base: &str) -> String {
        match path.strip_prefix(base) {
            Ok(rel) => to_slash(rel),
            Err(_) => to_slash(path),
        }
    }

    fn open(&self, _location: &Location, file: &FileInfo) -> std::io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(fs::File::open(&file.path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::{Credentials, FilterParams, LocationKind};
    use filetime::{set_file_mtime, FileTime};

    fn location(path: &Path) -> Location {
        Location {
            code: "local".to_string(),
            kind: LocationKind::Local,
            host: None,
            port: None,
            credentials: Credentials::default(),
            path: path.to_string_lossy().to_string(),
        }
    }

    fn never() -> bool {
        false
    }

    #[test]
    fn test_lists_matching_files_recursively() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("a.log"), "one").unwrap();
        fs::write(dir.path().join("nested/b.log"), "two").unwrap();
        fs::write(dir.path().join("c.txt"), "three").unwrap();

        let filter = FileFilter::new(&FilterParams {
            includes: vec!["*.log".to_string()],
            ..Default::default()
        })
        .unwrap();

        let mut files = LocalFileService
            .list_files(&location(dir.path()), &filter, &never)
            .unwrap();
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        let names: Vec<_> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(names, vec!["a.log", "nested/b.log"]);
        assert_eq!(files[0].size, 3);
        assert_eq!(files[0].location_code, "local");
    }

    #[test]
    fn test_modification_window() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.log");
        let new = dir.path().join("new.log");
        fs::write(&old, "x").unwrap();
        fs::write(&new, "y").unwrap();
        set_file_mtime(&old, FileTime::from_unix_time(1_600_000_000, 0)).unwrap();
        set_file_mtime(&new, FileTime::from_unix_time(1_700_000_000, 0)).unwrap();

        let filter = FileFilter::new(&FilterParams {
            includes: Vec::new(),
            date_from: DateTime::from_timestamp(1_650_000_000, 0),
            date_to: DateTime::from_timestamp(1_700_000_000, 0),
        })
        .unwrap();

        let files = LocalFileService
            .list_files(&location(dir.path()), &filter, &never)
            .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, "new.log");
    }

    #[test]
    fn test_missing_root_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let err = LocalFileService
            .list_files(&location(&missing), &FileFilter::any(), &never)
            .unwrap_err();
        assert!(matches!(err, ScanError::NotFound { .. }));
    }

    #[test]
    fn test_relative_path_falls_back_to_full_path() {
        let rel = LocalFileService.relative_path(Path::new("/var/log/app/x.log"), "/var/log");
        assert_eq!(rel, "app/x.log");
        let rel = LocalFileService.relative_path(Path::new("/opt/x.log"), "/var/log");
        assert_eq!(rel, "opt/x.log");
    }

    #[test]
    fn test_cancelled_listing_returns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.log"), "one").unwrap();

        let err = LocalFileService
            .list_files(&location(dir.path()), &FileFilter::any(), &|| true)
            .unwrap_err();
        assert!(matches!(err, ScanError::Cancelled { .. }));
    }
}
