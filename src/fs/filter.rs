//! Include-glob and modification-window matching shared by all backends.

use crate::collect::FilterParams;
use crate::error::CollectError;
use chrono::{DateTime, Utc};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

/// Normalize an include pattern for matching against relative paths.
///
/// - Empty or "*" becomes "**/*"
/// - Leading slashes are stripped
/// - Patterns without a separator match at any depth
pub fn normalize_include(raw: &str) -> String {
    let mut pattern = raw.trim().trim_start_matches('/').to_string();

    if pattern.is_empty() || pattern == "*" {
        pattern = "**/*".to_string();
    }

    if !pattern.contains('/') && !pattern.starts_with("**/") && pattern != "**/*" {
        pattern = format!("**/{}", pattern);
    }

    pattern
}

#[derive(Debug, Clone)]
pub struct FileFilter {
    includes: Option<GlobSet>,
    date_from: Option<DateTime<Utc>>,
    date_to: Option<DateTime<Utc>>,
}

impl FileFilter {
    pub fn new(params: &FilterParams) -> Result<Self, CollectError> {
        let includes = if params.includes.is_empty() {
            None
        } else {
            let mut builder = GlobSetBuilder::new();
            for raw in &params.includes {
                let glob = GlobBuilder::new(&normalize_include(raw))
                    .literal_separator(true)
                    .build()
                    .map_err(|e| CollectError::InvalidPattern {
                        pattern: raw.clone(),
                        reason: e.to_string(),
                    })?;
                builder.add(glob);
            }
            Some(builder.build().map_err(|e| CollectError::InvalidPattern {
                pattern: params.includes.join(","),
                reason: e.to_string(),
            })?)
        };

        Ok(Self {
            includes,
            date_from: params.date_from,
            date_to: params.date_to,
        })
    }

    /// Accept-all filter
    pub fn any() -> Self {
        Self {
            includes: None,
            date_from: None,
            date_to: None,
        }
    }

    pub fn matches(&self, relative_path: &str, modified: DateTime<Utc>) -> bool {
        self.matches_name(relative_path) && self.in_window(modified)
    }

    pub fn matches_name(&self, relative_path: &str) -> bool {
        match &self.includes {
            Some(set) => set.is_match(relative_path.trim_start_matches('/')),
            None => true,
        }
    }

    /// Both bounds inclusive
    pub fn in_window(&self, modified: DateTime<Utc>) -> bool {
        self.date_from.map_or(true, |from| modified >= from)
            && self.date_to.map_or(true, |to| modified <= to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn params(includes: &[&str]) -> FilterParams {
        FilterParams {
            includes: includes.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn normalize_basics() {
        assert_eq!(normalize_include(""), "**/*");
        assert_eq!(normalize_include("*"), "**/*");
        assert_eq!(normalize_include("*.log"), "**/*.log");
        assert_eq!(normalize_include("app/*.log"), "app/*.log");
        assert_eq!(normalize_include("/app/*.log"), "app/*.log");
    }

    #[test]
    fn test_include_globs() {
        let filter = FileFilter::new(&params(&["*.log", "archive/*.gz"])).unwrap();
        assert!(filter.matches_name("server.log"));
        assert!(filter.matches_name("nested/deep/server.log"));
        assert!(filter.matches_name("archive/old.gz"));
        assert!(!filter.matches_name("other/archive/old.gz"));
        assert!(!filter.matches_name("server.txt"));
    }

    #[test]
    fn test_empty_includes_match_everything() {
        let filter = FileFilter::new(&params(&[])).unwrap();
        assert!(filter.matches_name("anything/at/all.bin"));
    }

    #[test]
    fn test_invalid_glob_is_rejected() {
        let err = FileFilter::new(&params(&["a[b"])).unwrap_err();
        assert!(matches!(err, CollectError::InvalidPattern { .. }));
    }

    #[test]
    fn test_window_is_inclusive() {
        let from = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 3, 31, 23, 59, 59).unwrap();
        let filter = FileFilter::new(&FilterParams {
            includes: Vec::new(),
            date_from: Some(from),
            date_to: Some(to),
        })
        .unwrap();

        assert!(filter.in_window(from));
        assert!(filter.in_window(to));
        assert!(!filter.in_window(from - chrono::Duration::seconds(1)));
        assert!(!filter.in_window(to + chrono::Duration::seconds(1)));
    }
}
