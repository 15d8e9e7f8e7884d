//! Job driver
//!
//! Stage 1 scans every requested location on the scan pool and collects the
//! non-empty `DirInfo`s. Stage 2 pushes each listed file through the process pool
//! into the writers. The writers are closed after stage 2 whatever the outcome.

use super::locations::LocationSource;
use super::pool::{TaskManager, TaskManagerStatus};
use super::processor::{FileProcessor, LineMatcher, ProcessTask};
use super::queue::DirQueue;
use super::scanner::{DirectoryScanner, ScanProcessor};
use super::writer::{CompositeWriter, ResultWriter};
use super::{DirInfo, FileInfo, FilterParams, JobParams, JobResults, Location, LogPattern};
use crate::error::{CollectError, Result};
use crate::fs::{FileFilter, FileServiceSelector};
use crate::storage::{LocationLookup, PatternLookup};
use crate::utils::config::{auto_workers, Config};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub scan_workers: usize,
    pub process_workers: usize,
    pub shutdown_grace: Duration,
    pub checkpoint: Option<PathBuf>,
    /// Default for jobs that don't set `package_all`
    pub package_all: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            scan_workers: auto_workers(0),
            process_workers: auto_workers(0),
            shutdown_grace: Duration::from_secs(60),
            checkpoint: None,
            package_all: false,
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            scan_workers: config.effective_scan_workers(),
            process_workers: config.effective_process_workers(),
            shutdown_grace: config.grace(),
            checkpoint: config.checkpoint_path.clone(),
            package_all: config.package_all,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub locations: usize,
    pub dirs: usize,
    pub files_to_process: u64,
    pub processed_files: u64,
    pub selected_files: u64,
    /// Events produced, including any evicted from the buffer
    pub events_total: u64,
    /// Events still held by the aggregator
    pub events_buffered: usize,
    pub cancelled: bool,
}

/// Values resolved once per run and shared read-only by both stages
struct JobContext {
    pattern: LogPattern,
    filter: Arc<FileFilter>,
    matcher: Arc<LineMatcher>,
    package_all: bool,
}

pub struct Pipeline {
    locations: Arc<dyn LocationLookup>,
    patterns: Arc<dyn PatternLookup>,
    services: Arc<FileServiceSelector>,
    results: JobResults,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        locations: Arc<dyn LocationLookup>,
        patterns: Arc<dyn PatternLookup>,
        services: Arc<FileServiceSelector>,
        results: JobResults,
        options: PipelineOptions,
    ) -> Self {
        Self {
            locations,
            patterns,
            services,
            results,
            options,
        }
    }

    pub fn results(&self) -> &JobResults {
        &self.results
    }

    /// `run` bracketed by the aggregator's lifecycle callbacks
    pub fn run_job(&self, params: &JobParams) -> Result<JobSummary> {
        self.results.before_job()?;
        let outcome = self.run(params);
        self.results.after_job(outcome.as_ref().err().map(|e| e.to_string()));
        outcome
    }

    pub fn run(&self, params: &JobParams) -> Result<JobSummary> {
        let ctx = self.resolve(params)?;
        let writer = Arc::new(CompositeWriter::from_params(params)?);
        info!(
            "Job: pattern '{}', locations [{}], {} writers",
            ctx.pattern.code,
            params.locations,
            writer.len()
        );

        let staged = self.run_stages(&ctx, params, &writer);
        let closed = writer.close();

        let summary = staged?;
        closed?;
        Ok(summary)
    }

    fn resolve(&self, params: &JobParams) -> Result<JobContext> {
        let pattern = self
            .patterns
            .get_by_code(&params.pattern_code)
            .ok_or_else(|| CollectError::PatternNotFound(params.pattern_code.clone()))?;

        if let (Some(from), Some(to)) = (params.date_from, params.date_to) {
            if from > to {
                return Err(CollectError::InvalidConfig(format!(
                    "date_from {} is after date_to {}",
                    from, to
                )));
            }
        }

        let filter = FileFilter::new(&FilterParams::for_job(&pattern, params))?;
        let matcher = LineMatcher::new(&pattern, params.search.as_deref())?;

        Ok(JobContext {
            filter: Arc::new(filter),
            matcher: Arc::new(matcher),
            package_all: params.package_all.unwrap_or(self.options.package_all),
            pattern,
        })
    }

    fn run_stages(
        &self,
        ctx: &JobContext,
        params: &JobParams,
        writer: &Arc<CompositeWriter>,
    ) -> Result<JobSummary> {
        let (locations, dirs) = self.scan_stage(ctx, params)?;
        let dirs = self.hand_off(dirs)?;
        let dir_count = dirs.len();
        let location_count = locations.len();

        let processed = self.process_stage(ctx, locations, dirs, writer);
        if let Some(path) = &self.options.checkpoint {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove checkpoint {}: {}", path.display(), e);
                }
            }
        }
        processed?;

        Ok(JobSummary {
            locations: location_count,
            dirs: dir_count,
            files_to_process: self.results.files_to_process(),
            processed_files: self.results.processed_files(),
            selected_files: self.results.selected_files(),
            events_total: self.results.total_events(),
            events_buffered: self.results.len(),
            cancelled: self.results.is_stopping(),
        })
    }

    /// Stage 1: one pool task per location
    fn scan_stage(
        &self,
        ctx: &JobContext,
        params: &JobParams,
    ) -> Result<(HashMap<String, Arc<Location>>, Arc<DirQueue>)> {
        let queue = Arc::new(DirQueue::new());
        let scanner = DirectoryScanner::new(self.services.clone(), ctx.filter.clone(), self.results.clone());
        let pool = TaskManager::<Location>::start(
            "scan",
            self.options.scan_workers,
            Arc::new(ScanProcessor::new(scanner, queue.clone())),
        )
        .map_err(|e| CollectError::Pool(format!("{:#}", e)))?;

        let source = LocationSource::new(params.locations.as_str(), self.locations.clone());
        let mut locations = HashMap::new();
        let mut submitted = Ok(());
        for location in &source {
            locations.insert(location.code.clone(), Arc::new(location.clone()));
            if let Err(e) = pool.submit(location) {
                submitted = Err(CollectError::Pool(format!("{:#}", e)));
                break;
            }
        }
        source.close();

        let status = pool.shutdown(self.options.shutdown_grace);
        submitted?;
        check_stage("scan", &status, self.options.shutdown_grace)?;

        info!(
            "Scan finished: {} of {} locations have files, {} files to process",
            queue.len(),
            locations.len(),
            self.results.files_to_process()
        );
        Ok((locations, queue))
    }

    /// Pass the stage-1 output to stage 2, through disk when checkpointing
    fn hand_off(&self, queue: Arc<DirQueue>) -> Result<Vec<DirInfo>> {
        match &self.options.checkpoint {
            Some(path) => {
                queue.save(path)?;
                Ok(DirQueue::load(path)?.take_all())
            }
            None => Ok(queue.take_all()),
        }
    }

    /// Stage 2: one pool task per file
    fn process_stage(
        &self,
        ctx: &JobContext,
        locations: HashMap<String, Arc<Location>>,
        dirs: Vec<DirInfo>,
        writer: &Arc<CompositeWriter>,
    ) -> Result<()> {
        let mut processor = FileProcessor::new(
            self.services.clone(),
            Arc::new(locations),
            ctx.matcher.clone(),
            self.results.clone(),
        );
        if !writer.is_empty() {
            processor = processor.with_packaging(ctx.package_all);
        }

        let pool = TaskManager::<FileInfo>::start(
            "process",
            self.options.process_workers,
            Arc::new(ProcessTask::new(processor, writer.clone())),
        )
        .map_err(|e| CollectError::Pool(format!("{:#}", e)))?;

        let mut submitted = Ok(());
        'dirs: for dir in dirs {
            for file in dir.files {
                if let Err(e) = pool.submit(file) {
                    submitted = Err(CollectError::Pool(format!("{:#}", e)));
                    break 'dirs;
                }
            }
        }

        let status = pool.shutdown(self.options.shutdown_grace);
        submitted?;
        check_stage("process", &status, self.options.shutdown_grace)?;

        info!(
            "Processing finished: {} processed, {} selected, {} events",
            self.results.processed_files(),
            self.results.selected_files(),
            self.results.len()
        );
        Ok(())
    }
}

fn check_stage(stage: &'static str, status: &TaskManagerStatus, grace: Duration) -> Result<()> {
    if status.timed_out {
        return Err(CollectError::Pool(format!(
            "{} stage made no progress for {}",
            stage,
            humantime::format_duration(grace)
        )));
    }
    if status.failed_tasks > 0 {
        return Err(CollectError::TaskFailures {
            stage,
            failed: status.failed_tasks,
            last: status.last_error.clone().unwrap_or_default(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::{Credentials, LocationKind};
    use crate::storage::Catalog;
    use std::fs;
    use std::path::Path;

    fn catalog(root: &Path) -> Arc<Catalog> {
        let location = Location {
            code: "app".to_string(),
            kind: LocationKind::Local,
            host: None,
            port: None,
            credentials: Credentials::default(),
            path: root.to_string_lossy().to_string(),
        };
        let pattern = LogPattern {
            code: "errors".to_string(),
            name: "Errors".to_string(),
            includes: vec!["*.log".to_string()],
            line_regex: Some("ERROR".to_string()),
            timestamp_format: None,
        };
        Arc::new(Catalog::new(vec![location], vec![pattern]))
    }

    fn pipeline(catalog: Arc<Catalog>, options: PipelineOptions) -> Pipeline {
        Pipeline::new(
            catalog.clone(),
            catalog,
            Arc::new(FileServiceSelector::default()),
            JobResults::new(100),
            options,
        )
    }

    fn options() -> PipelineOptions {
        PipelineOptions {
            scan_workers: 2,
            process_workers: 2,
            shutdown_grace: Duration::from_secs(10),
            ..Default::default()
        }
    }

    #[test]
    fn test_unknown_pattern_fails_job() {
        let tmp = tempfile::tempdir().unwrap();
        let p = pipeline(catalog(tmp.path()), options());
        let err = p
            .run_job(&JobParams {
                pattern_code: "nope".to_string(),
                locations: "app".to_string(),
                ..Default::default()
            })
            .unwrap_err();

        assert!(matches!(err, CollectError::PatternNotFound(_)));
        assert!(!p.results().is_success());
        assert_eq!(p.results().error().as_deref(), Some("Log pattern 'nope' not found"));
    }

    #[test]
    fn test_inverted_window_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let p = pipeline(catalog(tmp.path()), options());
        let err = p
            .run(&JobParams {
                pattern_code: "errors".to_string(),
                locations: "app".to_string(),
                date_from: chrono::DateTime::from_timestamp(2_000, 0),
                date_to: chrono::DateTime::from_timestamp(1_000, 0),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, CollectError::InvalidConfig(_)));
    }

    #[test]
    fn test_checkpoint_is_removed_after_run() {
        let tmp = tempfile::tempdir().unwrap();
        let logs = tmp.path().join("logs");
        fs::create_dir_all(&logs).unwrap();
        fs::write(logs.join("a.log"), "ERROR x\n").unwrap();
        let checkpoint = tmp.path().join("handoff.json");

        let p = pipeline(
            catalog(&logs),
            PipelineOptions {
                checkpoint: Some(checkpoint.clone()),
                ..options()
            },
        );
        let summary = p
            .run_job(&JobParams {
                pattern_code: "errors".to_string(),
                locations: "app".to_string(),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(summary.dirs, 1);
        assert_eq!(summary.events_total, 1);
        assert_eq!(summary.events_buffered, 1);
        assert!(!checkpoint.exists());
        assert!(p.results().is_success());
    }
}
