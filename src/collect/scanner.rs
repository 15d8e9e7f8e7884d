use super::pool::TaskProcessor;
use super::queue::DirQueue;
use super::{DirInfo, JobResults, Location};
use crate::error::ScanError;
use crate::fs::{FileFilter, FileServiceSelector};
use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info};

/// Lists one location through its backend and bundles the matches
pub struct DirectoryScanner {
    services: Arc<FileServiceSelector>,
    filter: Arc<FileFilter>,
    results: JobResults,
}

impl DirectoryScanner {
    pub fn new(services: Arc<FileServiceSelector>, filter: Arc<FileFilter>, results: JobResults) -> Self {
        Self {
            services,
            filter,
            results,
        }
    }

    /// `None` when nothing matched or the location could not be listed
    pub fn scan(&self, location: &Location) -> Option<DirInfo> {
        let service = self.services.select(location.kind);
        let results = &self.results;
        let cancelled = || results.is_stopping();

        let files = match service.list_files(location, &self.filter, &cancelled) {
            Ok(files) => {
                info!("{} {} {} files selected", location.code, location.path, files.len());
                files
            }
            Err(ScanError::Cancelled { .. }) => {
                debug!("{} {} listing cancelled", location.code, location.path);
                return None;
            }
            Err(e) => {
                info!("{} {} error: {}", location.code, location.path, e);
                return None;
            }
        };

        let dir = DirInfo::new(location, files)?;
        self.results.add_files_to_process(dir.files.len() as u64);
        Some(dir)
    }
}

/// Stage-1 pool task: scan one location, queue the result
pub struct ScanProcessor {
    scanner: DirectoryScanner,
    queue: Arc<DirQueue>,
}

impl ScanProcessor {
    pub fn new(scanner: DirectoryScanner, queue: Arc<DirQueue>) -> Self {
        Self { scanner, queue }
    }
}

impl TaskProcessor<Location> for ScanProcessor {
    fn process_task(&self, worker_id: usize, location: Location) -> Result<()> {
        if self.scanner.results.is_stopping() {
            debug!("Worker {} skipping {}: job stopping", worker_id, location.code);
            return Ok(());
        }

        debug!("Worker {} scanning {}", worker_id, location);
        if let Some(dir) = self.scanner.scan(&location) {
            self.queue.push(dir);
        }
        Ok(())
    }
}
