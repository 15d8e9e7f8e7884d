//! Result sinks
//!
//! Every packaged file goes through `CompositeWriter`, which fans it out to the
//! archive and/or copy sinks configured for the job.

pub mod archive;
pub mod copy;

pub use archive::ArchiveWriter;
pub use copy::CopyWriter;

use super::{FileData, JobParams};
use crate::error::{CollectError, WriteError};
use tracing::{debug, error, info};

pub trait ResultWriter: Send + Sync {
    /// Store one file. A destination already written is skipped, not an error.
    fn write(&self, data: &FileData) -> Result<(), WriteError>;

    /// Flush and release the output. Later writes fail with `WriteError::Closed`.
    fn close(&self) -> Result<(), WriteError>;

    fn name(&self) -> &'static str;
}

/// Fan-out over zero or more sinks
#[derive(Default)]
pub struct CompositeWriter {
    sinks: Vec<Box<dyn ResultWriter>>,
}

impl CompositeWriter {
    pub fn new(sinks: Vec<Box<dyn ResultWriter>>) -> Self {
        Self { sinks }
    }

    /// Sinks requested by the job parameters
    pub fn from_params(params: &JobParams) -> Result<Self, CollectError> {
        let mut sinks: Vec<Box<dyn ResultWriter>> = Vec::new();

        if params.save_to_archive {
            let path = params.archive_path.as_ref().ok_or_else(|| {
                CollectError::InvalidConfig("archive output enabled without an archive path".to_string())
            })?;
            if path.is_dir() {
                return Err(CollectError::InvalidConfig(format!(
                    "archive path {} is a directory",
                    path.display()
                )));
            }
            sinks.push(Box::new(ArchiveWriter::new(path)));
        }

        if let Some(root) = &params.copy_path {
            if root.is_file() {
                return Err(CollectError::InvalidConfig(format!(
                    "copy path {} is a file",
                    root.display()
                )));
            }
            sinks.push(Box::new(CopyWriter::new(root)));
        }

        if !sinks.is_empty() {
            let names: Vec<_> = sinks.iter().map(|s| s.name()).collect();
            info!("Result writers: {}", names.join(", "));
        }
        Ok(Self { sinks })
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }
}

impl ResultWriter for CompositeWriter {
    /// Every sink sees the file even if an earlier one failed; the first failure is returned
    fn write(&self, data: &FileData) -> Result<(), WriteError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.write(data) {
                if e.is_stopped() {
                    debug!("{} stopped on {}", sink.name(), data.zip_path);
                } else {
                    error!("{} failed on {}: {}", sink.name(), data.zip_path, e);
                }
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn close(&self) -> Result<(), WriteError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.close() {
                error!("Failed to close {}: {}", sink.name(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn name(&self) -> &'static str {
        "composite"
    }
}
