//! Zip archive sink
//!
//! Files are deflated in parallel, each into a private single-entry scratch archive.
//! Only the raw copy of the finished entry into the shared archive happens under
//! the output lock, so the central directory sees one entry at a time.

use super::ResultWriter;
use crate::collect::FileData;
use crate::error::WriteError;
use chrono::{Datelike, Local, Timelike};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

enum Output {
    /// Nothing written yet; the file is created on first use
    Pending,
    Open(ZipWriter<File>),
    Closed,
}

pub struct ArchiveWriter {
    path: PathBuf,
    written: Mutex<HashSet<String>>,
    output: Mutex<Output>,
}

impl ArchiveWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            written: Mutex::new(HashSet::new()),
            output: Mutex::new(Output::Pending),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn create(&self) -> Result<ZipWriter<File>, WriteError> {
        let open_err = |source| WriteError::Open {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(open_err)?;
        }
        let file = File::create(&self.path).map_err(open_err)?;
        info!("Result file {}", self.path.display());
        Ok(ZipWriter::new(file))
    }

    /// Deflate one file into an anonymous temp archive
    fn scatter(&self, data: &FileData) -> Result<File, WriteError> {
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(zip_time(data))
            .large_file(data.file.size >= u32::MAX as u64);

        let mut scratch = ZipWriter::new(tempfile::tempfile()?);
        scratch.start_file(data.zip_path.as_str(), options)?;
        let mut input = data.open()?;
        io::copy(&mut input, &mut scratch)?;
        Ok(scratch.finish()?)
    }

    /// Append the scratch entry to the shared archive
    fn merge(&self, scratch: File) -> Result<(), WriteError> {
        let mut source = ZipArchive::new(scratch)?;
        let entry = source.by_index_raw(0)?;

        let mut output = self.output.lock();
        if matches!(*output, Output::Pending) {
            *output = Output::Open(self.create()?);
        }
        match &mut *output {
            Output::Open(zip) => Ok(zip.raw_copy_file(entry)?),
            _ => Err(WriteError::Closed),
        }
    }
}

impl ResultWriter for ArchiveWriter {
    fn write(&self, data: &FileData) -> Result<(), WriteError> {
        if matches!(*self.output.lock(), Output::Closed) {
            return Err(WriteError::Closed);
        }
        if !self.written.lock().insert(data.zip_path.clone()) {
            warn!("File {} is already in archive. Skipping", data.zip_path);
            return Ok(());
        }

        info!("Saving {} to {}", data.file.path.display(), data.zip_path);
        let result = self.scatter(data).and_then(|scratch| self.merge(scratch));
        if result.is_err() {
            // Nothing landed, let a later attempt claim the path
            self.written.lock().remove(&data.zip_path);
        }
        result
    }

    fn close(&self) -> Result<(), WriteError> {
        let previous = std::mem::replace(&mut *self.output.lock(), Output::Closed);
        let zip = match previous {
            Output::Pending => self.create()?,
            Output::Open(zip) => zip,
            Output::Closed => return Ok(()),
        };
        zip.finish()?;
        info!(
            "Closed {} with {} entries",
            self.path.display(),
            self.written.lock().len()
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "archive"
    }
}

/// Modification time as a DOS timestamp; pre-1980 files get the format's epoch
fn zip_time(data: &FileData) -> zip::DateTime {
    let t = data.file.modified.with_timezone(&Local);
    u16::try_from(t.year())
        .ok()
        .and_then(|year| {
            zip::DateTime::from_date_and_time(
                year,
                t.month() as u8,
                t.day() as u8,
                t.hour() as u8,
                t.minute() as u8,
                t.second() as u8,
            )
            .ok()
        })
        .unwrap_or_default()
}
