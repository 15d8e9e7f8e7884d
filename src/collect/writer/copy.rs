use super::ResultWriter;
use crate::collect::FileData;
use crate::error::WriteError;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Mirrors packaged files under a folder, `<root>/<location>/<relative path>`
pub struct CopyWriter {
    root: PathBuf,
    written: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl CopyWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            written: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Destination for `zip_path`, confined to the root
    fn destination(&self, zip_path: &str) -> PathBuf {
        let mut dest = self.root.clone();
        for part in Path::new(zip_path).components() {
            if let Component::Normal(part) = part {
                dest.push(part);
            }
        }
        dest
    }
}

impl ResultWriter for CopyWriter {
    fn write(&self, data: &FileData) -> Result<(), WriteError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WriteError::Closed);
        }
        if !self.written.lock().insert(data.zip_path.clone()) {
            warn!("File {} is already copied. Skipping", data.zip_path);
            return Ok(());
        }

        let dest = self.destination(&data.zip_path);
        info!("Copying {} to {}", data.file.path.display(), dest.display());

        let mut created = false;
        let result = (|| -> Result<(), WriteError> {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut input = data.open()?;
            let mut output = File::create(&dest).map_err(|source| WriteError::Open {
                path: dest.clone(),
                source,
            })?;
            created = true;
            io::copy(&mut input, &mut output)?;
            Ok(())
        })();

        if result.is_err() {
            // No half-copied files in the output tree
            if created {
                let _ = fs::remove_file(&dest);
            }
            self.written.lock().remove(&data.zip_path);
        }
        result
    }

    fn close(&self) -> Result<(), WriteError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(
                "Copied {} files to {}",
                self.written.lock().len(),
                self.root.display()
            );
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "copy"
    }
}
