use super::DirInfo;
use crate::error::CollectError;
use parking_lot::Mutex;
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::info;

/// Hand-off between the scan and process stages
#[derive(Debug, Default)]
pub struct DirQueue {
    dirs: Mutex<Vec<DirInfo>>,
}

impl DirQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, dir: DirInfo) {
        self.dirs.lock().push(dir);
    }

    pub fn len(&self) -> usize {
        self.dirs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn file_count(&self) -> usize {
        self.dirs.lock().iter().map(|d| d.files.len()).sum()
    }

    /// Drain in location-code order so stage 2 starts deterministically
    pub fn take_all(&self) -> Vec<DirInfo> {
        let mut dirs = std::mem::take(&mut *self.dirs.lock());
        dirs.sort_by(|a, b| a.location_code.cmp(&b.location_code));
        dirs
    }

    /// Persist the queued set as JSON without draining it
    pub fn save(&self, path: &Path) -> Result<(), CollectError> {
        let checkpoint = |reason: String| CollectError::Checkpoint {
            path: path.to_path_buf(),
            reason,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| checkpoint(e.to_string()))?;
        }
        let file = fs::File::create(path).map_err(|e| checkpoint(e.to_string()))?;
        let dirs = self.dirs.lock();
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &*dirs).map_err(|e| checkpoint(e.to_string()))?;
        writer.flush().map_err(|e| checkpoint(e.to_string()))?;

        info!("Saved {} locations to checkpoint {}", dirs.len(), path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, CollectError> {
        let checkpoint = |reason: String| CollectError::Checkpoint {
            path: path.to_path_buf(),
            reason,
        };

        let file = fs::File::open(path).map_err(|e| checkpoint(e.to_string()))?;
        let dirs: Vec<DirInfo> =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| checkpoint(e.to_string()))?;

        info!("Loaded {} locations from checkpoint {}", dirs.len(), path.display());
        Ok(Self {
            dirs: Mutex::new(dirs),
        })
    }
}
