//! Filesystem backends
//!
//! Every location type maps to exactly one `FileService`. The selector is a plain
//! match on `LocationKind`, so adding a backend means adding a variant.

pub mod filter;
pub mod local;
pub mod remote;

pub use filter::FileFilter;
pub use local::LocalFileService;
pub use remote::{RemoteConnector, RemoteEntry, RemoteSession, SftpFileService};

use crate::collect::{FileInfo, Location, LocationKind};
use crate::error::ScanError;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Capabilities a backend must provide
pub trait FileService: Send + Sync {
    /// List files under the location root accepted by `filter`.
    /// `cancelled` is polled between entries; a cancelled listing fails with
    /// `ScanError::Cancelled` and its partial result is dropped.
    fn list_files(
        &self,
        location: &Location,
        filter: &FileFilter,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<Vec<FileInfo>, ScanError>;

    /// Path of `path` below `base`, `/`-separated
    fn relative_path(&self, path: &Path, base: &str) -> String;

    /// Open a file previously returned by `list_files`
    fn open(&self, location: &Location, file: &FileInfo) -> std::io::Result<Box<dyn Read + Send>>;
}

pub struct FileServiceSelector {
    local: LocalFileService,
    sftp: SftpFileService,
}

impl FileServiceSelector {
    pub fn new(connector: Arc<dyn RemoteConnector>) -> Self {
        Self {
            local: LocalFileService,
            sftp: SftpFileService::new(connector),
        }
    }

    /// Build the selector with the compiled-in SFTP transport
    pub fn with_timeout(remote_timeout: Duration) -> Self {
        Self::new(remote::default_connector(remote_timeout))
    }

    pub fn select(&self, kind: LocationKind) -> &dyn FileService {
        match kind {
            LocationKind::Local => &self.local,
            LocationKind::Sftp => &self.sftp,
        }
    }
}

impl Default for FileServiceSelector {
    fn default() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }
}

pub(crate) fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .filter(|c| c != "/" && c != "\\")
        .collect::<Vec<_>>()
        .join("/")
}
