//! SFTP backend
//!
//! The transport sits behind `RemoteConnector`, one session per listing and per
//! opened file. Sessions are owned boxes, so they are released on every exit path.

use super::{to_slash, FileFilter, FileService};
use crate::collect::{FileInfo, Location};
use crate::error::ScanError;
use chrono::{DateTime, Utc};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_PORT: u16 = 22;

/// One entry of a remote directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub path: PathBuf,
    pub is_dir: bool,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// An open connection to one remote host
pub trait RemoteSession: Send {
    fn read_dir(&mut self, path: &Path) -> io::Result<Vec<RemoteEntry>>;

    /// Open a file for reading. The session lives as long as the reader.
    fn open(self: Box<Self>, path: &Path) -> io::Result<Box<dyn Read + Send>>;
}

pub trait RemoteConnector: Send + Sync {
    fn connect(&self, location: &Location) -> Result<Box<dyn RemoteSession>, ScanError>;
}

/// Connector used when the binary is built without SFTP support
#[derive(Debug, Default)]
pub struct UnsupportedConnector;

impl RemoteConnector for UnsupportedConnector {
    fn connect(&self, location: &Location) -> Result<Box<dyn RemoteSession>, ScanError> {
        Err(ScanError::Unsupported(format!(
            "{} (built without sftp support)",
            location
        )))
    }
}

#[cfg(feature = "sftp")]
pub fn default_connector(timeout: Duration) -> Arc<dyn RemoteConnector> {
    Arc::new(ssh::Ssh2Connector::new(timeout))
}

#[cfg(not(feature = "sftp"))]
pub fn default_connector(_timeout: Duration) -> Arc<dyn RemoteConnector> {
    Arc::new(UnsupportedConnector)
}

pub struct SftpFileService {
    connector: Arc<dyn RemoteConnector>,
}

impl SftpFileService {
    pub fn new(connector: Arc<dyn RemoteConnector>) -> Self {
        Self { connector }
    }

    fn walk(
        &self,
        session: &mut dyn RemoteSession,
        location: &Location,
        filter: &FileFilter,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<Vec<FileInfo>, ScanError> {
        let root = PathBuf::from(&location.path);
        let mut pending = vec![root.clone()];
        let mut files = Vec::new();

        while let Some(dir) = pending.pop() {
            if cancelled() {
                debug!("{}: listing cancelled after {} files", location.code, files.len());
                return Err(ScanError::Cancelled {
                    location: location.code.clone(),
                });
            }

            let entries = match session.read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if dir == root => return Err(ScanError::from_io(&location.path, e)),
                Err(e) => {
                    debug!("{}: skipping {}: {}", location.code, dir.display(), e);
                    continue;
                }
            };

            for entry in entries {
                if entry.is_dir {
                    pending.push(entry.path);
                    continue;
                }

                let relative_path = self.relative_path(&entry.path, &location.path);
                if !filter.matches(&relative_path, entry.modified) {
                    continue;
                }

                files.push(FileInfo {
                    path: entry.path,
                    relative_path,
                    location_code: location.code.clone(),
                    host: location.host.clone(),
                    size: entry.size,
                    modified: entry.modified,
                });
            }
        }

        Ok(files)
    }
}

impl FileService for SftpFileService {
    fn list_files(
        &self,
        location: &Location,
        filter: &FileFilter,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<Vec<FileInfo>, ScanError> {
        let mut session = self.connector.connect(location)?;
        info!("{}: connected", location);
        self.walk(session.as_mut(), location, filter, cancelled)
    }

    fn relative_path(&self, path: &Path, base: &str) -> String {
        let full = to_slash(path);
        let base = to_slash(Path::new(base));
        if base.is_empty() {
            return full;
        }
        match full.strip_prefix(&base) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => {
                rest.trim_start_matches('/').to_string()
            }
            _ => full,
        }
    }

    fn open(&self, location: &Location, file: &FileInfo) -> io::Result<Box<dyn Read + Send>> {
        let session = self
            .connector
            .connect(location)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        session.open(&file.path)
    }
}

#[cfg(feature = "sftp")]
mod ssh {
    use super::*;
    use std::net::{TcpStream, ToSocketAddrs};

    /// libssh2-backed connector
    pub struct Ssh2Connector {
        timeout: Duration,
    }

    impl Ssh2Connector {
        pub fn new(timeout: Duration) -> Self {
            Self { timeout }
        }

        fn session(&self, location: &Location, host: &str) -> Result<ssh2::Sftp, String> {
            let port = location.port.unwrap_or(DEFAULT_PORT);
            let addr = (host, port)
                .to_socket_addrs()
                .map_err(|e| e.to_string())?
                .next()
                .ok_or_else(|| format!("no address for {}", host))?;

            let tcp = TcpStream::connect_timeout(&addr, self.timeout).map_err(|e| e.to_string())?;
            tcp.set_read_timeout(Some(self.timeout)).map_err(|e| e.to_string())?;

            let mut session = ssh2::Session::new().map_err(|e| e.to_string())?;
            session.set_tcp_stream(tcp);
            session.set_timeout(self.timeout.as_millis().min(u32::MAX as u128) as u32);
            session.handshake().map_err(|e| e.to_string())?;

            let user = location.credentials.user.as_deref().unwrap_or("root");
            match &location.credentials.password {
                Some(password) => session.userauth_password(user, password),
                None => session.userauth_agent(user),
            }
            .map_err(|e| e.to_string())?;

            if !session.authenticated() {
                return Err(format!("authentication failed for {}", user));
            }

            session.sftp().map_err(|e| e.to_string())
        }
    }

    impl RemoteConnector for Ssh2Connector {
        fn connect(&self, location: &Location) -> Result<Box<dyn RemoteSession>, ScanError> {
            let host = location.host.clone().unwrap_or_default();
            if host.is_empty() {
                return Err(ScanError::Connection {
                    host,
                    reason: format!("location '{}' has no host", location.code),
                });
            }

            let sftp = self
                .session(location, &host)
                .map_err(|reason| ScanError::Connection { host, reason })?;
            Ok(Box::new(Ssh2Session { sftp }))
        }
    }

    struct Ssh2Session {
        sftp: ssh2::Sftp,
    }

    impl RemoteSession for Ssh2Session {
        fn read_dir(&mut self, path: &Path) -> io::Result<Vec<RemoteEntry>> {
            let entries = self.sftp.readdir(path)?;
            Ok(entries
                .into_iter()
                .filter(|(p, _)| {
                    !matches!(p.file_name().and_then(|n| n.to_str()), Some(".") | Some(".."))
                })
                .map(|(path, stat)| RemoteEntry {
                    path,
                    is_dir: stat.is_dir(),
                    size: stat.size.unwrap_or(0),
                    modified: stat
                        .mtime
                        .and_then(|t| DateTime::from_timestamp(t as i64, 0))
                        .unwrap_or_default(),
                })
                .collect())
        }

        fn open(self: Box<Self>, path: &Path) -> io::Result<Box<dyn Read + Send>> {
            let file = self.sftp.open(path)?;
            Ok(Box::new(Ssh2Reader {
                file,
                _sftp: self.sftp,
            }))
        }
    }

    struct Ssh2Reader {
        file: ssh2::File,
        _sftp: ssh2::Sftp,
    }

    impl Read for Ssh2Reader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.file.read(buf)
        }
    }
}
