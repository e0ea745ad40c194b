use std::fs;
use std::io::{self, Read};
use std::time::UNIX_EPOCH;

use thiserror::Error;

use crate::paths::native_to_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    File,
    Dir,
}

/// Metadata snapshot of one filesystem entry.
#[derive(Debug, Clone, Copy)]
pub struct FileInfo {
    pub kind: EntryType,
    pub size: i64,
    pub mtime: i64,
    pub inode: u64,
    /// Some filesystems yield no stable identifier; the inode value is then
    /// meaningless and must not enter the by-inode index.
    pub inode_valid: bool,
}

#[derive(Debug, Error)]
#[error("{source}")]
pub struct OpenError {
    /// Transient failure (locking, momentary permission denial): the caller
    /// should re-enqueue and retry. Permanent failures mean the entry is gone.
    pub retry: bool,
    #[source]
    pub source: io::Error,
}

impl OpenError {
    fn from_io(source: io::Error) -> Self {
        let retry = matches!(
            source.kind(),
            io::ErrorKind::PermissionDenied
                | io::ErrorKind::WouldBlock
                | io::ErrorKind::Interrupted
                | io::ErrorKind::TimedOut
        );
        Self { retry, source }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MkdirOutcome {
    pub created: bool,
    pub target_exists: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RenameOutcome {
    pub renamed: bool,
    pub target_exists: bool,
    pub transient: bool,
}

/// Filesystem abstraction consumed by the scan engine. Paths are native
/// bytes; see [`crate::paths`].
pub trait FsAccess: Send + Sync {
    fn open(&self, path: &[u8], follow_symlinks: bool) -> Result<FileInfo, OpenError>;

    /// Child names of a directory, in unspecified order.
    fn open_dir(&self, path: &[u8]) -> Result<Vec<Vec<u8>>, OpenError>;

    fn mkdir(&self, path: &[u8], recursive: bool) -> MkdirOutcome;

    fn rename(&self, src: &[u8], dst: &[u8], replace: bool) -> RenameOutcome;

    /// Stable identifier of the volume holding `path`, 0 if unknown.
    fn volume_fingerprint(&self, path: &[u8]) -> u64;

    /// Content fingerprint of a file (opaque bytes).
    fn fingerprint(&self, path: &[u8]) -> Result<Vec<u8>, OpenError>;
}

/// `std::fs`-backed implementation.
pub struct StdFs;

fn mtime_unix(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn identity(meta: &fs::Metadata) -> (u64, bool) {
    use std::os::unix::fs::MetadataExt;
    (meta.ino(), true)
}

#[cfg(not(unix))]
fn identity(_meta: &fs::Metadata) -> (u64, bool) {
    (0, false)
}

#[cfg(unix)]
fn device_id(meta: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.dev()
}

#[cfg(not(unix))]
fn device_id(_meta: &fs::Metadata) -> u64 {
    0
}

impl FsAccess for StdFs {
    fn open(&self, path: &[u8], follow_symlinks: bool) -> Result<FileInfo, OpenError> {
        let path = native_to_path(path)
            .map_err(|_| OpenError::from_io(io::Error::from(io::ErrorKind::InvalidInput)))?;
        let meta = if follow_symlinks {
            fs::metadata(&path)
        } else {
            fs::symlink_metadata(&path)
        }
        .map_err(OpenError::from_io)?;

        if !follow_symlinks && meta.file_type().is_symlink() {
            return Err(OpenError {
                retry: false,
                source: io::Error::from(io::ErrorKind::Unsupported),
            });
        }

        let (inode, inode_valid) = identity(&meta);
        Ok(FileInfo {
            kind: if meta.is_dir() {
                EntryType::Dir
            } else {
                EntryType::File
            },
            size: if meta.is_dir() { 0 } else { meta.len() as i64 },
            mtime: mtime_unix(&meta),
            inode,
            inode_valid,
        })
    }

    fn open_dir(&self, path: &[u8]) -> Result<Vec<Vec<u8>>, OpenError> {
        let path = native_to_path(path)
            .map_err(|_| OpenError::from_io(io::Error::from(io::ErrorKind::InvalidInput)))?;
        let mut names = Vec::new();
        for entry in fs::read_dir(&path).map_err(OpenError::from_io)? {
            let entry = entry.map_err(OpenError::from_io)?;
            #[cfg(unix)]
            {
                use std::os::unix::ffi::OsStrExt;
                names.push(entry.file_name().as_bytes().to_vec());
            }
            #[cfg(not(unix))]
            {
                names.push(entry.file_name().to_string_lossy().into_owned().into_bytes());
            }
        }
        Ok(names)
    }

    fn mkdir(&self, path: &[u8], recursive: bool) -> MkdirOutcome {
        let Ok(path) = native_to_path(path) else {
            return MkdirOutcome::default();
        };
        let result = if recursive {
            fs::create_dir_all(&path)
        } else {
            fs::create_dir(&path)
        };
        match result {
            Ok(()) => MkdirOutcome {
                created: true,
                target_exists: false,
            },
            Err(err) => MkdirOutcome {
                created: false,
                target_exists: err.kind() == io::ErrorKind::AlreadyExists || path.exists(),
            },
        }
    }

    fn rename(&self, src: &[u8], dst: &[u8], replace: bool) -> RenameOutcome {
        let (Ok(src), Ok(dst)) = (native_to_path(src), native_to_path(dst)) else {
            return RenameOutcome::default();
        };
        // std::fs::rename replaces an existing destination, so a
        // no-replace rename has to probe first.
        let target_exists = dst.symlink_metadata().is_ok();
        if !replace && target_exists {
            return RenameOutcome {
                renamed: false,
                target_exists: true,
                transient: false,
            };
        }
        match fs::rename(&src, &dst) {
            Ok(()) => RenameOutcome {
                renamed: true,
                target_exists,
                transient: false,
            },
            Err(err) => RenameOutcome {
                renamed: false,
                target_exists,
                transient: OpenError::from_io(err).retry,
            },
        }
    }

    fn volume_fingerprint(&self, path: &[u8]) -> u64 {
        native_to_path(path)
            .ok()
            .and_then(|p| fs::metadata(p).ok())
            .map(|m| device_id(&m))
            .unwrap_or(0)
    }

    fn fingerprint(&self, path: &[u8]) -> Result<Vec<u8>, OpenError> {
        let path = native_to_path(path)
            .map_err(|_| OpenError::from_io(io::Error::from(io::ErrorKind::InvalidInput)))?;
        let mut file = fs::File::open(&path).map_err(OpenError::from_io)?;
        let mut ctx = md5::Context::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let read = file.read(&mut buf).map_err(OpenError::from_io)?;
            if read == 0 {
                break;
            }
            ctx.consume(&buf[..read]);
        }
        Ok(ctx.compute().0.to_vec())
    }
}
