// Copyright 2024 The PJJ Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The consumed filesystem interface. The working copy goes through this
//! trait so tests can run against an in-memory filesystem.

use std::fmt::Debug;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use thiserror::Error;

use crate::error::{ClassifiedError, ErrorKind};

#[derive(Debug, Error)]
pub enum FsError {
    #[error("Path not found: {path}")]
    NotFound { path: PathBuf },
    #[error("Symlinks are not supported by this filesystem")]
    SymlinksUnsupported,
    #[error("I/O error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ClassifiedError for FsError {
    fn kind(&self) -> ErrorKind {
        match self {
            FsError::NotFound { .. } => ErrorKind::NotFound,
            FsError::SymlinksUnsupported => ErrorKind::UnsupportedOperation,
            FsError::Io { .. } => ErrorKind::StorageError,
        }
    }

    fn context(&self) -> Option<String> {
        match self {
            FsError::NotFound { path } | FsError::Io { path, .. } => {
                Some(path.display().to_string())
            }
            FsError::SymlinksUnsupported => None,
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub size: u64,
    /// Modification time in integer milliseconds since the epoch.
    pub mtime: i64,
    pub mode: u32,
    pub is_dir: bool,
}

/// Filesystem operations the engine consumes. `rename` within one directory
/// must be atomic; `symlink` is optional.
pub trait Fs: Send + Sync + Debug {
    fn read(&self, path: &Path) -> FsResult<Vec<u8>>;

    fn write(&self, path: &Path, contents: &[u8]) -> FsResult<()>;

    fn rename(&self, from: &Path, to: &Path) -> FsResult<()>;

    fn stat(&self, path: &Path) -> FsResult<FileMetadata>;

    fn read_dir(&self, path: &Path) -> FsResult<Vec<String>>;

    fn remove(&self, path: &Path) -> FsResult<()>;

    fn mkdir_all(&self, path: &Path) -> FsResult<()>;

    fn chmod(&self, path: &Path, mode: u32) -> FsResult<()>;

    fn symlink(&self, _target: &Path, _link: &Path) -> FsResult<()> {
        Err(FsError::SymlinksUnsupported)
    }
}

fn io_error(path: &Path, err: io::Error) -> FsError {
    if err.kind() == io::ErrorKind::NotFound {
        FsError::NotFound {
            path: path.to_owned(),
        }
    } else {
        FsError::Io {
            path: path.to_owned(),
            source: err,
        }
    }
}

/// `Fs` over the host filesystem.
#[derive(Debug, Default)]
pub struct OsFs;

impl Fs for OsFs {
    fn read(&self, path: &Path) -> FsResult<Vec<u8>> {
        fs::read(path).map_err(|err| io_error(path, err))
    }

    fn write(&self, path: &Path, contents: &[u8]) -> FsResult<()> {
        fs::write(path, contents).map_err(|err| io_error(path, err))
    }

    fn rename(&self, from: &Path, to: &Path) -> FsResult<()> {
        fs::rename(from, to).map_err(|err| io_error(from, err))
    }

    fn stat(&self, path: &Path) -> FsResult<FileMetadata> {
        let metadata = fs::symlink_metadata(path).map_err(|err| io_error(path, err))?;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            metadata.permissions().mode()
        };
        #[cfg(not(unix))]
        let mode = if metadata.permissions().readonly() {
            0o444
        } else {
            0o644
        };
        Ok(FileMetadata {
            size: metadata.len(),
            mtime,
            mode,
            is_dir: metadata.is_dir(),
        })
    }

    fn read_dir(&self, path: &Path) -> FsResult<Vec<String>> {
        let mut names = vec![];
        for entry in fs::read_dir(path).map_err(|err| io_error(path, err))? {
            let entry = entry.map_err(|err| io_error(path, err))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn remove(&self, path: &Path) -> FsResult<()> {
        fs::remove_file(path).map_err(|err| io_error(path, err))
    }

    fn mkdir_all(&self, path: &Path) -> FsResult<()> {
        fs::create_dir_all(path).map_err(|err| io_error(path, err))
    }

    fn chmod(&self, path: &Path, mode: u32) -> FsResult<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(mode))
                .map_err(|err| io_error(path, err))
        }
        #[cfg(not(unix))]
        {
            let _ = mode;
            Ok(())
        }
    }

    fn symlink(&self, target: &Path, link: &Path) -> FsResult<()> {
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(target, link).map_err(|err| io_error(link, err))
        }
        #[cfg(not(unix))]
        {
            let _ = target;
            let _ = link;
            Err(FsError::SymlinksUnsupported)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_fs_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let fs = OsFs;
        let path = temp_dir.path().join("file.txt");
        fs.write(&path, b"contents").unwrap();
        assert_eq!(fs.read(&path).unwrap(), b"contents");
        let metadata = fs.stat(&path).unwrap();
        assert_eq!(metadata.size, 8);
        assert!(!metadata.is_dir);
        assert_eq!(fs.read_dir(temp_dir.path()).unwrap(), vec!["file.txt"]);
        fs.remove(&path).unwrap();
        assert!(matches!(fs.read(&path), Err(FsError::NotFound { .. })));
    }
}
