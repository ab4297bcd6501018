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

//! Atomic storage for the `.jj` metadata directory.
//!
//! Keys are `/`-separated paths relative to the metadata root
//! (`graph.json`, `oplog.jsonl`, `workspaces/default/working-copy.json`).
//! Writes are atomic (write-temp + fsync + rename); appends are
//! line-oriented and assume a single writer, which the repository lock
//! guarantees.

use std::any::Any;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use clru::CLruCache;
use thiserror::Error;

use crate::error::{ClassifiedError, ErrorKind};
use crate::file_util::write_atomic;
use crate::lock::{FileLock, FileLockError};

const PARSED_CACHE_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on \"{key}\"")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Lock(#[from] FileLockError),
    #[error("Corrupt metadata in \"{key}\": {message}")]
    Corrupt { key: String, message: String },
}

impl ClassifiedError for StorageError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::StorageError
    }

    fn context(&self) -> Option<String> {
        match self {
            StorageError::Io { key, .. } | StorageError::Corrupt { key, .. } => Some(key.clone()),
            StorageError::Lock(err) => Some(err.path.display().to_string()),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Owns the metadata directory. One instance per repository handle; every
/// mutation happens under [`StorageManager::lock`].
pub struct StorageManager {
    root: PathBuf,
    parsed_cache: Mutex<CLruCache<String, Arc<dyn Any + Send + Sync>>>,
}

impl std::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageManager")
            .field("root", &self.root)
            .finish()
    }
}

impl StorageManager {
    pub fn init(root: PathBuf) -> StorageResult<Self> {
        fs::create_dir_all(&root).map_err(|source| StorageError::Io {
            key: String::new(),
            source,
        })?;
        Ok(Self::load(root))
    }

    pub fn load(root: PathBuf) -> Self {
        StorageManager {
            root,
            parsed_cache: Mutex::new(CLruCache::new(
                NonZeroUsize::new(PARSED_CACHE_SIZE).unwrap(),
            )),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn io_err(key: &str, source: io::Error) -> StorageError {
        StorageError::Io {
            key: key.to_owned(),
            source,
        }
    }

    /// Takes the repository-wide advisory lock. Held for the duration of one
    /// operation; readers clone their snapshot before mutations start.
    pub fn lock(&self) -> StorageResult<FileLock> {
        Ok(FileLock::lock(self.root.join("lock"))?)
    }

    pub fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        match fs::read(self.key_path(key)) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Self::io_err(key, err)),
        }
    }

    pub fn put(&self, key: &str, contents: &[u8]) -> StorageResult<()> {
        let path = self.key_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| Self::io_err(key, err))?;
        }
        write_atomic(&path, contents).map_err(|err| Self::io_err(key, err))?;
        self.invalidate(key);
        Ok(())
    }

    /// Appends one line-oriented record. The record must not contain a
    /// newline; the trailing `\n` is added here.
    pub fn append(&self, key: &str, record: &[u8]) -> StorageResult<()> {
        debug_assert!(!record.contains(&b'\n'));
        let path = self.key_path(key);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| Self::io_err(key, err))?;
        file.write_all(record).map_err(|err| Self::io_err(key, err))?;
        file.write_all(b"\n").map_err(|err| Self::io_err(key, err))?;
        file.sync_all().map_err(|err| Self::io_err(key, err))?;
        self.invalidate(key);
        Ok(())
    }

    pub fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let dir = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.root.join(prefix)
        };
        let mut keys = vec![];
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(keys),
            Err(err) => return Err(Self::io_err(prefix, err)),
        };
        for entry in entries {
            let entry = entry.map_err(|err| Self::io_err(prefix, err))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == "lock" {
                continue;
            }
            if prefix.is_empty() {
                keys.push(name);
            } else {
                keys.push(format!("{prefix}/{name}"));
            }
        }
        keys.sort();
        Ok(keys)
    }

    pub fn delete(&self, key: &str) -> StorageResult<()> {
        match fs::remove_file(self.key_path(key)) {
            Ok(()) => {
                self.invalidate(key);
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Self::io_err(key, err)),
        }
    }

    /// Returns the cached parsed artifact for `key`, or parses it from the
    /// raw bytes. The cache entry is dropped whenever the key is written.
    pub fn get_parsed<T, F>(&self, key: &str, parse: F) -> StorageResult<Option<Arc<T>>>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&[u8]) -> StorageResult<T>,
    {
        {
            let mut cache = self.parsed_cache.lock().unwrap();
            if let Some(cached) = cache.get(&key.to_owned()) {
                if let Ok(typed) = Arc::downcast::<T>(cached.clone()) {
                    return Ok(Some(typed));
                }
            }
        }
        let Some(data) = self.get(key)? else {
            return Ok(None);
        };
        let parsed = Arc::new(parse(&data)?);
        let mut cache = self.parsed_cache.lock().unwrap();
        cache
            .put(key.to_owned(), parsed.clone() as Arc<dyn Any + Send + Sync>);
        Ok(Some(parsed))
    }

    fn invalidate(&self, key: &str) {
        let mut cache = self.parsed_cache.lock().unwrap();
        cache.pop(&key.to_owned());
    }
}
