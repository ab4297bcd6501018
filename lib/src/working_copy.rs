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

//! The working copy: the change currently materialized in the filesystem.
//! There is no staging area; dirty state is folded into the current change
//! by [`WorkingCopy::snapshot`], detected per path by size, then mtime,
//! then content hash.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use blake2::{Blake2b512, Digest as _};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use crate::backend::{BackendError, ChangeId, GitStore, Tree, TreeEntry};
use crate::error::{ClassifiedError, ErrorKind};
use crate::fs::{Fs, FsError};

#[derive(Debug, Error)]
pub enum WorkingCopyError {
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("\"{path}\" is not a tracked file")]
    NotTracked { path: String },
}

impl ClassifiedError for WorkingCopyError {
    fn kind(&self) -> ErrorKind {
        match self {
            WorkingCopyError::Fs(err) => err.kind(),
            WorkingCopyError::Backend(err) => err.kind(),
            WorkingCopyError::NotTracked { .. } => ErrorKind::NotFound,
        }
    }

    fn context(&self) -> Option<String> {
        match self {
            WorkingCopyError::NotTracked { path } => Some(path.clone()),
            WorkingCopyError::Fs(err) => err.context(),
            WorkingCopyError::Backend(_) => None,
        }
    }
}

pub type WorkingCopyResult<T> = Result<T, WorkingCopyError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub size: u64,
    pub mtime: i64,
    pub hash: String,
}

/// Persisted as `working-copy.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingCopyState {
    pub current: ChangeId,
    pub tracked: IndexMap<String, FileState>,
}

fn hash_content(content: &[u8]) -> String {
    hex::encode(Blake2b512::digest(content))
}

/// What a filesystem walk found: the tree it describes and the matching
/// tracked index.
#[derive(Debug, Clone)]
pub struct SnapshotOutcome {
    pub tree: Tree,
    pub tracked: IndexMap<String, FileState>,
}

#[derive(Debug)]
pub struct WorkingCopy {
    fs: Arc<dyn Fs>,
    root: PathBuf,
    state: WorkingCopyState,
}

impl WorkingCopy {
    pub fn new(fs: Arc<dyn Fs>, root: PathBuf, state: WorkingCopyState) -> Self {
        WorkingCopy { fs, root, state }
    }

    pub fn state(&self) -> &WorkingCopyState {
        &self.state
    }

    pub fn set_state(&mut self, state: WorkingCopyState) {
        self.state = state;
    }

    pub fn current_change_id(&self) -> &ChangeId {
        &self.state.current
    }

    pub fn set_current(&mut self, id: ChangeId) {
        self.state.current = id;
    }

    fn fs_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn walk_files(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) -> WorkingCopyResult<()> {
        for name in self.fs.read_dir(dir)? {
            if prefix.is_empty() && (name == ".git" || name == ".jj") {
                continue;
            }
            let rel = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            let full = dir.join(&name);
            let metadata = self.fs.stat(&full)?;
            if metadata.is_dir {
                self.walk_files(&full, &rel, out)?;
            } else {
                out.push(rel);
            }
        }
        Ok(())
    }

    /// Walks the filesystem and returns the tree it currently describes,
    /// plus the refreshed tracked index. `base_tree` is the current
    /// change's tree; unchanged paths reuse its blobs so clean snapshots
    /// write nothing. The working-copy state itself is untouched, so a
    /// failed operation rolls back for free; apply the outcome with
    /// [`Self::apply_snapshot`] (or let a later materialize rebuild it).
    #[instrument(skip_all)]
    pub fn snapshot(
        &self,
        git: &dyn GitStore,
        base_tree: &Tree,
    ) -> WorkingCopyResult<SnapshotOutcome> {
        let mut paths = vec![];
        self.walk_files(&self.root, "", &mut paths)?;
        let mut new_tree = Tree::default();
        let mut new_tracked = IndexMap::new();
        for path in paths {
            let metadata = self.fs.stat(&self.fs_path(&path))?;
            let executable = metadata.mode & 0o111 != 0;
            let clean = self
                .state
                .tracked
                .get(&path)
                .is_some_and(|old| old.size == metadata.size && old.mtime == metadata.mtime);
            if clean {
                if let Some(entry) = base_tree.get(&path) {
                    let state = self.state.tracked[&path].clone();
                    new_tree.set(path.clone(), entry.clone());
                    new_tracked.insert(path, state);
                    continue;
                }
            }
            let content = self.fs.read(&self.fs_path(&path))?;
            let hash = hash_content(&content);
            let entry = match base_tree.get(&path) {
                // Touched but identical content: keep the old blob.
                Some(entry)
                    if self.state.tracked.get(&path).map(|s| s.hash.as_str())
                        == Some(hash.as_str()) =>
                {
                    TreeEntry {
                        id: entry.id.clone(),
                        executable,
                    }
                }
                _ => {
                    let id = git.write_blob(&content)?;
                    TreeEntry { id, executable }
                }
            };
            new_tree.set(path.clone(), entry);
            new_tracked.insert(
                path,
                FileState {
                    size: metadata.size,
                    mtime: metadata.mtime,
                    hash,
                },
            );
        }
        Ok(SnapshotOutcome {
            tree: new_tree,
            tracked: new_tracked,
        })
    }

    pub fn apply_snapshot(&mut self, outcome: SnapshotOutcome) {
        self.state.tracked = outcome.tracked;
    }

    /// Writes `tree` out to the filesystem and rebuilds the tracked index.
    /// Tracked paths absent from `tree` are deleted.
    #[instrument(skip_all)]
    pub fn materialize(&mut self, git: &dyn GitStore, tree: &Tree) -> WorkingCopyResult<()> {
        let stale: Vec<String> = self
            .state
            .tracked
            .keys()
            .filter(|path| tree.get(path).is_none())
            .cloned()
            .collect();
        for path in stale {
            match self.fs.remove(&self.fs_path(&path)) {
                Ok(()) | Err(FsError::NotFound { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        let mut new_tracked = IndexMap::new();
        for (path, entry) in tree.entries() {
            let content = git.read_blob(&entry.id)?;
            let hash = hash_content(&content);
            let full = self.fs_path(path);
            // Skip paths whose on-disk content already matches; this keeps
            // mtimes stable across snapshot-then-materialize round trips.
            // The stat must still match the index, or the disk has drifted
            // and needs the write.
            if let Some(old) = self.state.tracked.get(path) {
                if old.hash == hash && old.size == content.len() as u64 {
                    if let Ok(metadata) = self.fs.stat(&full) {
                        if metadata.size == old.size && metadata.mtime == old.mtime {
                            new_tracked.insert(path.clone(), old.clone());
                            continue;
                        }
                    }
                }
            }
            if let Some(parent) = full.parent() {
                self.fs.mkdir_all(parent)?;
            }
            self.fs.write(&full, &content)?;
            if entry.executable {
                self.fs.chmod(&full, 0o755)?;
            }
            let metadata = self.fs.stat(&full)?;
            new_tracked.insert(
                path.clone(),
                FileState {
                    size: metadata.size,
                    mtime: metadata.mtime,
                    hash,
                },
            );
        }
        self.state.tracked = new_tracked;
        Ok(())
    }

    /// True if any tracked path differs from the index by size or mtime, or
    /// if an untracked file appeared.
    pub fn is_dirty(&self) -> WorkingCopyResult<bool> {
        let mut paths = vec![];
        self.walk_files(&self.root, "", &mut paths)?;
        if paths.len() != self.state.tracked.len() {
            return Ok(true);
        }
        for path in paths {
            let Some(old) = self.state.tracked.get(&path) else {
                return Ok(true);
            };
            let metadata = self.fs.stat(&self.fs_path(&path))?;
            if old.size != metadata.size || old.mtime != metadata.mtime {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn write_file(&self, path: &str, content: &[u8]) -> WorkingCopyResult<()> {
        let full = self.fs_path(path);
        if let Some(parent) = full.parent() {
            self.fs.mkdir_all(parent)?;
        }
        self.fs.write(&full, content)?;
        Ok(())
    }

    pub fn read_file(&self, path: &str) -> WorkingCopyResult<Vec<u8>> {
        Ok(self.fs.read(&self.fs_path(path))?)
    }

    pub fn move_file(&mut self, from: &str, to: &str) -> WorkingCopyResult<()> {
        let to_full = self.fs_path(to);
        if let Some(parent) = to_full.parent() {
            self.fs.mkdir_all(parent)?;
        }
        self.fs.rename(&self.fs_path(from), &to_full)?;
        if let Some(state) = self.state.tracked.shift_remove(from) {
            self.state.tracked.insert(to.to_owned(), state);
        }
        Ok(())
    }

    pub fn remove_file(&mut self, path: &str) -> WorkingCopyResult<()> {
        if self.state.tracked.shift_remove(path).is_none() {
            return Err(WorkingCopyError::NotTracked {
                path: path.to_owned(),
            });
        }
        self.fs.remove(&self.fs_path(path))?;
        Ok(())
    }
}
