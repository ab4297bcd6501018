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

#![allow(missing_docs)]

use std::fmt::Debug;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{ClassifiedError, ErrorKind};
use crate::object_id::id_type;

id_type!(pub ChangeId);
id_type!(pub CommitId);
id_type!(pub TreeId);
id_type!(pub FileId);
id_type!(pub ConflictId);
id_type!(pub OperationId);

#[derive(Debug, PartialEq, Eq, Clone, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MillisSinceEpoch(pub i64);

#[derive(Debug, PartialEq, Eq, Clone, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub timestamp: MillisSinceEpoch,
    // time zone offset in minutes
    pub tz_offset: i32,
}

impl Timestamp {
    pub fn now() -> Self {
        Self::from_datetime(chrono::offset::Local::now())
    }

    pub fn from_datetime<Tz: chrono::TimeZone<Offset = chrono::offset::FixedOffset>>(
        datetime: chrono::DateTime<Tz>,
    ) -> Self {
        Self {
            timestamp: MillisSinceEpoch(datetime.timestamp_millis()),
            tz_offset: datetime.offset().local_minus_utc() / 60,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    pub email: String,
    pub timestamp: Timestamp,
}

/// A single entry of a change's tree: the blob holding the content plus the
/// executable bit.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct TreeEntry {
    pub id: FileId,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub executable: bool,
}

impl TreeEntry {
    pub fn normal(id: FileId) -> Self {
        TreeEntry {
            id,
            executable: false,
        }
    }
}

/// The snapshot of tracked paths belonging to one change. Paths are
/// repo-relative, `/`-separated, in insertion order; contents live in the
/// Git object store as blobs.
#[derive(Debug, Default, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tree {
    entries: IndexMap<String, TreeEntry>,
}

impl Tree {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, path: &str) -> Option<&TreeEntry> {
        self.entries.get(path)
    }

    pub fn set(&mut self, path: String, entry: TreeEntry) {
        self.entries.insert(path, entry);
    }

    pub fn remove(&mut self, path: &str) -> Option<TreeEntry> {
        self.entries.shift_remove(path)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &TreeEntry)> {
        self.entries.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Paths whose entry differs between `self` and `other`, in the order
    /// they appear in either tree.
    pub fn diff_paths(&self, other: &Tree) -> Vec<String> {
        let mut paths = vec![];
        for (path, entry) in &self.entries {
            if other.get(path) != Some(entry) {
                paths.push(path.clone());
            }
        }
        for path in other.entries.keys() {
            if !self.entries.contains_key(path) {
                paths.push(path.clone());
            }
        }
        paths
    }
}

impl FromIterator<(String, TreeEntry)> for Tree {
    fn from_iter<I: IntoIterator<Item = (String, TreeEntry)>>(iter: I) -> Self {
        Tree {
            entries: iter.into_iter().collect(),
        }
    }
}

/// A commit as the Git object store sees it. The engine's `Change` projects
/// into one of these; the change id travels in the message trailer.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct GitCommit {
    pub parents: Vec<CommitId>,
    pub tree: TreeId,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Object not found")]
    NotFound,
    #[error("Error: {0}")]
    Other(String),
}

impl ClassifiedError for BackendError {
    fn kind(&self) -> ErrorKind {
        match self {
            BackendError::NotFound => ErrorKind::NotFound,
            BackendError::Other(_) => ErrorKind::StorageError,
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// The consumed Git object-store interface. Implementations wrap a real Git
/// library or an in-memory store for tests; the engine never touches Git
/// internals directly.
pub trait GitStore: Send + Sync + Debug {
    fn init(&self) -> BackendResult<()>;

    fn write_blob(&self, content: &[u8]) -> BackendResult<FileId>;

    fn read_blob(&self, id: &FileId) -> BackendResult<Vec<u8>>;

    fn write_tree(&self, tree: &Tree) -> BackendResult<TreeId>;

    fn read_tree(&self, id: &TreeId) -> BackendResult<Tree>;

    fn write_commit(&self, commit: &GitCommit) -> BackendResult<CommitId>;

    fn read_commit(&self, id: &CommitId) -> BackendResult<GitCommit>;

    fn resolve_ref(&self, name: &str) -> BackendResult<Option<CommitId>>;

    fn update_ref(&self, name: &str, target: &CommitId) -> BackendResult<()>;

    fn delete_ref(&self, name: &str) -> BackendResult<()>;

    /// Refs whose full name starts with `prefix`, as `(name, target)` pairs.
    fn list_refs(&self, prefix: &str) -> BackendResult<Vec<(String, CommitId)>>;

    fn fetch(&self, remote: &str) -> BackendResult<()>;

    fn push(&self, remote: &str, refspecs: &[String]) -> BackendResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_id::ObjectId as _;

    #[test]
    fn test_tree_diff_paths() {
        let blob_a = FileId::try_from_hex("aa").unwrap();
        let blob_b = FileId::try_from_hex("bb").unwrap();
        let mut left = Tree::default();
        left.set("same.txt".to_owned(), TreeEntry::normal(blob_a.clone()));
        left.set("changed.txt".to_owned(), TreeEntry::normal(blob_a.clone()));
        left.set("removed.txt".to_owned(), TreeEntry::normal(blob_a.clone()));
        let mut right = Tree::default();
        right.set("same.txt".to_owned(), TreeEntry::normal(blob_a));
        right.set("changed.txt".to_owned(), TreeEntry::normal(blob_b.clone()));
        right.set("added.txt".to_owned(), TreeEntry::normal(blob_b));
        assert_eq!(
            left.diff_paths(&right),
            vec!["changed.txt", "removed.txt", "added.txt"]
        );
    }

    #[test]
    fn test_tree_serializes_as_map() {
        let mut tree = Tree::default();
        tree.set(
            "a.txt".to_owned(),
            TreeEntry::normal(FileId::try_from_hex("0102").unwrap()),
        );
        let json = serde_json::to_string(&tree).unwrap();
        assert_eq!(json, r#"{"a.txt":{"id":"0102"}}"#);
        let parsed: Tree = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, tree);
    }
}
