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

//! Bookmarks: named pointers into the change graph, the analogue of Git
//! branches. A `(name, remote)` pair is unique; `remote == None` is the
//! local bookmark.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::ChangeId;
use crate::error::{ClassifiedError, ErrorKind};

const FORBIDDEN_NAME_CHARS: &[char] = &['@', ':', '~', '^', '?', '*'];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RefsError {
    #[error("Invalid bookmark name \"{name}\"")]
    InvalidName { name: String },
    #[error("Bookmark \"{name}\" already exists")]
    AlreadyExists { name: String },
    #[error("Bookmark \"{name}\" doesn't exist")]
    NotFound { name: String },
}

impl ClassifiedError for RefsError {
    fn kind(&self) -> ErrorKind {
        match self {
            RefsError::InvalidName { .. } => ErrorKind::ValidationError,
            RefsError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            RefsError::NotFound { .. } => ErrorKind::NotFound,
        }
    }

    fn context(&self) -> Option<String> {
        match self {
            RefsError::InvalidName { name }
            | RefsError::AlreadyExists { name }
            | RefsError::NotFound { name } => Some(name.clone()),
        }
    }

    fn suggestion(&self) -> Option<String> {
        match self {
            RefsError::InvalidName { .. } => Some(
                "Bookmark names are ASCII without whitespace or any of `@ : ~ ^ ? *`".to_owned(),
            ),
            _ => None,
        }
    }
}

pub fn validate_bookmark_name(name: &str) -> Result<(), RefsError> {
    let valid = !name.is_empty()
        && name.chars().all(|c| {
            c.is_ascii() && !c.is_ascii_whitespace() && !c.is_ascii_control()
                && !FORBIDDEN_NAME_CHARS.contains(&c)
        });
    if valid {
        Ok(())
    } else {
        Err(RefsError::InvalidName {
            name: name.to_owned(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub name: String,
    pub target: ChangeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    #[serde(default)]
    pub tracked: bool,
}

impl Bookmark {
    pub fn local(name: impl Into<String>, target: ChangeId) -> Self {
        Bookmark {
            name: name.into(),
            target,
            remote: None,
            tracked: false,
        }
    }

    pub fn is_local(&self) -> bool {
        self.remote.is_none()
    }
}

/// All bookmarks of a repository, local and remote, as persisted in
/// `bookmarks.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkSet {
    pub bookmarks: Vec<Bookmark>,
}

impl BookmarkSet {
    pub fn get(&self, name: &str, remote: Option<&str>) -> Option<&Bookmark> {
        self.bookmarks
            .iter()
            .find(|b| b.name == name && b.remote.as_deref() == remote)
    }

    pub fn local_bookmarks(&self) -> impl Iterator<Item = &Bookmark> {
        self.bookmarks.iter().filter(|b| b.is_local())
    }

    pub fn remote_bookmarks(&self) -> impl Iterator<Item = &Bookmark> {
        self.bookmarks.iter().filter(|b| !b.is_local())
    }

    /// Inserts or replaces the bookmark with the same `(name, remote)`.
    /// The set stays sorted by `(name, remote)` so serialization is
    /// position-independent.
    pub fn upsert(&mut self, bookmark: Bookmark) {
        match self
            .bookmarks
            .iter_mut()
            .find(|b| b.name == bookmark.name && b.remote == bookmark.remote)
        {
            Some(existing) => *existing = bookmark,
            None => self.bookmarks.push(bookmark),
        }
        self.bookmarks
            .sort_by(|a, b| (&a.name, &a.remote).cmp(&(&b.name, &b.remote)));
    }

    pub fn remove(&mut self, name: &str, remote: Option<&str>) -> Option<Bookmark> {
        let index = self
            .bookmarks
            .iter()
            .position(|b| b.name == name && b.remote.as_deref() == remote)?;
        Some(self.bookmarks.remove(index))
    }

    /// Bookmarks pointing at `target`, local first.
    pub fn bookmarks_for_target(&self, target: &ChangeId) -> Vec<&Bookmark> {
        let (local, remote): (Vec<_>, Vec<_>) = self
            .bookmarks
            .iter()
            .filter(|b| b.target == *target)
            .partition(|b| b.is_local());
        local.into_iter().chain(remote).collect()
    }
}
