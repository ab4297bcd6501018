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

//! The Git backend bridge: projecting changes into Git commits, and
//! synchronizing refs with bookmarks in both directions.
//!
//! The change id travels in a `Change-Id:` trailer (last line of the
//! message, blank-line separated) and in a `refs/jj/change/<short>` ref for
//! reverse lookup. Rewritten changes get new commits; old commits stay
//! reachable through the evolution list but no user-visible ref.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{instrument, warn};

use crate::backend::{
    BackendError, ChangeId, CommitId, GitCommit, GitStore, MillisSinceEpoch, Timestamp,
};
use crate::dag_walk;
use crate::error::{ClassifiedError, ErrorKind};
use crate::graph::{Change, ChangeGraph, GraphError};
use crate::object_id::ObjectId as _;
use crate::op_store::View;
use crate::refs::Bookmark;
use crate::settings::UserSettings;

pub const CHANGE_ID_TRAILER: &str = "Change-Id";

#[derive(Debug, Error)]
pub enum GitBridgeError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl ClassifiedError for GitBridgeError {
    fn kind(&self) -> ErrorKind {
        match self {
            GitBridgeError::Backend(err) => err.kind(),
            GitBridgeError::Graph(err) => err.kind(),
        }
    }
}

pub type GitBridgeResult<T> = Result<T, GitBridgeError>;

/// `refs/jj/change/<change_id[0:12]>`
pub fn change_ref_name(id: &ChangeId) -> String {
    format!("refs/jj/change/{}", &id.hex()[..12])
}

/// Appends the trailer as the last line, separated by a blank line.
pub fn format_commit_message(description: &str, change_id: &ChangeId) -> String {
    let body = description.trim_end_matches('\n');
    if body.is_empty() {
        format!("{CHANGE_ID_TRAILER}: {}\n", change_id.hex())
    } else {
        format!("{body}\n\n{CHANGE_ID_TRAILER}: {}\n", change_id.hex())
    }
}

/// Splits a commit message into the description and the trailer's change
/// id, if any.
pub fn parse_commit_message(message: &str) -> (String, Option<ChangeId>) {
    let trimmed = message.trim_end_matches('\n');
    let Some((body, last_line)) = trimmed.rsplit_once('\n') else {
        // Single-line message: it is either just a trailer or just a
        // description.
        return match parse_trailer_line(trimmed) {
            Some(id) => (String::new(), Some(id)),
            None => (trimmed.to_owned(), None),
        };
    };
    match parse_trailer_line(last_line) {
        Some(id) => (body.trim_end_matches('\n').to_owned(), Some(id)),
        None => (trimmed.to_owned(), None),
    }
}

fn parse_trailer_line(line: &str) -> Option<ChangeId> {
    let hex = line.strip_prefix(CHANGE_ID_TRAILER)?.strip_prefix(": ")?;
    if hex.len() != 64 {
        return None;
    }
    ChangeId::try_from_hex(hex).ok()
}

/// Materializes one change as a Git commit and records the new commit id
/// (appending the old one to the evolution). Changes with an empty tree are
/// skipped. Parents must already be projected.
pub fn project_change(
    graph: &mut ChangeGraph,
    git: &dyn GitStore,
    id: &ChangeId,
) -> GitBridgeResult<Option<CommitId>> {
    let mut change = graph.get(id)?.clone();
    if change.tree.is_empty() {
        return Ok(None);
    }
    // A rewrite always produces a distinct commit: refresh the committer
    // timestamp, keeping it strictly after the one it replaces.
    if !change.commit_id.as_bytes().is_empty() {
        let mut stamp = Timestamp::now();
        if stamp.timestamp.0 <= change.committer.timestamp.timestamp.0 {
            stamp = Timestamp {
                timestamp: MillisSinceEpoch(change.committer.timestamp.timestamp.0 + 1),
                tz_offset: change.committer.timestamp.tz_offset,
            };
        }
        change.committer.timestamp = stamp;
        graph.apply_patch(
            id,
            crate::graph::ChangePatch {
                committer: Some(change.committer.clone()),
                ..Default::default()
            },
        )?;
    }
    let tree_id = git.write_tree(&change.tree)?;
    let parents: Vec<CommitId> = change
        .parents
        .iter()
        .map(|parent| graph.get(parent).map(|c| c.commit_id.clone()))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|commit_id| !commit_id.as_bytes().is_empty())
        .collect();
    let commit = GitCommit {
        parents,
        tree: tree_id,
        author: change.author.clone(),
        committer: change.committer.clone(),
        message: format_commit_message(&change.description, id),
    };
    let commit_id = git.write_commit(&commit)?;
    git.update_ref(&change_ref_name(id), &commit_id)?;
    graph.record_commit(id, commit_id.clone())?;
    Ok(Some(commit_id))
}

/// Projects a set of changes in topological order (parents first).
pub fn project_changes(
    graph: &mut ChangeGraph,
    git: &dyn GitStore,
    ids: &[ChangeId],
) -> GitBridgeResult<()> {
    let order = dag_walk::topo_order_forward(
        ids.to_vec(),
        |id| id.clone(),
        |id| {
            graph
                .get(id)
                .map(|change| {
                    change
                        .parents
                        .iter()
                        .filter(|parent| ids.contains(parent))
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        },
    );
    for id in order {
        project_change(graph, git, &id)?;
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct GitImportStats {
    pub created: Vec<ChangeId>,
    /// Commits whose trailer collided with an existing change and were
    /// imported under a fresh id.
    pub warnings: Vec<String>,
    pub updated_bookmarks: Vec<String>,
}

/// Scans `refs/heads/*`, `refs/remotes/*/*`, and `refs/tags/*`, creating
/// changes for unknown commits and synchronizing bookmarks 1:1 with the
/// refs.
#[instrument(skip_all)]
pub fn import(
    view: &mut View,
    git: &dyn GitStore,
    settings: &UserSettings,
) -> GitBridgeResult<GitImportStats> {
    let mut stats = GitImportStats::default();

    let local_refs = git.list_refs("refs/heads/")?;
    let remote_refs = git.list_refs("refs/remotes/")?;
    let tag_refs = git.list_refs("refs/tags/")?;

    // Reverse index: commit id -> change id, including historic commits.
    let mut commit_to_change: HashMap<CommitId, ChangeId> = HashMap::new();
    for change in view.graph.iter() {
        if !change.commit_id.as_bytes().is_empty() {
            commit_to_change.insert(change.commit_id.clone(), change.change_id.clone());
        }
        for old_commit in &change.evolution {
            commit_to_change.insert(old_commit.clone(), change.change_id.clone());
        }
    }

    let mut heads: Vec<CommitId> = local_refs
        .iter()
        .chain(remote_refs.iter())
        .chain(tag_refs.iter())
        .map(|(_, commit_id)| commit_id.clone())
        .collect();
    heads.sort();
    heads.dedup();
    let unknown_heads: Vec<CommitId> = heads
        .iter()
        .filter(|commit_id| !commit_to_change.contains_key(commit_id))
        .cloned()
        .collect();

    // Read every unknown commit reachable from the ref heads, parents
    // before children so change parents resolve during creation.
    let mut commits: HashMap<CommitId, GitCommit> = HashMap::new();
    for commit_id in dag_walk::dfs(
        unknown_heads.clone(),
        |commit_id: &CommitId| commit_id.clone(),
        |commit_id| {
            let commit = git.read_commit(commit_id).ok();
            commit
                .map(|c| {
                    c.parents
                        .iter()
                        .filter(|parent| !commit_to_change.contains_key(parent))
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        },
    ) {
        let commit = git.read_commit(&commit_id)?;
        commits.insert(commit_id, commit);
    }
    let import_order = dag_walk::topo_order_forward(
        unknown_heads,
        |commit_id: &CommitId| commit_id.clone(),
        |commit_id| {
            commits
                .get(commit_id)
                .map(|c| {
                    c.parents
                        .iter()
                        .filter(|parent| commits.contains_key(*parent))
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        },
    );

    for commit_id in import_order {
        let commit = &commits[&commit_id];
        let (description, trailer_id) = parse_commit_message(&commit.message);
        let change_id = match trailer_id {
            Some(id) if !view.graph.has(&id) => id,
            Some(id) => {
                // The trailer names a change we already track under a
                // different commit lineage; keep ids unique.
                let fresh = settings.new_change_id();
                let message =
                    format!("commit {} reuses change id {}", commit_id.hex(), id.hex());
                warn!("{message}");
                stats.warnings.push(message);
                fresh
            }
            None => settings.new_change_id(),
        };
        let parents: Vec<ChangeId> = if commit.parents.is_empty() {
            vec![ChangeGraph::root_change_id()]
        } else {
            commit
                .parents
                .iter()
                .filter_map(|parent| commit_to_change.get(parent).cloned())
                .collect()
        };
        let tree = git.read_tree(&commit.tree)?;
        let empty = parents.len() == 1
            && view
                .graph
                .get(&parents[0])
                .map(|parent| parent.tree == tree)
                .unwrap_or(false);
        let change = Change {
            change_id: change_id.clone(),
            commit_id: commit_id.clone(),
            parents,
            description,
            author: commit.author.clone(),
            committer: commit.committer.clone(),
            tree,
            evolution: vec![],
            abandoned: false,
            empty,
            has_conflict: false,
        };
        // Imported commits keep their timestamps; the ancestor-timestamp
        // invariant is not enforced on import.
        view.graph.add_change(change)?;
        git.update_ref(&change_ref_name(&change_id), &commit_id)?;
        commit_to_change.insert(commit_id, change_id.clone());
        stats.created.push(change_id);
    }

    // Local bookmarks follow refs/heads 1:1.
    let mut seen_local: Vec<String> = vec![];
    for (ref_name, commit_id) in &local_refs {
        let name = ref_name.strip_prefix("refs/heads/").unwrap_or(ref_name);
        let Some(target) = commit_to_change.get(commit_id) else {
            continue;
        };
        let tracked = view
            .bookmarks
            .get(name, None)
            .map(|b| b.tracked)
            .unwrap_or(false);
        view.bookmarks.upsert(Bookmark {
            name: name.to_owned(),
            target: target.clone(),
            remote: None,
            tracked,
        });
        seen_local.push(name.to_owned());
        stats.updated_bookmarks.push(name.to_owned());
    }
    let stale_local: Vec<String> = view
        .bookmarks
        .local_bookmarks()
        .map(|b| b.name.clone())
        .filter(|name| !seen_local.contains(name))
        .collect();
    for name in stale_local {
        view.bookmarks.remove(&name, None);
    }

    // Remote-tracking bookmarks follow refs/remotes.
    for (ref_name, commit_id) in &remote_refs {
        let rest = ref_name.strip_prefix("refs/remotes/").unwrap_or(ref_name);
        let Some((remote, name)) = rest.split_once('/') else {
            continue;
        };
        let Some(target) = commit_to_change.get(commit_id) else {
            continue;
        };
        view.bookmarks.upsert(Bookmark {
            name: name.to_owned(),
            target: target.clone(),
            remote: Some(remote.to_owned()),
            tracked: true,
        });
    }

    for (ref_name, commit_id) in &tag_refs {
        let name = ref_name.strip_prefix("refs/tags/").unwrap_or(ref_name);
        if let Some(target) = commit_to_change.get(commit_id) {
            view.graph.set_tag(name.to_owned(), target.clone());
        }
    }

    Ok(stats)
}

#[derive(Debug, Default)]
pub struct GitExportStats {
    pub exported: Vec<String>,
    pub removed: Vec<String>,
}

/// Writes `refs/heads/<bookmark>` for every local bookmark and removes
/// refs whose bookmark is gone.
#[instrument(skip_all)]
pub fn export(view: &View, git: &dyn GitStore) -> GitBridgeResult<GitExportStats> {
    let mut stats = GitExportStats::default();
    for bookmark in view.bookmarks.local_bookmarks() {
        let change = view.graph.get(&bookmark.target)?;
        if change.commit_id.as_bytes().is_empty() {
            // Not projected (empty tree); nothing for Git to point at.
            continue;
        }
        git.update_ref(
            &format!("refs/heads/{}", bookmark.name),
            &change.commit_id,
        )?;
        stats.exported.push(bookmark.name.clone());
    }
    for (ref_name, _) in git.list_refs("refs/heads/")? {
        let name = ref_name.strip_prefix("refs/heads/").unwrap_or(&ref_name);
        if view.bookmarks.get(name, None).is_none() {
            git.delete_ref(&ref_name)?;
            stats.removed.push(name.to_owned());
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change_id(byte: u8) -> ChangeId {
        ChangeId::from_bytes(&[byte; 32])
    }

    #[test]
    fn test_message_trailer_round_trip() {
        let id = change_id(7);
        let message = format_commit_message("Fix the frobnicator\n\nLong body.", &id);
        assert!(message.ends_with(&format!("\n\nChange-Id: {}\n", id.hex())));
        let (description, parsed) = parse_commit_message(&message);
        assert_eq!(description, "Fix the frobnicator\n\nLong body.");
        assert_eq!(parsed, Some(id));
    }

    #[test]
    fn test_empty_description_message() {
        let id = change_id(9);
        let message = format_commit_message("", &id);
        let (description, parsed) = parse_commit_message(&message);
        assert_eq!(description, "");
        assert_eq!(parsed, Some(id));
    }

    #[test]
    fn test_message_without_trailer() {
        let (description, parsed) = parse_commit_message("Just a plain commit\n");
        assert_eq!(description, "Just a plain commit");
        assert_eq!(parsed, None);
        // A malformed trailer is part of the description.
        let (description, parsed) = parse_commit_message("subject\n\nChange-Id: tooshort\n");
        assert!(description.contains("Change-Id"));
        assert_eq!(parsed, None);
    }

    #[test]
    fn test_change_ref_name_uses_short_id() {
        let id = change_id(0xab);
        assert_eq!(change_ref_name(&id), "refs/jj/change/abababababab");
    }
}
