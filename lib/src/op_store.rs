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

//! Operation records: the append-only history of every mutation.
//!
//! Each record carries the user-level parameters of the mutation plus a
//! uniform `effects` block with before/after images of every entity it
//! touched. Undo applies the before images; `restore` replays the after
//! images from the root. Payloads are tagged serde variants keyed on
//! `kind`; the operation id is SHA-256 over
//! `(parents ‖ timestamp ‖ user ‖ kind ‖ canonical(payload))`.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

use crate::backend::{ChangeId, ConflictId, MillisSinceEpoch, OperationId, Signature};
use crate::conflicts::{Conflict, ConflictSet};
use crate::error::{ClassifiedError, ErrorKind};
use crate::graph::{Change, ChangeGraph};
use crate::object_id::ObjectId as _;
use crate::refs::{Bookmark, BookmarkSet};

#[derive(Debug, Error)]
pub enum OpStoreError {
    #[error("Operation {0} doesn't exist")]
    NotFound(String),
    #[error("Corrupt operation record: {0}")]
    Corrupt(String),
}

impl ClassifiedError for OpStoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            OpStoreError::NotFound(_) => ErrorKind::NotFound,
            OpStoreError::Corrupt(_) => ErrorKind::StorageError,
        }
    }

    fn context(&self) -> Option<String> {
        match self {
            OpStoreError::NotFound(id) => Some(id.clone()),
            OpStoreError::Corrupt(_) => None,
        }
    }
}

pub type OpStoreResult<T> = Result<T, OpStoreError>;

/// Represents the way the repo looks at a given time: the change graph,
/// the bookmarks, and the unresolved conflicts. The working-copy pointer
/// lives on the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    pub graph: ChangeGraph,
    pub bookmarks: BookmarkSet,
    pub conflicts: ConflictSet,
}

impl View {
    pub fn empty(root_signature: Signature) -> Self {
        View {
            graph: ChangeGraph::empty(root_signature),
            bookmarks: BookmarkSet::default(),
            conflicts: ConflictSet::default(),
        }
    }

    /// The state before any operation, including init. Replay starts here.
    pub fn bare() -> Self {
        View {
            graph: ChangeGraph::bare(),
            bookmarks: BookmarkSet::default(),
            conflicts: ConflictSet::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDelta {
    pub id: ChangeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Box<Change>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Box<Change>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkDelta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Bookmark>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Bookmark>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagDelta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<ChangeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<ChangeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictDelta {
    pub id: ConflictId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Box<Conflict>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Box<Conflict>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerDelta {
    pub before: ChangeId,
    pub after: ChangeId,
}

/// Before/after images of everything one operation touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoDelta {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<ChangeDelta>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<TagDelta>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bookmarks: Vec<BookmarkDelta>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<ConflictDelta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_copy: Option<PointerDelta>,
}

impl RepoDelta {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
            && self.tags.is_empty()
            && self.bookmarks.is_empty()
            && self.conflicts.is_empty()
            && self.working_copy.is_none()
    }

    /// Diffs two views. Entities are compared whole; an entity appearing in
    /// both sides with equal value produces no delta.
    pub fn between(base: &View, new: &View) -> RepoDelta {
        let mut changes = vec![];
        for change in new.graph.iter() {
            let before = base.graph.get(&change.change_id).ok();
            if before != Some(change) {
                changes.push(ChangeDelta {
                    id: change.change_id.clone(),
                    before: before.cloned().map(Box::new),
                    after: Some(Box::new(change.clone())),
                });
            }
        }
        for change in base.graph.iter() {
            if !new.graph.has(&change.change_id) {
                changes.push(ChangeDelta {
                    id: change.change_id.clone(),
                    before: Some(Box::new(change.clone())),
                    after: None,
                });
            }
        }

        let mut tags = vec![];
        for (name, target) in new.graph.tags() {
            if base.graph.tags().get(name) != Some(target) {
                tags.push(TagDelta {
                    name: name.clone(),
                    before: base.graph.tags().get(name).cloned(),
                    after: Some(target.clone()),
                });
            }
        }
        for (name, target) in base.graph.tags() {
            if !new.graph.tags().contains_key(name) {
                tags.push(TagDelta {
                    name: name.clone(),
                    before: Some(target.clone()),
                    after: None,
                });
            }
        }

        let mut bookmarks = vec![];
        for bookmark in &new.bookmarks.bookmarks {
            let before = base.bookmarks.get(&bookmark.name, bookmark.remote.as_deref());
            if before != Some(bookmark) {
                bookmarks.push(BookmarkDelta {
                    name: bookmark.name.clone(),
                    remote: bookmark.remote.clone(),
                    before: before.cloned(),
                    after: Some(bookmark.clone()),
                });
            }
        }
        for bookmark in &base.bookmarks.bookmarks {
            if new
                .bookmarks
                .get(&bookmark.name, bookmark.remote.as_deref())
                .is_none()
            {
                bookmarks.push(BookmarkDelta {
                    name: bookmark.name.clone(),
                    remote: bookmark.remote.clone(),
                    before: Some(bookmark.clone()),
                    after: None,
                });
            }
        }

        let mut conflicts = vec![];
        for conflict in new.conflicts.conflicts.values() {
            let before = base.conflicts.conflicts.get(&conflict.conflict_id);
            if before != Some(conflict) {
                conflicts.push(ConflictDelta {
                    id: conflict.conflict_id.clone(),
                    before: before.cloned().map(Box::new),
                    after: Some(Box::new(conflict.clone())),
                });
            }
        }
        for conflict in base.conflicts.conflicts.values() {
            if !new.conflicts.conflicts.contains_key(&conflict.conflict_id) {
                conflicts.push(ConflictDelta {
                    id: conflict.conflict_id.clone(),
                    before: Some(Box::new(conflict.clone())),
                    after: None,
                });
            }
        }

        let working_copy = (base.graph.working_copy_id() != new.graph.working_copy_id())
            .then(|| PointerDelta {
                before: base.graph.working_copy_id().clone(),
                after: new.graph.working_copy_id().clone(),
            });

        RepoDelta {
            changes,
            tags,
            bookmarks,
            conflicts,
            working_copy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyDirection {
    Forward,
    Inverse,
}

/// Applies a delta onto a view, in either direction.
pub fn apply_delta(view: &mut View, delta: &RepoDelta, direction: ApplyDirection) {
    let pick_change = |d: &ChangeDelta| match direction {
        ApplyDirection::Forward => d.after.clone(),
        ApplyDirection::Inverse => d.before.clone(),
    };
    for change_delta in &delta.changes {
        match pick_change(change_delta) {
            Some(change) => view.graph.replace_change(*change),
            None => {
                view.graph.remove_change(&change_delta.id);
            }
        }
    }
    for tag_delta in &delta.tags {
        let target = match direction {
            ApplyDirection::Forward => &tag_delta.after,
            ApplyDirection::Inverse => &tag_delta.before,
        };
        match target {
            Some(target) => view.graph.set_tag(tag_delta.name.clone(), target.clone()),
            None => {
                view.graph.remove_tag(&tag_delta.name);
            }
        }
    }
    for bookmark_delta in &delta.bookmarks {
        let bookmark = match direction {
            ApplyDirection::Forward => &bookmark_delta.after,
            ApplyDirection::Inverse => &bookmark_delta.before,
        };
        match bookmark {
            Some(bookmark) => view.bookmarks.upsert(bookmark.clone()),
            None => {
                view.bookmarks
                    .remove(&bookmark_delta.name, bookmark_delta.remote.as_deref());
            }
        }
    }
    for conflict_delta in &delta.conflicts {
        let conflict = match direction {
            ApplyDirection::Forward => &conflict_delta.after,
            ApplyDirection::Inverse => &conflict_delta.before,
        };
        match conflict {
            Some(conflict) => view.conflicts.insert((**conflict).clone()),
            None => {
                view.conflicts.remove(&conflict_delta.id);
            }
        }
    }
    if let Some(pointer) = &delta.working_copy {
        let target = match direction {
            ApplyDirection::Forward => &pointer.after,
            ApplyDirection::Inverse => &pointer.before,
        };
        // The target change was put in place by the change deltas above.
        view.graph.force_working_copy(target.clone());
    }
}

/// The flags an abandon records so undo can put them back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFlags {
    pub abandoned: bool,
    pub empty: bool,
    pub has_conflict: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum OperationPayload {
    Init {
        user: String,
        effects: RepoDelta,
    },
    Snapshot {
        change_id: ChangeId,
        effects: RepoDelta,
    },
    New {
        change_id: ChangeId,
        parents: Vec<ChangeId>,
        effects: RepoDelta,
    },
    Describe {
        change_id: ChangeId,
        description: String,
        prev_description: String,
        effects: RepoDelta,
    },
    Rewrite {
        change_id: ChangeId,
        effects: RepoDelta,
    },
    Rebase {
        change_id: ChangeId,
        new_parents: Vec<ChangeId>,
        prev_parents: Vec<ChangeId>,
        effects: RepoDelta,
    },
    Abandon {
        change_id: ChangeId,
        prev_flags: ChangeFlags,
        effects: RepoDelta,
    },
    Merge {
        change_id: ChangeId,
        sources: Vec<ChangeId>,
        conflicts: Vec<ConflictId>,
        effects: RepoDelta,
    },
    Squash {
        source: ChangeId,
        destination: ChangeId,
        effects: RepoDelta,
    },
    Split {
        change_id: ChangeId,
        new_change_id: ChangeId,
        paths: Vec<String>,
        effects: RepoDelta,
    },
    Duplicate {
        source: ChangeId,
        new_change_id: ChangeId,
        effects: RepoDelta,
    },
    Parallelize {
        change_ids: Vec<ChangeId>,
        effects: RepoDelta,
    },
    RestorePaths {
        change_id: ChangeId,
        from: ChangeId,
        paths: Vec<String>,
        effects: RepoDelta,
    },
    Edit {
        change_id: ChangeId,
        prev_change_id: ChangeId,
        effects: RepoDelta,
    },
    BookmarkSet {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remote: Option<String>,
        target: ChangeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prev_target: Option<ChangeId>,
        effects: RepoDelta,
    },
    BookmarkDelete {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remote: Option<String>,
        prev_target: ChangeId,
        effects: RepoDelta,
    },
    Resolve {
        conflict_ids: Vec<ConflictId>,
        effects: RepoDelta,
    },
    GitImport {
        created: Vec<ChangeId>,
        effects: RepoDelta,
    },
    GitExport {
        exported: Vec<String>,
        effects: RepoDelta,
    },
    Undo {
        count: u32,
        undone: Vec<OperationId>,
        effects: RepoDelta,
    },
    RestoreOp {
        target: OperationId,
        effects: RepoDelta,
    },
    RevertOp {
        target: OperationId,
        effects: RepoDelta,
    },
}

impl OperationPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            OperationPayload::Init { .. } => "init",
            OperationPayload::Snapshot { .. } => "snapshot",
            OperationPayload::New { .. } => "new",
            OperationPayload::Describe { .. } => "describe",
            OperationPayload::Rewrite { .. } => "rewrite",
            OperationPayload::Rebase { .. } => "rebase",
            OperationPayload::Abandon { .. } => "abandon",
            OperationPayload::Merge { .. } => "merge",
            OperationPayload::Squash { .. } => "squash",
            OperationPayload::Split { .. } => "split",
            OperationPayload::Duplicate { .. } => "duplicate",
            OperationPayload::Parallelize { .. } => "parallelize",
            OperationPayload::RestorePaths { .. } => "restore-paths",
            OperationPayload::Edit { .. } => "edit",
            OperationPayload::BookmarkSet { .. } => "bookmark-set",
            OperationPayload::BookmarkDelete { .. } => "bookmark-delete",
            OperationPayload::Resolve { .. } => "resolve",
            OperationPayload::GitImport { .. } => "git-import",
            OperationPayload::GitExport { .. } => "git-export",
            OperationPayload::Undo { .. } => "undo",
            OperationPayload::RestoreOp { .. } => "restore-op",
            OperationPayload::RevertOp { .. } => "revert-op",
        }
    }

    pub fn effects(&self) -> &RepoDelta {
        match self {
            OperationPayload::Init { effects, .. }
            | OperationPayload::Snapshot { effects, .. }
            | OperationPayload::New { effects, .. }
            | OperationPayload::Describe { effects, .. }
            | OperationPayload::Rewrite { effects, .. }
            | OperationPayload::Rebase { effects, .. }
            | OperationPayload::Abandon { effects, .. }
            | OperationPayload::Merge { effects, .. }
            | OperationPayload::Squash { effects, .. }
            | OperationPayload::Split { effects, .. }
            | OperationPayload::Duplicate { effects, .. }
            | OperationPayload::Parallelize { effects, .. }
            | OperationPayload::RestorePaths { effects, .. }
            | OperationPayload::Edit { effects, .. }
            | OperationPayload::BookmarkSet { effects, .. }
            | OperationPayload::BookmarkDelete { effects, .. }
            | OperationPayload::Resolve { effects, .. }
            | OperationPayload::GitImport { effects, .. }
            | OperationPayload::GitExport { effects, .. }
            | OperationPayload::Undo { effects, .. }
            | OperationPayload::RestoreOp { effects, .. }
            | OperationPayload::RevertOp { effects, .. } => effects,
        }
    }
}

/// One record of `oplog.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub op_id: OperationId,
    pub parents: Vec<OperationId>,
    pub timestamp: MillisSinceEpoch,
    pub tz_offset: i32,
    pub user: String,
    pub description: String,
    #[serde(flatten)]
    pub payload: OperationPayload,
}

impl Operation {
    pub fn new(
        parents: Vec<OperationId>,
        timestamp: MillisSinceEpoch,
        tz_offset: i32,
        user: String,
        description: String,
        payload: OperationPayload,
    ) -> OpStoreResult<Operation> {
        let op_id = compute_op_id(&parents, &timestamp, &user, &payload)?;
        Ok(Operation {
            op_id,
            parents,
            timestamp,
            tz_offset,
            user,
            description,
            payload,
        })
    }

    pub fn to_line(&self) -> OpStoreResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|err| OpStoreError::Corrupt(err.to_string()))
    }

    pub fn from_line(line: &[u8]) -> OpStoreResult<Operation> {
        serde_json::from_slice(line).map_err(|err| OpStoreError::Corrupt(err.to_string()))
    }
}

/// The canonical serialization hashed into operation ids: object keys
/// sorted, no insignificant whitespace.
pub fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .iter()
                .map(|key| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String((*key).clone()),
                        canonical_json(&map[*key])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(values) => {
            let items: Vec<String> = values.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

pub fn compute_op_id(
    parents: &[OperationId],
    timestamp: &MillisSinceEpoch,
    user: &str,
    payload: &OperationPayload,
) -> OpStoreResult<OperationId> {
    let payload_value =
        serde_json::to_value(payload).map_err(|err| OpStoreError::Corrupt(err.to_string()))?;
    let canonical = canonical_json(&payload_value["payload"]);
    let mut hasher = Sha256::new();
    for parent in parents {
        hasher.update(parent.hex());
        hasher.update(b"\0");
    }
    hasher.update(timestamp.0.to_string());
    hasher.update(b"\0");
    hasher.update(user);
    hasher.update(b"\0");
    hasher.update(payload.kind());
    hasher.update(b"\0");
    hasher.update(canonical);
    Ok(OperationId::from_bytes(&hasher.finalize()))
}

/// The op-log head, the undo cursor, and any sibling heads left behind by
/// concurrent workspaces (`op-heads.json`).
///
/// The cursor tracks the position in pre-undo history that the repo state
/// currently matches. A normal operation resets it to the new head; an
/// `undo` leaves the head on the undo record while the cursor keeps
/// walking back, so consecutive undos keep peeling earlier operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpHeads {
    pub current: OperationId,
    pub cursor: OperationId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub siblings: Vec<OperationId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Timestamp;

    fn signature() -> Signature {
        Signature {
            name: "Test User".to_owned(),
            email: "test.user@example.com".to_owned(),
            timestamp: Timestamp {
                timestamp: MillisSinceEpoch(0),
                tz_offset: 0,
            },
        }
    }

    fn payload() -> OperationPayload {
        OperationPayload::Describe {
            change_id: ChangeId::from_bytes(&[7; 32]),
            description: "new".to_owned(),
            prev_description: "old".to_owned(),
            effects: RepoDelta::default(),
        }
    }

    #[test]
    fn test_op_id_is_deterministic() {
        let parents = vec![OperationId::from_bytes(&[1; 32])];
        let id1 =
            compute_op_id(&parents, &MillisSinceEpoch(42), "alice", &payload()).unwrap();
        let id2 =
            compute_op_id(&parents, &MillisSinceEpoch(42), "alice", &payload()).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(id1.as_bytes().len(), 32);
    }

    #[test]
    fn test_op_id_depends_on_all_inputs() {
        let parents = vec![OperationId::from_bytes(&[1; 32])];
        let base = compute_op_id(&parents, &MillisSinceEpoch(42), "alice", &payload()).unwrap();
        assert_ne!(
            base,
            compute_op_id(&[], &MillisSinceEpoch(42), "alice", &payload()).unwrap()
        );
        assert_ne!(
            base,
            compute_op_id(&parents, &MillisSinceEpoch(43), "alice", &payload()).unwrap()
        );
        assert_ne!(
            base,
            compute_op_id(&parents, &MillisSinceEpoch(42), "bob", &payload()).unwrap()
        );
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = serde_json::json!({"b": 1, "a": {"z": [1, 2], "y": null}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"y":null,"z":[1,2]},"b":1}"#
        );
    }

    #[test]
    fn test_operation_line_round_trip() {
        let operation = Operation::new(
            vec![OperationId::from_bytes(&[9; 32])],
            MillisSinceEpoch(123),
            60,
            "alice".to_owned(),
            "describe change".to_owned(),
            payload(),
        )
        .unwrap();
        let line = operation.to_line().unwrap();
        assert!(!line.contains(&b'\n'));
        let parsed = Operation::from_line(&line).unwrap();
        assert_eq!(parsed, operation);
        assert_eq!(parsed.payload.kind(), "describe");
    }

    #[test]
    fn test_delta_between_and_apply_round_trip() {
        let base = View::empty(signature());
        let mut new = base.clone();
        let change_id = ChangeId::from_bytes(&[3; 32]);
        new.graph
            .create(
                change_id.clone(),
                vec![ChangeGraph::root_change_id()],
                "work".to_owned(),
                signature(),
                signature(),
                Default::default(),
            )
            .unwrap();
        new.graph.set_working_copy(change_id.clone()).unwrap();
        new.bookmarks
            .upsert(Bookmark::local("main", change_id.clone()));

        let delta = RepoDelta::between(&base, &new);
        assert_eq!(delta.changes.len(), 1);
        assert_eq!(delta.bookmarks.len(), 1);
        assert!(delta.working_copy.is_some());

        let mut replayed = base.clone();
        apply_delta(&mut replayed, &delta, ApplyDirection::Forward);
        assert_eq!(replayed, new);

        let mut undone = new.clone();
        apply_delta(&mut undone, &delta, ApplyDirection::Inverse);
        assert_eq!(undone, base);
    }
}
