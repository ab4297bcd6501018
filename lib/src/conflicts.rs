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

//! First-class conflicts. A conflict never blocks an operation: it is
//! recorded against the owning change and the change's tree carries the
//! materialized markers until the conflict is resolved or the change is
//! abandoned.

use blake2::{Blake2b512, Digest as _};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{ChangeId, ConflictId};
use crate::error::{ClassifiedError, ErrorKind};
use crate::object_id::ObjectId as _;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConflictError {
    #[error("Conflict {0} doesn't exist")]
    NotFound(String),
    #[error("Conflict in {path} has no content on the {side} side")]
    MissingSide { path: String, side: String },
}

impl ClassifiedError for ConflictError {
    fn kind(&self) -> ErrorKind {
        match self {
            ConflictError::NotFound(_) => ErrorKind::NotFound,
            ConflictError::MissingSide { .. } => ErrorKind::InvalidArgument,
        }
    }

    fn context(&self) -> Option<String> {
        match self {
            ConflictError::NotFound(id) => Some(id.clone()),
            ConflictError::MissingSide { path, .. } => Some(path.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    Content,
    AddAdd,
    DeleteModify,
    ModifyDelete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictSide {
    pub label: String,
    /// `None` when this side deleted the file.
    pub content: Option<String>,
    pub change_id: ChangeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictBase {
    pub content: String,
    pub change_id: ChangeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub conflict_id: ConflictId,
    /// The change this conflict belongs to. It disappears only through
    /// resolution or the owner being abandoned.
    pub owner: ChangeId,
    pub path: String,
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    pub sides: Vec<ConflictSide>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<ConflictBase>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub driver_failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_error: Option<String>,
}

impl Conflict {
    /// Conflict ids are content-derived so replaying an operation
    /// reproduces them exactly.
    pub fn derive_id(
        owner: &ChangeId,
        path: &str,
        sides: &[ConflictSide],
        base: Option<&ConflictBase>,
    ) -> ConflictId {
        let mut hasher = Blake2b512::new();
        hasher.update(owner.as_bytes());
        hasher.update(b"\0");
        hasher.update(path.as_bytes());
        for side in sides {
            hasher.update(b"\0");
            hasher.update(side.label.as_bytes());
            hasher.update(b"\0");
            match &side.content {
                Some(content) => hasher.update(content.as_bytes()),
                None => hasher.update(b"\x01"),
            }
        }
        if let Some(base) = base {
            hasher.update(b"\0base\0");
            hasher.update(base.content.as_bytes());
        }
        ConflictId::from_bytes(&hasher.finalize()[..32])
    }

    fn side(&self, index: usize) -> Option<&ConflictSide> {
        self.sides.get(index)
    }

    pub fn ours(&self) -> Option<&ConflictSide> {
        self.side(0)
    }

    pub fn theirs(&self) -> Option<&ConflictSide> {
        self.side(1)
    }
}

/// The unresolved conflicts of a repository (`conflicts.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictSet {
    pub conflicts: IndexMap<ConflictId, Conflict>,
}

impl ConflictSet {
    pub fn get(&self, id: &ConflictId) -> Result<&Conflict, ConflictError> {
        self.conflicts
            .get(id)
            .ok_or_else(|| ConflictError::NotFound(id.hex()))
    }

    /// Keys stay sorted so re-inserting a conflict after undo reproduces
    /// the same serialization.
    pub fn insert(&mut self, conflict: Conflict) {
        self.conflicts.insert(conflict.conflict_id.clone(), conflict);
        self.conflicts.sort_keys();
    }

    pub fn remove(&mut self, id: &ConflictId) -> Option<Conflict> {
        self.conflicts.shift_remove(id)
    }

    pub fn for_change(&self, owner: &ChangeId) -> Vec<&Conflict> {
        self.conflicts
            .values()
            .filter(|c| c.owner == *owner)
            .collect()
    }

    pub fn remove_for_change(&mut self, owner: &ChangeId) -> Vec<Conflict> {
        let ids: Vec<ConflictId> = self
            .conflicts
            .values()
            .filter(|c| c.owner == *owner)
            .map(|c| c.conflict_id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.conflicts.shift_remove(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerStyle {
    /// `<<<<<<<`/`|||||||`/`=======`/`>>>>>>>` including the base block.
    Diff3,
    /// Same without the base block.
    Merge,
}

const OURS_MARKER: &str = "<<<<<<< ours";
const BASE_MARKER: &str = "||||||| base";
const SEPARATOR_MARKER: &str = "=======";
const THEIRS_MARKER: &str = ">>>>>>> theirs";

/// Formats a content conflict with markers. The codec round-trips through
/// [`parse_markers`] for UTF-8 content that doesn't itself contain marker
/// lines.
pub fn materialize(conflict: &Conflict, style: MarkerStyle) -> Result<String, ConflictError> {
    let ours = conflict
        .ours()
        .and_then(|side| side.content.as_deref())
        .ok_or_else(|| ConflictError::MissingSide {
            path: conflict.path.clone(),
            side: "ours".to_owned(),
        })?;
    let theirs = conflict
        .theirs()
        .and_then(|side| side.content.as_deref())
        .ok_or_else(|| ConflictError::MissingSide {
            path: conflict.path.clone(),
            side: "theirs".to_owned(),
        })?;
    let mut out = String::new();
    out.push_str(OURS_MARKER);
    out.push('\n');
    out.push_str(ours);
    out.push('\n');
    if style == MarkerStyle::Diff3 {
        out.push_str(BASE_MARKER);
        out.push('\n');
        out.push_str(conflict.base.as_ref().map(|b| b.content.as_str()).unwrap_or(""));
        out.push('\n');
    }
    out.push_str(SEPARATOR_MARKER);
    out.push('\n');
    out.push_str(theirs);
    out.push('\n');
    out.push_str(THEIRS_MARKER);
    out.push('\n');
    Ok(out)
}

/// The content blocks recovered from marker text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedConflict {
    pub ours: String,
    pub base: Option<String>,
    pub theirs: String,
}

/// Parses marker text produced by [`materialize`]. Returns `None` when the
/// text is not a single well-formed conflict hunk in the given style.
pub fn parse_markers(text: &str, style: MarkerStyle) -> Option<ParsedConflict> {
    let rest = text.strip_prefix(OURS_MARKER)?.strip_prefix('\n')?;
    let (ours, rest) = match style {
        MarkerStyle::Diff3 => {
            let marker = format!("\n{BASE_MARKER}\n");
            let pos = rest.find(&marker)?;
            (&rest[..pos], &rest[pos + marker.len()..])
        }
        MarkerStyle::Merge => {
            let marker = format!("\n{SEPARATOR_MARKER}\n");
            let pos = rest.find(&marker)?;
            (&rest[..pos], &rest[pos + marker.len()..])
        }
    };
    let (base, rest) = match style {
        MarkerStyle::Diff3 => {
            let marker = format!("\n{SEPARATOR_MARKER}\n");
            let pos = rest.find(&marker)?;
            (Some(rest[..pos].to_owned()), &rest[pos + marker.len()..])
        }
        MarkerStyle::Merge => (None, rest),
    };
    let marker = format!("\n{THEIRS_MARKER}");
    let pos = rest.find(&marker)?;
    let theirs = &rest[..pos];
    let tail = &rest[pos + marker.len()..];
    if !tail.is_empty() && tail != "\n" {
        return None;
    }
    Some(ParsedConflict {
        ours: ours.to_owned(),
        base,
        theirs: theirs.to_owned(),
    })
}

/// How to resolve a conflict without hand-edited content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    Ours,
    Theirs,
    /// Lines of ours followed by lines of theirs.
    Union,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Strategy(ResolutionStrategy),
    Content(String),
}

/// The file content a resolution produces. `None` means the resolution
/// deletes the path (taking a deleted side).
pub fn resolved_content(
    conflict: &Conflict,
    resolution: &Resolution,
) -> Result<Option<String>, ConflictError> {
    match resolution {
        Resolution::Content(content) => Ok(Some(content.clone())),
        Resolution::Strategy(strategy) => {
            let ours = conflict.ours().and_then(|side| side.content.clone());
            let theirs = conflict.theirs().and_then(|side| side.content.clone());
            match strategy {
                ResolutionStrategy::Ours => Ok(ours),
                ResolutionStrategy::Theirs => Ok(theirs),
                ResolutionStrategy::Union => {
                    let mut lines: Vec<&str> = vec![];
                    let ours = ours.unwrap_or_default();
                    let theirs = theirs.unwrap_or_default();
                    lines.extend(ours.lines());
                    lines.extend(theirs.lines());
                    let mut joined = lines.join("\n");
                    if ours.ends_with('\n') || theirs.ends_with('\n') || joined.is_empty() {
                        joined.push('\n');
                    }
                    Ok(Some(joined))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn change_id(byte: u8) -> ChangeId {
        ChangeId::from_bytes(&[byte; 32])
    }

    fn content_conflict(ours: &str, base: &str, theirs: &str) -> Conflict {
        let sides = vec![
            ConflictSide {
                label: "ours".to_owned(),
                content: Some(ours.to_owned()),
                change_id: change_id(1),
            },
            ConflictSide {
                label: "theirs".to_owned(),
                content: Some(theirs.to_owned()),
                change_id: change_id(2),
            },
        ];
        let base = ConflictBase {
            content: base.to_owned(),
            change_id: change_id(3),
        };
        let conflict_id = Conflict::derive_id(&change_id(4), "f.txt", &sides, Some(&base));
        Conflict {
            conflict_id,
            owner: change_id(4),
            path: "f.txt".to_owned(),
            conflict_type: ConflictType::Content,
            sides,
            base: Some(base),
            driver_failed: false,
            driver_error: None,
        }
    }

    #[test]
    fn test_diff3_markers_round_trip() {
        let conflict = content_conflict("line a", "line base", "line b");
        let text = materialize(&conflict, MarkerStyle::Diff3).unwrap();
        assert!(text.contains("<<<<<<<"));
        assert!(text.contains("|||||||"));
        assert!(text.contains("======="));
        assert!(text.contains(">>>>>>>"));
        let parsed = parse_markers(&text, MarkerStyle::Diff3).unwrap();
        assert_eq!(parsed.ours, "line a");
        assert_eq!(parsed.base.as_deref(), Some("line base"));
        assert_eq!(parsed.theirs, "line b");
    }

    #[test]
    fn test_merge_markers_round_trip() {
        let conflict = content_conflict("one\ntwo", "base", "one\nthree");
        let text = materialize(&conflict, MarkerStyle::Merge).unwrap();
        assert!(!text.contains("|||||||"));
        let parsed = parse_markers(&text, MarkerStyle::Merge).unwrap();
        assert_eq!(parsed.ours, "one\ntwo");
        assert_eq!(parsed.base, None);
        assert_eq!(parsed.theirs, "one\nthree");
    }

    #[test_case(MarkerStyle::Diff3 ; "diff3 style")]
    #[test_case(MarkerStyle::Merge ; "merge style")]
    fn test_parse_rejects_garbage(style: MarkerStyle) {
        assert_eq!(parse_markers("not a conflict", style), None);
        let truncated = format!("{OURS_MARKER}\nours\n");
        assert_eq!(parse_markers(&truncated, style), None);
    }

    #[test]
    fn test_resolution_strategies() {
        let conflict = content_conflict("a\n", "base\n", "b\n");
        assert_eq!(
            resolved_content(&conflict, &Resolution::Strategy(ResolutionStrategy::Ours)).unwrap(),
            Some("a\n".to_owned())
        );
        assert_eq!(
            resolved_content(&conflict, &Resolution::Strategy(ResolutionStrategy::Theirs))
                .unwrap(),
            Some("b\n".to_owned())
        );
        assert_eq!(
            resolved_content(&conflict, &Resolution::Strategy(ResolutionStrategy::Union)).unwrap(),
            Some("a\nb\n".to_owned())
        );
        assert_eq!(
            resolved_content(&conflict, &Resolution::Content("merged\n".to_owned())).unwrap(),
            Some("merged\n".to_owned())
        );
    }

    #[test]
    fn test_conflict_ids_are_deterministic() {
        let a = content_conflict("x", "y", "z");
        let b = content_conflict("x", "y", "z");
        assert_eq!(a.conflict_id, b.conflict_id);
        let c = content_conflict("x", "y", "w");
        assert_ne!(a.conflict_id, c.conflict_id);
    }

    #[test]
    fn test_conflict_set_ownership() {
        let mut set = ConflictSet::default();
        let conflict = content_conflict("a", "b", "c");
        let id = conflict.conflict_id.clone();
        set.insert(conflict);
        assert_eq!(set.for_change(&change_id(4)).len(), 1);
        assert_eq!(set.for_change(&change_id(9)).len(), 0);
        let removed = set.remove_for_change(&change_id(4));
        assert_eq!(removed.len(), 1);
        assert!(set.is_empty());
        assert!(set.get(&id).is_err());
    }
}
