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

//! The change graph: a DAG of changes with stable change ids, plus the tag
//! index and the working-copy pointer. Persisted as one JSON blob
//! (`graph.json`); the child index is rebuilt in memory on demand.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use itertools::Itertools as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{ChangeId, CommitId, Signature, Tree};
use crate::dag_walk;
use crate::error::{ClassifiedError, ErrorKind};
use crate::object_id::ObjectId as _;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Change {0} doesn't exist")]
    NotFound(String),
    #[error("Change {0} already exists")]
    AlreadyExists(String),
    #[error("Cannot rewrite the root change")]
    RootImmutable,
    #[error("Parent change {0} is abandoned")]
    AbandonedParent(String),
    #[error("Parent changes must form an antichain; {ancestor} is an ancestor of {descendant}")]
    NotAnAntichain { ancestor: String, descendant: String },
    #[error("Setting those parents would create a cycle through {0}")]
    WouldCreateCycle(String),
    #[error("A change must have at least one parent")]
    NoParents,
    #[error("No changes selected")]
    EmptySelection,
}

impl ClassifiedError for GraphError {
    fn kind(&self) -> ErrorKind {
        match self {
            GraphError::NotFound(_) => ErrorKind::NotFound,
            GraphError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            GraphError::RootImmutable
            | GraphError::AbandonedParent(_)
            | GraphError::NotAnAntichain { .. }
            | GraphError::WouldCreateCycle(_)
            | GraphError::NoParents
            | GraphError::EmptySelection => ErrorKind::InvalidArgument,
        }
    }

    fn context(&self) -> Option<String> {
        match self {
            GraphError::NotFound(id)
            | GraphError::AlreadyExists(id)
            | GraphError::AbandonedParent(id)
            | GraphError::WouldCreateCycle(id) => Some(id.clone()),
            _ => None,
        }
    }
}

pub type GraphResult<T> = Result<T, GraphError>;

fn is_false(value: &bool) -> bool {
    !*value
}

/// The atomic unit of work. The `change_id` is assigned at creation and
/// never rewritten; the `commit_id` moves on every rewrite, with prior
/// commits retained in `evolution`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub change_id: ChangeId,
    pub commit_id: CommitId,
    pub parents: Vec<ChangeId>,
    pub description: String,
    pub author: Signature,
    pub committer: Signature,
    pub tree: Tree,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evolution: Vec<CommitId>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub abandoned: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub empty: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub has_conflict: bool,
}

/// Fields a rewrite may touch. `None` leaves the field alone.
#[derive(Debug, Clone, Default)]
pub struct ChangePatch {
    pub description: Option<String>,
    pub author: Option<Signature>,
    pub committer: Option<Signature>,
    pub tree: Option<Tree>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeGraph {
    changes: IndexMap<ChangeId, Change>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    tags: IndexMap<String, ChangeId>,
    working_copy: ChangeId,
}

impl ChangeGraph {
    /// The root change has the all-zeros id and no parents. It is the only
    /// change with zero parents and cannot be rewritten.
    pub fn root_change_id() -> ChangeId {
        ChangeId::from_bytes(&[0; 32])
    }

    /// A graph holding only the root change. The caller is expected to put
    /// a working-copy change on top before the graph is used.
    pub fn empty(root_signature: Signature) -> Self {
        let root_id = Self::root_change_id();
        let root = Change {
            change_id: root_id.clone(),
            commit_id: CommitId::from_bytes(&[]),
            parents: vec![],
            description: String::new(),
            author: root_signature.clone(),
            committer: root_signature,
            tree: Tree::default(),
            evolution: vec![],
            abandoned: false,
            empty: true,
            has_conflict: false,
        };
        let mut changes = IndexMap::new();
        changes.insert(root_id.clone(), root);
        ChangeGraph {
            changes,
            tags: IndexMap::new(),
            working_copy: root_id,
        }
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn has(&self, id: &ChangeId) -> bool {
        self.changes.contains_key(id)
    }

    pub fn get(&self, id: &ChangeId) -> GraphResult<&Change> {
        self.changes
            .get(id)
            .ok_or_else(|| GraphError::NotFound(id.hex()))
    }

    fn get_mut(&mut self, id: &ChangeId) -> GraphResult<&mut Change> {
        self.changes
            .get_mut(id)
            .ok_or_else(|| GraphError::NotFound(id.hex()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.values()
    }

    pub fn change_ids(&self) -> impl Iterator<Item = &ChangeId> {
        self.changes.keys()
    }

    pub fn working_copy_id(&self) -> &ChangeId {
        &self.working_copy
    }

    pub fn set_working_copy(&mut self, id: ChangeId) -> GraphResult<()> {
        if !self.has(&id) {
            return Err(GraphError::NotFound(id.hex()));
        }
        self.working_copy = id;
        Ok(())
    }

    /// Sets the pointer without checking the target. Only delta replay uses
    /// this; the target may not exist yet mid-application.
    pub(crate) fn force_working_copy(&mut self, id: ChangeId) {
        self.working_copy = id;
    }

    /// A graph with no changes at all, as delta replay starts from. The
    /// pointer is parked on the root id until the first delta lands.
    pub fn bare() -> Self {
        ChangeGraph {
            changes: IndexMap::new(),
            tags: IndexMap::new(),
            working_copy: Self::root_change_id(),
        }
    }

    pub fn tags(&self) -> &IndexMap<String, ChangeId> {
        &self.tags
    }

    pub fn set_tag(&mut self, name: String, target: ChangeId) {
        self.tags.insert(name, target);
    }

    pub fn remove_tag(&mut self, name: &str) -> Option<ChangeId> {
        self.tags.shift_remove(name)
    }

    /// The child index, rebuilt from the canonical parent links.
    pub fn children_index(&self) -> HashMap<ChangeId, Vec<ChangeId>> {
        let mut children: HashMap<ChangeId, Vec<ChangeId>> = HashMap::new();
        for change in self.changes.values() {
            for parent in &change.parents {
                children
                    .entry(parent.clone())
                    .or_default()
                    .push(change.change_id.clone());
            }
        }
        children
    }

    /// Validates and inserts a fully-formed change. Used by replay and
    /// import, which carry their own ids.
    pub fn add_change(&mut self, change: Change) -> GraphResult<()> {
        if self.has(&change.change_id) {
            return Err(GraphError::AlreadyExists(change.change_id.hex()));
        }
        for parent in &change.parents {
            if !self.has(parent) {
                return Err(GraphError::NotFound(parent.hex()));
            }
        }
        self.changes.insert(change.change_id.clone(), change);
        Ok(())
    }

    /// Removes a change outright. Only undo/replay goes through this; user
    /// operations abandon instead.
    pub fn remove_change(&mut self, id: &ChangeId) -> Option<Change> {
        self.changes.shift_remove(id)
    }

    pub fn replace_change(&mut self, change: Change) {
        self.changes.insert(change.change_id.clone(), change);
    }

    /// Creates a new change on top of `parents`. Parents must exist, must
    /// not be abandoned, and must form an antichain. The committer
    /// timestamp is clamped so an ancestor never postdates a descendant.
    pub fn create(
        &mut self,
        change_id: ChangeId,
        parents: Vec<ChangeId>,
        description: String,
        author: Signature,
        committer: Signature,
        tree: Tree,
    ) -> GraphResult<ChangeId> {
        if self.has(&change_id) {
            return Err(GraphError::AlreadyExists(change_id.hex()));
        }
        self.validate_parents(&parents, None)?;
        let mut committer = committer;
        let max_parent_ts = parents
            .iter()
            .map(|id| self.changes[id].committer.timestamp.clone())
            .max();
        if let Some(max_parent_ts) = max_parent_ts {
            if committer.timestamp < max_parent_ts {
                committer.timestamp = max_parent_ts;
            }
        }
        let change = Change {
            change_id: change_id.clone(),
            commit_id: CommitId::from_bytes(&[]),
            parents,
            description,
            author,
            committer,
            tree,
            evolution: vec![],
            abandoned: false,
            empty: true,
            has_conflict: false,
        };
        self.changes.insert(change_id.clone(), change);
        Ok(change_id)
    }

    fn validate_parents(
        &self,
        parents: &[ChangeId],
        allow_abandoned_of: Option<&ChangeId>,
    ) -> GraphResult<()> {
        if parents.is_empty() {
            return Err(GraphError::NoParents);
        }
        for parent in parents {
            let change = self.get(parent)?;
            // An abandoned change may keep its abandoned parents.
            let abandoned_ok = allow_abandoned_of
                .map(|id| self.changes[id].abandoned)
                .unwrap_or(false);
            if change.abandoned && !abandoned_ok {
                return Err(GraphError::AbandonedParent(parent.hex()));
            }
        }
        // Antichain: no parent may be an ancestor of another.
        for (a, b) in parents.iter().tuple_combinations() {
            if self.is_ancestor(a, b) {
                return Err(GraphError::NotAnAntichain {
                    ancestor: a.hex(),
                    descendant: b.hex(),
                });
            }
            if self.is_ancestor(b, a) {
                return Err(GraphError::NotAnAntichain {
                    ancestor: b.hex(),
                    descendant: a.hex(),
                });
            }
        }
        Ok(())
    }

    /// Applies a rewrite patch, leaving the change id untouched. The caller
    /// projects a new commit and records it with [`Self::record_commit`].
    pub fn apply_patch(&mut self, id: &ChangeId, patch: ChangePatch) -> GraphResult<()> {
        if *id == Self::root_change_id() {
            return Err(GraphError::RootImmutable);
        }
        let change = self.get_mut(id)?;
        if let Some(description) = patch.description {
            change.description = description;
        }
        if let Some(author) = patch.author {
            change.author = author;
        }
        if let Some(committer) = patch.committer {
            change.committer = committer;
        }
        if let Some(tree) = patch.tree {
            change.tree = tree;
        }
        Ok(())
    }

    /// Records the Git projection of a change. When the commit moves, the
    /// prior commit id is appended to the evolution (obslog).
    pub fn record_commit(&mut self, id: &ChangeId, commit_id: CommitId) -> GraphResult<()> {
        let change = self.get_mut(id)?;
        if change.commit_id == commit_id {
            return Ok(());
        }
        if !change.commit_id.as_bytes().is_empty() {
            let prior = std::mem::replace(&mut change.commit_id, commit_id);
            change.evolution.push(prior);
        } else {
            change.commit_id = commit_id;
        }
        Ok(())
    }

    pub fn set_flags(
        &mut self,
        id: &ChangeId,
        empty: Option<bool>,
        has_conflict: Option<bool>,
    ) -> GraphResult<()> {
        let change = self.get_mut(id)?;
        if let Some(empty) = empty {
            change.empty = empty;
        }
        if let Some(has_conflict) = has_conflict {
            change.has_conflict = has_conflict;
        }
        Ok(())
    }

    pub fn abandon(&mut self, id: &ChangeId) -> GraphResult<()> {
        if *id == Self::root_change_id() {
            return Err(GraphError::RootImmutable);
        }
        let change = self.get_mut(id)?;
        change.abandoned = true;
        Ok(())
    }

    pub fn unabandon(&mut self, id: &ChangeId) -> GraphResult<()> {
        let change = self.get_mut(id)?;
        change.abandoned = false;
        Ok(())
    }

    /// Moves a change onto new parents, rejecting edges that would close a
    /// cycle. Used by rebase and by auto-rebase of descendants.
    pub fn set_parents(&mut self, id: &ChangeId, new_parents: Vec<ChangeId>) -> GraphResult<()> {
        if *id == Self::root_change_id() {
            return Err(GraphError::RootImmutable);
        }
        if !self.has(id) {
            return Err(GraphError::NotFound(id.hex()));
        }
        self.validate_parents(&new_parents, Some(id))?;
        for parent in &new_parents {
            if parent == id || self.is_ancestor(id, parent) {
                return Err(GraphError::WouldCreateCycle(id.hex()));
            }
        }
        self.get_mut(id)?.parents = new_parents;
        Ok(())
    }

    /// True if `ancestor` is an ancestor of `descendant` (inclusive).
    pub fn is_ancestor(&self, ancestor: &ChangeId, descendant: &ChangeId) -> bool {
        self.ancestors(std::slice::from_ref(descendant))
            .contains(ancestor)
    }

    /// All ancestors of `ids`, including `ids` themselves.
    pub fn ancestors(&self, ids: &[ChangeId]) -> HashSet<ChangeId> {
        let start: Vec<ChangeId> = ids.iter().filter(|id| self.has(id)).cloned().collect();
        dag_walk::dfs(start, |id| id.clone(), |id| {
            self.changes[id].parents.clone()
        })
        .collect()
    }

    /// All descendants of `ids`, including `ids` themselves.
    pub fn descendants(&self, ids: &[ChangeId]) -> HashSet<ChangeId> {
        let children = self.children_index();
        let start: Vec<ChangeId> = ids.iter().filter(|id| self.has(id)).cloned().collect();
        dag_walk::dfs(start, |id| id.clone(), |id| {
            children.get(id).cloned().unwrap_or_default()
        })
        .collect()
    }

    /// Descendants of `id` (excluding it) in topological order, parents
    /// before children. This is the auto-rebase worklist.
    pub fn descendants_topo(&self, id: &ChangeId) -> Vec<ChangeId> {
        let children = self.children_index();
        let mut order = dag_walk::topo_order_forward(
            self.descendants(std::slice::from_ref(id)),
            |id| id.clone(),
            |node| {
                // Walk child edges only within the descendant set.
                children
                    .get(node)
                    .cloned()
                    .unwrap_or_default()
            },
        );
        // topo_order_forward puts children first; reverse for parents-first.
        order.reverse();
        order.retain(|node| node != id);
        order
    }

    /// Heads (changes that are not a proper ancestor of another member) of
    /// `ids`.
    pub fn heads_of(&self, ids: &HashSet<ChangeId>) -> HashSet<ChangeId> {
        ids.iter()
            .filter(|id| {
                !ids.iter()
                    .any(|other| other != *id && self.is_ancestor(id, other))
            })
            .cloned()
            .collect()
    }

    /// Roots (changes with no parent in the set) of `ids`.
    pub fn roots_of(&self, ids: &HashSet<ChangeId>) -> HashSet<ChangeId> {
        ids.iter()
            .filter(|id| {
                !ids.iter()
                    .any(|other| *other != **id && self.is_ancestor(other, id))
            })
            .cloned()
            .collect()
    }

    /// Non-abandoned changes with no non-abandoned children.
    pub fn visible_heads(&self) -> Vec<ChangeId> {
        let children = self.children_index();
        self.changes
            .values()
            .filter(|change| !change.abandoned)
            .filter(|change| {
                children
                    .get(&change.change_id)
                    .map(|cs| {
                        cs.iter().all(|child| self.changes[child].abandoned)
                    })
                    .unwrap_or(true)
            })
            .map(|change| change.change_id.clone())
            .collect()
    }

    /// The unique lowest common ancestor of `ids`: the deepest common
    /// ancestor, ties broken by committer timestamp then by lexicographic
    /// change id.
    pub fn common_ancestor(&self, ids: &[ChangeId]) -> Option<ChangeId> {
        let mut common: Option<HashSet<ChangeId>> = None;
        for id in ids {
            let ancestors = self.ancestors(std::slice::from_ref(id));
            common = Some(match common {
                None => ancestors,
                Some(prev) => prev.intersection(&ancestors).cloned().collect(),
            });
        }
        let common = common?;
        let candidates = self.heads_of(&common);
        candidates
            .into_iter()
            .max_by(|a, b| {
                let change_a = &self.changes[a];
                let change_b = &self.changes[b];
                change_a
                    .committer
                    .timestamp
                    .cmp(&change_b.committer.timestamp)
                    // On a timestamp tie prefer the smaller id, so invert.
                    .then_with(|| b.cmp(a))
            })
    }

    /// `range(a, b)`: ancestors of `b` that are not ancestors of `a`.
    pub fn range(&self, a: &[ChangeId], b: &[ChangeId]) -> HashSet<ChangeId> {
        let exclude = self.ancestors(a);
        self.ancestors(b)
            .into_iter()
            .filter(|id| !exclude.contains(id))
            .collect()
    }

    /// All change ids in log order: topological (children before parents),
    /// ties broken by committer timestamp descending, then change id
    /// ascending.
    pub fn topo_sorted_ids(&self) -> Vec<ChangeId> {
        let children = self.children_index();
        let mut pending_children: HashMap<&ChangeId, usize> = self
            .changes
            .keys()
            .map(|id| (id, children.get(id).map_or(0, Vec::len)))
            .collect();
        let mut ready: Vec<&ChangeId> = pending_children
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut result = Vec::with_capacity(self.changes.len());
        while !ready.is_empty() {
            // Emit the newest ready change first.
            let (index, _) = ready
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| {
                    let change_a = &self.changes[**a];
                    let change_b = &self.changes[**b];
                    change_a
                        .committer
                        .timestamp
                        .cmp(&change_b.committer.timestamp)
                        .then_with(|| b.cmp(a))
                })
                .unwrap();
            let id = ready.swap_remove(index);
            result.push(id.clone());
            for parent in &self.changes[id].parents {
                let count = pending_children.get_mut(parent).unwrap();
                *count -= 1;
                if *count == 0 {
                    ready.push(parent);
                }
            }
        }
        result
    }

    /// Cheap structural validation used by op-log replay: parents resolve
    /// and the parent relation stays acyclic.
    pub fn check_integrity(&self) -> GraphResult<()> {
        for change in self.changes.values() {
            for parent in &change.parents {
                if !self.has(parent) {
                    return Err(GraphError::NotFound(parent.hex()));
                }
            }
        }
        let ids: Vec<ChangeId> = self.changes.keys().cloned().collect();
        if dag_walk::has_cycle(ids, |id| id.clone(), |id| {
            self.changes[id].parents.clone()
        }) {
            return Err(GraphError::WouldCreateCycle(
                self.working_copy.hex(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MillisSinceEpoch;
    use crate::backend::Timestamp;

    fn signature(millis: i64) -> Signature {
        Signature {
            name: "Test User".to_owned(),
            email: "test.user@example.com".to_owned(),
            timestamp: Timestamp {
                timestamp: MillisSinceEpoch(millis),
                tz_offset: 0,
            },
        }
    }

    fn change_id(byte: u8) -> ChangeId {
        ChangeId::from_bytes(&[byte; 32])
    }

    fn graph_with_chain(len: u8) -> ChangeGraph {
        // root <- 1 <- 2 <- ... <- len
        let mut graph = ChangeGraph::empty(signature(0));
        let mut parent = ChangeGraph::root_change_id();
        for i in 1..=len {
            graph
                .create(
                    change_id(i),
                    vec![parent.clone()],
                    format!("change {i}"),
                    signature(i as i64 * 1000),
                    signature(i as i64 * 1000),
                    Tree::default(),
                )
                .unwrap();
            parent = change_id(i);
        }
        graph
    }

    #[test]
    fn test_create_validates_parents() {
        let mut graph = graph_with_chain(2);
        let missing = change_id(99);
        let err = graph
            .create(
                change_id(3),
                vec![missing.clone()],
                String::new(),
                signature(0),
                signature(0),
                Tree::default(),
            )
            .unwrap_err();
        assert_eq!(err, GraphError::NotFound(missing.hex()));

        // Parents must be an antichain.
        let err = graph
            .create(
                change_id(3),
                vec![change_id(1), change_id(2)],
                String::new(),
                signature(0),
                signature(0),
                Tree::default(),
            )
            .unwrap_err();
        assert!(matches!(err, GraphError::NotAnAntichain { .. }));
    }

    #[test]
    fn test_create_clamps_committer_timestamp() {
        let mut graph = graph_with_chain(1);
        graph
            .create(
                change_id(2),
                vec![change_id(1)],
                String::new(),
                signature(0),
                signature(0), // older than parent's 1000
                Tree::default(),
            )
            .unwrap();
        let child = graph.get(&change_id(2)).unwrap();
        let parent = graph.get(&change_id(1)).unwrap();
        assert!(parent.committer.timestamp <= child.committer.timestamp);
    }

    #[test]
    fn test_record_commit_appends_evolution() {
        let mut graph = graph_with_chain(1);
        let id = change_id(1);
        graph
            .record_commit(&id, CommitId::from_bytes(b"commit1"))
            .unwrap();
        assert!(graph.get(&id).unwrap().evolution.is_empty());
        graph
            .record_commit(&id, CommitId::from_bytes(b"commit2"))
            .unwrap();
        let change = graph.get(&id).unwrap();
        assert_eq!(change.commit_id, CommitId::from_bytes(b"commit2"));
        assert_eq!(change.evolution, vec![CommitId::from_bytes(b"commit1")]);
    }

    #[test]
    fn test_set_parents_detects_cycle() {
        let mut graph = graph_with_chain(3);
        let err = graph
            .set_parents(&change_id(1), vec![change_id(3)])
            .unwrap_err();
        assert_eq!(err, GraphError::WouldCreateCycle(change_id(1).hex()));
    }

    #[test]
    fn test_ancestors_descendants() {
        let graph = graph_with_chain(3);
        let ancestors = graph.ancestors(&[change_id(2)]);
        assert!(ancestors.contains(&ChangeGraph::root_change_id()));
        assert!(ancestors.contains(&change_id(1)));
        assert!(ancestors.contains(&change_id(2)));
        assert!(!ancestors.contains(&change_id(3)));

        let descendants = graph.descendants(&[change_id(2)]);
        assert_eq!(
            descendants,
            [change_id(2), change_id(3)].into_iter().collect()
        );
    }

    #[test]
    fn test_common_ancestor_prefers_deepest() {
        // root <- 1 <- 2 and root <- 1 <- 3
        let mut graph = graph_with_chain(2);
        graph
            .create(
                change_id(3),
                vec![change_id(1)],
                String::new(),
                signature(3000),
                signature(3000),
                Tree::default(),
            )
            .unwrap();
        assert_eq!(
            graph.common_ancestor(&[change_id(2), change_id(3)]),
            Some(change_id(1))
        );
    }

    #[test]
    fn test_visible_heads_skip_abandoned() {
        let mut graph = graph_with_chain(3);
        graph.abandon(&change_id(3)).unwrap();
        assert_eq!(graph.visible_heads(), vec![change_id(2)]);
    }

    #[test]
    fn test_topo_sorted_ids_newest_first() {
        let graph = graph_with_chain(3);
        let sorted = graph.topo_sorted_ids();
        assert_eq!(
            sorted,
            vec![
                change_id(3),
                change_id(2),
                change_id(1),
                ChangeGraph::root_change_id()
            ]
        );
    }

    #[test]
    fn test_graph_serialization_round_trip() {
        let graph = graph_with_chain(2);
        let json = serde_json::to_string(&graph).unwrap();
        let parsed: ChangeGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, graph);
    }
}
