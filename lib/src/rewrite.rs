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

//! Tree recomputation when changes move: merging parent trees, reapplying a
//! change's content onto new parents, and the descendant auto-rebase that
//! follows every rewrite.

use std::collections::HashMap;

use thiserror::Error;
use tracing::instrument;

use crate::backend::{ChangeId, GitStore, Tree};
use crate::conflicts::Conflict;
use crate::error::{ClassifiedError, ErrorKind};
use crate::graph::{ChangeGraph, GraphError};
use crate::merge::{merge_trees, DriverFailure, DriverRegistry, MergeError};
use crate::op_store::View;

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Merge(#[from] MergeError),
}

impl ClassifiedError for RewriteError {
    fn kind(&self) -> ErrorKind {
        match self {
            RewriteError::Graph(err) => err.kind(),
            RewriteError::Merge(err) => err.kind(),
        }
    }

    fn context(&self) -> Option<String> {
        match self {
            RewriteError::Graph(err) => err.context(),
            RewriteError::Merge(err) => err.context(),
        }
    }
}

pub type RewriteResult<T> = Result<T, RewriteError>;

#[derive(Debug, Default)]
pub struct MergedParents {
    pub tree: Tree,
    pub conflicts: Vec<Conflict>,
    pub driver_failures: Vec<DriverFailure>,
}

/// Merges the trees of `parents` pairwise, using the common-ancestor tree
/// of each pair as the base. Conflicts are attributed to `owner`.
pub fn merged_parent_tree(
    graph: &ChangeGraph,
    git: &dyn GitStore,
    registry: &DriverRegistry,
    owner: &ChangeId,
    parents: &[ChangeId],
) -> RewriteResult<MergedParents> {
    match parents {
        [] => Ok(MergedParents::default()),
        [single] => Ok(MergedParents {
            tree: graph.get(single)?.tree.clone(),
            conflicts: vec![],
            driver_failures: vec![],
        }),
        [first, rest @ ..] => {
            let mut acc_tree = graph.get(first)?.tree.clone();
            let mut acc_repr = first.clone();
            let mut conflicts = vec![];
            let mut driver_failures = vec![];
            for parent in rest {
                let base_id = graph
                    .common_ancestor(&[acc_repr.clone(), parent.clone()])
                    .unwrap_or_else(ChangeGraph::root_change_id);
                let base_tree = graph.get(&base_id)?.tree.clone();
                let parent_tree = graph.get(parent)?.tree.clone();
                let outcome = merge_trees(
                    git,
                    registry,
                    owner,
                    (&base_tree, &base_id),
                    (&acc_tree, &acc_repr),
                    (&parent_tree, parent),
                )?;
                conflicts.extend(outcome.conflicts);
                driver_failures.extend(outcome.driver_failures);
                acc_tree = outcome.tree;
                acc_repr = parent.clone();
            }
            Ok(MergedParents {
                tree: acc_tree,
                conflicts,
                driver_failures,
            })
        }
    }
}

/// True when a change's tree equals the merge of its parents' trees.
pub fn compute_empty(
    graph: &ChangeGraph,
    git: &dyn GitStore,
    registry: &DriverRegistry,
    id: &ChangeId,
) -> RewriteResult<bool> {
    let parents = graph.get(id)?.parents.clone();
    let merged = merged_parent_tree(graph, git, registry, id, &parents)?;
    Ok(graph.get(id)?.tree == merged.tree)
}

#[derive(Debug, Default)]
pub struct RebaseOutcome {
    /// Changes whose tree was recomputed, in topological order. Every one
    /// of them needs a new commit projected.
    pub rebased: Vec<ChangeId>,
    pub new_conflicts: Vec<Conflict>,
    pub driver_failures: Vec<DriverFailure>,
}

impl RebaseOutcome {
    fn merge_from(&mut self, other: RebaseOutcome) {
        self.rebased.extend(other.rebased);
        self.new_conflicts.extend(other.new_conflicts);
        self.driver_failures.extend(other.driver_failures);
    }
}

/// Recomputes one change's tree after its parents (or their trees) moved:
/// a three-way merge of the change's content onto the new parent state.
fn reapply_change(
    view: &mut View,
    git: &dyn GitStore,
    registry: &DriverRegistry,
    id: &ChangeId,
    old_base_tree: &Tree,
    outcome: &mut RebaseOutcome,
) -> RewriteResult<()> {
    let old_tree = view.graph.get(id)?.tree.clone();
    let parents = view.graph.get(id)?.parents.clone();
    let new_base = merged_parent_tree(&view.graph, git, registry, id, &parents)?;
    let base_repr = parents
        .first()
        .cloned()
        .unwrap_or_else(ChangeGraph::root_change_id);
    let merged = merge_trees(
        git,
        registry,
        id,
        (old_base_tree, &base_repr),
        (&new_base.tree, &base_repr),
        (&old_tree, id),
    )?;
    let empty = merged.tree == new_base.tree;
    view.graph.apply_patch(
        id,
        crate::graph::ChangePatch {
            tree: Some(merged.tree),
            ..Default::default()
        },
    )?;
    for conflict in &merged.conflicts {
        view.conflicts.insert(conflict.clone());
    }
    let still_conflicted = !view.conflicts.for_change(id).is_empty();
    view.graph
        .set_flags(id, Some(empty), Some(still_conflicted))?;
    outcome.merge_from(RebaseOutcome {
        rebased: vec![id.clone()],
        new_conflicts: merged.conflicts,
        driver_failures: merged.driver_failures,
    });
    Ok(())
}

/// Rebases every descendant of `root` after `root` was rewritten.
/// `old_root_tree` is `root`'s tree before the rewrite so each descendant
/// merge sees the correct base. Runs inside the same operation as the
/// triggering rewrite.
#[instrument(skip_all)]
pub fn rebase_descendants(
    view: &mut View,
    git: &dyn GitStore,
    registry: &DriverRegistry,
    root: &ChangeId,
    old_root_tree: Tree,
) -> RewriteResult<RebaseOutcome> {
    let mut old_trees: HashMap<ChangeId, Tree> = HashMap::new();
    old_trees.insert(root.clone(), old_root_tree);
    let mut outcome = RebaseOutcome::default();
    for descendant in view.graph.descendants_topo(root) {
        if view.graph.get(&descendant)?.abandoned {
            continue;
        }
        let parents = view.graph.get(&descendant)?.parents.clone();
        let mut old_parent_trees = vec![];
        let mut any_parent_rewritten = false;
        for parent in &parents {
            if let Some(old) = old_trees.get(parent) {
                any_parent_rewritten = true;
                old_parent_trees.push(old.clone());
            } else {
                old_parent_trees.push(view.graph.get(parent)?.tree.clone());
            }
        }
        if !any_parent_rewritten {
            continue;
        }
        // The base is the parents' merged state before this cascade.
        let old_base_tree =
            merge_tree_snapshots(view, git, registry, &descendant, &parents, old_parent_trees)?;
        let old_tree = view.graph.get(&descendant)?.tree.clone();
        reapply_change(view, git, registry, &descendant, &old_base_tree, &mut outcome)?;
        old_trees.insert(descendant, old_tree);
    }
    Ok(outcome)
}

fn merge_tree_snapshots(
    view: &View,
    git: &dyn GitStore,
    registry: &DriverRegistry,
    owner: &ChangeId,
    parents: &[ChangeId],
    trees: Vec<Tree>,
) -> RewriteResult<Tree> {
    let mut iter = trees.into_iter();
    let mut acc = iter.next().unwrap_or_default();
    let mut acc_repr = parents
        .first()
        .cloned()
        .unwrap_or_else(ChangeGraph::root_change_id);
    for (tree, parent) in iter.zip(parents.iter().skip(1)) {
        let base_id = view
            .graph
            .common_ancestor(&[acc_repr.clone(), parent.clone()])
            .unwrap_or_else(ChangeGraph::root_change_id);
        let base_tree = view.graph.get(&base_id)?.tree.clone();
        let outcome = merge_trees(
            git,
            registry,
            owner,
            (&base_tree, &base_id),
            (&acc, &acc_repr),
            (&tree, parent),
        )?;
        acc = outcome.tree;
        acc_repr = parent.clone();
    }
    Ok(acc)
}

/// Moves a change onto new parents and reapplies its content, then rebases
/// its descendants. This is `rebase` (and its thin alias `move`).
pub fn rebase_change(
    view: &mut View,
    git: &dyn GitStore,
    registry: &DriverRegistry,
    id: &ChangeId,
    new_parents: Vec<ChangeId>,
) -> RewriteResult<RebaseOutcome> {
    let old_parents = view.graph.get(id)?.parents.clone();
    let old_base = merged_parent_tree(&view.graph, git, registry, id, &old_parents)?;
    rebase_onto_with_base(view, git, registry, id, new_parents, old_base.tree)
}

/// Like [`rebase_change`] but with an explicit pre-move base tree. Callers
/// that already rewrote the old parent (split does) pass the snapshot they
/// captured.
pub fn rebase_onto_with_base(
    view: &mut View,
    git: &dyn GitStore,
    registry: &DriverRegistry,
    id: &ChangeId,
    new_parents: Vec<ChangeId>,
    old_base_tree: Tree,
) -> RewriteResult<RebaseOutcome> {
    let old_tree = view.graph.get(id)?.tree.clone();
    view.graph.set_parents(id, new_parents)?;
    let mut outcome = RebaseOutcome::default();
    reapply_change(view, git, registry, id, &old_base_tree, &mut outcome)?;
    let descendant_outcome = rebase_descendants(view, git, registry, id, old_tree)?;
    outcome.merge_from(descendant_outcome);
    Ok(outcome)
}

/// Marks a change abandoned, drops its conflicts, and moves its children
/// onto its parent set so the DAG stays connected.
pub fn abandon_change(
    view: &mut View,
    git: &dyn GitStore,
    registry: &DriverRegistry,
    id: &ChangeId,
) -> RewriteResult<RebaseOutcome> {
    let children: Vec<ChangeId> = view
        .graph
        .children_index()
        .get(id)
        .cloned()
        .unwrap_or_default();
    let replacement_parents = view.graph.get(id)?.parents.clone();
    view.graph.abandon(id)?;
    view.conflicts.remove_for_change(id);
    view.graph.set_flags(id, None, Some(false))?;
    let mut outcome = RebaseOutcome::default();
    for child in children {
        if view.graph.get(&child)?.abandoned {
            continue;
        }
        let mut new_parents: Vec<ChangeId> = vec![];
        for parent in view.graph.get(&child)?.parents.clone() {
            if parent == *id {
                for grandparent in &replacement_parents {
                    if !new_parents.contains(grandparent) {
                        new_parents.push(grandparent.clone());
                    }
                }
            } else if !new_parents.contains(&parent) {
                new_parents.push(parent);
            }
        }
        // Splicing can demote a former merge parent to an ancestor of
        // another; keep only the heads.
        let graph = &view.graph;
        new_parents = crate::dag_walk::heads(
            new_parents,
            |p| p.clone(),
            |p| graph.get(p).map(|c| c.parents.clone()).unwrap_or_default(),
        );
        let child_outcome = rebase_change(view, git, registry, &child, new_parents)?;
        outcome.merge_from(child_outcome);
    }
    Ok(outcome)
}
