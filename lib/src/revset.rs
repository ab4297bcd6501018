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

//! Revset evaluation: a small algebraic language over the change graph.
//!
//! Evaluation returns an ordered set: topological order (children before
//! parents), ties broken by committer timestamp descending then change id
//! ascending.

use std::collections::HashSet;
use std::rc::Rc;

use itertools::Itertools as _;
use thiserror::Error;

use crate::backend::{ChangeId, MillisSinceEpoch, Timestamp};
use crate::error::{ClassifiedError, ErrorKind};
use crate::object_id::{resolve_prefix, HexPrefix, PrefixResolution};
use crate::op_store::View;
use crate::revset_parser::{self, RevsetParseError};
use crate::str_util::StringPattern;

#[derive(Debug, Error)]
pub enum RevsetError {
    #[error(transparent)]
    Parse(#[from] RevsetParseError),
    #[error("Revision \"{0}\" doesn't exist")]
    NoSuchRevision(String),
    #[error("Change id prefix \"{0}\" is ambiguous")]
    AmbiguousIdPrefix(String),
}

impl ClassifiedError for RevsetError {
    fn kind(&self) -> ErrorKind {
        match self {
            RevsetError::Parse(err) => err.kind(),
            RevsetError::NoSuchRevision(_) => ErrorKind::NotFound,
            RevsetError::AmbiguousIdPrefix(_) => ErrorKind::NotFound,
        }
    }

    fn context(&self) -> Option<String> {
        match self {
            RevsetError::NoSuchRevision(symbol) | RevsetError::AmbiguousIdPrefix(symbol) => {
                Some(symbol.clone())
            }
            RevsetError::Parse(err) => err.context(),
        }
    }

    fn suggestion(&self) -> Option<String> {
        match self {
            RevsetError::NoSuchRevision(_) => {
                Some("Use a bookmark name, a tag, or a change id prefix".to_owned())
            }
            RevsetError::AmbiguousIdPrefix(_) => Some("Add more hex digits".to_owned()),
            RevsetError::Parse(err) => err.suggestion(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastArg {
    Count(usize),
    /// Milliseconds back from "now".
    Duration(i64),
}

#[derive(Debug, Clone)]
pub enum RevsetExpression {
    All,
    None,
    WorkingCopy,
    Symbol(String),
    Ancestors(Rc<RevsetExpression>),
    Descendants(Rc<RevsetExpression>),
    Roots(Rc<RevsetExpression>),
    Heads(Rc<RevsetExpression>),
    Parents(Rc<RevsetExpression>),
    Children(Rc<RevsetExpression>),
    Connected(Rc<RevsetExpression>),
    CommonAncestor(Rc<RevsetExpression>),
    Range(Rc<RevsetExpression>, Rc<RevsetExpression>),
    DivergePoint(Rc<RevsetExpression>, Rc<RevsetExpression>),
    Latest(usize),
    Last(LastArg),
    Author(StringPattern),
    Description(StringPattern),
    File(StringPattern),
    Empty,
    Mine,
    Merge,
    Bookmarks,
    Bookmark(String),
    Tags,
    Since(MillisSinceEpoch),
    Between(MillisSinceEpoch, MillisSinceEpoch),
    Union(Rc<RevsetExpression>, Rc<RevsetExpression>),
    Intersection(Rc<RevsetExpression>, Rc<RevsetExpression>),
    Difference(Rc<RevsetExpression>, Rc<RevsetExpression>),
    Complement(Rc<RevsetExpression>),
}

/// Everything evaluation needs besides the expression itself.
pub struct RevsetContext<'a> {
    pub view: &'a View,
    /// `mine()` matches this author email.
    pub user_email: String,
    /// Reference point for `last(7d)`-style windows.
    pub now: Timestamp,
}

/// Parses and evaluates in one step.
pub fn evaluate_str(text: &str, context: &RevsetContext<'_>) -> Result<Vec<ChangeId>, RevsetError> {
    let expression = revset_parser::parse(text)?;
    evaluate(&expression, context)
}

/// Evaluates an expression to an ordered list of change ids.
pub fn evaluate(
    expression: &RevsetExpression,
    context: &RevsetContext<'_>,
) -> Result<Vec<ChangeId>, RevsetError> {
    let set = evaluate_set(expression, context)?;
    let order = context.view.graph.topo_sorted_ids();
    Ok(order.into_iter().filter(|id| set.contains(id)).collect())
}

fn ids_vec(set: &HashSet<ChangeId>) -> Vec<ChangeId> {
    set.iter().cloned().collect()
}

fn resolve_symbol(symbol: &str, context: &RevsetContext<'_>) -> Result<ChangeId, RevsetError> {
    let view = context.view;
    if let Some(bookmark) = view.bookmarks.get(symbol, None) {
        return Ok(bookmark.target.clone());
    }
    // `origin/main` style remote bookmarks.
    if let Some((remote, name)) = symbol.split_once('/') {
        if let Some(bookmark) = view.bookmarks.get(name, Some(remote)) {
            return Ok(bookmark.target.clone());
        }
    }
    if let Some(target) = view.graph.tags().get(symbol) {
        return Ok(target.clone());
    }
    if let Some(prefix) = HexPrefix::new(symbol) {
        match resolve_prefix(&prefix, view.graph.change_ids().cloned()) {
            PrefixResolution::SingleMatch(id) => return Ok(id),
            PrefixResolution::AmbiguousMatch => {
                return Err(RevsetError::AmbiguousIdPrefix(symbol.to_owned()))
            }
            PrefixResolution::NoMatch => {}
        }
    }
    Err(RevsetError::NoSuchRevision(symbol.to_owned()))
}

fn visible_ids(context: &RevsetContext<'_>) -> HashSet<ChangeId> {
    context
        .view
        .graph
        .iter()
        .filter(|change| !change.abandoned)
        .map(|change| change.change_id.clone())
        .collect()
}

fn all_ids(context: &RevsetContext<'_>) -> HashSet<ChangeId> {
    context.view.graph.change_ids().cloned().collect()
}

fn filter_changes(
    context: &RevsetContext<'_>,
    predicate: impl Fn(&crate::graph::Change) -> bool,
) -> HashSet<ChangeId> {
    context
        .view
        .graph
        .iter()
        .filter(|change| !change.abandoned && predicate(change))
        .map(|change| change.change_id.clone())
        .collect()
}

/// Paths a change touched relative to its parents: entries not inherited
/// from any parent (or all paths, for parentless changes).
fn changed_paths(view: &View, change: &crate::graph::Change) -> Vec<String> {
    if change.parents.is_empty() {
        return change.tree.paths().cloned().collect();
    }
    let parent_trees: Vec<_> = change
        .parents
        .iter()
        .filter_map(|parent| view.graph.get(parent).ok())
        .map(|parent| &parent.tree)
        .collect();
    let mut paths = vec![];
    for (path, entry) in change.tree.entries() {
        if parent_trees.iter().all(|tree| tree.get(path) != Some(entry)) {
            paths.push(path.clone());
        }
    }
    for tree in &parent_trees {
        for path in tree.paths() {
            if change.tree.get(path).is_none() && !paths.contains(path) {
                paths.push(path.clone());
            }
        }
    }
    paths
}

fn evaluate_set(
    expression: &RevsetExpression,
    context: &RevsetContext<'_>,
) -> Result<HashSet<ChangeId>, RevsetError> {
    let view = context.view;
    let graph = &view.graph;
    let set = match expression {
        RevsetExpression::All => all_ids(context),
        RevsetExpression::None => HashSet::new(),
        RevsetExpression::WorkingCopy => [graph.working_copy_id().clone()].into(),
        RevsetExpression::Symbol(symbol) => [resolve_symbol(symbol, context)?].into(),
        RevsetExpression::Ancestors(inner) => {
            graph.ancestors(&ids_vec(&evaluate_set(inner, context)?))
        }
        RevsetExpression::Descendants(inner) => {
            graph.descendants(&ids_vec(&evaluate_set(inner, context)?))
        }
        RevsetExpression::Roots(inner) => {
            graph.roots_of(&evaluate_set(inner, context)?)
        }
        RevsetExpression::Heads(inner) => {
            let members = evaluate_set(inner, context)?;
            let visible: HashSet<ChangeId> = members
                .into_iter()
                .filter(|id| graph.get(id).map(|c| !c.abandoned).unwrap_or(false))
                .collect();
            graph.heads_of(&visible)
        }
        RevsetExpression::Parents(inner) => {
            let members = evaluate_set(inner, context)?;
            members
                .iter()
                .filter_map(|id| graph.get(id).ok())
                .flat_map(|change| change.parents.iter().cloned())
                .collect()
        }
        RevsetExpression::Children(inner) => {
            let members = evaluate_set(inner, context)?;
            let children = graph.children_index();
            members
                .iter()
                .flat_map(|id| children.get(id).cloned().unwrap_or_default())
                .collect()
        }
        RevsetExpression::Connected(inner) => {
            let members = evaluate_set(inner, context)?;
            let ids = ids_vec(&members);
            let ancestors = graph.ancestors(&ids);
            let descendants = graph.descendants(&ids);
            members
                .union(&ancestors.intersection(&descendants).cloned().collect())
                .cloned()
                .collect()
        }
        RevsetExpression::CommonAncestor(inner) => {
            let members = evaluate_set(inner, context)?;
            graph
                .common_ancestor(&ids_vec(&members))
                .into_iter()
                .collect()
        }
        RevsetExpression::DivergePoint(a, b) => {
            let mut members = ids_vec(&evaluate_set(a, context)?);
            members.extend(ids_vec(&evaluate_set(b, context)?));
            graph.common_ancestor(&members).into_iter().collect()
        }
        RevsetExpression::Range(a, b) => {
            let a = ids_vec(&evaluate_set(a, context)?);
            let b = ids_vec(&evaluate_set(b, context)?);
            graph.range(&a, &b)
        }
        RevsetExpression::Latest(n) => latest_of(visible_ids(context), context, *n),
        RevsetExpression::Last(LastArg::Count(n)) => {
            latest_of(visible_ids(context), context, *n)
        }
        RevsetExpression::Last(LastArg::Duration(millis)) => {
            let cutoff = MillisSinceEpoch(context.now.timestamp.0 - millis);
            filter_changes(context, |change| change.committer.timestamp.timestamp >= cutoff)
        }
        RevsetExpression::Author(pattern) => filter_changes(context, |change| {
            pattern.matches(&change.author.name) || pattern.matches(&change.author.email)
        }),
        RevsetExpression::Description(pattern) => {
            filter_changes(context, |change| pattern.matches(&change.description))
        }
        RevsetExpression::File(pattern) => filter_changes(context, |change| {
            changed_paths(view, change)
                .iter()
                .any(|path| pattern.matches(path))
        }),
        RevsetExpression::Empty => filter_changes(context, |change| change.empty),
        RevsetExpression::Mine => {
            filter_changes(context, |change| change.author.email == context.user_email)
        }
        RevsetExpression::Merge => filter_changes(context, |change| change.parents.len() >= 2),
        RevsetExpression::Bookmarks => view
            .bookmarks
            .local_bookmarks()
            .map(|bookmark| bookmark.target.clone())
            .collect(),
        RevsetExpression::Bookmark(name) => {
            let bookmark = view
                .bookmarks
                .get(name, None)
                .ok_or_else(|| RevsetError::NoSuchRevision(name.clone()))?;
            [bookmark.target.clone()].into()
        }
        RevsetExpression::Tags => graph.tags().values().cloned().collect(),
        RevsetExpression::Since(cutoff) => filter_changes(context, |change| {
            change.committer.timestamp.timestamp >= *cutoff
        }),
        RevsetExpression::Between(start, end) => filter_changes(context, |change| {
            change.committer.timestamp.timestamp >= *start
                && change.committer.timestamp.timestamp <= *end
        }),
        RevsetExpression::Union(a, b) => {
            let mut set = evaluate_set(a, context)?;
            set.extend(evaluate_set(b, context)?);
            set
        }
        RevsetExpression::Intersection(a, b) => {
            let a = evaluate_set(a, context)?;
            let b = evaluate_set(b, context)?;
            a.intersection(&b).cloned().collect()
        }
        RevsetExpression::Difference(a, b) => {
            let a = evaluate_set(a, context)?;
            let b = evaluate_set(b, context)?;
            a.difference(&b).cloned().collect()
        }
        RevsetExpression::Complement(inner) => {
            let inner = evaluate_set(inner, context)?;
            all_ids(context)
                .difference(&inner)
                .cloned()
                .collect()
        }
    };
    Ok(set)
}

fn latest_of(
    candidates: HashSet<ChangeId>,
    context: &RevsetContext<'_>,
    n: usize,
) -> HashSet<ChangeId> {
    let graph = &context.view.graph;
    candidates
        .into_iter()
        .sorted_by(|a, b| {
            let change_a = graph.get(a).unwrap();
            let change_b = graph.get(b).unwrap();
            change_b
                .committer
                .timestamp
                .cmp(&change_a.committer.timestamp)
                // Timestamp ties resolve by lexicographic change id.
                .then_with(|| a.cmp(b))
        })
        .take(n)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Signature, Tree};
    use crate::graph::ChangeGraph;
    use crate::object_id::ObjectId as _;
    use crate::refs::Bookmark;

    fn signature(email: &str, millis: i64) -> Signature {
        Signature {
            name: email.split('@').next().unwrap().to_owned(),
            email: email.to_owned(),
            timestamp: Timestamp {
                timestamp: MillisSinceEpoch(millis),
                tz_offset: 0,
            },
        }
    }

    fn change_id(byte: u8) -> ChangeId {
        ChangeId::from_bytes(&[byte; 32])
    }

    /// root <- 1 <- 2 <- 3, with 1 and 3 by alice, 2 by bob.
    fn test_view() -> View {
        let mut view = View::empty(signature("alice@example.com", 0));
        let mut parent = ChangeGraph::root_change_id();
        for i in 1..=3u8 {
            let email = if i % 2 == 1 {
                "alice@example.com"
            } else {
                "bob@example.com"
            };
            let sig = signature(email, i as i64 * 1000);
            view.graph
                .create(
                    change_id(i),
                    vec![parent.clone()],
                    format!("change {i}"),
                    sig.clone(),
                    sig,
                    Tree::default(),
                )
                .unwrap();
            parent = change_id(i);
        }
        view.graph.set_working_copy(change_id(3)).unwrap();
        view.bookmarks.upsert(Bookmark::local("main", change_id(2)));
        view
    }

    fn ctx(view: &View) -> RevsetContext<'_> {
        RevsetContext {
            view,
            user_email: "alice@example.com".to_owned(),
            now: Timestamp {
                timestamp: MillisSinceEpoch(10_000),
                tz_offset: 0,
            },
        }
    }

    #[test]
    fn test_working_copy_and_postfix() {
        let view = test_view();
        let result = evaluate_str("@", &ctx(&view)).unwrap();
        assert_eq!(result, vec![change_id(3)]);
        let result = evaluate_str("@-", &ctx(&view)).unwrap();
        assert_eq!(result, vec![change_id(2)]);
        let result = evaluate_str("@--", &ctx(&view)).unwrap();
        assert_eq!(result, vec![change_id(1)]);
        let result = evaluate_str("@-+", &ctx(&view)).unwrap();
        assert_eq!(result, vec![change_id(3)]);
    }

    #[test]
    fn test_symbol_resolution() {
        let view = test_view();
        // Bookmark, then change id prefix.
        assert_eq!(
            evaluate_str("main", &ctx(&view)).unwrap(),
            vec![change_id(2)]
        );
        let prefix = change_id(1).hex()[..8].to_owned();
        assert_eq!(
            evaluate_str(&prefix, &ctx(&view)).unwrap(),
            vec![change_id(1)]
        );
        assert!(matches!(
            evaluate_str("nonexistent", &ctx(&view)),
            Err(RevsetError::NoSuchRevision(_))
        ));
        // The root change id (all zeros) makes "00" ambiguous with nothing
        // else, so it resolves.
        assert_eq!(
            evaluate_str("00", &ctx(&view)).unwrap(),
            vec![ChangeGraph::root_change_id()]
        );
    }

    #[test]
    fn test_set_algebra() {
        let view = test_view();
        let context = ctx(&view);
        let a = evaluate_str("author(alice) | author(bob)", &context).unwrap();
        let b = evaluate_str("author(bob) | author(alice)", &context).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            evaluate_str("all() & all()", &context).unwrap(),
            evaluate_str("all()", &context).unwrap()
        );
        assert_eq!(evaluate_str("all() ~ all()", &context).unwrap(), vec![]);
    }

    #[test]
    fn test_ordering_is_topological_newest_first() {
        let view = test_view();
        let result = evaluate_str("all()", &ctx(&view)).unwrap();
        assert_eq!(
            result,
            vec![
                change_id(3),
                change_id(2),
                change_id(1),
                ChangeGraph::root_change_id()
            ]
        );
    }

    #[test]
    fn test_filters() {
        let view = test_view();
        let context = ctx(&view);
        assert_eq!(
            evaluate_str("mine()", &context).unwrap(),
            vec![change_id(3), change_id(1)]
        );
        assert_eq!(
            evaluate_str("description(\"change 2\")", &context).unwrap(),
            vec![change_id(2)]
        );
        assert_eq!(evaluate_str("merge()", &context).unwrap(), vec![]);
        // Every change in the fixture has an empty tree.
        assert_eq!(evaluate_str("empty() & @", &context).unwrap(), vec![change_id(3)]);
    }

    #[test]
    fn test_latest_and_last() {
        let view = test_view();
        let context = ctx(&view);
        assert_eq!(
            evaluate_str("latest(2)", &context).unwrap(),
            vec![change_id(3), change_id(2)]
        );
        // All three non-root changes are within the window; "now" is 10s.
        assert_eq!(evaluate_str("last(1h)", &context).unwrap().len(), 4);
    }

    #[test]
    fn test_bookmarks_and_heads() {
        let view = test_view();
        let context = ctx(&view);
        assert_eq!(
            evaluate_str("bookmarks()", &context).unwrap(),
            vec![change_id(2)]
        );
        assert_eq!(
            evaluate_str("bookmark(main)", &context).unwrap(),
            vec![change_id(2)]
        );
        assert_eq!(
            evaluate_str("heads()", &context).unwrap(),
            vec![change_id(3)]
        );
        assert_eq!(
            evaluate_str("roots(all() ~ 00)", &context).unwrap(),
            vec![change_id(1)]
        );
    }

    #[test]
    fn test_range_and_common_ancestor() {
        let view = test_view();
        let context = ctx(&view);
        let result = evaluate_str("range(11, @)", &context).unwrap();
        assert_eq!(result, vec![change_id(3), change_id(2)]);
        assert_eq!(
            evaluate_str("common_ancestor(@ | main)", &context).unwrap(),
            vec![change_id(2)]
        );
    }
}
