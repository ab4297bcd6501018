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

//! General-purpose DAG algorithms.

use std::collections::HashSet;
use std::hash::Hash;
use std::iter;

/// Traverses nodes from `start` in depth-first order.
pub fn dfs<T, ID, II, NI>(
    start: II,
    id_fn: impl Fn(&T) -> ID,
    mut neighbors_fn: impl FnMut(&T) -> NI,
) -> impl Iterator<Item = T>
where
    ID: Hash + Eq,
    II: IntoIterator<Item = T>,
    NI: IntoIterator<Item = T>,
{
    let mut work: Vec<T> = start.into_iter().collect();
    let mut visited: HashSet<ID> = HashSet::new();
    iter::from_fn(move || loop {
        let c = work.pop()?;
        let id = id_fn(&c);
        if visited.contains(&id) {
            continue;
        }
        for p in neighbors_fn(&c) {
            work.push(p);
        }
        visited.insert(id);
        return Some(c);
    })
}

/// Builds a list of nodes reachable from the `start` where neighbors come
/// before the node itself.
///
/// Panics if the graph has a cycle.
pub fn topo_order_forward<T, ID, II, NI>(
    start: II,
    id_fn: impl Fn(&T) -> ID,
    mut neighbors_fn: impl FnMut(&T) -> NI,
) -> Vec<T>
where
    ID: Hash + Eq + Clone,
    II: IntoIterator<Item = T>,
    NI: IntoIterator<Item = T>,
{
    let mut stack: Vec<(T, bool)> = start.into_iter().map(|node| (node, false)).collect();
    let mut visiting = HashSet::new();
    let mut emitted = HashSet::new();
    let mut result = vec![];
    while let Some((node, neighbors_visited)) = stack.pop() {
        let id = id_fn(&node);
        if emitted.contains(&id) {
            continue;
        }
        if !neighbors_visited {
            assert!(visiting.insert(id.clone()), "graph has cycle");
            let neighbors_iter = neighbors_fn(&node).into_iter();
            stack.reserve(neighbors_iter.size_hint().0 + 1);
            stack.push((node, true));
            for neighbor in neighbors_iter {
                stack.push((neighbor, false));
            }
        } else {
            visiting.remove(&id);
            emitted.insert(id);
            result.push(node);
        }
    }
    result
}

/// Builds a list of nodes reachable from the `start` where neighbors come
/// after the node itself.
pub fn topo_order_reverse<T, ID, II, NI>(
    start: II,
    id_fn: impl Fn(&T) -> ID,
    neighbors_fn: impl FnMut(&T) -> NI,
) -> Vec<T>
where
    ID: Hash + Eq + Clone,
    II: IntoIterator<Item = T>,
    NI: IntoIterator<Item = T>,
{
    let mut result = topo_order_forward(start, id_fn, neighbors_fn);
    result.reverse();
    result
}

/// Returns true if the graph reachable from `start` contains a cycle.
pub fn has_cycle<T, ID, NI>(
    start: impl IntoIterator<Item = T>,
    id_fn: impl Fn(&T) -> ID,
    mut neighbors_fn: impl FnMut(&T) -> NI,
) -> bool
where
    ID: Hash + Eq + Clone,
    NI: IntoIterator<Item = T>,
{
    // Iterative DFS coloring: `visiting` holds the current path.
    let mut visiting: HashSet<ID> = HashSet::new();
    let mut done: HashSet<ID> = HashSet::new();
    let mut stack: Vec<(T, bool)> = start.into_iter().map(|node| (node, false)).collect();
    while let Some((node, neighbors_visited)) = stack.pop() {
        let id = id_fn(&node);
        if neighbors_visited {
            visiting.remove(&id);
            done.insert(id);
            continue;
        }
        if done.contains(&id) {
            continue;
        }
        if !visiting.insert(id.clone()) {
            return true;
        }
        let neighbors: Vec<T> = neighbors_fn(&node).into_iter().collect();
        for neighbor in &neighbors {
            if visiting.contains(&id_fn(neighbor)) {
                return true;
            }
        }
        stack.push((node, true));
        for neighbor in neighbors {
            stack.push((neighbor, false));
        }
    }
    false
}

/// Removes the ancestors of other nodes from `items`, leaving only the
/// heads of the induced subgraph.
pub fn heads<T, ID, NI>(
    items: impl IntoIterator<Item = T>,
    id_fn: impl Fn(&T) -> ID,
    mut neighbors_fn: impl FnMut(&T) -> NI,
) -> Vec<T>
where
    T: Clone,
    ID: Hash + Eq + Clone,
    NI: IntoIterator<Item = T>,
{
    let items: Vec<T> = items.into_iter().collect();
    let mut reachable_from_other: HashSet<ID> = HashSet::new();
    for item in &items {
        for ancestor in dfs(neighbors_fn(item), &id_fn, &mut neighbors_fn) {
            reachable_from_other.insert(id_fn(&ancestor));
        }
    }
    items
        .into_iter()
        .filter(|item| !reachable_from_other.contains(&id_fn(item)))
        .collect()
}
