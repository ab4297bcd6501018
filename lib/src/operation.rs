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

//! The in-memory operation log: a DAG of operation records (usually
//! linear) with an undo cursor. Provides the chain walking, replay, and
//! history-editing primitives the repository facade builds undo/redo and
//! time-travel from.

use indexmap::IndexMap;
use thiserror::Error;

use crate::backend::OperationId;
use crate::dag_walk;
use crate::error::{ClassifiedError, ErrorKind};
use crate::graph::GraphError;
use crate::object_id::ObjectId as _;
use crate::op_store::{
    apply_delta, ApplyDirection, OpHeads, OpStoreError, Operation, View,
};

#[derive(Debug, Error)]
pub enum OpLogError {
    #[error(transparent)]
    Store(#[from] OpStoreError),
    #[error("Cannot walk back {requested} operations; only {available} available")]
    NotEnoughHistory { requested: usize, available: usize },
    #[error("Abandoning operation {op_id} would break history: {source}")]
    WouldBreakHistory {
        op_id: String,
        #[source]
        source: GraphError,
    },
    #[error("The operation log is empty")]
    Empty,
}

impl ClassifiedError for OpLogError {
    fn kind(&self) -> ErrorKind {
        match self {
            OpLogError::Store(err) => err.kind(),
            OpLogError::NotEnoughHistory { .. } => ErrorKind::InvalidArgument,
            OpLogError::WouldBreakHistory { .. } => ErrorKind::Conflict,
            OpLogError::Empty => ErrorKind::NotFound,
        }
    }

    fn context(&self) -> Option<String> {
        match self {
            OpLogError::WouldBreakHistory { op_id, .. } => Some(op_id.clone()),
            OpLogError::Store(err) => err.context(),
            _ => None,
        }
    }
}

pub type OpLogResult<T> = Result<T, OpLogError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpLog {
    operations: IndexMap<OperationId, Operation>,
    heads: OpHeads,
}

impl OpLog {
    pub fn new(init_operation: Operation) -> Self {
        let heads = OpHeads {
            current: init_operation.op_id.clone(),
            cursor: init_operation.op_id.clone(),
            siblings: vec![],
        };
        let mut operations = IndexMap::new();
        operations.insert(init_operation.op_id.clone(), init_operation);
        OpLog { operations, heads }
    }

    pub fn load(log_bytes: &[u8], heads: OpHeads) -> OpLogResult<Self> {
        let mut operations = IndexMap::new();
        for line in log_bytes.split(|b| *b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let operation = Operation::from_line(line)?;
            operations.insert(operation.op_id.clone(), operation);
        }
        if operations.is_empty() {
            return Err(OpLogError::Empty);
        }
        Ok(OpLog { operations, heads })
    }

    /// The full log re-serialized, for history rewrites (operation
    /// abandon). Normal appends go through [`Operation::to_line`].
    pub fn to_log_bytes(&self) -> OpLogResult<Vec<u8>> {
        let mut bytes = vec![];
        for operation in self.operations.values() {
            bytes.extend(operation.to_line()?);
            bytes.push(b'\n');
        }
        Ok(bytes)
    }

    pub fn heads(&self) -> &OpHeads {
        &self.heads
    }

    pub fn head_id(&self) -> &OperationId {
        &self.heads.current
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn get(&self, id: &OperationId) -> OpLogResult<&Operation> {
        self.operations
            .get(id)
            .ok_or_else(|| OpLogError::Store(OpStoreError::NotFound(id.hex())))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.operations.values()
    }

    /// Appends a committed operation, advances the head, and resets the
    /// undo cursor to it.
    pub fn append(&mut self, operation: Operation) {
        self.heads.current = operation.op_id.clone();
        self.heads.cursor = operation.op_id.clone();
        self.operations
            .insert(operation.op_id.clone(), operation);
    }

    /// Like [`Self::append`] but keeps a caller-chosen cursor; undo and
    /// restore position the cursor themselves.
    pub fn append_with_cursor(&mut self, operation: Operation, cursor: OperationId) {
        self.heads.current = operation.op_id.clone();
        self.heads.cursor = cursor;
        self.operations
            .insert(operation.op_id.clone(), operation);
    }

    pub fn cursor(&self) -> &OperationId {
        &self.heads.cursor
    }

    /// Moves the head (and cursor) to an existing operation, as sibling
    /// reconciliation does.
    pub fn set_head(&mut self, id: OperationId) {
        self.heads.cursor = id.clone();
        self.heads.current = id;
    }

    pub fn record_sibling(&mut self, id: OperationId) {
        if !self.heads.siblings.contains(&id) {
            self.heads.siblings.push(id);
        }
    }

    /// All ancestors of `id` (inclusive) in topological order, oldest
    /// first. This is the replay order.
    pub fn ancestor_chain(&self, id: &OperationId) -> OpLogResult<Vec<&Operation>> {
        self.get(id)?;
        let ids = dag_walk::topo_order_forward(
            vec![id.clone()],
            |op_id| op_id.clone(),
            |op_id| self.operations[op_id].parents.clone(),
        );
        Ok(ids.iter().map(|op_id| &self.operations[op_id]).collect())
    }

    /// Rebuilds the repo view as of `id` by replaying forward effects from
    /// the root.
    pub fn replay(&self, id: &OperationId) -> OpLogResult<View> {
        let mut view = View::bare();
        for operation in self.ancestor_chain(id)? {
            apply_delta(&mut view, operation.payload.effects(), ApplyDirection::Forward);
        }
        Ok(view)
    }

    /// The `n` operations leading up to (and including) the undo cursor,
    /// newest first: the list `undo(n)` applies inverses of.
    pub fn walk_back(&self, n: usize) -> OpLogResult<Vec<&Operation>> {
        let mut result = vec![];
        let mut cursor = self.heads.cursor.clone();
        for _ in 0..n {
            let operation = self.get(&cursor)?;
            result.push(operation);
            match operation.parents.first() {
                Some(parent) => cursor = parent.clone(),
                None => {
                    return Err(OpLogError::NotEnoughHistory {
                        requested: n,
                        available: result.len() - 1,
                    })
                }
            }
        }
        Ok(result)
    }

    /// Removes one record and relinks its children to its parents. Ids are
    /// stable: children keep their recorded ids. Fails with `CONFLICT` if
    /// replaying the remaining chain would leave the graph inconsistent.
    pub fn abandon(&mut self, id: &OperationId) -> OpLogResult<()> {
        let target = self.get(id)?.clone();
        let mut candidate = self.clone();
        candidate.operations.shift_remove(id);
        for operation in candidate.operations.values_mut() {
            if let Some(position) = operation.parents.iter().position(|p| p == id) {
                operation.parents.remove(position);
                for (offset, parent) in target.parents.iter().enumerate() {
                    if !operation.parents.contains(parent) {
                        operation.parents.insert(position + offset, parent.clone());
                    }
                }
            }
        }
        if candidate.heads.current == *id {
            match target.parents.first() {
                Some(parent) => candidate.heads.current = parent.clone(),
                None => return Err(OpLogError::Empty),
            }
        }
        if candidate.heads.cursor == *id {
            candidate.heads.cursor = candidate.heads.current.clone();
        }
        candidate.heads.siblings.retain(|sibling| sibling != id);

        // Re-application must still produce a coherent graph.
        let replayed = candidate.replay(&candidate.heads.current.clone())?;
        replayed
            .graph
            .check_integrity()
            .map_err(|source| OpLogError::WouldBreakHistory {
                op_id: id.hex(),
                source,
            })?;
        *self = candidate;
        Ok(())
    }
}

/// Computes the combined view reached by undoing `operations` (newest
/// first) starting from `view`.
pub fn apply_inverses(view: &mut View, operations: &[&Operation]) {
    for operation in operations {
        apply_delta(view, operation.payload.effects(), ApplyDirection::Inverse);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MillisSinceEpoch;
    use crate::op_store::{OperationPayload, RepoDelta};

    fn make_op(parents: Vec<OperationId>, user: &str, millis: i64) -> Operation {
        Operation::new(
            parents,
            MillisSinceEpoch(millis),
            0,
            user.to_owned(),
            format!("op at {millis}"),
            OperationPayload::Snapshot {
                change_id: crate::backend::ChangeId::from_bytes(&[1; 32]),
                effects: RepoDelta::default(),
            },
        )
        .unwrap()
    }

    fn linear_log(n: usize) -> OpLog {
        let init = make_op(vec![], "alice", 0);
        let mut log = OpLog::new(init);
        for i in 1..n {
            let parent = log.head_id().clone();
            log.append(make_op(vec![parent], "alice", i as i64));
        }
        log
    }

    #[test]
    fn test_walk_back() {
        let log = linear_log(4);
        let walked = log.walk_back(2).unwrap();
        assert_eq!(walked.len(), 2);
        assert_eq!(walked[0].op_id, *log.head_id());
        assert!(matches!(
            log.walk_back(5),
            Err(OpLogError::NotEnoughHistory { .. })
        ));
    }

    #[test]
    fn test_ancestor_chain_is_oldest_first() {
        let log = linear_log(3);
        let chain = log.ancestor_chain(log.head_id()).unwrap();
        assert_eq!(chain.len(), 3);
        assert!(chain[0].parents.is_empty());
        assert_eq!(chain[2].op_id, *log.head_id());
    }

    #[test]
    fn test_abandon_relinks_children() {
        // O1 <- O2 <- O3; abandoning O2 gives O3.parents == [O1].
        let log = linear_log(3);
        let ids: Vec<OperationId> = log.iter().map(|op| op.op_id.clone()).collect();
        let (o1, o2, o3) = (ids[0].clone(), ids[1].clone(), ids[2].clone());
        let mut log = log;
        log.abandon(&o2).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(*log.head_id(), o3);
        assert_eq!(log.get(&o3).unwrap().parents, vec![o1]);
        assert!(log.get(&o2).is_err());
    }

    #[test]
    fn test_abandon_head_moves_cursor_to_parent() {
        let log = linear_log(2);
        let ids: Vec<OperationId> = log.iter().map(|op| op.op_id.clone()).collect();
        let mut log = log;
        log.abandon(&ids[1]).unwrap();
        assert_eq!(*log.head_id(), ids[0]);
    }

    #[test]
    fn test_log_round_trip() {
        let log = linear_log(3);
        let bytes = log.to_log_bytes().unwrap();
        let loaded = OpLog::load(&bytes, log.heads().clone()).unwrap();
        assert_eq!(loaded, log);
    }
}
