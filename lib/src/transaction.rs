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

//! A mutation in flight: a mutable copy of the repo view plus buffered
//! intent. Nothing is visible to readers or the filesystem until the
//! repository commits the transaction; dropping it rolls everything back.

use crate::backend::ChangeId;
use crate::op_store::{RepoDelta, View};

pub struct Transaction {
    base_view: View,
    view: View,
    description: String,
    /// Changes that need a new Git commit projected before commit, in the
    /// order they were touched.
    pending_projections: Vec<ChangeId>,
}

impl Transaction {
    pub fn new(base_view: &View, description: impl Into<String>) -> Self {
        Transaction {
            base_view: base_view.clone(),
            view: base_view.clone(),
            description: description.into(),
            pending_projections: vec![],
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn base_view(&self) -> &View {
        &self.base_view
    }

    pub fn view(&self) -> &View {
        &self.view
    }

    pub fn view_mut(&mut self) -> &mut View {
        &mut self.view
    }

    /// Marks a change as needing projection into a Git commit at commit
    /// time. Duplicates are fine; projection dedupes.
    pub fn record_projection(&mut self, id: ChangeId) {
        if !self.pending_projections.contains(&id) {
            self.pending_projections.push(id);
        }
    }

    pub fn record_projections(&mut self, ids: impl IntoIterator<Item = ChangeId>) {
        for id in ids {
            self.record_projection(id);
        }
    }

    pub fn take_pending_projections(&mut self) -> Vec<ChangeId> {
        std::mem::take(&mut self.pending_projections)
    }

    /// The uniform before/after effects block recorded in the operation
    /// payload.
    pub fn effects(&self) -> RepoDelta {
        RepoDelta::between(&self.base_view, &self.view)
    }

    /// True when the transaction would record no change at all.
    pub fn is_noop(&self) -> bool {
        self.effects().is_empty()
    }

    /// Consumes the transaction, yielding the new view. The repository
    /// persists it and appends the operation record.
    pub fn into_view(self) -> View {
        self.view
    }
}
