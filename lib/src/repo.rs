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

//! The repository handle: the engine facade every mutation and query goes
//! through.
//!
//! Every mutation is one operation: snapshot the working copy, mutate a
//! transaction's view, project touched changes into Git commits, then
//! persist everything and append the operation record. Readers answer from
//! the in-memory view and never touch the operation log.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::instrument;

use crate::backend::{
    BackendError, ChangeId, CommitId, ConflictId, GitStore, OperationId, Tree, TreeEntry,
};
use crate::conflicts::{
    self, ConflictError, ConflictSet, MarkerStyle, Resolution, ResolutionStrategy,
};
use crate::error::{ClassifiedError, ErrorKind};
use crate::events::{self, Event, EventBus, EventPayload, HookError};
use crate::fs::Fs;
use crate::git::{self, GitBridgeError, GitExportStats, GitImportStats};
use crate::graph::{Change, ChangeGraph, ChangePatch, GraphError};
use crate::merge::{DriverRegistry, MergeDriver, MergeError};
use crate::object_id::ObjectId as _;
use crate::op_store::{
    apply_delta, ApplyDirection, ChangeFlags, OpStoreError, Operation, OperationPayload, RepoDelta,
    View,
};
use crate::operation::{OpLog, OpLogError};
use crate::refs::{validate_bookmark_name, Bookmark, RefsError};
use crate::revset::{self, RevsetContext, RevsetError};
use crate::rewrite::{self, RebaseOutcome, RewriteError};
use crate::settings::UserSettings;
use crate::storage::{StorageError, StorageManager};
use crate::transaction::Transaction;
use crate::working_copy::{WorkingCopy, WorkingCopyError, WorkingCopyState};

const GRAPH_KEY: &str = "graph.json";
const OPLOG_KEY: &str = "oplog.jsonl";
const BOOKMARKS_KEY: &str = "bookmarks.json";
const CONFLICTS_KEY: &str = "conflicts.json";
const OP_HEADS_KEY: &str = "op-heads.json";
pub const DEFAULT_WORKSPACE: &str = "default";

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("\"{0}\" is not a pjj repository")]
    NotInitialized(PathBuf),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Refs(#[from] RefsError),
    #[error(transparent)]
    OpStore(#[from] OpStoreError),
    #[error(transparent)]
    OpLog(#[from] OpLogError),
    #[error(transparent)]
    Rewrite(#[from] RewriteError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    WorkingCopy(#[from] WorkingCopyError),
    #[error(transparent)]
    Conflicts(#[from] ConflictError),
    #[error(transparent)]
    Revset(#[from] RevsetError),
    #[error(transparent)]
    Git(#[from] GitBridgeError),
    #[error(transparent)]
    Hook(#[from] HookError),
}

impl ClassifiedError for RepoError {
    fn kind(&self) -> ErrorKind {
        match self {
            RepoError::NotInitialized(_) => ErrorKind::NotFound,
            RepoError::Storage(err) => err.kind(),
            RepoError::Backend(err) => err.kind(),
            RepoError::Graph(err) => err.kind(),
            RepoError::Refs(err) => err.kind(),
            RepoError::OpStore(err) => err.kind(),
            RepoError::OpLog(err) => err.kind(),
            RepoError::Rewrite(err) => err.kind(),
            RepoError::Merge(err) => err.kind(),
            RepoError::WorkingCopy(err) => err.kind(),
            RepoError::Conflicts(err) => err.kind(),
            RepoError::Revset(err) => err.kind(),
            RepoError::Git(err) => err.kind(),
            RepoError::Hook(err) => err.kind(),
        }
    }

    fn context(&self) -> Option<String> {
        match self {
            RepoError::NotInitialized(path) => Some(path.display().to_string()),
            RepoError::Storage(err) => err.context(),
            RepoError::Graph(err) => err.context(),
            RepoError::Refs(err) => err.context(),
            RepoError::OpStore(err) => err.context(),
            RepoError::OpLog(err) => err.context(),
            RepoError::Rewrite(err) => err.context(),
            RepoError::Merge(err) => err.context(),
            RepoError::WorkingCopy(err) => err.context(),
            RepoError::Conflicts(err) => err.context(),
            RepoError::Revset(err) => err.context(),
            _ => None,
        }
    }

    fn suggestion(&self) -> Option<String> {
        match self {
            RepoError::NotInitialized(_) => Some("Run init first".to_owned()),
            RepoError::Refs(err) => err.suggestion(),
            RepoError::Revset(err) => err.suggestion(),
            _ => None,
        }
    }
}

pub type RepoResult<T> = Result<T, RepoError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffStatus {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub path: String,
    pub status: DiffStatus,
}

#[derive(Debug, Clone)]
pub struct Status {
    pub working_copy: Change,
    pub has_conflicts: bool,
    pub conflict_count: usize,
}

/// One line of `annotate` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotatedLine {
    pub change_id: ChangeId,
    pub line: String,
}

pub struct Repo {
    storage: Arc<StorageManager>,
    git: Arc<dyn GitStore>,
    settings: UserSettings,
    events: Arc<EventBus>,
    drivers: DriverRegistry,
    workspace: String,
    view: View,
    op_log: OpLog,
    working_copy: WorkingCopy,
}

impl std::fmt::Debug for Repo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repo")
            .field("root", &self.storage.root())
            .field("workspace", &self.workspace)
            .finish_non_exhaustive()
    }
}

fn to_json<T: serde::Serialize>(key: &str, value: &T) -> RepoResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|err| StorageError::Corrupt {
        key: key.to_owned(),
        message: err.to_string(),
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Reads one metadata file through the Storage Manager's parsed-artifact
/// cache; a `put` on the same key drops the cached value.
fn load_parsed<T>(storage: &StorageManager, key: &str) -> RepoResult<Option<T>>
where
    T: serde::de::DeserializeOwned + Clone + Send + Sync + 'static,
{
    let parsed = storage.get_parsed(key, |bytes| {
        serde_json::from_slice::<T>(bytes).map_err(|err| StorageError::Corrupt {
            key: key.to_owned(),
            message: err.to_string(),
        })
    })?;
    Ok(parsed.map(|value| (*value).clone()))
}

impl Repo {
    /// Creates a co-located repository: `.git` owned by the Git store,
    /// `.jj` owned by us. The initial operation creates the root change
    /// and an empty working-copy change on top of it.
    pub fn init(
        settings: UserSettings,
        fs: Arc<dyn Fs>,
        git: Arc<dyn GitStore>,
        workspace_root: &Path,
    ) -> RepoResult<Repo> {
        git.init()?;
        let storage = Arc::new(StorageManager::init(workspace_root.join(".jj"))?);

        let signature = settings.signature();
        let mut view = View::empty(signature.clone());
        let wc_id = settings.new_change_id();
        view.graph.create(
            wc_id.clone(),
            vec![ChangeGraph::root_change_id()],
            String::new(),
            signature.clone(),
            signature,
            Tree::default(),
        )?;
        view.graph.set_working_copy(wc_id.clone())?;

        let effects = RepoDelta::between(&View::bare(), &view);
        let timestamp = settings.operation_timestamp();
        let operation = Operation::new(
            vec![],
            timestamp.timestamp,
            timestamp.tz_offset,
            settings.operation_username(),
            "initialize repo".to_owned(),
            OperationPayload::Init {
                user: settings.user_name(),
                effects,
            },
        )?;
        let op_log = OpLog::new(operation.clone());

        let working_copy = WorkingCopy::new(
            fs,
            workspace_root.to_owned(),
            WorkingCopyState {
                current: wc_id,
                tracked: Default::default(),
            },
        );

        let repo = Repo {
            storage,
            git,
            settings,
            events: Arc::new(EventBus::new()),
            drivers: DriverRegistry::with_builtins(),
            workspace: DEFAULT_WORKSPACE.to_owned(),
            view,
            op_log,
            working_copy,
        };
        {
            let _lock = repo.storage.lock()?;
            repo.persist_view()?;
            repo.persist_working_copy_state()?;
            repo.storage.append(OPLOG_KEY, &operation.to_line()?)?;
            repo.persist_op_heads()?;
        }
        Ok(repo)
    }

    pub fn load(
        settings: UserSettings,
        fs: Arc<dyn Fs>,
        git: Arc<dyn GitStore>,
        workspace_root: &Path,
    ) -> RepoResult<Repo> {
        Self::load_workspace(settings, fs, git, workspace_root, DEFAULT_WORKSPACE)
    }

    pub fn load_workspace(
        settings: UserSettings,
        fs: Arc<dyn Fs>,
        git: Arc<dyn GitStore>,
        workspace_root: &Path,
        workspace: &str,
    ) -> RepoResult<Repo> {
        let storage = Arc::new(StorageManager::load(workspace_root.join(".jj")));
        let graph: ChangeGraph = load_parsed(&storage, GRAPH_KEY)?
            .ok_or_else(|| RepoError::NotInitialized(workspace_root.to_owned()))?;
        let bookmarks = load_parsed(&storage, BOOKMARKS_KEY)?.unwrap_or_default();
        let conflicts: ConflictSet =
            load_parsed(&storage, CONFLICTS_KEY)?.unwrap_or_default();
        let op_heads = load_parsed(&storage, OP_HEADS_KEY)?
            .ok_or_else(|| RepoError::NotInitialized(workspace_root.to_owned()))?;
        let oplog_bytes = storage
            .get(OPLOG_KEY)?
            .ok_or_else(|| RepoError::NotInitialized(workspace_root.to_owned()))?;
        let op_log = OpLog::load(&oplog_bytes, op_heads)?;

        let wc_key = working_copy_key(workspace);
        let wc_state: WorkingCopyState =
            load_parsed(&storage, &wc_key)?.unwrap_or_else(|| WorkingCopyState {
                current: graph.working_copy_id().clone(),
                tracked: Default::default(),
            });
        let working_copy = WorkingCopy::new(fs, workspace_root.to_owned(), wc_state);

        let mut repo = Repo {
            storage,
            git,
            settings,
            events: Arc::new(EventBus::new()),
            drivers: DriverRegistry::with_builtins(),
            workspace: workspace.to_owned(),
            view: View {
                graph,
                bookmarks,
                conflicts,
            },
            op_log,
            working_copy,
        };
        repo.reconcile_op_heads()?;
        Ok(repo)
    }

    /// When concurrent workspaces forked the op log, the head with the
    /// later timestamp wins and the others stay recorded as siblings for a
    /// manual `restore`.
    fn reconcile_op_heads(&mut self) -> RepoResult<()> {
        if self.op_log.heads().siblings.is_empty() {
            return Ok(());
        }
        let mut candidates = vec![self.op_log.head_id().clone()];
        candidates.extend(self.op_log.heads().siblings.iter().cloned());
        let winner = candidates
            .iter()
            .max_by_key(|id| {
                self.op_log
                    .get(id)
                    .map(|op| (op.timestamp.clone(), op.op_id.clone()))
                    .ok()
            })
            .cloned()
            .unwrap();
        if winner != *self.op_log.head_id() {
            let view = self.op_log.replay(&winner)?;
            let losers: Vec<OperationId> = candidates
                .into_iter()
                .filter(|id| *id != winner)
                .collect();
            self.op_log.set_head(winner);
            for loser in losers {
                self.op_log.record_sibling(loser);
            }
            self.view = view;
            let _lock = self.storage.lock()?;
            self.persist_view()?;
            self.persist_op_heads()?;
        }
        Ok(())
    }

    // ---- accessors --------------------------------------------------------

    pub fn settings(&self) -> &UserSettings {
        &self.settings
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn view(&self) -> &View {
        &self.view
    }

    pub fn op_log(&self) -> &OpLog {
        &self.op_log
    }

    pub fn working_copy_id(&self) -> &ChangeId {
        self.view.graph.working_copy_id()
    }

    pub fn working_copy_change(&self) -> RepoResult<&Change> {
        Ok(self.view.graph.get(self.view.graph.working_copy_id())?)
    }

    pub fn change(&self, id: &ChangeId) -> RepoResult<&Change> {
        Ok(self.view.graph.get(id)?)
    }

    pub fn conflicts(&self) -> &ConflictSet {
        &self.view.conflicts
    }

    /// The ordered list of commit ids this change previously occupied.
    pub fn evolution(&self, id: &ChangeId) -> RepoResult<&[CommitId]> {
        Ok(&self.view.graph.get(id)?.evolution)
    }

    /// Registers a merge driver for paths matching `pattern`. With
    /// `strict`, a driver failure fails the whole operation instead of
    /// recording a conflict.
    pub fn register_driver(
        &mut self,
        pattern: &str,
        driver: Arc<dyn MergeDriver>,
        strict: bool,
    ) -> RepoResult<()> {
        self.drivers.register(pattern, driver, strict)?;
        Ok(())
    }

    // ---- queries ----------------------------------------------------------

    pub fn log(&self, revset: &str) -> RepoResult<Vec<Change>> {
        let context = RevsetContext {
            view: &self.view,
            user_email: self.settings.user_email(),
            now: crate::backend::Timestamp::now(),
        };
        let ids = revset::evaluate_str(revset, &context)?;
        ids.iter()
            .map(|id| Ok(self.view.graph.get(id)?.clone()))
            .collect()
    }

    pub fn status(&self) -> RepoResult<Status> {
        let working_copy = self.working_copy_change()?.clone();
        let conflict_count = self
            .view
            .conflicts
            .for_change(&working_copy.change_id)
            .len();
        Ok(Status {
            has_conflicts: working_copy.has_conflict,
            conflict_count,
            working_copy,
        })
    }

    /// Paths a change touched, classified against its first parent.
    pub fn diff(&self, id: &ChangeId) -> RepoResult<Vec<DiffEntry>> {
        let change = self.view.graph.get(id)?;
        let parent_tree = match change.parents.first() {
            Some(parent) => self.view.graph.get(parent)?.tree.clone(),
            None => Tree::default(),
        };
        let mut entries = vec![];
        for path in parent_tree.diff_paths(&change.tree) {
            let status = match (parent_tree.get(&path), change.tree.get(&path)) {
                (None, Some(_)) => DiffStatus::Added,
                (Some(_), None) => DiffStatus::Removed,
                _ => DiffStatus::Modified,
            };
            entries.push(DiffEntry { path, status });
        }
        Ok(entries)
    }

    pub fn read_file(&self, id: &ChangeId, path: &str) -> RepoResult<Vec<u8>> {
        let change = self.view.graph.get(id)?;
        let entry = change
            .tree
            .get(path)
            .ok_or_else(|| WorkingCopyError::NotTracked {
                path: path.to_owned(),
            })?;
        Ok(self.git.read_blob(&entry.id)?)
    }

    /// Attributes each line of `path` at `id` to the first-parent ancestor
    /// that introduced it.
    pub fn annotate(&self, id: &ChangeId, path: &str) -> RepoResult<Vec<AnnotatedLine>> {
        let content = String::from_utf8_lossy(&self.read_file(id, path)?).into_owned();
        // First-parent chain, newest first.
        let mut chain = vec![];
        let mut cursor = Some(id.clone());
        while let Some(current) = cursor {
            let change = self.view.graph.get(&current)?;
            chain.push(current.clone());
            cursor = change.parents.first().cloned();
        }
        let mut annotated = vec![];
        for line in content.lines() {
            let mut owner = id.clone();
            for ancestor in &chain {
                let change = self.view.graph.get(ancestor)?;
                let present = change
                    .tree
                    .get(path)
                    .map(|entry| self.git.read_blob(&entry.id))
                    .transpose()?
                    .map(|bytes| {
                        String::from_utf8_lossy(&bytes)
                            .lines()
                            .any(|l| l == line)
                    })
                    .unwrap_or(false);
                if present {
                    owner = ancestor.clone();
                } else {
                    break;
                }
            }
            annotated.push(AnnotatedLine {
                change_id: owner,
                line: line.to_owned(),
            });
        }
        Ok(annotated)
    }

    /// Conflict markers for one conflict, in the requested style.
    pub fn conflict_markers(
        &self,
        conflict_id: &ConflictId,
        style: MarkerStyle,
    ) -> RepoResult<String> {
        let conflict = self.view.conflicts.get(conflict_id)?;
        Ok(conflicts::materialize(conflict, style)?)
    }

    // ---- persistence ------------------------------------------------------

    fn persist_view(&self) -> RepoResult<()> {
        self.persist_view_of(&self.view)
    }

    fn persist_view_of(&self, view: &View) -> RepoResult<()> {
        self.storage
            .put(GRAPH_KEY, &to_json(GRAPH_KEY, &view.graph)?)?;
        self.storage
            .put(BOOKMARKS_KEY, &to_json(BOOKMARKS_KEY, &view.bookmarks)?)?;
        self.storage
            .put(CONFLICTS_KEY, &to_json(CONFLICTS_KEY, &view.conflicts)?)?;
        Ok(())
    }

    fn persist_working_copy_state(&self) -> RepoResult<()> {
        let key = working_copy_key(&self.workspace);
        self.storage
            .put(&key, &to_json(&key, self.working_copy.state())?)?;
        Ok(())
    }

    fn persist_op_heads(&self) -> RepoResult<()> {
        self.storage
            .put(OP_HEADS_KEY, &to_json(OP_HEADS_KEY, self.op_log.heads())?)?;
        Ok(())
    }

    // ---- the operation pipeline -------------------------------------------

    fn check_reentrancy(&self) -> RepoResult<()> {
        if self.events.is_dispatching() {
            return Err(HookError::Reentrancy.into());
        }
        // A previously failed mutation may have left queued events behind.
        self.events.discard_queued();
        Ok(())
    }

    fn queue_rebase_events(&self, outcome: &RebaseOutcome) {
        for conflict in &outcome.new_conflicts {
            self.events.queue_async(Event::new(
                events::CONFLICT_DETECTED,
                EventPayload::Conflict(Box::new(conflict.clone())),
            ));
        }
        for failure in &outcome.driver_failures {
            self.events.queue_async(Event::new(
                events::DRIVER_FAILED,
                EventPayload::DriverFailed {
                    path: failure.path.clone(),
                    driver: failure.driver.clone(),
                    error: failure.message.clone(),
                },
            ));
        }
    }

    /// Folds any dirty working-copy state into the current change, with
    /// the usual auto-rebase of descendants. Only the transaction's view
    /// is touched; the tracked index is rebuilt when the operation
    /// commits and materializes.
    fn snapshot_into(&mut self, tx: &mut Transaction) -> RepoResult<()> {
        let wc_id = tx.view().graph.working_copy_id().clone();
        let base_tree = tx.view().graph.get(&wc_id)?.tree.clone();
        let outcome = self
            .working_copy
            .snapshot(self.git.as_ref(), &base_tree)?;
        if outcome.tree == base_tree {
            return Ok(());
        }
        tx.view_mut().graph.apply_patch(
            &wc_id,
            ChangePatch {
                tree: Some(outcome.tree),
                ..Default::default()
            },
        )?;
        let parents = tx.view().graph.get(&wc_id)?.parents.clone();
        let merged = rewrite::merged_parent_tree(
            &tx.view().graph,
            self.git.as_ref(),
            &self.drivers,
            &wc_id,
            &parents,
        )?;
        let empty = tx.view().graph.get(&wc_id)?.tree == merged.tree;
        tx.view_mut().graph.set_flags(&wc_id, Some(empty), None)?;
        let outcome = rewrite::rebase_descendants(
            tx.view_mut(),
            self.git.as_ref(),
            &self.drivers,
            &wc_id,
            base_tree,
        )?;
        self.queue_rebase_events(&outcome);
        tx.record_projection(wc_id);
        tx.record_projections(outcome.rebased);
        Ok(())
    }

    /// Projects pending commits, fires pre-commit hooks, persists the new
    /// view, appends the operation, and delivers post-commit events. On
    /// any failure the repository stays at the prior op-log head.
    fn commit_transaction(
        &mut self,
        tx: Transaction,
        build_payload: impl FnOnce(RepoDelta) -> OperationPayload,
        cursor_override: Option<OperationId>,
    ) -> RepoResult<Operation> {
        match self.try_commit(tx, build_payload, cursor_override) {
            Ok(operation) => {
                self.events.drain_async();
                Ok(operation)
            }
            Err(err) => {
                self.events.discard_queued();
                // Best effort: put the serialized state of the in-memory
                // view back so disk never runs ahead of the op-log head.
                self.persist_view().ok();
                self.persist_op_heads().ok();
                self.persist_working_copy_state().ok();
                Err(err)
            }
        }
    }

    fn try_commit(
        &mut self,
        mut tx: Transaction,
        build_payload: impl FnOnce(RepoDelta) -> OperationPayload,
        cursor_override: Option<OperationId>,
    ) -> RepoResult<Operation> {
        let pending = tx.take_pending_projections();
        git::project_changes(&mut tx.view_mut().graph, self.git.as_ref(), &pending)?;

        let effects = tx.effects();
        let description = tx.description().to_owned();
        let payload = build_payload(effects);
        let timestamp = self.settings.operation_timestamp();
        let operation = Operation::new(
            vec![self.op_log.head_id().clone()],
            timestamp.timestamp,
            timestamp.tz_offset,
            self.settings.operation_username(),
            description.clone(),
            payload,
        )?;

        let operation_payload = EventPayload::Operation {
            op_id: operation.op_id.clone(),
            kind: operation.payload.kind().to_owned(),
            description,
        };
        self.events
            .emit_sync(&Event::new(events::PRE_COMMIT, operation_payload.clone()))?;

        let new_view = tx.into_view();
        let _lock = self.storage.lock()?;
        // Another workspace may have advanced the head since this handle
        // loaded; our append forks the log and their head stays recorded
        // as a sibling for reconciliation.
        if let Some(bytes) = self.storage.get(OP_HEADS_KEY)? {
            if let Ok(disk_heads) = serde_json::from_slice::<crate::op_store::OpHeads>(&bytes) {
                if disk_heads.current != *self.op_log.head_id()
                    && !self.op_log.heads().siblings.contains(&disk_heads.current)
                {
                    self.op_log.record_sibling(disk_heads.current);
                }
            }
        }
        self.persist_view_of(&new_view)?;
        self.storage.append(OPLOG_KEY, &operation.to_line()?)?;
        match cursor_override {
            Some(cursor) => self.op_log.append_with_cursor(operation.clone(), cursor),
            None => self.op_log.append(operation.clone()),
        }
        self.persist_op_heads()?;
        self.view = new_view;

        // Keep the filesystem in sync with the (possibly new) working copy
        // change.
        let wc_id = self.view.graph.working_copy_id().clone();
        let wc_tree = self.view.graph.get(&wc_id)?.tree.clone();
        self.working_copy.set_current(wc_id);
        self.working_copy.materialize(self.git.as_ref(), &wc_tree)?;
        self.persist_working_copy_state()?;

        self.events.queue_async(Event::new(
            events::POST_COMMIT,
            operation_payload.clone(),
        ));
        self.events.queue_async(Event::new(
            events::OPERATION_RECORDED,
            operation_payload,
        ));
        Ok(operation)
    }

    // ---- mutations --------------------------------------------------------

    /// Snapshots the working copy into the current change. Returns `None`
    /// when nothing changed on disk.
    pub fn snapshot(&mut self) -> RepoResult<Option<Operation>> {
        self.check_reentrancy()?;
        let mut tx = Transaction::new(&self.view, "snapshot working copy");
        self.snapshot_into(&mut tx)?;
        if tx.is_noop() {
            return Ok(None);
        }
        let change_id = tx.view().graph.working_copy_id().clone();
        self.commit_transaction(
            tx,
            |effects| OperationPayload::Snapshot { change_id, effects },
            None,
        )
        .map(Some)
    }

    /// Sets a change's description. Re-describing with the same text is a
    /// no-op (`None`), modulo a pending working-copy snapshot.
    pub fn describe(&mut self, target: Option<&ChangeId>, text: &str) -> RepoResult<Option<Operation>> {
        self.check_reentrancy()?;
        let mut tx = Transaction::new(&self.view, format!("describe change: {text}"));
        self.snapshot_into(&mut tx)?;
        let id = target
            .cloned()
            .unwrap_or_else(|| tx.view().graph.working_copy_id().clone());
        let prev_description = tx.view().graph.get(&id)?.description.clone();
        let changed = prev_description != text;
        if changed {
            tx.view_mut().graph.apply_patch(
                &id,
                ChangePatch {
                    description: Some(text.to_owned()),
                    ..Default::default()
                },
            )?;
            let tree = tx.view().graph.get(&id)?.tree.clone();
            let outcome = rewrite::rebase_descendants(
                tx.view_mut(),
                self.git.as_ref(),
                &self.drivers,
                &id,
                tree,
            )?;
            self.queue_rebase_events(&outcome);
            tx.record_projection(id.clone());
            tx.record_projections(outcome.rebased);
        }
        if tx.is_noop() {
            return Ok(None);
        }
        let payload: Box<dyn FnOnce(RepoDelta) -> OperationPayload> = if changed {
            let description = text.to_owned();
            let change_id = id;
            Box::new(move |effects| OperationPayload::Describe {
                change_id,
                description,
                prev_description,
                effects,
            })
        } else {
            let change_id = id;
            Box::new(move |effects| OperationPayload::Snapshot { change_id, effects })
        };
        self.commit_transaction(tx, payload, None).map(Some)
    }

    /// Applies a generic rewrite patch (description, author, tree) to a
    /// change, keeping its change id and cascading new commits through its
    /// descendants. A patch that changes nothing is a no-op (`None`),
    /// modulo a pending working-copy snapshot.
    pub fn rewrite(
        &mut self,
        target: &ChangeId,
        patch: ChangePatch,
    ) -> RepoResult<Option<Operation>> {
        self.check_reentrancy()?;
        let mut tx = Transaction::new(&self.view, format!("rewrite change {}", target.hex()));
        self.snapshot_into(&mut tx)?;
        let before = tx.view().graph.get(target)?.clone();
        tx.view_mut().graph.apply_patch(target, patch)?;
        let changed = *tx.view().graph.get(target)? != before;
        if changed {
            if tx.view().graph.get(target)?.tree != before.tree {
                let parents = tx.view().graph.get(target)?.parents.clone();
                let merged = rewrite::merged_parent_tree(
                    &tx.view().graph,
                    self.git.as_ref(),
                    &self.drivers,
                    target,
                    &parents,
                )?;
                let empty = tx.view().graph.get(target)?.tree == merged.tree;
                tx.view_mut().graph.set_flags(target, Some(empty), None)?;
            }
            let outcome = rewrite::rebase_descendants(
                tx.view_mut(),
                self.git.as_ref(),
                &self.drivers,
                target,
                before.tree,
            )?;
            self.queue_rebase_events(&outcome);
            tx.record_projection(target.clone());
            tx.record_projections(outcome.rebased);
        }
        if tx.is_noop() {
            return Ok(None);
        }
        let payload: Box<dyn FnOnce(RepoDelta) -> OperationPayload> = if changed {
            let change_id = target.clone();
            Box::new(move |effects| OperationPayload::Rewrite { change_id, effects })
        } else {
            let change_id = target.clone();
            Box::new(move |effects| OperationPayload::Snapshot { change_id, effects })
        };
        self.commit_transaction(tx, payload, None).map(Some)
    }

    /// Creates a new change on `parents` and moves the working copy onto
    /// it.
    #[instrument(skip_all)]
    pub fn new_change(
        &mut self,
        parents: Vec<ChangeId>,
        description: &str,
    ) -> RepoResult<ChangeId> {
        self.check_reentrancy()?;
        let mut tx = Transaction::new(&self.view, format!("new change on {} parents", parents.len()));
        self.snapshot_into(&mut tx)?;
        let id = self.create_change_in(&mut tx, parents.clone(), description)?;
        tx.view_mut().graph.set_working_copy(id.clone())?;
        let change_id = id.clone();
        self.commit_transaction(
            tx,
            |effects| OperationPayload::New {
                change_id,
                parents,
                effects,
            },
            None,
        )?;
        Ok(id)
    }

    fn create_change_in(
        &mut self,
        tx: &mut Transaction,
        parents: Vec<ChangeId>,
        description: &str,
    ) -> RepoResult<ChangeId> {
        let id = self.settings.new_change_id();
        let merged = rewrite::merged_parent_tree(
            &tx.view().graph,
            self.git.as_ref(),
            &self.drivers,
            &id,
            &parents,
        )?;
        let signature = self.settings.signature();
        tx.view_mut().graph.create(
            id.clone(),
            parents,
            description.to_owned(),
            signature.clone(),
            signature,
            merged.tree,
        )?;
        let has_conflict = !merged.conflicts.is_empty();
        for conflict in &merged.conflicts {
            tx.view_mut().conflicts.insert(conflict.clone());
        }
        tx.view_mut()
            .graph
            .set_flags(&id, Some(!has_conflict), Some(has_conflict))?;
        let outcome = RebaseOutcome {
            rebased: vec![],
            new_conflicts: merged.conflicts,
            driver_failures: merged.driver_failures,
        };
        self.queue_rebase_events(&outcome);
        tx.record_projection(id.clone());
        Ok(id)
    }

    /// Moves the working copy onto an existing change, snapshotting any
    /// dirty state first.
    pub fn edit(&mut self, target: &ChangeId) -> RepoResult<Operation> {
        self.check_reentrancy()?;
        let mut tx = Transaction::new(&self.view, format!("edit change {}", target.hex()));
        self.snapshot_into(&mut tx)?;
        let prev_change_id = tx.view().graph.working_copy_id().clone();
        if tx.view().graph.get(target)?.abandoned {
            return Err(GraphError::AbandonedParent(target.hex()).into());
        }
        tx.view_mut().graph.set_working_copy(target.clone())?;
        let change_id = target.clone();
        self.commit_transaction(
            tx,
            |effects| OperationPayload::Edit {
                change_id,
                prev_change_id,
                effects,
            },
            None,
        )
    }

    /// Marks a change abandoned and rebases its descendants onto its
    /// parents. If the working copy itself is abandoned, a fresh change is
    /// created in its place.
    pub fn abandon(&mut self, target: &ChangeId) -> RepoResult<Operation> {
        self.check_reentrancy()?;
        let mut tx = Transaction::new(&self.view, format!("abandon change {}", target.hex()));
        self.snapshot_into(&mut tx)?;
        let before = tx.view().graph.get(target)?;
        let prev_flags = ChangeFlags {
            abandoned: before.abandoned,
            empty: before.empty,
            has_conflict: before.has_conflict,
        };
        let parents = before.parents.clone();
        let outcome = rewrite::abandon_change(
            tx.view_mut(),
            self.git.as_ref(),
            &self.drivers,
            target,
        )?;
        self.queue_rebase_events(&outcome);
        tx.record_projections(outcome.rebased);
        if tx.view().graph.working_copy_id() == target {
            let replacement = self.create_change_in(&mut tx, parents, "")?;
            tx.view_mut().graph.set_working_copy(replacement)?;
        }
        let change_id = target.clone();
        self.commit_transaction(
            tx,
            |effects| OperationPayload::Abandon {
                change_id,
                prev_flags,
                effects,
            },
            None,
        )
    }

    /// Moves `source` onto `destinations`, reapplying its content and
    /// auto-rebasing its descendants.
    pub fn rebase(
        &mut self,
        source: &ChangeId,
        destinations: Vec<ChangeId>,
    ) -> RepoResult<Operation> {
        self.check_reentrancy()?;
        let mut tx = Transaction::new(&self.view, format!("rebase change {}", source.hex()));
        self.snapshot_into(&mut tx)?;
        let prev_parents = tx.view().graph.get(source)?.parents.clone();
        let outcome = rewrite::rebase_change(
            tx.view_mut(),
            self.git.as_ref(),
            &self.drivers,
            source,
            destinations.clone(),
        )?;
        self.queue_rebase_events(&outcome);
        tx.record_projections(outcome.rebased);
        let change_id = source.clone();
        self.commit_transaction(
            tx,
            |effects| OperationPayload::Rebase {
                change_id,
                new_parents: destinations,
                prev_parents,
                effects,
            },
            None,
        )
    }

    /// Thin alias of [`Self::rebase`].
    pub fn move_change(
        &mut self,
        source: &ChangeId,
        destinations: Vec<ChangeId>,
    ) -> RepoResult<Operation> {
        self.rebase(source, destinations)
    }

    /// Creates a merge change whose parents are `sources` and moves the
    /// working copy onto it. Conflicts never block: they are recorded and
    /// the operation succeeds.
    pub fn merge_changes(&mut self, sources: Vec<ChangeId>) -> RepoResult<ChangeId> {
        self.check_reentrancy()?;
        self.events.emit_sync(&Event::new(
            events::PRE_MERGE,
            EventPayload::Merge {
                sources: sources.clone(),
                destination: None,
            },
        ))?;
        let mut tx = Transaction::new(&self.view, format!("merge {} changes", sources.len()));
        self.snapshot_into(&mut tx)?;
        let id = self.create_change_in(&mut tx, sources.clone(), "")?;
        tx.view_mut().graph.set_working_copy(id.clone())?;
        let conflict_ids: Vec<ConflictId> = tx
            .view()
            .conflicts
            .for_change(&id)
            .iter()
            .map(|c| c.conflict_id.clone())
            .collect();
        self.events.queue_async(Event::new(
            events::POST_MERGE,
            EventPayload::Merge {
                sources: sources.clone(),
                destination: Some(id.clone()),
            },
        ));
        let change_id = id.clone();
        self.commit_transaction(
            tx,
            |effects| OperationPayload::Merge {
                change_id,
                sources,
                conflicts: conflict_ids,
                effects,
            },
            None,
        )?;
        Ok(id)
    }

    /// Folds `source`'s diff into `destination` (its first parent by
    /// default) and abandons `source`.
    pub fn squash(
        &mut self,
        source: &ChangeId,
        destination: Option<&ChangeId>,
    ) -> RepoResult<Operation> {
        self.check_reentrancy()?;
        let mut tx = Transaction::new(&self.view, format!("squash change {}", source.hex()));
        self.snapshot_into(&mut tx)?;
        let source_change = tx.view().graph.get(source)?.clone();
        let destination = match destination {
            Some(id) => id.clone(),
            None => source_change
                .parents
                .first()
                .cloned()
                .ok_or_else(|| GraphError::NoParents)?,
        };
        // Reapply the source's diff onto the destination.
        let source_base = rewrite::merged_parent_tree(
            &tx.view().graph,
            self.git.as_ref(),
            &self.drivers,
            source,
            &source_change.parents,
        )?;
        let dest_tree = tx.view().graph.get(&destination)?.tree.clone();
        let merged = crate::merge::merge_trees(
            self.git.as_ref(),
            &self.drivers,
            &destination,
            (&source_base.tree, source),
            (&dest_tree, &destination),
            (&source_change.tree, source),
        )?;
        let dest_description = {
            let current = &tx.view().graph.get(&destination)?.description;
            if current.is_empty() {
                source_change.description.clone()
            } else if source_change.description.is_empty() {
                current.clone()
            } else {
                format!("{current}\n{}", source_change.description)
            }
        };
        tx.view_mut().graph.apply_patch(
            &destination,
            ChangePatch {
                description: Some(dest_description),
                tree: Some(merged.tree),
                ..Default::default()
            },
        )?;
        for conflict in &merged.conflicts {
            tx.view_mut().conflicts.insert(conflict.clone());
        }
        let has_conflict = !tx.view().conflicts.for_change(&destination).is_empty();
        tx.view_mut()
            .graph
            .set_flags(&destination, None, Some(has_conflict))?;
        let cascade = rewrite::rebase_descendants(
            tx.view_mut(),
            self.git.as_ref(),
            &self.drivers,
            &destination,
            dest_tree,
        )?;
        self.queue_rebase_events(&cascade);
        tx.record_projection(destination.clone());
        tx.record_projections(cascade.rebased);
        let abandon_outcome = rewrite::abandon_change(
            tx.view_mut(),
            self.git.as_ref(),
            &self.drivers,
            source,
        )?;
        self.queue_rebase_events(&abandon_outcome);
        tx.record_projections(abandon_outcome.rebased);
        if tx.view().graph.working_copy_id() == source {
            tx.view_mut().graph.set_working_copy(destination.clone())?;
        }
        let payload_source = source.clone();
        self.commit_transaction(
            tx,
            |effects| OperationPayload::Squash {
                source: payload_source,
                destination,
                effects,
            },
            None,
        )
    }

    /// Splits `target` in two: the target keeps only the selected paths'
    /// modifications, a new child carries the rest, and former children
    /// move onto the new child.
    pub fn split(&mut self, target: &ChangeId, paths: &[String]) -> RepoResult<ChangeId> {
        self.check_reentrancy()?;
        let mut tx = Transaction::new(&self.view, format!("split change {}", target.hex()));
        self.snapshot_into(&mut tx)?;
        let original = tx.view().graph.get(target)?.clone();
        let parent_merge = rewrite::merged_parent_tree(
            &tx.view().graph,
            self.git.as_ref(),
            &self.drivers,
            target,
            &original.parents,
        )?;
        let mut first_tree = parent_merge.tree.clone();
        for path in paths {
            match original.tree.get(path) {
                Some(entry) => first_tree.set(path.clone(), entry.clone()),
                None => {
                    first_tree.remove(path);
                }
            }
        }
        let former_children: Vec<ChangeId> = tx
            .view()
            .graph
            .children_index()
            .get(target)
            .cloned()
            .unwrap_or_default();
        let first_empty = first_tree == parent_merge.tree;
        tx.view_mut().graph.apply_patch(
            target,
            ChangePatch {
                tree: Some(first_tree),
                ..Default::default()
            },
        )?;
        tx.view_mut()
            .graph
            .set_flags(target, Some(first_empty), None)?;
        tx.record_projection(target.clone());

        let child_id = self.settings.new_change_id();
        let signature = self.settings.signature();
        tx.view_mut().graph.create(
            child_id.clone(),
            vec![target.clone()],
            String::new(),
            original.author.clone(),
            signature,
            original.tree.clone(),
        )?;
        let child_empty = original.tree == tx.view().graph.get(target)?.tree;
        tx.view_mut()
            .graph
            .set_flags(&child_id, Some(child_empty), None)?;
        tx.record_projection(child_id.clone());

        for former_child in former_children {
            let outcome = rewrite::rebase_onto_with_base(
                tx.view_mut(),
                self.git.as_ref(),
                &self.drivers,
                &former_child,
                vec![child_id.clone()],
                original.tree.clone(),
            )?;
            self.queue_rebase_events(&outcome);
            tx.record_projections(outcome.rebased);
        }
        if tx.view().graph.working_copy_id() == target {
            tx.view_mut().graph.set_working_copy(child_id.clone())?;
        }
        let payload_target = target.clone();
        let payload_child = child_id.clone();
        let payload_paths = paths.to_vec();
        self.commit_transaction(
            tx,
            |effects| OperationPayload::Split {
                change_id: payload_target,
                new_change_id: payload_child,
                paths: payload_paths,
                effects,
            },
            None,
        )?;
        Ok(child_id)
    }

    /// Copies a change (same parents, description, and tree) under a fresh
    /// change id. The working copy stays put.
    pub fn duplicate(&mut self, source: &ChangeId) -> RepoResult<ChangeId> {
        self.check_reentrancy()?;
        let mut tx = Transaction::new(&self.view, format!("duplicate change {}", source.hex()));
        self.snapshot_into(&mut tx)?;
        let original = tx.view().graph.get(source)?.clone();
        let id = self.settings.new_change_id();
        tx.view_mut().graph.create(
            id.clone(),
            original.parents.clone(),
            original.description.clone(),
            original.author.clone(),
            self.settings.signature(),
            original.tree.clone(),
        )?;
        tx.view_mut()
            .graph
            .set_flags(&id, Some(original.empty), None)?;
        tx.record_projection(id.clone());
        let payload_source = source.clone();
        let payload_new = id.clone();
        self.commit_transaction(
            tx,
            |effects| OperationPayload::Duplicate {
                source: payload_source,
                new_change_id: payload_new,
                effects,
            },
            None,
        )?;
        Ok(id)
    }

    /// Turns a linear run of changes into siblings sharing the first
    /// member's parents. Children of the former head are moved onto all
    /// members.
    pub fn parallelize(&mut self, targets: &[ChangeId]) -> RepoResult<Operation> {
        self.check_reentrancy()?;
        if targets.is_empty() {
            return Err(GraphError::EmptySelection.into());
        }
        let mut tx = Transaction::new(&self.view, format!("parallelize {} changes", targets.len()));
        self.snapshot_into(&mut tx)?;
        // Members in graph topological order, oldest first.
        let order = tx.view().graph.topo_sorted_ids();
        let mut members: Vec<ChangeId> = order
            .into_iter()
            .rev()
            .filter(|id| targets.contains(id))
            .collect();
        if members.len() != targets.len() {
            let missing = targets
                .iter()
                .find(|id| !members.contains(id))
                .unwrap();
            return Err(GraphError::NotFound(missing.hex()).into());
        }
        let head = members.last().cloned().unwrap();
        let former_head_children: Vec<ChangeId> = tx
            .view()
            .graph
            .children_index()
            .get(&head)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|child| !members.contains(child))
            .collect();
        let base_parents = tx.view().graph.get(&members[0])?.parents.clone();
        for member in members.iter().skip(1) {
            let outcome = rewrite::rebase_change(
                tx.view_mut(),
                self.git.as_ref(),
                &self.drivers,
                member,
                base_parents.clone(),
            )?;
            self.queue_rebase_events(&outcome);
            tx.record_projections(outcome.rebased);
        }
        for child in former_head_children {
            let outcome = rewrite::rebase_change(
                tx.view_mut(),
                self.git.as_ref(),
                &self.drivers,
                &child,
                members.clone(),
            )?;
            self.queue_rebase_events(&outcome);
            tx.record_projections(outcome.rebased);
        }
        members.sort();
        self.commit_transaction(
            tx,
            |effects| OperationPayload::Parallelize {
                change_ids: members,
                effects,
            },
            None,
        )
    }

    /// Restores `paths` in `target` (the working copy by default) to their
    /// state in `from`.
    pub fn restore_paths(
        &mut self,
        target: Option<&ChangeId>,
        from: &ChangeId,
        paths: &[String],
    ) -> RepoResult<Operation> {
        self.check_reentrancy()?;
        let mut tx = Transaction::new(&self.view, format!("restore {} paths", paths.len()));
        self.snapshot_into(&mut tx)?;
        let id = target
            .cloned()
            .unwrap_or_else(|| tx.view().graph.working_copy_id().clone());
        let from_tree = tx.view().graph.get(from)?.tree.clone();
        let old_tree = tx.view().graph.get(&id)?.tree.clone();
        let mut new_tree = old_tree.clone();
        for path in paths {
            match from_tree.get(path) {
                Some(entry) => new_tree.set(path.clone(), entry.clone()),
                None => {
                    new_tree.remove(path);
                }
            }
        }
        tx.view_mut().graph.apply_patch(
            &id,
            ChangePatch {
                tree: Some(new_tree),
                ..Default::default()
            },
        )?;
        let parents = tx.view().graph.get(&id)?.parents.clone();
        let merged = rewrite::merged_parent_tree(
            &tx.view().graph,
            self.git.as_ref(),
            &self.drivers,
            &id,
            &parents,
        )?;
        let empty = tx.view().graph.get(&id)?.tree == merged.tree;
        tx.view_mut().graph.set_flags(&id, Some(empty), None)?;
        let outcome = rewrite::rebase_descendants(
            tx.view_mut(),
            self.git.as_ref(),
            &self.drivers,
            &id,
            old_tree,
        )?;
        self.queue_rebase_events(&outcome);
        tx.record_projection(id.clone());
        tx.record_projections(outcome.rebased);
        let payload_from = from.clone();
        let payload_paths = paths.to_vec();
        self.commit_transaction(
            tx,
            |effects| OperationPayload::RestorePaths {
                change_id: id,
                from: payload_from,
                paths: payload_paths,
                effects,
            },
            None,
        )
    }

    /// Resolves one conflict with a strategy or explicit content, updating
    /// the owning change's tree and clearing the conflict.
    pub fn resolve(
        &mut self,
        conflict_id: &ConflictId,
        resolution: Resolution,
    ) -> RepoResult<Operation> {
        self.check_reentrancy()?;
        let mut tx = Transaction::new(&self.view, format!("resolve conflict {}", conflict_id.hex()));
        self.snapshot_into(&mut tx)?;
        self.resolve_in(&mut tx, conflict_id, &resolution)?;
        let payload_ids = vec![conflict_id.clone()];
        self.commit_transaction(
            tx,
            |effects| OperationPayload::Resolve {
                conflict_ids: payload_ids,
                effects,
            },
            None,
        )
    }

    /// Applies a strategy to every conflict (optionally filtered by a path
    /// glob).
    pub fn resolve_many(
        &mut self,
        strategy: ResolutionStrategy,
        path_filter: Option<&str>,
    ) -> RepoResult<Option<Operation>> {
        self.check_reentrancy()?;
        let pattern = path_filter
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|err| MergeError::InvalidPattern {
                pattern: path_filter.unwrap_or_default().to_owned(),
                message: err.to_string(),
            })?;
        let mut tx = Transaction::new(&self.view, "resolve conflicts");
        self.snapshot_into(&mut tx)?;
        let targets: Vec<ConflictId> = tx
            .view()
            .conflicts
            .conflicts
            .values()
            .filter(|conflict| {
                pattern
                    .as_ref()
                    .map(|p| p.matches(&conflict.path))
                    .unwrap_or(true)
            })
            .map(|conflict| conflict.conflict_id.clone())
            .collect();
        if targets.is_empty() {
            return Ok(None);
        }
        for conflict_id in &targets {
            self.resolve_in(&mut tx, conflict_id, &Resolution::Strategy(strategy))?;
        }
        self.commit_transaction(
            tx,
            |effects| OperationPayload::Resolve {
                conflict_ids: targets,
                effects,
            },
            None,
        )
        .map(Some)
    }

    fn resolve_in(
        &mut self,
        tx: &mut Transaction,
        conflict_id: &ConflictId,
        resolution: &Resolution,
    ) -> RepoResult<()> {
        let conflict = tx.view().conflicts.get(conflict_id)?.clone();
        let owner = conflict.owner.clone();
        let content = conflicts::resolved_content(&conflict, resolution)?;
        let old_tree = tx.view().graph.get(&owner)?.tree.clone();
        let mut new_tree = old_tree.clone();
        match content {
            Some(text) => {
                let blob = self.git.write_blob(text.as_bytes())?;
                let executable = new_tree
                    .get(&conflict.path)
                    .map(|entry| entry.executable)
                    .unwrap_or(false);
                new_tree.set(
                    conflict.path.clone(),
                    TreeEntry {
                        id: blob,
                        executable,
                    },
                );
            }
            None => {
                new_tree.remove(&conflict.path);
            }
        }
        tx.view_mut().graph.apply_patch(
            &owner,
            ChangePatch {
                tree: Some(new_tree),
                ..Default::default()
            },
        )?;
        tx.view_mut().conflicts.remove(conflict_id);
        let has_conflict = !tx.view().conflicts.for_change(&owner).is_empty();
        tx.view_mut()
            .graph
            .set_flags(&owner, None, Some(has_conflict))?;
        let outcome = rewrite::rebase_descendants(
            tx.view_mut(),
            self.git.as_ref(),
            &self.drivers,
            &owner,
            old_tree,
        )?;
        self.queue_rebase_events(&outcome);
        tx.record_projection(owner);
        tx.record_projections(outcome.rebased);
        Ok(())
    }

    /// Creates or moves a local bookmark.
    pub fn bookmark_set(&mut self, name: &str, target: &ChangeId) -> RepoResult<Operation> {
        self.check_reentrancy()?;
        validate_bookmark_name(name)?;
        let mut tx = Transaction::new(&self.view, format!("point bookmark {name} to {}", target.hex()));
        if !tx.view().graph.has(target) {
            return Err(GraphError::NotFound(target.hex()).into());
        }
        let prev_target = tx
            .view()
            .bookmarks
            .get(name, None)
            .map(|bookmark| bookmark.target.clone());
        tx.view_mut()
            .bookmarks
            .upsert(Bookmark::local(name, target.clone()));
        let payload_name = name.to_owned();
        let payload_target = target.clone();
        self.commit_transaction(
            tx,
            |effects| OperationPayload::BookmarkSet {
                name: payload_name,
                remote: None,
                target: payload_target,
                prev_target,
                effects,
            },
            None,
        )
    }

    pub fn bookmark_delete(&mut self, name: &str) -> RepoResult<Operation> {
        self.check_reentrancy()?;
        let mut tx = Transaction::new(&self.view, format!("delete bookmark {name}"));
        let removed = tx
            .view_mut()
            .bookmarks
            .remove(name, None)
            .ok_or_else(|| RefsError::NotFound {
                name: name.to_owned(),
            })?;
        let payload_name = name.to_owned();
        self.commit_transaction(
            tx,
            |effects| OperationPayload::BookmarkDelete {
                name: payload_name,
                remote: None,
                prev_target: removed.target,
                effects,
            },
            None,
        )
    }

    // ---- Git interop ------------------------------------------------------

    /// Imports Git refs: unknown commits become changes (honoring the
    /// `Change-Id` trailer), and bookmarks synchronize 1:1 with the refs.
    pub fn git_import(&mut self) -> RepoResult<GitImportStats> {
        self.check_reentrancy()?;
        let mut tx = Transaction::new(&self.view, "import git refs");
        let stats = git::import(tx.view_mut(), self.git.as_ref(), &self.settings)?;
        for warning in &stats.warnings {
            self.events.queue_async(Event::new(
                events::ERROR,
                EventPayload::Error {
                    event: "git-import".to_owned(),
                    message: warning.clone(),
                },
            ));
        }
        if tx.is_noop() {
            self.events.drain_async();
            return Ok(stats);
        }
        let created = stats.created.clone();
        self.commit_transaction(
            tx,
            |effects| OperationPayload::GitImport { created, effects },
            None,
        )?;
        Ok(stats)
    }

    /// Exports local bookmarks as `refs/heads/*`, removing refs for
    /// deleted bookmarks.
    pub fn git_export(&mut self) -> RepoResult<GitExportStats> {
        self.check_reentrancy()?;
        // Make sure the working copy's state is projected before refs are
        // written.
        self.snapshot()?;
        let stats = git::export(&self.view, self.git.as_ref())?;
        let tx = Transaction::new(&self.view, "export git refs");
        let exported = stats.exported.clone();
        self.commit_transaction(
            tx,
            |effects| OperationPayload::GitExport { exported, effects },
            None,
        )?;
        Ok(stats)
    }

    /// Fetches from a remote, then reconciles through import.
    pub fn git_fetch(&mut self, remote: &str) -> RepoResult<GitImportStats> {
        self.git.fetch(remote)?;
        self.git_import()
    }

    /// Exports, then pushes local bookmarks to the remote.
    pub fn git_push(&mut self, remote: &str) -> RepoResult<()> {
        self.git_export()?;
        let refspecs: Vec<String> = self
            .view
            .bookmarks
            .local_bookmarks()
            .map(|bookmark| format!("refs/heads/{0}:refs/heads/{0}", bookmark.name))
            .collect();
        self.git.push(remote, &refspecs)?;
        Ok(())
    }

    // ---- operation-log surgery --------------------------------------------

    /// Walks the undo cursor back `n` operations, applying inverses, and
    /// records a new `undo` operation (so the undo itself can be undone).
    pub fn undo(&mut self, n: usize) -> RepoResult<Operation> {
        self.check_reentrancy()?;
        let undone: Vec<Operation> = self
            .op_log
            .walk_back(n)?
            .into_iter()
            .cloned()
            .collect();
        let new_cursor = undone
            .last()
            .and_then(|operation| operation.parents.first())
            .cloned()
            .ok_or(OpLogError::NotEnoughHistory {
                requested: n,
                available: undone.len(),
            })?;
        let mut tx = Transaction::new(&self.view, format!("undo {n} operations"));
        for operation in &undone {
            apply_delta(
                tx.view_mut(),
                operation.payload.effects(),
                ApplyDirection::Inverse,
            );
        }
        let undone_ids: Vec<OperationId> =
            undone.iter().map(|operation| operation.op_id.clone()).collect();
        self.commit_transaction(
            tx,
            |effects| OperationPayload::Undo {
                count: n as u32,
                undone: undone_ids,
                effects,
            },
            Some(new_cursor),
        )
    }

    /// Rebuilds the repo state as of `target` by replaying the log from
    /// the root, recorded as a new operation (time travel, not history
    /// rewriting).
    pub fn restore_operation(&mut self, target: &OperationId) -> RepoResult<Operation> {
        self.check_reentrancy()?;
        let restored = self.op_log.replay(target)?;
        let mut tx = Transaction::new(&self.view, format!("restore to operation {}", target.hex()));
        *tx.view_mut() = restored;
        let payload_target = target.clone();
        self.commit_transaction(
            tx,
            |effects| OperationPayload::RestoreOp {
                target: payload_target,
                effects,
            },
            Some(target.clone()),
        )
    }

    /// Applies the inverse of a single operation as a new operation. Fails
    /// with `CONFLICT` if the result would be inconsistent.
    pub fn revert_operation(&mut self, target: &OperationId) -> RepoResult<Operation> {
        self.check_reentrancy()?;
        let operation = self.op_log.get(target)?.clone();
        let mut tx = Transaction::new(&self.view, format!("revert operation {}", target.hex()));
        apply_delta(
            tx.view_mut(),
            operation.payload.effects(),
            ApplyDirection::Inverse,
        );
        tx.view()
            .graph
            .check_integrity()
            .map_err(|source| OpLogError::WouldBreakHistory {
                op_id: target.hex(),
                source,
            })?;
        let payload_target = target.clone();
        self.commit_transaction(
            tx,
            |effects| OperationPayload::RevertOp {
                target: payload_target,
                effects,
            },
            None,
        )
    }

    /// Removes an operation record and relinks its children to its
    /// parents. Rewrites `oplog.jsonl`; the repo state itself is
    /// untouched.
    pub fn abandon_operation(&mut self, target: &OperationId) -> RepoResult<()> {
        self.check_reentrancy()?;
        self.op_log.abandon(target)?;
        let _lock = self.storage.lock()?;
        self.storage.put(OPLOG_KEY, &self.op_log.to_log_bytes()?)?;
        self.persist_op_heads()?;
        Ok(())
    }

    // ---- working-copy file operations -------------------------------------

    pub fn write_file(&mut self, path: &str, contents: &[u8]) -> RepoResult<()> {
        self.working_copy.write_file(path, contents)?;
        Ok(())
    }

    pub fn read_working_copy_file(&self, path: &str) -> RepoResult<Vec<u8>> {
        Ok(self.working_copy.read_file(path)?)
    }

    pub fn move_file(&mut self, from: &str, to: &str) -> RepoResult<()> {
        self.working_copy.move_file(from, to)?;
        Ok(())
    }

    pub fn remove_file(&mut self, path: &str) -> RepoResult<()> {
        self.working_copy.remove_file(path)?;
        Ok(())
    }
}

fn working_copy_key(workspace: &str) -> String {
    if workspace == DEFAULT_WORKSPACE {
        "working-copy.json".to_owned()
    } else {
        format!("workspaces/{workspace}/working-copy.json")
    }
}
