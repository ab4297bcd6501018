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

//! Shared fixtures for pjj-lib tests: a deterministic configuration, an
//! in-memory Git store, and a ready-made repository in a temp directory.

use std::collections::HashMap;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use blake2::{Blake2b512, Digest as _};
use pjj_lib::backend::{
    BackendError, BackendResult, CommitId, FileId, GitCommit, GitStore, Tree, TreeId,
};
use pjj_lib::fs::OsFs;
use pjj_lib::object_id::ObjectId as _;
use pjj_lib::repo::Repo;
use pjj_lib::settings::UserSettings;
use tempfile::TempDir;

pub fn new_temp_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("pjj-test-")
        .tempdir()
        .unwrap()
}

pub fn base_config() -> config::ConfigBuilder<config::builder::DefaultState> {
    config::Config::builder().add_source(config::File::from_str(
        r#"
            user.name = "Test User"
            user.email = "test.user@example.com"
            operation.username = "test-username"
            operation.hostname = "host.example.com"
            debug.randomness-seed = "42"
        "#,
        config::FileFormat::Toml,
    ))
}

pub fn user_settings() -> UserSettings {
    let config = base_config().build().unwrap();
    UserSettings::from_config(config)
}

pub fn user_settings_for(name: &str, email: &str, seed: u64) -> UserSettings {
    let config = config::Config::builder()
        .add_source(config::File::from_str(
            &format!(
                r#"
                    user.name = "{name}"
                    user.email = "{email}"
                    operation.username = "{name}"
                    debug.randomness-seed = "{seed}"
                "#
            ),
            config::FileFormat::Toml,
        ))
        .build()
        .unwrap();
    UserSettings::from_config(config)
}

#[derive(Default)]
struct TestGitStoreInner {
    blobs: HashMap<FileId, Vec<u8>>,
    trees: HashMap<TreeId, Tree>,
    commits: HashMap<CommitId, GitCommit>,
    refs: HashMap<String, CommitId>,
}

/// An in-memory `GitStore` with content-addressed ids, like the real
/// thing but without the object files.
#[derive(Default)]
pub struct TestGitStore {
    inner: Mutex<TestGitStoreInner>,
}

impl Debug for TestGitStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestGitStore").finish_non_exhaustive()
    }
}

impl TestGitStore {
    pub fn new() -> Self {
        TestGitStore::default()
    }

    fn hash(data: &[u8]) -> Vec<u8> {
        Blake2b512::digest(data)[..20].to_vec()
    }

    /// Refs currently stored, for assertions.
    pub fn refs(&self) -> HashMap<String, CommitId> {
        self.inner.lock().unwrap().refs.clone()
    }
}

impl GitStore for TestGitStore {
    fn init(&self) -> BackendResult<()> {
        Ok(())
    }

    fn write_blob(&self, content: &[u8]) -> BackendResult<FileId> {
        let id = FileId::from_bytes(&Self::hash(content));
        self.inner
            .lock()
            .unwrap()
            .blobs
            .insert(id.clone(), content.to_vec());
        Ok(id)
    }

    fn read_blob(&self, id: &FileId) -> BackendResult<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .blobs
            .get(id)
            .cloned()
            .ok_or(BackendError::NotFound)
    }

    fn write_tree(&self, tree: &Tree) -> BackendResult<TreeId> {
        let mut material = vec![];
        for (path, entry) in tree.entries() {
            material.extend(path.as_bytes());
            material.push(0);
            material.extend(entry.id.as_bytes());
            material.push(entry.executable as u8);
        }
        let id = TreeId::from_bytes(&Self::hash(&material));
        self.inner
            .lock()
            .unwrap()
            .trees
            .insert(id.clone(), tree.clone());
        Ok(id)
    }

    fn read_tree(&self, id: &TreeId) -> BackendResult<Tree> {
        self.inner
            .lock()
            .unwrap()
            .trees
            .get(id)
            .cloned()
            .ok_or(BackendError::NotFound)
    }

    fn write_commit(&self, commit: &GitCommit) -> BackendResult<CommitId> {
        let mut material = vec![];
        for parent in &commit.parents {
            material.extend(parent.as_bytes());
        }
        material.extend(commit.tree.as_bytes());
        material.extend(commit.message.as_bytes());
        material.extend(commit.author.name.as_bytes());
        material.extend(commit.author.email.as_bytes());
        material.extend(commit.author.timestamp.timestamp.0.to_le_bytes());
        material.extend(commit.committer.timestamp.timestamp.0.to_le_bytes());
        let id = CommitId::from_bytes(&Self::hash(&material));
        self.inner
            .lock()
            .unwrap()
            .commits
            .insert(id.clone(), commit.clone());
        Ok(id)
    }

    fn read_commit(&self, id: &CommitId) -> BackendResult<GitCommit> {
        self.inner
            .lock()
            .unwrap()
            .commits
            .get(id)
            .cloned()
            .ok_or(BackendError::NotFound)
    }

    fn resolve_ref(&self, name: &str) -> BackendResult<Option<CommitId>> {
        Ok(self.inner.lock().unwrap().refs.get(name).cloned())
    }

    fn update_ref(&self, name: &str, target: &CommitId) -> BackendResult<()> {
        self.inner
            .lock()
            .unwrap()
            .refs
            .insert(name.to_owned(), target.clone());
        Ok(())
    }

    fn delete_ref(&self, name: &str) -> BackendResult<()> {
        self.inner.lock().unwrap().refs.remove(name);
        Ok(())
    }

    fn list_refs(&self, prefix: &str) -> BackendResult<Vec<(String, CommitId)>> {
        let inner = self.inner.lock().unwrap();
        let mut refs: Vec<(String, CommitId)> = inner
            .refs
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, target)| (name.clone(), target.clone()))
            .collect();
        refs.sort();
        Ok(refs)
    }

    fn fetch(&self, _remote: &str) -> BackendResult<()> {
        Ok(())
    }

    fn push(&self, _remote: &str, _refspecs: &[String]) -> BackendResult<()> {
        Ok(())
    }
}

pub struct TestRepo {
    _temp_dir: TempDir,
    pub repo: Repo,
    pub git: Arc<TestGitStore>,
    workspace_root: PathBuf,
}

impl TestRepo {
    pub fn init() -> Self {
        Self::init_with_settings(user_settings())
    }

    pub fn init_with_settings(settings: UserSettings) -> Self {
        let temp_dir = new_temp_dir();
        let workspace_root = temp_dir.path().join("repo");
        std::fs::create_dir(&workspace_root).unwrap();
        let git = Arc::new(TestGitStore::new());
        let repo = Repo::init(
            settings,
            Arc::new(OsFs),
            git.clone() as Arc<dyn GitStore>,
            &workspace_root,
        )
        .unwrap();
        TestRepo {
            _temp_dir: temp_dir,
            repo,
            git,
            workspace_root,
        }
    }

    pub fn root(&self) -> &PathBuf {
        &self.workspace_root
    }

    /// Reloads the repository from disk, as a fresh process would.
    pub fn reload(&self) -> Repo {
        Repo::load(
            user_settings(),
            Arc::new(OsFs),
            self.git.clone() as Arc<dyn GitStore>,
            &self.workspace_root,
        )
        .unwrap()
    }

    pub fn write_file(&mut self, path: &str, contents: &str) {
        self.repo.write_file(path, contents.as_bytes()).unwrap();
    }

    pub fn read_file(&self, path: &str) -> String {
        String::from_utf8(self.repo.read_working_copy_file(path).unwrap()).unwrap()
    }

    /// The serialized metadata files, for bit-for-bit comparisons.
    pub fn serialized_state(&self) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let jj = self.workspace_root.join(".jj");
        (
            std::fs::read(jj.join("graph.json")).unwrap(),
            std::fs::read(jj.join("bookmarks.json")).unwrap(),
            std::fs::read(jj.join("conflicts.json")).unwrap(),
        )
    }
}
