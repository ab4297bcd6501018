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

//! Per-path three-way merge and the merge-driver registry.
//!
//! Merging works on whole path contents: if both sides equal the base there
//! is no conflict; if exactly one side differs that side wins; otherwise a
//! registered driver gets a chance before a conflict is recorded.

use std::fmt::Debug;
use std::sync::Arc;

use indexmap::IndexMap;
use itertools::Itertools as _;
use serde_json::Value as JsonValue;
use serde_yaml::Value as YamlValue;
use thiserror::Error;

use crate::backend::{BackendError, ChangeId, GitStore, Tree, TreeEntry};
use crate::conflicts::{
    Conflict, ConflictBase, ConflictSide, ConflictType, MarkerStyle, materialize,
};
use crate::error::{ClassifiedError, ErrorKind};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct DriverError {
    pub message: String,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        DriverError {
            message: message.into(),
        }
    }
}

/// A path-specific custom merger consulted before the default three-way
/// rule records a conflict.
pub trait MergeDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// `base` is `None` for add-add conflicts.
    fn merge(&self, base: Option<&str>, ours: &str, theirs: &str) -> Result<String, DriverError>;
}

struct DriverRegistration {
    pattern: glob::Pattern,
    driver: Arc<dyn MergeDriver>,
    strict: bool,
}

/// Maps path globs to drivers. First matching registration wins, so more
/// specific patterns must be registered first.
#[derive(Default)]
pub struct DriverRegistry {
    registrations: Vec<DriverRegistration>,
}

impl Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let patterns = self
            .registrations
            .iter()
            .map(|r| (r.pattern.as_str(), r.driver.name()))
            .collect_vec();
        f.debug_struct("DriverRegistry")
            .field("registrations", &patterns)
            .finish()
    }
}

impl DriverRegistry {
    pub fn empty() -> Self {
        DriverRegistry::default()
    }

    /// The default registry with the built-in drivers.
    pub fn with_builtins() -> Self {
        let mut registry = DriverRegistry::default();
        registry
            .register("package.json", Arc::new(PackageJsonDriver), false)
            .unwrap();
        registry
            .register("*.json", Arc::new(JsonDriver), false)
            .unwrap();
        registry
            .register("*.yaml", Arc::new(YamlDriver), false)
            .unwrap();
        registry
            .register("*.yml", Arc::new(YamlDriver), false)
            .unwrap();
        registry
            .register("*.md", Arc::new(MarkdownDriver), false)
            .unwrap();
        registry
    }

    /// `strict` promotes a driver failure on a matching path to an
    /// operation-level `CONFLICT` error.
    pub fn register(
        &mut self,
        pattern: &str,
        driver: Arc<dyn MergeDriver>,
        strict: bool,
    ) -> Result<(), MergeError> {
        let pattern =
            glob::Pattern::new(pattern).map_err(|err| MergeError::InvalidPattern {
                pattern: pattern.to_owned(),
                message: err.to_string(),
            })?;
        self.registrations.push(DriverRegistration {
            pattern,
            driver,
            strict,
        });
        Ok(())
    }

    fn lookup(&self, path: &str) -> Option<(&Arc<dyn MergeDriver>, bool)> {
        let options = glob::MatchOptions {
            require_literal_separator: false,
            ..Default::default()
        };
        self.registrations
            .iter()
            .find(|r| {
                r.pattern.matches_with(path, options)
                    // Also match against the file name so `*.json` covers
                    // nested paths.
                    || path
                        .rsplit('/')
                        .next()
                        .is_some_and(|name| r.pattern.matches_with(name, options))
            })
            .map(|r| (&r.driver, r.strict))
    }
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Invalid driver pattern \"{pattern}\": {message}")]
    InvalidPattern { pattern: String, message: String },
    #[error("Merge driver failed on {path} in strict mode: {message}")]
    StrictDriverFailure { path: String, message: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl ClassifiedError for MergeError {
    fn kind(&self) -> ErrorKind {
        match self {
            MergeError::InvalidPattern { .. } => ErrorKind::InvalidArgument,
            MergeError::StrictDriverFailure { .. } => ErrorKind::Conflict,
            MergeError::Backend(err) => err.kind(),
        }
    }

    fn context(&self) -> Option<String> {
        match self {
            MergeError::InvalidPattern { pattern, .. } => Some(pattern.clone()),
            MergeError::StrictDriverFailure { path, .. } => Some(path.clone()),
            MergeError::Backend(_) => None,
        }
    }
}

/// One driver failure, reported as a `driver:failed` event by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverFailure {
    pub path: String,
    pub driver: String,
    pub message: String,
}

#[derive(Debug)]
pub struct MergeOutcome {
    pub tree: Tree,
    pub conflicts: Vec<Conflict>,
    pub driver_failures: Vec<DriverFailure>,
}

impl MergeOutcome {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

fn read_content(git: &dyn GitStore, entry: Option<&TreeEntry>) -> Result<Option<String>, MergeError> {
    match entry {
        None => Ok(None),
        Some(entry) => {
            let bytes = git.read_blob(&entry.id)?;
            Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
        }
    }
}

/// Merges `ours` and `theirs` against `base`, path by path. Conflicted
/// paths get their markers (or the surviving side, for file-type
/// conflicts) materialized into the resulting tree; the structured
/// conflict is returned for the caller to record against `owner`.
#[allow(clippy::too_many_arguments)]
pub fn merge_trees(
    git: &dyn GitStore,
    registry: &DriverRegistry,
    owner: &ChangeId,
    base: (&Tree, &ChangeId),
    ours: (&Tree, &ChangeId),
    theirs: (&Tree, &ChangeId),
) -> Result<MergeOutcome, MergeError> {
    let (base_tree, base_change) = base;
    let (ours_tree, ours_change) = ours;
    let (theirs_tree, theirs_change) = theirs;
    let mut paths: Vec<&String> = ours_tree
        .paths()
        .chain(theirs_tree.paths())
        .chain(base_tree.paths())
        .collect();
    paths.sort();
    paths.dedup();

    let mut tree = Tree::default();
    let mut conflicts = vec![];
    let mut driver_failures = vec![];
    for path in paths {
        let b = base_tree.get(path);
        let o = ours_tree.get(path);
        let t = theirs_tree.get(path);
        // Trivial cases: both sides agree, or only one side changed.
        let trivial = if o == t {
            Some(o)
        } else if o == b {
            Some(t)
        } else if t == b {
            Some(o)
        } else {
            None
        };
        if let Some(winner) = trivial {
            if let Some(entry) = winner {
                tree.set(path.clone(), entry.clone());
            }
            continue;
        }

        let base_content = read_content(git, b)?;
        let ours_content = read_content(git, o)?;
        let theirs_content = read_content(git, t)?;
        let conflict_type = match (&b, &o, &t) {
            (None, Some(_), Some(_)) => ConflictType::AddAdd,
            (Some(_), None, Some(_)) => ConflictType::DeleteModify,
            (Some(_), Some(_), None) => ConflictType::ModifyDelete,
            _ => ConflictType::Content,
        };

        let mut driver_failure: Option<DriverFailure> = None;
        if let (Some(ours_content), Some(theirs_content)) = (&ours_content, &theirs_content) {
            if let Some((driver, strict)) = registry.lookup(path) {
                match driver.merge(base_content.as_deref(), ours_content, theirs_content) {
                    Ok(merged) => {
                        let id = git.write_blob(merged.as_bytes())?;
                        let executable = o.map(|e| e.executable).unwrap_or(false);
                        tree.set(path.clone(), TreeEntry { id, executable });
                        continue;
                    }
                    Err(err) => {
                        if strict {
                            return Err(MergeError::StrictDriverFailure {
                                path: path.clone(),
                                message: err.message,
                            });
                        }
                        driver_failure = Some(DriverFailure {
                            path: path.clone(),
                            driver: driver.name().to_owned(),
                            message: err.message,
                        });
                    }
                }
            }
        }

        let sides = vec![
            ConflictSide {
                label: "ours".to_owned(),
                content: ours_content.clone(),
                change_id: ours_change.clone(),
            },
            ConflictSide {
                label: "theirs".to_owned(),
                content: theirs_content.clone(),
                change_id: theirs_change.clone(),
            },
        ];
        let conflict_base = base_content.map(|content| ConflictBase {
            content,
            change_id: base_change.clone(),
        });
        let conflict_id = Conflict::derive_id(owner, path, &sides, conflict_base.as_ref());
        let conflict = Conflict {
            conflict_id,
            owner: owner.clone(),
            path: path.clone(),
            conflict_type,
            sides,
            base: conflict_base,
            driver_failed: driver_failure.is_some(),
            driver_error: driver_failure.as_ref().map(|f| f.message.clone()),
        };

        // Materialize something readable into the tree: markers for
        // two-sided content, the surviving side otherwise.
        let materialized = match conflict_type {
            ConflictType::Content | ConflictType::AddAdd => {
                materialize(&conflict, MarkerStyle::Diff3).expect("both sides have content")
            }
            ConflictType::DeleteModify => conflict.theirs().unwrap().content.clone().unwrap(),
            ConflictType::ModifyDelete => conflict.ours().unwrap().content.clone().unwrap(),
        };
        let id = git.write_blob(materialized.as_bytes())?;
        let executable = o.or(t).map(|e| e.executable).unwrap_or(false);
        tree.set(path.clone(), TreeEntry { id, executable });

        if let Some(failure) = driver_failure {
            driver_failures.push(failure);
        }
        conflicts.push(conflict);
    }
    Ok(MergeOutcome {
        tree,
        conflicts,
        driver_failures,
    })
}

// ---- built-in drivers ------------------------------------------------------

fn merge_json_values(
    base: Option<&JsonValue>,
    ours: &JsonValue,
    theirs: &JsonValue,
    union_keys: bool,
) -> Result<JsonValue, DriverError> {
    if ours == theirs {
        return Ok(ours.clone());
    }
    if base == Some(ours) {
        return Ok(theirs.clone());
    }
    if base == Some(theirs) {
        return Ok(ours.clone());
    }
    match (ours, theirs) {
        (JsonValue::Object(ours_map), JsonValue::Object(theirs_map)) => {
            let base_map = base.and_then(|v| v.as_object());
            let mut keys: Vec<&String> = ours_map
                .keys()
                .chain(theirs_map.keys())
                .chain(base_map.into_iter().flat_map(|m| m.keys()))
                .collect();
            keys.sort();
            keys.dedup();
            let mut merged = serde_json::Map::new();
            for key in keys {
                let b = base_map.and_then(|m| m.get(key));
                let o = ours_map.get(key);
                let t = theirs_map.get(key);
                let value = match (o, t) {
                    (Some(o), Some(t)) => Some(merge_json_values(b, o, t, union_keys)?),
                    (Some(o), None) => {
                        // Deleted on one side; keep only if the other side
                        // changed it (or keys are unioned).
                        if union_keys || b != Some(o) {
                            Some(o.clone())
                        } else {
                            None
                        }
                    }
                    (None, Some(t)) => {
                        if union_keys || b != Some(t) {
                            Some(t.clone())
                        } else {
                            None
                        }
                    }
                    (None, None) => None,
                };
                if let Some(value) = value {
                    merged.insert(key.clone(), value);
                }
            }
            Ok(JsonValue::Object(merged))
        }
        _ => Err(DriverError::new("both sides changed the same value")),
    }
}

/// Structural three-way merge of JSON documents.
pub struct JsonDriver;

impl MergeDriver for JsonDriver {
    fn name(&self) -> &'static str {
        "json"
    }

    fn merge(&self, base: Option<&str>, ours: &str, theirs: &str) -> Result<String, DriverError> {
        let parse = |text: &str| {
            serde_json::from_str::<JsonValue>(text)
                .map_err(|err| DriverError::new(format!("invalid JSON: {err}")))
        };
        let base = base.map(parse).transpose()?;
        let ours = parse(ours)?;
        let theirs = parse(theirs)?;
        let merged = merge_json_values(base.as_ref(), &ours, &theirs, false)?;
        let mut out = serde_json::to_string_pretty(&merged)
            .map_err(|err| DriverError::new(err.to_string()))?;
        out.push('\n');
        Ok(out)
    }
}

const DEPENDENCY_SECTIONS: &[&str] = &[
    "dependencies",
    "devDependencies",
    "peerDependencies",
    "optionalDependencies",
];

/// Like [`JsonDriver`] but dependency maps take the union of both sides.
pub struct PackageJsonDriver;

impl MergeDriver for PackageJsonDriver {
    fn name(&self) -> &'static str {
        "package-json"
    }

    fn merge(&self, base: Option<&str>, ours: &str, theirs: &str) -> Result<String, DriverError> {
        let parse = |text: &str| {
            serde_json::from_str::<JsonValue>(text)
                .map_err(|err| DriverError::new(format!("invalid JSON: {err}")))
        };
        let base = base.map(parse).transpose()?;
        let ours = parse(ours)?;
        let theirs = parse(theirs)?;
        let (ours_map, theirs_map) = match (&ours, &theirs) {
            (JsonValue::Object(o), JsonValue::Object(t)) => (o, t),
            _ => return Err(DriverError::new("package.json must be an object")),
        };
        let base_map = base.as_ref().and_then(|v| v.as_object());
        let mut keys: Vec<&String> = ours_map
            .keys()
            .chain(theirs_map.keys())
            .chain(base_map.into_iter().flat_map(|m| m.keys()))
            .collect();
        keys.sort();
        keys.dedup();
        let mut merged = serde_json::Map::new();
        for key in keys {
            let union_keys = DEPENDENCY_SECTIONS.contains(&key.as_str());
            let b = base_map.and_then(|m| m.get(key));
            let o = ours_map.get(key);
            let t = theirs_map.get(key);
            let value = match (o, t) {
                (Some(o), Some(t)) => Some(merge_json_values(b, o, t, union_keys)?),
                (Some(v), None) | (None, Some(v)) => {
                    if union_keys || b != Some(v) {
                        Some(v.clone())
                    } else {
                        None
                    }
                }
                (None, None) => None,
            };
            if let Some(value) = value {
                merged.insert(key.clone(), value);
            }
        }
        let mut out = serde_json::to_string_pretty(&JsonValue::Object(merged))
            .map_err(|err| DriverError::new(err.to_string()))?;
        out.push('\n');
        Ok(out)
    }
}

fn merge_yaml_values(
    base: Option<&YamlValue>,
    ours: &YamlValue,
    theirs: &YamlValue,
) -> Result<YamlValue, DriverError> {
    if ours == theirs {
        return Ok(ours.clone());
    }
    if base == Some(ours) {
        return Ok(theirs.clone());
    }
    if base == Some(theirs) {
        return Ok(ours.clone());
    }
    match (ours, theirs) {
        (YamlValue::Mapping(ours_map), YamlValue::Mapping(theirs_map)) => {
            let base_map = base.and_then(|v| v.as_mapping());
            let mut keys: Vec<YamlValue> = ours_map.keys().cloned().collect();
            for key in theirs_map.keys() {
                if !ours_map.contains_key(key) {
                    keys.push(key.clone());
                }
            }
            let mut merged = serde_yaml::Mapping::new();
            for key in keys {
                let b = base_map.and_then(|m| m.get(&key));
                let o = ours_map.get(&key);
                let t = theirs_map.get(&key);
                let value = match (o, t) {
                    (Some(o), Some(t)) => Some(merge_yaml_values(b, o, t)?),
                    (Some(v), None) | (None, Some(v)) => {
                        if b != Some(v) {
                            Some(v.clone())
                        } else {
                            None
                        }
                    }
                    (None, None) => None,
                };
                if let Some(value) = value {
                    merged.insert(key, value);
                }
            }
            Ok(YamlValue::Mapping(merged))
        }
        _ => Err(DriverError::new("both sides changed the same value")),
    }
}

/// Structural three-way merge of YAML documents.
pub struct YamlDriver;

impl MergeDriver for YamlDriver {
    fn name(&self) -> &'static str {
        "yaml"
    }

    fn merge(&self, base: Option<&str>, ours: &str, theirs: &str) -> Result<String, DriverError> {
        let parse = |text: &str| {
            serde_yaml::from_str::<YamlValue>(text)
                .map_err(|err| DriverError::new(format!("invalid YAML: {err}")))
        };
        let base = base.map(parse).transpose()?;
        let ours = parse(ours)?;
        let theirs = parse(theirs)?;
        let merged = merge_yaml_values(base.as_ref(), &ours, &theirs)?;
        serde_yaml::to_string(&merged).map_err(|err| DriverError::new(err.to_string()))
    }
}

fn markdown_sections(text: &str) -> IndexMap<String, String> {
    // The preamble before the first heading is keyed by the empty string.
    let mut sections: IndexMap<String, String> = IndexMap::new();
    let mut current = String::new();
    sections.insert(current.clone(), String::new());
    for line in text.split_inclusive('\n') {
        if line.starts_with('#') {
            current = line.trim_end().to_owned();
            sections.entry(current.clone()).or_default();
        }
        sections.get_mut(&current).unwrap().push_str(line);
    }
    sections.retain(|key, body| !key.is_empty() || !body.is_empty());
    sections
}

/// Three-way merge of Markdown, one heading-delimited section at a time.
pub struct MarkdownDriver;

impl MergeDriver for MarkdownDriver {
    fn name(&self) -> &'static str {
        "markdown"
    }

    fn merge(&self, base: Option<&str>, ours: &str, theirs: &str) -> Result<String, DriverError> {
        let base_sections = base.map(markdown_sections).unwrap_or_default();
        let ours_sections = markdown_sections(ours);
        let theirs_sections = markdown_sections(theirs);
        let mut keys: Vec<&String> = ours_sections
            .keys()
            .chain(theirs_sections.keys())
            .chain(base_sections.keys())
            .collect();
        keys = keys.into_iter().unique().collect();
        let mut out = String::new();
        for key in keys {
            let b = base_sections.get(key);
            let o = ours_sections.get(key);
            let t = theirs_sections.get(key);
            let section = match (o, t) {
                (Some(o), Some(t)) => {
                    if o == t || b == Some(t) {
                        Some(o)
                    } else if b == Some(o) {
                        Some(t)
                    } else {
                        return Err(DriverError::new(format!(
                            "both sides changed section \"{key}\""
                        )));
                    }
                }
                (Some(v), None) | (None, Some(v)) => {
                    if b == Some(v) {
                        // Unchanged on one side, deleted on the other.
                        None
                    } else {
                        Some(v)
                    }
                }
                (None, None) => None,
            };
            if let Some(section) = section {
                out.push_str(section);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_driver_merges_disjoint_edits() {
        let driver = JsonDriver;
        let merged = driver
            .merge(
                Some(r#"{"a": 1, "b": 2}"#),
                r#"{"a": 10, "b": 2}"#,
                r#"{"a": 1, "b": 20}"#,
            )
            .unwrap();
        let value: JsonValue = serde_json::from_str(&merged).unwrap();
        assert_eq!(value["a"], 10);
        assert_eq!(value["b"], 20);
    }

    #[test]
    fn test_json_driver_fails_on_same_key() {
        let driver = JsonDriver;
        let err = driver
            .merge(Some(r#"{"a": 1}"#), r#"{"a": 2}"#, r#"{"a": 3}"#)
            .unwrap_err();
        assert!(err.message.contains("both sides"));
    }

    #[test]
    fn test_package_json_driver_unions_dependencies() {
        let driver = PackageJsonDriver;
        let merged = driver
            .merge(
                Some(r#"{"dependencies": {"left": "1.0.0"}}"#),
                r#"{"dependencies": {"left": "1.0.0", "extra": "2.0.0"}}"#,
                r#"{"dependencies": {"left": "1.0.0", "other": "3.0.0"}}"#,
            )
            .unwrap();
        let value: JsonValue = serde_json::from_str(&merged).unwrap();
        let deps = value["dependencies"].as_object().unwrap();
        assert_eq!(deps.len(), 3);
        assert_eq!(deps["extra"], "2.0.0");
        assert_eq!(deps["other"], "3.0.0");
    }

    #[test]
    fn test_yaml_driver_merges_mappings() {
        let driver = YamlDriver;
        let merged = driver
            .merge(Some("a: 1\nb: 2\n"), "a: 10\nb: 2\n", "a: 1\nb: 20\n")
            .unwrap();
        let value: YamlValue = serde_yaml::from_str(&merged).unwrap();
        assert_eq!(value["a"], YamlValue::from(10));
        assert_eq!(value["b"], YamlValue::from(20));
    }

    #[test]
    fn test_markdown_driver_merges_sections() {
        let driver = MarkdownDriver;
        let base = "# One\nbase one\n# Two\nbase two\n";
        let ours = "# One\nours one\n# Two\nbase two\n";
        let theirs = "# One\nbase one\n# Two\ntheirs two\n";
        let merged = driver.merge(Some(base), ours, theirs).unwrap();
        assert!(merged.contains("ours one"));
        assert!(merged.contains("theirs two"));

        let both = driver.merge(Some(base), ours, "# One\nother one\n# Two\nbase two\n");
        assert!(both.is_err());
    }

    #[test]
    fn test_registry_first_match_wins() {
        let registry = DriverRegistry::with_builtins();
        let (driver, _) = registry.lookup("package.json").unwrap();
        assert_eq!(driver.name(), "package-json");
        let (driver, _) = registry.lookup("config/settings.json").unwrap();
        assert_eq!(driver.name(), "json");
        assert!(registry.lookup("main.rs").is_none());
    }
}
