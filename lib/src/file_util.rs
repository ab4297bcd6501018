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

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

/// Writes `contents` to `path` atomically: write to a temp file in the same
/// directory, fsync, then rename over the target. Metadata files under
/// `.jj` are only ever replaced this way, so readers observe either the
/// old state or the new one.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().expect("target must have a parent directory");
    let mut temp_file = NamedTempFile::new_in(dir)?;
    temp_file.write_all(contents)?;
    temp_file.as_file().sync_all()?;
    temp_file.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_creates_and_replaces() {
        let temp_dir = tempfile::tempdir().unwrap();
        let target = temp_dir.path().join("graph.json");
        write_atomic(&target, b"{\"changes\":{}}\n").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"{\"changes\":{}}\n");
        write_atomic(&target, b"{}\n").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"{}\n");
    }

    #[test]
    fn test_write_atomic_leaves_no_temp_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let target = temp_dir.path().join("bookmarks.json");
        write_atomic(&target, b"{}\n").unwrap();
        let entries: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec!["bookmarks.json"]);
    }
}
