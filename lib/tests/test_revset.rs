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

use std::sync::Arc;

use pjj_lib::backend::GitStore;
use pjj_lib::error::{ClassifiedError as _, ErrorKind};
use pjj_lib::fs::OsFs;
use pjj_lib::repo::Repo;
use testutils::{user_settings_for, TestRepo};

#[test]
fn test_log_mine_nonempty_recent() {
    // Five changes authored alternately by Alice and Bob; the query runs
    // as Alice.
    let mut test_repo = TestRepo::init();
    let mut expected_mine = vec![];
    for i in 1..=5u64 {
        let alice_turn = i % 2 == 1;
        let settings = if alice_turn {
            user_settings_for("Test User", "test.user@example.com", 100 + i)
        } else {
            user_settings_for("Bob", "bob@example.com", 100 + i)
        };
        let mut repo = Repo::load(
            settings,
            Arc::new(OsFs),
            test_repo.git.clone() as Arc<dyn GitStore>,
            test_repo.root(),
        )
        .unwrap();
        let parent = repo.working_copy_id().clone();
        let id = repo
            .new_change(vec![parent], &format!("change {i}"))
            .unwrap();
        std::fs::write(
            test_repo.root().join(format!("file{i}.txt")),
            format!("content {i}\n"),
        )
        .unwrap();
        repo.snapshot().unwrap().unwrap();
        if alice_turn {
            expected_mine.push(id);
        }
    }
    // Pick the on-disk state back up in the main handle.
    test_repo.repo = test_repo.reload();

    let changes = test_repo
        .repo
        .log("mine() & ~empty() & last(7d)")
        .unwrap();
    let ids: Vec<_> = changes.iter().map(|c| c.change_id.clone()).collect();
    // Alice's non-empty changes, newest first.
    expected_mine.reverse();
    assert_eq!(ids, expected_mine);
    for change in &changes {
        assert_eq!(change.author.email, "test.user@example.com");
        assert!(!change.empty);
    }
}

#[test]
fn test_log_ancestors_of_heads_is_visible_set() {
    let mut test_repo = TestRepo::init();
    let a = test_repo.repo.working_copy_id().clone();
    test_repo.write_file("a.txt", "a\n");
    let b = test_repo.repo.new_change(vec![a.clone()], "b").unwrap();
    test_repo.write_file("b.txt", "b\n");
    test_repo.repo.snapshot().unwrap().unwrap();
    let scrap = test_repo.repo.new_change(vec![b.clone()], "scrap").unwrap();
    test_repo.repo.abandon(&scrap).unwrap();

    let reachable = test_repo.repo.log("ancestors(heads(all()))").unwrap();
    let visible: Vec<_> = test_repo
        .repo
        .log("all()")
        .unwrap()
        .into_iter()
        .filter(|change| !change.abandoned)
        .collect();
    assert_eq!(
        reachable.iter().map(|c| &c.change_id).collect::<Vec<_>>(),
        visible.iter().map(|c| &c.change_id).collect::<Vec<_>>()
    );
}

#[test]
fn test_log_bookmark_and_file_queries() {
    let mut test_repo = TestRepo::init();
    let a = test_repo.repo.working_copy_id().clone();
    test_repo.write_file("src/lib.rs", "fn lib() {}\n");
    let b = test_repo.repo.new_change(vec![a.clone()], "docs").unwrap();
    test_repo.write_file("docs/readme.md", "readme\n");
    test_repo.repo.snapshot().unwrap().unwrap();
    test_repo.repo.bookmark_set("main", &a).unwrap();

    let by_bookmark = test_repo.repo.log("bookmark(main)").unwrap();
    assert_eq!(by_bookmark.len(), 1);
    assert_eq!(by_bookmark[0].change_id, a);

    let by_file = test_repo.repo.log("file(\"glob:src/**\")").unwrap();
    assert_eq!(by_file.len(), 1);
    assert_eq!(by_file[0].change_id, a);

    let by_description = test_repo.repo.log("description(docs)").unwrap();
    assert_eq!(by_description.len(), 1);
    assert_eq!(by_description[0].change_id, b);
}

#[test]
fn test_log_parse_error_kinds() {
    let test_repo = TestRepo::init();
    let err = test_repo.repo.log("mine( &").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ParseError);

    let err = test_repo.repo.log("ancestor(@)").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ParseError);
    assert!(err.suggestion().unwrap().contains("ancestors"));

    let err = test_repo.repo.log("latest(@)").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = test_repo.repo.log("no_such_bookmark").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_log_change_id_prefix() {
    let test_repo = TestRepo::init();
    let wc = test_repo.repo.working_copy_id().clone();
    use pjj_lib::object_id::ObjectId as _;
    let prefix = &wc.hex()[..12];
    let found = test_repo.repo.log(prefix).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].change_id, wc);
}
