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

use pjj_lib::graph::ChangeGraph;
use pretty_assertions::assert_eq;
use testutils::TestRepo;

#[test]
fn test_init_creates_root_and_working_copy() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;

    // Exactly one change is the working copy, sitting on the root change.
    let working_copy = repo.working_copy_change().unwrap();
    assert_eq!(working_copy.parents, vec![ChangeGraph::root_change_id()]);
    assert_eq!(working_copy.description, "");
    assert!(working_copy.empty);
    assert!(!working_copy.has_conflict);
    assert_eq!(repo.view().graph.len(), 2);
    assert_eq!(repo.op_log().len(), 1);
}

#[test]
fn test_init_then_describe() {
    let mut test_repo = TestRepo::init();
    let change_ids_before: Vec<_> = test_repo
        .repo
        .view()
        .graph
        .change_ids()
        .cloned()
        .collect();

    let operation = test_repo.repo.describe(None, "hello").unwrap();
    assert!(operation.is_some());

    let status = test_repo.repo.status().unwrap();
    assert_eq!(status.working_copy.description, "hello");
    assert_eq!(test_repo.repo.op_log().len(), 2);

    // Change ids never move; only the description did.
    let change_ids_after: Vec<_> = test_repo
        .repo
        .view()
        .graph
        .change_ids()
        .cloned()
        .collect();
    assert_eq!(change_ids_after, change_ids_before);
}

#[test]
fn test_describe_same_text_is_noop() {
    let mut test_repo = TestRepo::init();
    test_repo.repo.describe(None, "hello").unwrap();
    let len_before = test_repo.repo.op_log().len();
    assert!(test_repo.repo.describe(None, "hello").unwrap().is_none());
    assert_eq!(test_repo.repo.op_log().len(), len_before);
}

#[test]
fn test_reload_round_trips_state() {
    let mut test_repo = TestRepo::init();
    test_repo.repo.describe(None, "persisted").unwrap();
    test_repo.write_file("a.txt", "contents\n");
    test_repo.repo.snapshot().unwrap().unwrap();

    let reloaded = test_repo.reload();
    assert_eq!(
        reloaded.status().unwrap().working_copy.description,
        "persisted"
    );
    assert_eq!(reloaded.op_log().len(), test_repo.repo.op_log().len());
    assert_eq!(
        reloaded.view().graph.working_copy_id(),
        test_repo.repo.view().graph.working_copy_id()
    );
    assert_eq!(reloaded.view(), test_repo.repo.view());
}
