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

use assert_matches::assert_matches;
use pjj_lib::backend::OperationId;
use pjj_lib::error::{ClassifiedError as _, ErrorKind};
use pjj_lib::op_store::Operation;
use pjj_lib::repo::RepoError;
use testutils::TestRepo;

#[test]
fn test_new_then_undo() {
    let mut test_repo = TestRepo::init();
    test_repo.repo.describe(None, "hello").unwrap();
    let prior_wc = test_repo.repo.working_copy_id().clone();
    assert_eq!(test_repo.repo.op_log().len(), 2);

    let new_id = test_repo
        .repo
        .new_change(vec![prior_wc.clone()], "work")
        .unwrap();
    assert_eq!(test_repo.repo.working_copy_id(), &new_id);
    assert_eq!(
        test_repo.repo.change(&new_id).unwrap().parents,
        vec![prior_wc.clone()]
    );
    assert_eq!(test_repo.repo.op_log().len(), 3);

    // First undo removes the new change and puts the pointer back.
    test_repo.repo.undo(1).unwrap();
    assert_eq!(test_repo.repo.working_copy_id(), &prior_wc);
    assert!(!test_repo.repo.view().graph.has(&new_id));
    assert_eq!(test_repo.repo.op_log().len(), 4);

    // The cursor kept walking: a second undo peels the describe, not the
    // first undo.
    test_repo.repo.undo(1).unwrap();
    assert_eq!(
        test_repo.repo.status().unwrap().working_copy.description,
        ""
    );
    assert_eq!(test_repo.repo.op_log().len(), 5);
    let kinds: Vec<_> = test_repo
        .repo
        .op_log()
        .iter()
        .map(|operation| operation.payload.kind())
        .collect();
    assert_eq!(kinds, vec!["init", "describe", "new", "undo", "undo"]);
}

#[test]
fn test_undo_round_trip_is_bit_for_bit() {
    let mut test_repo = TestRepo::init();
    test_repo.repo.describe(None, "before").unwrap();
    let wc = test_repo.repo.working_copy_id().clone();
    test_repo.repo.bookmark_set("main", &wc).unwrap();
    let (graph_before, bookmarks_before, conflicts_before) = test_repo.serialized_state();

    test_repo.repo.describe(None, "after").unwrap();
    test_repo.repo.undo(1).unwrap();

    let (graph_after, bookmarks_after, conflicts_after) = test_repo.serialized_state();
    assert_eq!(graph_after, graph_before);
    assert_eq!(bookmarks_after, bookmarks_before);
    assert_eq!(conflicts_after, conflicts_before);
}

#[test]
fn test_undo_of_bookmark_ops() {
    let mut test_repo = TestRepo::init();
    let wc = test_repo.repo.working_copy_id().clone();
    test_repo.repo.bookmark_set("main", &wc).unwrap();
    assert!(test_repo.repo.view().bookmarks.get("main", None).is_some());
    test_repo.repo.undo(1).unwrap();
    assert!(test_repo.repo.view().bookmarks.get("main", None).is_none());

    // Undoing a delete brings the bookmark back.
    test_repo.repo.bookmark_set("main", &wc).unwrap();
    test_repo.repo.bookmark_delete("main").unwrap();
    test_repo.repo.undo(1).unwrap();
    assert_eq!(
        test_repo.repo.view().bookmarks.get("main", None).unwrap().target,
        wc
    );
}

#[test]
fn test_undo_too_far_fails() {
    let mut test_repo = TestRepo::init();
    let err = test_repo.repo.undo(5).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_oplog_is_one_json_record_per_line() {
    let mut test_repo = TestRepo::init();
    test_repo.repo.describe(None, "first").unwrap();
    test_repo.repo.describe(None, "second").unwrap();
    let oplog = std::fs::read(test_repo.root().join(".jj/oplog.jsonl")).unwrap();
    let lines: Vec<&[u8]> = oplog
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .collect();
    assert_eq!(lines.len(), 3);
    for line in lines {
        let operation = Operation::from_line(line).unwrap();
        // Stored ids match a recomputation over the record's own fields.
        let recomputed = pjj_lib::op_store::compute_op_id(
            &operation.parents,
            &operation.timestamp,
            &operation.user,
            &operation.payload,
        )
        .unwrap();
        assert_eq!(operation.op_id, recomputed);
    }
}

#[test]
fn test_operation_abandon_relinks_children() {
    // O1 <- O2 <- O3 (on top of init); abandoning O2 relinks O3 to O1.
    let mut test_repo = TestRepo::init();
    test_repo.repo.describe(None, "one").unwrap();
    test_repo.repo.describe(None, "two").unwrap();
    test_repo.repo.describe(None, "three").unwrap();
    let ids: Vec<OperationId> = test_repo
        .repo
        .op_log()
        .iter()
        .map(|operation| operation.op_id.clone())
        .collect();
    let (o1, o2, o3) = (ids[1].clone(), ids[2].clone(), ids[3].clone());

    test_repo.repo.abandon_operation(&o2).unwrap();
    assert_eq!(test_repo.repo.op_log().head_id(), &o3);
    assert_eq!(test_repo.repo.op_log().get(&o3).unwrap().parents, vec![o1]);
    assert!(test_repo.repo.op_log().get(&o2).is_err());

    // Replaying through the relinked head reproduces the current state
    // minus O2's effect (the final describe overwrote it anyway).
    let operation = test_repo.repo.restore_operation(&o3).unwrap();
    assert_eq!(operation.payload.kind(), "restore-op");
    assert_eq!(
        test_repo.repo.status().unwrap().working_copy.description,
        "three"
    );
}

#[test]
fn test_restore_operation_time_travels() {
    let mut test_repo = TestRepo::init();
    test_repo.repo.describe(None, "old").unwrap();
    let target = test_repo.repo.op_log().head_id().clone();
    test_repo.repo.describe(None, "new").unwrap();
    let wc = test_repo.repo.working_copy_id().clone();
    test_repo.repo.new_change(vec![wc], "scrap").unwrap();

    test_repo.repo.restore_operation(&target).unwrap();
    assert_eq!(
        test_repo.repo.status().unwrap().working_copy.description,
        "old"
    );
    // Time travel appends; it never rewrites the log.
    assert_eq!(test_repo.repo.op_log().len(), 5);
}

#[test]
fn test_revert_operation() {
    let mut test_repo = TestRepo::init();
    test_repo.repo.describe(None, "keep").unwrap();
    let target = test_repo.repo.op_log().head_id().clone();
    test_repo.repo.describe(None, "discard").unwrap();

    // Reverting the "keep" describe swings the description back to its
    // prev image, leaving later history in place.
    test_repo.repo.revert_operation(&target).unwrap();
    assert_eq!(
        test_repo.repo.status().unwrap().working_copy.description,
        ""
    );
    assert_eq!(test_repo.repo.op_log().len(), 4);
}

#[test]
fn test_abandon_operation_that_created_a_change_fails() {
    let mut test_repo = TestRepo::init();
    let wc = test_repo.repo.working_copy_id().clone();
    let child = test_repo.repo.new_change(vec![wc], "base").unwrap();
    let new_op = test_repo.repo.op_log().head_id().clone();
    // A later operation builds on the created change.
    test_repo.repo.new_change(vec![child], "on top").unwrap();

    let err = test_repo.repo.abandon_operation(&new_op).unwrap_err();
    assert_matches!(err, RepoError::OpLog(_));
    assert_eq!(err.kind(), ErrorKind::Conflict);
}
