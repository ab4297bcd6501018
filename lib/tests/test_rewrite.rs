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

use pjj_lib::backend::ChangeId;
use pjj_lib::error::{ClassifiedError as _, ErrorKind};
use testutils::TestRepo;

/// root <- a <- b <- c with one file per change, working copy on `c`.
fn chain_repo() -> (TestRepo, ChangeId, ChangeId, ChangeId) {
    let mut test_repo = TestRepo::init();
    let a = test_repo.repo.working_copy_id().clone();
    test_repo.repo.describe(None, "a").unwrap();
    test_repo.write_file("a.txt", "a\n");
    let b = test_repo.repo.new_change(vec![a.clone()], "b").unwrap();
    test_repo.write_file("b.txt", "b\n");
    let c = test_repo.repo.new_change(vec![b.clone()], "c").unwrap();
    test_repo.write_file("c.txt", "c\n");
    test_repo.repo.snapshot().unwrap().unwrap();
    (test_repo, a, b, c)
}

#[test]
fn test_rebase_preserves_change_ids() {
    let (mut test_repo, a, b, c) = chain_repo();
    let commit_b = test_repo.repo.change(&b).unwrap().commit_id.clone();
    let commit_c = test_repo.repo.change(&c).unwrap().commit_id.clone();

    // A no-op-parent rebase still rewrites commits.
    test_repo.repo.rebase(&b, vec![a.clone()]).unwrap();
    assert_eq!(test_repo.repo.change(&b).unwrap().parents, vec![a.clone()]);
    assert_ne!(test_repo.repo.change(&b).unwrap().commit_id, commit_b);
    assert_ne!(test_repo.repo.change(&c).unwrap().commit_id, commit_c);

    // Rewriting `a`'s description cascades new commits through b and c,
    // while every change id stays put.
    let commit_b = test_repo.repo.change(&b).unwrap().commit_id.clone();
    test_repo.repo.describe(Some(&a), "a rewritten").unwrap();
    assert!(test_repo.repo.view().graph.has(&b));
    assert!(test_repo.repo.view().graph.has(&c));
    assert_ne!(test_repo.repo.change(&b).unwrap().commit_id, commit_b);
    assert!(test_repo.repo.view().graph.is_ancestor(&a, &c));
}

#[test]
fn test_evolution_grows_per_rewrite() {
    let mut test_repo = TestRepo::init();
    let a = test_repo.repo.working_copy_id().clone();
    test_repo.write_file("f.txt", "content\n");
    test_repo.repo.snapshot().unwrap().unwrap();
    assert_eq!(test_repo.repo.evolution(&a).unwrap().len(), 0);

    test_repo.repo.describe(Some(&a), "first rewrite").unwrap();
    assert_eq!(test_repo.repo.evolution(&a).unwrap().len(), 1);
    test_repo.repo.describe(Some(&a), "second rewrite").unwrap();
    assert_eq!(test_repo.repo.evolution(&a).unwrap().len(), 2);

    // Prior commits stay readable through the Git store.
    for commit_id in test_repo.repo.evolution(&a).unwrap() {
        use pjj_lib::backend::GitStore as _;
        test_repo.git.read_commit(commit_id).unwrap();
    }
}

#[test]
fn test_rewrite_patch_keeps_change_id() {
    use pjj_lib::backend::Signature;
    use pjj_lib::graph::ChangePatch;

    let (mut test_repo, a, b, c) = chain_repo();
    let commit_c = test_repo.repo.change(&c).unwrap().commit_id.clone();
    let new_author = Signature {
        name: "Someone Else".to_owned(),
        email: "someone.else@example.com".to_owned(),
        timestamp: test_repo.repo.change(&a).unwrap().author.timestamp.clone(),
    };
    let operation = test_repo
        .repo
        .rewrite(
            &a,
            ChangePatch {
                author: Some(new_author),
                ..Default::default()
            },
        )
        .unwrap()
        .unwrap();
    assert_eq!(operation.payload.kind(), "rewrite");
    let rewritten = test_repo.repo.change(&a).unwrap();
    assert_eq!(rewritten.author.email, "someone.else@example.com");
    assert_eq!(rewritten.change_id, a);
    // The cascade reprojected the descendants too.
    assert!(test_repo.repo.view().graph.has(&b));
    assert_ne!(test_repo.repo.change(&c).unwrap().commit_id, commit_c);
    // Re-applying the same patch is a no-op.
    let rewritten = rewritten.clone();
    assert!(test_repo
        .repo
        .rewrite(
            &a,
            ChangePatch {
                author: Some(rewritten.author),
                ..Default::default()
            },
        )
        .unwrap()
        .is_none());
}

#[test]
fn test_auto_rebase_preserves_content() {
    let (mut test_repo, a, _b, c) = chain_repo();
    test_repo.repo.edit(&a).unwrap();
    test_repo.write_file("a.txt", "a changed\n");
    test_repo.repo.snapshot().unwrap().unwrap();

    // Descendants were re-merged onto the rewritten `a`; their own files
    // survived and the rewrite's content flowed through.
    let c_change = test_repo.repo.change(&c).unwrap();
    assert!(c_change.tree.get("b.txt").is_some());
    assert!(c_change.tree.get("c.txt").is_some());
    let a_entry = test_repo.repo.change(&a).unwrap().tree.get("a.txt").cloned();
    assert_eq!(c_change.tree.get("a.txt").cloned(), a_entry);
    assert!(test_repo.repo.conflicts().is_empty());
}

#[test]
fn test_abandon_rebases_descendants_onto_parents() {
    let (mut test_repo, a, b, c) = chain_repo();
    test_repo.repo.abandon(&b).unwrap();
    assert!(test_repo.repo.change(&b).unwrap().abandoned);
    // `c` moved onto `a`, keeping its own diff while `b`'s content went
    // away with `b`.
    let c_change = test_repo.repo.change(&c).unwrap();
    assert_eq!(c_change.parents, vec![a]);
    assert!(c_change.tree.get("c.txt").is_some());
    assert!(c_change.tree.get("b.txt").is_none());
    // Abandoned changes no longer count as visible heads.
    assert_eq!(test_repo.repo.view().graph.visible_heads(), vec![c]);
}

#[test]
fn test_abandoning_working_copy_creates_replacement() {
    let mut test_repo = TestRepo::init();
    let a = test_repo.repo.working_copy_id().clone();
    test_repo.write_file("f.txt", "x\n");
    let b = test_repo.repo.new_change(vec![a.clone()], "doomed").unwrap();
    test_repo.repo.abandon(&b).unwrap();
    let replacement = test_repo.repo.working_copy_id().clone();
    assert_ne!(replacement, b);
    assert_eq!(test_repo.repo.change(&replacement).unwrap().parents, vec![a]);
}

#[test]
fn test_rebase_onto_descendant_is_a_cycle() {
    let (mut test_repo, _a, b, c) = chain_repo();
    let err = test_repo.repo.rebase(&b, vec![c]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_squash_folds_into_parent() {
    let (mut test_repo, _a, b, c) = chain_repo();
    test_repo.repo.squash(&c, None).unwrap();
    let b_change = test_repo.repo.change(&b).unwrap();
    assert!(b_change.tree.get("c.txt").is_some());
    assert!(b_change.description.contains('b'));
    assert!(b_change.description.contains('c'));
    assert!(test_repo.repo.change(&c).unwrap().abandoned);
    // The working copy was on `c`, so it followed the content.
    assert_eq!(test_repo.repo.working_copy_id(), &b);
}

#[test]
fn test_split_moves_remainder_to_child() {
    let mut test_repo = TestRepo::init();
    let a = test_repo.repo.working_copy_id().clone();
    test_repo.write_file("keep.txt", "keep\n");
    test_repo.write_file("rest.txt", "rest\n");
    test_repo.repo.snapshot().unwrap().unwrap();

    let child = test_repo
        .repo
        .split(&a, &["keep.txt".to_owned()])
        .unwrap();
    let first = test_repo.repo.change(&a).unwrap();
    assert!(first.tree.get("keep.txt").is_some());
    assert!(first.tree.get("rest.txt").is_none());
    let second = test_repo.repo.change(&child).unwrap();
    assert_eq!(second.parents, vec![a]);
    assert!(second.tree.get("rest.txt").is_some());
    // The working copy follows the remainder.
    assert_eq!(test_repo.repo.working_copy_id(), &child);
}

#[test]
fn test_duplicate_gets_fresh_change_id() {
    let (mut test_repo, _a, b, _c) = chain_repo();
    let copy = test_repo.repo.duplicate(&b).unwrap();
    assert_ne!(copy, b);
    let original = test_repo.repo.change(&b).unwrap().clone();
    let duplicated = test_repo.repo.change(&copy).unwrap();
    assert_eq!(duplicated.description, original.description);
    assert_eq!(duplicated.tree, original.tree);
    assert_eq!(duplicated.parents, original.parents);
}

#[test]
fn test_parallelize_makes_siblings() {
    let (mut test_repo, a, b, c) = chain_repo();
    // Park the working copy elsewhere so it doesn't interfere.
    test_repo.repo.edit(&a).unwrap();
    test_repo.repo.parallelize(&[b.clone(), c.clone()]).unwrap();
    assert_eq!(test_repo.repo.change(&b).unwrap().parents, vec![a.clone()]);
    assert_eq!(test_repo.repo.change(&c).unwrap().parents, vec![a]);
}
