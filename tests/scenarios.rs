//! End-to-end passes over an in-memory bus: the overlap classes, scoped
//! verification failures, and dependency-ordered batching.

mod common;
use common::*;

use ariadne::config::AriadneConfig;
use ariadne::model::batch::MergeBatch;
use ariadne::model::conflict::{Conflict, ConflictType, MergeStrategy, Resolution};
use ariadne::model::diff::{Diff, DiffStatus, RejectionReason};
use ariadne::model::types::DiffId;
use ariadne::model::work::{WorkPackage, WorkStatus};
use ariadne::store::{BusStore, MemoryStore};

fn status_of(store: &MemoryStore, id: &DiffId) -> DiffStatus {
    store.require::<Diff>(id.as_str()).unwrap().status
}

fn batch(store: &MemoryStore, id: &ariadne::model::types::BatchId) -> MergeBatch {
    store.require::<MergeBatch>(id.as_str()).unwrap()
}

#[test]
fn disjoint_lines_in_one_file_merge_together_in_submission_order() {
    let (orc, runner) = bus(AriadneConfig::default());
    let a = submit(&orc, modify("wp-a", "auth.py", (1, 10)));
    let b = submit(&orc, modify("wp-b", "auth.py", (50, 60)));

    let report = orc.process_once().unwrap();

    let conflicts = orc.store().all::<Conflict>().unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflict_type, ConflictType::FileOverlap);
    assert_eq!(conflicts[0].strategy, MergeStrategy::Sequential);
    assert_eq!(report.auto_resolved, vec![conflicts[0].id.clone()]);

    // Each diff was checked on its own before the batch check.
    let calls = runner.calls();
    assert_eq!(calls[0], vec!["auth.py".to_owned()]);
    assert_eq!(calls[1], vec!["auth.py".to_owned()]);

    let batch_id = report.batch.expect("one batch");
    assert_eq!(batch(orc.store(), &batch_id).diff_ids, vec![a.clone(), b.clone()]);
    assert_eq!(status_of(orc.store(), &a), DiffStatus::Merged);
    assert_eq!(status_of(orc.store(), &b), DiffStatus::Merged);
}

#[test]
fn overlapping_lines_block_both_until_resolved() {
    let (orc, _runner) = bus(AriadneConfig::default());
    let a = submit(&orc, modify("wp-a", "session.py", (10, 20)));
    let b = submit(&orc, modify("wp-b", "session.py", (15, 25)));

    let report = orc.process_once().unwrap();
    assert!(report.batch.is_none());
    assert_eq!(report.verification.verified.len(), 2);

    let conflict = orc.store().all::<Conflict>().unwrap().remove(0);
    assert_eq!(conflict.conflict_type, ConflictType::LineOverlap);
    assert_eq!(conflict.strategy, MergeStrategy::Escalate);
    assert!(conflict.is_unresolved());

    // A second pass changes nothing while the conflict is open.
    let report = orc.process_once().unwrap();
    assert!(report.batch.is_none());
    assert_eq!(status_of(orc.store(), &a), DiffStatus::Verified);
    assert_eq!(status_of(orc.store(), &b), DiffStatus::Verified);

    orc.resolve(&conflict.id, Resolution::Survivor { diff: a.clone() }, "a is the fix we want")
        .unwrap();
    let loser = orc.store().require::<Diff>(b.as_str()).unwrap();
    assert_eq!(loser.status, DiffStatus::Rejected);
    assert_eq!(loser.rejection.unwrap().reason, RejectionReason::LostConflict);
    let requeued = orc.store().require::<WorkPackage>("wp-b").unwrap();
    assert_eq!(requeued.status, WorkStatus::Ready);
    assert_eq!(requeued.requeue_count, 1);

    let report = orc.process_once().unwrap();
    let batch_id = report.batch.expect("survivor merges");
    assert_eq!(batch(orc.store(), &batch_id).diff_ids, vec![a]);
}

#[test]
fn delete_against_modify_is_semantic() {
    let (orc, _runner) = bus(AriadneConfig::default());
    let gone = submit(&orc, delete("wp-a", "legacy.py"));
    let kept = submit(&orc, modify("wp-b", "legacy.py", (3, 4)));

    let report = orc.process_once().unwrap();
    assert!(report.batch.is_none());

    let conflict = orc.store().all::<Conflict>().unwrap().remove(0);
    assert_eq!(conflict.conflict_type, ConflictType::Semantic);
    assert_eq!(conflict.strategy, MergeStrategy::Escalate);
    assert!(conflict.involves(&gone) && conflict.involves(&kept));
}

#[test]
fn two_deletes_of_one_file_never_share_a_batch() {
    let (orc, _runner) = bus(AriadneConfig::default());
    let first = submit(&orc, delete("wp-a", "legacy.py"));
    let second = submit(&orc, delete("wp-b", "legacy.py"));

    let report = orc.process_once().unwrap();
    assert!(report.batch.is_none());
    assert!(report.auto_resolved.is_empty());
    let conflict = orc.store().all::<Conflict>().unwrap().remove(0);
    assert_eq!(conflict.conflict_type, ConflictType::Semantic);
    assert!(conflict.is_unresolved());

    // Even when ordered by hand, the second delete waits for a later batch.
    orc.resolve(&conflict.id, Resolution::Sequential { first: first.clone() }, "either is fine")
        .unwrap();
    let report = orc.process_once().unwrap();
    assert_eq!(batch(orc.store(), report.batch.as_ref().unwrap()).diff_ids, vec![first]);
    assert_eq!(status_of(orc.store(), &second), DiffStatus::Verified);

    let report = orc.process_once().unwrap();
    assert_eq!(batch(orc.store(), report.batch.as_ref().unwrap()).diff_ids, vec![second]);
    assert!(orc.check_invariants().unwrap().is_empty());
}

#[test]
fn sequenced_line_overlap_merges_in_two_batches() {
    let (orc, _runner) = bus(AriadneConfig::default());
    let a = submit(&orc, modify("wp-a", "session.py", (10, 20)));
    let b = submit(&orc, modify("wp-b", "session.py", (15, 25)));
    orc.process_once().unwrap();

    let conflict = orc.store().all::<Conflict>().unwrap().remove(0);
    assert_eq!(conflict.conflict_type, ConflictType::LineOverlap);
    orc.resolve(&conflict.id, Resolution::Sequential { first: b.clone() }, "b then a")
        .unwrap();

    let report = orc.process_once().unwrap();
    assert_eq!(batch(orc.store(), report.batch.as_ref().unwrap()).diff_ids, vec![b]);
    assert_eq!(status_of(orc.store(), &a), DiffStatus::Verified);
    let report = orc.process_once().unwrap();
    assert_eq!(batch(orc.store(), report.batch.as_ref().unwrap()).diff_ids, vec![a]);
}

#[test]
fn sequential_second_waits_while_first_is_unverified() {
    let mut config = AriadneConfig::default();
    config.verification.max_attempts = 10;
    config.merge.auto_resolve.clear();
    let (orc, runner) = bus(config);
    let a = submit(&orc, modify("wp-a", "auth.py", (1, 10)));
    let mut slow = modify("wp-b", "auth.py", (50, 60));
    slow.causal_chain.files.insert("slow.py".to_owned());
    let b = submit(&orc, slow);

    runner.hang_on("slow.py");
    orc.process_once().unwrap();
    let conflict = orc.store().all::<Conflict>().unwrap().remove(0);
    orc.resolve(&conflict.id, Resolution::Sequential { first: b.clone() }, "b lands first")
        .unwrap();

    // a is verified and unblocked, but b has not verified yet.
    let report = orc.process_once().unwrap();
    assert!(report.batch.is_none());
    assert_eq!(status_of(orc.store(), &a), DiffStatus::Verified);
    assert_eq!(status_of(orc.store(), &b), DiffStatus::Pending);

    runner.heal();
    let report = orc.process_once().unwrap();
    assert_eq!(batch(orc.store(), report.batch.as_ref().unwrap()).diff_ids, vec![b, a]);
}

#[test]
fn failing_file_in_causal_chain_rejects_only_that_diff() {
    let (orc, runner) = bus(AriadneConfig::default());
    runner.fail_on("models.py");

    let mut sub = modify("wp-x", "api.py", (1, 5));
    sub.causal_chain.files.extend(["models.py".to_owned(), "utils.py".to_owned()]);
    let broken = submit(&orc, sub);
    let fine = submit(&orc, modify("wp-y", "utils.py", (7, 9)));

    let report = orc.process_once().unwrap();
    assert_eq!(report.verification.rejected, vec![broken.clone()]);

    let diff = orc.store().require::<Diff>(broken.as_str()).unwrap();
    assert_eq!(diff.status, DiffStatus::Rejected);
    let rejection = diff.rejection.unwrap();
    assert_eq!(rejection.reason, RejectionReason::VerificationFailed);
    assert!(rejection.detail.contains("models.py"), "{}", rejection.detail);
    let result = diff.verification.unwrap();
    assert_eq!(result.scope, vec!["api.py", "models.py", "utils.py"]);
    assert_eq!(result.failing_files(), vec!["models.py"]);

    assert_eq!(
        orc.store().require::<WorkPackage>("wp-x").unwrap().status,
        WorkStatus::Ready
    );
    assert_eq!(status_of(orc.store(), &fine), DiffStatus::Merged);
}

#[test]
fn dependent_package_waits_for_a_later_batch() {
    let mut config = AriadneConfig::default();
    config.verification.max_attempts = 10;
    let (orc, runner) = bus(config);
    let store = orc.store();

    plan_and_dispatch(store, "wp-1", &[]);
    plan_and_dispatch(store, "wp-2", &[]);
    plan_and_dispatch(store, "wp-3", &["wp-1"]);
    plan_and_dispatch(store, "wp-4", &[]);
    plan_and_dispatch(store, "wp-5", &[]);
    let ids: Vec<DiffId> = (1..=5)
        .map(|n| {
            orc.submit(modify(&format!("wp-{n}"), &format!("f{n}.py"), (1, 2)))
                .unwrap()
        })
        .collect();

    // Package 3's checks are still running when the first batch forms.
    runner.hang_on("f3.py");
    let first = orc.process_once().unwrap();
    let first_batch = batch(store, first.batch.as_ref().expect("first batch"));
    assert_eq!(
        first_batch.diff_ids,
        vec![ids[0].clone(), ids[1].clone(), ids[3].clone(), ids[4].clone()]
    );
    assert_eq!(status_of(store, &ids[2]), DiffStatus::Pending);
    assert_eq!(store.require::<WorkPackage>("wp-1").unwrap().status, WorkStatus::Done);

    runner.heal();
    let second = orc.process_once().unwrap();
    let second_batch = batch(store, second.batch.as_ref().expect("second batch"));
    assert_eq!(second_batch.diff_ids, vec![ids[2].clone()]);
    for n in 1..=5 {
        let work = store.require::<WorkPackage>(&format!("wp-{n}")).unwrap();
        assert_eq!(work.status, WorkStatus::Done, "wp-{n}");
    }
    assert!(orc.check_invariants().unwrap().is_empty());
}

#[test]
fn dependency_order_beats_submission_order_inside_a_batch() {
    let (orc, _runner) = bus(AriadneConfig::default());
    let store = orc.store();
    plan_and_dispatch(store, "wp-base", &[]);
    plan_and_dispatch(store, "wp-top", &["wp-base"]);

    let top = orc.submit(modify("wp-top", "top.py", (1, 3))).unwrap();
    let base = orc.submit(modify("wp-base", "base.py", (1, 3))).unwrap();

    let report = orc.process_once().unwrap();
    let merged = batch(store, report.batch.as_ref().unwrap());
    assert_eq!(merged.diff_ids, vec![base, top]);
}

#[test]
fn conflicts_go_stale_once_a_party_merges() {
    let (orc, _runner) = bus(AriadneConfig::default());
    submit(&orc, modify("wp-a", "auth.py", (1, 10)));
    submit(&orc, modify("wp-b", "auth.py", (50, 60)));
    orc.process_once().unwrap();

    let report = orc.process_once().unwrap();
    assert_eq!(report.stale_conflicts, 1);
    let conflict = orc.store().all::<Conflict>().unwrap().remove(0);
    assert!(conflict.stale);
    assert!(orc.process_once().unwrap().is_idle());
}

#[test]
fn status_counts_every_stage() {
    let (orc, _runner) = bus(AriadneConfig::default());
    submit(&orc, modify("wp-a", "session.py", (10, 20)));
    submit(&orc, modify("wp-b", "session.py", (15, 25)));
    orc.process_once().unwrap();

    let snapshot = orc.status().unwrap();
    assert_eq!(snapshot.diffs["verified"], 2);
    assert_eq!(snapshot.diffs["merged"], 0);
    assert_eq!(snapshot.work["dispatched"], 2);
    assert_eq!(snapshot.conflicts_total, 1);
    assert_eq!(snapshot.conflicts_unresolved, 1);
    assert_eq!(snapshot.batches, 0);
    assert_eq!(snapshot.commits_ready, 0);
}
