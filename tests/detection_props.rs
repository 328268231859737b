//! Property tests for conflict detection and batch assembly.
//!
//! Random bus contents: 2-6 diffs, each touching 1-3 of five shared files
//! (modify with a line range, add, or delete). Properties:
//!
//! 1. **Symmetry**: `classify(a, b) == classify(b, a)`.
//! 2. **Disjointness**: diffs with no common file never conflict.
//! 3. **Idempotency**: a second detection over unchanged diffs records
//!    nothing new.
//! 4. **Batch safety**: two diffs in one batch that share a file were
//!    ordered by a recorded decision.
//! 5. **Dependency order**: a dependency's diff precedes its dependant.

mod common;
use common::*;

use std::collections::BTreeMap;

use proptest::prelude::*;

use ariadne::config::AriadneConfig;
use ariadne::conflict::{ConflictDetector, classify};
use ariadne::ingest::Submission;
use ariadne::model::batch::MergeBatch;
use ariadne::model::conflict::{Conflict, Resolution};
use ariadne::model::diff::{Diff, LineRange};
use ariadne::model::types::DiffId;
use ariadne::model::work::WorkPackage;
use ariadne::orchestrator::Orchestrator;
use ariadne::store::{BusStore, MemoryStore};

// ---------------------------------------------------------------------------
// Generators
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
enum Touch {
    Modify(u32, u32),
    Add,
    Delete,
}

fn arb_touch() -> impl Strategy<Value = Touch> {
    prop_oneof![
        6 => (1u32..60, 0u32..12).prop_map(|(start, len)| Touch::Modify(start, start + len)),
        1 => Just(Touch::Add),
        1 => Just(Touch::Delete),
    ]
}

/// file index -> touch, per diff.
fn arb_bus() -> impl Strategy<Value = Vec<BTreeMap<u8, Touch>>> {
    prop::collection::vec(prop::collection::btree_map(0u8..5, arb_touch(), 1..=3), 2..=6)
}

fn file(i: u8) -> String {
    format!("src/f{i}.py")
}

fn submission(work: &str, touches: &BTreeMap<u8, Touch>) -> Submission {
    let mut sub = empty_submission(work);
    for (i, touch) in touches {
        let path = file(*i);
        match touch {
            Touch::Modify(start, end) => {
                sub.files_modified.insert(path.clone());
                sub.line_changes.insert(path.clone(), vec![LineRange::new(*start, *end)]);
                sub.causal_chain.files.insert(path);
            }
            Touch::Add => {
                sub.files_added.insert(path);
            }
            Touch::Delete => {
                sub.files_deleted.insert(path);
            }
        }
    }
    sub
}

fn load(bus: &[BTreeMap<u8, Touch>]) -> (Orchestrator<MemoryStore>, Vec<DiffId>) {
    let (orc, _runner) = common::bus(AriadneConfig::default());
    let ids = bus
        .iter()
        .enumerate()
        .map(|(n, touches)| submit(&orc, submission(&format!("wp-{n}"), touches)))
        .collect();
    (orc, ids)
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn classification_is_symmetric(bus in arb_bus()) {
        let (orc, _) = load(&bus);
        let diffs = orc.store().all::<Diff>().unwrap();
        for a in &diffs {
            for b in &diffs {
                prop_assert_eq!(classify(a, b, 7), classify(b, a, 7));
            }
        }
    }

    #[test]
    fn disjoint_diffs_never_conflict(bus in arb_bus()) {
        let (orc, _) = load(&bus);
        let detected = ConflictDetector::new(orc.store()).detect().unwrap();
        let diffs: BTreeMap<DiffId, Diff> = orc
            .store()
            .all::<Diff>()
            .unwrap()
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();
        for conflict in &detected {
            let a = diffs[&conflict.diff_a].all_files();
            let b = diffs[&conflict.diff_b].all_files();
            prop_assert!(a.intersection(&b).next().is_some(), "{} has no shared file", conflict.id);
        }
    }

    #[test]
    fn detection_is_idempotent(bus in arb_bus()) {
        let (orc, _) = load(&bus);
        let detector = ConflictDetector::new(orc.store());
        detector.detect().unwrap();
        let before = orc.store().all::<Conflict>().unwrap();
        prop_assert!(detector.detect().unwrap().is_empty());
        prop_assert_eq!(orc.store().all::<Conflict>().unwrap(), before);
    }

    #[test]
    fn batches_never_hold_unordered_overlaps(bus in arb_bus()) {
        let (orc, _) = load(&bus);
        orc.process_once().unwrap();
        let conflicts = orc.store().all::<Conflict>().unwrap();
        let diffs: BTreeMap<DiffId, Diff> = orc
            .store()
            .all::<Diff>()
            .unwrap()
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();
        for batch in orc.store().all::<MergeBatch>().unwrap() {
            for (i, a) in batch.diff_ids.iter().enumerate() {
                for b in &batch.diff_ids[i + 1..] {
                    let fa = diffs[a].all_files();
                    let fb = diffs[b].all_files();
                    if fa.intersection(&fb).next().is_none() {
                        continue;
                    }
                    let ordered = conflicts.iter().any(|c| {
                        c.involves(a)
                            && c.involves(b)
                            && matches!(
                                c.resolution.as_ref().map(|r| &r.resolution),
                                Some(Resolution::Sequential { .. } | Resolution::Requeue { .. })
                            )
                    });
                    prop_assert!(ordered, "{a} and {b} share a file without a decision");
                }
            }
        }
        prop_assert!(orc.check_invariants().unwrap().is_empty());
    }

    #[test]
    fn dependencies_merge_first(order in any::<bool>()) {
        let (orc, _) = common::bus(AriadneConfig::default());
        plan_and_dispatch(orc.store(), "wp-base", &[]);
        plan_and_dispatch(orc.store(), "wp-top", &["wp-base"]);
        let base_sub = modify("wp-base", "base.py", (1, 2));
        let top_sub = modify("wp-top", "top.py", (1, 2));
        let (base, top) = if order {
            let b = orc.submit(base_sub).unwrap();
            (b, orc.submit(top_sub).unwrap())
        } else {
            let t = orc.submit(top_sub).unwrap();
            (orc.submit(base_sub).unwrap(), t)
        };
        orc.process_once().unwrap();

        let batches = orc.store().all::<MergeBatch>().unwrap();
        prop_assert_eq!(batches.len(), 1);
        prop_assert_eq!(&batches[0].diff_ids, &vec![base, top]);
        let top_work = orc.store().require::<WorkPackage>("wp-top").unwrap();
        prop_assert_eq!(top_work.depends_on, vec![work_id("wp-base")]);
    }
}
