//! Several orchestrators sharing one bus.
//!
//! Every pass relies on per-entity compare-and-set only, so passes from
//! different orchestrators may interleave freely. Properties, checked after
//! every step of a random schedule:
//!
//! 1. `check_invariants` reports nothing.
//! 2. A merged diff stays merged, in the batch that first merged it.

mod common;
use common::*;

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;

use ariadne::config::AriadneConfig;
use ariadne::coordinator::Coordinator;
use ariadne::dispatch::Dispatcher;
use ariadne::model::batch::MergeBatch;
use ariadne::model::conflict::{Conflict, Resolution};
use ariadne::model::diff::{Diff, DiffStatus};
use ariadne::model::types::{BatchId, DiffId, unix_now};
use ariadne::model::work::WorkPackage;
use ariadne::orchestrator::Orchestrator;
use ariadne::store::{BusStore, MemoryStore};
use ariadne::verify::Verifier;

type Shared = Arc<MemoryStore>;

fn orchestrator(store: &Shared, runner: &ScriptedRunner) -> Orchestrator<Shared> {
    Orchestrator::new(Arc::clone(store), AriadneConfig::default())
        .unwrap()
        .with_runner(runner.clone())
}

fn open(store: &Shared, work: &str) {
    let dispatcher = Dispatcher::new(store, 64);
    let package = WorkPackage::new(work_id(work), format!("implement {work}"), vec![], unix_now());
    dispatcher.plan(&package).unwrap();
    dispatcher.dispatch(&package.id, &worker_for(work)).unwrap();
}

fn merged(store: &Shared) -> BTreeMap<DiffId, BatchId> {
    store
        .list(|d: &Diff| d.status == DiffStatus::Merged)
        .unwrap()
        .into_iter()
        .map(|d| {
            let batch = d.merge_batch.clone().expect("merged diffs keep their batch");
            (d.id, batch)
        })
        .collect()
}

#[test]
fn two_orchestrators_drain_one_bus_concurrently() {
    let store: Shared = Arc::new(MemoryStore::new());
    let runner = ScriptedRunner::new();
    let paths = ["api.py", "api.py", "db.py", "ui.py", "db.py", "cli.py", "api.py"];
    let seed = orchestrator(&store, &runner);
    let mut ids = Vec::new();
    for (n, path) in paths.iter().enumerate() {
        let work = format!("wp-{n}");
        open(&store, &work);
        let start = u32::try_from(n).unwrap() * 20 + 1;
        ids.push(seed.submit(modify(&work, path, (start, start + 5))).unwrap());
    }

    std::thread::scope(|scope| {
        for _ in 0..2 {
            scope.spawn(|| {
                let orc = orchestrator(&store, &runner);
                for _ in 0..6 {
                    orc.process_once().unwrap();
                }
            });
        }
    });
    seed.process_once().unwrap();

    assert!(seed.check_invariants().unwrap().is_empty());
    let done = merged(&store);
    for id in &ids {
        assert!(done.contains_key(id), "{id} did not merge");
    }
    let batched: usize = store
        .all::<MergeBatch>()
        .unwrap()
        .iter()
        .map(|b| b.diff_ids.len())
        .sum();
    assert_eq!(batched, ids.len());
}

#[test]
fn only_an_exclusive_recovery_rolls_back_a_fresh_claim() {
    let store: Shared = Arc::new(MemoryStore::new());
    let runner = ScriptedRunner::new();
    let first = orchestrator(&store, &runner);
    let second = orchestrator(&store, &runner);
    open(&store, "wp-a");
    open(&store, "wp-b");
    let a = first.submit(modify("wp-a", "api.py", (1, 5))).unwrap();
    let b = first.submit(modify("wp-b", "cli.py", (1, 5))).unwrap();
    Verifier::new(&store, &runner, &AriadneConfig::default().verification)
        .verify_pending()
        .unwrap();

    // `b` is claimed by a batch `first` is still assembling.
    let claim = BatchId::new("batch-inflight").unwrap();
    store
        .transition::<Diff>(b.as_str(), DiffStatus::Verified, DiffStatus::MergeCandidate, |d| {
            d.merge_batch = Some(claim.clone());
        })
        .unwrap();

    second.process_once().unwrap();
    assert_eq!(store.require::<Diff>(a.as_str()).unwrap().status, DiffStatus::Merged);
    let held = store.require::<Diff>(b.as_str()).unwrap();
    assert_eq!((held.status, held.merge_batch), (DiffStatus::MergeCandidate, Some(claim)));

    let released = Coordinator::new(&store, &runner, true).exclusive(true).recover().unwrap();
    assert_eq!(released, 1);
    second.process_once().unwrap();
    assert_eq!(store.require::<Diff>(b.as_str()).unwrap().status, DiffStatus::Merged);
    assert!(second.check_invariants().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Random schedules
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
enum Step {
    /// A new package submits a change to file `file`.
    Modify { file: u8, start: u32 },
    Delete { file: u8 },
    /// One pass on orchestrator 0 or 1.
    Pass { on: usize },
    /// Decide the oldest open conflict.
    Decide { how: u8 },
    /// Claim the oldest verified diff for a batch that is never written,
    /// as a pass that died mid-assembly would.
    Strand,
    /// Exclusive recovery, as a newly elected leader runs it.
    Recover,
    Break { file: u8 },
    Heal,
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (0u8..4, 1u32..40).prop_map(|(file, start)| Step::Modify { file, start }),
        1 => (0u8..4).prop_map(|file| Step::Delete { file }),
        6 => (0usize..2).prop_map(|on| Step::Pass { on }),
        2 => (0u8..3).prop_map(|how| Step::Decide { how }),
        1 => Just(Step::Strand),
        1 => Just(Step::Recover),
        1 => (0u8..4).prop_map(|file| Step::Break { file }),
        1 => Just(Step::Heal),
    ]
}

fn path(file: u8) -> String {
    format!("src/m{file}.py")
}

struct World {
    store: Shared,
    runner: ScriptedRunner,
    orchestrators: [Orchestrator<Shared>; 2],
    packages: usize,
    stranded: usize,
}

impl World {
    fn new() -> Self {
        let store: Shared = Arc::new(MemoryStore::new());
        let runner = ScriptedRunner::new();
        let orchestrators = [orchestrator(&store, &runner), orchestrator(&store, &runner)];
        Self {
            store,
            runner,
            orchestrators,
            packages: 0,
            stranded: 0,
        }
    }

    fn submit(&mut self, submission: ariadne::ingest::Submission) {
        open(&self.store, submission.work_id.as_str());
        self.orchestrators[0].submit(submission).unwrap();
    }

    fn next_work(&mut self) -> String {
        self.packages += 1;
        format!("wp-{}", self.packages)
    }

    fn apply(&mut self, step: &Step) {
        match step {
            Step::Modify { file, start } => {
                let work = self.next_work();
                self.submit(modify(&work, &path(*file), (*start, *start + 4)));
            }
            Step::Delete { file } => {
                let work = self.next_work();
                self.submit(delete(&work, &path(*file)));
            }
            Step::Pass { on } => {
                self.orchestrators[*on].process_once().unwrap();
            }
            Step::Decide { how } => {
                let Some(conflict) = self.store.list(Conflict::is_unresolved).unwrap().into_iter().next() else {
                    return;
                };
                let resolution = match how {
                    0 => Resolution::Sequential {
                        first: conflict.diff_a.clone(),
                    },
                    1 => Resolution::Survivor {
                        diff: conflict.diff_b.clone(),
                    },
                    _ => Resolution::Requeue {
                        diff: conflict.diff_b.clone(),
                    },
                };
                self.orchestrators[1].resolve(&conflict.id, resolution, "schedule").unwrap();
            }
            Step::Strand => {
                let Some(diff) = self
                    .store
                    .list(|d: &Diff| d.status == DiffStatus::Verified)
                    .unwrap()
                    .into_iter()
                    .next()
                else {
                    return;
                };
                self.stranded += 1;
                let claim = BatchId::new(&format!("batch-dead{:04}", self.stranded)).unwrap();
                self.store
                    .transition::<Diff>(diff.id.as_str(), DiffStatus::Verified, DiffStatus::MergeCandidate, |d| {
                        d.merge_batch = Some(claim.clone());
                    })
                    .unwrap();
            }
            Step::Recover => {
                Coordinator::new(&self.store, &self.runner, true)
                    .exclusive(true)
                    .recover()
                    .unwrap();
            }
            Step::Break { file } => self.runner.fail_on(&path(*file)),
            Step::Heal => self.runner.heal(),
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(96))]

    #[test]
    fn interleaved_passes_keep_the_bus_consistent(steps in prop::collection::vec(arb_step(), 1..40)) {
        let mut world = World::new();
        let mut seen: BTreeMap<DiffId, BatchId> = BTreeMap::new();
        for step in &steps {
            world.apply(step);

            let violations = world.orchestrators[0].check_invariants().unwrap();
            prop_assert!(violations.is_empty(), "after {:?}: {:?}", step, violations);

            let now = merged(&world.store);
            for (id, batch) in &seen {
                prop_assert_eq!(now.get(id), Some(batch), "{} left merged after {:?}", id, step);
            }
            seen = now;
        }
    }
}
