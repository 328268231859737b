//! Shared test helpers for ariadne integration tests.
//!
//! Library tests run against a `MemoryStore` with a scripted check runner,
//! so nothing shells out. CLI tests get a temp directory with its own bus.
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::path::Path;
use std::process::{Command, Output};
use std::sync::{Arc, Mutex};

use ariadne::config::AriadneConfig;
use ariadne::dispatch::Dispatcher;
use ariadne::ingest::Submission;
use ariadne::model::diff::{CausalChain, CheckOutcome, LineRange};
use ariadne::model::types::{DiffId, InstanceId, WorkId, unix_now};
use ariadne::model::work::WorkPackage;
use ariadne::orchestrator::Orchestrator;
use ariadne::store::{BusStore, MemoryStore};
use ariadne::verify::{CheckError, CheckReport, CheckRunner, CheckStatus};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Scripted check runner
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Script {
    failing: BTreeSet<String>,
    hanging: BTreeSet<String>,
    together: Vec<(String, String)>,
    calls: Vec<Vec<String>>,
}

/// Check runner driven by file names: a scope naming a failing file fails
/// (blaming it) and a scope naming a hanging file times out. Anything else
/// passes. Clones share state, so a test keeps a handle after boxing one
/// into the orchestrator.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    script: Arc<Mutex<Script>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, path: &str) {
        self.script.lock().unwrap().failing.insert(path.to_owned());
    }

    pub fn hang_on(&self, path: &str) {
        self.script.lock().unwrap().hanging.insert(path.to_owned());
    }

    /// Fail any scope holding both paths (a cross-diff interaction).
    pub fn fail_together(&self, a: &str, b: &str) {
        self.script
            .lock()
            .unwrap()
            .together
            .push((a.to_owned(), b.to_owned()));
    }

    pub fn heal(&self) {
        let mut s = self.script.lock().unwrap();
        s.failing.clear();
        s.hanging.clear();
        s.together.clear();
    }

    /// Every scope the runner was asked to check, in call order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.script.lock().unwrap().calls.clone()
    }
}

impl CheckRunner for ScriptedRunner {
    fn run(&self, scope: &[String]) -> Result<CheckReport, CheckError> {
        let mut s = self.script.lock().unwrap();
        s.calls.push(scope.to_vec());
        if scope.iter().any(|f| s.hanging.contains(f)) {
            return Ok(CheckReport {
                status: CheckStatus::TimedOut,
                checks: Vec::new(),
                duration_ms: 0,
            });
        }
        let mut blamed: Vec<String> = scope.iter().filter(|f| s.failing.contains(*f)).cloned().collect();
        for (a, b) in &s.together {
            if scope.contains(a) && scope.contains(b) {
                blamed.push(a.clone());
                blamed.push(b.clone());
            }
        }
        if blamed.is_empty() {
            return Ok(CheckReport {
                status: CheckStatus::Passed,
                checks: vec![outcome(true, Vec::new())],
                duration_ms: 1,
            });
        }
        Ok(CheckReport {
            status: CheckStatus::Failed,
            checks: vec![outcome(false, blamed)],
            duration_ms: 1,
        })
    }
}

fn outcome(passed: bool, failing_files: Vec<String>) -> CheckOutcome {
    CheckOutcome {
        name: "typecheck".to_owned(),
        passed,
        exit_code: Some(i32::from(!passed)),
        output: failing_files
            .iter()
            .map(|f| format!("{f}:1: error: type mismatch"))
            .collect::<Vec<_>>()
            .join("\n"),
        failing_files,
        duration_ms: 1,
    }
}

// ---------------------------------------------------------------------------
// Bus fixtures
// ---------------------------------------------------------------------------

/// In-memory orchestrator with the scripted runner.
pub fn bus(config: AriadneConfig) -> (Orchestrator<MemoryStore>, ScriptedRunner) {
    let runner = ScriptedRunner::new();
    let orchestrator = Orchestrator::new(MemoryStore::new(), config)
        .unwrap()
        .with_runner(runner.clone());
    (orchestrator, runner)
}

pub fn work_id(s: &str) -> WorkId {
    WorkId::new(s).unwrap()
}

pub fn worker(s: &str) -> InstanceId {
    InstanceId::new(s).unwrap()
}

/// Plan `id` (depending on `deps`) and dispatch it to `worker-<id>`.
pub fn plan_and_dispatch<S: BusStore>(store: &S, id: &str, deps: &[&str]) {
    let dispatcher = Dispatcher::new(store, 16);
    let package = WorkPackage::new(
        work_id(id),
        format!("implement {id}"),
        deps.iter().map(|d| work_id(d)).collect(),
        unix_now(),
    );
    dispatcher.plan(&package).unwrap();
    dispatcher.dispatch(&package.id, &worker_for(id)).unwrap();
}

pub fn worker_for(work: &str) -> InstanceId {
    worker(&format!("worker-{work}"))
}

/// A submission modifying `path` on the given lines, with the file itself
/// as its causal chain.
pub fn modify(work: &str, path: &str, lines: (u32, u32)) -> Submission {
    let mut s = empty_submission(work);
    s.files_modified.insert(path.to_owned());
    s.line_changes
        .insert(path.to_owned(), vec![LineRange::new(lines.0, lines.1)]);
    s.causal_chain.files.insert(path.to_owned());
    s
}

/// A submission deleting `path`.
pub fn delete(work: &str, path: &str) -> Submission {
    let mut s = empty_submission(work);
    s.files_deleted.insert(path.to_owned());
    s
}

/// A submission adding `path`.
pub fn add(work: &str, path: &str) -> Submission {
    let mut s = empty_submission(work);
    s.files_added.insert(path.to_owned());
    s
}

pub fn empty_submission(work: &str) -> Submission {
    Submission {
        work_id: work_id(work),
        instance_id: worker_for(work),
        description: format!("change for {work}"),
        files_added: BTreeSet::new(),
        files_modified: BTreeSet::new(),
        files_deleted: BTreeSet::new(),
        line_changes: Default::default(),
        causal_chain: CausalChain::default(),
        patch: None,
    }
}

/// Plan, dispatch and submit in one go.
pub fn submit(orchestrator: &Orchestrator<MemoryStore>, submission: Submission) -> DiffId {
    plan_and_dispatch(orchestrator.store(), submission.work_id.as_str(), &[]);
    orchestrator.submit(submission).unwrap()
}

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

/// A temp project with `ariadne init` already run.
pub fn setup_project() -> TempDir {
    let dir = TempDir::new().expect("failed to create temp dir");
    ariadne_ok(dir.path(), &["init"]);
    dir
}

/// Run ariadne with the given args in the given directory.
pub fn ariadne_in(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ariadne"))
        .args(args)
        .current_dir(dir)
        .env_remove("ARIADNE_BUS")
        .env_remove("OTEL_EXPORTER_OTLP_ENDPOINT")
        .output()
        .expect("failed to execute ariadne")
}

/// Run ariadne and assert it succeeds. Returns stdout as string.
pub fn ariadne_ok(dir: &Path, args: &[&str]) -> String {
    let out = ariadne_in(dir, args);
    let stderr = String::from_utf8_lossy(&out.stderr);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(
        out.status.success(),
        "ariadne {} failed:\nstdout: {stdout}\nstderr: {stderr}",
        args.join(" "),
    );
    stdout.to_string()
}

/// Run ariadne and assert it fails. Returns stderr as string.
pub fn ariadne_fails(dir: &Path, args: &[&str]) -> String {
    let out = ariadne_in(dir, args);
    assert!(
        !out.status.success(),
        "Expected ariadne {} to fail, but it succeeded.\nstdout: {}",
        args.join(" "),
        String::from_utf8_lossy(&out.stdout),
    );
    String::from_utf8_lossy(&out.stderr).to_string()
}

/// Write a file under the project directory.
pub fn write_file(dir: &Path, rel_path: &str, content: &str) {
    let path = dir.join(rel_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
}
