use std::collections::BTreeSet;
use std::fs;
use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use ariadne::causal;
use ariadne::config::{AriadneConfig, DEFAULT_CONFIG_PATH, DEFAULT_CONFIG_TEMPLATE};
use ariadne::dispatch::{AutonomyPolicy, Dispatcher};
use ariadne::ingest::{Ingestor, Submission};
use ariadne::model::batch::MergeBatch;
use ariadne::model::conflict::{Conflict, Resolution};
use ariadne::model::diff::{Diff, DiffStatus};
use ariadne::model::types::{ConflictId, DiffId, InstanceId, WorkId, unix_now};
use ariadne::model::work::WorkPackage;
use ariadne::orchestrator::{LeaderLock, Orchestrator};
use ariadne::store::BusStore;
use ariadne::store::fs::FsStore;

use crate::format::OutputFormat;

/// Diff bus for parallel coding agents
///
/// Workers submit diffs to the bus. The orchestrator detects conflicts
/// between them, verifies each one against its own causal scope, and
/// assembles verified diffs into merge batches for a single commit step.
///
/// QUICK START:
///
///   ariadne init
///   ariadne plan wp-1 --description "Add token refresh"
///   ariadne dispatch wp-1 --worker icarus-1
///   git diff | ariadne submit --work wp-1 --worker icarus-1 \
///       --description "Add token refresh" --patch - --capture-chain
///   ariadne process --commit
#[derive(Parser)]
#[command(name = "ariadne")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(after_help = "See 'ariadne <command> --help' for more information on a specific command.")]
pub struct Cli {
    /// Bus root (overrides `[bus] root` from the config)
    #[arg(long, global = true, env = "ARIADNE_BUS")]
    bus: Option<PathBuf>,

    /// Config file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Output format: text or json
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the bus and a commented config file
    ///
    /// Safe to run multiple times; an existing bus or config is left alone.
    Init,

    /// Counts per stage
    Status {
        /// Also check cross-record invariants; exits non-zero on violations
        #[arg(long)]
        check: bool,
    },

    /// Submit a diff
    ///
    /// Either a JSON submission (`--json`), or a unified diff (`--patch`)
    /// together with `--work`, `--worker` and `--description`. Use `-` to
    /// read from stdin.
    Submit {
        /// JSON submission file
        #[arg(long, conflicts_with = "patch")]
        json: Option<String>,

        /// Unified diff file (`git diff` output)
        #[arg(long, required_unless_present = "json")]
        patch: Option<String>,

        /// Work package the diff implements
        #[arg(long, required_unless_present = "json")]
        work: Option<WorkId>,

        /// Worker instance that produced the diff
        #[arg(long, required_unless_present = "json")]
        worker: Option<InstanceId>,

        /// What the diff does
        #[arg(long, required_unless_present = "json")]
        description: Option<String>,

        /// Capture the causal chain of every touched file before submitting
        #[arg(long)]
        capture_chain: bool,

        /// Drop the submission in the inbox instead of admitting it now
        #[arg(long)]
        enqueue: bool,
    },

    /// List diffs
    Diffs {
        /// Only diffs in this status (pending, verified, rejected, ...)
        #[arg(long)]
        status: Option<String>,
    },

    /// List conflicts (unresolved only, unless --all)
    Conflicts {
        /// Include resolved and stale conflicts
        #[arg(long)]
        all: bool,
    },

    /// Record a decision on a conflict
    Resolve {
        /// Conflict id
        conflict: ConflictId,

        /// Keep this diff; the other one is rejected
        #[arg(long, group = "decision")]
        survivor: Option<DiffId>,

        /// Keep both, applying this diff first
        #[arg(long, group = "decision")]
        sequential: Option<DiffId>,

        /// Re-verify this diff after the other one merges
        #[arg(long, group = "decision")]
        requeue: Option<DiffId>,

        /// Why
        #[arg(long, default_value = "")]
        note: String,
    },

    /// Register a work package
    Plan {
        /// Work package id
        id: WorkId,

        /// What the worker should do
        #[arg(long)]
        description: String,

        /// Packages that must merge first
        #[arg(long, value_delimiter = ',')]
        depends_on: Vec<WorkId>,

        /// Labels read by the dispatch policy (security, database, ...)
        #[arg(long, value_delimiter = ',')]
        tag: Vec<String>,
    },

    /// Hand work packages to workers
    Dispatch {
        /// Work package to hand out (ignores the autonomy policy)
        #[arg(required_unless_present = "auto")]
        work: Option<WorkId>,

        /// Worker that takes it; with --auto, workers are used in order
        #[arg(long, value_delimiter = ',', required = true)]
        worker: Vec<InstanceId>,

        /// Dispatch every eligible package the autonomy policy allows
        #[arg(long, conflicts_with = "work")]
        auto: bool,
    },

    /// Run one orchestration pass
    Process {
        /// Hand new batches to the commit step afterwards
        #[arg(long)]
        commit: bool,
    },

    /// Run passes until stopped
    ///
    /// Holds the bus leader marker; a second daemon on the same bus
    /// refuses to start.
    Daemon {
        /// Seconds between passes
        #[arg(long)]
        interval: Option<u64>,

        /// Stop after this many consecutive idle passes (0 = never)
        #[arg(long)]
        max_idle: Option<u32>,
    },

    /// Revert expired verification claims
    Reconcile,

    /// List merge batches
    Batches,

    /// Hand unreleased batches to the commit step
    Release,

    /// Delete every record on the bus
    Reset {
        /// Required: confirms the reset
        #[arg(long)]
        yes: bool,
    },
}

struct Session {
    config: AriadneConfig,
    format: OutputFormat,
}

impl Session {
    fn bus_root(&self) -> &Path {
        &self.config.bus.root
    }

    fn store(&self) -> Result<FsStore> {
        Ok(FsStore::open(self.bus_root())?)
    }

    fn orchestrator(&self) -> Result<Orchestrator<FsStore>> {
        Ok(Orchestrator::new(self.store()?, self.config.clone())?)
    }
}

pub fn run(cli: Cli) -> Result<()> {
    let mut config = AriadneConfig::load(&cli.config)?;
    if let Some(bus) = cli.bus {
        config.bus.root = bus;
    }
    if !matches!(cli.command, Commands::Init) && !config.bus.root.join("bus.json").exists() {
        bail!(
            "No bus at {}\n  To fix: ariadne init",
            config.bus.root.display()
        );
    }
    let ctx = Session {
        config,
        format: cli.format,
    };

    match cli.command {
        Commands::Init => init(&ctx, &cli.config),
        Commands::Status { check } => status(&ctx, check),
        Commands::Submit {
            json,
            patch,
            work,
            worker,
            description,
            capture_chain,
            enqueue,
        } => {
            let submission = match (json, patch) {
                (Some(path), _) => serde_json::from_str::<Submission>(&read_input(&path)?)
                    .with_context(|| format!("Failed to parse submission from {path}"))?,
                (None, Some(path)) => {
                    let (Some(work), Some(worker), Some(description)) = (work, worker, description)
                    else {
                        bail!("--patch needs --work, --worker and --description");
                    };
                    Submission::from_unified_diff(work, worker, description, &read_input(&path)?)?
                }
                (None, None) => bail!("Nothing to submit\n  To fix: pass --json or --patch"),
            };
            submit(&ctx, submission, capture_chain, enqueue)
        }
        Commands::Diffs { status } => diffs(&ctx, status.as_deref()),
        Commands::Conflicts { all } => conflicts(&ctx, all),
        Commands::Resolve {
            conflict,
            survivor,
            sequential,
            requeue,
            note,
        } => {
            let resolution = match (survivor, sequential, requeue) {
                (Some(diff), None, None) => Resolution::Survivor { diff },
                (None, Some(first), None) => Resolution::Sequential { first },
                (None, None, Some(diff)) => Resolution::Requeue { diff },
                _ => bail!("Pick one decision\n  To fix: pass exactly one of --survivor, --sequential, --requeue"),
            };
            resolve(&ctx, &conflict, resolution, &note)
        }
        Commands::Plan {
            id,
            description,
            depends_on,
            tag,
        } => plan(&ctx, id, &description, depends_on, tag),
        Commands::Dispatch { work, worker, auto } => dispatch(&ctx, work.as_ref(), &worker, auto),
        Commands::Process { commit } => process(&ctx, commit),
        Commands::Daemon { interval, max_idle } => daemon(&ctx, interval, max_idle),
        Commands::Reconcile => reconcile(&ctx),
        Commands::Batches => batches(&ctx),
        Commands::Release => release(&ctx),
        Commands::Reset { yes } => reset(&ctx, yes),
    }
}

fn read_input(path: &str) -> Result<String> {
    if path == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read stdin")?;
        return Ok(buf);
    }
    fs::read_to_string(path).with_context(|| format!("Failed to read {path}"))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn init(ctx: &Session, config_path: &Path) -> Result<()> {
    let (_, manifest, created) = FsStore::init(ctx.bus_root())?;
    if created {
        println!("Created bus at {}", ctx.bus_root().display());
    } else {
        println!(
            "Bus already exists at {} (created {})",
            ctx.bus_root().display(),
            manifest.created_at
        );
    }
    if config_path.exists() {
        println!("Config: {} (unchanged)", config_path.display());
    } else {
        if let Some(parent) = config_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(config_path, DEFAULT_CONFIG_TEMPLATE)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        println!("Config: {} (written)", config_path.display());
    }
    Ok(())
}

fn status(ctx: &Session, check: bool) -> Result<()> {
    let orchestrator = ctx.orchestrator()?;
    let snapshot = orchestrator.status()?;
    let violations = if check {
        orchestrator.check_invariants()?
    } else {
        Vec::new()
    };
    ctx.format.emit(&serde_json::json!({
        "status": snapshot,
        "violations": violations,
    }), |_| {
        println!("Diffs:");
        for (status, count) in &snapshot.diffs {
            println!("  {status:<16} {count}");
        }
        println!("Work:");
        for (status, count) in &snapshot.work {
            println!("  {status:<16} {count}");
        }
        println!(
            "Conflicts: {} unresolved / {} total",
            snapshot.conflicts_unresolved, snapshot.conflicts_total
        );
        println!(
            "Batches: {} ({} waiting for commit)",
            snapshot.batches, snapshot.commits_ready
        );
        println!("Inbox: {}", snapshot.inbox_waiting);
        if check {
            if violations.is_empty() {
                println!("Invariants: ok");
            } else {
                println!("Invariants: {} violation(s)", violations.len());
                for v in &violations {
                    println!("  - {v}");
                }
            }
        }
    })?;
    if !violations.is_empty() {
        bail!("{} invariant violation(s)", violations.len());
    }
    Ok(())
}

fn submit(ctx: &Session, mut submission: Submission, capture_chain: bool, enqueue: bool) -> Result<()> {
    if capture_chain {
        let provider = causal::provider_from_config(&ctx.config.causal);
        let targets: Vec<&str> = submission
            .files_modified
            .iter()
            .chain(&submission.files_added)
            .map(String::as_str)
            .collect();
        let chain = causal::capture(
            provider.as_ref(),
            &targets,
            ctx.config.causal.backward_depth,
            ctx.config.causal.forward_depth,
        )?;
        submission.causal_chain.absorb(chain);
    }
    let store = ctx.store()?;
    if enqueue {
        let id = Ingestor::new(&store).enqueue(submission)?;
        return ctx.format.emit(&serde_json::json!({ "queued": id }), |_| {
            println!("Queued {id}; the next pass admits it.");
        });
    }
    let id = Ingestor::new(&store).submit(submission)?;
    ctx.format.emit(&serde_json::json!({ "diff": id }), |_| {
        println!("Submitted {id} (pending)");
    })
}

fn diffs(ctx: &Session, status: Option<&str>) -> Result<()> {
    let wanted = match status {
        Some(name) => {
            let Some(s) = DiffStatus::ALL.into_iter().find(|s| s.to_string() == name) else {
                let names: Vec<String> = DiffStatus::ALL.iter().map(ToString::to_string).collect();
                bail!("Unknown status '{name}'. Use: {}", names.join(", "));
            };
            Some(s)
        }
        None => None,
    };
    let store = ctx.store()?;
    let mut diffs = store.list(|d: &Diff| wanted.is_none_or(|s| d.status == s))?;
    diffs.sort_by_key(|d| d.seq);
    ctx.format.emit(&diffs, |diffs| {
        if diffs.is_empty() {
            println!("No diffs.");
        }
        for d in diffs {
            println!(
                "{}  {:<15} {:<12} {:<12} {}",
                d.id, d.status, d.work_id, d.instance_id, d.description
            );
            if let Some(rejection) = &d.rejection {
                println!("    rejected: {} {}", rejection.reason, rejection.detail);
            }
        }
    })
}

fn conflicts(ctx: &Session, all: bool) -> Result<()> {
    let store = ctx.store()?;
    let mut conflicts = store.list(|c: &Conflict| all || c.is_unresolved())?;
    conflicts.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.id.cmp(&b.id)));
    ctx.format.emit(&conflicts, |conflicts| {
        if conflicts.is_empty() {
            println!("No conflicts.");
        }
        for c in conflicts {
            let state = if c.stale {
                "stale".to_owned()
            } else if let Some(r) = &c.resolution {
                format!("resolved: {}", r.resolution)
            } else {
                "open".to_owned()
            };
            println!(
                "{}  {} {}  {} vs {}  suggested {}  [{state}]",
                c.id, c.severity, c.conflict_type, c.diff_a, c.diff_b, c.strategy
            );
            println!("    {}", c.description);
            for risk in &c.analysis.risk_factors {
                println!("    risk: {risk}");
            }
            for (n, step) in c.analysis.resolution_steps.iter().enumerate() {
                println!("    {}. {step}", n + 1);
            }
        }
    })
}

fn resolve(ctx: &Session, conflict: &ConflictId, resolution: Resolution, note: &str) -> Result<()> {
    let updated = ctx.orchestrator()?.resolve(conflict, resolution, note)?;
    ctx.format.emit(&updated, |c| {
        if let Some(r) = &c.resolution {
            println!("{}: {}", c.id, r.resolution);
        }
    })
}

fn plan(ctx: &Session, id: WorkId, description: &str, depends_on: Vec<WorkId>, tags: Vec<String>) -> Result<()> {
    let store = ctx.store()?;
    let mut work = WorkPackage::new(id, description, depends_on, unix_now());
    work.tags = tags.into_iter().collect::<BTreeSet<_>>();
    Dispatcher::new(&store, ctx.config.dispatch.max_parallel_workers).plan(&work)?;
    ctx.format.emit(&work, |w| println!("Planned {} (ready)", w.id))
}

fn dispatch(ctx: &Session, work: Option<&WorkId>, workers: &[InstanceId], auto: bool) -> Result<()> {
    let store = ctx.store()?;
    let dispatcher = Dispatcher::new(&store, ctx.config.dispatch.max_parallel_workers);
    if !auto {
        let (Some(work), [worker]) = (work, workers) else {
            bail!("Dispatch one package to one worker\n  To fix: ariadne dispatch <work> --worker <id>");
        };
        let package = dispatcher.dispatch(work, worker)?;
        return ctx
            .format
            .emit(&package, |w| println!("Dispatched {} to {worker}", w.id));
    }
    let policy = AutonomyPolicy::from_config(&ctx.config.dispatch);
    let mut pool = workers.iter().cloned();
    let report = dispatcher.dispatch_ready(&policy, &mut |_: &WorkPackage| pool.next())?;
    ctx.format.emit(&report, |r| {
        for (work, worker) in &r.dispatched {
            println!("Dispatched {work} to {worker}");
        }
        for (work, reason) in &r.awaiting_approval {
            println!("Awaiting approval: {work} ({reason})");
        }
        for work in &r.blocked {
            println!("Blocked on dependencies: {work}");
        }
        if r.dispatched.is_empty() && r.awaiting_approval.is_empty() && r.blocked.is_empty() {
            println!("Nothing to dispatch.");
        }
    })
}

fn process(ctx: &Session, commit: bool) -> Result<()> {
    let lock = LeaderLock::acquire(ctx.bus_root(), ctx.config.daemon.leader_stale_seconds)?;
    let orchestrator = ctx.orchestrator()?.with_leader(lock);
    let mut report = orchestrator.process_once()?;
    if commit {
        for record in orchestrator.release()? {
            if !report.released.contains(&record.batch_id) {
                report.released.push(record.batch_id);
            }
        }
    }
    ctx.format.emit(&report, |r| {
        if r.is_idle() {
            println!("Nothing to do.");
            return;
        }
        for (sub, diff) in &r.inbox.admitted {
            println!("Admitted {sub} as {diff}");
        }
        for (sub, reason) in &r.inbox.refused {
            println!("Refused {sub}: {reason}");
        }
        for id in &r.detected {
            println!("Conflict {id}");
        }
        for id in &r.auto_resolved {
            println!("Auto-resolved {id}");
        }
        if r.stale_conflicts > 0 {
            println!("Stale conflicts: {}", r.stale_conflicts);
        }
        for id in &r.reconciled {
            println!("Reclaimed expired verification of {id}");
        }
        let v = &r.verification;
        if v.settled() > 0 || !v.retried.is_empty() {
            println!(
                "Verified {}, rejected {}, retrying {}",
                v.verified.len(),
                v.rejected.len(),
                v.retried.len()
            );
        }
        if let Some(batch) = &r.batch {
            println!("Batch {batch}");
        }
        if let Some(err) = &r.batch_error {
            println!("Batch abandoned: {err}");
        }
        for id in &r.released {
            println!("Released {id}");
        }
    })
}

fn daemon(ctx: &Session, interval: Option<u64>, max_idle: Option<u32>) -> Result<()> {
    let mut config = ctx.config.clone();
    if let Some(seconds) = interval {
        config.daemon.interval_seconds = seconds;
    }
    if let Some(cycles) = max_idle {
        config.daemon.max_idle_cycles = cycles;
    }
    let lock = LeaderLock::acquire(ctx.bus_root(), config.daemon.leader_stale_seconds)?;
    let orchestrator = Orchestrator::new(ctx.store()?, config)?.with_leader(lock);
    let stop = AtomicBool::new(false);
    let summary = orchestrator.run_daemon(&stop)?;
    ctx.format.emit(&summary, |s| {
        println!(
            "Daemon stopped after {} passes ({} batches, {} failed passes)",
            s.passes, s.batches, s.errors
        );
    })
}

fn reconcile(ctx: &Session) -> Result<()> {
    let reverted = ctx.orchestrator()?.reconcile()?;
    ctx.format.emit(&reverted, |ids| {
        if ids.is_empty() {
            println!("No expired claims.");
        }
        for id in ids {
            println!("Reclaimed {id}");
        }
    })
}

fn batches(ctx: &Session) -> Result<()> {
    let store = ctx.store()?;
    let mut batches = store.all::<MergeBatch>()?;
    batches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    ctx.format.emit(&batches, |batches| {
        if batches.is_empty() {
            println!("No batches.");
        }
        for b in batches {
            let ids: Vec<&str> = b.diff_ids.iter().map(DiffId::as_str).collect();
            println!("{}  {} file(s)  {}", b.id, b.changes.len(), ids.join(", "));
        }
    })
}

fn release(ctx: &Session) -> Result<()> {
    let records = ctx.orchestrator()?.release()?;
    ctx.format.emit(&records, |records| {
        if records.is_empty() {
            println!("Nothing to release.");
        }
        for r in records {
            println!("Released {} -> {}", r.batch_id, r.location);
        }
    })
}

fn reset(ctx: &Session, yes: bool) -> Result<()> {
    if !yes {
        bail!("Reset deletes every record on the bus\n  To fix: ariadne reset --yes");
    }
    ctx.orchestrator()?.reset()?;
    println!("Bus at {} reset.", ctx.bus_root().display());
    Ok(())
}
