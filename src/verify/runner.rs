//! Check execution.
//!
//! A [`CheckRunner`] runs the configured checks over a scoped file set and
//! reports pass, fail or timeout. [`ShellCheckRunner`] is the production
//! runner: each command runs via `sh -c` in its own process group with a
//! per-command timeout, and the `{files}` token is replaced by the
//! shell-quoted scope. A timeout kills the whole group, so background jobs
//! a check started do not outlive it.

use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use glob::Pattern;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::VerificationConfig;
use crate::model::diff::CheckOutcome;

/// Placeholder replaced by the scoped file list.
pub const FILES_TOKEN: &str = "{files}";

/// Captured output kept per check.
const MAX_OUTPUT_BYTES: usize = 8 * 1024;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long output pipes may stay open after a timeout kill.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// Overall outcome of one run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    /// Every check passed.
    Passed,
    /// A check ran to completion and failed.
    Failed,
    /// A check was killed by its timeout.
    TimedOut,
}

/// What a runner observed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    /// Overall outcome.
    pub status: CheckStatus,
    /// Per-check outcomes, in execution order.
    pub checks: Vec<CheckOutcome>,
    /// Total wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl CheckReport {
    /// A passing report with no checks.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            status: CheckStatus::Passed,
            checks: Vec::new(),
            duration_ms: 0,
        }
    }
}

/// The runner itself failed (as opposed to a check failing).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckError {
    /// A command could not be started.
    Spawn(String),
    /// Waiting on a running command failed.
    Wait(String),
    /// An `include` glob is malformed.
    Pattern(String),
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn(msg) => write!(
                f,
                "failed to start check command: {msg}\n  To fix: make sure the command exists and `sh` is on PATH."
            ),
            Self::Wait(msg) => write!(f, "failed waiting on check command: {msg}"),
            Self::Pattern(msg) => write!(
                f,
                "invalid include pattern: {msg}\n  To fix: correct [verification].include in the config."
            ),
        }
    }
}

impl std::error::Error for CheckError {}

/// Runs checks over a scoped set of files.
///
/// Runners are shared across verification threads.
pub trait CheckRunner: Sync {
    /// Run every check over `scope` (repository-relative paths).
    ///
    /// # Errors
    /// Only for failures of the runner itself; failing checks are reported
    /// through [`CheckReport::status`].
    fn run(&self, scope: &[String]) -> Result<CheckReport, CheckError>;
}

// ---------------------------------------------------------------------------
// ShellCheckRunner
// ---------------------------------------------------------------------------

/// Runs `[verification].commands` through `sh -c`.
#[derive(Clone, Debug)]
pub struct ShellCheckRunner {
    commands: Vec<String>,
    timeout: Duration,
    per_file: bool,
    include: Vec<Pattern>,
    workdir: Option<PathBuf>,
}

impl ShellCheckRunner {
    /// Build a runner from the `[verification]` section.
    ///
    /// # Errors
    /// [`CheckError::Pattern`] if an include glob does not parse.
    pub fn from_config(config: &VerificationConfig) -> Result<Self, CheckError> {
        let include = config
            .include
            .iter()
            .map(|p| Pattern::new(p).map_err(|e| CheckError::Pattern(format!("{p:?}: {e}"))))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            commands: config
                .effective_commands()
                .into_iter()
                .map(str::to_owned)
                .collect(),
            timeout: config.timeout(),
            per_file: config.per_file,
            include,
            workdir: config.workdir.clone(),
        })
    }

    fn filter_scope<'s>(&self, scope: &'s [String]) -> Vec<&'s str> {
        scope
            .iter()
            .map(String::as_str)
            .filter(|f| self.include.is_empty() || self.include.iter().any(|p| p.matches(f)))
            .collect()
    }

    /// Run one configured command; returns the outcome and whether it
    /// timed out.
    fn run_command(&self, command: &str, files: &[&str]) -> Result<(CheckOutcome, bool), CheckError> {
        if !command.contains(FILES_TOKEN) {
            let (mut outcome, timed_out) = self.exec(command, command)?;
            outcome.failing_files = blamed(&outcome, files);
            return Ok((outcome, timed_out));
        }
        if files.is_empty() {
            debug!(command, "no scoped files match; check skipped");
            let skipped = CheckOutcome {
                name: command.to_owned(),
                passed: true,
                exit_code: None,
                failing_files: Vec::new(),
                output: "no files in scope".to_owned(),
                duration_ms: 0,
            };
            return Ok((skipped, false));
        }
        if !self.per_file {
            let quoted: Vec<String> = files.iter().map(|f| shell_quote(f)).collect();
            let line = command.replace(FILES_TOKEN, &quoted.join(" "));
            let (mut outcome, timed_out) = self.exec(command, &line)?;
            outcome.failing_files = blamed(&outcome, files);
            return Ok((outcome, timed_out));
        }

        let mut merged = CheckOutcome {
            name: command.to_owned(),
            passed: true,
            exit_code: Some(0),
            failing_files: Vec::new(),
            output: String::new(),
            duration_ms: 0,
        };
        let mut any_timeout = false;
        for file in files {
            let line = command.replace(FILES_TOKEN, &shell_quote(file));
            let (outcome, timed_out) = self.exec(command, &line)?;
            merged.duration_ms += outcome.duration_ms;
            if !outcome.passed {
                merged.passed = false;
                merged.exit_code = outcome.exit_code;
                merged.failing_files.push((*file).to_owned());
                merged.output.push_str(&outcome.output);
            }
            if timed_out {
                any_timeout = true;
                break;
            }
        }
        merged.output = truncate_tail(merged.output);
        Ok((merged, any_timeout))
    }

    /// Run one shell line; returns the outcome and whether it timed out.
    fn exec(&self, name: &str, line: &str) -> Result<(CheckOutcome, bool), CheckError> {
        let start = Instant::now();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", line])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt as _;
            cmd.process_group(0);
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| CheckError::Spawn(format!("sh -c {line:?}: {e}")))?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = wait_with_timeout(&mut child, self.timeout, start)?;
        let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        let Some(status) = status else {
            warn!(command = line, timeout_s = self.timeout.as_secs(), "check killed by timeout");
            let mut output = join_drain_within(stdout, DRAIN_GRACE);
            output.push_str(&join_drain_within(stderr, DRAIN_GRACE));
            output.push_str(&format!("killed by timeout after {}s", self.timeout.as_secs()));
            return Ok((
                CheckOutcome {
                    name: name.to_owned(),
                    passed: false,
                    exit_code: None,
                    failing_files: Vec::new(),
                    output: truncate_tail(output),
                    duration_ms,
                },
                true,
            ));
        };
        let mut output = join_drain(stdout);
        output.push_str(&join_drain(stderr));
        let exit_code = status.code();
        debug!(command = line, ?exit_code, duration_ms, "check finished");
        Ok((
            CheckOutcome {
                name: name.to_owned(),
                passed: exit_code == Some(0),
                exit_code,
                failing_files: Vec::new(),
                output: truncate_tail(output),
                duration_ms,
            },
            false,
        ))
    }
}

impl CheckRunner for ShellCheckRunner {
    fn run(&self, scope: &[String]) -> Result<CheckReport, CheckError> {
        let start = Instant::now();
        let files = self.filter_scope(scope);
        let mut checks = Vec::with_capacity(self.commands.len());
        let mut status = CheckStatus::Passed;

        for command in &self.commands {
            let (outcome, timed_out) = self.run_command(command, &files)?;
            let passed = outcome.passed;
            checks.push(outcome);
            if timed_out {
                status = CheckStatus::TimedOut;
                break;
            }
            if !passed {
                status = CheckStatus::Failed;
                break;
            }
        }

        Ok(CheckReport {
            status,
            checks,
            duration_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Poll `child` until it exits or `timeout` elapses. `None` means it was
/// killed.
fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
    start: Instant,
) -> Result<Option<std::process::ExitStatus>, CheckError> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(Some(status)),
            Ok(None) => {
                if start.elapsed() >= timeout {
                    kill_group(child);
                    return Ok(None);
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(CheckError::Wait(e.to_string())),
        }
    }
}

/// SIGKILL the command's process group, then reap the shell.
fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        let killed = Command::new("kill")
            .args(["-9", "--", &group])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = killed {
            warn!(error = %e, "failed to signal check process group");
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut p| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = p.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join_drain(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// Join a drain thread unless its pipe is still open after `grace`; a
/// process that escaped the group kill can hold it forever.
fn join_drain_within(handle: Option<JoinHandle<String>>, grace: Duration) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    let deadline = Instant::now() + grace;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!("check output still open after kill; not waiting for it");
            return String::new();
        }
        thread::sleep(POLL_INTERVAL);
    }
    handle.join().unwrap_or_default()
}

/// Scoped files named in a failing check's output.
fn blamed(outcome: &CheckOutcome, files: &[&str]) -> Vec<String> {
    if outcome.passed {
        return Vec::new();
    }
    files
        .iter()
        .filter(|f| outcome.output.contains(**f))
        .map(|f| (*f).to_owned())
        .collect()
}

/// Single-quote `s` for `sh`.
#[must_use]
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Keep the last `MAX_OUTPUT_BYTES` of `s`, on a char boundary.
fn truncate_tail(s: String) -> String {
    if s.len() <= MAX_OUTPUT_BYTES {
        return s;
    }
    let mut cut = s.len() - MAX_OUTPUT_BYTES;
    while !s.is_char_boundary(cut) {
        cut += 1;
    }
    format!("...{}", &s[cut..])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
