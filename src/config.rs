//! Bus configuration (`config.toml`).
//!
//! Defines the typed configuration for `.ariadne/config.toml`: where the bus
//! lives, how diffs are verified, how batches are assembled, how the daemon
//! polls, and how much autonomy the dispatcher has.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Default location of the config file, relative to the project root.
pub const DEFAULT_CONFIG_PATH: &str = ".ariadne/config.toml";

/// Commented config written by `ariadne init`. Every value shown is the
/// default.
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Ariadne diff bus configuration.

[bus]
root = ".ariadne/bus"

[verification]
# Scoped checks. "{files}" expands to the diff's scope, shell-quoted.
commands = ["cargo check", "cargo test"]
timeout_seconds = 300
max_attempts = 3
max_parallel = 4
per_file = false
lease_grace_seconds = 30
# include = ["src/**/*.rs"]

[merge]
verify_batch = true
auto_commit = false
auto_resolve = ["sequential"]
# handoff_dir = ".ariadne/handoff"

[daemon]
interval_seconds = 5
max_idle_cycles = 0
leader_stale_seconds = 60

[dispatch]
autonomy = "hybrid"
require_approval_for = ["architecture", "breaking_change", "database", "security"]
max_parallel_workers = 4

[causal]
# command = "my-callgraph {target} --up {backward} --down {forward}"
backward_depth = 2
forward_depth = 1
"#;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level bus configuration.
///
/// Parsed from `.ariadne/config.toml`. Missing fields use sensible defaults.
/// Missing file → all defaults (no error).
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AriadneConfig {
    /// Bus store settings.
    #[serde(default)]
    pub bus: BusConfig,

    /// Scoped verification settings.
    #[serde(default)]
    pub verification: VerificationConfig,

    /// Batch assembly settings.
    #[serde(default)]
    pub merge: MergeConfig,

    /// Daemon polling settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Dispatch / autonomy settings.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Causal-chain capture settings.
    #[serde(default)]
    pub causal: CausalConfig,
}

// ---------------------------------------------------------------------------
// BusConfig
// ---------------------------------------------------------------------------

/// Where the bus store lives.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusConfig {
    /// Root directory of the file store (default: `.ariadne/bus`).
    #[serde(default = "default_bus_root")]
    pub root: PathBuf,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            root: default_bus_root(),
        }
    }
}

fn default_bus_root() -> PathBuf {
    PathBuf::from(".ariadne/bus")
}

// ---------------------------------------------------------------------------
// VerificationConfig
// ---------------------------------------------------------------------------

/// Scoped verification settings.
///
/// Each entry of `commands` runs via `sh -c`. The token `{files}` is
/// replaced by the space-separated, shell-quoted scope; commands without
/// the token run once over the whole working tree.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerificationConfig {
    /// Check commands, run in order. Execution stops on first failure.
    #[serde(default = "default_commands")]
    pub commands: Vec<String>,

    /// Timeout in seconds for each command invocation.
    #[serde(default = "default_verification_timeout")]
    pub timeout_seconds: u64,

    /// Timeouts tolerated before a diff is rejected.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Diffs verified concurrently in one pass.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Run `{files}` commands once per scoped file so failures name files.
    #[serde(default)]
    pub per_file: bool,

    /// Slack added to the verification lease before reconciliation
    /// reclaims a stuck diff.
    #[serde(default = "default_lease_grace")]
    pub lease_grace_seconds: u64,

    /// Glob patterns restricting which scoped files are passed to
    /// `{files}` (e.g. `"src/**/*.py"`). Empty = every scoped file.
    #[serde(default)]
    pub include: Vec<String>,

    /// Working directory for commands (default: the current directory).
    #[serde(default)]
    pub workdir: Option<PathBuf>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            commands: default_commands(),
            timeout_seconds: default_verification_timeout(),
            max_attempts: default_max_attempts(),
            max_parallel: default_max_parallel(),
            per_file: false,
            lease_grace_seconds: default_lease_grace(),
            include: Vec::new(),
            workdir: None,
        }
    }
}

impl VerificationConfig {
    /// Non-empty configured commands.
    #[must_use]
    pub fn effective_commands(&self) -> Vec<&str> {
        self.commands
            .iter()
            .map(String::as_str)
            .filter(|c| !c.trim().is_empty())
            .collect()
    }

    /// Per-command timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// How long a `verifying` claim may be held before reconciliation
    /// reverts it: every command timing out back to back, plus grace.
    #[must_use]
    pub fn lease_seconds(&self) -> u64 {
        let commands = u64::try_from(self.effective_commands().len().max(1)).unwrap_or(u64::MAX);
        self.timeout_seconds
            .saturating_mul(commands)
            .saturating_add(self.lease_grace_seconds)
    }
}

fn default_commands() -> Vec<String> {
    vec!["cargo check".to_owned(), "cargo test".to_owned()]
}

const fn default_verification_timeout() -> u64 {
    300
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_max_parallel() -> usize {
    4
}

const fn default_lease_grace() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// MergeConfig
// ---------------------------------------------------------------------------

/// Batch assembly settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeConfig {
    /// Re-run verification over the whole batch scope before finalising.
    #[serde(default = "default_true")]
    pub verify_batch: bool,

    /// Hand each batch to the commit step as soon as it is produced.
    #[serde(default)]
    pub auto_commit: bool,

    /// Suggested strategies the default conflict policy resolves on its own.
    #[serde(default = "default_auto_resolve")]
    pub auto_resolve: BTreeSet<AutoResolve>,

    /// Directory the commit step writes handoffs into
    /// (default: `<bus root>/handoff`).
    #[serde(default)]
    pub handoff_dir: Option<PathBuf>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            verify_batch: true,
            auto_commit: false,
            auto_resolve: default_auto_resolve(),
            handoff_dir: None,
        }
    }
}

const fn default_true() -> bool {
    true
}

fn default_auto_resolve() -> BTreeSet<AutoResolve> {
    [AutoResolve::Sequential].into()
}

/// A suggestion the conflict policy may act on without escalation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoResolve {
    /// `SEQUENTIAL` suggestions: order by submission.
    Sequential,
    /// `REJECT` suggestions: keep the superset diff.
    Reject,
}

impl fmt::Display for AutoResolve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

// ---------------------------------------------------------------------------
// DaemonConfig
// ---------------------------------------------------------------------------

/// Daemon polling settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Seconds between passes.
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,

    /// Stop after this many consecutive passes with no work (0 = never).
    #[serde(default)]
    pub max_idle_cycles: u32,

    /// A leader marker whose heartbeat is older than this may be taken over.
    #[serde(default = "default_leader_stale")]
    pub leader_stale_seconds: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval(),
            max_idle_cycles: 0,
            leader_stale_seconds: default_leader_stale(),
        }
    }
}

impl DaemonConfig {
    /// Poll interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

const fn default_interval() -> u64 {
    5
}

const fn default_leader_stale() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// DispatchConfig
// ---------------------------------------------------------------------------

/// How much the bus may dispatch without a human.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatchConfig {
    /// Autonomy level.
    #[serde(default)]
    pub autonomy: Autonomy,

    /// Work-package tags that always need approval under `hybrid`.
    #[serde(default = "default_require_approval")]
    pub require_approval_for: BTreeSet<String>,

    /// Maximum packages out with workers at once.
    #[serde(default = "default_max_workers")]
    pub max_parallel_workers: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            autonomy: Autonomy::default(),
            require_approval_for: default_require_approval(),
            max_parallel_workers: default_max_workers(),
        }
    }
}

fn default_require_approval() -> BTreeSet<String> {
    ["breaking_change", "security", "architecture", "database"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

const fn default_max_workers() -> usize {
    4
}

/// Autonomy level of the dispatcher.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Autonomy {
    /// Every dispatch needs approval.
    Supervised,
    /// Dispatch freely unless a package carries a sensitive tag.
    #[default]
    Hybrid,
    /// Dispatch everything.
    Full,
}

impl fmt::Display for Autonomy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Supervised => write!(f, "supervised"),
            Self::Hybrid => write!(f, "hybrid"),
            Self::Full => write!(f, "full"),
        }
    }
}

// ---------------------------------------------------------------------------
// CausalConfig
// ---------------------------------------------------------------------------

/// Causal-chain capture settings used by `ariadne submit`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CausalConfig {
    /// External provider command. `{target}`, `{backward}` and `{forward}`
    /// are substituted; it must print `{"files": [...], "symbols": [...]}`.
    #[serde(default)]
    pub command: Option<String>,

    /// Caller depth requested from the provider.
    #[serde(default = "default_backward_depth")]
    pub backward_depth: u32,

    /// Callee depth requested from the provider.
    #[serde(default = "default_forward_depth")]
    pub forward_depth: u32,
}

impl Default for CausalConfig {
    fn default() -> Self {
        Self {
            command: None,
            backward_depth: default_backward_depth(),
            forward_depth: default_forward_depth(),
        }
    }
}

const fn default_backward_depth() -> u32 {
    2
}

const fn default_forward_depth() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Error loading a bus configuration file.
#[derive(Debug)]
pub struct ConfigError {
    /// The path that was being loaded (if available).
    pub path: Option<PathBuf>,
    /// Human-readable message with line-level detail when possible.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = &self.path {
            write!(f, "{}: {}", p.display(), self.message)
        } else {
            write!(f, "config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

impl AriadneConfig {
    /// Load configuration from a TOML file.
    ///
    /// - If the file does not exist, returns all defaults (not an error).
    /// - If the file exists but contains invalid TOML or unknown fields,
    ///   returns a [`ConfigError`] with line-level detail.
    ///
    /// # Errors
    /// Returns `ConfigError` on I/O errors (other than not-found) or parse errors.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError {
                    path: Some(path.to_owned()),
                    message: format!("could not read file: {e}"),
                });
            }
        };
        Self::parse(&contents).map_err(|mut e| {
            e.path = Some(path.to_owned());
            e
        })
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `ConfigError` on invalid TOML, unknown fields, or values that
    /// parse but cannot work (zero parallelism, zero attempts, bad globs).
    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(toml_str).map_err(|e| {
            let mut message = e.message().to_owned();
            if let Some(span) = e.span() {
                let line = toml_str[..span.start]
                    .chars()
                    .filter(|&c| c == '\n')
                    .count()
                    + 1;
                message = format!("line {line}: {message}");
            }
            ConfigError {
                path: None,
                message,
            }
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let fail = |message: String| ConfigError {
            path: None,
            message,
        };
        if self.verification.max_attempts == 0 {
            return Err(fail("verification.max_attempts must be at least 1".to_owned()));
        }
        if self.verification.max_parallel == 0 {
            return Err(fail("verification.max_parallel must be at least 1".to_owned()));
        }
        if self.verification.timeout_seconds == 0 {
            return Err(fail(
                "verification.timeout_seconds must be at least 1".to_owned(),
            ));
        }
        if self.dispatch.max_parallel_workers == 0 {
            return Err(fail(
                "dispatch.max_parallel_workers must be at least 1".to_owned(),
            ));
        }
        for pattern in &self.verification.include {
            if let Err(e) = glob::Pattern::new(pattern) {
                return Err(fail(format!(
                    "verification.include: invalid glob {pattern:?}: {e}"
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
