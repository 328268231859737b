//! Causal-chain capture.
//!
//! The bus never derives causal chains itself; a [`CausalProvider`] answers
//! `causal_chain(target, backward, forward)` and the result is recorded on
//! the submission. [`CommandProvider`] shells out to an external analyzer
//! configured in `[causal]`; [`FileOnlyProvider`] is the fallback when none
//! is configured and scopes each target to itself.

use std::collections::BTreeSet;
use std::process::Command;

use serde::Deserialize;
use tracing::debug;

use crate::config::CausalConfig;
use crate::error::BusError;
use crate::model::diff::{CausalChain, CausalOverlap};
use crate::verify::runner::shell_quote;

/// Answers "what else does a change to `target` affect?".
pub trait CausalProvider {
    /// Files and symbols affected by `target` (a file path or a
    /// `module:symbol` name), up to `backward` caller levels and `forward`
    /// callee levels.
    ///
    /// # Errors
    /// [`BusError::Causal`] if the analysis cannot be performed.
    fn causal_chain(&self, target: &str, backward: u32, forward: u32) -> Result<CausalChain, BusError>;
}

/// Scopes a target to itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileOnlyProvider;

impl CausalProvider for FileOnlyProvider {
    fn causal_chain(&self, target: &str, backward: u32, forward: u32) -> Result<CausalChain, BusError> {
        Ok(CausalChain {
            files: BTreeSet::from([target.to_owned()]),
            symbols: BTreeSet::new(),
            backward_depth: backward,
            forward_depth: forward,
        })
    }
}

/// What an external analyzer prints.
#[derive(Debug, Deserialize)]
struct ProviderOutput {
    #[serde(default)]
    files: BTreeSet<String>,
    #[serde(default)]
    symbols: BTreeSet<String>,
}

/// Runs an external analyzer via `sh -c`.
///
/// `{target}`, `{backward}` and `{forward}` in the command are substituted;
/// stdout must be a JSON object with `files` and `symbols` arrays.
#[derive(Clone, Debug)]
pub struct CommandProvider {
    command: String,
}

impl CommandProvider {
    /// Provider running `command`.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl CausalProvider for CommandProvider {
    fn causal_chain(&self, target: &str, backward: u32, forward: u32) -> Result<CausalChain, BusError> {
        let line = self
            .command
            .replace("{target}", &shell_quote(target))
            .replace("{backward}", &backward.to_string())
            .replace("{forward}", &forward.to_string());
        let fail = |detail: String| BusError::Causal {
            target: target.to_owned(),
            detail,
        };
        let output = Command::new("sh")
            .args(["-c", &line])
            .output()
            .map_err(|e| fail(format!("sh -c {line:?}: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(fail(format!("provider exited with {}: {}", output.status, stderr.trim())));
        }
        let parsed: ProviderOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| fail(format!("unparseable provider output: {e}")))?;
        debug!(target, files = parsed.files.len(), symbols = parsed.symbols.len(), "causal chain captured");
        Ok(CausalChain {
            files: parsed.files,
            symbols: parsed.symbols,
            backward_depth: backward,
            forward_depth: forward,
        })
    }
}

/// The provider `[causal]` selects.
#[must_use]
pub fn provider_from_config(config: &CausalConfig) -> Box<dyn CausalProvider> {
    match &config.command {
        Some(command) if !command.trim().is_empty() => Box::new(CommandProvider::new(command.clone())),
        _ => Box::new(FileOnlyProvider),
    }
}

/// Capture and merge the chains of every target.
///
/// # Errors
/// The first provider failure.
pub fn capture(
    provider: &dyn CausalProvider,
    targets: &[&str],
    backward: u32,
    forward: u32,
) -> Result<CausalChain, BusError> {
    let mut chain = CausalChain {
        backward_depth: backward,
        forward_depth: forward,
        ..CausalChain::default()
    };
    for target in targets {
        chain.absorb(provider.causal_chain(target, backward, forward)?);
    }
    Ok(chain)
}

/// What two recorded chains share, or `None` if they are independent.
///
/// A shared entry means the changes reach the same code paths, so their
/// verification scopes must be run together.
#[must_use]
pub fn check_causal_conflict(a: &CausalChain, b: &CausalChain) -> Option<CausalOverlap> {
    a.overlaps_with(b).then(|| a.overlap(b))
}
