use std::str::FromStr;

use anyhow::{Result, bail};
use serde::Serialize;

/// Output format for command results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// Pretty JSON, machine-parseable.
    Json,
}

impl FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => bail!("Invalid format '{s}'. Use: text or json"),
        }
    }
}

impl OutputFormat {
    /// Print `data` as JSON, or run `text` to print it for humans.
    pub fn emit<T: Serialize>(self, data: &T, text: impl FnOnce(&T)) -> Result<()> {
        match self {
            Self::Json => {
                let json = serde_json::to_string_pretty(data)
                    .map_err(|e| anyhow::anyhow!("JSON serialization failed: {e}"))?;
                println!("{json}");
            }
            Self::Text => text(data),
        }
        Ok(())
    }
}
