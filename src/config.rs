//! Runtime settings read from the environment (and `.env` via dotenv)

use crate::definition::MAX_HITL_TIMEOUT_SECS;
use crate::error::{Result, WorkflowError};
use std::path::PathBuf;
use std::str::FromStr;

/// Reviewers get at least this long before a decision times out.
pub const MIN_HITL_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory holding the per-agent audit files
    pub data_dir: PathBuf,
    pub port: u16,
    pub sweep_interval_secs: u64,
    /// Overrides every workflow's `hitlTimeoutSeconds` when set
    pub hitl_timeout_seconds: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            port: 8080,
            sweep_interval_secs: 5,
            hitl_timeout_seconds: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Settings::default();

        let data_dir = lookup("AGENT_DATA_DIR")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let port = match lookup("PORT").or_else(|| lookup("API_PORT")) {
            Some(raw) => parse("PORT", &raw)?,
            None => defaults.port,
        };

        let sweep_interval_secs = match lookup("HITL_SWEEP_INTERVAL_SECS") {
            Some(raw) => parse::<u64>("HITL_SWEEP_INTERVAL_SECS", &raw)?.max(1),
            None => defaults.sweep_interval_secs,
        };

        let hitl_timeout_seconds = lookup("HITL_TIMEOUT_SECS")
            .map(|raw| parse::<u64>("HITL_TIMEOUT_SECS", &raw))
            .transpose()?
            .map(|secs| secs.clamp(MIN_HITL_TIMEOUT_SECS, MAX_HITL_TIMEOUT_SECS));

        Ok(Self {
            data_dir,
            port,
            sweep_interval_secs,
            hitl_timeout_seconds,
        })
    }
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| WorkflowError::Config(format!("{} must be a non-negative integer, got '{}'", key, raw)))
}
