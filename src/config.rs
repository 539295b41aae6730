//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

use crate::{delegation::UnknownClausePolicy, pow::PowLimits};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory of the durable key-value store.
    pub store_root: PathBuf,
    /// Default relays for publishing and remote lookups.
    pub relays: Vec<String>,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    /// Verify signatures of events fetched from relays. On unless `VERIFY_SIG=0`.
    pub verify_sig: bool,
    /// Proof-of-work difficulty applied when a command does not pass one.
    pub pow_difficulty: u8,
    pub pow_limits: PowLimits,
    pub delegation_policy: UnknownClausePolicy,
    /// Hex secret key of the signing identity.
    pub secret_key: Option<String>,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let store_root = PathBuf::from(env::var("STORE_ROOT").context("STORE_ROOT not set")?);
        let relays = csv_strings(env::var("RELAYS").unwrap_or_default());
        let tor_socks = env::var("TOR_SOCKS").ok().filter(|s| !s.is_empty());
        let verify_sig = env::var("VERIFY_SIG")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map_or(true, |s| s.trim() != "0");
        let pow_difficulty = parse_or("POW_DIFFICULTY", 0)?;
        let defaults = PowLimits::default();
        let pow_limits = PowLimits {
            max_duration: Duration::from_millis(parse_or(
                "POW_MAX_MILLIS",
                defaults.max_duration.as_millis() as u64,
            )?),
            max_iterations: parse_or("POW_MAX_ITERATIONS", defaults.max_iterations)?,
        };
        let delegation_policy = env::var("DELEGATION_UNKNOWN_CLAUSES")
            .unwrap_or_default()
            .parse::<UnknownClausePolicy>()?;
        let secret_key = env::var("SECRET_KEY").ok().filter(|s| !s.is_empty());
        Ok(Self {
            store_root,
            relays,
            tor_socks,
            verify_sig,
            pow_difficulty,
            pow_limits,
            delegation_policy,
            secret_key,
        })
    }
}

/// Parse `name` when set and non-empty, otherwise fall back to `default`.
fn parse_or<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => v.trim().parse().with_context(|| format!("invalid {name}")),
        _ => Ok(default),
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}
