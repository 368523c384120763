use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};

use crate::limits::MAX_HOLD_TTL_SECS;
use crate::model::Ms;

/// Server configuration, read from `RENTAL_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub hold_ttl_secs: u64,
    pub metrics_port: Option<u16>,
    /// Customer write commands per IP per minute; 0 turns limiting off.
    pub rate_limit_per_minute: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5480,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            hold_ttl_secs: 1800,
            metrics_port: None,
            rate_limit_per_minute: 30,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys take defaults; set keys must parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let hold_ttl_secs: u64 = parse_or(&lookup, "RENTAL_HOLD_TTL_SECS", defaults.hold_ttl_secs)?;
        if hold_ttl_secs == 0 {
            anyhow::bail!("RENTAL_HOLD_TTL_SECS must be positive");
        }
        if hold_ttl_secs > MAX_HOLD_TTL_SECS {
            anyhow::bail!("RENTAL_HOLD_TTL_SECS must be at most {MAX_HOLD_TTL_SECS}");
        }
        Ok(Self {
            bind: lookup("RENTAL_BIND").unwrap_or(defaults.bind),
            port: parse_or(&lookup, "RENTAL_PORT", defaults.port)?,
            data_dir: lookup("RENTAL_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            max_connections: parse_or(&lookup, "RENTAL_MAX_CONNECTIONS", defaults.max_connections)?,
            compact_threshold: parse_or(&lookup, "RENTAL_COMPACT_THRESHOLD", defaults.compact_threshold)?,
            hold_ttl_secs,
            metrics_port: lookup("RENTAL_METRICS_PORT")
                .map(|v| v.parse().with_context(|| format!("RENTAL_METRICS_PORT={v:?}")))
                .transpose()?,
            rate_limit_per_minute: parse_or(
                &lookup,
                "RENTAL_RATE_LIMIT_PER_MINUTE",
                defaults.rate_limit_per_minute,
            )?,
        })
    }

    pub fn hold_ttl_ms(&self) -> Ms {
        self.hold_ttl_secs as Ms * 1000
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key}={raw:?} is not a valid value")),
        None => Ok(default),
    }
}
