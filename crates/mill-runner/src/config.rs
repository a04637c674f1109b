//! Engine settings: a YAML document with every key optional, then
//! `MILL_*` environment overrides on top.

use anyhow::{anyhow, Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const MILL_WORK_ROOT_ENV: &str = "MILL_WORK_ROOT";
pub const MILL_TASK_LOG_ENV: &str = "MILL_TASK_LOG";
pub const MILL_LISTING_TTL_SECS_ENV: &str = "MILL_LISTING_TTL_SECS";
pub const MILL_LISTING_GRACE_SECS_ENV: &str = "MILL_LISTING_GRACE_SECS";
pub const MILL_WRITE_ATTESTATION_ENV: &str = "MILL_WRITE_ATTESTATION";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Parent of the per-task work directories.
    pub work_root: PathBuf,
    /// JSONL file receiving task log lines; none discards them.
    pub task_log_path: Option<PathBuf>,
    pub listing_ttl_secs: u64,
    pub listing_grace_secs: u64,
    pub write_attestation: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            work_root: env::temp_dir().join("taskmill"),
            task_log_path: None,
            listing_ttl_secs: 60,
            listing_grace_secs: 5,
            write_attestation: true,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: EngineConfig =
            serde_yaml::from_str(raw).map_err(|err| anyhow!("invalid engine config: {}", err))?;
        config.check()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config {}", path.display()))?;
        Self::from_yaml_str(&raw)
    }

    /// Optional file, then the process environment.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|name| env::var(name))?;
        Ok(config)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        if let Some(raw) = read_env(&lookup, MILL_WORK_ROOT_ENV)? {
            self.work_root = PathBuf::from(raw);
        }
        if let Some(raw) = read_env(&lookup, MILL_TASK_LOG_ENV)? {
            self.task_log_path = Some(PathBuf::from(raw));
        }
        if let Some(raw) = read_env(&lookup, MILL_LISTING_TTL_SECS_ENV)? {
            self.listing_ttl_secs = parse_positive_u64(MILL_LISTING_TTL_SECS_ENV, &raw)?;
        }
        if let Some(raw) = read_env(&lookup, MILL_LISTING_GRACE_SECS_ENV)? {
            self.listing_grace_secs = parse_positive_u64(MILL_LISTING_GRACE_SECS_ENV, &raw)?;
        }
        if let Some(raw) = read_env(&lookup, MILL_WRITE_ATTESTATION_ENV)? {
            self.write_attestation = match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(anyhow!(
                        "{} must be true or false when set (got: {})",
                        MILL_WRITE_ATTESTATION_ENV,
                        raw
                    ))
                }
            };
        }
        self.check()
    }

    fn check(&self) -> Result<()> {
        if self.listing_ttl_secs == 0 {
            return Err(anyhow!("listing_ttl_secs must be > 0"));
        }
        if self.work_root.as_os_str().is_empty() {
            return Err(anyhow!("work_root must not be empty"));
        }
        Ok(())
    }

    pub fn listing_ttl(&self) -> Duration {
        Duration::seconds(self.listing_ttl_secs as i64)
    }

    pub fn listing_grace(&self) -> Duration {
        Duration::seconds(self.listing_grace_secs as i64)
    }
}

fn read_env<F>(lookup: &F, name: &str) -> Result<Option<String>>
where
    F: Fn(&str) -> Result<String, env::VarError>,
{
    match lookup(name) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                Ok(None)
            } else {
                Ok(Some(trimmed.to_string()))
            }
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("failed reading {}: {}", name, err)),
    }
}

fn parse_positive_u64(name: &str, raw: &str) -> Result<u64> {
    let parsed = raw.parse::<u64>().map_err(|_| {
        anyhow!(
            "{} must be a positive integer when set (got: {})",
            name,
            raw
        )
    })?;
    if parsed == 0 {
        return Err(anyhow!("{} must be > 0 when set", name));
    }
    Ok(parsed)
}
