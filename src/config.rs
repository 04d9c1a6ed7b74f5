#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow, bail};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DB_PATH: &str = "tubeintel.db";
pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/youtube/v3";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_SYNC_MAX_AGE_MINUTES: i64 = 30;
pub const DEFAULT_BACKGROUND_SYNC_MINUTES: u64 = 30;
/// Upper bound for minute-valued settings: ten years.
pub const MAX_INTERVAL_MINUTES: i64 = 60 * 24 * 365 * 10;

/// Everything a binary needs to talk to the database and the YouTube API.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub database_path: PathBuf,
    pub youtube_api_key: Option<String>,
    pub youtube_api_base: String,
    pub host: String,
    pub port: u16,
    pub sync_max_age_minutes: i64,
    /// Zero disables the backend's periodic sync.
    pub background_sync_minutes: u64,
}

impl RuntimeSettings {
    pub fn require_api_key(&self) -> Result<&str> {
        self.youtube_api_key
            .as_deref()
            .ok_or_else(|| anyhow!("YOUTUBE_API_KEY not set"))
    }
}

/// Values passed on the command line. They win over both the environment and
/// the `.env` file.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub database_path: Option<PathBuf>,
    pub youtube_api_key: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_settings_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeSettings> {
    build_settings_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeSettings> {
    let database_path = overrides
        .database_path
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("TUBEINTEL_DB", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
    let youtube_api_key = non_blank(overrides.youtube_api_key)
        .or_else(|| lookup_value("YOUTUBE_API_KEY", file_vars, &env_lookup));
    let youtube_api_base = lookup_value("YOUTUBE_API_BASE", file_vars, &env_lookup)
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
    let host = non_blank(overrides.host)
        .or_else(|| lookup_value("TUBEINTEL_HOST", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("TUBEINTEL_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let sync_max_age_minutes = match lookup_value("SYNC_MAX_AGE_MINUTES", file_vars, &env_lookup) {
        Some(value) => value
            .parse::<i64>()
            .ok()
            .filter(|minutes| (0..=MAX_INTERVAL_MINUTES).contains(minutes))
            .with_context(|| {
                format!(
                    "SYNC_MAX_AGE_MINUTES must be an integer between 0 and {MAX_INTERVAL_MINUTES}, got {value:?}"
                )
            })?,
        None => DEFAULT_SYNC_MAX_AGE_MINUTES,
    };
    let background_sync_minutes = lookup_value("BACKGROUND_SYNC_MINUTES", file_vars, &env_lookup)
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(DEFAULT_BACKGROUND_SYNC_MINUTES);
    if background_sync_minutes > MAX_INTERVAL_MINUTES as u64 {
        bail!(
            "BACKGROUND_SYNC_MINUTES must be at most {MAX_INTERVAL_MINUTES}, got {background_sync_minutes}"
        );
    }

    Ok(RuntimeSettings {
        database_path: PathBuf::from(database_path),
        youtube_api_key,
        youtube_api_base,
        host,
        port,
        sync_max_age_minutes,
        background_sync_minutes,
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim().to_string();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
