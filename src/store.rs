//! Config Store: path resolution, format detection, atomic persistence with
//! backup, and raw (format-preserving) round-trip.
//!
//! Grounded in `original_source/.../core/config_mgr.py` for the resolution /
//! detection / atomic-write algorithm, and in
//! `inteniquetic-prx/src/admin.rs::ConfigAdmin::atomic_replace` for the
//! Rust temp-file-then-rename shape.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::SystemConfig;
use crate::error::{GatewayError, Result};

pub const ENV_CONFIG_PATH: &str = "SPG_CONFIG_PATH";
pub const DEFAULT_CONFIG_BASENAME: &str = "config.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigFormat {
    Yaml,
    Json,
}

impl fmt::Display for ConfigFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigFormat::Yaml => write!(f, "yaml"),
            ConfigFormat::Json => write!(f, "json"),
        }
    }
}

impl ConfigFormat {
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Some(ConfigFormat::Yaml),
            "json" => Some(ConfigFormat::Json),
            _ => None,
        }
    }
}

/// Resolve the config path: explicit arg > `SPG_CONFIG_PATH` env var >
/// upward search for `config.yaml` from cwd > `<cwd>/config.yaml`.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    if let Ok(env_path) = std::env::var(ENV_CONFIG_PATH) {
        let trimmed = env_path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_config_upwards(&cwd, DEFAULT_CONFIG_BASENAME).unwrap_or_else(|| cwd.join(DEFAULT_CONFIG_BASENAME))
}

fn find_config_upwards(start: &Path, basename: &str) -> Option<PathBuf> {
    let mut current = start;
    loop {
        let candidate = current.join(basename);
        if candidate.exists() {
            return Some(candidate);
        }
        match current.parent() {
            Some(parent) if parent != current => current = parent,
            _ => return None,
        }
    }
}

/// Detect format from the first non-whitespace byte; empty content is YAML.
pub fn detect_format(text: &str) -> ConfigFormat {
    match text.trim_start().chars().next() {
        Some('{') | Some('[') => ConfigFormat::Json,
        _ => ConfigFormat::Yaml,
    }
}

fn read_to_string_if_exists(path: &Path) -> Result<String> {
    if !path.exists() {
        return Ok(String::new());
    }
    fs::read_to_string(path)
        .map_err(|err| GatewayError::config(format!("failed to read {}: {err}", path.display())))
}

fn parse_value(text: &str, fmt: ConfigFormat) -> Result<serde_json::Value> {
    match fmt {
        ConfigFormat::Json => {
            let trimmed = text.trim();
            let source = if trimmed.is_empty() { "{}" } else { trimmed };
            serde_json::from_str(source)
                .map_err(|err| GatewayError::config(format!("invalid JSON config: {err}")))
        }
        ConfigFormat::Yaml => {
            let value: serde_yaml::Value = serde_yaml::from_str(text)
                .map_err(|err| GatewayError::config(format!("invalid YAML config: {err}")))?;
            serde_json::to_value(value)
                .map_err(|err| GatewayError::config(format!("invalid YAML config: {err}")))
        }
    }
}

fn config_from_value(value: serde_json::Value) -> Result<SystemConfig> {
    let mut config: SystemConfig = serde_json::from_value(value)
        .map_err(|err| GatewayError::config(format!("config schema violation: {err}")))?;
    config.validate()?;
    Ok(config)
}

/// Read the raw config file as text plus its detected format. Non-existent
/// files read as an empty string.
pub fn read_raw_config(path: &Path) -> Result<(String, ConfigFormat)> {
    let content = read_to_string_if_exists(path)?;
    let fmt = detect_format(&content);
    Ok((content, fmt))
}

/// Load and validate the config at `path`. Missing files yield the default
/// config without touching disk.
pub fn load_config(path: &Path) -> Result<SystemConfig> {
    if !path.exists() {
        return Ok(SystemConfig::default());
    }
    let text = read_to_string_if_exists(path)?;
    let fmt = detect_format(&text);
    let value = parse_value(&text, fmt)?;
    config_from_value(value)
}

/// Validate raw config text against a given format without writing it.
pub fn validate_config_raw(content: &str, fmt: ConfigFormat) -> Result<SystemConfig> {
    let value = parse_value(content, fmt)?;
    config_from_value(value)
}

/// Declared field order survives into the emitted YAML/JSON because
/// `serde_json`'s `preserve_order` feature backs `Value`/`Map` with an
/// insertion-ordered map instead of a `BTreeMap`.
fn serialize_config(config: &SystemConfig, fmt: ConfigFormat, minimal: bool) -> Result<String> {
    let value = config.to_json_value(minimal);
    match fmt {
        ConfigFormat::Json => serde_json::to_string_pretty(&value)
            .map_err(|err| GatewayError::config(format!("failed to encode JSON config: {err}"))),
        ConfigFormat::Yaml => serde_yaml::to_string(&value)
            .map_err(|err| GatewayError::config(format!("failed to encode YAML config: {err}"))),
    }
}

/// Persist `config` to `path`, choosing the prior on-disk format unless
/// `fmt` overrides it, with atomic backup-then-replace semantics.
pub fn save_config(
    config: &SystemConfig,
    path: &Path,
    fmt: Option<ConfigFormat>,
    minimal: bool,
) -> Result<()> {
    let fmt = match fmt {
        Some(fmt) => fmt,
        None => {
            let existing = read_to_string_if_exists(path)?;
            detect_format(&existing)
        }
    };
    let content = serialize_config(config, fmt, minimal)?;
    atomic_write(path, content.as_bytes())
}

/// Validate raw text, then write the *exact* bytes supplied (preserving
/// comments/layout) — the round-trip path used by the admin UI.
pub fn save_config_raw(content: &str, fmt: ConfigFormat, path: &Path) -> Result<SystemConfig> {
    let config = validate_config_raw(content, fmt)?;
    atomic_write(path, content.as_bytes())?;
    Ok(config)
}

/// Atomic write protocol: ensure parent dir exists, back up any existing
/// target to `<path>.bak`, write to a sibling temp file, then rename-replace.
/// The temp file is removed if any step fails.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    fs::create_dir_all(parent)
        .map_err(|err| GatewayError::config(format!("failed to create {}: {err}", parent.display())))?;

    if path.exists() {
        let backup_path = backup_path(path);
        fs::copy(path, &backup_path)
            .map_err(|err| GatewayError::config(format!("failed to back up {}: {err}", path.display())))?;
    }

    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("config");
    let temp_path = parent.join(format!("{file_name}.{}.tmp", std::process::id()));

    let write_result = (|| -> Result<()> {
        let mut temp_file = fs::File::create(&temp_path)
            .map_err(|err| GatewayError::config(format!("failed to create temp file: {err}")))?;
        temp_file
            .write_all(bytes)
            .map_err(|err| GatewayError::config(format!("failed to write temp file: {err}")))?;
        temp_file
            .sync_all()
            .map_err(|err| GatewayError::config(format!("failed to flush temp file: {err}")))?;
        fs::rename(&temp_path, path)
            .map_err(|err| GatewayError::config(format!("failed to replace {}: {err}", path.display())))
    })();

    if write_result.is_err() && temp_path.exists() {
        let _ = fs::remove_file(&temp_path);
    }
    write_result
}

pub fn backup_path(path: &Path) -> PathBuf {
    let mut os_string = path.as_os_str().to_os_string();
    os_string.push(".bak");
    PathBuf::from(os_string)
}
