//! Configuration loading and schema definitions for vigil.
//!
//! This module provides types and functions for loading vigil configuration
//! from TOML files or strings, plus the helpers that turn tunables
//! (worker counts, memory limits) into concrete numbers for the current
//! machine.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Errors raised while turning configuration values into runtime objects.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A glob in the configuration failed to compile.
    #[error("invalid glob {pattern:?} in {field}: {message}")]
    InvalidGlob {
        field: String,
        pattern: String,
        message: String,
    },

    /// A memory limit string could not be parsed.
    #[error("invalid memory limit {0:?}")]
    InvalidMemoryLimit(String),

    /// Two projects share the same name.
    #[error("duplicate project name {0:?}")]
    DuplicateProject(String),

    /// A project filter named a project that does not exist.
    #[error("no project named {0:?}")]
    UnknownProject(String),
}

/// Loads vigil configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use vigil::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("vigil.toml"))?;
/// println!("Default pool: {}", config.vigil.pool);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads vigil configuration from a TOML string.
///
/// # Example
///
/// ```
/// use vigil::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [vigil]
///     max_workers = 4
///
///     [[projects]]
///     name = "unit"
/// "#)?;
///
/// assert_eq!(config.vigil.max_workers, Some(4));
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Resolves the maximum worker count for a pool.
///
/// An explicit `max_workers` wins. Otherwise one CPU is left for the
/// coordinator, and half the CPUs are used in watch mode so the machine
/// stays responsive while editing. `file_parallelism = false` forces a
/// single worker.
pub fn resolve_max_workers(config: &VigilConfig, cpus: usize, watch: bool) -> usize {
    if !config.file_parallelism {
        return 1;
    }
    if let Some(max) = config.max_workers {
        return max.max(1);
    }
    if watch {
        (cpus / 2).max(1)
    } else {
        cpus.saturating_sub(1).max(1)
    }
}

/// Resolves the number of idle workers kept between runs.
pub fn resolve_min_workers(config: &VigilConfig, max_workers: usize) -> usize {
    if !config.file_parallelism {
        return 1;
    }
    config.min_workers.unwrap_or(max_workers).min(max_workers)
}

/// Resolves the per-worker memory limit in bytes.
///
/// `total_memory` is the machine's total memory in bytes. In watch mode only
/// half of it is considered available. Without an explicit limit each worker
/// gets an equal share.
///
/// # Example
///
/// ```
/// use vigil::config::{MemoryLimit, resolve_memory_limit};
///
/// let gib = 1024 * 1024 * 1024;
/// let limit = resolve_memory_limit(Some(&MemoryLimit::Text("50%".into())), 8 * gib, 4, false);
/// assert_eq!(limit.unwrap(), 4 * gib);
/// ```
pub fn resolve_memory_limit(
    limit: Option<&MemoryLimit>,
    total_memory: u64,
    max_workers: usize,
    watch: bool,
) -> Result<u64, ConfigError> {
    let available = if watch {
        total_memory / 2
    } else {
        total_memory
    };

    match limit {
        None => Ok(available / max_workers.max(1) as u64),
        Some(MemoryLimit::Number(value)) => number_to_bytes(*value, available)
            .ok_or_else(|| ConfigError::InvalidMemoryLimit(value.to_string())),
        Some(MemoryLimit::Text(text)) => text_to_bytes(text, available)
            .ok_or_else(|| ConfigError::InvalidMemoryLimit(text.clone())),
    }
}

fn number_to_bytes(value: f64, available: u64) -> Option<u64> {
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    if value <= 1.0 {
        Some((available as f64 * value).floor() as u64)
    } else {
        Some(value.floor() as u64)
    }
}

fn text_to_bytes(text: &str, available: u64) -> Option<u64> {
    let text = text.trim();
    if let Some(percent) = text.strip_suffix('%') {
        let value: f64 = percent.trim().parse().ok()?;
        return number_to_bytes(value / 100.0, available);
    }

    let split = text
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: f64 = number.trim().parse().ok()?;
    if unit.is_empty() {
        return number_to_bytes(value, available);
    }

    let multiplier: f64 = match unit.to_ascii_lowercase().as_str() {
        "b" => 1.0,
        "kb" | "k" => 1_000.0,
        "kib" => 1_024.0,
        "mb" | "m" => 1_000_000.0,
        "mib" => 1_048_576.0,
        "gb" | "g" => 1_000_000_000.0,
        "gib" => 1_073_741_824.0,
        _ => return None,
    };
    if value <= 0.0 {
        return None;
    }
    Some((value * multiplier).floor() as u64)
}
