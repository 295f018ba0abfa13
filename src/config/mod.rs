//! Configuration Management
//!
//! This module handles loading and saving the engine configuration: the store
//! location, the audit log destination, and the safety policy knobs.
//!
//! # Configuration Locations
//! - Local: `.tutela/config.json` (team-shareable, per-project)
//! - Global: `~/.config/tutela/config.json` (per-user)
//!
//! # Resolution Precedence
//! 1. Explicit CLI parameters (highest priority)
//! 2. Local config file (`.tutela/config.json`)
//! 3. Global config file (`~/.config/tutela/config.json`)
//! 4. Built-in defaults

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, TutelaError};

/// Default transaction idle timeout: 5 minutes
pub const DEFAULT_TRANSACTION_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// Default ceiling on rows a single transaction may touch
pub const DEFAULT_MAX_ROWS_AFFECTED: u64 = 10_000;

/// Default name of the isolated draft schema
pub const DEFAULT_DRAFT_SCHEMA: &str = "tutela_drafts";

const fn default_true() -> bool {
    true
}

const fn default_timeout_ms() -> u64 {
    DEFAULT_TRANSACTION_TIMEOUT_MS
}

const fn default_max_rows() -> u64 {
    DEFAULT_MAX_ROWS_AFFECTED
}

fn default_draft_schema() -> String {
    DEFAULT_DRAFT_SCHEMA.to_string()
}

/// Safety policy for the mutation engine
///
/// All knobs default to the most restrictive settings that still allow the
/// engine to operate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Require an explicit transaction for INSERT/UPDATE/DELETE
    /// Default: true
    #[serde(default = "default_true")]
    pub require_transactions: bool,

    /// Maximum cumulative rows a transaction may affect before it is
    /// forcibly rolled back
    #[serde(default = "default_max_rows")]
    pub max_rows_affected: u64,

    /// Transaction idle timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub transaction_timeout_ms: u64,

    /// Name of the isolated schema where drafts live
    #[serde(default = "default_draft_schema")]
    pub draft_schema: String,

    /// Additional denylisted keywords, merged with the built-in list
    #[serde(default)]
    pub denied_keywords: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            require_transactions: true,
            max_rows_affected: DEFAULT_MAX_ROWS_AFFECTED,
            transaction_timeout_ms: DEFAULT_TRANSACTION_TIMEOUT_MS,
            draft_schema: default_draft_schema(),
            denied_keywords: Vec::new(),
        }
    }
}

/// Engine configuration: where the store lives and how strictly to police it
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// Path to the SQLite database file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,

    /// Path to the JSON-lines audit log (stderr when omitted)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_log: Option<PathBuf>,

    /// Safety policy
    #[serde(default)]
    pub safety: SafetyConfig,
}

/// Get path to local config file (`.tutela/config.json`)
pub fn local_config_path() -> Result<PathBuf> {
    let current_dir = std::env::current_dir().map_err(|e| {
        TutelaError::config_error(format!("Could not determine current directory: {e}"))
    })?;

    Ok(current_dir.join(".tutela").join("config.json"))
}

/// Get path to global config file (`~/.config/tutela/config.json`)
pub fn global_config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| TutelaError::config_error("Could not determine user config directory"))?;

    Ok(config_dir.join("tutela").join("config.json"))
}

/// Load an `EngineConfig` from a specific file
///
/// A missing file is not an error; it yields `None` so the caller can fall
/// through to the next location.
pub fn load_config_file(path: &Path) -> Result<Option<EngineConfig>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)
        .map_err(|e| TutelaError::config_error(format!("Could not read config file: {e}")))?;

    let config = serde_json::from_str::<EngineConfig>(&contents)
        .map_err(|e| TutelaError::config_error(format!("Invalid config file format: {e}")))?;

    Ok(Some(config))
}

/// Resolve the effective configuration: local file wins over global, built-in
/// defaults apply when neither exists.
pub fn resolve_config() -> Result<EngineConfig> {
    if let Some(local) = load_config_file(&local_config_path()?)? {
        return Ok(local);
    }
    if let Some(global) = load_config_file(&global_config_path()?)? {
        return Ok(global);
    }
    Ok(EngineConfig::default())
}

/// Save a config to the given file, creating parent directories as needed
pub fn save_config_file(path: &Path, config: &EngineConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            TutelaError::config_error(format!("Could not create config directory: {e}"))
        })?;
    }

    let contents = serde_json::to_string_pretty(config)
        .map_err(|e| TutelaError::config_error(format!("Could not serialize config: {e}")))?;

    fs::write(path, contents)
        .map_err(|e| TutelaError::config_error(format!("Could not write config file: {e}")))?;

    Ok(())
}
