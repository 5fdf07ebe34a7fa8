//! CLI command implementations

pub mod backup;
pub mod keys;
pub mod logs;
pub mod lookup;
pub mod migrate;
pub mod status;

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use fieldvault_core::config::Config;
use fieldvault_core::services::{EntryPoint, LogEvent, LoggingService};
use fieldvault_core::VaultContext;

/// Get the logging service for CLI operations
///
/// Returns None if logging fails to initialize (shouldn't block operations)
pub fn get_logger() -> Option<LoggingService> {
    let data_dir = get_data_dir().ok()?;
    std::fs::create_dir_all(&data_dir).ok()?;
    LoggingService::new(&data_dir, EntryPoint::Cli, env!("CARGO_PKG_VERSION")).ok()
}

/// Log an event, ignoring any errors (logging should never break the app)
pub fn log_event(logger: &Option<LoggingService>, event: LogEvent) {
    if let Some(l) = logger {
        let _ = l.log(event);
    }
}

/// Data directory from `FIELDVAULT_DIR` or `~/.fieldvault`
pub fn get_data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("FIELDVAULT_DIR") {
        return Ok(PathBuf::from(dir));
    }
    dirs::home_dir()
        .map(|home| home.join(".fieldvault"))
        .ok_or_else(|| anyhow!("Could not find home directory; set FIELDVAULT_DIR"))
}

/// Settings only; no store or key access
pub fn get_config() -> Result<Config> {
    let data_dir = get_data_dir()?;
    Config::load(&data_dir).context("Failed to load settings")
}

/// Open the store and load the keys
pub fn get_context() -> Result<VaultContext> {
    let data_dir = get_data_dir()?;
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
    tracing::debug!(data_dir = %data_dir.display(), "opening vault");
    VaultContext::new(&data_dir).context("Failed to initialize fieldvault context")
}

/// Ask before a destructive step; non-interactive sessions must pass a flag instead
pub fn confirm(prompt: &str) -> Result<bool> {
    if !atty::is(atty::Stream::Stdin) {
        return Ok(false);
    }
    Ok(dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}
