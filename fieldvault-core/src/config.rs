//! Configuration management
//!
//! Settings live in settings.json in the data directory:
//! ```json
//! {
//!   "keyDir": "/secure/keys",
//!   "backupDir": "backups",
//!   "database": "store.duckdb",
//!   "migration": { "batchSize": 100, "verifySample": 10 },
//!   "backup": { "minFreeBytes": 5368709120, "warnFreeBytes": 10737418240, "keepAutomatic": 7 },
//!   "sensitiveFields": {
//!     "patients": [{ "path": "nhs_number", "encrypted": true, "hashable": true }]
//!   }
//! }
//! ```
//! Relative paths are resolved against the data directory. Keys the CLI
//! doesn't manage are preserved on save.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::{SensitiveFieldConfig, PATIENTS_COLLECTION};
use crate::services::backup::{DEFAULT_MIN_FREE_BYTES, DEFAULT_WARN_FREE_BYTES};
use crate::services::field_migration::{DEFAULT_BATCH_SIZE, DEFAULT_VERIFY_SAMPLE};

pub const SETTINGS_FILE: &str = "settings.json";
pub const DEFAULT_DATABASE: &str = "store.duckdb";
pub const DEFAULT_KEEP_AUTOMATIC: usize = 7;

/// Raw settings.json structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    backup_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    database: Option<PathBuf>,
    #[serde(default)]
    migration: MigrationSettings,
    #[serde(default)]
    backup: BackupSettingsFile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sensitive_fields: Option<BTreeMap<String, SensitiveFieldConfig>>,
    #[serde(flatten)]
    other: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MigrationSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    batch_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    verify_sample: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackupSettingsFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    min_free_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    warn_free_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    keep_automatic: Option<usize>,
}

/// Resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub key_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub database_path: PathBuf,
    pub batch_size: usize,
    pub verify_sample: usize,
    pub min_free_bytes: u64,
    pub warn_free_bytes: u64,
    pub keep_automatic: usize,
    /// Sensitive field table per collection
    pub sensitive_fields: BTreeMap<String, SensitiveFieldConfig>,
}

fn resolve(data_dir: &Path, configured: Option<&PathBuf>, default: &str) -> PathBuf {
    match configured {
        Some(p) if p.is_absolute() => p.clone(),
        Some(p) => data_dir.join(p),
        None => data_dir.join(default),
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("{} must be a number, got '{}'", name, value))
}

impl Config {
    /// Load settings from `data_dir` and apply environment overrides
    ///
    /// Overrides: `FIELDVAULT_KEY_DIR`, `FIELDVAULT_BATCH_SIZE`,
    /// `FIELDVAULT_MIN_FREE_BYTES`.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let mut config = Self::load_file(data_dir)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Settings file only, no environment
    pub fn load_file(data_dir: &Path) -> Result<Self> {
        let raw = read_settings(data_dir)?;

        let sensitive_fields = raw.sensitive_fields.clone().unwrap_or_else(|| {
            BTreeMap::from([(PATIENTS_COLLECTION.to_string(), SensitiveFieldConfig::patients())])
        });

        let config = Self {
            data_dir: data_dir.to_path_buf(),
            key_dir: resolve(data_dir, raw.key_dir.as_ref(), "keys"),
            backup_dir: resolve(data_dir, raw.backup_dir.as_ref(), "backups"),
            database_path: resolve(data_dir, raw.database.as_ref(), DEFAULT_DATABASE),
            batch_size: raw.migration.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            verify_sample: raw.migration.verify_sample.unwrap_or(DEFAULT_VERIFY_SAMPLE),
            min_free_bytes: raw.backup.min_free_bytes.unwrap_or(DEFAULT_MIN_FREE_BYTES),
            warn_free_bytes: raw.backup.warn_free_bytes.unwrap_or(DEFAULT_WARN_FREE_BYTES),
            keep_automatic: raw.backup.keep_automatic.unwrap_or(DEFAULT_KEEP_AUTOMATIC),
            sensitive_fields,
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup("FIELDVAULT_KEY_DIR").filter(|v| !v.trim().is_empty()) {
            self.key_dir = resolve(&self.data_dir, Some(&PathBuf::from(dir)), "keys");
        }
        if let Some(v) = lookup("FIELDVAULT_BATCH_SIZE") {
            self.batch_size = parse_env("FIELDVAULT_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("FIELDVAULT_MIN_FREE_BYTES") {
            self.min_free_bytes = parse_env("FIELDVAULT_MIN_FREE_BYTES", &v)?;
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(anyhow!("migration batch size must be at least 1"));
        }
        if self.warn_free_bytes < self.min_free_bytes {
            return Err(anyhow!(
                "backup.warnFreeBytes ({}) is below backup.minFreeBytes ({})",
                self.warn_free_bytes,
                self.min_free_bytes
            ));
        }
        Ok(())
    }

    /// Sensitive field table for `collection`; empty when none is configured
    pub fn fields_for(&self, collection: &str) -> SensitiveFieldConfig {
        self.sensitive_fields.get(collection).cloned().unwrap_or_default()
    }

    /// Write the managed keys back, preserving everything else in the file
    pub fn save(&self) -> Result<()> {
        let mut settings = read_settings(&self.data_dir)?;
        settings.key_dir = Some(self.key_dir.clone());
        settings.backup_dir = Some(self.backup_dir.clone());
        settings.database = Some(self.database_path.clone());
        settings.migration.batch_size = Some(self.batch_size);
        settings.migration.verify_sample = Some(self.verify_sample);
        settings.backup.min_free_bytes = Some(self.min_free_bytes);
        settings.backup.warn_free_bytes = Some(self.warn_free_bytes);
        settings.backup.keep_automatic = Some(self.keep_automatic);
        settings.sensitive_fields = Some(self.sensitive_fields.clone());

        std::fs::create_dir_all(&self.data_dir)?;
        let content = serde_json::to_string_pretty(&settings)?;
        std::fs::write(self.data_dir.join(SETTINGS_FILE), content)?;
        Ok(())
    }
}

fn read_settings(data_dir: &Path) -> Result<SettingsFile> {
    let settings_path = data_dir.join(SETTINGS_FILE);
    if !settings_path.exists() {
        return Ok(SettingsFile::default());
    }
    let content = std::fs::read_to_string(&settings_path)
        .with_context(|| format!("Failed to read {}", settings_path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid settings in {}", settings_path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_settings_file() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_file(dir.path()).unwrap();

        assert_eq!(config.key_dir, dir.path().join("keys"));
        assert_eq!(config.backup_dir, dir.path().join("backups"));
        assert_eq!(config.database_path, dir.path().join(DEFAULT_DATABASE));
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.keep_automatic, DEFAULT_KEEP_AUTOMATIC);
        assert_eq!(config.fields_for("patients"), SensitiveFieldConfig::patients());
        assert!(config.fields_for("wards").is_empty());
    }

    #[test]
    fn test_settings_file_is_read() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILE),
            r#"{
                "keyDir": "/secure/keys",
                "backupDir": "snapshots",
                "migration": { "batchSize": 25 },
                "backup": { "keepAutomatic": 3 },
                "sensitiveFields": {
                    "episodes": [{ "path": "mrn", "encrypted": true, "hashable": true, "caseInsensitive": true }]
                },
                "theme": "dark"
            }"#,
        )
        .unwrap();

        let config = Config::load_file(dir.path()).unwrap();
        assert_eq!(config.key_dir, PathBuf::from("/secure/keys"));
        assert_eq!(config.backup_dir, dir.path().join("snapshots"));
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.keep_automatic, 3);
        assert!(config.fields_for("patients").is_empty());
        assert!(config.fields_for("episodes").field("mrn").unwrap().case_insensitive);
    }

    #[test]
    fn test_invalid_field_table_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILE),
            r#"{ "sensitiveFields": { "patients": [
                { "path": "mrn", "encrypted": true },
                { "path": "mrn", "encrypted": true }
            ] } }"#,
        )
        .unwrap();
        assert!(Config::load_file(dir.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::load_file(dir.path()).unwrap();
        let env: HashMap<&str, &str> = HashMap::from([
            ("FIELDVAULT_KEY_DIR", "/run/keys"),
            ("FIELDVAULT_BATCH_SIZE", "500"),
            ("FIELDVAULT_MIN_FREE_BYTES", "0"),
        ]);
        config.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.key_dir, PathBuf::from("/run/keys"));
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.min_free_bytes, 0);

        assert!(config
            .apply_env(|k| (k == "FIELDVAULT_BATCH_SIZE").then(|| "lots".to_string()))
            .is_err());
    }

    #[test]
    fn test_save_preserves_unmanaged_keys() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(SETTINGS_FILE), r#"{ "theme": "dark" }"#).unwrap();

        let mut config = Config::load_file(dir.path()).unwrap();
        config.keep_automatic = 2;
        config.save().unwrap();

        let content = std::fs::read_to_string(dir.path().join(SETTINGS_FILE)).unwrap();
        assert!(content.contains("\"theme\": \"dark\""));
        assert_eq!(Config::load_file(dir.path()).unwrap().keep_automatic, 2);
    }
}
