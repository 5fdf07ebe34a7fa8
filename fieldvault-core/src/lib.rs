//! FieldVault Core - field-level encryption for a shared document store
//!
//! This crate follows a hexagonal layout:
//!
//! - **domain**: documents, sensitive field tables, key parameters, backup metadata
//! - **ports**: the [`DocumentStore`](ports::DocumentStore) trait
//! - **services**: keys, field cipher, search hashes, migration, lookup, backups
//! - **adapters**: the DuckDB document store

pub mod adapters;
pub mod config;
pub mod domain;
pub mod log_migrations;
pub mod migrations;
pub mod ports;
pub mod services;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use adapters::duckdb::DuckDbDocumentStore;
use config::Config;
use ports::DocumentStore;
use services::*;

pub use domain::result::{CryptoFailure, Error, OperationResult};
pub use domain::{BackupInfo, BackupKind, BackupManifest, Document, FieldPath, SensitiveFieldConfig};

/// Per-process wiring of configuration, store and keys
///
/// The key ring is derived once here and shared by every service built from
/// the context.
pub struct VaultContext {
    pub config: Config,
    pub store: Arc<DuckDbDocumentStore>,
    keys: Arc<KeyRing>,
}

impl VaultContext {
    /// Load settings from `data_dir`, open the store and load the key
    /// material, generating it on first use
    pub fn new(data_dir: &Path) -> Result<Self> {
        let config = Config::load(data_dir)?;
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create {}", data_dir.display()))?;

        let material = KeyManager::new(&config.key_dir)
            .load_or_create()
            .context("Failed to load key material")?;
        let keys = Arc::new(KeyRing::derive(&derive_key(&material)?)?);

        let store = Arc::new(
            DuckDbDocumentStore::open(&config.database_path)
                .with_context(|| format!("Failed to open {}", config.database_path.display()))?,
        );

        Ok(Self { config, store, keys })
    }

    /// Context over an already opened store and key ring
    pub fn with_parts(config: Config, store: Arc<DuckDbDocumentStore>, keys: Arc<KeyRing>) -> Self {
        Self { config, store, keys }
    }

    fn shared_store(&self) -> Arc<dyn DocumentStore> {
        self.store.clone()
    }

    /// Transform configured with the sensitive field table of `collection`
    pub fn transform_for(&self, collection: &str) -> DocumentTransform {
        DocumentTransform::new(
            FieldCipher::new(Arc::clone(&self.keys)),
            SearchHasher::new(Arc::clone(&self.keys)),
            self.config.fields_for(collection),
        )
    }

    pub fn migration_runner(&self, collection: &str) -> MigrationRunner {
        MigrationRunner::new(self.shared_store(), self.transform_for(collection))
    }

    pub fn lookup_service(&self, collection: &str) -> LookupService {
        LookupService::new(self.shared_store(), self.transform_for(collection))
    }

    pub fn backup_service(&self) -> BackupService {
        BackupService::new(
            self.shared_store(),
            Arc::clone(&self.keys),
            BackupSettings {
                backup_dir: self.config.backup_dir.clone(),
                min_free_bytes: self.config.min_free_bytes,
                warn_free_bytes: self.config.warn_free_bytes,
            },
        )
    }

    /// Default migration options from configuration
    pub fn migration_options(&self) -> MigrationOptions {
        MigrationOptions {
            batch_size: self.config.batch_size,
            verify_sample: self.config.verify_sample,
            ..MigrationOptions::default()
        }
    }
}
