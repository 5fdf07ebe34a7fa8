//! Service layer - business logic orchestration
//!
//! Services coordinate domain logic and port interactions. Keys come first;
//! the cipher and hasher build on them, the transform on both, and the
//! migration runner, lookup and backups on the transform and the store.

pub mod backup;
pub mod cipher;
pub mod field_migration;
pub mod keys;
pub mod logging;
pub mod lookup;
pub mod schema;
pub mod search_hash;
pub mod transform;

pub use backup::{
    BackupOptions, BackupService, BackupSettings, BackupStatus, CreatedBackup, DecryptedBackup,
    RestoreReport, Snapshot,
};
pub use cipher::{is_encrypted, FieldCipher, ENCRYPTION_MARKER};
pub use field_migration::{
    CollectionAnalysis, FieldAnalysis, MigrationOptions, MigrationProgress, MigrationReport,
    MigrationRunner, VerificationFailure, VerificationReport,
};
pub use keys::{derive_key, DataEncryptionKey, KeyManager, KeyMaterial, KeyRing};
pub use logging::{EntryPoint, LogEntry, LogEvent, LoggingService};
pub use lookup::LookupService;
pub use schema::{SchemaMigrationResult, SchemaMigrationService};
pub use search_hash::{hash_field_name, normalize, SearchHasher};
pub use transform::DocumentTransform;
