//! Core domain entities
//!
//! Documents, field configuration, key parameters and backup metadata.
//! These are plain data structures with validation logic - no I/O.

mod backup;
mod document;
mod encryption;
mod fields;
pub mod result;

pub use backup::{BackupInfo, BackupKind, BackupManifest};
pub use document::{Document, FieldPath, Filter, Page, ID_FIELD};
pub(crate) use document::json_kind;
pub use encryption::{
    KdfAlgorithm, KdfParams, KeyStatus, DEFAULT_KEY_LEN, DEFAULT_PBKDF2_ITERATIONS,
    MIN_PBKDF2_ITERATIONS,
};
pub use fields::{
    FieldStatus, SensitiveField, SensitiveFieldConfig, HASH_SUFFIX, PATIENTS_COLLECTION,
};
