//! Result and error types for the core library

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message returned across the request boundary when a sealed value can't be read.
/// Deliberately says nothing about keys, tags or payload shape.
pub const GENERIC_READ_FAILURE: &str = "Unable to read record";

/// Why a decryption attempt failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoFailure {
    /// AEAD tag did not verify (tamper, corruption, wrong key or wrong field)
    #[error("authentication tag did not verify")]
    TagMismatch,

    /// The artifact was sealed under a different key
    #[error("wrong encryption key")]
    WrongKey,

    /// The artifact is damaged (checksum mismatch, truncation, tag failure under the right key)
    #[error("corrupted data: {0}")]
    Corrupted(String),

    /// The input was never encrypted by this system
    #[error("data is not encrypted")]
    NotEncrypted,
}

/// Core library error type
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or inconsistent key material, invalid settings
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cryptographic error: {0}")]
    Cryptographic(CryptoFailure),

    /// A marker-bearing payload that can't be parsed
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Post-migration sample verification failed
    #[error("Migration integrity error: {0}")]
    MigrationIntegrity(String),

    /// Disk space, permission or archive failure during backup/restore
    #[error("Backup IO error: {0}")]
    BackupIo(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::Encoding(msg.into())
    }

    pub fn backup_io(msg: impl Into<String>) -> Self {
        Self::BackupIo(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// True for failures that would reveal something about sealed data if shown verbatim
    pub fn is_sealed_data_failure(&self) -> bool {
        matches!(self, Error::Cryptographic(_) | Error::Encoding(_))
    }
}

impl From<duckdb::Error> for Error {
    fn from(e: duckdb::Error) -> Self {
        Error::Store(e.to_string())
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(e: zip::result::ZipError) -> Self {
        Error::BackupIo(format!("archive failure: {e}"))
    }
}

/// Core library result type
pub type Result<T> = std::result::Result<T, Error>;

/// Operation result with optional context (for the outward request boundary)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub context: Option<HashMap<String, serde_json::Value>>,
}

impl<T> OperationResult<T> {
    /// Create a successful result
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            context: None,
        }
    }

    /// Create a successful result with context
    pub fn ok_with_context(data: T, context: HashMap<String, serde_json::Value>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            context: Some(context),
        }
    }

    /// Create a failed result
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            context: None,
        }
    }

    /// Convert a result that touched sealed data.
    ///
    /// Cryptographic and encoding failures collapse into [`GENERIC_READ_FAILURE`];
    /// everything else keeps its message.
    pub fn from_sealed(result: Result<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) if e.is_sealed_data_failure() => {
                tracing::warn!(error = %e, "sealed data could not be read");
                Self::fail(GENERIC_READ_FAILURE)
            }
            Err(e) => Self::fail(e.to_string()),
        }
    }
}

impl<T> From<Result<T>> for OperationResult<T> {
    fn from(result: Result<T>) -> Self {
        Self::from_sealed(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_result_ok() {
        let result: OperationResult<i32> = OperationResult::ok(42);
        assert!(result.success);
        assert_eq!(result.data, Some(42));
        assert!(result.error.is_none());
    }

    #[test]
    fn test_operation_result_fail() {
        let result: OperationResult<i32> = OperationResult::fail("Something went wrong");
        assert!(!result.success);
        assert!(result.data.is_none());
        assert_eq!(result.error, Some("Something went wrong".to_string()));
    }

    #[test]
    fn test_crypto_failure_is_hidden_at_boundary() {
        let err: Result<i32> = Err(Error::Cryptographic(CryptoFailure::TagMismatch));
        let result: OperationResult<i32> = err.into();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some(GENERIC_READ_FAILURE));

        let err: Result<i32> = Err(Error::encoding("bad base64 at offset 3"));
        let result: OperationResult<i32> = err.into();
        assert_eq!(result.error.as_deref(), Some(GENERIC_READ_FAILURE));
    }

    #[test]
    fn test_other_errors_keep_message() {
        let err: Result<i32> = Err(Error::not_found("patient P-1"));
        let result: OperationResult<i32> = err.into();
        assert!(result.error.unwrap().contains("Not found"));
    }
}
