//! Encryption domain models

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::result::{Error, Result};

/// Default PBKDF2 iteration count
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 100_000;
/// Lowest iteration count accepted when loading parameters
pub const MIN_PBKDF2_ITERATIONS: u32 = 100_000;
/// Derived key length (256-bit cipher key)
pub const DEFAULT_KEY_LEN: usize = 32;

/// Argon2id defaults
pub const DEFAULT_TIME_COST: u32 = 3;
pub const DEFAULT_MEMORY_COST: u32 = 65536; // 64 MiB
pub const DEFAULT_PARALLELISM: u32 = 4;

/// Key derivation algorithm
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum KdfAlgorithm {
    Pbkdf2Sha256 {
        iterations: u32,
    },
    Argon2id {
        time_cost: u32,
        memory_cost: u32,
        parallelism: u32,
    },
}

impl KdfAlgorithm {
    pub fn label(&self) -> &'static str {
        match self {
            KdfAlgorithm::Pbkdf2Sha256 { .. } => "pbkdf2-sha256",
            KdfAlgorithm::Argon2id { .. } => "argon2id",
        }
    }
}

/// Parameters persisted next to the key material (key-params.json)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: KdfAlgorithm,
    pub key_len: usize,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            algorithm: KdfAlgorithm::Pbkdf2Sha256 {
                iterations: DEFAULT_PBKDF2_ITERATIONS,
            },
            key_len: DEFAULT_KEY_LEN,
            version: 1,
            created_at: None,
        }
    }
}

impl KdfParams {
    /// Parameters for a freshly generated key
    pub fn new_now() -> Self {
        Self {
            created_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn argon2id() -> Self {
        Self {
            algorithm: KdfAlgorithm::Argon2id {
                time_cost: DEFAULT_TIME_COST,
                memory_cost: DEFAULT_MEMORY_COST,
                parallelism: DEFAULT_PARALLELISM,
            },
            ..Self::new_now()
        }
    }

    /// Reject parameters weaker than the minimum or unusable by the cipher
    pub fn validate(&self) -> Result<()> {
        if self.key_len != DEFAULT_KEY_LEN {
            return Err(Error::configuration(format!(
                "derived key length must be {} bytes, got {}",
                DEFAULT_KEY_LEN, self.key_len
            )));
        }
        if let KdfAlgorithm::Pbkdf2Sha256 { iterations } = self.algorithm {
            if iterations < MIN_PBKDF2_ITERATIONS {
                return Err(Error::configuration(format!(
                    "PBKDF2 iterations must be at least {}, got {}",
                    MIN_PBKDF2_ITERATIONS, iterations
                )));
            }
        }
        Ok(())
    }
}

/// State of the key material on disk, for display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyStatus {
    pub secret_path: PathBuf,
    pub salt_path: PathBuf,
    pub secret_present: bool,
    pub salt_present: bool,
    pub algorithm: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl KeyStatus {
    /// Both files present
    pub fn is_ready(&self) -> bool {
        self.secret_present && self.salt_present
    }

    /// Exactly one file present; refusing to regenerate is the only safe action
    pub fn is_inconsistent(&self) -> bool {
        self.secret_present != self.salt_present
    }
}
