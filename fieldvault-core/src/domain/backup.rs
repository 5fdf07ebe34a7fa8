//! Backup domain model

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who asked for the backup. Manual backups are exempt from retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Manual,
    Automatic,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Manual => "manual",
            BackupKind::Automatic => "automatic",
        }
    }
}

/// Summary written alongside every backup (`manifest.json` inside the
/// snapshot, `<name>.manifest.json` next to the encrypted artifact)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub timestamp: DateTime<Utc>,
    pub backup_type: BackupKind,
    /// Name of the source database
    pub database: String,
    /// Document count per collection
    pub collections: BTreeMap<String, u64>,
    pub total_documents: u64,
    /// Bytes of collection JSON in the snapshot, before zipping
    #[serde(default)]
    pub payload_size_bytes: u64,
    /// Bytes of the `.zip.enc` artifact. Only the manifest copy beside the
    /// artifact has it; the manifest inside is sealed before the size exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub encrypted: bool,
}

impl BackupManifest {
    /// Bytes on disk for this backup: the artifact when encrypted, the
    /// collection files otherwise
    pub fn stored_size_bytes(&self) -> u64 {
        self.artifact_size_bytes.unwrap_or(self.payload_size_bytes)
    }

    pub fn new(
        timestamp: DateTime<Utc>,
        backup_type: BackupKind,
        database: impl Into<String>,
        collections: BTreeMap<String, u64>,
        note: Option<String>,
    ) -> Self {
        let total_documents = collections.values().sum();
        Self {
            timestamp,
            backup_type,
            database: database.into(),
            collections,
            total_documents,
            payload_size_bytes: 0,
            artifact_size_bytes: None,
            note,
            encrypted: false,
        }
    }
}

/// One row of `backup list`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupInfo {
    /// Backup name (timestamp, e.g. "2025-01-15_10-30-00_123456")
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub kind: BackupKind,
    pub encrypted: bool,
    /// Checksum present; an encrypted artifact without one was interrupted
    pub complete: bool,
    /// Size in bytes
    pub size_bytes: u64,
    pub total_documents: u64,
    pub note: Option<String>,
}

impl BackupInfo {
    /// Format size for human display
    pub fn size_display(&self) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        const GB: u64 = MB * 1024;

        if self.size_bytes >= GB {
            format!("{:.1} GB", self.size_bytes as f64 / GB as f64)
        } else if self.size_bytes >= MB {
            format!("{:.1} MB", self.size_bytes as f64 / MB as f64)
        } else if self.size_bytes >= KB {
            format!("{:.1} KB", self.size_bytes as f64 / KB as f64)
        } else {
            format!("{} bytes", self.size_bytes)
        }
    }
}
