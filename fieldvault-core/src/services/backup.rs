//! Backup service - encrypted whole-store snapshots
//!
//! A backup starts as a directory `<name>/` holding `manifest.json` and one
//! `collections/<collection>.json` per collection. Encrypted backups are then
//! zipped, sealed with the backup sub-key and left as three siblings:
//!
//! - `<name>.zip.enc` - header + ChaCha20-Poly1305 ciphertext
//! - `<name>.manifest.json` - manifest copy, readable without the key
//! - `<name>.zip.enc.sha256` - `<hex digest>  <file name>`, written last
//!
//! An artifact without its checksum file was interrupted and is never
//! restored.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use super::keys::KeyRing;
use crate::domain::result::{CryptoFailure, Error, Result};
use crate::domain::{BackupInfo, BackupKind, BackupManifest, Document, Filter, Page};
use crate::ports::DocumentStore;

pub const DEFAULT_MIN_FREE_BYTES: u64 = 5 * 1024 * 1024 * 1024;
pub const DEFAULT_WARN_FREE_BYTES: u64 = 10 * 1024 * 1024 * 1024;

const ARTIFACT_EXT: &str = ".zip.enc";
const CHECKSUM_EXT: &str = ".zip.enc.sha256";
const MANIFEST_COPY_EXT: &str = ".manifest.json";
const MANIFEST_FILE: &str = "manifest.json";
const COLLECTIONS_DIR: &str = "collections";

const MAGIC: &[u8; 8] = b"FVBACKUP";
const FORMAT_VERSION: u8 = 1;
const KEY_CHECK_LEN: usize = 8;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = MAGIC.len() + 1 + KEY_CHECK_LEN + NONCE_LEN;
const KEY_CHECK_LABEL: &[u8] = b"fieldvault-backup-key-check";
const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";

const EXPORT_PAGE: usize = 1000;

type HmacSha256 = Hmac<Sha256>;

/// Where backups go and how much free space they need
#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub backup_dir: PathBuf,
    /// Refuse to start below this many free bytes
    pub min_free_bytes: u64,
    /// Warn below this many free bytes
    pub warn_free_bytes: u64,
}

impl BackupSettings {
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            min_free_bytes: DEFAULT_MIN_FREE_BYTES,
            warn_free_bytes: DEFAULT_WARN_FREE_BYTES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub kind: BackupKind,
    pub note: Option<String>,
    pub encrypt: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            kind: BackupKind::Automatic,
            note: None,
            encrypt: true,
        }
    }
}

/// A finished backup
#[derive(Debug, Clone, Serialize)]
pub struct CreatedBackup {
    pub name: String,
    /// Encrypted artifact, or the snapshot directory when unencrypted
    pub path: PathBuf,
    pub manifest: BackupManifest,
    /// Hex SHA-256 of the ciphertext
    pub checksum: Option<String>,
}

/// A backup expanded back into a directory
#[derive(Debug, Clone, Serialize)]
pub struct DecryptedBackup {
    pub dir: PathBuf,
    pub manifest: BackupManifest,
}

/// Documents read back from a snapshot directory
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub manifest: BackupManifest,
    pub collections: BTreeMap<String, Vec<Document>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub name: String,
    /// Automatic backup of the store taken just before restoring
    pub safety_backup: String,
    pub collections: BTreeMap<String, u64>,
    pub total_documents: u64,
}

/// Overview of the backup directory
#[derive(Debug, Clone, Serialize)]
pub struct BackupStatus {
    pub backup_dir: PathBuf,
    pub count: usize,
    pub incomplete: usize,
    pub total_size_bytes: u64,
    /// None when the directory doesn't exist yet
    pub free_bytes: Option<u64>,
    /// Below the warning threshold
    pub low_disk_space: bool,
    pub latest: Option<BackupInfo>,
}

/// Removes tracked paths on drop unless disarmed
struct PartialArtifacts {
    paths: Vec<PathBuf>,
    armed: bool,
}

impl PartialArtifacts {
    fn new() -> Self {
        Self {
            paths: Vec::new(),
            armed: true,
        }
    }

    fn track(&mut self, path: &Path) {
        self.paths.push(path.to_path_buf());
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PartialArtifacts {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for path in self.paths.iter().rev() {
            let removed = if path.is_dir() {
                fs::remove_dir_all(path)
            } else {
                fs::remove_file(path)
            };
            if let Err(e) = removed {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "could not remove partial backup artifact");
                }
            }
        }
    }
}

fn io_failure(action: &str, path: &Path, e: std::io::Error) -> Error {
    Error::backup_io(format!("{} {}: {}", action, path.display(), e))
}

fn corrupted(reason: &str) -> Error {
    Error::Cryptographic(CryptoFailure::Corrupted(reason.to_string()))
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn backup_name(now: DateTime<Utc>) -> String {
    format!("{}_{:06}", now.format("%Y-%m-%d_%H-%M-%S"), now.timestamp_subsec_micros())
}

/// Creation time encoded in a backup name
fn parse_backup_time(name: &str) -> Option<DateTime<Utc>> {
    let (base, micros) = name.rsplit_once('_')?;
    let micros: u32 = micros.parse().ok()?;
    let dt = NaiveDateTime::parse_from_str(base, "%Y-%m-%d_%H-%M-%S").ok()?;
    dt.with_nanosecond(micros.checked_mul(1000)?).map(|dt| dt.and_utc())
}

fn key_check(key: &[u8; 32]) -> Result<[u8; KEY_CHECK_LEN]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| Error::configuration(format!("invalid backup key: {e}")))?;
    mac.update(KEY_CHECK_LABEL);
    let digest = mac.finalize().into_bytes();
    let mut check = [0u8; KEY_CHECK_LEN];
    check.copy_from_slice(&digest[..KEY_CHECK_LEN]);
    Ok(check)
}

/// Encrypt a whole archive; the header is authenticated as associated data
fn seal_archive(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let mut out = Vec::with_capacity(HEADER_LEN + plaintext.len() + TAG_LEN);
    out.extend_from_slice(MAGIC);
    out.push(FORMAT_VERSION);
    out.extend_from_slice(&key_check(key)?);
    out.extend_from_slice(&nonce);

    let sealed = ChaCha20Poly1305::new(Key::from_slice(key))
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad: &out[..HEADER_LEN],
            },
        )
        .map_err(|_| Error::backup_io("archive encryption failed"))?;
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Decrypt an archive, telling wrong keys, damage and plain archives apart
fn open_archive(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>> {
    if data.starts_with(ZIP_MAGIC) {
        return Err(Error::Cryptographic(CryptoFailure::NotEncrypted));
    }
    if data.len() < MAGIC.len() {
        return Err(corrupted("file is too short to be a backup"));
    }
    if &data[..MAGIC.len()] != MAGIC {
        return Err(Error::Cryptographic(CryptoFailure::NotEncrypted));
    }
    if data.len() < HEADER_LEN + TAG_LEN {
        return Err(corrupted("file is truncated"));
    }
    if data[MAGIC.len()] != FORMAT_VERSION {
        return Err(corrupted("unknown backup format version"));
    }

    let check_start = MAGIC.len() + 1;
    let nonce_start = check_start + KEY_CHECK_LEN;
    if data[check_start..nonce_start] != key_check(key)? {
        return Err(Error::Cryptographic(CryptoFailure::WrongKey));
    }

    let nonce = Nonce::from_slice(&data[nonce_start..HEADER_LEN]);
    ChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt(
            nonce,
            Payload {
                msg: &data[HEADER_LEN..],
                aad: &data[..HEADER_LEN],
            },
        )
        .map_err(|_| corrupted("authentication failed; the file was modified or damaged"))
}

/// Collection names become file names
fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\'])
        || name.contains("..")
    {
        return Err(Error::validation(format!(
            "collection name '{name}' can't be used as a file name"
        )));
    }
    Ok(())
}

pub struct BackupService {
    store: Arc<dyn DocumentStore>,
    keys: Arc<KeyRing>,
    settings: BackupSettings,
}

impl BackupService {
    pub fn new(store: Arc<dyn DocumentStore>, keys: Arc<KeyRing>, settings: BackupSettings) -> Self {
        Self { store, keys, settings }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.settings.backup_dir
    }

    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.backup_dir().join(format!("{name}{ARTIFACT_EXT}"))
    }

    pub fn checksum_path(&self, name: &str) -> PathBuf {
        self.backup_dir().join(format!("{name}{CHECKSUM_EXT}"))
    }

    pub fn manifest_copy_path(&self, name: &str) -> PathBuf {
        self.backup_dir().join(format!("{name}{MANIFEST_COPY_EXT}"))
    }

    /// Free bytes on the backup volume; errors below the safety threshold
    pub fn check_disk_space(&self) -> Result<u64> {
        let dir = self.backup_dir();
        let free = fs2::available_space(dir).map_err(|e| io_failure("cannot stat", dir, e))?;
        if free < self.settings.min_free_bytes {
            return Err(Error::backup_io(format!(
                "only {} MiB free on {}; at least {} MiB required",
                free / (1024 * 1024),
                dir.display(),
                self.settings.min_free_bytes / (1024 * 1024)
            )));
        }
        if free < self.settings.warn_free_bytes {
            tracing::warn!(
                free_mib = free / (1024 * 1024),
                "disk space is low on the backup volume"
            );
        }
        Ok(free)
    }

    /// Snapshot every collection and (by default) encrypt the result.
    ///
    /// Any failure removes everything written so far.
    pub fn create_backup(&self, options: &BackupOptions) -> Result<CreatedBackup> {
        let backup_dir = self.backup_dir().to_path_buf();
        fs::create_dir_all(&backup_dir).map_err(|e| io_failure("cannot create", &backup_dir, e))?;
        self.check_disk_space()?;

        let now = Utc::now();
        let name = backup_name(now);
        let snapshot_dir = backup_dir.join(&name);
        if snapshot_dir.exists() || self.artifact_path(&name).exists() {
            return Err(Error::backup_io(format!("backup {name} already exists")));
        }

        let mut partial = PartialArtifacts::new();
        partial.track(&snapshot_dir);
        let collections_dir = snapshot_dir.join(COLLECTIONS_DIR);
        fs::create_dir_all(&collections_dir)
            .map_err(|e| io_failure("cannot create", &collections_dir, e))?;

        let mut counts = BTreeMap::new();
        let mut payload_bytes = 0u64;
        for collection in self.store.collections()? {
            validate_collection_name(&collection)?;
            let path = collections_dir.join(format!("{collection}.json"));
            let count = self.export_collection(&collection, &path)?;
            payload_bytes += fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            counts.insert(collection, count);
        }

        let mut manifest = BackupManifest::new(
            now,
            options.kind,
            self.store.database_name(),
            counts,
            options.note.clone(),
        );
        manifest.encrypted = options.encrypt;
        manifest.payload_size_bytes = payload_bytes;
        write_json(&snapshot_dir.join(MANIFEST_FILE), &manifest)?;

        if !options.encrypt {
            partial.disarm();
            tracing::info!(backup = %name, documents = manifest.total_documents, "created unencrypted backup");
            return Ok(CreatedBackup {
                name,
                path: snapshot_dir,
                manifest,
                checksum: None,
            });
        }

        let zip_path = backup_dir.join(format!("{name}.zip"));
        partial.track(&zip_path);
        zip_snapshot(&snapshot_dir, &name, &zip_path)?;

        let plaintext = fs::read(&zip_path).map_err(|e| io_failure("cannot read", &zip_path, e))?;
        let ciphertext = seal_archive(self.keys.backup_key(), &plaintext)?;
        drop(plaintext);

        let artifact = self.artifact_path(&name);
        partial.track(&artifact);
        fs::write(&artifact, &ciphertext).map_err(|e| io_failure("cannot write", &artifact, e))?;

        manifest.artifact_size_bytes = Some(ciphertext.len() as u64);
        let manifest_copy = self.manifest_copy_path(&name);
        partial.track(&manifest_copy);
        write_json(&manifest_copy, &manifest)?;

        let checksum = sha256_hex(&ciphertext);
        let checksum_path = self.checksum_path(&name);
        partial.track(&checksum_path);
        fs::write(&checksum_path, format!("{}  {}{}\n", checksum, name, ARTIFACT_EXT))
            .map_err(|e| io_failure("cannot write", &checksum_path, e))?;

        // ciphertext and checksum exist; the plaintext can go
        partial.disarm();
        for leftover in [&zip_path, &snapshot_dir] {
            let removed = if leftover.is_dir() {
                fs::remove_dir_all(leftover)
            } else {
                fs::remove_file(leftover)
            };
            if let Err(e) = removed {
                tracing::warn!(path = %leftover.display(), error = %e, "could not remove plaintext backup staging");
            }
        }

        tracing::info!(backup = %name, documents = manifest.total_documents, "created encrypted backup");
        Ok(CreatedBackup {
            name,
            path: artifact,
            manifest,
            checksum: Some(checksum),
        })
    }

    /// Stream one collection to a JSON array file, returning the count
    fn export_collection(&self, collection: &str, path: &Path) -> Result<u64> {
        let file = File::create(path).map_err(|e| io_failure("cannot create", path, e))?;
        let mut out = BufWriter::new(file);
        let write_err = |e: std::io::Error| io_failure("cannot write", path, e);

        out.write_all(b"[").map_err(write_err)?;
        let mut count = 0u64;
        let mut after: Option<String> = None;
        loop {
            let page = Page {
                after: after.clone(),
                limit: EXPORT_PAGE,
            };
            let docs = self.store.find(collection, &Filter::All, &page)?;
            for doc in &docs {
                if count > 0 {
                    out.write_all(b",").map_err(write_err)?;
                }
                serde_json::to_writer(&mut out, doc)?;
                count += 1;
            }
            match docs.last() {
                Some(last) if docs.len() == EXPORT_PAGE => after = last.id(),
                _ => break,
            }
        }
        out.write_all(b"]").map_err(write_err)?;
        out.flush().map_err(write_err)?;
        Ok(count)
    }

    /// Locate an encrypted artifact by backup name or path
    pub fn resolve_artifact(&self, name_or_path: &str) -> Result<PathBuf> {
        let direct = PathBuf::from(name_or_path);
        if direct.is_file() {
            return Ok(direct);
        }
        let name = name_or_path.strip_suffix(ARTIFACT_EXT).unwrap_or(name_or_path);
        let artifact = self.artifact_path(name);
        if artifact.is_file() {
            return Ok(artifact);
        }
        let snapshot_dir = if direct.is_dir() { direct } else { self.backup_dir().join(name) };
        if snapshot_dir.join(MANIFEST_FILE).is_file() {
            return Err(Error::Cryptographic(CryptoFailure::NotEncrypted));
        }
        Err(Error::not_found(format!("backup {name_or_path}")))
    }

    /// Compare the artifact against its checksum file
    pub fn verify_checksum(&self, name_or_path: &str) -> Result<bool> {
        let artifact = self.resolve_artifact(name_or_path)?;
        let checksum_path = checksum_path_for(&artifact);
        if !checksum_path.exists() {
            return Err(Error::backup_io(format!(
                "{} has no checksum file; the backup is incomplete",
                artifact.display()
            )));
        }
        let data = fs::read(&artifact).map_err(|e| io_failure("cannot read", &artifact, e))?;
        checksum_matches(&checksum_path, &data)
    }

    /// Decrypt an artifact and extract it into `output_dir`.
    ///
    /// Extraction happens in a hidden staging directory that is renamed into
    /// place only on success, so failures leave nothing behind.
    pub fn decrypt_backup(&self, name_or_path: &str, output_dir: &Path) -> Result<DecryptedBackup> {
        let artifact = self.resolve_artifact(name_or_path)?;
        let data = fs::read(&artifact).map_err(|e| io_failure("cannot read", &artifact, e))?;

        let checksum_path = checksum_path_for(&artifact);
        if checksum_path.exists() {
            if !checksum_matches(&checksum_path, &data)? {
                return Err(corrupted("checksum does not match the file"));
            }
        } else {
            tracing::warn!(artifact = %artifact.display(), "no checksum file; relying on the authentication tag");
        }

        let plaintext = open_archive(self.keys.backup_key(), &data)?;

        fs::create_dir_all(output_dir).map_err(|e| io_failure("cannot create", output_dir, e))?;
        let staging = tempfile::Builder::new()
            .prefix(".fv-extract-")
            .tempdir_in(output_dir)
            .map_err(|e| io_failure("cannot create staging in", output_dir, e))?;

        extract_zip(&plaintext, staging.path())?;
        let root = single_root(staging.path())?;
        let root_name = root
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| corrupted("archive has no root directory"))?;
        let manifest = read_manifest(&root.join(MANIFEST_FILE))?;

        let target = output_dir.join(root_name);
        if target.exists() {
            return Err(Error::backup_io(format!("{} already exists", target.display())));
        }
        fs::rename(&root, &target).map_err(|e| io_failure("cannot move into place", &target, e))?;

        Ok(DecryptedBackup { dir: target, manifest })
    }

    /// Read a snapshot directory back into documents
    pub fn load_snapshot(&self, dir: &Path) -> Result<Snapshot> {
        let manifest = read_manifest(&dir.join(MANIFEST_FILE))?;
        let mut collections = BTreeMap::new();
        for name in manifest.collections.keys() {
            validate_collection_name(name)?;
            let path = dir.join(COLLECTIONS_DIR).join(format!("{name}.json"));
            let content = fs::read_to_string(&path).map_err(|e| io_failure("cannot read", &path, e))?;
            let docs: Vec<Document> = serde_json::from_str(&content)?;
            if docs.len() as u64 != manifest.collections[name] {
                return Err(Error::backup_io(format!(
                    "collection {} holds {} documents, manifest says {}",
                    name,
                    docs.len(),
                    manifest.collections[name]
                )));
            }
            collections.insert(name.clone(), docs);
        }
        Ok(Snapshot { manifest, collections })
    }

    /// Replace the store content with a backup.
    ///
    /// Requires `confirm`. An automatic backup of the current store is taken
    /// first; collections absent from the backup are emptied.
    pub fn restore(&self, name: &str, confirm: bool) -> Result<RestoreReport> {
        if !confirm {
            return Err(Error::validation(
                "restore replaces the whole store and requires explicit confirmation",
            ));
        }

        let snapshot_dir = self.backup_dir().join(name);
        let work = tempfile::Builder::new()
            .prefix(".fv-restore-")
            .tempdir_in(self.backup_dir())
            .map_err(|e| io_failure("cannot create staging in", self.backup_dir(), e))?;

        let snapshot = if self.artifact_path(name).is_file() {
            if !self.checksum_path(name).exists() {
                return Err(Error::backup_io(format!(
                    "backup {name} has no checksum file; it is incomplete and can't be restored"
                )));
            }
            let decrypted = self.decrypt_backup(name, work.path())?;
            self.load_snapshot(&decrypted.dir)?
        } else if snapshot_dir.join(MANIFEST_FILE).is_file() {
            self.load_snapshot(&snapshot_dir)?
        } else {
            return Err(Error::not_found(format!("backup {name}")));
        };

        let safety = self.create_backup(&BackupOptions {
            kind: BackupKind::Automatic,
            note: Some(format!("before restore of {name}")),
            encrypt: true,
        })?;

        for existing in self.store.collections()? {
            if !snapshot.collections.contains_key(&existing) {
                self.store.replace_collection(&existing, &[])?;
            }
        }
        let mut counts = BTreeMap::new();
        for (collection, docs) in &snapshot.collections {
            self.store.replace_collection(collection, docs)?;
            counts.insert(collection.clone(), docs.len() as u64);
        }

        tracing::warn!(backup = %name, safety_backup = %safety.name, "store restored from backup");
        Ok(RestoreReport {
            name: name.to_string(),
            safety_backup: safety.name,
            total_documents: counts.values().sum(),
            collections: counts,
        })
    }

    /// All backups, newest first
    pub fn list(&self) -> Result<Vec<BackupInfo>> {
        let dir = self.backup_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut backups: BTreeMap<String, BackupInfo> = BTreeMap::new();
        for entry in fs::read_dir(dir).map_err(|e| io_failure("cannot read", dir, e))? {
            let path = entry?.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };

            if let Some(name) = file_name.strip_suffix(MANIFEST_COPY_EXT) {
                let manifest = match read_manifest(&path) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unreadable manifest");
                        continue;
                    }
                };
                let size_bytes = fs::metadata(self.artifact_path(name))
                    .map(|m| m.len())
                    .unwrap_or_else(|_| manifest.stored_size_bytes());
                backups.insert(
                    name.to_string(),
                    BackupInfo {
                        name: name.to_string(),
                        created_at: manifest.timestamp,
                        kind: manifest.backup_type,
                        encrypted: true,
                        complete: self.checksum_path(name).exists() && self.artifact_path(name).exists(),
                        size_bytes,
                        total_documents: manifest.total_documents,
                        note: manifest.note,
                    },
                );
            } else if path.is_dir() && parse_backup_time(&file_name).is_some() {
                // encrypted backups only leave a directory while being built
                match read_manifest(&path.join(MANIFEST_FILE)) {
                    Ok(manifest) if !manifest.encrypted => {
                        backups.insert(
                            file_name.clone(),
                            BackupInfo {
                                name: file_name.clone(),
                                created_at: manifest.timestamp,
                                kind: manifest.backup_type,
                                encrypted: false,
                                complete: true,
                                size_bytes: manifest.stored_size_bytes(),
                                total_documents: manifest.total_documents,
                                note: manifest.note,
                            },
                        );
                    }
                    _ => continue,
                }
            }
        }

        // ciphertext left without a manifest copy by an interrupted run
        for entry in fs::read_dir(dir).map_err(|e| io_failure("cannot read", dir, e))? {
            let path = entry?.path();
            let Some(name) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(ARTIFACT_EXT))
                .map(str::to_string)
            else {
                continue;
            };
            if backups.contains_key(&name) {
                continue;
            }
            let Some(created_at) = parse_backup_time(&name) else {
                continue;
            };
            backups.insert(
                name.clone(),
                BackupInfo {
                    name,
                    created_at,
                    kind: BackupKind::Automatic,
                    encrypted: true,
                    complete: false,
                    size_bytes: fs::metadata(&path).map(|m| m.len()).unwrap_or(0),
                    total_documents: 0,
                    note: None,
                },
            );
        }

        let mut list: Vec<BackupInfo> = backups.into_values().collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    /// Count, size and free space of the backup directory, plus the newest backup
    pub fn status(&self) -> Result<BackupStatus> {
        let backups = self.list()?;
        let dir = self.backup_dir();
        let free_bytes = if dir.exists() {
            Some(fs2::available_space(dir).map_err(|e| io_failure("cannot stat", dir, e))?)
        } else {
            None
        };
        Ok(BackupStatus {
            backup_dir: dir.to_path_buf(),
            count: backups.len(),
            incomplete: backups.iter().filter(|b| !b.complete).count(),
            total_size_bytes: backups.iter().map(|b| b.size_bytes).sum(),
            free_bytes,
            low_disk_space: free_bytes.is_some_and(|free| free < self.settings.warn_free_bytes),
            latest: backups.into_iter().next(),
        })
    }

    /// Full manifest of one backup, read without the key
    pub fn details(&self, name: &str) -> Result<BackupManifest> {
        let copy = self.manifest_copy_path(name);
        if copy.is_file() {
            return read_manifest(&copy);
        }
        let inner = self.backup_dir().join(name).join(MANIFEST_FILE);
        if inner.is_file() {
            return read_manifest(&inner);
        }
        Err(Error::not_found(format!("backup {name}")))
    }

    /// Remove every artifact of one backup
    pub fn delete(&self, name: &str) -> Result<BackupInfo> {
        let info = self
            .list()?
            .into_iter()
            .find(|b| b.name == name)
            .ok_or_else(|| Error::not_found(format!("backup {name}")))?;

        for path in [
            self.checksum_path(name),
            self.manifest_copy_path(name),
            self.artifact_path(name),
        ] {
            if path.exists() {
                fs::remove_file(&path).map_err(|e| io_failure("cannot delete", &path, e))?;
            }
        }
        let dir = self.backup_dir().join(name);
        if dir.is_dir() {
            fs::remove_dir_all(&dir).map_err(|e| io_failure("cannot delete", &dir, e))?;
        }
        Ok(info)
    }

    /// Keep the newest `keep_automatic` automatic backups; manual backups
    /// are never deleted. Returns the deleted names.
    pub fn apply_retention(&self, keep_automatic: usize) -> Result<Vec<String>> {
        let automatic: Vec<BackupInfo> = self
            .list()?
            .into_iter()
            // incomplete artifacts have no trustworthy kind; they go by explicit delete only
            .filter(|b| b.complete && b.kind == BackupKind::Automatic)
            .collect();

        let mut deleted = Vec::new();
        for backup in automatic.into_iter().skip(keep_automatic) {
            self.delete(&backup.name)?;
            deleted.push(backup.name);
        }
        if !deleted.is_empty() {
            tracing::info!(count = deleted.len(), "deleted old automatic backups");
        }
        Ok(deleted)
    }
}

fn checksum_path_for(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(".sha256");
    PathBuf::from(name)
}

/// First token of a `<hex digest>  <file name>` line against the data
fn checksum_matches(checksum_path: &Path, data: &[u8]) -> Result<bool> {
    let content = fs::read_to_string(checksum_path)
        .map_err(|e| io_failure("cannot read", checksum_path, e))?;
    let expected = content
        .split_whitespace()
        .next()
        .ok_or_else(|| corrupted("checksum file is empty"))?;
    Ok(expected.eq_ignore_ascii_case(&sha256_hex(data)))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).map_err(|e| io_failure("cannot write", path, e))
}

fn read_manifest(path: &Path) -> Result<BackupManifest> {
    let content = fs::read_to_string(path).map_err(|e| io_failure("cannot read", path, e))?;
    Ok(serde_json::from_str(&content)?)
}

/// Zip `<snapshot_dir>` with entries rooted at `<name>/`
fn zip_snapshot(snapshot_dir: &Path, name: &str, zip_path: &Path) -> Result<()> {
    let file = File::create(zip_path).map_err(|e| io_failure("cannot create", zip_path, e))?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut entries = vec![(format!("{name}/{MANIFEST_FILE}"), snapshot_dir.join(MANIFEST_FILE))];
    let collections_dir = snapshot_dir.join(COLLECTIONS_DIR);
    let mut files: Vec<PathBuf> = fs::read_dir(&collections_dir)
        .map_err(|e| io_failure("cannot read", &collections_dir, e))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    files.sort();
    for path in files {
        if let Some(file_name) = path.file_name().and_then(|n| n.to_str()) {
            entries.push((format!("{name}/{COLLECTIONS_DIR}/{file_name}"), path.clone()));
        }
    }

    let mut buffer = Vec::new();
    for (entry_name, path) in entries {
        zip.start_file(entry_name, options)?;
        buffer.clear();
        File::open(&path)
            .and_then(|mut f| f.read_to_end(&mut buffer))
            .map_err(|e| io_failure("cannot read", &path, e))?;
        zip.write_all(&buffer)
            .map_err(|e| io_failure("cannot write", zip_path, e))?;
    }
    zip.finish()?;
    Ok(())
}

fn extract_zip(bytes: &[u8], dest: &Path) -> Result<()> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|_| corrupted("decrypted payload is not a valid archive"))?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| corrupted("archive entry escapes the target directory"))?;
        let target = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|e| io_failure("cannot create", &target, e))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| io_failure("cannot create", parent, e))?;
        }
        let mut out = File::create(&target).map_err(|e| io_failure("cannot create", &target, e))?;
        std::io::copy(&mut entry, &mut out).map_err(|e| io_failure("cannot write", &target, e))?;
    }
    Ok(())
}

/// The one top-level directory of an extracted archive
fn single_root(dir: &Path) -> Result<PathBuf> {
    let mut roots = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| io_failure("cannot read", dir, e))? {
        roots.push(entry?.path());
    }
    match roots.as_slice() {
        [root] if root.is_dir() => Ok(root.clone()),
        _ => Err(corrupted("archive must hold exactly one backup directory")),
    }
}
