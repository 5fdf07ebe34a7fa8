//! Key manager - master secret, salt and derived keys
//!
//! The master secret and salt live in two owner-only files in the key
//! directory. The data encryption key is derived from them with PBKDF2 (or
//! Argon2id when configured) and split with HKDF into independent sub-keys,
//! one per primitive.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine};
use fs2::FileExt;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::domain::result::{Error, Result};
use crate::domain::{KdfAlgorithm, KdfParams, KeyStatus, DEFAULT_KEY_LEN};

pub const SECRET_FILE: &str = "master.key";
pub const SALT_FILE: &str = "master.salt";
pub const PARAMS_FILE: &str = "key-params.json";
const LOCK_FILE: &str = ".keys.lock";

const SECRET_LEN: usize = 32;
const SALT_LEN: usize = 16;

/// HKDF salt shared by all sub-key expansions
const KEYRING_SALT: &[u8] = b"fieldvault-keyring-v1";
const FIELD_LABEL: &[u8] = b"field-encryption";
const SEARCH_LABEL: &[u8] = b"search-hash";
const BACKUP_LABEL: &[u8] = b"backup-encryption";

/// Master secret, salt and the parameters to derive a key from them
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    secret: Vec<u8>,
    salt: Vec<u8>,
    #[zeroize(skip)]
    params: KdfParams,
}

impl KeyMaterial {
    pub fn new(secret: Vec<u8>, salt: Vec<u8>, params: KdfParams) -> Self {
        Self { secret, salt, params }
    }

    pub fn params(&self) -> &KdfParams {
        &self.params
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("secret", &"<redacted>")
            .field("salt_len", &self.salt.len())
            .field("params", &self.params)
            .finish()
    }
}

/// 256-bit key derived from [`KeyMaterial`]
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DataEncryptionKey([u8; DEFAULT_KEY_LEN]);

impl DataEncryptionKey {
    pub fn from_bytes(bytes: [u8; DEFAULT_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for DataEncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataEncryptionKey(<redacted>)")
    }
}

/// Independent sub-keys for field encryption, search hashing and backups.
///
/// Built once per process and shared behind an `Arc`.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyRing {
    field: [u8; 32],
    search: [u8; 32],
    backup: [u8; 32],
}

impl KeyRing {
    /// Expand the data encryption key into labelled sub-keys (HKDF-SHA256)
    pub fn derive(key: &DataEncryptionKey) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(Some(KEYRING_SALT), key.as_bytes());
        let expand = |label: &[u8]| -> Result<[u8; 32]> {
            let mut okm = [0u8; 32];
            hk.expand(label, &mut okm)
                .map_err(|e| Error::configuration(format!("hkdf expansion failed: {e}")))?;
            Ok(okm)
        };
        Ok(Self {
            field: expand(FIELD_LABEL)?,
            search: expand(SEARCH_LABEL)?,
            backup: expand(BACKUP_LABEL)?,
        })
    }

    pub(crate) fn field_key(&self) -> &[u8; 32] {
        &self.field
    }

    pub(crate) fn search_key(&self) -> &[u8; 32] {
        &self.search
    }

    pub(crate) fn backup_key(&self) -> &[u8; 32] {
        &self.backup
    }
}

#[cfg(test)]
impl KeyRing {
    /// Deterministic ring for unit tests
    pub(crate) fn for_tests(seed: u8) -> std::sync::Arc<Self> {
        let key = DataEncryptionKey::from_bytes([seed; DEFAULT_KEY_LEN]);
        std::sync::Arc::new(Self::derive(&key).unwrap())
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyRing(<redacted>)")
    }
}

/// Derive the data encryption key. Pure: same material, same key.
pub fn derive_key(material: &KeyMaterial) -> Result<DataEncryptionKey> {
    material.params.validate()?;
    let mut out = [0u8; DEFAULT_KEY_LEN];

    match material.params.algorithm {
        KdfAlgorithm::Pbkdf2Sha256 { iterations } => {
            pbkdf2::pbkdf2_hmac::<Sha256>(&material.secret, &material.salt, iterations, &mut out);
        }
        KdfAlgorithm::Argon2id {
            time_cost,
            memory_cost,
            parallelism,
        } => {
            let params = argon2::Params::new(memory_cost, time_cost, parallelism, Some(DEFAULT_KEY_LEN))
                .map_err(|e| Error::configuration(format!("invalid argon2 params: {e}")))?;
            let argon2 = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
            argon2
                .hash_password_into(&material.secret, &material.salt, &mut out)
                .map_err(|e| Error::configuration(format!("failed to derive key: {e}")))?;
        }
    }

    let key = DataEncryptionKey::from_bytes(out);
    out.zeroize();
    Ok(key)
}

/// Loads or creates key material in one directory
pub struct KeyManager {
    key_dir: PathBuf,
}

impl KeyManager {
    pub fn new(key_dir: impl Into<PathBuf>) -> Self {
        Self { key_dir: key_dir.into() }
    }

    pub fn key_dir(&self) -> &Path {
        &self.key_dir
    }

    pub fn secret_path(&self) -> PathBuf {
        self.key_dir.join(SECRET_FILE)
    }

    pub fn salt_path(&self) -> PathBuf {
        self.key_dir.join(SALT_FILE)
    }

    pub fn params_path(&self) -> PathBuf {
        self.key_dir.join(PARAMS_FILE)
    }

    /// Report which files exist, without reading any secret
    pub fn status(&self) -> Result<KeyStatus> {
        let params = if self.params_path().exists() {
            Some(self.read_params()?)
        } else {
            None
        };
        let secret_present = self.secret_path().exists();
        let salt_present = self.salt_path().exists();
        let algorithm = match &params {
            Some(p) => Some(p.algorithm.label().to_string()),
            None if secret_present => Some(KdfParams::default().algorithm.label().to_string()),
            None => None,
        };

        Ok(KeyStatus {
            secret_path: self.secret_path(),
            salt_path: self.salt_path(),
            secret_present,
            salt_present,
            algorithm,
            created_at: params.and_then(|p| p.created_at),
        })
    }

    /// Load the key material, generating it on first use.
    ///
    /// Generation happens under an exclusive lock and with exclusive file
    /// creation, so concurrent first starts agree on one key. If only one of
    /// the two files exists nothing is generated.
    pub fn load_or_create(&self) -> Result<KeyMaterial> {
        self.load_or_create_with(KdfParams::new_now())
    }

    /// Like [`load_or_create`](Self::load_or_create), with the parameters to
    /// record if a new key is generated
    pub fn load_or_create_with(&self, params: KdfParams) -> Result<KeyMaterial> {
        params.validate()?;
        // existing material is read without touching the directory, which may be read-only
        if self.secret_path().exists() && self.salt_path().exists() {
            return self.load();
        }
        fs::create_dir_all(&self.key_dir).map_err(|e| {
            Error::configuration(format!(
                "cannot create key directory {}: {e}",
                self.key_dir.display()
            ))
        })?;

        let lock = File::create(self.key_dir.join(LOCK_FILE))?;
        lock.lock_exclusive()?;
        let result = match (self.secret_path().exists(), self.salt_path().exists()) {
            (true, true) => self.load(),
            (false, false) => self.create(params),
            _ => Err(self.inconsistent_error()),
        };
        // released on drop as well; unlock failures are irrelevant here
        let _ = fs2::FileExt::unlock(&lock);
        result
    }

    /// Load existing key material; never generates
    pub fn load(&self) -> Result<KeyMaterial> {
        let secret_path = self.secret_path();
        let salt_path = self.salt_path();
        match (secret_path.exists(), salt_path.exists()) {
            (true, true) => {}
            (false, false) => {
                return Err(Error::configuration(format!(
                    "no key material in {}; run `fv keys init`",
                    self.key_dir.display()
                )))
            }
            _ => return Err(self.inconsistent_error()),
        }

        warn_if_exposed(&secret_path);
        warn_if_exposed(&salt_path);

        let mut encoded = fs::read_to_string(&secret_path)?;
        let decoded = STANDARD.decode(encoded.trim().as_bytes());
        encoded.zeroize();
        let secret = decoded.map_err(|_| {
            Error::configuration(format!("{} is not valid base64", secret_path.display()))
        })?;
        if secret.len() != SECRET_LEN {
            return Err(Error::configuration(format!(
                "{} must hold {} bytes, found {}",
                secret_path.display(),
                SECRET_LEN,
                secret.len()
            )));
        }

        let salt = fs::read(&salt_path)?;
        if salt.len() != SALT_LEN {
            return Err(Error::configuration(format!(
                "{} must hold {} bytes, found {}",
                salt_path.display(),
                SALT_LEN,
                salt.len()
            )));
        }

        let params = if self.params_path().exists() {
            self.read_params()?
        } else {
            KdfParams::default()
        };
        params.validate()?;

        Ok(KeyMaterial::new(secret, salt, params))
    }

    fn create(&self, params: KdfParams) -> Result<KeyMaterial> {
        let mut secret = vec![0u8; SECRET_LEN];
        let mut salt = vec![0u8; SALT_LEN];
        OsRng.fill_bytes(&mut secret);
        OsRng.fill_bytes(&mut salt);

        let mut encoded = STANDARD.encode(&secret);
        encoded.push('\n');
        let written = write_new_file(&self.secret_path(), encoded.as_bytes());
        encoded.zeroize();
        match written {
            Ok(()) => {}
            // another process won the race without honouring the lock
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return self.load(),
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = write_new_file(&self.salt_path(), &salt) {
            // never leave a lone secret behind
            let _ = fs::remove_file(self.secret_path());
            return Err(e.into());
        }
        fs::write(self.params_path(), serde_json::to_string_pretty(&params)?)?;

        tracing::warn!(
            key_dir = %self.key_dir.display(),
            "generated new master key; back up {} and {} out-of-band, data encrypted with them is unrecoverable without both",
            SECRET_FILE,
            SALT_FILE
        );
        Ok(KeyMaterial::new(secret, salt, params))
    }

    fn read_params(&self) -> Result<KdfParams> {
        let content = fs::read_to_string(self.params_path())?;
        serde_json::from_str(&content).map_err(|e| {
            Error::configuration(format!("invalid {}: {e}", self.params_path().display()))
        })
    }

    fn inconsistent_error(&self) -> Error {
        Error::configuration(format!(
            "key directory {} holds only one of {} and {}; restore the missing file from backup",
            self.key_dir.display(),
            SECRET_FILE,
            SALT_FILE
        ))
    }
}

/// Create `path` exclusively with owner-only permissions and write `bytes`
fn write_new_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(unix)]
fn warn_if_exposed(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = fs::metadata(path) {
        if meta.permissions().mode() & 0o077 != 0 {
            tracing::warn!(path = %path.display(), "key file is readable by other users; chmod 600 it");
        }
    }
}

#[cfg(not(unix))]
fn warn_if_exposed(_path: &Path) {}
