//! Key vault: one symmetric key per credential label.
//!
//! Keys are either derived from a passphrase (PBKDF2-HMAC-SHA256, 100 000
//! rounds, 16-byte random salt) or generated at random when no passphrase is
//! configured. Both artifacts live under the vault directory:
//!
//! - `{label}.key`: base64url text of the 32-byte key
//! - `{label}.salt`: raw 16-byte salt (only for derived keys)
//!
//! Once written, the key file is authoritative. A passphrase supplied later is
//! only checked against it when the matching salt file also exists.
//!
//! Artifacts are published by hard-linking a fully written temp file into
//! place, so a reader never sees a partial file and the first writer wins
//! when several processes start against an empty vault.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Symmetric key length in bytes.
pub const KEY_LEN: usize = 32;

/// Salt length in bytes.
pub const SALT_LEN: usize = 16;

/// PBKDF2 iteration count.
pub const PBKDF2_ROUNDS: u32 = 100_000;

/// Label used when the deployment runs with a single process-wide key.
pub const DEFAULT_LABEL: &str = "default";

/// Attempts at publishing or re-reading an artifact before giving up.
const PUBLISH_ATTEMPTS: u32 = 5;

/// Pause between attempts when another writer holds an empty artifact.
const PUBLISH_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Errors from key derivation and key storage.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// The passphrase does not re-derive the persisted key.
    #[error("passphrase does not match the stored key for '{label}'")]
    KeyMismatch {
        /// Credential label whose key was checked.
        label: String,
    },

    /// Key material could not be read, written, or parsed.
    #[error("key storage error at {}: {source}", path.display())]
    Storage {
        /// Artifact path.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
}

/// A 256-bit symmetric key. Zeroed on drop; never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CryptoKey([u8; KEY_LEN]);

impl PartialEq for CryptoKey {
    fn eq(&self, other: &Self) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl Eq for CryptoKey {}

impl std::fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CryptoKey")
            .field(&format_args!("{}", self.fingerprint()))
            .finish()
    }
}

impl CryptoKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random key from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derive a key from a passphrase and salt.
    ///
    /// Deterministic: the same passphrase and salt always yield the same key.
    pub fn derive(passphrase: &str, salt: &[u8; SALT_LEN]) -> Self {
        let mut bytes = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ROUNDS, &mut bytes);
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Short hex identifier (first 8 bytes of SHA-256 over the key).
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..8])
    }

    /// Encode as base64url text for persistence.
    pub fn to_text(&self) -> String {
        URL_SAFE.encode(self.0)
    }

    /// Parse base64url key text.
    ///
    /// # Errors
    ///
    /// Returns an [`io::ErrorKind::InvalidData`] error when the text is not
    /// base64url or does not decode to exactly [`KEY_LEN`] bytes.
    pub fn from_text(text: &str) -> io::Result<Self> {
        let mut decoded = URL_SAFE
            .decode(text.trim())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let result = <[u8; KEY_LEN]>::try_from(decoded.as_slice())
            .map(Self)
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("expected {KEY_LEN} key bytes, found {}", decoded.len()),
                )
            });
        decoded.zeroize();
        result
    }
}

/// File-backed key store.
#[derive(Debug, Clone)]
pub struct KeyVault {
    dir: PathBuf,
}

impl KeyVault {
    /// Create a vault rooted at `dir`. The directory is created on first use.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the key artifact for `label`.
    pub fn key_path(&self, label: &str) -> PathBuf {
        self.dir.join(format!("{}.key", sanitize_label(label)))
    }

    /// Path of the salt artifact for `label`.
    pub fn salt_path(&self, label: &str) -> PathBuf {
        self.dir.join(format!("{}.salt", sanitize_label(label)))
    }

    /// Load the key for `label`, deriving or generating it when absent.
    ///
    /// - Key file present: returned verbatim. When a passphrase is supplied
    ///   and a salt file exists, the passphrase must re-derive the same key.
    /// - Key file absent, passphrase supplied: derive over the existing salt
    ///   (or a fresh one), persist key and salt.
    /// - Key file absent, no passphrase: generate a random key and persist it.
    ///
    /// Blank passphrases are treated as absent.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::KeyMismatch`] when the passphrase disagrees with
    /// the stored key, or [`VaultError::Storage`] on any I/O or parse failure.
    pub fn derive_or_load(
        &self,
        label: &str,
        passphrase: Option<&str>,
    ) -> Result<CryptoKey, VaultError> {
        let passphrase = passphrase.filter(|p| !p.trim().is_empty());
        let key_path = self.key_path(label);
        let salt_path = self.salt_path(label);

        for _ in 0..PUBLISH_ATTEMPTS {
            if let Some(stored) = read_key(&key_path)? {
                if let Some(passphrase) = passphrase {
                    if let Some(salt) = read_salt(&salt_path)? {
                        if CryptoKey::derive(passphrase, &salt) != stored {
                            return Err(VaultError::KeyMismatch {
                                label: label.to_owned(),
                            });
                        }
                        debug!(label, "passphrase verified against stored key");
                    }
                }

                debug!(label, fingerprint = %stored.fingerprint(), "loaded stored key");
                return Ok(stored);
            }

            fs::create_dir_all(&self.dir).map_err(|source| storage(&self.dir, source))?;

            let key = match passphrase {
                Some(passphrase) => CryptoKey::derive(passphrase, &establish_salt(&salt_path)?),
                None => CryptoKey::generate(),
            };

            if publish_private(&key_path, key.to_text().as_bytes())? {
                info!(
                    label,
                    derived = passphrase.is_some(),
                    fingerprint = %key.fingerprint(),
                    "created new key"
                );
                return Ok(key);
            }

            // Another process published first, or left an empty file behind.
            debug!(label, "key file appeared concurrently, reloading");
            std::thread::sleep(PUBLISH_RETRY_DELAY);
        }

        Err(unsettled(&key_path))
    }
}

/// Restrict a label to filename-safe characters.
fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '@') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_owned();
    if cleaned.is_empty() {
        DEFAULT_LABEL.to_owned()
    } else {
        cleaned
    }
}

fn storage(path: &Path, source: io::Error) -> VaultError {
    VaultError::Storage {
        path: path.to_owned(),
        source,
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, VaultError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(storage(path, e)),
    }
}

/// Stored key, or `None` when the file is missing or not yet written.
fn read_key(path: &Path) -> Result<Option<CryptoKey>, VaultError> {
    let bytes = match read_optional(path)? {
        Some(bytes) if !bytes.is_empty() => bytes,
        _ => return Ok(None),
    };
    CryptoKey::from_text(&String::from_utf8_lossy(&bytes))
        .map(Some)
        .map_err(|source| storage(path, source))
}

/// Stored salt, or `None` when the file is missing or not yet written.
fn read_salt(path: &Path) -> Result<Option<[u8; SALT_LEN]>, VaultError> {
    let bytes = match read_optional(path)? {
        Some(bytes) if !bytes.is_empty() => bytes,
        _ => return Ok(None),
    };
    <[u8; SALT_LEN]>::try_from(bytes.as_slice())
        .map(Some)
        .map_err(|_| {
            storage(
                path,
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("expected {SALT_LEN} salt bytes, found {}", bytes.len()),
                ),
            )
        })
}

/// Return the salt at `path`, creating it when absent. When several
/// processes race, every one of them ends up with the first salt published.
fn establish_salt(path: &Path) -> Result<[u8; SALT_LEN], VaultError> {
    for _ in 0..PUBLISH_ATTEMPTS {
        if let Some(existing) = read_salt(path)? {
            return Ok(existing);
        }

        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        if publish_private(path, &salt)? {
            return Ok(salt);
        }
        std::thread::sleep(PUBLISH_RETRY_DELAY);
    }
    Err(unsettled(path))
}

fn unsettled(path: &Path) -> VaultError {
    storage(
        path,
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("artifact stayed empty after {PUBLISH_ATTEMPTS} attempts"),
        ),
    )
}

/// Publish `bytes` at `path` unless a file is already there.
///
/// The content goes to a private temp file first and is then hard-linked into
/// place, which fails atomically if `path` exists. Returns `false` when
/// another writer got there first.
fn publish_private(path: &Path, bytes: &[u8]) -> Result<bool, VaultError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", Uuid::new_v4().simple()));
    let tmp = PathBuf::from(tmp);

    write_private(&tmp, bytes)?;
    let linked = fs::hard_link(&tmp, path);
    if let Err(e) = fs::remove_file(&tmp) {
        warn!(path = %tmp.display(), error = %e, "failed to remove temp key file");
    }

    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(storage(path, e)),
    }
}

/// Write a new file readable only by the owner.
fn write_private(path: &Path, bytes: &[u8]) -> Result<(), VaultError> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).map_err(|e| storage(path, e))?;
    file.write_all(bytes).map_err(|e| storage(path, e))?;
    file.sync_all().map_err(|e| storage(path, e))?;
    Ok(())
}
