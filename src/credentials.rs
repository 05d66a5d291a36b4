//! Credential loading from the runtime `.env` file.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;

/// Key holding the Graph API access token.
pub const ACCESS_TOKEN_KEY: &str = "SEALPOST_ACCESS_TOKEN";

/// Key holding the optional key-derivation passphrase.
pub const PASSPHRASE_KEY: &str = "SEALPOST_PASSPHRASE";

/// Runtime credentials loaded from the `.env` file.
#[derive(Clone, Default)]
pub struct Credentials {
    vars: BTreeMap<String, String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("keys", &self.vars.keys().collect::<Vec<_>>())
            .field("values", &"[REDACTED]")
            .finish()
    }
}

impl Credentials {
    /// Build credentials from a key-value map.
    pub fn from_map(vars: BTreeMap<String, String>) -> Self {
        Self { vars }
    }

    /// Returns a non-blank credential value for a key, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// Returns a required credential or an error when missing.
    ///
    /// # Errors
    ///
    /// Returns an error when the key is absent or blank.
    pub fn require(&self, key: &str) -> anyhow::Result<String> {
        self.get(key)
            .map(str::to_owned)
            .ok_or_else(|| anyhow::anyhow!("missing required credential: {key}"))
    }

    /// The Graph API access token.
    ///
    /// # Errors
    ///
    /// Returns an error when [`ACCESS_TOKEN_KEY`] is not set.
    pub fn access_token(&self) -> anyhow::Result<String> {
        self.require(ACCESS_TOKEN_KEY)
    }

    /// The key-derivation passphrase, if configured.
    pub fn passphrase(&self) -> Option<&str> {
        self.get(PASSPHRASE_KEY)
    }
}

/// Load credentials from a specific `.env` path.
///
/// # Errors
///
/// Returns an error if the file does not exist, permissions are too broad,
/// or parsing fails.
pub fn load_credentials(path: &Path) -> anyhow::Result<Credentials> {
    if !path.exists() {
        return Err(anyhow::anyhow!(
            "credentials file does not exist: {}",
            path.display()
        ));
    }

    validate_private_permissions(path)?;

    let mut vars = BTreeMap::new();
    let iter = dotenvy::from_path_iter(path)
        .with_context(|| format!("failed to read credentials at {}", path.display()))?;

    for item in iter {
        let (key, value) = item.with_context(|| {
            format!(
                "failed to parse key-value entry in credentials file {}",
                path.display()
            )
        })?;
        vars.insert(key, value);
    }

    Ok(Credentials { vars })
}

/// Load credentials when the file exists, empty credentials otherwise.
///
/// # Errors
///
/// Returns an error if an existing file is invalid.
pub fn load_credentials_if_present(path: &Path) -> anyhow::Result<Credentials> {
    if path.exists() {
        load_credentials(path)
    } else {
        Ok(Credentials::default())
    }
}

/// Set owner-only permissions on a file when supported.
///
/// # Errors
///
/// Returns an error if permissions cannot be updated.
pub fn enforce_private_file_permissions(path: &Path) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

#[cfg(unix)]
fn validate_private_permissions(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::metadata(path)
        .with_context(|| format!("failed to inspect credentials file {}", path.display()))?;
    let mode = metadata.permissions().mode() & 0o777;

    if mode & 0o077 != 0 {
        return Err(anyhow::anyhow!(
            "credentials file {} must be 0600, found {:o}",
            path.display(),
            mode
        ));
    }

    Ok(())
}

#[cfg(not(unix))]
fn validate_private_permissions(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}
