//! Credential loading from the runtime `.env` file and the process environment.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use tracing::debug;

use crate::config::runtime_paths;

/// Runtime credentials (provider API keys).
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

    /// Returns a non-empty credential value for a key, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    /// Returns a required credential or an error when missing.
    ///
    /// # Errors
    ///
    /// Returns an error when the key is absent or empty.
    pub fn require(&self, key: &str) -> anyhow::Result<String> {
        self.get(key)
            .map(str::to_owned)
            .ok_or_else(|| anyhow::anyhow!("missing required credential: {key}"))
    }

    /// Fill keys absent from the file with values from the process environment.
    pub fn with_env_fallback(mut self, keys: &[&str]) -> Self {
        for key in keys {
            if self.get(key).is_none() {
                if let Ok(value) = std::env::var(key) {
                    debug!(key, "credential taken from process environment");
                    self.vars.insert((*key).to_owned(), value);
                }
            }
        }
        self
    }
}

/// Load credentials from a specific `.env` path.
///
/// The file must be private to the owner (mode `0600` on Unix).
///
/// # Errors
///
/// Returns an error if the file is unreadable, permissions are too broad,
/// or an entry fails to parse.
pub fn load_credentials(path: &Path) -> anyhow::Result<Credentials> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("credentials file {} is not readable", path.display()))?;
    ensure_private(path, &metadata)?;

    let vars = dotenvy::from_path_iter(path)
        .with_context(|| format!("failed to read credentials at {}", path.display()))?
        .collect::<Result<BTreeMap<_, _>, _>>()
        .with_context(|| format!("malformed entry in credentials file {}", path.display()))?;

    debug!(path = %path.display(), keys = vars.len(), "credentials loaded");
    Ok(Credentials { vars })
}

/// Load credentials from `~/.campaigner/.env`, falling back to the process
/// environment for `keys` when the file is absent or lacks them.
///
/// # Errors
///
/// Returns an error when the credentials file exists but is invalid.
pub fn load_default_credentials(keys: &[&str]) -> anyhow::Result<Credentials> {
    let paths = runtime_paths()?;
    let credentials = if paths.env_file.exists() {
        load_credentials(&paths.env_file)?
    } else {
        Credentials::default()
    };
    Ok(credentials.with_env_fallback(keys))
}

#[cfg(unix)]
fn ensure_private(path: &Path, metadata: &fs::Metadata) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        anyhow::bail!(
            "credentials file {} must be 0600, found {mode:o}",
            path.display()
        );
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_private(_path: &Path, _metadata: &fs::Metadata) -> anyhow::Result<()> {
    Ok(())
}
