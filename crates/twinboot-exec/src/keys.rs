//! SSH key management and resolution

use std::env;
use std::path::{Path, PathBuf};

use tracing::debug;

/// SSH key resolution strategy
#[derive(Debug, Clone)]
pub enum KeySource {
    /// Explicit path to key file (`~` is expanded)
    Path(PathBuf),
    /// PEM/OpenSSH key text stored alongside the host configuration
    Inline(String),
    /// Base64-encoded key from environment
    Env(String),
}

impl KeySource {
    /// Resolve key source to a loadable key
    ///
    /// # Errors
    /// Returns `KeyError` if key resolution fails (env not set, invalid base64, etc.)
    pub fn resolve(&self) -> Result<ResolvedKey, KeyError> {
        match self {
            KeySource::Path(path) => {
                let path = expand_home(path);
                if !path.exists() {
                    return Err(KeyError::NotFound(path.display().to_string()));
                }
                validate_key_permissions(&path)?;
                Ok(ResolvedKey::Path(path))
            }
            KeySource::Inline(text) => Ok(ResolvedKey::Inline(text.clone())),
            KeySource::Env(var_name) => {
                let base64_key =
                    env::var(var_name).map_err(|_| KeyError::EnvNotSet(var_name.clone()))?;
                let key_data = base64_decode(&base64_key).map_err(|_| KeyError::InvalidBase64)?;
                let text = String::from_utf8(key_data).map_err(|_| KeyError::InvalidBase64)?;

                debug!(var = %var_name, "decoded SSH key from environment");
                Ok(ResolvedKey::Inline(text))
            }
        }
    }
}

/// Resolved key location
#[derive(Debug, Clone)]
pub enum ResolvedKey {
    /// Path to key file
    Path(PathBuf),
    /// Key material held in memory
    Inline(String),
}

impl ResolvedKey {
    /// Get path for SSH library
    #[must_use]
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            ResolvedKey::Path(p) => Some(p),
            ResolvedKey::Inline(_) => None,
        }
    }

    /// Get in-memory key text
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match self {
            ResolvedKey::Inline(text) => Some(text),
            ResolvedKey::Path(_) => None,
        }
    }
}

/// Key resolution errors
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("environment variable {0} not set")]
    EnvNotSet(String),

    #[error("invalid base64 encoding")]
    InvalidBase64,

    #[error("key file permissions too open: {0} (should be 600)")]
    BadPermissions(String),

    #[error("key file not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn base64_decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(input.trim())
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~")
        && let Some(home) = env::var_os("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    path.to_path_buf()
}

fn validate_key_permissions(path: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path).map_err(KeyError::Io)?;
    let mode = metadata.permissions().mode();

    // group and other bits must be clear
    if mode & 0o77 != 0 {
        return Err(KeyError::BadPermissions(path.display().to_string()));
    }

    Ok(())
}
