//! Environment configuration.
//!
//! All knobs come from the environment with defaults chosen for a Linux
//! system install. The daemon also owns the transport host key file on
//! behalf of the SSH front end: [`ensure_host_key`] loads it, generating a
//! fresh ed25519 key with restrictive permissions if the file is missing.

use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 23234;
const DEFAULT_HOST_KEY_PATH: &str = "/etc/nixherd/ssh/id_ed25519";
const DEFAULT_DB_DIR: &str = "/var/lib/nixherd";
const DEFAULT_DB_NAME: &str = "nixherd.db";

/// Runtime configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address for the control-plane transport.
    pub host: String,

    /// Listen port.
    pub port: u16,

    /// Path to the ed25519 host key presented by the transport.
    pub host_key_path: PathBuf,

    /// Directory holding the registry database.
    pub db_dir: PathBuf,

    /// Database file name inside `db_dir`.
    pub db_name: String,
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `PORT` was set but is not a valid port number.
    #[error("invalid PORT value '{value}'")]
    InvalidPort {
        /// The offending value.
        value: String,
        /// Parse failure.
        #[source]
        source: std::num::ParseIntError,
    },

    /// Host key directory or file could not be created or read.
    #[error("host key error at {}", .path.display())]
    HostKeyIo {
        /// The path involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The host key file exists but does not hold a valid key.
    #[error("invalid host key material in {}", .path.display())]
    InvalidHostKey {
        /// The offending file.
        path: PathBuf,
    },
}

impl Config {
    /// Build a configuration from the environment, falling back to install
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port_raw = env_or("PORT", &DEFAULT_PORT.to_string());
        let port = port_raw.parse().map_err(|source| ConfigError::InvalidPort {
            value: port_raw,
            source,
        })?;

        Ok(Self {
            host: env_or("HOST", DEFAULT_HOST),
            port,
            host_key_path: PathBuf::from(env_or("HOST_KEY_PATH", DEFAULT_HOST_KEY_PATH)),
            db_dir: PathBuf::from(env_or("DB_DIR", DEFAULT_DB_DIR)),
            db_name: env_or("DB_NAME", DEFAULT_DB_NAME),
        })
    }

    /// Full path of the registry database file.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.db_dir.join(&self.db_name)
    }

    /// `host:port` the transport binds to.
    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => {
            tracing::debug!(key, %value, "using environment value");
            value
        }
        _ => {
            tracing::debug!(key, value = default, "using default value");
            default.to_string()
        }
    }
}

/// Load the transport host key, generating one if the file does not exist.
///
/// New keys are written with mode 0600 into a directory created with mode
/// 0700. The stored form is the 32-byte ed25519 seed.
pub fn ensure_host_key(path: &Path) -> Result<SigningKey, ConfigError> {
    let io_err = |source| ConfigError::HostKeyIo {
        path: path.to_path_buf(),
        source,
    };

    if path.exists() {
        let bytes = std::fs::read(path).map_err(io_err)?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ConfigError::InvalidHostKey {
                path: path.to_path_buf(),
            })?;
        return Ok(SigningKey::from_bytes(&seed));
    }

    if let Some(dir) = path.parent() {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .map_err(io_err)?;
    }

    let key = SigningKey::generate(&mut OsRng);
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true).mode(0o600);
    let mut file = options.open(path).map_err(io_err)?;
    std::io::Write::write_all(&mut file, key.as_bytes()).map_err(io_err)?;

    tracing::info!(path = %path.display(), "generated new host key");
    Ok(key)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn db_path_joins_dir_and_name() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 2222,
            host_key_path: PathBuf::from("/tmp/key"),
            db_dir: PathBuf::from("/var/lib/nixherd"),
            db_name: "nixherd.db".to_string(),
        };
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/nixherd/nixherd.db"));
        assert_eq!(config.listen_addr(), "127.0.0.1:2222");
    }

    #[test]
    fn ensure_host_key_generates_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh").join("id_ed25519");

        let generated = ensure_host_key(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        let reloaded = ensure_host_key(&path).unwrap();
        assert_eq!(generated.to_bytes(), reloaded.to_bytes());
    }

    #[test]
    fn ensure_host_key_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_ed25519");
        std::fs::write(&path, b"short").unwrap();

        let err = ensure_host_key(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidHostKey { .. }));
    }
}
