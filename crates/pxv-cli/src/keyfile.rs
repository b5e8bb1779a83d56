//! File-backed key manager: one base64 key per file.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use pxv_crypto::{KeyManager, MediaKey, KEY_SIZE};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum KeyFileError {
    #[error("reading key file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("key file {0} is not valid base64")]
    Encoding(PathBuf),

    #[error("key file {path} holds {len} bytes, expected {}", KEY_SIZE)]
    Length { path: PathBuf, len: usize },

    #[error("key file {0} already exists")]
    Exists(PathBuf),

    #[error("writing key file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Serves the single key read from a key file. The key is its own current key.
pub struct FileKeyManager {
    key: MediaKey,
}

impl FileKeyManager {
    /// Read a key file. The key id is `name`, or the file stem when unset.
    pub fn load(path: &Path, name: Option<&str>) -> Result<Self, KeyFileError> {
        let encoded = std::fs::read_to_string(path)
            .map(SecretString::from)
            .map_err(|source| KeyFileError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let bytes = Zeroizing::new(
            STANDARD
                .decode(encoded.expose_secret().trim())
                .map_err(|_| KeyFileError::Encoding(path.to_path_buf()))?,
        );

        let id = name
            .map(str::to_string)
            .or_else(|| {
                path.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "default".to_string());
        let key = MediaKey::from_slice(id, &bytes).map_err(|_| KeyFileError::Length {
            path: path.to_path_buf(),
            len: bytes.len(),
        })?;
        tracing::debug!(key = %key.id(), path = %path.display(), "key loaded");
        Ok(Self { key })
    }

    pub fn key_id(&self) -> &str {
        self.key.id()
    }
}

impl KeyManager for FileKeyManager {
    fn current_key(&self) -> Option<MediaKey> {
        Some(self.key.clone())
    }

    fn key(&self, id: &str) -> Option<MediaKey> {
        (self.key.id() == id).then(|| self.key.clone())
    }
}

/// Write fresh key material to `path`, refusing to overwrite.
pub fn generate_key_file(path: &Path) -> Result<(), KeyFileError> {
    use std::io::Write;

    let key = MediaKey::generate("new");
    let encoded = Zeroizing::new(STANDARD.encode(key.as_bytes()));

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| KeyFileError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::AlreadyExists {
            KeyFileError::Exists(path.to_path_buf())
        } else {
            KeyFileError::Write {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    writeln!(file, "{}", encoded.as_str()).map_err(|source| KeyFileError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}
