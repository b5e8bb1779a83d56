use std::io;
use std::path::Path;

use pxv_crypto::CipherError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage location unavailable: {0}")]
    LocationUnavailable(String),

    #[error("failed to write encrypted media: {0}")]
    WriteFailed(String),

    #[error("not enough free space to store media")]
    StorageExhausted,

    #[error("media not found: {0}")]
    NotFound(String),

    #[error("encryption key '{0}' is not available")]
    KeyUnavailable(String),

    #[error("invalid media identifier '{0}'")]
    InvalidMediaId(String),

    #[error("media has not been downloaded from the cloud: {0}")]
    CloudFileNotDownloaded(String),

    #[error("downloading media from the cloud failed: {0}")]
    CloudDownloadFailed(String),

    #[error("timed out after {waited_secs}s waiting for media to download")]
    CloudDownloadTimeout { waited_secs: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Errors after which no further save can succeed until something external changes.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            StorageError::StorageExhausted
                | StorageError::LocationUnavailable(_)
                | StorageError::KeyUnavailable(_)
        )
    }

    /// Materialization failures clear up by retrying the read.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::CloudFileNotDownloaded(_)
                | StorageError::CloudDownloadFailed(_)
                | StorageError::CloudDownloadTimeout { .. }
        )
    }

    /// The stored bytes themselves failed verification: wrong key, corruption
    /// or truncation. Reading again will not help.
    pub fn is_damaged(&self) -> bool {
        matches!(self, StorageError::Cipher(e) if e.is_integrity_failure())
    }

    pub(crate) fn from_write(e: io::Error, path: &Path) -> Self {
        if e.kind() == io::ErrorKind::StorageFull {
            StorageError::StorageExhausted
        } else {
            StorageError::WriteFailed(format!("{}: {e}", path.display()))
        }
    }

    pub(crate) fn from_cipher_write(e: CipherError) -> Self {
        match e {
            CipherError::Io(err) if err.kind() == io::ErrorKind::StorageFull => {
                StorageError::StorageExhausted
            }
            CipherError::Io(err) => StorageError::WriteFailed(err.to_string()),
            other => StorageError::Cipher(other),
        }
    }

    /// Index persistence errors arrive wrapped in anyhow context.
    pub(crate) fn from_index(e: anyhow::Error) -> Self {
        match e.downcast_ref::<io::Error>() {
            Some(err) if err.kind() == io::ErrorKind::StorageFull => StorageError::StorageExhausted,
            _ => StorageError::WriteFailed(format!("{e:#}")),
        }
    }
}
